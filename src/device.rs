//! Network device layer: the device object, driver trait and registry.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};

use crate::ether::MacAddr;
use crate::io::{Error, Result};
use crate::ip::IpInterface;
use crate::stack::Netstack;
use crate::synch::Mutex;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct DeviceFlags: u16 {
		const UP = 0x0001;
		const LOOPBACK = 0x0010;
		const BROADCAST = 0x0020;
		const P2P = 0x0040;
		const NEEDS_ARP = 0x0100;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
	Dummy,
	Loopback,
	Ethernet,
}

/// Interface attachment, discriminated by address family.
///
/// A device carries at most one interface per family.
pub(crate) enum NetInterface {
	Ipv4(Arc<IpInterface>),
}

impl NetInterface {
	fn family(&self) -> u8 {
		match self {
			NetInterface::Ipv4(_) => Family::IPV4,
		}
	}
}

pub(crate) struct Family;

impl Family {
	pub(crate) const IPV4: u8 = 1;
}

/// Operations a link driver implements for its device.
///
/// `transmit` is mandatory; `open`/`close` default to no-ops and
/// `handle_interrupt` runs on the dispatch thread when the device's IRQ line
/// fires.
pub trait NetDriver: Send + Sync {
	fn open(&self, _stack: &Arc<Netstack>, _dev: &Arc<NetDevice>) -> Result<()> {
		Ok(())
	}

	fn close(&self, _dev: &NetDevice) -> Result<()> {
		Ok(())
	}

	/// Hand one upper-layer packet to the link. For ethernet devices `dst`
	/// is the resolved next-hop hardware address.
	fn transmit(
		&self,
		stack: &Netstack,
		dev: &NetDevice,
		ethertype: u16,
		data: &[u8],
		dst: MacAddr,
	) -> Result<()>;

	fn handle_interrupt(&self, _stack: &Netstack, _dev: &Arc<NetDevice>) {}
}

/// A registered network device.
///
/// Created by a driver, registered into the stack context (which assigns the
/// `net<N>` name and index) and never destroyed afterwards.
pub struct NetDevice {
	index: OnceLock<usize>,
	name: OnceLock<String>,
	kind: DeviceKind,
	mtu: usize,
	flags: AtomicU16,
	hwaddr: Mutex<MacAddr>,
	broadcast: MacAddr,
	driver: Box<dyn NetDriver>,
	ifaces: Mutex<Vec<NetInterface>>,
}

impl NetDevice {
	pub fn new(
		kind: DeviceKind,
		mtu: usize,
		flags: DeviceFlags,
		hwaddr: MacAddr,
		broadcast: MacAddr,
		driver: Box<dyn NetDriver>,
	) -> Self {
		Self {
			index: OnceLock::new(),
			name: OnceLock::new(),
			kind,
			mtu,
			flags: AtomicU16::new(flags.bits()),
			hwaddr: Mutex::new(hwaddr),
			broadcast,
			driver,
			ifaces: Mutex::new(Vec::new()),
		}
	}

	pub fn index(&self) -> usize {
		*self.index.get().unwrap_or(&usize::MAX)
	}

	pub fn name(&self) -> &str {
		self.name.get().map(String::as_str).unwrap_or("net?")
	}

	pub fn kind(&self) -> DeviceKind {
		self.kind
	}

	pub fn mtu(&self) -> usize {
		self.mtu
	}

	pub fn flags(&self) -> DeviceFlags {
		DeviceFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
	}

	pub fn is_up(&self) -> bool {
		self.flags().contains(DeviceFlags::UP)
	}

	pub fn hwaddr(&self) -> MacAddr {
		*self.hwaddr.lock()
	}

	/// Late hardware address assignment, used by drivers that learn the
	/// address at open time (the tap driver).
	pub fn set_hwaddr(&self, addr: MacAddr) {
		*self.hwaddr.lock() = addr;
	}

	pub fn broadcast_hwaddr(&self) -> MacAddr {
		self.broadcast
	}

	pub(crate) fn set_identity(&self, index: usize) {
		let _ = self.index.set(index);
		let _ = self.name.set(format!("net{index}"));
	}

	fn set_flags(&self, flags: DeviceFlags) {
		self.flags.store(flags.bits(), Ordering::Release);
	}

	pub(crate) fn open(&self, stack: &Arc<Netstack>, this: &Arc<NetDevice>) -> Result<()> {
		if self.is_up() {
			warn!("already opened, dev={}", self.name());
			return Err(Error::Busy);
		}
		self.driver.open(stack, this)?;
		self.set_flags(self.flags() | DeviceFlags::UP);
		info!("dev={}, state=up", self.name());
		Ok(())
	}

	pub(crate) fn close(&self) -> Result<()> {
		if !self.is_up() {
			warn!("not opened, dev={}", self.name());
			return Err(Error::Down);
		}
		self.driver.close(self)?;
		self.set_flags(self.flags() - DeviceFlags::UP);
		info!("dev={}, state=down", self.name());
		Ok(())
	}

	/// Hand `data` to the driver for transmission.
	pub(crate) fn output(
		&self,
		stack: &Netstack,
		ethertype: u16,
		data: &[u8],
		dst: MacAddr,
	) -> Result<()> {
		if !self.is_up() {
			warn!("not opened, dev={}", self.name());
			return Err(Error::Down);
		}
		if data.len() > self.mtu {
			warn!(
				"too long, dev={}, mtu={}, len={}",
				self.name(),
				self.mtu,
				data.len()
			);
			return Err(Error::MessageTooLong);
		}
		debug!(
			"dev={}, type={:#06x}, len={}",
			self.name(),
			ethertype,
			data.len()
		);
		self.driver.transmit(stack, self, ethertype, data, dst)
	}

	pub(crate) fn handle_interrupt(&self, stack: &Netstack, this: &Arc<NetDevice>) {
		self.driver.handle_interrupt(stack, this);
	}

	pub(crate) fn add_iface(&self, iface: NetInterface) -> Result<()> {
		let mut ifaces = self.ifaces.lock();
		if ifaces.iter().any(|entry| entry.family() == iface.family()) {
			warn!(
				"interface already exists, dev={}, family={}",
				self.name(),
				iface.family()
			);
			return Err(Error::AlreadyExists);
		}
		ifaces.push(iface);
		Ok(())
	}

	/// The unique interface of the given family, if attached.
	pub(crate) fn get_ip_iface(&self) -> Option<Arc<IpInterface>> {
		self.ifaces.lock().iter().find_map(|entry| match entry {
			NetInterface::Ipv4(iface) => Some(Arc::clone(iface)),
		})
	}
}

impl crate::interrupts::IrqHandler for NetDevice {
	fn handle_irq(&self, stack: &Netstack, _irq: u32) {
		// `self` is also registered in the device list, so the Arc identity
		// matters only for drivers that need to re-enter the device.
		if let Some(this) = stack.device_by_index(self.index()) {
			self.handle_interrupt(stack, &this);
		}
	}
}
