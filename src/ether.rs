//! Ethernet framing: hardware addresses, egress frame construction and the
//! ingress filter.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::debug;

use crate::device::{DeviceFlags, DeviceKind, NetDevice};
use crate::io::{Error, Result};
use crate::stack::Netstack;

pub const ETHER_ADDR_LEN: usize = 6;
pub const ETHER_HDR_SIZE: usize = 14;
/// Minimum payload before padding; frames below 60 bytes (before FCS) are
/// padded up by the transmitter.
pub const ETHER_PAYLOAD_SIZE_MIN: usize = 46;
pub const ETHER_PAYLOAD_SIZE_MAX: usize = 1500;
pub const ETHER_FRAME_SIZE_MIN: usize = ETHER_HDR_SIZE + ETHER_PAYLOAD_SIZE_MIN;
pub const ETHER_FRAME_SIZE_MAX: usize = ETHER_HDR_SIZE + ETHER_PAYLOAD_SIZE_MAX;

pub const ETHER_TYPE_IP: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;

/// A 48-bit IEEE 802 hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddr(pub [u8; ETHER_ADDR_LEN]);

impl MacAddr {
	pub const ANY: MacAddr = MacAddr([0x00; ETHER_ADDR_LEN]);
	pub const BROADCAST: MacAddr = MacAddr([0xff; ETHER_ADDR_LEN]);

	pub fn is_broadcast(&self) -> bool {
		*self == Self::BROADCAST
	}

	pub fn as_bytes(&self) -> &[u8; ETHER_ADDR_LEN] {
		&self.0
	}
}

impl fmt::Display for MacAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let a = &self.0;
		write!(
			f,
			"{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
			a[0], a[1], a[2], a[3], a[4], a[5]
		)
	}
}

impl FromStr for MacAddr {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let mut addr = [0u8; ETHER_ADDR_LEN];
		let mut parts = s.split(':');
		for byte in addr.iter_mut() {
			let part = parts.next().ok_or(Error::InvalidInput)?;
			if part.len() != 2 {
				return Err(Error::InvalidInput);
			}
			*byte = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidInput)?;
		}
		if parts.next().is_some() {
			return Err(Error::InvalidInput);
		}
		Ok(MacAddr(addr))
	}
}

/// Shared defaults for ethernet devices: kind, MTU and the
/// broadcast-capable, ARP-resolved flag set.
pub(crate) fn ethernet_device(hwaddr: MacAddr, driver: Box<dyn crate::device::NetDriver>) -> NetDevice {
	NetDevice::new(
		DeviceKind::Ethernet,
		ETHER_PAYLOAD_SIZE_MAX,
		DeviceFlags::BROADCAST | DeviceFlags::NEEDS_ARP,
		hwaddr,
		MacAddr::BROADCAST,
		driver,
	)
}

/// Build the frame `[dst | src | ethertype | payload | pad]` and hand it to
/// the driver's `write` callback. The payload is padded to the 46-byte
/// minimum.
pub fn transmit_frame(
	dev: &NetDevice,
	ethertype: u16,
	payload: &[u8],
	dst: MacAddr,
	write: impl FnOnce(&[u8]) -> Result<usize>,
) -> Result<()> {
	let body = payload.len().max(ETHER_PAYLOAD_SIZE_MIN);
	let mut frame = Vec::with_capacity(ETHER_HDR_SIZE + body);
	frame.extend_from_slice(dst.as_bytes());
	frame.extend_from_slice(dev.hwaddr().as_bytes());
	frame.extend_from_slice(&ethertype.to_be_bytes());
	frame.extend_from_slice(payload);
	frame.resize(ETHER_HDR_SIZE + body, 0);
	debug!(
		"dev={}, type={:#06x}, len={}",
		dev.name(),
		ethertype,
		frame.len()
	);
	let written = write(&frame)?;
	if written != frame.len() {
		return Err(Error::Io(std::io::Error::new(
			std::io::ErrorKind::WriteZero,
			"short frame write",
		)));
	}
	Ok(())
}

/// Accept one raw frame from the link.
///
/// Frames shorter than a header and frames addressed to neither the device's
/// unicast nor the all-ones broadcast address are dropped silently; anything
/// else is dispatched to the protocol registry by ethertype.
pub fn input_frame(stack: &Netstack, dev: &Arc<NetDevice>, frame: &[u8]) {
	if frame.len() < ETHER_HDR_SIZE {
		debug!("frame too short, dev={}, len={}", dev.name(), frame.len());
		return;
	}
	let dst = MacAddr(frame[0..6].try_into().unwrap_or([0; 6]));
	if dst != dev.hwaddr() && !dst.is_broadcast() {
		// Addressed to another host.
		return;
	}
	let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
	debug!(
		"dev={}, type={:#06x}, len={}",
		dev.name(),
		ethertype,
		frame.len()
	);
	stack.net_input(ethertype, &frame[ETHER_HDR_SIZE..], dev);
}
