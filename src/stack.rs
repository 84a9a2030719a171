//! The stack context: device registry, protocol registry, deferred ingress
//! queues, timers and lifecycle.
//!
//! All process-wide state lives in one [`Netstack`] value so that independent
//! stacks can coexist (the test suite builds one per test). Ingress is
//! two-stage: drivers push raw packets into a per-protocol queue and raise
//! the softirq line; the dispatch thread later drains every queue and runs
//! the protocol handlers. This keeps driver interrupt handlers bounded and
//! serializes all upper-layer input processing on the dispatch thread.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::arp::Arp;
use crate::device::{NetDevice, NetInterface};
use crate::interrupts::{IntrController, IrqFlags, IrqHandler, IRQ_EVENT, IRQ_SOFTIRQ};
use crate::io::Result;
use crate::ip::{Ipv4Engine, IpInterface};
use crate::synch::Mutex;
use crate::tcp::TcpEngine;
use crate::udp::UdpEngine;
use crate::{arp, icmp, ip, logging, tcp, udp};

pub(crate) type NetProtocolHandler = fn(&Netstack, &[u8], &Arc<NetDevice>);
pub(crate) type TimerHandler = fn(&Netstack);
pub(crate) type EventHandler = fn(&Netstack);

struct QueueEntry {
	dev: Arc<NetDevice>,
	data: Vec<u8>,
}

pub(crate) struct NetProtocol {
	ethertype: u16,
	handler: NetProtocolHandler,
	queue: Mutex<VecDeque<QueueEntry>>,
}

struct NetTimer {
	interval: Duration,
	last: Mutex<Instant>,
	handler: TimerHandler,
}

/// One independent instance of the protocol stack.
pub struct Netstack {
	// Handed to the dispatch thread and to drivers that spawn helpers.
	self_ref: OnceLock<Weak<Netstack>>,
	pub(crate) intr: IntrController,
	devices: Mutex<Vec<Arc<NetDevice>>>,
	protocols: Mutex<Vec<Arc<NetProtocol>>>,
	timers: Mutex<Vec<Arc<NetTimer>>>,
	subscribers: Mutex<Vec<EventHandler>>,
	pub(crate) arp: Arp,
	pub(crate) ip: Ipv4Engine,
	pub(crate) udp: UdpEngine,
	pub(crate) tcp: TcpEngine,
}

impl Netstack {
	/// Build a stack context and wire up every protocol and timer.
	///
	/// Must be called before any device or PCB operation.
	pub fn new() -> Result<Arc<Self>> {
		logging::init();
		let stack = Arc::new(Self {
			self_ref: OnceLock::new(),
			intr: IntrController::new(),
			devices: Mutex::new(Vec::new()),
			protocols: Mutex::new(Vec::new()),
			timers: Mutex::new(Vec::new()),
			subscribers: Mutex::new(Vec::new()),
			arp: Arp::new(),
			ip: Ipv4Engine::new(),
			udp: UdpEngine::new(),
			tcp: TcpEngine::new(),
		});
		let _ = stack.self_ref.set(Arc::downgrade(&stack));
		arp::init(&stack)?;
		ip::init(&stack)?;
		icmp::init(&stack)?;
		udp::init(&stack)?;
		tcp::init(&stack)?;
		info!("initialized");
		Ok(stack)
	}

	/// Register `dev`, assigning its index and `net<N>` name.
	pub fn register_device(&self, dev: NetDevice) -> Arc<NetDevice> {
		let mut devices = self.devices.lock();
		let index = devices.len();
		dev.set_identity(index);
		let dev = Arc::new(dev);
		devices.insert(0, Arc::clone(&dev));
		info!(
			"registered, dev={}, kind={:?}",
			dev.name(),
			dev.kind()
		);
		dev
	}

	pub(crate) fn device_by_index(&self, index: usize) -> Option<Arc<NetDevice>> {
		self.devices
			.lock()
			.iter()
			.find(|dev| dev.index() == index)
			.map(Arc::clone)
	}

	/// Attach an IPv4 interface to `dev` and install its on-link route.
	pub fn ip_iface_register(&self, dev: &Arc<NetDevice>, iface: IpInterface) -> Result<Arc<IpInterface>> {
		let iface = Arc::new(iface);
		iface.bind_device(dev);
		dev.add_iface(NetInterface::Ipv4(Arc::clone(&iface)))?;
		self.ip.register_iface(&iface)?;
		info!(
			"registered: dev={}, unicast={}, netmask={}, broadcast={}",
			dev.name(),
			iface.unicast(),
			iface.netmask(),
			iface.broadcast()
		);
		Ok(iface)
	}

	/// Install a default route through `gateway` on `iface`'s device.
	pub fn ip_route_set_default_gateway(
		&self,
		iface: &Arc<IpInterface>,
		gateway: std::net::Ipv4Addr,
	) -> Result<()> {
		self.ip.set_default_gateway(iface, gateway)
	}

	/// Register a protocol handler for an ethertype.
	pub(crate) fn register_protocol(
		&self,
		ethertype: u16,
		handler: NetProtocolHandler,
	) -> Result<()> {
		let mut protocols = self.protocols.lock();
		if protocols.iter().any(|proto| proto.ethertype == ethertype) {
			return Err(crate::io::Error::AlreadyExists);
		}
		protocols.insert(
			0,
			Arc::new(NetProtocol {
				ethertype,
				handler,
				queue: Mutex::new(VecDeque::new()),
			}),
		);
		info!("protocol registered, type={ethertype:#06x}");
		Ok(())
	}

	/// Register a periodic timer.
	pub(crate) fn register_timer(&self, interval: Duration, handler: TimerHandler) {
		self.timers.lock().push(Arc::new(NetTimer {
			interval,
			last: Mutex::new(Instant::now()),
			handler,
		}));
		info!("timer registered: interval={interval:?}");
	}

	/// Subscribe to the global event channel.
	pub(crate) fn subscribe_event(&self, handler: EventHandler) {
		self.subscribers.lock().push(handler);
	}

	/// Install a static ARP translation that the cache never ages out.
	pub fn arp_add_static(&self, pa: std::net::Ipv4Addr, ha: crate::ether::MacAddr) {
		self.arp.insert_static(pa, ha);
	}

	/// Raise the global event line, cancelling every blocked socket call.
	///
	/// Typically bound to SIGINT by applications so blocked threads unwind
	/// before shutdown.
	pub fn raise_event(&self) {
		self.intr.raise(IRQ_EVENT);
	}

	/// Queue one packet for deferred protocol processing.
	///
	/// Called by drivers (directly or through the ethernet ingress filter).
	/// Unknown ethertypes are dropped.
	pub(crate) fn net_input(&self, ethertype: u16, data: &[u8], dev: &Arc<NetDevice>) {
		let proto = self
			.protocols
			.lock()
			.iter()
			.find(|proto| proto.ethertype == ethertype)
			.map(Arc::clone);
		let Some(proto) = proto else {
			// No handler for this ethertype.
			return;
		};
		let mut queue = proto.queue.lock();
		queue.push_back(QueueEntry {
			dev: Arc::clone(dev),
			data: data.to_vec(),
		});
		debug!(
			"queue pushed (num:{}), dev={}, type={:#06x}, len={}",
			queue.len(),
			dev.name(),
			ethertype,
			data.len()
		);
		drop(queue);
		self.intr.raise(IRQ_SOFTIRQ);
	}

	/// Drain every protocol's ingress queue in registration order.
	pub(crate) fn softirq(&self) {
		let protocols: Vec<_> = self.protocols.lock().iter().map(Arc::clone).collect();
		for proto in protocols {
			loop {
				let entry = proto.queue.lock().pop_front();
				let Some(entry) = entry else {
					break;
				};
				debug!(
					"queue popped, dev={}, type={:#06x}, len={}",
					entry.dev.name(),
					proto.ethertype,
					entry.data.len()
				);
				(proto.handler)(self, &entry.data, &entry.dev);
			}
		}
	}

	/// Fire every timer whose interval has elapsed.
	pub(crate) fn run_timers(&self) {
		let timers: Vec<_> = self.timers.lock().iter().map(Arc::clone).collect();
		for timer in timers {
			let fire = {
				let mut last = timer.last.lock();
				let now = Instant::now();
				if now.duration_since(*last) > timer.interval {
					*last = now;
					true
				} else {
					false
				}
			};
			if fire {
				(timer.handler)(self);
			}
		}
	}

	/// Run the event subscribers on the dispatch thread.
	pub(crate) fn dispatch_event(&self) {
		let subscribers: Vec<_> = self.subscribers.lock().clone();
		for handler in subscribers {
			handler(self);
		}
	}

	fn arc(&self) -> Result<Arc<Netstack>> {
		self.self_ref
			.get()
			.and_then(Weak::upgrade)
			.ok_or(crate::io::Error::NotFound)
	}

	/// Open all registered devices and start the dispatch thread.
	pub fn run(&self) -> Result<()> {
		let this = self.arc()?;
		self.intr.run(Arc::clone(&this))?;
		debug!("open all devices...");
		let devices: Vec<_> = self.devices.lock().iter().map(Arc::clone).collect();
		for dev in &devices {
			dev.open(&this, dev)?;
		}
		debug!("running...");
		Ok(())
	}

	/// Close all devices and join the dispatch thread.
	pub fn shutdown(&self) {
		debug!("close all devices...");
		let devices: Vec<_> = self.devices.lock().iter().map(Arc::clone).collect();
		for dev in &devices {
			let _ = dev.close();
		}
		self.intr.shutdown();
		debug!("shutting down");
	}

	pub(crate) fn request_irq(
		&self,
		irq: u32,
		handler: Arc<dyn IrqHandler>,
		flags: IrqFlags,
		name: &str,
	) -> Result<()> {
		self.intr.request_irq(irq, handler, flags, name)
	}
}
