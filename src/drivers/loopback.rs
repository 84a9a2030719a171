//! The loopback device: transmitted packets come back in through a bounded
//! in-memory queue drained by the device's interrupt handler.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, warn};

use crate::config::LOOPBACK_QUEUE_LIMIT;
use crate::device::{DeviceFlags, DeviceKind, NetDevice, NetDriver};
use crate::ether::MacAddr;
use crate::interrupts::{IrqFlags, IrqHandler, IRQ_BASE};
use crate::io::{Error, Result};
use crate::stack::Netstack;
use crate::synch::Mutex;

const LOOPBACK_MTU: usize = u16::MAX as usize;
const LOOPBACK_IRQ: u32 = IRQ_BASE + 1;

struct QueueEntry {
	ethertype: u16,
	data: Vec<u8>,
}

struct LoopbackDriver {
	irq: u32,
	queue: Mutex<VecDeque<QueueEntry>>,
}

impl NetDriver for LoopbackDriver {
	fn transmit(
		&self,
		stack: &Netstack,
		dev: &NetDevice,
		ethertype: u16,
		data: &[u8],
		_dst: MacAddr,
	) -> Result<()> {
		let mut queue = self.queue.lock();
		if queue.len() >= LOOPBACK_QUEUE_LIMIT {
			warn!("queue is full, dev={}", dev.name());
			return Err(Error::QueueFull);
		}
		queue.push_back(QueueEntry {
			ethertype,
			data: data.to_vec(),
		});
		debug!(
			"queue pushed (num:{}), dev={}, type={ethertype:#06x}, len={}",
			queue.len(),
			dev.name(),
			data.len()
		);
		drop(queue);
		stack.intr.raise(self.irq);
		Ok(())
	}

	fn handle_interrupt(&self, stack: &Netstack, dev: &Arc<NetDevice>) {
		loop {
			let entry = self.queue.lock().pop_front();
			let Some(entry) = entry else {
				break;
			};
			debug!(
				"queue popped, dev={}, type={:#06x}, len={}",
				dev.name(),
				entry.ethertype,
				entry.data.len()
			);
			stack.net_input(entry.ethertype, &entry.data, dev);
		}
	}
}

/// Create and register a loopback device.
pub fn init(stack: &Arc<Netstack>) -> Result<Arc<NetDevice>> {
	let driver = Box::new(LoopbackDriver {
		irq: LOOPBACK_IRQ,
		queue: Mutex::new(VecDeque::new()),
	});
	let dev = stack.register_device(NetDevice::new(
		DeviceKind::Loopback,
		LOOPBACK_MTU,
		DeviceFlags::LOOPBACK,
		MacAddr::ANY,
		MacAddr::ANY,
		driver,
	));
	stack.request_irq(
		LOOPBACK_IRQ,
		Arc::clone(&dev) as Arc<dyn IrqHandler>,
		IrqFlags::SHARED,
		dev.name(),
	)?;
	debug!("initialized, dev={}", dev.name());
	Ok(dev)
}
