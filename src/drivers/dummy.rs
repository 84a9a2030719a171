//! A device that discards everything it is given.
//!
//! Useful as a smoke test for the device layer and the interrupt plumbing:
//! every transmit raises the device IRQ, whose handler does nothing.

use std::sync::Arc;

use log::debug;

use crate::device::{DeviceFlags, DeviceKind, NetDevice, NetDriver};
use crate::ether::MacAddr;
use crate::interrupts::{IrqFlags, IrqHandler, IRQ_BASE};
use crate::io::Result;
use crate::stack::Netstack;

const DUMMY_MTU: usize = u16::MAX as usize;
const DUMMY_IRQ: u32 = IRQ_BASE;

struct DummyDriver {
	irq: u32,
}

impl NetDriver for DummyDriver {
	fn transmit(
		&self,
		stack: &Netstack,
		dev: &NetDevice,
		ethertype: u16,
		data: &[u8],
		_dst: MacAddr,
	) -> Result<()> {
		debug!(
			"dev={}, type={ethertype:#06x}, len={}",
			dev.name(),
			data.len()
		);
		stack.intr.raise(self.irq);
		Ok(())
	}

	fn handle_interrupt(&self, _stack: &Netstack, dev: &Arc<NetDevice>) {
		debug!("irq={}, dev={}", self.irq, dev.name());
	}
}

/// Create and register a dummy device.
pub fn init(stack: &Arc<Netstack>) -> Result<Arc<NetDevice>> {
	let driver = Box::new(DummyDriver { irq: DUMMY_IRQ });
	let dev = stack.register_device(NetDevice::new(
		DeviceKind::Dummy,
		DUMMY_MTU,
		DeviceFlags::empty(),
		MacAddr::ANY,
		MacAddr::ANY,
		driver,
	));
	stack.request_irq(DUMMY_IRQ, Arc::clone(&dev) as Arc<dyn IrqHandler>, IrqFlags::SHARED, dev.name())?;
	debug!("initialized, dev={}", dev.name());
	Ok(dev)
}
