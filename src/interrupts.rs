//! Interrupt core: numeric IRQ lines and the dispatch thread.
//!
//! Everything event-driven in the stack funnels through one thread. Drivers
//! and protocol layers post numeric identifiers with [`IntrController::raise`];
//! the dispatch thread wakes up, pops pending identifiers and runs the
//! matching handlers. Four identifiers are reserved: shutdown, softirq
//! (deferred protocol input), event (global cancellation) and the periodic
//! timer tick. Device lines start at [`IRQ_BASE`].
//!
//! Handlers run on the dispatch thread and must never block on
//! application-layer waits.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, warn};

use crate::config::TIMER_TICK;
use crate::io::{Error, Result};
use crate::stack::Netstack;
use crate::synch::Mutex;

/// Terminates the dispatch thread.
pub(crate) const IRQ_SHUTDOWN: u32 = 0;
/// Drains the per-protocol ingress queues.
pub(crate) const IRQ_SOFTIRQ: u32 = 1;
/// Invokes the event subscribers (global cancellation).
pub(crate) const IRQ_EVENT: u32 = 2;
/// Periodic timer tick, fired every millisecond.
pub(crate) const IRQ_TIMER: u32 = 3;
/// First identifier available to device drivers.
pub(crate) const IRQ_BASE: u32 = 16;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub(crate) struct IrqFlags: u32 {
		/// The line may be shared by several handlers.
		const SHARED = 0b0000_0001;
	}
}

/// A handler attached to an IRQ line, invoked on the dispatch thread.
pub(crate) trait IrqHandler: Send + Sync {
	fn handle_irq(&self, stack: &Netstack, irq: u32);
}

struct IrqEntry {
	irq: u32,
	name: String,
	flags: IrqFlags,
	handler: Arc<dyn IrqHandler>,
}

pub(crate) struct IntrController {
	pending: Mutex<BTreeSet<u32>>,
	wakeup: Condvar,
	handlers: Mutex<Vec<IrqEntry>>,
	thread: Mutex<Option<JoinHandle<()>>>,
}

impl IntrController {
	pub(crate) fn new() -> Self {
		Self {
			pending: Mutex::new(BTreeSet::new()),
			wakeup: Condvar::new(),
			handlers: Mutex::new(Vec::new()),
			thread: Mutex::new(None),
		}
	}

	/// Attach `handler` to `irq`.
	///
	/// A line can carry several handlers only if every registration declares
	/// [`IrqFlags::SHARED`]. Handlers registered later run first.
	pub(crate) fn request_irq(
		&self,
		irq: u32,
		handler: Arc<dyn IrqHandler>,
		flags: IrqFlags,
		name: &str,
	) -> Result<()> {
		let mut handlers = self.handlers.lock();
		for entry in handlers.iter() {
			if entry.irq == irq
				&& (!entry.flags.contains(IrqFlags::SHARED) || !flags.contains(IrqFlags::SHARED))
			{
				warn!("irq {irq} conflicts with already registered line {}", entry.name);
				return Err(Error::AlreadyExists);
			}
		}
		handlers.insert(
			0,
			IrqEntry {
				irq,
				name: name.to_string(),
				flags,
				handler,
			},
		);
		debug!("irq registered, irq={irq}, name={name}");
		Ok(())
	}

	/// Mark `irq` pending and kick the dispatch thread.
	///
	/// Identifiers coalesce like pending signals: raising a line that is
	/// already pending is a no-op.
	pub(crate) fn raise(&self, irq: u32) {
		self.pending.lock().insert(irq);
		self.wakeup.notify_one();
	}

	/// Start the dispatch thread.
	pub(crate) fn run(&self, stack: Arc<Netstack>) -> Result<()> {
		let mut thread = self.thread.lock();
		if thread.is_some() {
			return Err(Error::Busy);
		}
		let handle = thread::Builder::new()
			.name("tapstack-intr".to_string())
			.spawn(move || dispatch_loop(&stack))
			.map_err(Error::Io)?;
		*thread = Some(handle);
		Ok(())
	}

	/// Post the termination identifier and join the dispatch thread.
	pub(crate) fn shutdown(&self) {
		let handle = self.thread.lock().take();
		if let Some(handle) = handle {
			self.raise(IRQ_SHUTDOWN);
			let _ = handle.join();
		}
	}

	fn handlers_for(&self, irq: u32) -> Vec<Arc<dyn IrqHandler>> {
		self.handlers
			.lock()
			.iter()
			.filter(|entry| entry.irq == irq)
			.map(|entry| Arc::clone(&entry.handler))
			.collect()
	}
}

fn dispatch_loop(stack: &Netstack) {
	let intr = &stack.intr;
	let mut next_tick = Instant::now() + TIMER_TICK;

	debug!("dispatch thread running");
	loop {
		let irq = {
			let mut pending = intr.pending.lock();
			loop {
				if let Some(&irq) = pending.iter().next() {
					pending.remove(&irq);
					break irq;
				}
				let now = Instant::now();
				if now >= next_tick {
					next_tick = now + TIMER_TICK;
					break IRQ_TIMER;
				}
				pending = intr
					.wakeup
					.wait_timeout(pending, next_tick - now)
					.map(|(guard, _)| guard)
					.unwrap_or_else(|e| PoisonError::into_inner(e).0);
			}
		};
		match irq {
			IRQ_SHUTDOWN => break,
			IRQ_SOFTIRQ => stack.softirq(),
			IRQ_EVENT => stack.dispatch_event(),
			IRQ_TIMER => stack.run_timers(),
			irq => {
				for handler in intr.handlers_for(irq) {
					handler.handle_irq(stack, irq);
				}
			}
		}
	}
	debug!("dispatch thread terminated");
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Arc;

	use super::*;

	struct Counter(AtomicUsize);

	impl IrqHandler for Counter {
		fn handle_irq(&self, _stack: &Netstack, _irq: u32) {
			self.0.fetch_add(1, Ordering::SeqCst);
		}
	}

	#[test]
	fn shared_flag_is_required_for_both() {
		let intr = IntrController::new();
		let a = Arc::new(Counter(AtomicUsize::new(0)));
		let b = Arc::new(Counter(AtomicUsize::new(0)));
		intr.request_irq(IRQ_BASE, a, IrqFlags::SHARED, "a").unwrap();
		assert!(matches!(
			intr.request_irq(IRQ_BASE, b.clone(), IrqFlags::empty(), "b"),
			Err(Error::AlreadyExists)
		));
		assert!(intr.request_irq(IRQ_BASE, b, IrqFlags::SHARED, "b").is_ok());
	}

	#[test]
	fn raise_coalesces() {
		let intr = IntrController::new();
		intr.raise(IRQ_BASE);
		intr.raise(IRQ_BASE);
		assert_eq!(intr.pending.lock().len(), 1);
	}
}
