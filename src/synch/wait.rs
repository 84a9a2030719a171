use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, MutexGuard, PoisonError};
use std::time::Duration;

use crate::io::{Error, Result};

/// Condition-variable-like scheduler context with cancellation.
///
/// A `WaitCtx` belongs to one protocol control block and is always used
/// together with that protocol's table mutex: [`WaitCtx::sleep`] atomically
/// releases the table guard, parks the thread and reacquires the guard
/// before returning.
///
/// Cancellation is level-triggered: [`WaitCtx::interrupt`] marks the context
/// and wakes all sleepers, each of which observes the mark and returns
/// [`Error::Interrupted`]; the last sleeper out clears the mark.
pub(crate) struct WaitCtx {
	cond: Condvar,
	interrupted: AtomicBool,
	sleepers: AtomicUsize,
}

impl WaitCtx {
	pub(crate) fn new() -> Self {
		Self {
			cond: Condvar::new(),
			interrupted: AtomicBool::new(false),
			sleepers: AtomicUsize::new(0),
		}
	}

	/// Release `guard`, wait for a wakeup (or `timeout`), reacquire.
	///
	/// Returns the reacquired guard plus `Err(Interrupted)` when the wait
	/// was cancelled. The caller must re-check its predicate either way.
	pub(crate) fn sleep<'a, T>(
		&self,
		guard: MutexGuard<'a, T>,
		timeout: Option<Duration>,
	) -> (MutexGuard<'a, T>, Result<()>) {
		if self.interrupted.load(Ordering::Acquire) {
			return (guard, Err(Error::Interrupted));
		}
		self.sleepers.fetch_add(1, Ordering::AcqRel);
		let guard = match timeout {
			Some(timeout) => self
				.cond
				.wait_timeout(guard, timeout)
				.map(|(guard, _)| guard)
				.unwrap_or_else(|e| PoisonError::into_inner(e).0),
			None => self
				.cond
				.wait(guard)
				.unwrap_or_else(PoisonError::into_inner),
		};
		if self.sleepers.fetch_sub(1, Ordering::AcqRel) == 1 && self.take_interrupt() {
			return (guard, Err(Error::Interrupted));
		}
		if self.interrupted.load(Ordering::Acquire) {
			return (guard, Err(Error::Interrupted));
		}
		(guard, Ok(()))
	}

	/// Wake all sleepers without cancelling them.
	pub(crate) fn wakeup(&self) {
		self.cond.notify_all();
	}

	/// Mark the context interrupted and wake all sleepers.
	pub(crate) fn interrupt(&self) {
		self.interrupted.store(true, Ordering::Release);
		self.cond.notify_all();
	}

	/// Tear the context down.
	///
	/// Fails with [`Error::Busy`] while sleepers remain; the caller is
	/// expected to wake them and retry once they have drained.
	pub(crate) fn destroy(&self) -> Result<()> {
		if self.sleepers.load(Ordering::Acquire) != 0 {
			return Err(Error::Busy);
		}
		Ok(())
	}

	fn take_interrupt(&self) -> bool {
		self.interrupted.swap(false, Ordering::AcqRel)
	}
}
