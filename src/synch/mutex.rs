use std::sync::{self, MutexGuard, PoisonError};

/// A mutual exclusion primitive.
///
/// Thin wrapper around [`std::sync::Mutex`] that treats lock poisoning as
/// transparent: a panic on another thread must not wedge the dispatch thread
/// or every subsequent socket call, so the guard is recovered and handed out
/// as usual.
pub(crate) struct Mutex<T: ?Sized> {
	inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
	pub(crate) const fn new(data: T) -> Self {
		Self {
			inner: sync::Mutex::new(data),
		}
	}
}

impl<T: ?Sized> Mutex<T> {
	pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
		self.inner.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

impl<T: Default> Default for Mutex<T> {
	fn default() -> Self {
		Self::new(T::default())
	}
}
