//! Error type shared by all layers of the stack.

use std::net::AddrParseError;
use std::{io, result};

use thiserror::Error;

/// Stack-wide error classification.
///
/// Ingress validation failures (bad checksums, malformed headers) are never
/// surfaced through this type — those packets are logged and dropped. What
/// remains are the errors an application or a driver can actually act on.
#[derive(Debug, Error)]
pub enum Error {
	/// A blocking call was cancelled through the event channel.
	#[error("interrupted")]
	Interrupted,
	/// Output needs an address resolution that has not completed yet.
	/// The packet was dropped for this call; the caller may retry.
	#[error("resolution in progress")]
	InProgress,
	#[error("no route to host")]
	NoRoute,
	#[error("address already in use")]
	AddrInUse,
	#[error("address not available")]
	AddrNotAvail,
	#[error("message too long")]
	MessageTooLong,
	/// A fixed-size table (PCBs, ARP cache) has no free slot.
	#[error("resource exhausted")]
	Exhausted,
	#[error("transmit queue full")]
	QueueFull,
	#[error("device or resource busy")]
	Busy,
	#[error("device is down")]
	Down,
	#[error("invalid argument")]
	InvalidInput,
	#[error("no such socket or device")]
	NotFound,
	#[error("already exists")]
	AlreadyExists,
	#[error("not connected")]
	NotConnected,
	#[error("operation not supported")]
	NotSupported,
	#[error("I/O error: {0}")]
	Io(#[from] io::Error),
}

impl From<AddrParseError> for Error {
	fn from(_: AddrParseError) -> Self {
		Error::InvalidInput
	}
}

pub type Result<T> = result::Result<T, Error>;
