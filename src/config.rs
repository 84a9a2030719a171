//! Compile-time configuration of the stack.

use std::time::Duration;

/// Period of the dispatch thread's timer tick.
pub(crate) const TIMER_TICK: Duration = Duration::from_millis(1);

/// Number of entries in the ARP resolver cache.
pub(crate) const ARP_CACHE_SIZE: usize = 32;

/// Resolved ARP entries older than this are evicted by the cache timer.
pub(crate) const ARP_CACHE_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval of the ARP cache aging timer.
pub(crate) const ARP_TIMER_INTERVAL: Duration = Duration::from_secs(1);

/// Size of the UDP protocol control block table.
pub(crate) const UDP_PCB_COUNT: usize = 16;

/// Size of the TCP protocol control block table.
pub(crate) const TCP_PCB_COUNT: usize = 16;

/// Per-connection TCP receive buffer size.
pub(crate) const TCP_BUFFER_SIZE: usize = 65535;

/// Ephemeral port range used when a local port is assigned dynamically.
pub(crate) const SOURCE_PORT_MIN: u16 = 49152;
pub(crate) const SOURCE_PORT_MAX: u16 = 65535;

/// Upper bound on queued datagrams in the loopback device.
pub(crate) const LOOPBACK_QUEUE_LIMIT: usize = 16;
