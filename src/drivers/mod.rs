//! Link drivers: loopback, dummy and the Linux tap device.

pub mod dummy;
pub mod loopback;
#[cfg(target_os = "linux")]
pub mod tap;
