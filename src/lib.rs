//! A userspace TCP/IPv4 protocol stack.
//!
//! The stack runs as an ordinary process: one dedicated dispatch thread owns
//! all interrupt-, timer- and softirq-driven work, while application threads
//! use a blocking, socket-like API on top of the UDP and TCP engines. Frames
//! enter and leave the stack through pluggable link drivers — an in-memory
//! loopback device, a discarding dummy device and a Linux tap device are
//! provided under [`drivers`].
//!
//! ```no_run
//! use tapstack::drivers::loopback;
//! use tapstack::{IpInterface, Netstack};
//!
//! fn main() -> tapstack::Result<()> {
//! 	let stack = Netstack::new()?;
//! 	let dev = loopback::init(&stack)?;
//! 	let iface = IpInterface::new("127.0.0.1".parse()?, "255.0.0.0".parse()?);
//! 	stack.ip_iface_register(&dev, iface)?;
//! 	stack.run()?;
//!
//! 	let sock = stack.udp_open()?;
//! 	stack.udp_bind(sock, "127.0.0.1:7".parse()?)?;
//! 	// ...
//! 	stack.udp_close(sock)?;
//! 	stack.shutdown();
//! 	Ok(())
//! }
//! ```

mod arp;
mod config;
mod device;
mod ether;
mod icmp;
mod interrupts;
mod io;
mod ip;
mod logging;
mod stack;
mod synch;
mod tcp;
mod udp;
mod util;

pub mod drivers;

pub use crate::device::{DeviceFlags, DeviceKind, NetDevice, NetDriver};
pub use crate::ether::{input_frame, transmit_frame, MacAddr, ETHER_TYPE_ARP, ETHER_TYPE_IP};
pub use crate::io::{Error, Result};
pub use crate::ip::{parse_endpoint, IpInterface};
pub use crate::stack::Netstack;
