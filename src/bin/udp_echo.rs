//! UDP echo server over a host tap device.
//!
//! Binds `0.0.0.0:7` and echoes every datagram back to its sender. See
//! `tcp_echo` for the environment variables; Ctrl-C unwinds blocked calls
//! through the stack's event channel.

#[cfg(target_os = "linux")]
fn main() -> tapstack::Result<()> {
	linux::main()
}

#[cfg(not(target_os = "linux"))]
fn main() {
	eprintln!("udp_echo requires a Linux tap device");
}

#[cfg(target_os = "linux")]
mod linux {
	use std::env;
	use std::sync::atomic::{AtomicBool, Ordering};
	use std::sync::Arc;
	use std::{mem, ptr, thread};

	use tapstack::drivers::{loopback, tap};
	use tapstack::{parse_endpoint, IpInterface, Netstack, Result};

	fn var_or(name: &str, default: &str) -> String {
		env::var(name).unwrap_or_else(|_| default.to_string())
	}

	fn watch_sigint(stack: &Arc<Netstack>, terminate: &Arc<AtomicBool>) {
		let stack = Arc::clone(stack);
		let terminate = Arc::clone(terminate);
		let mut mask: libc::sigset_t = unsafe { mem::zeroed() };
		unsafe {
			libc::sigemptyset(&mut mask);
			libc::sigaddset(&mut mask, libc::SIGINT);
			libc::pthread_sigmask(libc::SIG_BLOCK, &mask, ptr::null_mut());
		}
		thread::spawn(move || {
			let mut sig: libc::c_int = 0;
			if unsafe { libc::sigwait(&mask, &mut sig) } == 0 {
				terminate.store(true, Ordering::Release);
				stack.raise_event();
			}
		});
	}

	fn setup(stack: &Arc<Netstack>, terminate: &Arc<AtomicBool>) -> Result<()> {
		watch_sigint(stack, terminate);

		let dev = loopback::init(stack)?;
		let iface = IpInterface::new("127.0.0.1".parse()?, "255.0.0.0".parse()?);
		stack.ip_iface_register(&dev, iface)?;

		let hwaddr = match env::var("TAPSTACK_HWADDR") {
			Ok(addr) => Some(addr.parse()?),
			Err(_) => None,
		};
		let dev = tap::init(stack, &var_or("TAPSTACK_TAP", "tap0"), hwaddr)?;
		let iface = IpInterface::new(
			var_or("TAPSTACK_IP", "192.0.2.2").parse()?,
			var_or("TAPSTACK_NETMASK", "255.255.255.0").parse()?,
		);
		let iface = stack.ip_iface_register(&dev, iface)?;
		stack.ip_route_set_default_gateway(
			&iface,
			var_or("TAPSTACK_GATEWAY", "192.0.2.1").parse()?,
		)?;

		stack.run()
	}

	pub(super) fn main() -> Result<()> {
		let stack = Netstack::new()?;
		let terminate = Arc::new(AtomicBool::new(false));
		setup(&stack, &terminate)?;

		let sock = stack.udp_open()?;
		stack.udp_bind(sock, parse_endpoint("0.0.0.0:7")?)?;
		let mut buf = [0u8; 2048];
		while !terminate.load(Ordering::Acquire) {
			let (n, foreign) = match stack.udp_recvfrom(sock, &mut buf) {
				Ok(received) => received,
				Err(_) => break,
			};
			if stack.udp_sendto(sock, &buf[..n], foreign).is_err() {
				break;
			}
		}
		let _ = stack.udp_close(sock);
		stack.shutdown();
		Ok(())
	}
}
