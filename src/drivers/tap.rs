//! Linux tap device driver.
//!
//! Attaches to a host tap interface through `/dev/net/tun`; reads return raw
//! ethernet frames, writes accept them. A per-device notifier thread watches
//! the descriptor for readability and raises the device IRQ; the interrupt
//! handler then drains the descriptor with non-blocking reads. A small
//! handshake keeps the notifier from re-raising the line until the handler
//! has caught up.

use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use std::{mem, thread};

use libc::c_int;
use log::{debug, info, warn};

use crate::device::{NetDevice, NetDriver};
use crate::ether::{self, MacAddr, ETHER_FRAME_SIZE_MAX};
use crate::interrupts::{IrqFlags, IrqHandler, IRQ_BASE};
use crate::io::{Error, Result};
use crate::stack::Netstack;
use crate::synch::Mutex;

const CLONE_DEVICE: &str = "/dev/net/tun\0";
const TAP_IRQ: u32 = IRQ_BASE + 2;

/// How long the notifier waits per poll so it can observe shutdown.
const POLL_INTERVAL_MS: c_int = 100;

struct TapState {
	fd: c_int,
	notifier: Option<JoinHandle<()>>,
	stop: Arc<AtomicBool>,
}

/// Readability handshake between the notifier thread and the interrupt
/// handler: armed when the notifier raises the IRQ, released once the
/// handler has drained the descriptor.
struct Gate {
	pending: std::sync::Mutex<bool>,
	drained: Condvar,
}

impl Gate {
	fn new() -> Self {
		Self {
			pending: std::sync::Mutex::new(false),
			drained: Condvar::new(),
		}
	}

	fn arm(&self) {
		*self.pending.lock().unwrap_or_else(PoisonError::into_inner) = true;
	}

	fn release(&self) {
		*self.pending.lock().unwrap_or_else(PoisonError::into_inner) = false;
		self.drained.notify_all();
	}

	fn wait_drained(&self, timeout: Duration) {
		let guard = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
		let _ = self
			.drained
			.wait_timeout_while(guard, timeout, |pending| *pending);
	}
}

struct TapDriver {
	name: String,
	irq: u32,
	state: Mutex<TapState>,
	gate: Arc<Gate>,
}

fn last_os_error() -> Error {
	Error::Io(io::Error::last_os_error())
}

/// Fetch the tap interface's MAC address through a throwaway socket
/// (`SIOCGIFHWADDR` only works on a socket descriptor).
fn fetch_hwaddr(name: &str) -> Result<MacAddr> {
	let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
	if sock < 0 {
		return Err(last_os_error());
	}
	let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
	for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
		*dst = *src as libc::c_char;
	}
	let ret = unsafe { libc::ioctl(sock, libc::SIOCGIFHWADDR, &mut ifr) };
	if ret < 0 {
		let err = last_os_error();
		unsafe { libc::close(sock) };
		return Err(err);
	}
	let sa_data = unsafe { ifr.ifr_ifru.ifru_hwaddr.sa_data };
	unsafe { libc::close(sock) };
	let mut addr = [0u8; 6];
	for (dst, src) in addr.iter_mut().zip(sa_data.iter()) {
		*dst = *src as u8;
	}
	Ok(MacAddr(addr))
}

fn notifier_loop(stack: &Netstack, fd: c_int, irq: u32, gate: &Gate, stop: &AtomicBool) {
	while !stop.load(Ordering::Acquire) {
		let mut pfd = libc::pollfd {
			fd,
			events: libc::POLLIN,
			revents: 0,
		};
		let ret = unsafe { libc::poll(&mut pfd, 1, POLL_INTERVAL_MS) };
		if ret < 0 {
			if io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
				continue;
			}
			warn!("poll failed: {}", io::Error::last_os_error());
			break;
		}
		if ret == 0 {
			continue;
		}
		if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
			break;
		}
		if pfd.revents & libc::POLLIN != 0 {
			gate.arm();
			stack.intr.raise(irq);
			// Let the interrupt handler drain before polling again.
			gate.wait_drained(Duration::from_millis(POLL_INTERVAL_MS as u64));
		}
	}
	debug!("notifier terminated");
}

impl NetDriver for TapDriver {
	fn open(&self, stack: &Arc<Netstack>, dev: &Arc<NetDevice>) -> Result<()> {
		let fd = unsafe {
			libc::open(CLONE_DEVICE.as_ptr() as *const libc::c_char, libc::O_RDWR)
		};
		if fd < 0 {
			warn!("open /dev/net/tun failed, dev={}", dev.name());
			return Err(last_os_error());
		}

		let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
		for (dst, src) in ifr.ifr_name.iter_mut().zip(self.name.as_bytes()) {
			*dst = *src as libc::c_char;
		}
		ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
		if unsafe { libc::ioctl(fd, libc::TUNSETIFF, &mut ifr) } < 0 {
			let err = last_os_error();
			warn!("ioctl [TUNSETIFF] failed, dev={}", dev.name());
			unsafe { libc::close(fd) };
			return Err(err);
		}

		// The interrupt handler drains with non-blocking reads.
		let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
		if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
			let err = last_os_error();
			unsafe { libc::close(fd) };
			return Err(err);
		}

		if dev.hwaddr() == MacAddr::ANY {
			let addr = match fetch_hwaddr(&self.name) {
				Ok(addr) => addr,
				Err(err) => {
					warn!("hardware address fetch failed, dev={}", dev.name());
					unsafe { libc::close(fd) };
					return Err(err);
				}
			};
			dev.set_hwaddr(addr);
		}

		let stop = Arc::new(AtomicBool::new(false));
		let notifier = {
			let stack = Arc::clone(stack);
			let gate = Arc::clone(&self.gate);
			let stop = Arc::clone(&stop);
			let irq = self.irq;
			thread::Builder::new()
				.name(format!("tapstack-{}", self.name))
				.spawn(move || notifier_loop(&stack, fd, irq, &gate, &stop))
				.map_err(Error::Io)?
		};

		let mut state = self.state.lock();
		state.fd = fd;
		state.notifier = Some(notifier);
		state.stop = stop;
		info!("opened, dev={}, tap={}, hwaddr={}", dev.name(), self.name, dev.hwaddr());
		Ok(())
	}

	fn close(&self, dev: &NetDevice) -> Result<()> {
		let (fd, notifier) = {
			let mut state = self.state.lock();
			state.stop.store(true, Ordering::Release);
			(mem::replace(&mut state.fd, -1), state.notifier.take())
		};
		if let Some(notifier) = notifier {
			let _ = notifier.join();
		}
		if fd >= 0 {
			unsafe { libc::close(fd) };
		}
		debug!("closed, dev={}", dev.name());
		Ok(())
	}

	fn transmit(
		&self,
		_stack: &Netstack,
		dev: &NetDevice,
		ethertype: u16,
		data: &[u8],
		dst: MacAddr,
	) -> Result<()> {
		let fd = self.state.lock().fd;
		if fd < 0 {
			return Err(Error::Down);
		}
		ether::transmit_frame(dev, ethertype, data, dst, |frame| {
			let n = unsafe { libc::write(fd, frame.as_ptr() as *const c_void, frame.len()) };
			if n < 0 {
				return Err(last_os_error());
			}
			Ok(n as usize)
		})
	}

	fn handle_interrupt(&self, stack: &Netstack, dev: &Arc<NetDevice>) {
		let fd = self.state.lock().fd;
		if fd < 0 {
			return;
		}
		let mut frame = [0u8; ETHER_FRAME_SIZE_MAX];
		loop {
			let n = unsafe { libc::read(fd, frame.as_mut_ptr() as *mut c_void, frame.len()) };
			if n < 0 {
				match io::Error::last_os_error().raw_os_error() {
					Some(libc::EINTR) => continue,
					Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => break,
					_ => {
						warn!("read failed, dev={}: {}", dev.name(), io::Error::last_os_error());
						break;
					}
				}
			}
			if n == 0 {
				break;
			}
			ether::input_frame(stack, dev, &frame[..n as usize]);
		}
		self.gate.release();
	}
}

/// Create and register a tap-backed ethernet device.
///
/// `name` is the host tap interface; `addr` optionally fixes the hardware
/// address, otherwise the host interface's own address is used at open time.
pub fn init(stack: &Arc<Netstack>, name: &str, addr: Option<MacAddr>) -> Result<Arc<NetDevice>> {
	if name.is_empty() || name.len() >= 16 {
		return Err(Error::InvalidInput);
	}
	let driver = Box::new(TapDriver {
		name: name.to_string(),
		irq: TAP_IRQ,
		state: Mutex::new(TapState {
			fd: -1,
			notifier: None,
			stop: Arc::new(AtomicBool::new(false)),
		}),
		gate: Arc::new(Gate::new()),
	});
	let dev = stack.register_device(ether::ethernet_device(
		addr.unwrap_or(MacAddr::ANY),
		driver,
	));
	stack.request_irq(TAP_IRQ, Arc::clone(&dev) as Arc<dyn IrqHandler>, IrqFlags::SHARED, dev.name())?;
	info!("ethernet device initialized, dev={}", dev.name());
	Ok(dev)
}
