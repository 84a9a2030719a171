//! UDP: a fixed table of protocol control blocks with blocking receive.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use log::{debug, warn};

use crate::config::{SOURCE_PORT_MAX, SOURCE_PORT_MIN, UDP_PCB_COUNT};
use crate::io::{Error, Result};
use crate::ip::{self, IpInterface, IP_PAYLOAD_SIZE_MAX, IP_PROTOCOL_UDP};
use crate::stack::Netstack;
use crate::synch::{Mutex, WaitCtx};
use crate::util::checksum16;

pub(crate) const UDP_HDR_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PcbState {
	Free,
	Open,
	Closing,
}

struct UdpPcb {
	state: PcbState,
	local: SocketAddrV4,
	queue: VecDeque<Datagram>,
	ctx: Arc<WaitCtx>,
}

struct Datagram {
	foreign: SocketAddrV4,
	data: Vec<u8>,
}

impl UdpPcb {
	fn new() -> Self {
		Self {
			state: PcbState::Free,
			local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
			queue: VecDeque::new(),
			ctx: Arc::new(WaitCtx::new()),
		}
	}
}

type Table = [UdpPcb; UDP_PCB_COUNT];

pub(crate) struct UdpEngine {
	table: Mutex<Table>,
}

impl UdpEngine {
	pub(crate) fn new() -> Self {
		Self {
			table: Mutex::new(std::array::from_fn(|_| UdpPcb::new())),
		}
	}
}

/// Incoming-match rule: any OPEN PCB with the right port whose address is a
/// wildcard, or whose address equals the datagram destination.
fn select(table: &Table, addr: Ipv4Addr, port: u16) -> Option<usize> {
	table.iter().position(|pcb| {
		pcb.state == PcbState::Open
			&& (*pcb.local.ip() == Ipv4Addr::UNSPECIFIED
				|| addr == Ipv4Addr::UNSPECIFIED
				|| *pcb.local.ip() == addr)
			&& pcb.local.port() == port
	})
}

fn get(table: &Table, id: usize) -> Result<()> {
	if id >= UDP_PCB_COUNT || table[id].state != PcbState::Open {
		warn!("pcb not found, id={id}");
		return Err(Error::NotFound);
	}
	Ok(())
}

/// Return the PCB to FREE once no sleeper remains on its context.
fn release(table: &mut Table, id: usize) {
	table[id].state = PcbState::Closing;
	if table[id].ctx.destroy().is_err() {
		// Sleepers remain: wake them; the last one out releases again.
		table[id].ctx.wakeup();
		return;
	}
	table[id] = UdpPcb::new();
	debug!("released, id={id}");
}

impl Netstack {
	/// Allocate a UDP socket. The returned id indexes the PCB table.
	pub fn udp_open(&self) -> Result<usize> {
		let mut table = self.udp.table.lock();
		let Some(id) = table.iter().position(|pcb| pcb.state == PcbState::Free) else {
			warn!("no free udp pcb");
			return Err(Error::Exhausted);
		};
		table[id] = UdpPcb::new();
		table[id].state = PcbState::Open;
		Ok(id)
	}

	pub fn udp_close(&self, id: usize) -> Result<()> {
		let mut table = self.udp.table.lock();
		get(&table, id)?;
		release(&mut table, id);
		Ok(())
	}

	/// Bind to a local endpoint; fails if another PCB already covers it
	/// under the wildcard rule.
	pub fn udp_bind(&self, id: usize, local: SocketAddrV4) -> Result<()> {
		let mut table = self.udp.table.lock();
		get(&table, id)?;
		if let Some(exist) = select(&table, *local.ip(), local.port()) {
			warn!(
				"already in use, id={id}, want={local}, exist={}",
				table[exist].local
			);
			return Err(Error::AddrInUse);
		}
		table[id].local = local;
		debug!("bound, id={id}, local={local}");
		Ok(())
	}

	/// Send one datagram to `foreign`, choosing the local address from the
	/// route table and an ephemeral local port when unbound.
	pub fn udp_sendto(&self, id: usize, data: &[u8], foreign: SocketAddrV4) -> Result<usize> {
		let mut table = self.udp.table.lock();
		get(&table, id)?;
		let mut local = table[id].local;
		if *local.ip() == Ipv4Addr::UNSPECIFIED {
			let Some(iface) = self.ip.route_get_iface(*foreign.ip()) else {
				warn!(
					"iface not found that can reach foreign address, addr={}",
					foreign.ip()
				);
				return Err(Error::NoRoute);
			};
			local.set_ip(iface.unicast());
			debug!("select local address, addr={}", local.ip());
		}
		if table[id].local.port() == 0 {
			let mut assigned = false;
			for port in SOURCE_PORT_MIN..=SOURCE_PORT_MAX {
				if select(&table, *local.ip(), port).is_none() {
					table[id].local.set_port(port);
					debug!("dynamic assign local port, port={port}");
					assigned = true;
					break;
				}
			}
			if !assigned {
				warn!("failed to assign local port, addr={}", local.ip());
				return Err(Error::Exhausted);
			}
		}
		local.set_port(table[id].local.port());
		drop(table);
		output(self, local, foreign, data)
	}

	/// Receive one datagram, blocking until one arrives or the call is
	/// cancelled. Returns the copied length and the sender's endpoint.
	pub fn udp_recvfrom(&self, id: usize, buf: &mut [u8]) -> Result<(usize, SocketAddrV4)> {
		let mut table = self.udp.table.lock();
		get(&table, id)?;
		loop {
			if let Some(entry) = table[id].queue.pop_front() {
				drop(table);
				let len = buf.len().min(entry.data.len());
				buf[..len].copy_from_slice(&entry.data[..len]);
				return Ok((len, entry.foreign));
			}
			let ctx = Arc::clone(&table[id].ctx);
			let (reacquired, res) = ctx.sleep(table, None);
			table = reacquired;
			if res.is_err() {
				debug!("interrupted");
				return Err(Error::Interrupted);
			}
			if table[id].state == PcbState::Closing {
				debug!("closed");
				release(&mut table, id);
				return Err(Error::NotFound);
			}
		}
	}
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, len: u16) -> [u8; 12] {
	let mut pseudo = [0u8; 12];
	pseudo[0..4].copy_from_slice(&src.octets());
	pseudo[4..8].copy_from_slice(&dst.octets());
	pseudo[9] = IP_PROTOCOL_UDP;
	pseudo[10..12].copy_from_slice(&len.to_be_bytes());
	pseudo
}

/// Deliver one datagram into the matching PCB's receive queue.
pub(crate) fn input(
	stack: &Netstack,
	data: &[u8],
	src: Ipv4Addr,
	dst: Ipv4Addr,
	_iface: &Arc<IpInterface>,
) {
	if data.len() < UDP_HDR_SIZE {
		warn!("too short, len={}", data.len());
		return;
	}
	let hdr_len = usize::from(u16::from_be_bytes([data[4], data[5]]));
	if data.len() != hdr_len {
		warn!("length error: len={}, hdr.len={hdr_len}", data.len());
		return;
	}
	let pseudo = pseudo_header(src, dst, data.len() as u16);
	let psum = u32::from(!checksum16(&pseudo, 0));
	if checksum16(data, psum) != 0 {
		warn!("checksum error");
		return;
	}
	let src_port = u16::from_be_bytes([data[0], data[1]]);
	let dst_port = u16::from_be_bytes([data[2], data[3]]);
	debug!(
		"{src}:{src_port} => {dst}:{dst_port}, len={} (payload={})",
		data.len(),
		data.len() - UDP_HDR_SIZE
	);
	let mut table = stack.udp.table.lock();
	let Some(id) = select(&table, dst, dst_port) else {
		// No socket bound here; drop silently.
		return;
	};
	table[id].queue.push_back(Datagram {
		foreign: SocketAddrV4::new(src, src_port),
		data: data[UDP_HDR_SIZE..].to_vec(),
	});
	debug!("queue pushed: id={id}, num={}", table[id].queue.len());
	table[id].ctx.wakeup();
}

/// Build one datagram and hand it to IPv4 output.
pub(crate) fn output(
	stack: &Netstack,
	src: SocketAddrV4,
	dst: SocketAddrV4,
	payload: &[u8],
) -> Result<usize> {
	if payload.len() > IP_PAYLOAD_SIZE_MAX - UDP_HDR_SIZE {
		warn!("too long, len={}", payload.len());
		return Err(Error::MessageTooLong);
	}
	let total = (UDP_HDR_SIZE + payload.len()) as u16;
	let mut buf = Vec::with_capacity(usize::from(total));
	buf.extend_from_slice(&src.port().to_be_bytes());
	buf.extend_from_slice(&dst.port().to_be_bytes());
	buf.extend_from_slice(&total.to_be_bytes());
	buf.extend_from_slice(&0u16.to_be_bytes()); // checksum, filled below
	buf.extend_from_slice(payload);
	let pseudo = pseudo_header(*src.ip(), *dst.ip(), total);
	let psum = u32::from(!checksum16(&pseudo, 0));
	let mut sum = checksum16(&buf, psum);
	if sum == 0 {
		// Zero means "no checksum" on the wire.
		sum = 0xffff;
	}
	buf[6..8].copy_from_slice(&sum.to_be_bytes());
	debug!("{src} => {dst}, len={total} (payload={})", payload.len());
	ip::output(stack, IP_PROTOCOL_UDP, &buf, *src.ip(), *dst.ip())?;
	Ok(payload.len())
}

/// Cancellation: interrupt every OPEN PCB's waiters.
fn event_handler(stack: &Netstack) {
	let table = stack.udp.table.lock();
	for pcb in table.iter() {
		if pcb.state == PcbState::Open {
			pcb.ctx.interrupt();
		}
	}
}

pub(crate) fn init(stack: &Arc<Netstack>) -> Result<()> {
	stack.ip.register_protocol(IP_PROTOCOL_UDP, input)?;
	stack.subscribe_event(event_handler);
	Ok(())
}
