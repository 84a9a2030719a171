//! TCP: a subset of the RFC 793 connection engine.
//!
//! The segment-arrival pipeline follows RFC 793 §3.9 for the LISTEN,
//! SYN-RECEIVED and ESTABLISHED states; the remaining states are reserved in
//! the PCB but not driven. There is no retransmission, no congestion control
//! and no FIN sequence — `close` sends an RST and drops the connection.
//!
//! The C-style fallthrough from the SYN-RECEIVED ACK check into the
//! ESTABLISHED processing (to honor an ACK that piggy-backs data or window
//! updates on the final handshake segment) is codified explicitly: once the
//! in-window ACK moves the PCB to ESTABLISHED, processing continues into the
//! ESTABLISHED steps of the same arrival.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};

use crate::config::{TCP_BUFFER_SIZE, TCP_PCB_COUNT};
use crate::io::{Error, Result};
use crate::ip::{self, IpInterface, IP_HDR_SIZE_MIN, IP_PROTOCOL_TCP};
use crate::stack::Netstack;
use crate::synch::{Mutex, WaitCtx};
use crate::util::checksum16;

pub(crate) const TCP_HDR_SIZE: usize = 20;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	struct TcpFlags: u8 {
		const FIN = 0x01;
		const SYN = 0x02;
		const RST = 0x04;
		const PSH = 0x08;
		const ACK = 0x10;
		const URG = 0x20;
	}
}

// The full RFC 793 state set is kept in the data model even though only the
// passive-open path drives a subset of it.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
	Free,
	Closed,
	Listen,
	SynSent,
	SynReceived,
	Established,
	FinWait1,
	FinWait2,
	Closing,
	TimeWait,
	CloseWait,
	LastAck,
}

/// Current segment variables (RFC 793 SEG.*), with `len` counting one
/// synthetic byte for SYN and FIN each.
struct Segment {
	seq: u32,
	ack: u32,
	len: u32,
	wnd: u16,
	#[allow(dead_code)]
	up: u16,
}

#[derive(Default)]
struct SndVars {
	nxt: u32,
	una: u32,
	wnd: u16,
	#[allow(dead_code)]
	up: u16,
	wl1: u32,
	wl2: u32,
}

#[derive(Default)]
struct RcvVars {
	nxt: u32,
	wnd: u16,
	#[allow(dead_code)]
	up: u16,
}

struct TcpPcb {
	state: TcpState,
	local: SocketAddrV4,
	foreign: SocketAddrV4,
	snd: SndVars,
	iss: u32,
	rcv: RcvVars,
	irs: u32,
	mtu: u16,
	mss: u16,
	buf: Box<[u8; TCP_BUFFER_SIZE]>,
	ctx: Arc<WaitCtx>,
}

impl TcpPcb {
	fn new() -> Self {
		Self {
			state: TcpState::Free,
			local: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
			foreign: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
			snd: SndVars::default(),
			iss: 0,
			rcv: RcvVars::default(),
			irs: 0,
			mtu: 0,
			mss: 0,
			buf: Box::new([0; TCP_BUFFER_SIZE]),
			ctx: Arc::new(WaitCtx::new()),
		}
	}
}

type Table = [TcpPcb; TCP_PCB_COUNT];

pub(crate) struct TcpEngine {
	table: Mutex<Table>,
	// Initial send sequence numbers come from a seeded ChaCha stream.
	rng: Mutex<ChaCha20Rng>,
}

impl TcpEngine {
	pub(crate) fn new() -> Self {
		let rng = ChaCha20Rng::try_from_os_rng().unwrap_or_else(|_| {
			let nanos = SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_nanos() as u64)
				.unwrap_or(0);
			ChaCha20Rng::seed_from_u64(nanos)
		});
		Self {
			table: Mutex::new(std::array::from_fn(|_| TcpPcb::new())),
			rng: Mutex::new(rng),
		}
	}

	fn initial_sequence(&self) -> u32 {
		self.rng.lock().next_u32()
	}
}

/// Match an arrival to a PCB. An exact `(local, foreign)` match wins; a
/// LISTEN PCB with a wildcard foreign endpoint catches the rest.
fn select(table: &Table, local: SocketAddrV4, foreign: SocketAddrV4) -> Option<usize> {
	let mut listener = None;
	for (id, pcb) in table.iter().enumerate() {
		if (*pcb.local.ip() != Ipv4Addr::UNSPECIFIED && *pcb.local.ip() != *local.ip())
			|| pcb.local.port() != local.port()
		{
			continue;
		}
		if pcb.foreign == foreign {
			return Some(id);
		}
		if pcb.state == TcpState::Listen
			&& *pcb.foreign.ip() == Ipv4Addr::UNSPECIFIED
			&& pcb.foreign.port() == 0
		{
			listener = Some(id);
		}
	}
	listener
}

fn get(table: &Table, id: usize) -> Result<()> {
	if id >= TCP_PCB_COUNT || table[id].state == TcpState::Free {
		warn!("pcb not found, id={id}");
		return Err(Error::NotFound);
	}
	Ok(())
}

/// Return the PCB to FREE once no sleeper remains on its context.
fn release(table: &mut Table, id: usize) {
	if table[id].ctx.destroy().is_err() {
		// Sleepers remain: wake them; the last one out releases again.
		table[id].ctx.wakeup();
		return;
	}
	debug!(
		"released, local={}, foreign={}",
		table[id].local, table[id].foreign
	);
	table[id] = TcpPcb::new();
}

/// RFC 793 segment acceptability test against the receive window.
fn acceptable(rcv_nxt: u32, rcv_wnd: u16, seq: u32, len: u32) -> bool {
	let wnd_end = rcv_nxt.wrapping_add(u32::from(rcv_wnd));
	if len == 0 {
		if rcv_wnd == 0 {
			seq == rcv_nxt
		} else {
			rcv_nxt <= seq && seq < wnd_end
		}
	} else if rcv_wnd == 0 {
		false
	} else {
		let end = seq.wrapping_add(len).wrapping_sub(1);
		(rcv_nxt <= seq && seq < wnd_end) || (rcv_nxt <= end && end < wnd_end)
	}
}

/// Emit one segment. Used both from PCB context and for the RST forms that
/// have no PCB at all.
fn output_segment(
	stack: &Netstack,
	seq: u32,
	ack: u32,
	flags: TcpFlags,
	wnd: u16,
	payload: &[u8],
	local: SocketAddrV4,
	foreign: SocketAddrV4,
) -> Result<usize> {
	let total = TCP_HDR_SIZE + payload.len();
	let mut buf = Vec::with_capacity(total);
	buf.extend_from_slice(&local.port().to_be_bytes());
	buf.extend_from_slice(&foreign.port().to_be_bytes());
	buf.extend_from_slice(&seq.to_be_bytes());
	buf.extend_from_slice(&ack.to_be_bytes());
	buf.push(((TCP_HDR_SIZE as u8) >> 2) << 4); // data offset in 32-bit words
	buf.push(flags.bits());
	buf.extend_from_slice(&wnd.to_be_bytes());
	buf.extend_from_slice(&0u16.to_be_bytes()); // checksum, filled below
	buf.extend_from_slice(&0u16.to_be_bytes()); // urgent pointer
	buf.extend_from_slice(payload);
	let pseudo = pseudo_header(*local.ip(), *foreign.ip(), total as u16);
	let psum = u32::from(!checksum16(&pseudo, 0));
	let sum = checksum16(&buf, psum);
	buf[16..18].copy_from_slice(&sum.to_be_bytes());
	debug!(
		"{local} => {foreign}, len={total} (payload={})",
		payload.len()
	);
	ip::output(stack, IP_PROTOCOL_TCP, &buf, *local.ip(), *foreign.ip())?;
	Ok(payload.len())
}

/// Emit one segment from `pcb`'s state: SYN carries `iss`, everything else
/// `snd.nxt`; the ACK field always carries `rcv.nxt`.
fn output(stack: &Netstack, pcb: &TcpPcb, flags: TcpFlags, payload: &[u8]) -> Result<usize> {
	let seq = if flags.contains(TcpFlags::SYN) {
		pcb.iss
	} else {
		pcb.snd.nxt
	};
	output_segment(
		stack,
		seq,
		pcb.rcv.nxt,
		flags,
		pcb.rcv.wnd,
		payload,
		pcb.local,
		pcb.foreign,
	)
}

fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, len: u16) -> [u8; 12] {
	let mut pseudo = [0u8; 12];
	pseudo[0..4].copy_from_slice(&src.octets());
	pseudo[4..8].copy_from_slice(&dst.octets());
	pseudo[9] = IP_PROTOCOL_TCP;
	pseudo[10..12].copy_from_slice(&len.to_be_bytes());
	pseudo
}

/// RFC 793 §3.9, SEGMENT ARRIVES. Runs under the TCP table lock.
fn segment_arrives(
	stack: &Netstack,
	table: &mut Table,
	seg: &Segment,
	flags: TcpFlags,
	data: &[u8],
	local: SocketAddrV4,
	foreign: SocketAddrV4,
) {
	let id = match select(table, local, foreign) {
		Some(id) if table[id].state != TcpState::Closed => id,
		_ => {
			// No connection here: anything but an RST earns one.
			if flags.contains(TcpFlags::RST) {
				return;
			}
			let _ = if !flags.contains(TcpFlags::ACK) {
				output_segment(
					stack,
					0,
					seg.seq.wrapping_add(seg.len),
					TcpFlags::RST | TcpFlags::ACK,
					0,
					&[],
					local,
					foreign,
				)
			} else {
				output_segment(stack, seg.ack, 0, TcpFlags::RST, 0, &[], local, foreign)
			};
			return;
		}
	};

	match table[id].state {
		TcpState::Listen => {
			// 1st check for an RST
			if flags.contains(TcpFlags::RST) {
				return;
			}
			// 2nd check for an ACK
			if flags.contains(TcpFlags::ACK) {
				let _ =
					output_segment(stack, seg.ack, 0, TcpFlags::RST, 0, &[], local, foreign);
				return;
			}
			// 3rd check for a SYN
			if flags.contains(TcpFlags::SYN) {
				// ignore: security/compartment and precedence checks
				let iss = stack.tcp.initial_sequence();
				{
					let pcb = &mut table[id];
					pcb.local = local;
					pcb.foreign = foreign;
					pcb.rcv.wnd = TCP_BUFFER_SIZE as u16;
					pcb.rcv.nxt = seg.seq.wrapping_add(1);
					pcb.irs = seg.seq;
					pcb.iss = iss;
				}
				let _ = output(stack, &table[id], TcpFlags::SYN | TcpFlags::ACK, &[]);
				let pcb = &mut table[id];
				pcb.snd.nxt = iss.wrapping_add(1);
				pcb.snd.una = iss;
				pcb.state = TcpState::SynReceived;
				// Any other control or data combined with the SYN is
				// processed in the SYN-RECEIVED state on retransmission.
				return;
			}
			// 4th: other text or control; drop.
			return;
		}
		TcpState::SynSent => {
			// Active open is not driven; drop.
			return;
		}
		_ => {}
	}

	// 1st check sequence number
	if matches!(
		table[id].state,
		TcpState::SynReceived | TcpState::Established
	) {
		let pcb = &table[id];
		if !acceptable(pcb.rcv.nxt, pcb.rcv.wnd, seg.seq, seg.len) {
			if !flags.contains(TcpFlags::RST) {
				let _ = output(stack, pcb, TcpFlags::ACK, &[]);
			}
			return;
		}
		// From here on the segment is treated as the idealized segment
		// beginning at RCV.NXT that does not exceed the window.
	}

	// 2nd check the RST bit, 3rd security/precedence, 4th the SYN bit:
	// not driven for these states.

	// 5th check the ACK field
	if !flags.contains(TcpFlags::ACK) {
		return;
	}
	if table[id].state == TcpState::SynReceived {
		let pcb = &mut table[id];
		if pcb.snd.una <= seg.ack && seg.ack <= pcb.snd.nxt {
			pcb.state = TcpState::Established;
			pcb.ctx.wakeup();
			// Processing continues in ESTABLISHED below with this same
			// segment (the ACK may carry data or a window update).
		} else {
			let _ = output_segment(stack, seg.ack, 0, TcpFlags::RST, 0, &[], local, foreign);
			return;
		}
	}
	if table[id].state == TcpState::Established {
		let pcb = &mut table[id];
		if pcb.snd.una < seg.ack && seg.ack <= pcb.snd.nxt {
			pcb.snd.una = seg.ack;
			// Send waiters may now have window capacity again.
			pcb.ctx.wakeup();
			if pcb.snd.wl1 < seg.seq || (pcb.snd.wl1 == seg.seq && pcb.snd.wl2 <= seg.ack) {
				pcb.snd.wnd = seg.wnd;
				pcb.snd.wl1 = seg.seq;
				pcb.snd.wl2 = seg.ack;
			}
		} else if seg.ack < pcb.snd.una {
			// Duplicate ACK; ignore.
		} else if seg.ack > pcb.snd.nxt {
			let _ = output(stack, &table[id], TcpFlags::ACK, &[]);
			return;
		}
	}

	// 6th check the URG bit: ignored.

	// 7th process the segment text
	if table[id].state == TcpState::Established && !data.is_empty() {
		let pcb = &mut table[id];
		let offset = TCP_BUFFER_SIZE - usize::from(pcb.rcv.wnd);
		let len = data.len().min(usize::from(pcb.rcv.wnd));
		pcb.buf[offset..offset + len].copy_from_slice(&data[..len]);
		pcb.rcv.nxt = seg.seq.wrapping_add(seg.len);
		pcb.rcv.wnd -= len as u16;
		let _ = output(stack, &table[id], TcpFlags::ACK, &[]);
		table[id].ctx.wakeup();
	}

	// 8th check the FIN bit: not driven.
}

/// Validate one TCP segment and feed it to the state machine.
pub(crate) fn input(
	stack: &Netstack,
	data: &[u8],
	src: Ipv4Addr,
	dst: Ipv4Addr,
	iface: &Arc<IpInterface>,
) {
	if data.len() < TCP_HDR_SIZE {
		warn!("too short, len={}", data.len());
		return;
	}
	let pseudo = pseudo_header(src, dst, data.len() as u16);
	let psum = u32::from(!checksum16(&pseudo, 0));
	if checksum16(data, psum) != 0 {
		warn!("checksum error");
		return;
	}
	if src == Ipv4Addr::BROADCAST
		|| src == iface.broadcast()
		|| dst == Ipv4Addr::BROADCAST
		|| dst == iface.broadcast()
	{
		warn!("only supports unicast, src={src}, dst={dst}");
		return;
	}
	let hlen = usize::from(data[12] >> 4) << 2;
	if hlen < TCP_HDR_SIZE || hlen > data.len() {
		warn!("header length error, hlen={hlen}");
		return;
	}
	let flags = TcpFlags::from_bits_truncate(data[13]);
	let mut len = (data.len() - hlen) as u32;
	if flags.contains(TcpFlags::SYN) {
		len += 1; // SYN occupies one sequence number
	}
	if flags.contains(TcpFlags::FIN) {
		len += 1; // so does FIN
	}
	let seg = Segment {
		seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
		ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
		len,
		wnd: u16::from_be_bytes([data[14], data[15]]),
		up: u16::from_be_bytes([data[18], data[19]]),
	};
	let local = SocketAddrV4::new(dst, u16::from_be_bytes([data[2], data[3]]));
	let foreign = SocketAddrV4::new(src, u16::from_be_bytes([data[0], data[1]]));
	debug!(
		"{foreign} => {local}, len={} (payload={})",
		data.len(),
		data.len() - hlen
	);
	let mut table = stack.tcp.table.lock();
	segment_arrives(stack, &mut table, &seg, flags, &data[hlen..], local, foreign);
}

impl Netstack {
	/// Open a connection per the RFC 793 OPEN call.
	///
	/// Only the passive form is implemented: the PCB enters LISTEN (with an
	/// optional fixed foreign endpoint) and the call blocks until a
	/// handshake completes, returning the socket id once ESTABLISHED.
	pub fn tcp_open_rfc793(
		&self,
		local: SocketAddrV4,
		foreign: Option<SocketAddrV4>,
		active: bool,
	) -> Result<usize> {
		let mut table = self.tcp.table.lock();
		let Some(id) = table.iter().position(|pcb| pcb.state == TcpState::Free) else {
			warn!("no free tcp pcb");
			return Err(Error::Exhausted);
		};
		table[id] = TcpPcb::new();
		table[id].state = TcpState::Closed;
		if active {
			warn!("active open is not implemented");
			release(&mut table, id);
			return Err(Error::NotSupported);
		}
		debug!("passive open: local={local}, waiting for connection...");
		table[id].local = local;
		if let Some(foreign) = foreign {
			table[id].foreign = foreign;
		}
		table[id].state = TcpState::Listen;
		loop {
			let state = table[id].state;
			while table[id].state == state {
				let ctx = Arc::clone(&table[id].ctx);
				let (reacquired, res) = ctx.sleep(table, None);
				table = reacquired;
				if res.is_err() {
					debug!("interrupted");
					table[id].state = TcpState::Closed;
					release(&mut table, id);
					return Err(Error::Interrupted);
				}
			}
			match table[id].state {
				TcpState::Established => break,
				// Intermediate: wait for the handshake to finish.
				TcpState::SynReceived => continue,
				state => {
					warn!("open error, state={state:?}");
					table[id].state = TcpState::Closed;
					release(&mut table, id);
					return Err(Error::NotConnected);
				}
			}
		}
		debug!(
			"connection established: local={}, foreign={}",
			table[id].local, table[id].foreign
		);
		Ok(id)
	}

	/// Abort the connection: send an RST and release the PCB.
	pub fn tcp_close(&self, id: usize) -> Result<()> {
		let mut table = self.tcp.table.lock();
		get(&table, id)?;
		let _ = output(self, &table[id], TcpFlags::RST, &[]);
		release(&mut table, id);
		Ok(())
	}

	/// Send `data`, segmenting by MSS and the peer's advertised window.
	/// Blocks while the window is full. A cancellation after partial
	/// progress returns the short count instead of an error.
	pub fn tcp_send(&self, id: usize, data: &[u8]) -> Result<usize> {
		let mut table = self.tcp.table.lock();
		get(&table, id)?;
		let mut sent = 0;
		'retry: loop {
			match table[id].state {
				TcpState::Established => {
					let Some(iface) = self.ip.route_get_iface(*table[id].foreign.ip()) else {
						warn!("iface not found");
						return Err(Error::NoRoute);
					};
					let dev = iface.device(self).ok_or(Error::NotFound)?;
					let mss = dev.mtu() - (IP_HDR_SIZE_MIN + TCP_HDR_SIZE);
					{
						let pcb = &mut table[id];
						pcb.mtu = dev.mtu() as u16;
						pcb.mss = mss as u16;
					}
					while sent < data.len() {
						let pcb = &table[id];
						let inflight = pcb.snd.nxt.wrapping_sub(pcb.snd.una) as usize;
						let cap = usize::from(pcb.snd.wnd).saturating_sub(inflight);
						if cap == 0 {
							// Window full; wait for ACKs to open it.
							let ctx = Arc::clone(&table[id].ctx);
							let (reacquired, res) = ctx.sleep(table, None);
							table = reacquired;
							if res.is_err() {
								debug!("interrupted");
								if sent == 0 {
									return Err(Error::Interrupted);
								}
								break 'retry;
							}
							continue 'retry;
						}
						let slen = mss.min(data.len() - sent).min(cap);
						if output(
							self,
							&table[id],
							TcpFlags::ACK | TcpFlags::PSH,
							&data[sent..sent + slen],
						)
						.is_err()
						{
							warn!("segment output failure");
							table[id].state = TcpState::Closed;
							release(&mut table, id);
							return Err(Error::NotConnected);
						}
						let pcb = &mut table[id];
						pcb.snd.nxt = pcb.snd.nxt.wrapping_add(slen as u32);
						sent += slen;
					}
					break 'retry;
				}
				state => {
					warn!("unexpected state {state:?}");
					return Err(Error::NotConnected);
				}
			}
		}
		Ok(sent)
	}

	/// Receive from the connection's buffer, blocking while it is empty.
	pub fn tcp_receive(&self, id: usize, buf: &mut [u8]) -> Result<usize> {
		let mut table = self.tcp.table.lock();
		get(&table, id)?;
		let remain = loop {
			match table[id].state {
				TcpState::Established => {
					let remain = TCP_BUFFER_SIZE - usize::from(table[id].rcv.wnd);
					if remain > 0 {
						break remain;
					}
					let ctx = Arc::clone(&table[id].ctx);
					let (reacquired, res) = ctx.sleep(table, None);
					table = reacquired;
					if res.is_err() {
						debug!("interrupted");
						return Err(Error::Interrupted);
					}
				}
				state => {
					warn!("unexpected state {state:?}");
					return Err(Error::NotConnected);
				}
			}
		};
		let pcb = &mut table[id];
		let len = buf.len().min(remain);
		buf[..len].copy_from_slice(&pcb.buf[..len]);
		// Shift the remainder down to the head of the buffer.
		pcb.buf.copy_within(len..remain, 0);
		pcb.rcv.wnd += len as u16;
		Ok(len)
	}
}

/// Cancellation: interrupt every allocated PCB's waiters.
fn event_handler(stack: &Netstack) {
	let table = stack.tcp.table.lock();
	for pcb in table.iter() {
		if pcb.state != TcpState::Free {
			pcb.ctx.interrupt();
		}
	}
}

pub(crate) fn init(stack: &Arc<Netstack>) -> Result<()> {
	stack.ip.register_protocol(IP_PROTOCOL_TCP, input)?;
	stack.subscribe_event(event_handler);
	Ok(())
}
