//! Shared fixtures: a capturing ethernet test device and wire-format
//! builders for injected packets.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tapstack::{
	transmit_frame, DeviceFlags, DeviceKind, MacAddr, NetDevice, NetDriver, Netstack, Result,
};

pub const ETHER_HDR_SIZE: usize = 14;
pub const ETHER_TYPE_IP: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;

/// Frames transmitted by the stack, observable from the test thread.
pub struct Captured {
	frames: Mutex<Vec<Vec<u8>>>,
	arrived: Condvar,
}

impl Captured {
	fn new() -> Self {
		Self {
			frames: Mutex::new(Vec::new()),
			arrived: Condvar::new(),
		}
	}

	fn push(&self, frame: Vec<u8>) {
		self.frames
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.push(frame);
		self.arrived.notify_all();
	}

	pub fn count(&self) -> usize {
		self.frames
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.len()
	}

	/// Block until at least `count` frames have been captured; panics after
	/// `timeout` so a missing frame fails the test instead of hanging it.
	pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Vec<u8>> {
		let deadline = Instant::now() + timeout;
		let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
		while frames.len() < count {
			let now = Instant::now();
			if now >= deadline {
				panic!("timed out waiting for frame {count}, have {}", frames.len());
			}
			frames = self
				.arrived
				.wait_timeout(frames, deadline - now)
				.map(|(guard, _)| guard)
				.unwrap_or_else(|e| PoisonError::into_inner(e).0);
		}
		frames.clone()
	}

	/// Assert that no frame beyond `count` shows up within `window`.
	pub fn assert_quiet(&self, count: usize, window: Duration) {
		std::thread::sleep(window);
		assert_eq!(self.count(), count, "unexpected egress frames");
	}
}

struct TestDriver {
	captured: Arc<Captured>,
}

impl NetDriver for TestDriver {
	fn transmit(
		&self,
		_stack: &Netstack,
		dev: &NetDevice,
		ethertype: u16,
		data: &[u8],
		dst: MacAddr,
	) -> Result<()> {
		transmit_frame(dev, ethertype, data, dst, |frame| {
			self.captured.push(frame.to_vec());
			Ok(frame.len())
		})
	}
}

/// Register an ethernet device whose egress lands in the returned capture
/// buffer instead of a wire.
pub fn test_device(stack: &Arc<Netstack>, hwaddr: &str) -> (Arc<NetDevice>, Arc<Captured>) {
	let captured = Arc::new(Captured::new());
	let driver = Box::new(TestDriver {
		captured: Arc::clone(&captured),
	});
	let dev = stack.register_device(NetDevice::new(
		DeviceKind::Ethernet,
		1500,
		DeviceFlags::BROADCAST | DeviceFlags::NEEDS_ARP,
		hwaddr.parse().expect("bad test hwaddr"),
		MacAddr::BROADCAST,
		driver,
	));
	(dev, captured)
}

pub fn checksum16(data: &[u8], init: u32) -> u16 {
	let mut sum = init;
	let mut words = data.chunks_exact(2);
	for word in &mut words {
		sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
	}
	if let [last] = words.remainder() {
		sum += u32::from(*last) << 8;
	}
	while sum >> 16 != 0 {
		sum = (sum & 0xffff) + (sum >> 16);
	}
	!(sum as u16)
}

fn pseudo_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: u16) -> u32 {
	let mut pseudo = [0u8; 12];
	pseudo[0..4].copy_from_slice(&src.octets());
	pseudo[4..8].copy_from_slice(&dst.octets());
	pseudo[9] = protocol;
	pseudo[10..12].copy_from_slice(&len.to_be_bytes());
	u32::from(!checksum16(&pseudo, 0))
}

pub fn ether_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
	let mut frame = Vec::with_capacity(ETHER_HDR_SIZE + payload.len());
	frame.extend_from_slice(&dst.0);
	frame.extend_from_slice(&src.0);
	frame.extend_from_slice(&ethertype.to_be_bytes());
	frame.extend_from_slice(payload);
	frame
}

pub fn arp_message(
	op: u16,
	sha: MacAddr,
	spa: Ipv4Addr,
	tha: MacAddr,
	tpa: Ipv4Addr,
) -> Vec<u8> {
	let mut msg = Vec::with_capacity(28);
	msg.extend_from_slice(&1u16.to_be_bytes());
	msg.extend_from_slice(&ETHER_TYPE_IP.to_be_bytes());
	msg.push(6);
	msg.push(4);
	msg.extend_from_slice(&op.to_be_bytes());
	msg.extend_from_slice(&sha.0);
	msg.extend_from_slice(&spa.octets());
	msg.extend_from_slice(&tha.0);
	msg.extend_from_slice(&tpa.octets());
	msg
}

pub fn ipv4_packet(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
	let total = 20 + payload.len();
	let mut packet = Vec::with_capacity(total);
	packet.push(0x45);
	packet.push(0);
	packet.extend_from_slice(&(total as u16).to_be_bytes());
	packet.extend_from_slice(&1u16.to_be_bytes()); // id
	packet.extend_from_slice(&0u16.to_be_bytes());
	packet.push(64); // ttl
	packet.push(protocol);
	packet.extend_from_slice(&0u16.to_be_bytes());
	packet.extend_from_slice(&src.octets());
	packet.extend_from_slice(&dst.octets());
	let sum = checksum16(&packet, 0);
	packet[10..12].copy_from_slice(&sum.to_be_bytes());
	packet.extend_from_slice(payload);
	packet
}

pub fn icmp_echo(id: u16, seq: u16, data: &[u8]) -> Vec<u8> {
	let mut msg = Vec::with_capacity(8 + data.len());
	msg.push(8); // echo request
	msg.push(0);
	msg.extend_from_slice(&0u16.to_be_bytes());
	msg.extend_from_slice(&id.to_be_bytes());
	msg.extend_from_slice(&seq.to_be_bytes());
	msg.extend_from_slice(data);
	let sum = checksum16(&msg, 0);
	msg[2..4].copy_from_slice(&sum.to_be_bytes());
	msg
}

pub fn udp_datagram(
	src: Ipv4Addr,
	dst: Ipv4Addr,
	src_port: u16,
	dst_port: u16,
	payload: &[u8],
) -> Vec<u8> {
	let total = (8 + payload.len()) as u16;
	let mut dgram = Vec::with_capacity(usize::from(total));
	dgram.extend_from_slice(&src_port.to_be_bytes());
	dgram.extend_from_slice(&dst_port.to_be_bytes());
	dgram.extend_from_slice(&total.to_be_bytes());
	dgram.extend_from_slice(&0u16.to_be_bytes());
	dgram.extend_from_slice(payload);
	let sum = checksum16(&dgram, pseudo_sum(src, dst, 17, total));
	dgram[6..8].copy_from_slice(&sum.to_be_bytes());
	dgram
}

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

#[allow(clippy::too_many_arguments)]
pub fn tcp_segment(
	src: Ipv4Addr,
	dst: Ipv4Addr,
	src_port: u16,
	dst_port: u16,
	seq: u32,
	ack: u32,
	flags: u8,
	wnd: u16,
	payload: &[u8],
) -> Vec<u8> {
	let total = (20 + payload.len()) as u16;
	let mut seg = Vec::with_capacity(usize::from(total));
	seg.extend_from_slice(&src_port.to_be_bytes());
	seg.extend_from_slice(&dst_port.to_be_bytes());
	seg.extend_from_slice(&seq.to_be_bytes());
	seg.extend_from_slice(&ack.to_be_bytes());
	seg.push(0x50);
	seg.push(flags);
	seg.extend_from_slice(&wnd.to_be_bytes());
	seg.extend_from_slice(&0u16.to_be_bytes());
	seg.extend_from_slice(&0u16.to_be_bytes());
	seg.extend_from_slice(payload);
	let sum = checksum16(&seg, pseudo_sum(src, dst, 6, total));
	seg[16..18].copy_from_slice(&sum.to_be_bytes());
	seg
}

// Frame accessors: `frame` is a whole ethernet frame as captured.

pub fn frame_dst(frame: &[u8]) -> MacAddr {
	MacAddr(frame[0..6].try_into().unwrap())
}

pub fn frame_src(frame: &[u8]) -> MacAddr {
	MacAddr(frame[6..12].try_into().unwrap())
}

pub fn frame_ethertype(frame: &[u8]) -> u16 {
	u16::from_be_bytes([frame[12], frame[13]])
}

pub fn frame_payload(frame: &[u8]) -> &[u8] {
	&frame[ETHER_HDR_SIZE..]
}

/// The IP payload of a captured frame, trimmed to the header's total length
/// (frames may carry ethernet padding).
pub fn ip_payload(frame: &[u8]) -> &[u8] {
	let packet = frame_payload(frame);
	let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
	&packet[20..total]
}

pub fn ip_proto(frame: &[u8]) -> u8 {
	frame_payload(frame)[9]
}

pub fn ip_src(frame: &[u8]) -> Ipv4Addr {
	let packet = frame_payload(frame);
	Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15])
}

pub fn ip_dst(frame: &[u8]) -> Ipv4Addr {
	let packet = frame_payload(frame);
	Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19])
}

pub fn ip_ttl(frame: &[u8]) -> u8 {
	frame_payload(frame)[8]
}
