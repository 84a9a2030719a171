//! ICMPv4: echo replies.

use std::net::Ipv4Addr;
use std::sync::Arc;

use log::{debug, warn};

use crate::io::Result;
use crate::ip::{self, IpInterface, IP_PAYLOAD_SIZE_MAX, IP_PROTOCOL_ICMP};
use crate::stack::Netstack;
use crate::util::checksum16;

pub(crate) const ICMP_HDR_SIZE: usize = 8;

pub(crate) const ICMP_TYPE_ECHOREPLY: u8 = 0;
pub(crate) const ICMP_TYPE_ECHO: u8 = 8;

/// Process one ICMP message addressed to `iface`.
///
/// The checksum covers the whole message with the same ones-complement
/// algorithm as the IP header. Echo requests are answered verbatim with the
/// receiving interface's unicast address as the source.
pub(crate) fn input(
	stack: &Netstack,
	data: &[u8],
	src: Ipv4Addr,
	_dst: Ipv4Addr,
	iface: &Arc<IpInterface>,
) {
	if data.len() < ICMP_HDR_SIZE {
		warn!("too short, len={}", data.len());
		return;
	}
	if checksum16(data, 0) != 0 {
		warn!("checksum error");
		return;
	}
	let msg_type = data[0];
	let code = data[1];
	let values = <[u8; 4]>::try_from(&data[4..8]).unwrap_or([0; 4]);
	debug!("{src} => {}, type={msg_type}, len={}", iface.unicast(), data.len());
	if msg_type == ICMP_TYPE_ECHO {
		// The reply goes out of the interface the request arrived on.
		if let Err(err) = output(
			stack,
			ICMP_TYPE_ECHOREPLY,
			code,
			values,
			&data[ICMP_HDR_SIZE..],
			iface.unicast(),
			src,
		) {
			warn!("echo reply failed: {err}");
		}
	}
}

/// Emit one ICMP message. `values` is the type-specific 32-bit word
/// (identifier and sequence number for echo messages).
pub(crate) fn output(
	stack: &Netstack,
	msg_type: u8,
	code: u8,
	values: [u8; 4],
	payload: &[u8],
	src: Ipv4Addr,
	dst: Ipv4Addr,
) -> Result<usize> {
	let mut buf = Vec::with_capacity((ICMP_HDR_SIZE + payload.len()).min(IP_PAYLOAD_SIZE_MAX));
	buf.push(msg_type);
	buf.push(code);
	buf.extend_from_slice(&0u16.to_be_bytes()); // checksum, filled below
	buf.extend_from_slice(&values);
	buf.extend_from_slice(payload);
	let sum = checksum16(&buf, 0);
	buf[2..4].copy_from_slice(&sum.to_be_bytes());
	debug!("{src} => {dst}, type={msg_type}, len={}", buf.len());
	ip::output(stack, IP_PROTOCOL_ICMP, &buf, src, dst)
}

pub(crate) fn init(stack: &Arc<Netstack>) -> Result<()> {
	stack.ip.register_protocol(IP_PROTOCOL_ICMP, input)
}
