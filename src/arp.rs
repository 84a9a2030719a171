//! ARP: request/reply processing and the bounded resolver cache.
//!
//! The cache holds 32 entries with LRU replacement. Output paths call
//! [`resolve`]; an unknown address allocates an INCOMPLETE entry, broadcasts
//! a request and reports [`Resolve::Incomplete`] so the caller can drop the
//! packet softly. Replies and gratuitous traffic fill the cache from
//! [`input`]. A periodic timer ages RESOLVED entries out.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::config::{ARP_CACHE_SIZE, ARP_CACHE_TIMEOUT, ARP_TIMER_INTERVAL};
use crate::device::{DeviceKind, NetDevice};
use crate::ether::{MacAddr, ETHER_TYPE_ARP, ETHER_TYPE_IP};
use crate::io::{Error, Result};
use crate::ip::IpInterface;
use crate::stack::Netstack;
use crate::synch::Mutex;

const ARP_HRD_ETHER: u16 = 0x0001;
const ARP_PRO_IP: u16 = ETHER_TYPE_IP;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

/// `htype | ptype | hlen | plen | op | sha | spa | tha | tpa`
const ARP_MSG_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArpState {
	Free,
	Incomplete,
	Resolved,
	Static,
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
	state: ArpState,
	pa: Ipv4Addr,
	ha: MacAddr,
	timestamp: Option<Instant>,
}

impl ArpEntry {
	const FREE: ArpEntry = ArpEntry {
		state: ArpState::Free,
		pa: Ipv4Addr::UNSPECIFIED,
		ha: MacAddr::ANY,
		timestamp: None,
	};
}

/// Outcome of a cache resolution attempt.
pub(crate) enum Resolve {
	Found(MacAddr),
	/// A request is in flight; no hardware address yet.
	Incomplete,
}

pub(crate) struct Arp {
	cache: Mutex<[ArpEntry; ARP_CACHE_SIZE]>,
}

impl Arp {
	pub(crate) fn new() -> Self {
		Self {
			cache: Mutex::new([ArpEntry::FREE; ARP_CACHE_SIZE]),
		}
	}

	/// Index of any FREE slot, or the least recently updated one (which is
	/// cleared first).
	fn alloc(cache: &mut [ArpEntry; ARP_CACHE_SIZE]) -> usize {
		let mut oldest = 0;
		for (i, entry) in cache.iter().enumerate() {
			if entry.state == ArpState::Free {
				return i;
			}
			if cache[oldest].timestamp > entry.timestamp {
				oldest = i;
			}
		}
		debug!("evict, pa={}, ha={}", cache[oldest].pa, cache[oldest].ha);
		cache[oldest] = ArpEntry::FREE;
		oldest
	}

	fn select(cache: &[ArpEntry; ARP_CACHE_SIZE], pa: Ipv4Addr) -> Option<usize> {
		cache
			.iter()
			.position(|entry| entry.state != ArpState::Free && entry.pa == pa)
	}

	/// Refresh the entry for `pa`, if one exists.
	fn update(&self, pa: Ipv4Addr, ha: MacAddr) -> bool {
		let mut cache = self.cache.lock();
		let Some(i) = Self::select(&cache, pa) else {
			return false;
		};
		cache[i].state = ArpState::Resolved;
		cache[i].ha = ha;
		cache[i].timestamp = Some(Instant::now());
		debug!("update, pa={pa}, ha={ha}");
		true
	}

	fn insert(&self, pa: Ipv4Addr, ha: MacAddr) {
		let mut cache = self.cache.lock();
		let i = Self::alloc(&mut cache);
		cache[i] = ArpEntry {
			state: ArpState::Resolved,
			pa,
			ha,
			timestamp: Some(Instant::now()),
		};
		debug!("insert, pa={pa}, ha={ha}");
	}

	/// Pin a static translation that the aging timer never evicts.
	pub(crate) fn insert_static(&self, pa: Ipv4Addr, ha: MacAddr) {
		let mut cache = self.cache.lock();
		let i = match Self::select(&cache, pa) {
			Some(i) => i,
			None => Self::alloc(&mut cache),
		};
		cache[i] = ArpEntry {
			state: ArpState::Static,
			pa,
			ha,
			timestamp: Some(Instant::now()),
		};
	}

	/// Drop RESOLVED entries older than the cache timeout.
	fn age(&self) {
		let mut cache = self.cache.lock();
		let now = Instant::now();
		for entry in cache.iter_mut() {
			if entry.state != ArpState::Resolved {
				continue;
			}
			let expired = entry
				.timestamp
				.is_none_or(|t| now.duration_since(t) > ARP_CACHE_TIMEOUT);
			if expired {
				debug!("expired, pa={}, ha={}", entry.pa, entry.ha);
				*entry = ArpEntry::FREE;
			}
		}
	}
}

fn build_message(
	op: u16,
	sha: MacAddr,
	spa: Ipv4Addr,
	tha: MacAddr,
	tpa: Ipv4Addr,
) -> [u8; ARP_MSG_SIZE] {
	let mut msg = [0u8; ARP_MSG_SIZE];
	msg[0..2].copy_from_slice(&ARP_HRD_ETHER.to_be_bytes());
	msg[2..4].copy_from_slice(&ARP_PRO_IP.to_be_bytes());
	msg[4] = 6;
	msg[5] = 4;
	msg[6..8].copy_from_slice(&op.to_be_bytes());
	msg[8..14].copy_from_slice(sha.as_bytes());
	msg[14..18].copy_from_slice(&spa.octets());
	msg[18..24].copy_from_slice(tha.as_bytes());
	msg[24..28].copy_from_slice(&tpa.octets());
	msg
}

/// Broadcast a REQUEST for `tpa` out of `iface`'s device.
fn request(stack: &Netstack, iface: &Arc<IpInterface>, tpa: Ipv4Addr) -> Result<()> {
	let dev = iface.device(stack).ok_or(Error::NotFound)?;
	let msg = build_message(
		ARP_OP_REQUEST,
		dev.hwaddr(),
		iface.unicast(),
		MacAddr::ANY,
		tpa,
	);
	debug!("request, dev={}, tpa={tpa}", dev.name());
	dev.output(stack, ETHER_TYPE_ARP, &msg, dev.broadcast_hwaddr())
}

/// Answer a REQUEST: our address pair toward the requestor.
fn reply(
	stack: &Netstack,
	iface: &Arc<IpInterface>,
	tha: MacAddr,
	tpa: Ipv4Addr,
	dst: MacAddr,
) -> Result<()> {
	let dev = iface.device(stack).ok_or(Error::NotFound)?;
	let msg = build_message(ARP_OP_REPLY, dev.hwaddr(), iface.unicast(), tha, tpa);
	debug!("reply, dev={}, tpa={tpa}", dev.name());
	dev.output(stack, ETHER_TYPE_ARP, &msg, dst)
}

/// Process one ARP message from `dev`.
pub(crate) fn input(stack: &Netstack, data: &[u8], dev: &Arc<NetDevice>) {
	if data.len() < ARP_MSG_SIZE {
		warn!("too short, dev={}, len={}", dev.name(), data.len());
		return;
	}
	let hrd = u16::from_be_bytes([data[0], data[1]]);
	let hln = data[4];
	if hrd != ARP_HRD_ETHER || hln != 6 {
		warn!("unsupported hardware address, dev={}", dev.name());
		return;
	}
	let pro = u16::from_be_bytes([data[2], data[3]]);
	let pln = data[5];
	if pro != ARP_PRO_IP || pln != 4 {
		warn!("unsupported protocol address, dev={}", dev.name());
		return;
	}
	let op = u16::from_be_bytes([data[6], data[7]]);
	let sha = MacAddr(data[8..14].try_into().unwrap_or([0; 6]));
	let spa = Ipv4Addr::from(<[u8; 4]>::try_from(&data[14..18]).unwrap_or([0; 4]));
	let tpa = Ipv4Addr::from(<[u8; 4]>::try_from(&data[24..28]).unwrap_or([0; 4]));

	// Refresh the sender's mapping first; remember whether it was known.
	let merged = stack.arp.update(spa, sha);

	let Some(iface) = dev.get_ip_iface() else {
		return;
	};
	if iface.unicast() != tpa {
		return;
	}
	if !merged {
		stack.arp.insert(spa, sha);
	}
	if op == ARP_OP_REQUEST {
		if let Err(err) = reply(stack, &iface, sha, spa, sha) {
			warn!("reply failed, dev={}: {err}", dev.name());
		}
	}
}

/// Resolve `pa` to a hardware address through `iface`.
///
/// A cache hit returns [`Resolve::Found`]. A miss allocates an INCOMPLETE
/// entry and broadcasts a request; a hit on an INCOMPLETE entry re-sends the
/// request (the earlier one may have been lost). Both report
/// [`Resolve::Incomplete`].
pub(crate) fn resolve(
	stack: &Netstack,
	iface: &Arc<IpInterface>,
	pa: Ipv4Addr,
) -> Result<Resolve> {
	let dev = iface.device(stack).ok_or(Error::NotFound)?;
	if dev.kind() != DeviceKind::Ethernet {
		debug!("unsupported hardware address type, dev={}", dev.name());
		return Err(Error::NotSupported);
	}

	let mut cache = stack.arp.cache.lock();
	match Arp::select(&cache, pa) {
		None => {
			let i = Arp::alloc(&mut cache);
			cache[i] = ArpEntry {
				state: ArpState::Incomplete,
				pa,
				ha: MacAddr::ANY,
				timestamp: Some(Instant::now()),
			};
			drop(cache);
			request(stack, iface, pa)?;
			Ok(Resolve::Incomplete)
		}
		Some(i) if cache[i].state == ArpState::Incomplete => {
			drop(cache);
			// Resend in case the earlier request was lost.
			request(stack, iface, pa)?;
			Ok(Resolve::Incomplete)
		}
		Some(i) => {
			let ha = cache[i].ha;
			drop(cache);
			debug!("resolved, pa={pa}, ha={ha}");
			Ok(Resolve::Found(ha))
		}
	}
}

fn timer(stack: &Netstack) {
	stack.arp.age();
}

pub(crate) fn init(stack: &Arc<Netstack>) -> Result<()> {
	stack.register_protocol(ETHER_TYPE_ARP, input)?;
	stack.register_timer(ARP_TIMER_INTERVAL, timer);
	Ok(())
}
