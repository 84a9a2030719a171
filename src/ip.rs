//! IPv4: interfaces, longest-prefix-match routing, input validation and the
//! output path that bridges to link-layer framing.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};

use crate::arp::{self, Resolve};
use crate::device::{DeviceFlags, NetDevice};
use crate::ether::{MacAddr, ETHER_TYPE_IP};
use crate::io::{Error, Result};
use crate::stack::Netstack;
use crate::synch::Mutex;
use crate::util::checksum16;

pub(crate) const IP_VERSION_IPV4: u8 = 4;
pub(crate) const IP_HDR_SIZE_MIN: usize = 20;
pub(crate) const IP_TOTAL_SIZE_MAX: usize = 65535;
pub(crate) const IP_PAYLOAD_SIZE_MAX: usize = IP_TOTAL_SIZE_MAX - IP_HDR_SIZE_MIN;

pub(crate) const IP_PROTOCOL_ICMP: u8 = 1;
pub(crate) const IP_PROTOCOL_TCP: u8 = 6;
pub(crate) const IP_PROTOCOL_UDP: u8 = 17;

pub(crate) type IpProtocolHandler =
	fn(&Netstack, &[u8], Ipv4Addr, Ipv4Addr, &Arc<IpInterface>);

/// Parse `<ipv4>:<port>` with the port restricted to `[1, 65535]`.
pub fn parse_endpoint(s: &str) -> Result<SocketAddrV4> {
	let endpoint: SocketAddrV4 = s.parse().map_err(|_| Error::InvalidInput)?;
	if endpoint.port() == 0 {
		return Err(Error::InvalidInput);
	}
	Ok(endpoint)
}

/// An IPv4 attachment to a network device.
///
/// The broadcast address is derived at construction:
/// `(unicast & netmask) | !netmask`.
pub struct IpInterface {
	unicast: Ipv4Addr,
	netmask: Ipv4Addr,
	broadcast: Ipv4Addr,
	// Cross-reference by device index, resolved through the registry
	// (devices and interfaces are never destroyed while the stack lives).
	dev_index: OnceLock<usize>,
}

impl IpInterface {
	pub fn new(unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
		let broadcast =
			Ipv4Addr::from((u32::from(unicast) & u32::from(netmask)) | !u32::from(netmask));
		Self {
			unicast,
			netmask,
			broadcast,
			dev_index: OnceLock::new(),
		}
	}

	pub fn unicast(&self) -> Ipv4Addr {
		self.unicast
	}

	pub fn netmask(&self) -> Ipv4Addr {
		self.netmask
	}

	pub fn broadcast(&self) -> Ipv4Addr {
		self.broadcast
	}

	pub(crate) fn bind_device(&self, dev: &Arc<NetDevice>) {
		let _ = self.dev_index.set(dev.index());
	}

	pub(crate) fn device(&self, stack: &Netstack) -> Option<Arc<NetDevice>> {
		self.dev_index
			.get()
			.and_then(|&index| stack.device_by_index(index))
	}
}

#[derive(Clone)]
struct IpRoute {
	network: Ipv4Addr,
	netmask: Ipv4Addr,
	/// `0.0.0.0` means on-link: the packet destination is the next hop.
	nexthop: Ipv4Addr,
	iface: Arc<IpInterface>,
}

struct IpProtocol {
	protocol: u8,
	handler: IpProtocolHandler,
}

pub(crate) struct Ipv4Engine {
	ifaces: Mutex<Vec<Arc<IpInterface>>>,
	routes: Mutex<Vec<IpRoute>>,
	protocols: Mutex<Vec<IpProtocol>>,
	// Process-wide datagram id; a single shared counter behind its own lock.
	next_id: Mutex<u16>,
}

impl Ipv4Engine {
	pub(crate) fn new() -> Self {
		Self {
			ifaces: Mutex::new(Vec::new()),
			routes: Mutex::new(Vec::new()),
			protocols: Mutex::new(Vec::new()),
			next_id: Mutex::new(128),
		}
	}

	fn route_add(
		&self,
		network: Ipv4Addr,
		netmask: Ipv4Addr,
		nexthop: Ipv4Addr,
		iface: &Arc<IpInterface>,
	) {
		self.routes.lock().insert(
			0,
			IpRoute {
				network,
				netmask,
				nexthop,
				iface: Arc::clone(iface),
			},
		);
		info!(
			"route added: network={network}, netmask={netmask}, nexthop={nexthop}, iface={}",
			iface.unicast()
		);
	}

	/// Longest prefix match: among routes whose network covers `dst`, the
	/// one with the numerically largest netmask wins.
	fn route_lookup(&self, dst: Ipv4Addr) -> Option<IpRoute> {
		let routes = self.routes.lock();
		let mut candidate: Option<&IpRoute> = None;
		for route in routes.iter() {
			if u32::from(dst) & u32::from(route.netmask) == u32::from(route.network) {
				match candidate {
					Some(best) if u32::from(best.netmask) >= u32::from(route.netmask) => {}
					_ => candidate = Some(route),
				}
			}
		}
		candidate.cloned()
	}

	/// Register `iface` and its on-link route.
	pub(crate) fn register_iface(&self, iface: &Arc<IpInterface>) -> Result<()> {
		let network = Ipv4Addr::from(u32::from(iface.unicast()) & u32::from(iface.netmask()));
		self.route_add(network, iface.netmask(), Ipv4Addr::UNSPECIFIED, iface);
		self.ifaces.lock().insert(0, Arc::clone(iface));
		Ok(())
	}

	pub(crate) fn set_default_gateway(
		&self,
		iface: &Arc<IpInterface>,
		gateway: Ipv4Addr,
	) -> Result<()> {
		self.route_add(
			Ipv4Addr::UNSPECIFIED,
			Ipv4Addr::UNSPECIFIED,
			gateway,
			iface,
		);
		Ok(())
	}

	/// Interface reachable for `dst`, per the route table.
	pub(crate) fn route_get_iface(&self, dst: Ipv4Addr) -> Option<Arc<IpInterface>> {
		self.route_lookup(dst).map(|route| route.iface)
	}

	pub(crate) fn register_protocol(
		&self,
		protocol: u8,
		handler: IpProtocolHandler,
	) -> Result<()> {
		let mut protocols = self.protocols.lock();
		if protocols.iter().any(|entry| entry.protocol == protocol) {
			warn!("already exists, protocol={protocol}");
			return Err(Error::AlreadyExists);
		}
		protocols.insert(0, IpProtocol { protocol, handler });
		info!("protocol registered, protocol={protocol}");
		Ok(())
	}

	fn protocol_handler(&self, protocol: u8) -> Option<IpProtocolHandler> {
		self.protocols
			.lock()
			.iter()
			.find(|entry| entry.protocol == protocol)
			.map(|entry| entry.handler)
	}

	fn generate_id(&self) -> u16 {
		let mut next = self.next_id.lock();
		let id = *next;
		*next = next.wrapping_add(1);
		id
	}
}

/// Validate and demultiplex one IPv4 datagram from `dev`.
pub(crate) fn input(stack: &Netstack, data: &[u8], dev: &Arc<NetDevice>) {
	if data.len() < IP_HDR_SIZE_MIN {
		warn!("too short, dev={}, len={}", dev.name(), data.len());
		return;
	}
	let version = data[0] >> 4;
	if version != IP_VERSION_IPV4 {
		warn!("version error, dev={}, v={version}", dev.name());
		return;
	}
	let hlen = usize::from(data[0] & 0x0f) << 2;
	if hlen < IP_HDR_SIZE_MIN || data.len() < hlen {
		warn!("header length error, dev={}, hlen={hlen}", dev.name());
		return;
	}
	let total = usize::from(u16::from_be_bytes([data[2], data[3]]));
	if data.len() < total || total < hlen {
		warn!(
			"total length error, dev={}, len={}, total={total}",
			dev.name(),
			data.len()
		);
		return;
	}
	if checksum16(&data[..hlen], 0) != 0 {
		warn!("checksum error, dev={}", dev.name());
		return;
	}
	let offset = u16::from_be_bytes([data[6], data[7]]);
	if offset & 0x2000 != 0 || offset & 0x1fff != 0 {
		warn!("fragments are not supported, dev={}", dev.name());
		return;
	}
	let Some(iface) = dev.get_ip_iface() else {
		return;
	};
	let src = Ipv4Addr::from(<[u8; 4]>::try_from(&data[12..16]).unwrap_or([0; 4]));
	let dst = Ipv4Addr::from(<[u8; 4]>::try_from(&data[16..20]).unwrap_or([0; 4]));
	if dst != iface.unicast() && dst != iface.broadcast() && dst != Ipv4Addr::BROADCAST {
		// Addressed elsewhere.
		return;
	}
	let protocol = data[9];
	debug!(
		"dev={}, iface={}, protocol={protocol}, total={total}",
		dev.name(),
		iface.unicast()
	);
	if let Some(handler) = stack.ip.protocol_handler(protocol) {
		handler(stack, &data[hlen..total], src, dst, &iface);
	}
}

/// Resolve the next-hop hardware address and hand the datagram to the device.
fn output_device(
	stack: &Netstack,
	iface: &Arc<IpInterface>,
	data: &[u8],
	nexthop: Ipv4Addr,
) -> Result<()> {
	let dev = iface.device(stack).ok_or(Error::NotFound)?;
	let mut hwaddr = MacAddr::ANY;
	if dev.flags().contains(DeviceFlags::NEEDS_ARP) {
		if nexthop == iface.broadcast() || nexthop == Ipv4Addr::BROADCAST {
			hwaddr = dev.broadcast_hwaddr();
		} else {
			match arp::resolve(stack, iface, nexthop)? {
				Resolve::Found(addr) => hwaddr = addr,
				Resolve::Incomplete => return Err(Error::InProgress),
			}
		}
	}
	dev.output(stack, ETHER_TYPE_IP, data, hwaddr)
}

/// Build the header for one datagram and transmit it.
fn output_core(
	stack: &Netstack,
	iface: &Arc<IpInterface>,
	protocol: u8,
	payload: &[u8],
	src: Ipv4Addr,
	dst: Ipv4Addr,
	nexthop: Ipv4Addr,
	id: u16,
) -> Result<()> {
	let total = IP_HDR_SIZE_MIN + payload.len();
	let mut buf = Vec::with_capacity(total);
	buf.push((IP_VERSION_IPV4 << 4) | ((IP_HDR_SIZE_MIN as u8) >> 2));
	buf.push(0); // tos
	buf.extend_from_slice(&(total as u16).to_be_bytes());
	buf.extend_from_slice(&id.to_be_bytes());
	buf.extend_from_slice(&0u16.to_be_bytes()); // flags/offset
	buf.push(0xff); // ttl
	buf.push(protocol);
	buf.extend_from_slice(&0u16.to_be_bytes()); // checksum, filled below
	buf.extend_from_slice(&src.octets());
	buf.extend_from_slice(&dst.octets());
	let sum = checksum16(&buf[..IP_HDR_SIZE_MIN], 0);
	buf[10..12].copy_from_slice(&sum.to_be_bytes());
	buf.extend_from_slice(payload);
	debug!(
		"dev={}, dst={dst}, protocol={protocol}, len={total}",
		iface.device(stack).map(|d| d.name().to_string()).unwrap_or_default()
	);
	output_device(stack, iface, &buf, nexthop)
}

/// Route and emit one datagram, returning the payload length on success.
///
/// An unresolved next hop surfaces as [`Error::InProgress`]: the datagram is
/// dropped for this call while the ARP request is in flight.
pub(crate) fn output(
	stack: &Netstack,
	protocol: u8,
	payload: &[u8],
	src: Ipv4Addr,
	dst: Ipv4Addr,
) -> Result<usize> {
	if src == Ipv4Addr::UNSPECIFIED && dst == Ipv4Addr::BROADCAST {
		warn!("source address is required for broadcast addresses");
		return Err(Error::AddrNotAvail);
	}
	let Some(route) = stack.ip.route_lookup(dst) else {
		warn!("no route to host, addr={dst}");
		return Err(Error::NoRoute);
	};
	let iface = route.iface;
	if src != Ipv4Addr::UNSPECIFIED && src != iface.unicast() {
		warn!("unable to output with specified source address, addr={src}");
		return Err(Error::AddrNotAvail);
	}
	let nexthop = if route.nexthop != Ipv4Addr::UNSPECIFIED {
		route.nexthop
	} else {
		dst
	};
	let dev = iface.device(stack).ok_or(Error::NotFound)?;
	if dev.mtu() < IP_HDR_SIZE_MIN + payload.len() {
		warn!(
			"too long, dev={}, mtu={} < {}",
			dev.name(),
			dev.mtu(),
			IP_HDR_SIZE_MIN + payload.len()
		);
		return Err(Error::MessageTooLong);
	}
	let id = stack.ip.generate_id();
	output_core(
		stack,
		&iface,
		protocol,
		payload,
		iface.unicast(),
		dst,
		nexthop,
		id,
	)?;
	Ok(payload.len())
}

pub(crate) fn init(stack: &Arc<Netstack>) -> Result<()> {
	stack.register_protocol(ETHER_TYPE_IP, input)
}
