//! Full round trip through the loopback device: the output path feeds the
//! queue, the device IRQ drains it back into the ingress pipeline.

use tapstack::drivers::loopback;
use tapstack::{IpInterface, Netstack};

#[test]
fn udp_datagram_loops_back_to_the_sender() {
	let stack = Netstack::new().unwrap();
	let dev = loopback::init(&stack).unwrap();
	let iface = IpInterface::new("127.0.0.1".parse().unwrap(), "255.0.0.0".parse().unwrap());
	stack.ip_iface_register(&dev, iface).unwrap();
	stack.run().unwrap();

	let sock = stack.udp_open().unwrap();
	stack.udp_bind(sock, "127.0.0.1:7".parse().unwrap()).unwrap();
	let sent = stack
		.udp_sendto(sock, b"ping", "127.0.0.1:7".parse().unwrap())
		.unwrap();
	assert_eq!(sent, 4);

	let mut buf = [0u8; 64];
	let (len, foreign) = stack.udp_recvfrom(sock, &mut buf).unwrap();
	assert_eq!(len, 4);
	assert_eq!(&buf[..len], b"ping");
	assert_eq!(foreign, "127.0.0.1:7".parse().unwrap());

	stack.shutdown();
}

#[test]
fn short_receive_truncates_the_datagram() {
	let stack = Netstack::new().unwrap();
	let dev = loopback::init(&stack).unwrap();
	let iface = IpInterface::new("127.0.0.1".parse().unwrap(), "255.0.0.0".parse().unwrap());
	stack.ip_iface_register(&dev, iface).unwrap();
	stack.run().unwrap();

	let sock = stack.udp_open().unwrap();
	stack.udp_bind(sock, "127.0.0.1:7".parse().unwrap()).unwrap();
	stack
		.udp_sendto(sock, b"a longer payload", "127.0.0.1:7".parse().unwrap())
		.unwrap();

	let mut buf = [0u8; 4];
	let (len, _foreign) = stack.udp_recvfrom(sock, &mut buf).unwrap();
	assert_eq!(len, 4);
	assert_eq!(&buf, b"a lo");

	stack.shutdown();
}

#[test]
fn sockets_are_a_finite_resource() {
	let stack = Netstack::new().unwrap();
	let dev = loopback::init(&stack).unwrap();
	let iface = IpInterface::new("127.0.0.1".parse().unwrap(), "255.0.0.0".parse().unwrap());
	stack.ip_iface_register(&dev, iface).unwrap();
	stack.run().unwrap();

	let mut socks = Vec::new();
	while let Ok(sock) = stack.udp_open() {
		socks.push(sock);
		assert!(socks.len() <= 16, "table should hold 16 sockets");
	}
	assert_eq!(socks.len(), 16);
	stack.udp_close(socks[7]).unwrap();
	assert_eq!(stack.udp_open().unwrap(), socks[7]);

	stack.shutdown();
}

#[test]
fn wildcard_bind_reaches_itself_over_loopback() {
	let stack = Netstack::new().unwrap();
	let dev = loopback::init(&stack).unwrap();
	let iface = IpInterface::new("127.0.0.1".parse().unwrap(), "255.0.0.0".parse().unwrap());
	stack.ip_iface_register(&dev, iface).unwrap();
	stack.run().unwrap();

	// Loopback is not an ethernet device, so the output path skips ARP and
	// the datagram must come back unchanged.
	let sock = stack.udp_open().unwrap();
	stack.udp_bind(sock, "0.0.0.0:9".parse().unwrap()).unwrap();
	stack
		.udp_sendto(sock, b"x", "127.0.0.1:9".parse().unwrap())
		.unwrap();
	let mut buf = [0u8; 8];
	let (len, foreign) = stack.udp_recvfrom(sock, &mut buf).unwrap();
	assert_eq!(len, 1);
	// Local address selection filled in the loopback unicast.
	assert_eq!(foreign, "127.0.0.1:9".parse().unwrap());

	stack.shutdown();
}
