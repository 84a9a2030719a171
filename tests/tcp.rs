//! TCP passive open, data transfer and reset behavior.

mod common;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use tapstack::{input_frame, IpInterface, NetDevice, Netstack};

const DEV_HW: &str = "11:22:33:44:55:66";
const HOST_HW: &str = "aa:bb:cc:dd:ee:ff";

const PEER: &str = "192.0.2.1";
const PEER_PORT: u16 = 54321;

fn setup() -> (Arc<Netstack>, Arc<NetDevice>, Arc<Captured>) {
	let stack = Netstack::new().unwrap();
	let (dev, captured) = test_device(&stack, DEV_HW);
	let iface = IpInterface::new(
		"192.0.2.2".parse().unwrap(),
		"255.255.255.0".parse().unwrap(),
	);
	stack.ip_iface_register(&dev, iface).unwrap();
	stack.run().unwrap();
	stack.arp_add_static(PEER.parse().unwrap(), HOST_HW.parse().unwrap());
	(stack, dev, captured)
}

fn inject_tcp(
	stack: &Arc<Netstack>,
	dev: &Arc<NetDevice>,
	seq: u32,
	ack: u32,
	flags: u8,
	wnd: u16,
	payload: &[u8],
) {
	let src: Ipv4Addr = PEER.parse().unwrap();
	let dst: Ipv4Addr = "192.0.2.2".parse().unwrap();
	let seg = tcp_segment(src, dst, PEER_PORT, 7, seq, ack, flags, wnd, payload);
	let packet = ipv4_packet(6, src, dst, &seg);
	input_frame(
		stack,
		dev,
		&ether_frame(
			DEV_HW.parse().unwrap(),
			HOST_HW.parse().unwrap(),
			ETHER_TYPE_IP,
			&packet,
		),
	);
}

fn tcp_flags(segment: &[u8]) -> u8 {
	segment[13] & 0x3f
}

fn tcp_seq(segment: &[u8]) -> u32 {
	u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]])
}

fn tcp_ack(segment: &[u8]) -> u32 {
	u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]])
}

#[test]
fn passive_handshake_data_and_close() {
	let (stack, dev, captured) = setup();

	let opener = {
		let stack = Arc::clone(&stack);
		thread::spawn(move || stack.tcp_open_rfc793("0.0.0.0:7".parse().unwrap(), None, false))
	};
	// Let the opener reach LISTEN before the SYN lands.
	thread::sleep(Duration::from_millis(200));

	inject_tcp(&stack, &dev, 1000, 0, TCP_SYN, 8192, &[]);

	let frames = captured.wait_for(1, Duration::from_secs(2));
	let synack = ip_payload(&frames[0]);
	assert_eq!(tcp_flags(synack), TCP_SYN | TCP_ACK);
	assert_eq!(tcp_ack(synack), 1001);
	assert_eq!(u16::from_be_bytes([synack[0], synack[1]]), 7);
	assert_eq!(u16::from_be_bytes([synack[2], synack[3]]), PEER_PORT);
	assert_eq!(u16::from_be_bytes([synack[14], synack[15]]), 65535); // window
	let iss = tcp_seq(synack);

	inject_tcp(&stack, &dev, 1001, iss.wrapping_add(1), TCP_ACK, 8192, &[]);
	let sock = opener.join().unwrap().unwrap();

	// A receiver blocks until payload arrives.
	let receiver = {
		let stack = Arc::clone(&stack);
		thread::spawn(move || {
			let mut buf = [0u8; 32];
			let len = stack.tcp_receive(sock, &mut buf).unwrap();
			buf[..len].to_vec()
		})
	};
	thread::sleep(Duration::from_millis(100));

	inject_tcp(
		&stack,
		&dev,
		1001,
		iss.wrapping_add(1),
		TCP_ACK | TCP_PSH,
		8192,
		b"abc",
	);
	assert_eq!(receiver.join().unwrap(), b"abc");

	// The payload was acknowledged cumulatively.
	let frames = captured.wait_for(2, Duration::from_secs(2));
	let ack = ip_payload(&frames[1]);
	assert_eq!(tcp_flags(ack), TCP_ACK);
	assert_eq!(tcp_ack(ack), 1004);

	// Send segments out of the established connection.
	let sent = stack.tcp_send(sock, b"hello").unwrap();
	assert_eq!(sent, 5);
	let frames = captured.wait_for(3, Duration::from_secs(2));
	let data = ip_payload(&frames[2]);
	assert_eq!(tcp_flags(data), TCP_ACK | TCP_PSH);
	assert_eq!(tcp_seq(data), iss.wrapping_add(1));
	assert_eq!(&data[20..], b"hello");

	// Close aborts with an RST past the sent data.
	stack.tcp_close(sock).unwrap();
	let frames = captured.wait_for(4, Duration::from_secs(2));
	let rst = ip_payload(&frames[3]);
	assert_eq!(tcp_flags(rst), TCP_RST);
	assert_eq!(tcp_seq(rst), iss.wrapping_add(6));

	stack.shutdown();
}

#[test]
fn syn_to_a_closed_port_is_reset() {
	let (stack, dev, captured) = setup();

	let src: Ipv4Addr = PEER.parse().unwrap();
	let dst: Ipv4Addr = "192.0.2.2".parse().unwrap();
	let seg = tcp_segment(src, dst, PEER_PORT, 99, 1000, 0, TCP_SYN, 8192, &[]);
	let packet = ipv4_packet(6, src, dst, &seg);
	input_frame(
		&stack,
		&dev,
		&ether_frame(
			DEV_HW.parse().unwrap(),
			HOST_HW.parse().unwrap(),
			ETHER_TYPE_IP,
			&packet,
		),
	);

	let frames = captured.wait_for(1, Duration::from_secs(2));
	let rst = ip_payload(&frames[0]);
	assert_eq!(tcp_flags(rst), TCP_RST | TCP_ACK);
	assert_eq!(tcp_seq(rst), 0);
	// The SYN occupies one sequence number.
	assert_eq!(tcp_ack(rst), 1001);

	stack.shutdown();
}

#[test]
fn ack_to_a_closed_port_is_reset_at_the_ack() {
	let (stack, dev, captured) = setup();

	let src: Ipv4Addr = PEER.parse().unwrap();
	let dst: Ipv4Addr = "192.0.2.2".parse().unwrap();
	let seg = tcp_segment(src, dst, PEER_PORT, 99, 1000, 4242, TCP_ACK, 8192, &[]);
	let packet = ipv4_packet(6, src, dst, &seg);
	input_frame(
		&stack,
		&dev,
		&ether_frame(
			DEV_HW.parse().unwrap(),
			HOST_HW.parse().unwrap(),
			ETHER_TYPE_IP,
			&packet,
		),
	);

	let frames = captured.wait_for(1, Duration::from_secs(2));
	let rst = ip_payload(&frames[0]);
	assert_eq!(tcp_flags(rst), TCP_RST);
	assert_eq!(tcp_seq(rst), 4242);
	assert_eq!(tcp_ack(rst), 0);

	stack.shutdown();
}

#[test]
fn out_of_window_segment_gets_a_plain_ack() {
	let (stack, dev, captured) = setup();

	let opener = {
		let stack = Arc::clone(&stack);
		thread::spawn(move || stack.tcp_open_rfc793("0.0.0.0:7".parse().unwrap(), None, false))
	};
	thread::sleep(Duration::from_millis(200));

	inject_tcp(&stack, &dev, 1000, 0, TCP_SYN, 8192, &[]);
	let frames = captured.wait_for(1, Duration::from_secs(2));
	let iss = tcp_seq(ip_payload(&frames[0]));
	inject_tcp(&stack, &dev, 1001, iss.wrapping_add(1), TCP_ACK, 8192, &[]);
	let sock = opener.join().unwrap().unwrap();

	// Far beyond the receive window: expect a bare ACK, no delivery.
	inject_tcp(
		&stack,
		&dev,
		200_000,
		iss.wrapping_add(1),
		TCP_ACK | TCP_PSH,
		8192,
		b"zzz",
	);
	let frames = captured.wait_for(2, Duration::from_secs(2));
	let ack = ip_payload(&frames[1]);
	assert_eq!(tcp_flags(ack), TCP_ACK);
	assert_eq!(tcp_ack(ack), 1001);

	stack.tcp_close(sock).unwrap();
	stack.shutdown();
}

#[test]
fn active_open_is_not_supported() {
	let (stack, _dev, _captured) = setup();
	assert!(stack
		.tcp_open_rfc793(
			"192.0.2.2:4000".parse().unwrap(),
			Some("192.0.2.1:7".parse().unwrap()),
			true,
		)
		.is_err());
	stack.shutdown();
}
