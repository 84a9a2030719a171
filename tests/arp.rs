//! ARP resolver behavior observed at the frame level.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tapstack::{input_frame, Error, IpInterface, MacAddr, NetDevice, Netstack};

const DEV_HW: &str = "11:22:33:44:55:66";
const HOST_HW: &str = "aa:bb:cc:dd:ee:ff";

fn setup() -> (Arc<Netstack>, Arc<NetDevice>, Arc<Captured>) {
	let stack = Netstack::new().unwrap();
	let (dev, captured) = test_device(&stack, DEV_HW);
	let iface = IpInterface::new(
		"192.0.2.2".parse().unwrap(),
		"255.255.255.0".parse().unwrap(),
	);
	stack.ip_iface_register(&dev, iface).unwrap();
	stack.run().unwrap();
	(stack, dev, captured)
}

#[test]
fn request_for_our_address_earns_a_reply() {
	let (stack, dev, captured) = setup();
	let host_hw: MacAddr = HOST_HW.parse().unwrap();

	let request = arp_message(
		1,
		host_hw,
		"192.0.2.1".parse().unwrap(),
		MacAddr::ANY,
		"192.0.2.2".parse().unwrap(),
	);
	input_frame(
		&stack,
		&dev,
		&ether_frame(MacAddr::BROADCAST, host_hw, ETHER_TYPE_ARP, &request),
	);

	let frames = captured.wait_for(1, Duration::from_secs(2));
	let reply = &frames[0];
	assert_eq!(frame_ethertype(reply), ETHER_TYPE_ARP);
	assert_eq!(frame_dst(reply), host_hw);
	assert_eq!(frame_src(reply), DEV_HW.parse().unwrap());

	let msg = frame_payload(reply);
	assert_eq!(u16::from_be_bytes([msg[0], msg[1]]), 1); // htype
	assert_eq!(u16::from_be_bytes([msg[2], msg[3]]), 0x0800); // ptype
	assert_eq!((msg[4], msg[5]), (6, 4));
	assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 2); // reply opcode
	assert_eq!(&msg[8..14], DEV_HW.parse::<MacAddr>().unwrap().as_bytes());
	assert_eq!(&msg[14..18], &[192, 0, 2, 2]);
	assert_eq!(&msg[18..24], host_hw.as_bytes());
	assert_eq!(&msg[24..28], &[192, 0, 2, 1]);

	// The exchange left a RESOLVED entry behind: an immediate send to the
	// requestor goes straight out as IP, no resolution round trip.
	let sock = stack.udp_open().unwrap();
	stack
		.udp_sendto(sock, b"x", "192.0.2.1:9".parse().unwrap())
		.unwrap();
	let frames = captured.wait_for(2, Duration::from_secs(2));
	assert_eq!(frame_ethertype(&frames[1]), ETHER_TYPE_IP);
	assert_eq!(frame_dst(&frames[1]), host_hw);

	stack.shutdown();
}

#[test]
fn unresolved_nexthop_broadcasts_a_request() {
	let (stack, _dev, captured) = setup();

	let sock = stack.udp_open().unwrap();
	let err = stack
		.udp_sendto(sock, b"x", "192.0.2.1:9".parse().unwrap())
		.unwrap_err();
	assert!(matches!(err, Error::InProgress));

	let frames = captured.wait_for(1, Duration::from_secs(2));
	let request = &frames[0];
	assert_eq!(frame_ethertype(request), ETHER_TYPE_ARP);
	assert!(frame_dst(request).is_broadcast());
	let msg = frame_payload(request);
	assert_eq!(u16::from_be_bytes([msg[6], msg[7]]), 1); // request opcode
	assert_eq!(&msg[8..14], DEV_HW.parse::<MacAddr>().unwrap().as_bytes());
	assert_eq!(&msg[14..18], &[192, 0, 2, 2]);
	assert_eq!(&msg[18..24], MacAddr::ANY.as_bytes());
	assert_eq!(&msg[24..28], &[192, 0, 2, 1]);

	stack.shutdown();
}

#[test]
fn reply_fills_the_pending_entry() {
	let (stack, dev, captured) = setup();
	let host_hw: MacAddr = HOST_HW.parse().unwrap();

	let sock = stack.udp_open().unwrap();
	let foreign = "192.0.2.1:9".parse().unwrap();
	assert!(matches!(
		stack.udp_sendto(sock, b"x", foreign),
		Err(Error::InProgress)
	));
	captured.wait_for(1, Duration::from_secs(2));

	// Feed the answer in; the INCOMPLETE entry becomes RESOLVED and the
	// retry succeeds without another request.
	let reply = arp_message(
		2,
		host_hw,
		"192.0.2.1".parse().unwrap(),
		DEV_HW.parse().unwrap(),
		"192.0.2.2".parse().unwrap(),
	);
	input_frame(
		&stack,
		&dev,
		&ether_frame(DEV_HW.parse().unwrap(), host_hw, ETHER_TYPE_ARP, &reply),
	);
	// Wait until the reply has been processed by retrying the send.
	let deadline = std::time::Instant::now() + Duration::from_secs(2);
	loop {
		match stack.udp_sendto(sock, b"x", foreign) {
			Ok(_) => break,
			Err(Error::InProgress) if std::time::Instant::now() < deadline => {
				std::thread::sleep(Duration::from_millis(10));
			}
			Err(err) => panic!("unexpected error: {err}"),
		}
	}
	let frames = captured.wait_for(2, Duration::from_secs(2));
	let last = frames.last().unwrap();
	assert_eq!(frame_ethertype(last), ETHER_TYPE_IP);
	assert_eq!(frame_dst(last), host_hw);

	stack.shutdown();
}
