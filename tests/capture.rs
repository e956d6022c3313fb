//! pcap export of interface frame logs.

use simnet::capture::{read_capture, PCAP_MAGIC};
use simnet::network::ethernet::{EthernetHeader, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use simnet::{CaptureConfig, EchoOptions, InterfaceConfig, NetworkAddress, StackConfig, VirtualNetwork};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ethertypes(frames: &[simnet::CapturedFrame]) -> Vec<u16> {
    frames
        .iter()
        .map(|f| EthernetHeader::from_bytes(&f.data).unwrap().ethertype)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_ping_capture_round_trips() {
    init();
    let net = VirtualNetwork::new();
    let seg = net.add_segment("lan");
    let a = net.add_host("a");
    let b = net.add_host("b");
    let ia = a.add_interface("eth0", seg).unwrap();
    let ib = b.add_interface("eth0", seg).unwrap();
    a.configure_interface(ia, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 1), 24)).unwrap();
    b.configure_interface(ib, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 2), 24)).unwrap();

    a.icmp_echo(NetworkAddress::v4(10, 0, 0, 2), EchoOptions::default()).await.unwrap();

    let bytes = a.export_capture(ia).unwrap();
    let (header, frames) = read_capture(&bytes).unwrap();
    assert_eq!(header.magic, PCAP_MAGIC);
    assert_eq!(header.snaplen, 65535);
    assert_eq!(header.link_type, 1);
    assert_eq!(
        ethertypes(&frames),
        vec![ETHERTYPE_ARP, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV4]
    );
    assert_eq!(frames, a.captures(ia).unwrap());

    // Exporting does not drain the log.
    assert_eq!(a.export_capture(ia).unwrap(), bytes);

    // The peer saw the same four frames.
    assert_eq!(b.captures(ib).unwrap().len(), 4);
    assert_eq!(a.interfaces()[0].frames_captured, 4);
}

#[test]
fn test_capture_config_is_honoured() {
    init();
    let config = StackConfig {
        capture: CaptureConfig {
            snaplen: 1514,
            link_type: 1,
        },
        ..StackConfig::default()
    };
    let net = VirtualNetwork::with_config(config).unwrap();
    let seg = net.add_segment("lan");
    let host = net.add_host("a");
    let index = host.add_interface("eth0", seg).unwrap();
    let (header, frames) = read_capture(&host.export_capture(index).unwrap()).unwrap();
    assert_eq!(header.snaplen, 1514);
    assert!(frames.is_empty());
    assert!(host.export_capture(7).is_err());
}
