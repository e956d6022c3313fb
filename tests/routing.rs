//! Multi-host forwarding: longest-prefix match, TTL expiry and unreachables.

use simnet::apps::ping::{ping, traceroute};
use simnet::iface::route::RouteTable;
use simnet::{EchoOptions, Host, InterfaceConfig, NetError, NetworkAddress, RouteDevice, VirtualNetwork};
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn v4(a: u8, b: u8, c: u8, d: u8) -> NetworkAddress {
    NetworkAddress::v4(a, b, c, d)
}

/// a (10.0.1.2) -- router (10.0.1.1 | 10.0.2.1) -- b (10.0.2.2)
fn line() -> (VirtualNetwork, Host, Host, Host) {
    let net = VirtualNetwork::new();
    let left = net.add_segment("left");
    let right = net.add_segment("right");
    let a = net.add_host("a");
    let router = net.add_host("router");
    let b = net.add_host("b");

    let a0 = a.add_interface("eth0", left).unwrap();
    let r0 = router.add_interface("eth0", left).unwrap();
    let r1 = router.add_interface("eth1", right).unwrap();
    let b0 = b.add_interface("eth0", right).unwrap();
    a.configure_interface(a0, InterfaceConfig::new(v4(10, 0, 1, 2), 24)).unwrap();
    router.configure_interface(r0, InterfaceConfig::new(v4(10, 0, 1, 1), 24)).unwrap();
    router.configure_interface(r1, InterfaceConfig::new(v4(10, 0, 2, 1), 24)).unwrap();
    b.configure_interface(b0, InterfaceConfig::new(v4(10, 0, 2, 2), 24)).unwrap();
    router.set_forwarding(true);
    a.add_route(NetworkAddress::UNSPECIFIED_V4, 0, RouteDevice::Interface(a0), Some(v4(10, 0, 1, 1)))
        .unwrap();
    b.add_route(NetworkAddress::UNSPECIFIED_V4, 0, RouteDevice::Interface(b0), Some(v4(10, 0, 2, 1)))
        .unwrap();
    (net, a, router, b)
}

#[test]
fn test_longest_prefix_match() {
    init();
    let mut table = RouteTable::new();
    table.add(v4(0, 0, 0, 0), 0, RouteDevice::Interface(0), Some(v4(192, 168, 0, 1))).unwrap();
    table.add(v4(10, 0, 0, 0), 8, RouteDevice::Interface(0), Some(v4(192, 168, 0, 2))).unwrap();
    table.add(v4(10, 1, 0, 0), 16, RouteDevice::Interface(1), Some(v4(192, 168, 0, 3))).unwrap();
    table.add(v4(10, 1, 2, 0), 24, RouteDevice::Interface(1), None).unwrap();

    let hop = |dst| table.lookup(&dst, |_| true).map(|m| m.next_hop);
    assert_eq!(hop(v4(10, 1, 2, 3)), Some(v4(10, 1, 2, 3)));
    assert_eq!(hop(v4(10, 1, 9, 9)), Some(v4(192, 168, 0, 3)));
    assert_eq!(hop(v4(10, 9, 9, 9)), Some(v4(192, 168, 0, 2)));
    assert_eq!(hop(v4(8, 8, 8, 8)), Some(v4(192, 168, 0, 1)));

    // Routes on an unusable device are skipped.
    let skipped = table.lookup(&v4(10, 1, 2, 3), |d| d != RouteDevice::Interface(1)).unwrap();
    assert_eq!(skipped.prefix_len, 8);

    // Families never match each other.
    assert!(table.lookup(&NetworkAddress::V6([0; 16]), |_| true).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_ping_through_router() {
    init();
    let (_net, a, _router, b) = line();
    let report = ping(&a, v4(10, 0, 2, 2), 3, Duration::from_secs(1)).await.unwrap();
    assert_eq!(report.received(), 3);
    let Ok(reply) = &report.results[0].1 else {
        panic!("no reply: {:?}", report);
    };
    assert_eq!(reply.ttl, 63);
    assert_eq!(reply.from, Some(v4(10, 0, 2, 2)));

    let reply = b.icmp_echo(v4(10, 0, 1, 2), EchoOptions::default()).await.unwrap();
    assert!(reply.reached);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_reports_router_ingress() {
    init();
    let (_net, a, _router, _b) = line();
    let options = EchoOptions {
        ttl: Some(1),
        ..EchoOptions::default()
    };
    let reply = a.icmp_echo(v4(10, 0, 2, 2), options).await.unwrap();
    assert!(!reply.reached);
    assert_eq!(reply.from, Some(v4(10, 0, 1, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_traceroute_lists_each_hop() {
    init();
    let (_net, a, _router, _b) = line();
    let trace = traceroute(&a, v4(10, 0, 2, 2), 8, Duration::from_secs(1)).await.unwrap();
    assert!(trace.reached);
    let hops: Vec<_> = trace.hops.iter().map(|h| h.from).collect();
    assert_eq!(hops, vec![Some(v4(10, 0, 1, 1)), Some(v4(10, 0, 2, 2))]);
    assert!(trace.to_string().starts_with("traceroute to 10.0.2.2"));
}

#[tokio::test(start_paused = true)]
async fn test_router_without_route_sends_unreachable() {
    init();
    let (_net, a, _router, _b) = line();
    assert_eq!(
        a.icmp_echo(v4(172, 16, 0, 1), EchoOptions::default()).await,
        Err(NetError::NoRoute)
    );
}

#[tokio::test(start_paused = true)]
async fn test_tcp_connect_fails_fast_on_unreachable() {
    init();
    let (_net, a, _router, _b) = line();
    let started = tokio::time::Instant::now();
    let result = a.connect_tcp_conn(v4(172, 16, 0, 1), 80).await;
    assert!(matches!(result, Err(NetError::NoRoute)), "{:?}", result.map(|c| c.id()));
    assert!(started.elapsed() < Duration::from_millis(1));
    assert!(a.tcp_connections().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_non_forwarding_host_drops_transit() {
    init();
    let (_net, a, router, _b) = line();
    router.set_forwarding(false);
    assert_eq!(
        a.icmp_echo(v4(10, 0, 2, 2), EchoOptions::default()).await,
        Err(NetError::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_link_down_removes_routes_from_lookup() {
    init();
    let (_net, a, _router, _b) = line();
    a.set_link_state(0, false).unwrap();
    assert_eq!(a.route_get(v4(10, 0, 2, 2)), Err(NetError::NoRoute));
    assert_eq!(
        a.icmp_echo(v4(10, 0, 2, 2), EchoOptions::default()).await,
        Err(NetError::NoRoute)
    );
    a.set_link_state(0, true).unwrap();
    assert_eq!(a.route_get(v4(10, 0, 2, 2)).unwrap().next_hop, v4(10, 0, 1, 1));
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_purges_stale_arp() {
    init();
    let (_net, a, router, _b) = line();
    a.icmp_echo(v4(10, 0, 1, 1), EchoOptions::default()).await.unwrap();
    assert!(router.arp_table().iter().any(|e| e.address == v4(10, 0, 1, 2)));

    a.configure_interface(0, InterfaceConfig::new(v4(10, 0, 1, 20), 24)).unwrap();
    assert!(!router.arp_table().iter().any(|e| e.address == v4(10, 0, 1, 2)));
    a.icmp_echo(v4(10, 0, 1, 1), EchoOptions::default()).await.unwrap();
    assert!(router.arp_table().iter().any(|e| e.address == v4(10, 0, 1, 20)));
}
