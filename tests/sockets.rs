//! Socket multiplexer behaviour across hosts.

use simnet::{Host, InterfaceConfig, NetError, NetworkAddress, StackConfig, VirtualNetwork};
use std::time::Duration;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const A: NetworkAddress = NetworkAddress::v4(10, 0, 0, 1);
const B: NetworkAddress = NetworkAddress::v4(10, 0, 0, 2);
const ANY: NetworkAddress = NetworkAddress::UNSPECIFIED_V4;

fn lan_with(config: StackConfig) -> (VirtualNetwork, Host, Host) {
    let net = VirtualNetwork::with_config(config).unwrap();
    let seg = net.add_segment("lan");
    let a = net.add_host("a");
    let b = net.add_host("b");
    let ia = a.add_interface("eth0", seg).unwrap();
    let ib = b.add_interface("eth0", seg).unwrap();
    a.configure_interface(ia, InterfaceConfig::new(A, 24)).unwrap();
    b.configure_interface(ib, InterfaceConfig::new(B, 24)).unwrap();
    (net, a, b)
}

fn lan() -> (VirtualNetwork, Host, Host) {
    lan_with(StackConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_udp_datagrams_arrive_in_order() {
    init();
    let (_net, a, b) = lan();
    let server = b.open_udp_socket(ANY, 5000).unwrap();
    let client = a.open_udp_socket(A, 0).unwrap();
    for payload in [&b"one"[..], b"two", b"three"] {
        a.send_udp_socket(client, B, 5000, payload).unwrap();
    }
    let mut received = Vec::new();
    for _ in 0..3 {
        let datagram = b.recv_udp_socket(server).await.unwrap().unwrap();
        assert_eq!(datagram.src_addr, A);
        received.push(datagram.payload);
    }
    assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_udp_queue_tail_drops() {
    init();
    let config = StackConfig {
        udp_queue_limit: 2,
        ..StackConfig::default()
    };
    let (_net, a, b) = lan_with(config);
    let server = b.open_udp_socket(ANY, 5000).unwrap();
    let client = a.open_udp_socket(ANY, 0).unwrap();
    for n in 0u8..3 {
        a.send_udp_socket(client, B, 5000, &[n]).unwrap();
    }
    assert_eq!(b.recv_udp_socket(server).await.unwrap().unwrap().payload, vec![0]);
    assert_eq!(b.recv_udp_socket(server).await.unwrap().unwrap().payload, vec![1]);
    assert_eq!(
        b.recv_udp_socket_timeout(server, Duration::from_millis(50)).await,
        Err(NetError::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn test_udp_broadcast_reaches_every_listener() {
    init();
    let (net, a, b) = lan();
    let c = net.add_host("c");
    let ic = c.add_interface("eth0", net.segments()[0].0).unwrap();
    c.configure_interface(ic, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 3), 24)).unwrap();

    let on_b = b.open_udp_socket(ANY, 9).unwrap();
    let on_c = c.open_udp_socket(ANY, 9).unwrap();
    let client = a.open_udp_socket(ANY, 0).unwrap();
    a.send_udp_socket(client, NetworkAddress::BROADCAST_V4, 9, b"hi all").unwrap();
    a.send_udp_socket(client, NetworkAddress::v4(10, 0, 0, 255), 9, b"hi subnet").unwrap();
    for (host, socket) in [(&b, on_b), (&c, on_c)] {
        assert_eq!(host.recv_udp_socket(socket).await.unwrap().unwrap().payload, b"hi all");
        assert_eq!(host.recv_udp_socket(socket).await.unwrap().unwrap().payload, b"hi subnet");
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_wakes_pending_receivers() {
    init();
    let (_net, a, b) = lan();
    let socket = b.open_udp_socket(ANY, 5000).unwrap();
    let listener = a.open_tcp_server_socket(ANY, 80).unwrap();

    let (hb, ha) = (b.clone(), a.clone());
    let recv = tokio::spawn(async move { hb.recv_udp_socket(socket).await });
    let accept = tokio::spawn(async move { ha.accept_tcp_conn(listener).await });
    tokio::task::yield_now().await;

    b.close_udp_socket(socket).unwrap();
    a.close_tcp_listener(listener).unwrap();
    assert_eq!(recv.await.unwrap(), Ok(None));
    assert_eq!(accept.await.unwrap(), Ok(None));

    // The port is free again.
    b.open_udp_socket(ANY, 5000).unwrap();
    a.open_tcp_server_socket(ANY, 80).unwrap();
}

/// Poll `fut` until it parks, then return without completing it.
async fn park<F: std::future::Future + Unpin>(fut: &mut F) {
    tokio::select! {
        biased;
        _ = fut => panic!("future completed before anything was sent"),
        _ = tokio::task::yield_now() => {}
    }
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_receive_keeps_its_datagram() {
    init();
    let (_net, a, b) = lan();
    let server = b.open_udp_socket(ANY, 5000).unwrap();
    let client = a.open_udp_socket(A, 0).unwrap();

    let mut recv = Box::pin(b.recv_udp_socket(server));
    park(&mut recv).await;
    a.send_udp_socket(client, B, 5000, b"first").unwrap();
    a.send_udp_socket(client, B, 5000, b"second").unwrap();
    drop(recv);

    let next = b.recv_udp_socket_timeout(server, Duration::from_millis(10)).await.unwrap();
    assert_eq!(next.unwrap().payload, b"first");
    let next = b.recv_udp_socket_timeout(server, Duration::from_millis(10)).await.unwrap();
    assert_eq!(next.unwrap().payload, b"second");
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_accept_keeps_its_connection() {
    init();
    let (_net, a, b) = lan();
    let listener = b.open_tcp_server_socket(ANY, 80).unwrap();

    let mut accept = Box::pin(b.accept_tcp_conn(listener));
    park(&mut accept).await;
    let client = a.connect_tcp_conn(B, 80).await.unwrap();
    drop(accept);

    let conn = b
        .accept_tcp_conn_timeout(listener, Duration::from_millis(10))
        .await
        .unwrap()
        .expect("connection was requeued");
    a.send_tcp_conn(client, b"hi").unwrap();
    let data = b.recv_tcp_conn_timeout(conn, Duration::from_millis(10)).await.unwrap();
    assert_eq!(data.as_deref(), Some(&b"hi"[..]));
}

#[tokio::test(start_paused = true)]
async fn test_accept_returns_connections_in_arrival_order() {
    init();
    let (_net, a, b) = lan();
    let listener = b.open_tcp_server_socket(ANY, 8080).unwrap();
    let mut clients = Vec::new();
    for tag in [1u8, 2, 3] {
        let conn = a.connect_tcp_conn(B, 8080).await.unwrap();
        a.send_tcp_conn(conn, &[tag]).unwrap();
        clients.push(conn);
    }
    assert_eq!(b.tcp_listeners()[0].pending, 3);

    for tag in [1u8, 2, 3] {
        let conn = b.accept_tcp_conn(listener).await.unwrap().unwrap();
        assert_eq!(b.recv_tcp_conn(conn).await.unwrap(), Some(vec![tag]));
    }
    assert_eq!(a.tcp_connections().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backlog_overflow_drops_syn() {
    init();
    let config = StackConfig {
        tcp_backlog: 1,
        ..StackConfig::default()
    };
    let (_net, a, b) = lan_with(config);
    let _listener = b.open_tcp_server_socket(ANY, 8080).unwrap();
    a.connect_tcp_conn(B, 8080).await.unwrap();
    assert_eq!(
        a.connect_tcp_conn_timeout(B, 8080, Duration::from_millis(300)).await,
        Err(NetError::Timeout)
    );
    assert_eq!(a.tcp_connections().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_large_send_is_segmented() {
    init();
    let (_net, a, b) = lan();
    let listener = b.open_tcp_server_socket(ANY, 9000).unwrap();
    let client = a.connect_tcp_conn(B, 9000).await.unwrap();
    let server = b.accept_tcp_conn(listener).await.unwrap().unwrap();

    let data: Vec<u8> = (0..4000u32).map(|n| n as u8).collect();
    a.send_tcp_conn(client, &data).unwrap();
    let mut received = Vec::new();
    while received.len() < data.len() {
        let chunk = b.recv_tcp_conn(server).await.unwrap().unwrap();
        assert!(chunk.len() <= 1460);
        received.extend(chunk);
    }
    assert_eq!(received, data);
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_then_end_of_stream() {
    init();
    let (_net, a, b) = lan();
    let listener = b.open_tcp_server_socket(ANY, 9000).unwrap();
    let client = a.connect_tcp_conn(B, 9000).await.unwrap();
    let server = b.accept_tcp_conn(listener).await.unwrap().unwrap();

    a.send_tcp_conn(client, b"last words").unwrap();
    a.close_tcp_conn(client).unwrap();
    assert_eq!(b.recv_tcp_conn(server).await.unwrap(), Some(b"last words".to_vec()));
    assert_eq!(b.recv_tcp_conn(server).await.unwrap(), None);
    assert_eq!(a.send_tcp_conn(client, b"x"), Err(NetError::UseOfClosedSocket));
}

#[test]
fn test_ephemeral_ports_exhaust() {
    init();
    let config = StackConfig {
        ephemeral_port_start: 50000,
        ephemeral_port_end: 50001,
        ..StackConfig::default()
    };
    let (_net, a, _b) = lan_with(config);
    let first = a.open_udp_socket(ANY, 0).unwrap();
    a.open_udp_socket(ANY, 0).unwrap();
    assert_eq!(a.open_udp_socket(ANY, 0), Err(NetError::PortsExhausted));
    a.close_udp_socket(first).unwrap();
    a.open_udp_socket(ANY, 0).unwrap();
}

#[test]
fn test_socket_listings() {
    init();
    let (_net, a, _b) = lan();
    a.open_udp_socket(ANY, 53).unwrap();
    a.open_tcp_server_socket(A, 80).unwrap();
    let udp = a.udp_sockets();
    assert_eq!(udp.len(), 1);
    assert!(udp[0].to_string().contains("*:53"));
    assert!(a.tcp_listeners()[0].to_string().contains("10.0.0.1:80"));
}
