//! Two hosts on one segment: a UDP echo server and a client.
//!
//! Run with `RUST_LOG=debug cargo run --example udp_echo` to watch ARP and
//! socket events.

use simnet::apps::echo::{UdpEchoServer, ECHO_PORT};
use simnet::{InterfaceConfig, NetworkAddress, VirtualNetwork};
use std::time::Duration;

#[tokio::main(flavor = "current_thread")]
async fn main() -> simnet::Result<()> {
    env_logger::init();

    let net = VirtualNetwork::new();
    let lan = net.add_segment("lan");
    let server = net.add_host("server");
    let client = net.add_host("client");

    let s0 = server.add_interface("eth0", lan)?;
    let c0 = client.add_interface("eth0", lan)?;
    server.configure_interface(s0, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 1), 24))?;
    client.configure_interface(c0, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 2), 24))?;

    let echo = UdpEchoServer::bind(server.clone(), NetworkAddress::UNSPECIFIED_V4, ECHO_PORT)?;
    let echo_socket = echo.socket();
    let task = tokio::spawn(async move { echo.serve().await });

    let socket = client.open_udp_socket(NetworkAddress::UNSPECIFIED_V4, 0)?;
    for line in ["hello", "simulated", "world"] {
        client.send_udp_socket(socket, NetworkAddress::v4(10, 0, 0, 1), ECHO_PORT, line.as_bytes())?;
        match client.recv_udp_socket_timeout(socket, Duration::from_secs(1)).await? {
            Some(reply) => println!(
                "{}:{} -> {}",
                reply.src_addr,
                reply.src_port,
                String::from_utf8_lossy(&reply.payload)
            ),
            None => break,
        }
    }

    client.close_udp_socket(socket)?;
    server.close_udp_socket(echo_socket)?;
    if let Ok(Ok(count)) = task.await {
        println!("server echoed {} datagrams", count);
    }

    println!();
    for iface in client.interfaces() {
        println!("{}", iface);
    }
    for entry in client.arp_table() {
        println!("{}", entry);
    }
    let pcap = client.export_capture(c0)?;
    println!("client capture: {} bytes of pcap", pcap.len());
    Ok(())
}
