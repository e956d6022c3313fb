//! A DHCP and DNS server host and two clients that configure themselves,
//! then look a name up.

use simnet::apps::dhcp_client::DhcpClient;
use simnet::apps::dhcp_server::{DhcpServer, DhcpServerConfig};
use simnet::apps::dns_client::resolve;
use simnet::apps::dns_server::{DnsServer, Zone};
use simnet::pdu::dns::record_type;
use simnet::{InterfaceConfig, NetworkAddress, VirtualNetwork};
use std::time::Duration;

const DHCP_CONFIG: &str = r#"{
    "server_address": "192.168.1.1",
    "range_start": "192.168.1.100",
    "range_end": "192.168.1.200",
    "subnet_mask": "255.255.255.0",
    "router": "192.168.1.1",
    "dns_servers": ["192.168.1.1"],
    "lease_time_secs": 3600
}"#;

const ZONE: &str = r#"{
    "a": { "intranet.lan": ["192.168.1.1"] },
    "cname": { "www.intranet.lan": "intranet.lan" }
}"#;

#[tokio::main(flavor = "current_thread")]
async fn main() -> simnet::Result<()> {
    env_logger::init();

    let net = VirtualNetwork::new();
    let lan = net.add_segment("lan");
    let gateway = net.add_host("gateway");
    let g0 = gateway.add_interface("eth0", lan)?;
    gateway.configure_interface(g0, InterfaceConfig::new(NetworkAddress::v4(192, 168, 1, 1), 24))?;

    let mut dhcp = DhcpServer::bind(gateway.clone(), DhcpServerConfig::from_json(DHCP_CONFIG)?)?;
    let dhcp_socket = dhcp.socket();
    let dhcp_task = tokio::spawn(async move { dhcp.serve().await });

    let dns = DnsServer::bind(gateway.clone(), &Zone::from_json(ZONE)?)?;
    let dns_socket = dns.socket();
    let dns_task = tokio::spawn(async move { dns.serve().await });

    for name in ["laptop", "phone"] {
        let host = net.add_host(name);
        let index = host.add_interface("eth0", lan)?;
        let lease = DhcpClient::new(host.clone()).hostname(name).acquire(index).await?;
        println!("{} got {}/{} via {:?}", name, lease.address, lease.prefix_len, lease.router);

        if let Some(server) = lease.dns_servers.first() {
            let response = resolve(&host, *server, "www.intranet.lan", record_type::A, Duration::from_secs(1)).await?;
            for record in &response.answers {
                println!("  {}", record);
            }
        }
    }

    gateway.close_udp_socket(dhcp_socket)?;
    gateway.close_udp_socket(dns_socket)?;
    let _ = dhcp_task.await;
    let _ = dns_task.await;

    println!();
    for socket in gateway.udp_sockets() {
        println!("{}", socket);
    }
    Ok(())
}
