//! Three hosts in a line with a router in the middle: ping and traceroute.

use simnet::apps::ping::{ping, traceroute};
use simnet::{InterfaceConfig, NetworkAddress, RouteDevice, VirtualNetwork};
use std::time::Duration;

#[tokio::main(flavor = "current_thread")]
async fn main() -> simnet::Result<()> {
    env_logger::init();

    let net = VirtualNetwork::new();
    let left = net.add_segment("left");
    let right = net.add_segment("right");

    let a = net.add_host("a");
    let router = net.add_host("router");
    let b = net.add_host("b");

    let a0 = a.add_interface("eth0", left)?;
    let r0 = router.add_interface("eth0", left)?;
    let r1 = router.add_interface("eth1", right)?;
    let b0 = b.add_interface("eth0", right)?;

    a.configure_interface(a0, InterfaceConfig::new(NetworkAddress::v4(10, 0, 1, 2), 24))?;
    router.configure_interface(r0, InterfaceConfig::new(NetworkAddress::v4(10, 0, 1, 1), 24))?;
    router.configure_interface(r1, InterfaceConfig::new(NetworkAddress::v4(10, 0, 2, 1), 24))?;
    b.configure_interface(b0, InterfaceConfig::new(NetworkAddress::v4(10, 0, 2, 2), 24))?;
    router.set_forwarding(true);

    a.add_route(NetworkAddress::UNSPECIFIED_V4, 0, RouteDevice::Interface(a0), Some(NetworkAddress::v4(10, 0, 1, 1)))?;
    b.add_route(NetworkAddress::UNSPECIFIED_V4, 0, RouteDevice::Interface(b0), Some(NetworkAddress::v4(10, 0, 2, 1)))?;

    for route in a.routing_table() {
        println!("{}", route);
    }
    println!();

    let report = ping(&a, NetworkAddress::v4(10, 0, 2, 2), 3, Duration::from_secs(1)).await?;
    println!("{}\n", report);

    let trace = traceroute(&a, NetworkAddress::v4(10, 0, 2, 2), 8, Duration::from_secs(1)).await?;
    println!("{}", trace);

    let unreachable = ping(&a, NetworkAddress::v4(172, 16, 0, 1), 1, Duration::from_secs(1)).await?;
    println!("\n{}", unreachable);
    Ok(())
}
