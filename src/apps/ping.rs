//! ping and traceroute on top of `Host::icmp_echo`.

use crate::error::{NetError, Result};
use crate::iface::host::{EchoOptions, EchoReply, Host};
use crate::iface::ip::NetworkAddress;
use log::debug;
use std::fmt;
use std::time::Duration;

/// Outcome of every sequence number of one ping run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReport {
    pub destination: NetworkAddress,
    pub results: Vec<(u16, Result<EchoReply>)>,
}

impl PingReport {
    pub fn transmitted(&self) -> usize {
        self.results.len()
    }

    /// Echo replies from the destination itself.
    pub fn received(&self) -> usize {
        self.results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(reply) if reply.reached))
            .count()
    }

    pub fn loss_percent(&self) -> u32 {
        match self.transmitted() {
            0 => 0,
            sent => (100 * (sent - self.received()) / sent) as u32,
        }
    }
}

impl fmt::Display for PingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (seq, result) in &self.results {
            match result {
                Ok(reply) if reply.reached => writeln!(
                    f,
                    "{} bytes from {}: icmp_seq={} ttl={} time={} ms",
                    reply.bytes, self.destination, seq, reply.ttl, reply.time_ms
                )?,
                Ok(reply) => writeln!(
                    f,
                    "From {}: icmp_seq={} Time to live exceeded",
                    reply.from.unwrap_or(NetworkAddress::UNSPECIFIED_V4),
                    seq
                )?,
                Err(e) => writeln!(f, "icmp_seq={} {}", seq, e)?,
            }
        }
        write!(
            f,
            "--- {} ping statistics ---\n{} packets transmitted, {} received, {}% packet loss",
            self.destination,
            self.transmitted(),
            self.received(),
            self.loss_percent()
        )
    }
}

/// Send `count` echoes one after another, each waiting up to `timeout`.
pub async fn ping(host: &Host, dst: NetworkAddress, count: u16, timeout: Duration) -> Result<PingReport> {
    let identifier = host.id().0 as u16;
    let mut results = Vec::with_capacity(count as usize);
    for sequence in 1..=count {
        let options = EchoOptions {
            timeout,
            identifier,
            sequence,
            ..EchoOptions::default()
        };
        match host.icmp_echo(dst, options).await {
            Err(e @ (NetError::Timeout | NetError::NoRoute)) => results.push((sequence, Err(e))),
            Err(e) => return Err(e),
            Ok(reply) => results.push((sequence, Ok(reply))),
        }
    }
    let report = PingReport {
        destination: dst,
        results,
    };
    debug!("ping {}: {}/{} replies", dst, report.received(), report.transmitted());
    Ok(report)
}

/// One probed TTL. `from == None` means no answer arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop {
    pub ttl: u8,
    pub from: Option<NetworkAddress>,
    pub time_ms: Option<u64>,
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.from, self.time_ms) {
            (Some(from), Some(ms)) => write!(f, "{:>2}  {}  {} ms", self.ttl, from, ms),
            _ => write!(f, "{:>2}  *", self.ttl),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceReport {
    pub destination: NetworkAddress,
    pub hops: Vec<Hop>,
    pub reached: bool,
}

impl fmt::Display for TraceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "traceroute to {}", self.destination)?;
        for hop in &self.hops {
            write!(f, "\n{}", hop)?;
        }
        Ok(())
    }
}

/// Probe TTL 1, 2, ... until the destination answers or `max_hops` is spent.
pub async fn traceroute(host: &Host, dst: NetworkAddress, max_hops: u8, timeout: Duration) -> Result<TraceReport> {
    if max_hops == 0 {
        return Err(NetError::InvalidArgument("max_hops must be at least 1"));
    }
    let identifier = host.id().0 as u16 ^ 0x8000;
    let mut report = TraceReport {
        destination: dst,
        hops: Vec::new(),
        reached: false,
    };
    for ttl in 1..=max_hops {
        let options = EchoOptions {
            timeout,
            identifier,
            sequence: ttl as u16,
            ttl: Some(ttl),
            ..EchoOptions::default()
        };
        match host.icmp_echo(dst, options).await {
            Ok(reply) => {
                report.hops.push(Hop {
                    ttl,
                    from: reply.from,
                    time_ms: Some(reply.time_ms),
                });
                if reply.reached {
                    report.reached = true;
                    break;
                }
            }
            Err(NetError::Timeout) => report.hops.push(Hop {
                ttl,
                from: None,
                time_ms: None,
            }),
            Err(NetError::NoRoute) if !report.hops.is_empty() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::interface::InterfaceConfig;
    use crate::iface::virtual_network::VirtualNetwork;

    #[tokio::test(start_paused = true)]
    async fn test_ping_counts_loss() {
        let net = VirtualNetwork::new();
        let lan = net.add_segment("lan");
        let a = net.add_host("a");
        let b = net.add_host("b");
        let ia = a.add_interface("eth0", lan).unwrap();
        let ib = b.add_interface("eth0", lan).unwrap();
        a.configure_interface(ia, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 1), 24)).unwrap();
        b.configure_interface(ib, InterfaceConfig::new(NetworkAddress::v4(10, 0, 0, 2), 24)).unwrap();

        let report = ping(&a, NetworkAddress::v4(10, 0, 0, 2), 3, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(report.transmitted(), 3);
        assert_eq!(report.received(), 3);
        assert_eq!(report.loss_percent(), 0);
        assert!(report.to_string().ends_with("3 packets transmitted, 3 received, 0% packet loss"));

        b.set_link_state(ib, false).unwrap();
        let report = ping(&a, NetworkAddress::v4(10, 0, 0, 2), 2, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(report.received(), 0);
        assert_eq!(report.loss_percent(), 100);
        assert_eq!(report.results[0].1, Err(NetError::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traceroute_rejects_zero_hops() {
        let net = VirtualNetwork::new();
        let host = net.add_host("a");
        assert!(matches!(
            traceroute(&host, NetworkAddress::LOOPBACK_V4, 0, Duration::from_millis(10)).await,
            Err(NetError::InvalidArgument(_))
        ));
        let report = traceroute(&host, NetworkAddress::LOOPBACK_V4, 5, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(report.reached);
        assert_eq!(report.hops.len(), 1);
    }
}
