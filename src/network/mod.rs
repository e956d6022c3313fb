//! Link and network layer codecs for frames on a simulated segment:
//! - Ethernet II framing
//! - ARP: Address Resolution Protocol packets
//! - IPv4: Internet Protocol version 4
//! - ICMP: Internet Control Message Protocol

pub mod arp;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;

// Re-export commonly used items
pub use arp::ArpPacket;
pub use ethernet::{EthernetHeader, MacAddr};
pub use icmp::{IcmpHeader, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
pub use ipv4::{flags, protocol, Ipv4Header};

/// Calculate Internet checksum
///
/// Algorithm: Sum data in 16-bit chunks, add carry bits to the sum,
/// and return the one's complement of the result.
/// This is used for IP, ICMP, UDP and TCP checksums.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(sum_words(0, data))
}

/// Checksum of a transport segment including the IPv4 pseudo header.
pub fn pseudo_header_checksum(src: [u8; 4], dst: [u8; 4], protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src);
    pseudo[4..8].copy_from_slice(&dst);
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(sum_words(0, &pseudo), segment);
    !fold(sum)
}

fn sum_words(mut sum: u32, data: &[u8]) -> u32 {
    // Process data in 2-byte chunks
    for chunk in data.chunks_exact(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // Handle odd-length data by padding with zero
    if data.len() % 2 != 0 {
        if let Some(&last_byte) = data.last() {
            sum += (last_byte as u32) << 8;
        }
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_of_valid_header_is_zero() {
        let header = Ipv4Header::new_simple(protocol::UDP, [10, 0, 0, 1], [10, 0, 0, 2], 8);
        let bytes = ipv4::Ipv4Utils::create_packet_with_payload(&header, &[0; 8]);
        assert_eq!(checksum(&bytes[..20]), 0);
    }

    #[test]
    fn test_odd_length_padding() {
        assert_eq!(checksum(&[0x01]), !0x0100);
    }
}
