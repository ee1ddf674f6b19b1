//! Probe packet builder.
//!
//! Builds the fixed 98-byte Ethernet/IPv4/ICMP echo-request frame the
//! agents recognize as a trace probe. The ICMP header constants form a
//! pre-agreed probe signature and are never recomputed; only the IPv4
//! checksum is.

use std::net::Ipv4Addr;

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};

use crate::error::{Error, Result};

/// Full probe frame length: 14 (Ethernet) + 20 (IPv4) + 64 (ICMP).
pub const PROBE_FRAME_LEN: usize = 98;

const IPV4_HEADER_LEN: usize = 20;
const ICMP_LEN: usize = 64;

/// Parse `aa:bb:cc:dd:ee:ff` into an Ethernet address.
pub fn parse_mac(s: &str) -> Result<EthernetAddress> {
    let mut bytes = [0u8; 6];
    let mut count = 0;
    for part in s.split(':') {
        if count == 6 {
            return Err(Error::Mac(s.to_string()));
        }
        bytes[count] =
            u8::from_str_radix(part, 16).map_err(|_| Error::Mac(s.to_string()))?;
        count += 1;
    }
    if count != 6 {
        return Err(Error::Mac(s.to_string()));
    }
    Ok(EthernetAddress::from_bytes(&bytes))
}

/// Standard Internet checksum: one's-complement of the one's-complement
/// sum of big-endian 16-bit words, with end-around carry folded at each
/// step.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in data.chunks(2) {
        let hi = chunk[0] as u32;
        let lo = *chunk.get(1).unwrap_or(&0) as u32;
        sum += (hi << 8) | lo;
        if sum > 0xffff {
            sum = (sum & 0xffff) + 1;
        }
    }
    !(sum as u16)
}

fn build_ipv4_header(src_ip: Ipv4Addr, dst_ip: Ipv4Addr) -> [u8; IPV4_HEADER_LEN] {
    let mut header = [0u8; IPV4_HEADER_LEN];
    // version/ihl, tos, total length 0x54, id 0, flags DF, ttl 9, proto ICMP
    header[..10].copy_from_slice(&[0x45, 0x00, 0x00, 0x54, 0x00, 0x00, 0x40, 0x00, 0x09, 0x01]);
    header[12..16].copy_from_slice(&src_ip.octets());
    header[16..20].copy_from_slice(&dst_ip.octets());
    let checksum = internet_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    header
}

fn build_icmp_echo() -> [u8; ICMP_LEN] {
    let mut icmp = [0u8; ICMP_LEN];
    // type/code, checksum, identifier, sequence: fixed probe signature
    icmp[..8].copy_from_slice(&[0x08, 0x00, 0x85, 0x10, 0x5f, 0xbf, 0x00, 0x01]);
    for (i, byte) in icmp[8..].iter_mut().enumerate() {
        *byte = (i + 1) as u8;
    }
    icmp
}

/// Build the probe frame and return it hex-encoded, ready to be carried in
/// a trace command value.
pub fn build_icmp_probe(
    src_mac: &str,
    dst_mac: &str,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
) -> Result<String> {
    let src_mac = parse_mac(src_mac)?;
    let dst_mac = parse_mac(dst_mac)?;

    let mut payload = Vec::with_capacity(IPV4_HEADER_LEN + ICMP_LEN);
    payload.extend_from_slice(&build_ipv4_header(src_ip, dst_ip));
    payload.extend_from_slice(&build_icmp_echo());

    let repr = EthernetRepr {
        src_addr: src_mac,
        dst_addr: dst_mac,
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(&payload);

    debug_assert_eq!(buffer.len(), PROBE_FRAME_LEN);
    Ok(to_hex(&buffer))
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Unfolded 16-bit sum over a header, for verifying the complement
    // property independently of the production carry folding.
    fn folded_sum(header: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        for chunk in header.chunks(2) {
            sum += ((chunk[0] as u32) << 8) | chunk[1] as u32;
        }
        while sum > 0xffff {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        sum as u16
    }

    #[test]
    fn test_checksum_reference_value() {
        let header = build_ipv4_header(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
        let mut zeroed = header;
        zeroed[10] = 0;
        zeroed[11] = 0;
        assert_eq!(internet_checksum(&zeroed), 0x5da7);
    }

    #[test]
    fn test_checksum_complements_to_all_ones() {
        let header = build_ipv4_header(Ipv4Addr::new(192, 168, 4, 7), Ipv4Addr::new(10, 9, 8, 7));
        // Summing the header including its checksum must give 0xFFFF.
        assert_eq!(folded_sum(&header), 0xffff);
    }

    #[test]
    fn test_probe_frame_layout() {
        let hex = build_icmp_probe(
            "f2:01:00:00:00:01",
            "f2:01:00:00:00:02",
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
        )
        .unwrap();
        assert_eq!(hex.len(), PROBE_FRAME_LEN * 2);
        // Destination MAC leads the frame.
        assert!(hex.starts_with("f20100000002f20100000001"));
        // EtherType IPv4 right after the MACs.
        assert_eq!(&hex[24..28], "0800");
        // ICMP signature at the fixed offset (14 + 20 bytes in).
        assert_eq!(&hex[68..84], "080085105fbf0001");
        // Payload counts upward from 1.
        assert!(hex.ends_with("333435363738"));
    }

    #[test]
    fn test_parse_mac_rejects_garbage() {
        assert!(parse_mac("not-a-mac").is_err());
        assert!(parse_mac("f2:01:00:00:00").is_err());
        assert!(parse_mac("f2:01:00:00:00:01:02").is_err());
    }
}
