//! DNS message parsing and construction.
//!
//! Implements just enough of the RFC 1035 wire format to classify incoming
//! queries and synthesize sinkhole responses. Everything else is relayed
//! verbatim, so no general-purpose message model is needed.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;

/// Maximum size of a DNS packet over UDP (with EDNS headroom).
pub const MAX_PACKET_SIZE: usize = 4096;

/// Maximum compression-pointer hops before a name is treated as malicious.
const MAX_POINTER_HOPS: usize = 20;

/// Maximum encoded length of a domain name in octets.
const MAX_NAME_LEN: usize = 253;

/// QTYPE for IPv4 host addresses.
pub const QTYPE_A: u16 = 1;
/// QTYPE for IPv6 host addresses.
pub const QTYPE_AAAA: u16 = 28;
/// QCLASS IN.
pub const QCLASS_IN: u16 = 1;

/// TTL on synthesized sinkhole answers.
pub const SINKHOLE_TTL: u32 = 300;

/// Address returned for blocked A queries.
pub const SINKHOLE_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// A parsed DNS query: header fields plus the first question.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Byte range of the question section, for echoing into responses.
    question: (usize, usize),
}

impl DnsQuery {
    /// Parse a DNS query from raw bytes.
    ///
    /// Returns `None` for anything malformed: short buffers, zero questions,
    /// labels running off the buffer, compression pointers that escape the
    /// buffer or loop.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if qdcount == 0 {
            return None;
        }

        let (domain, name_end) = parse_name(data, HEADER_LEN)?;

        if name_end + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[name_end], data[name_end + 1]]);
        let qclass = u16::from_be_bytes([data[name_end + 2], data[name_end + 3]]);

        Some(Self {
            id,
            flags,
            domain,
            qtype,
            qclass,
            question: (HEADER_LEN, name_end + 4),
        })
    }

    /// Whether the client requested recursion.
    pub fn recursion_desired(&self) -> bool {
        self.flags & 0x0100 != 0
    }

    /// Synthesize the response for a blocked query.
    ///
    /// A queries get a single `127.0.0.1` answer with a 300 s TTL. AAAA
    /// queries get an empty NOERROR so clients fall back to the A record
    /// instead of caching a mismatched address.
    pub fn sinkhole_response(&self, packet: &[u8]) -> Vec<u8> {
        match self.qtype {
            QTYPE_A => self.build_response(packet, Some(SINKHOLE_V4)),
            _ => self.build_response(packet, None),
        }
    }

    fn build_response(&self, packet: &[u8], answer: Option<Ipv4Addr>) -> Vec<u8> {
        let mut flags: u16 = 0x8080; // QR=1, RA=1, RCODE=0
        if self.recursion_desired() {
            flags |= 0x0100;
        }

        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        buf.extend_from_slice(&(answer.is_some() as u16).to_be_bytes()); // ANCOUNT
        buf.extend_from_slice(&[0, 0]); // NSCOUNT
        buf.extend_from_slice(&[0, 0]); // ARCOUNT

        // Echo the question bytes as received.
        let (start, end) = self.question;
        buf.extend_from_slice(&packet[start..end]);

        if let Some(addr) = answer {
            // Answer name is written out in full rather than as a pointer,
            // which keeps the synthesizer independent of the question layout.
            encode_name(&mut buf, &self.domain);
            buf.extend_from_slice(&QTYPE_A.to_be_bytes());
            buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
            buf.extend_from_slice(&SINKHOLE_TTL.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&addr.octets());
        }

        buf
    }
}

/// Parse a (possibly compressed) name starting at `start`.
///
/// Returns the lowercased dotted name without trailing dot, and the offset
/// just past the name at its original (uncompressed) position.
fn parse_name(data: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end_after: Option<usize> = None;
    let mut hops = 0usize;
    let mut name_len = 0usize;

    loop {
        let len_byte = *data.get(pos)?;

        if len_byte & 0xC0 == 0xC0 {
            // Compression pointer. Remember where the name ends in the
            // original stream the first time we jump.
            let next = *data.get(pos + 1)?;
            if end_after.is_none() {
                end_after = Some(pos + 2);
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return None;
            }
            let target = ((len_byte as usize & 0x3F) << 8) | next as usize;
            // Pointers must go strictly backwards, which also rules out loops.
            if target >= pos {
                return None;
            }
            pos = target;
            continue;
        }

        if len_byte & 0xC0 != 0 {
            // The 0x40 and 0x80 label types are not in use.
            return None;
        }

        let label_len = len_byte as usize;
        if label_len == 0 {
            if end_after.is_none() {
                end_after = Some(pos + 1);
            }
            break;
        }

        let label_start = pos + 1;
        let label_end = label_start + label_len;
        if label_end > data.len() {
            return None;
        }

        name_len += label_len + 1;
        if name_len > MAX_NAME_LEN + 1 {
            return None;
        }

        let label = std::str::from_utf8(&data[label_start..label_end]).ok()?;
        labels.push(label.to_ascii_lowercase());
        pos = label_end;
    }

    if labels.is_empty() {
        return None;
    }

    Some((labels.join("."), end_after?))
}

/// Encode a dotted name as uncompressed labels.
fn encode_name(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Build a standalone query packet, used to probe resolvers.
pub fn build_query(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + domain.len() + 6);
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    encode_name(&mut buf, domain);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&QCLASS_IN.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_packet(id: u16, domain: &str, qtype: u16) -> Vec<u8> {
        build_query(id, domain, qtype)
    }

    #[test]
    fn parse_simple_query() {
        let packet = query_packet(0x1234, "www.example.com", QTYPE_A);
        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.id, 0x1234);
        assert_eq!(query.domain, "www.example.com");
        assert_eq!(query.qtype, QTYPE_A);
        assert_eq!(query.qclass, QCLASS_IN);
        assert!(query.recursion_desired());
    }

    #[test]
    fn parse_lowercases_domain() {
        let packet = query_packet(1, "WWW.Example.COM", QTYPE_A);
        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.domain, "www.example.com");
    }

    #[test]
    fn parse_rejects_short_buffers() {
        assert!(DnsQuery::parse(&[]).is_none());
        assert!(DnsQuery::parse(&[0u8; 5]).is_none());
        assert!(DnsQuery::parse(&[0u8; 12]).is_none());
    }

    #[test]
    fn parse_rejects_zero_questions() {
        let mut packet = query_packet(1, "example.com", QTYPE_A);
        packet[4] = 0;
        packet[5] = 0;

        assert!(DnsQuery::parse(&packet).is_none());
    }

    #[test]
    fn parse_rejects_label_running_off_buffer() {
        let mut packet = query_packet(1, "example.com", QTYPE_A);
        // Claim a 63-octet label where only a few bytes remain.
        packet[12] = 63;
        packet.truncate(20);

        assert!(DnsQuery::parse(&packet).is_none());
    }

    #[test]
    fn parse_rejects_pointer_off_buffer() {
        let mut packet = vec![0u8; HEADER_LEN];
        packet[5] = 1; // QDCOUNT
        packet.push(0xC0);
        packet.push(0xFF); // points past the end

        assert!(DnsQuery::parse(&packet).is_none());
    }

    #[test]
    fn parse_rejects_pointer_loop() {
        let mut packet = vec![0u8; HEADER_LEN];
        packet[5] = 1;
        // Pointer at offset 12 pointing to itself.
        packet.push(0xC0);
        packet.push(12);

        assert!(DnsQuery::parse(&packet).is_none());
    }

    #[test]
    fn parse_name_follows_compression_pointer() {
        // Header, then "example.com" at offset 12, then a name that is a
        // bare pointer back to it.
        let mut packet = vec![0u8; HEADER_LEN];
        packet[5] = 1;
        encode_name(&mut packet, "example.com");
        let pointer_at = packet.len();
        packet.push(0xC0);
        packet.push(12);

        let (name, end) = parse_name(&packet, pointer_at).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(end, pointer_at + 2);
    }

    #[test]
    fn sinkhole_a_has_expected_shape() {
        let packet = query_packet(0xBEEF, "ads.example.com", QTYPE_A);
        let query = DnsQuery::parse(&packet).unwrap();
        let response = query.sinkhole_response(&packet);

        // Transaction id preserved.
        assert_eq!(&response[0..2], &[0xBE, 0xEF]);
        // QR=1, RD=1, RA=1, RCODE=0.
        assert_eq!(response[2], 0x81);
        assert_eq!(response[3], 0x80);
        // One question, one answer.
        assert_eq!(u16::from_be_bytes([response[4], response[5]]), 1);
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);

        // The answer sits after the echoed question: full name, then A, IN,
        // TTL 300, RDLENGTH 4, 127.0.0.1.
        let answer = &response[packet.len()..];
        let name_len = "ads.example.com".len() + 2;
        let fixed = &answer[name_len..];
        assert_eq!(u16::from_be_bytes([fixed[0], fixed[1]]), QTYPE_A);
        assert_eq!(u16::from_be_bytes([fixed[2], fixed[3]]), QCLASS_IN);
        assert_eq!(
            u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]),
            SINKHOLE_TTL
        );
        assert_eq!(u16::from_be_bytes([fixed[8], fixed[9]]), 4);
        assert_eq!(&fixed[10..14], &SINKHOLE_V4.octets());
    }

    #[test]
    fn sinkhole_aaaa_is_empty_noerror() {
        let packet = query_packet(7, "ads.example.com", QTYPE_AAAA);
        let query = DnsQuery::parse(&packet).unwrap();
        let response = query.sinkhole_response(&packet);

        assert_eq!(u16::from_be_bytes([response[0], response[1]]), 7);
        // RCODE 0.
        assert_eq!(response[3] & 0x0F, 0);
        // ANCOUNT 0, question still echoed.
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
        assert_eq!(response.len(), packet.len());
    }

    #[test]
    fn sinkhole_echoes_rd_flag() {
        let mut packet = query_packet(7, "ads.example.com", QTYPE_A);
        packet[2] = 0; // clear RD
        let query = DnsQuery::parse(&packet).unwrap();
        let response = query.sinkhole_response(&packet);

        assert_eq!(response[2] & 0x01, 0);
    }

    #[test]
    fn build_query_round_trips() {
        let packet = build_query(42, "google.com", QTYPE_A);
        let query = DnsQuery::parse(&packet).unwrap();

        assert_eq!(query.id, 42);
        assert_eq!(query.domain, "google.com");
        assert_eq!(query.qtype, QTYPE_A);
    }

    #[test]
    fn parse_rejects_overlong_name() {
        let label = "a".repeat(63);
        let long = [label.as_str(); 5].join(".");
        let packet = query_packet(1, &long, QTYPE_A);

        assert!(DnsQuery::parse(&packet).is_none());
    }
}
