//! Minimal raw DNS query construction and answer parsing.
//!
//! Only what the trusted-remote fallback needs: an A-record question with
//! recursion desired, and an answer walk that understands compressed
//! names. Anything fancier goes through the system resolver.

use std::net::Ipv4Addr;

use rand::Rng;

const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

/// Flags: recursion desired, everything else zero.
const FLAGS_RD: u16 = 0x0100;

/// Builds an A query for `host`. Returns the transaction id alongside the
/// packet so the reply can be checked against it.
pub fn build_query(host: &str) -> Result<(u16, Vec<u8>), &'static str> {
    let id: u16 = rand::rng().random();
    let mut packet = Vec::with_capacity(17 + host.len());
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&FLAGS_RD.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]); // AN/NS/AR
    for label in host.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err("invalid hostname label");
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok((id, packet))
}

/// Extracts the A records from a reply, verifying the transaction id.
///
/// Non-A answer records (CNAMEs and such) are skipped, not errors. A
/// structurally broken packet is an error so the caller can treat it
/// like a poisoned reply and retry.
pub fn parse_answers(reply: &[u8], expect_id: u16) -> Result<Vec<Ipv4Addr>, &'static str> {
    if reply.len() < 12 {
        return Err("reply shorter than a DNS header");
    }
    let id = u16::from_be_bytes([reply[0], reply[1]]);
    if id != expect_id {
        return Err("transaction id mismatch");
    }
    let qdcount = u16::from_be_bytes([reply[4], reply[5]]) as usize;
    let ancount = u16::from_be_bytes([reply[6], reply[7]]) as usize;

    let mut pos = 12;
    for _ in 0..qdcount {
        pos = skip_name(reply, pos)?;
        pos += 4; // QTYPE + QCLASS
        if pos > reply.len() {
            return Err("truncated question section");
        }
    }

    let mut ips = Vec::new();
    for _ in 0..ancount {
        pos = skip_name(reply, pos)?;
        if pos + 10 > reply.len() {
            return Err("truncated answer record");
        }
        let rtype = u16::from_be_bytes([reply[pos], reply[pos + 1]]);
        let rclass = u16::from_be_bytes([reply[pos + 2], reply[pos + 3]]);
        let rdlen = u16::from_be_bytes([reply[pos + 8], reply[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > reply.len() {
            return Err("truncated rdata");
        }
        if rtype == TYPE_A && rclass == CLASS_IN && rdlen == 4 {
            ips.push(Ipv4Addr::new(
                reply[pos],
                reply[pos + 1],
                reply[pos + 2],
                reply[pos + 3],
            ));
        }
        pos += rdlen;
    }
    Ok(ips)
}

/// Advances past a possibly-compressed name. A compression pointer
/// (top two bits set) ends the name in two bytes.
fn skip_name(buf: &[u8], mut pos: usize) -> Result<usize, &'static str> {
    loop {
        let len = *buf.get(pos).ok_or("truncated name")?;
        if len & 0xC0 == 0xC0 {
            return Ok(pos + 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos += 1 + len as usize;
    }
}

/// Wraps a query for TCP transport: 2-byte big-endian length prefix.
pub fn frame_tcp(packet: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(packet.len() + 2);
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    framed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_tail(host: &str) -> Vec<u8> {
        let (_, packet) = build_query(host).unwrap();
        packet[12..].to_vec()
    }

    #[test]
    fn query_encodes_labels_and_question() {
        let tail = query_tail("example.com");
        let mut expected = vec![7u8];
        expected.extend_from_slice(b"example");
        expected.push(3);
        expected.extend_from_slice(b"com");
        expected.extend_from_slice(&[0, 0, 1, 0, 1]);
        assert_eq!(tail, expected);
    }

    #[test]
    fn query_header_asks_for_recursion() {
        let (_, packet) = build_query("example.com").unwrap();
        assert_eq!(&packet[2..12], &[0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn rejects_oversized_label() {
        let long = "a".repeat(64);
        assert!(build_query(&format!("{long}.com")).is_err());
        assert!(build_query("bad..host").is_err());
    }

    /// Builds a reply with one compressed-name A answer.
    fn reply_with(id: u16, ips: &[[u8; 4]]) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&id.to_be_bytes());
        reply.extend_from_slice(&0x8180u16.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&(ips.len() as u16).to_be_bytes());
        reply.extend_from_slice(&[0, 0, 0, 0]);
        // question: example.com A IN
        reply.extend_from_slice(&query_tail("example.com"));
        for ip in ips {
            reply.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12
            reply.extend_from_slice(&[0, 1, 0, 1]); // A, IN
            reply.extend_from_slice(&[0, 0, 0, 60]); // TTL
            reply.extend_from_slice(&[0, 4]);
            reply.extend_from_slice(ip);
        }
        reply
    }

    #[test]
    fn parses_compressed_answers() {
        let reply = reply_with(0x1234, &[[93, 184, 216, 34], [10, 0, 0, 7]]);
        let ips = parse_answers(&reply, 0x1234).unwrap();
        assert_eq!(
            ips,
            vec![
                Ipv4Addr::new(93, 184, 216, 34),
                Ipv4Addr::new(10, 0, 0, 7)
            ]
        );
    }

    #[test]
    fn rejects_id_mismatch() {
        let reply = reply_with(0x1234, &[[1, 2, 3, 4]]);
        assert_eq!(parse_answers(&reply, 0x4321), Err("transaction id mismatch"));
    }

    #[test]
    fn rejects_truncated_answer() {
        let mut reply = reply_with(7, &[[1, 2, 3, 4]]);
        reply.truncate(reply.len() - 2);
        assert!(parse_answers(&reply, 7).is_err());
    }

    #[test]
    fn tcp_frame_prefixes_length() {
        let framed = frame_tcp(&[0xAB; 300]);
        assert_eq!(&framed[..2], &[0x01, 0x2C]);
        assert_eq!(framed.len(), 302);
    }
}
