//! Just enough of the message format to admit a query and match its answer.
//!
//! The header section format:
//!
//! ```text
//!                                     1  1  1  1  1  1
//!       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     |                      ID                       |
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     |                    QDCOUNT                    |
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     |                    ANCOUNT                    |
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     |                    NSCOUNT                    |
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//!     |                    ARCOUNT                    |
//!     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```
use std::io::Cursor;

use crate::network::*;
use crate::{QClass, QType};

/// Size of the fixed header every message starts with.
pub const HEADER_LEN: usize = 12;
/// Messages must be shorter than this to have their length fit 16 bits.
pub const MAX_MESSAGE_LEN: usize = 65536;

#[allow(dead_code, non_snake_case)]
pub mod Rcode {
    pub const NOERROR: u8 = 0;
    pub const FORMERR: u8 = 1;
    pub const SERVFAIL: u8 = 2;
    pub const NXDOMAIN: u8 = 3;
    pub const NOTIMP: u8 = 4;
    pub const REFUSED: u8 = 5;
}

// Following compression pointers more often than this means a loop.
const MAX_POINTERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub tc: bool,
    pub rcode: u8,
    pub qdcount: u16,
}

/// Reads the transaction ID of an encoded message.
pub fn query_id(data: &[u8]) -> Option<u16> {
    if data.len() < HEADER_LEN {
        return None;
    }
    u16_at(data, 0)
}

pub fn parse_header(data: &[u8]) -> Option<Header> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let mut header = Cursor::new(data);

    let id = unpack!(u16, header);
    let byte3 = unpack!(u8, header);
    let byte4 = unpack!(u8, header);
    let qdcount = unpack!(u16, header);

    Some(Header {
        id: id,
        qr: byte3 & 0b10000000 != 0,
        tc: byte3 & 0b00000010 != 0,
        rcode: byte4 & 0b00001111,
        qdcount: qdcount,
    })
}

// For detail, see page 29 of RFC 1035
//
// Returns the number of bytes the name occupies at `offset` and the name
// itself, lower-cased and without the trailing dot.
fn parse_name(data: &[u8], offset: usize) -> Option<(usize, String)> {
    let mut p = offset;
    let mut consumed = None;
    let mut jumps = 0;
    let mut labels: Vec<String> = Vec::new();

    loop {
        let l = *data.get(p)?;
        if l == 0 {
            break;
        }

        if (l & 0b11000000) == 0b11000000 {
            //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
            //    | 1  1|                OFFSET                   |
            //    +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
            let ptr = (u16_at(data, p)? & 0x3FFF) as usize;
            if consumed.is_none() {
                consumed = Some(p + 2 - offset);
            }
            jumps += 1;
            if jumps > MAX_POINTERS {
                return None;
            }
            p = ptr;
        } else if l & 0b11000000 != 0 {
            return None;
        } else {
            let label = data.get(p + 1..p + 1 + l as usize)?;
            labels.push(String::from_utf8_lossy(label).to_ascii_lowercase());
            p += 1 + l as usize;
        }
    }

    let consumed = consumed.unwrap_or(p + 1 - offset);
    Some((consumed, labels.join(".")))
}

/// Parses the question section into `(name, qtype, qclass)` triples.
pub fn parse_questions(data: &[u8]) -> Option<Vec<(String, u16, u16)>> {
    let header = parse_header(data)?;
    let mut offset = HEADER_LEN;
    let mut questions = Vec::with_capacity(header.qdcount as usize);

    // The question section format:
    //
    //                                     1  1  1  1  1  1
    //       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                                               |
    //     /                     QNAME                     /
    //     /                                               /
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                     QTYPE                     |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                     QCLASS                    |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    for _ in 0..header.qdcount {
        let (nlen, name) = parse_name(data, offset)?;
        offset += nlen;
        let qtype = u16_at(data, offset)?;
        let qclass = u16_at(data, offset + 2)?;
        offset += 4;
        questions.push((name, qtype, qclass));
    }

    Some(questions)
}

/// Whether `answer` carries exactly the questions asked in `query`.
///
/// Names compare case-insensitively.
pub fn same_questions(query: &[u8], answer: &[u8]) -> bool {
    match (parse_questions(query), parse_questions(answer)) {
        (Some(asked), Some(answered)) => asked == answered,
        _ => false,
    }
}

// For detail, see page 7 of RFC 1035
fn build_address(address: &str) -> Option<Vec<u8>> {
    let mut v = vec![];
    let bytes = address.as_bytes();
    for label in bytes.split(|ch| *ch == b'.') {
        match label.len() {
            0 => continue,
            n if n > 63 => return None,
            n => {
                v.push(n as u8);
                v.extend_from_slice(label);
            }
        }
    }

    v.push(0);
    if v.len() > 255 {
        return None;
    }
    Some(v)
}

// For detail, see page 24 of RFC 1035 and section 6.1.2 of RFC 6891
pub fn build_request(address: &str,
                     qtype: u16,
                     recurse: bool,
                     edns_payload: Option<u16>)
                     -> Option<Vec<u8>> {
    let mut r = vec![];
    // The header section:
    //
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |               random request_id               |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     | 0|     0     | 0| 0|RD| 0|   0    |     0     |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                       1                       |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                       0                       |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                       0                       |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     |                    0 or 1                     |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    let request_id = rand::random::<u16>();

    pack!(u16, r, request_id);
    pack!(u8, r, if recurse { 1 } else { 0 });
    pack!(u8, r, 0);
    pack!(u16, r, 1);
    pack!(u16, r, 0);
    pack!(u16, r, 0);
    pack!(u16, r, if edns_payload.is_some() { 1 } else { 0 });
    // address
    let addr = try_opt!(build_address(address));
    r.extend(addr);
    // qtype and qclass
    pack!(u16, r, qtype);
    pack!(u16, r, QClass::IN);

    // OPT pseudo-record: root name, payload size in CLASS, zero TTL and RDATA
    if let Some(payload) = edns_payload {
        pack!(u8, r, 0);
        pack!(u16, r, QType::OPT);
        pack!(u16, r, payload);
        pack!(u32, r, 0);
        pack!(u16, r, 0);
    }

    Some(r)
}

#[cfg(test)]
mod test {
    use super::*;

    #[rustfmt::skip]
    const BAIDU: &[u8] =
        &[0x0d, 0x0d, 0x81, 0x80, 0x00, 0x01, 0x00, 0x04, 0x00, 0x05, 0x00, 0x00, 0x05, 0x62,
          0x61, 0x69, 0x64, 0x75, 0x03, 0x63, 0x6f, 0x6d, 0x00, 0x00, 0x01, 0x00, 0x01, 0xc0,
          0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x36, 0x00, 0x04, 0xb4, 0x95, 0x84,
          0x2f, 0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x36, 0x00, 0x04, 0xdc,
          0xb5, 0x39, 0xd9];

    #[test]
    fn parse_answer_header() {
        let header = parse_header(BAIDU).unwrap();
        assert_eq!(header.id, 0x0d0d);
        assert!(header.qr);
        assert!(!header.tc);
        assert_eq!(header.rcode, Rcode::NOERROR);
        assert_eq!(header.qdcount, 1);
        assert_eq!(query_id(BAIDU), Some(0x0d0d));
        assert_eq!(query_id(&BAIDU[..11]), None);
    }

    #[test]
    fn parse_answer_questions() {
        let questions = parse_questions(BAIDU).unwrap();
        assert_eq!(questions, vec![("baidu.com".to_string(), QType::A, QClass::IN)]);
    }

    #[test]
    fn questions_match_case_insensitively() {
        let query = build_request("BAIDU.com", QType::A, true, None).unwrap();
        assert!(same_questions(&query, BAIDU));

        let other = build_request("baidu.com", QType::AAAA, true, None).unwrap();
        assert!(!same_questions(&other, BAIDU));
    }

    #[test]
    fn truncated_question_is_rejected() {
        assert!(parse_questions(&BAIDU[..20]).is_none());
        assert!(!same_questions(&BAIDU[..20], BAIDU));
    }

    #[test]
    fn pointer_loop_is_rejected() {
        // qdcount 1, name is a pointer to itself
        let data = [0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0xc0, 0x0c, 0, 1, 0, 1];
        assert!(parse_questions(&data).is_none());
    }

    #[test]
    fn build_plain_request() {
        let req = build_request("www.example.com.", QType::A, true, None).unwrap();
        let header = parse_header(&req).unwrap();
        assert!(!header.qr);
        assert_eq!(header.qdcount, 1);
        assert_eq!(req[2], 1);
        assert_eq!(req.len(), HEADER_LEN + 17 + 4);
        assert_eq!(parse_questions(&req).unwrap(),
                   vec![("www.example.com".to_string(), QType::A, QClass::IN)]);
    }

    #[test]
    fn build_edns_request() {
        let req = build_request("example.com", QType::AAAA, false, Some(4096)).unwrap();
        assert_eq!(req[2], 0);
        assert_eq!(u16_at(&req, 10), Some(1));
        let opt = &req[req.len() - 11..];
        assert_eq!(opt[0], 0);
        assert_eq!(u16_at(opt, 1), Some(QType::OPT));
        assert_eq!(u16_at(opt, 3), Some(4096));
    }

    #[test]
    fn build_rejects_long_label() {
        let label = "a".repeat(64);
        assert!(build_request(&label, QType::A, true, None).is_none());
    }
}
