//! The DNS wire codec: RFC 1035 message parsing and response construction.
//!
//! Everything here works on a borrowed byte slice with explicit bounds
//! checks instead of casting the buffer to a packed struct — pointer casts
//! into network-ordered structs don't have a sound representation in safe
//! Rust, and a byte-slice reader makes every offset an explicit, checked
//! value.
use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use byteorder::{BigEndian, ByteOrder};

/// UDP payload ceiling this relay accepts; no EDNS(0), so 512 bytes per
/// RFC 1035 is the hard limit on both queries and responses.
pub const MAX_DNS_PACKET_SIZE: usize = 512;
pub const HEADER_SIZE: usize = 12;

pub const QCLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;

/// `QR | AA | RA`, opcode 0, rcode 0 — the literal flag word every response
/// this relay emits starts from, with the rcode bits then ORed in.
const BASE_RESPONSE_FLAGS: u16 = 0x8180;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QType {
    A,
    Aaaa,
}

impl QType {
    pub fn as_u16(self) -> u16 {
        match self {
            QType::A => 1,
            QType::Aaaa => 28,
        }
    }

    pub fn rdlength(self) -> u16 {
        match self {
            QType::A => 4,
            QType::Aaaa => 16,
        }
    }

    /// Whether an [`IpAddr`] is the right address family to answer this
    /// query type (an A query wants a v4 record and vice versa).
    pub fn matches_family(self, ip: &IpAddr) -> bool {
        matches!(
            (self, ip),
            (QType::A, IpAddr::V4(_)) | (QType::Aaaa, IpAddr::V6(_))
        )
    }
}

impl TryFrom<u16> for QType {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(QType::A),
            28 => Ok(QType::Aaaa),
            _ => Err(()),
        }
    }
}

impl fmt::Display for QType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QType::A => write!(f, "A"),
            QType::Aaaa => write!(f, "AAAA"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    Truncated,
    PointerCycle,
    NameTooLong,
    NotUtf8,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated => write!(f, "buffer truncated mid-name"),
            CodecError::PointerCycle => write!(f, "compression pointer cycle"),
            CodecError::NameTooLong => write!(f, "decoded name exceeds the length cap"),
            CodecError::NotUtf8 => write!(f, "label is not valid UTF-8"),
        }
    }
}

/// Longest legal presentation-format domain name we'll build (253 octets
/// per RFC 1035, plus slack for escaping); parse_name aborts past this.
const MAX_NAME_LEN: usize = 512;

/// Read the 16-bit question count out of a 12-byte-or-longer header.
pub fn qdcount(buf: &[u8]) -> u16 {
    BigEndian::read_u16(&buf[4..6])
}

pub fn transaction_id(buf: &[u8]) -> u16 {
    BigEndian::read_u16(&buf[0..2])
}

pub fn set_transaction_id(buf: &mut [u8], id: u16) {
    BigEndian::write_u16(&mut buf[0..2], id);
}

/// Parse a (possibly compressed) domain name starting at `start`, returning
/// the lowercased dotted-string presentation and the number of bytes
/// consumed **at the original site** — per RFC 1035 §4.1.4 this is
/// `pointer_offset - start + 2` the instant a pointer is followed, not the
/// number of bytes walked through the pointer chain.
pub fn parse_name(buf: &[u8], start: usize) -> Result<(String, usize), CodecError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut consumed_at_site: Option<usize> = None;
    let mut visited: HashSet<usize> = HashSet::new();
    let mut total_len = 0usize;

    loop {
        if pos >= buf.len() {
            return Err(CodecError::Truncated);
        }
        let b = buf[pos];

        if b == 0 {
            if consumed_at_site.is_none() {
                consumed_at_site = Some(pos + 1 - start);
            }
            break;
        }

        if crate::util::is_pointer(b) {
            if pos + 1 >= buf.len() {
                return Err(CodecError::Truncated);
            }
            let pointer = (BigEndian::read_u16(&buf[pos..pos + 2]) & 0x3FFF) as usize;

            if consumed_at_site.is_none() {
                consumed_at_site = Some(pos + 2 - start);
            }
            if !visited.insert(pos) {
                return Err(CodecError::PointerCycle);
            }
            if pointer >= pos {
                // only backward pointers can terminate; anything else is a
                // malformed or adversarial packet.
                return Err(CodecError::PointerCycle);
            }
            pos = pointer;
            continue;
        }

        let len = b as usize;
        let label_start = pos + 1;
        let label_end = label_start + len;
        if label_end > buf.len() {
            return Err(CodecError::Truncated);
        }
        let label = std::str::from_utf8(&buf[label_start..label_end])
            .map_err(|_| CodecError::NotUtf8)?;
        total_len += label.len() + 1;
        if total_len > MAX_NAME_LEN {
            return Err(CodecError::NameTooLong);
        }
        labels.push(label.to_ascii_lowercase());
        pos = label_end;
    }

    Ok((labels.join("."), consumed_at_site.unwrap_or(1)))
}

/// Result of decoding a client query's question section.
pub struct Question {
    pub domain: String,
    pub qtype_raw: u16,
    pub qclass_raw: u16,
    /// byte length of the question section, starting right after the
    /// 12-byte header — name bytes (as consumed at the question site) plus
    /// the 4-byte QTYPE/QCLASS pair.
    pub question_len: usize,
}

/// Decode the single question a valid client query carries. Callers must
/// have already checked `qdcount(buf) == 1` and `buf.len() >= HEADER_SIZE`.
pub fn parse_question(buf: &[u8]) -> Result<Question, CodecError> {
    let (domain, name_len) = parse_name(buf, HEADER_SIZE)?;
    let type_class_start = HEADER_SIZE + name_len;
    if type_class_start + 4 > buf.len() {
        return Err(CodecError::Truncated);
    }
    let qtype_raw = BigEndian::read_u16(&buf[type_class_start..type_class_start + 2]);
    let qclass_raw = BigEndian::read_u16(&buf[type_class_start + 2..type_class_start + 4]);

    Ok(Question {
        domain,
        qtype_raw,
        qclass_raw,
        question_len: name_len + 4,
    })
}

fn response_prelude(request: &[u8], question_len: usize) -> Vec<u8> {
    let total_question = HEADER_SIZE + question_len;
    let mut out = Vec::with_capacity(MAX_DNS_PACKET_SIZE);
    out.extend_from_slice(&request[..total_question.min(request.len())]);
    out
}

fn set_flags_and_ancount(out: &mut [u8], rcode: u8, ancount: u16) {
    let flags = BASE_RESPONSE_FLAGS | rcode as u16;
    BigEndian::write_u16(&mut out[2..4], flags);
    BigEndian::write_u16(&mut out[6..8], ancount); // ANCOUNT
    BigEndian::write_u16(&mut out[8..10], 0); // NSCOUNT
    BigEndian::write_u16(&mut out[10..12], 0); // ARCOUNT
}

/// Build a NOERROR response with a single A/AAAA answer pointing back at the
/// question's name via the standard `0xC00C` compression pointer.
pub fn build_standard_answer(request: &[u8], question_len: usize, qtype: QType, ip: IpAddr) -> Vec<u8> {
    let mut out = response_prelude(request, question_len);
    set_flags_and_ancount(&mut out, RCODE_NOERROR, 1);

    out.push(0xC0);
    out.push(0x0C); // pointer to offset 12, the question's QNAME
    let mut rr = [0u8; 2 + 2 + 4 + 2];
    BigEndian::write_u16(&mut rr[0..2], qtype.as_u16());
    BigEndian::write_u16(&mut rr[2..4], QCLASS_IN);
    BigEndian::write_u32(&mut rr[4..8], 300);
    BigEndian::write_u16(&mut rr[8..10], qtype.rdlength());
    out.extend_from_slice(&rr);

    match ip {
        IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
    }

    out
}

/// Build an error (or empty-answer) response: NXDOMAIN, NOTIMP, SERVFAIL, or
/// a NOERROR with ANCOUNT=0 for a type-mismatched local record.
pub fn build_error_response(request: &[u8], question_len: usize, rcode: u8) -> Vec<u8> {
    let mut out = response_prelude(request, question_len);
    set_flags_and_ancount(&mut out, rcode, 0);
    out
}

/// Given an upstream response and the qtype the original query asked for,
/// skip the question section(s) and decode the first answer RR, returning
/// its address and TTL if it's an A/AAAA/IN record of the expected type.
pub fn extract_first_answer(buf: &[u8], qtype: QType) -> Result<(IpAddr, u32), CodecError> {
    if buf.len() < HEADER_SIZE {
        return Err(CodecError::Truncated);
    }
    let ancount = BigEndian::read_u16(&buf[6..8]);
    if ancount == 0 {
        return Err(CodecError::Truncated);
    }
    let qdcount = qdcount(buf);

    let mut offset = HEADER_SIZE;
    for _ in 0..qdcount {
        let (_, name_len) = parse_name(buf, offset)?;
        offset += name_len + 4; // QTYPE + QCLASS
        if offset > buf.len() {
            return Err(CodecError::Truncated);
        }
    }

    // RR NAME: a bare compression pointer or a full label walk.
    if offset >= buf.len() {
        return Err(CodecError::Truncated);
    }
    let (_, name_len) = parse_name(buf, offset)?;
    offset += name_len;

    if offset + 10 > buf.len() {
        return Err(CodecError::Truncated);
    }
    let rr_type = BigEndian::read_u16(&buf[offset..offset + 2]);
    offset += 2;
    let rr_class = BigEndian::read_u16(&buf[offset..offset + 2]);
    offset += 2;
    let rr_ttl = BigEndian::read_u32(&buf[offset..offset + 4]);
    offset += 4;
    let rdlength = BigEndian::read_u16(&buf[offset..offset + 2]) as usize;
    offset += 2;

    if rr_type != qtype.as_u16() || rr_class != QCLASS_IN || rdlength != qtype.rdlength() as usize
    {
        return Err(CodecError::Truncated);
    }
    if offset + rdlength > buf.len() {
        return Err(CodecError::Truncated);
    }

    let ip = match qtype {
        QType::A => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[offset..offset + 4]);
            IpAddr::from(octets)
        }
        QType::Aaaa => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..offset + 16]);
            IpAddr::from(octets)
        }
    };

    Ok((ip, rr_ttl))
}
