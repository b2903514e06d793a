//! DNS message parsing and construction.
//!
//! Only the parts of the wire format the proxy needs are modelled: the
//! header, a single question, and A/AAAA answers. Authority and additional
//! sections are counted but never parsed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// Flags used for synthesized answers: response, recursion desired/available.
pub const RESPONSE_FLAGS: u16 = 0x8180;

const FLAG_AUTHORITATIVE: u16 = 0x0400;
const POINTER_MASK: u8 = 0xC0;
const MAX_LABEL_LEN: usize = 63;

/// Errors produced while decoding a DNS message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("message truncated at offset {0}")]
    Truncated(usize),
    #[error("answer count {expected} exceeds the records present ({found})")]
    AnswerCountMismatch { expected: u16, found: u16 },
    #[error("compression pointer in question name at offset {0}")]
    UnsupportedPointer(usize),
    #[error("invalid label length {len} at offset {offset}")]
    InvalidLabel { offset: usize, len: u8 },
    #[error("message carries no question")]
    NoQuestion,
}

/// The question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Wire-encoded name, including the terminating zero label.
    pub name: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
}

impl Question {
    /// Dotted, human readable form of the name (for logs).
    pub fn domain(&self) -> String {
        let mut parts = Vec::new();
        let mut pos = 0;
        while pos < self.name.len() {
            let len = self.name[pos] as usize;
            if len == 0 || pos + 1 + len > self.name.len() {
                break;
            }
            parts.push(String::from_utf8_lossy(&self.name[pos + 1..pos + 1 + len]).into_owned());
            pos += 1 + len;
        }
        if parts.is_empty() {
            ".".to_string()
        } else {
            parts.join(".")
        }
    }

    pub fn is_address_query(&self) -> bool {
        self.qtype == TYPE_A || self.qtype == TYPE_AAAA
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.name);
        buf.extend_from_slice(&self.qtype.to_be_bytes());
        buf.extend_from_slice(&self.qclass.to_be_bytes());
    }
}

/// An A or AAAA answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRecord {
    pub ttl: u32,
    pub address: IpAddr,
}

/// A decoded DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub question: Question,
    /// Address answers in wire order. Other record types are skipped.
    pub answers: Vec<AddressRecord>,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl Message {
    /// Decode a DNS message from raw bytes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }

        let id = read_u16(data, 0)?;
        let flags = read_u16(data, 2)?;
        let qdcount = read_u16(data, 4)?;
        let ancount = read_u16(data, 6)?;
        let authority_count = read_u16(data, 8)?;
        let additional_count = read_u16(data, 10)?;

        if qdcount == 0 {
            return Err(DecodeError::NoQuestion);
        }

        let (question, mut pos) = decode_question(data, HEADER_LEN)?;

        let mut answers = Vec::new();
        for index in 0..ancount {
            if pos >= data.len() {
                return Err(DecodeError::AnswerCountMismatch {
                    expected: ancount,
                    found: index,
                });
            }
            pos = skip_name(data, pos)?;

            let rtype = read_u16(data, pos)?;
            let ttl = read_u32(data, pos + 4)?;
            let rdlength = read_u16(data, pos + 8)? as usize;
            let rdata_start = pos + 10;

            // A lone non-address answer ends the scan without surfacing anything.
            if ancount == 1 && !is_address_record(rtype, rdlength) {
                break;
            }

            let rdata = data
                .get(rdata_start..rdata_start + rdlength)
                .ok_or(DecodeError::Truncated(data.len()))?;

            match (rtype, rdata.len()) {
                (TYPE_A, 4) => answers.push(AddressRecord {
                    ttl,
                    address: IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                }),
                (TYPE_AAAA, 16) => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(rdata);
                    answers.push(AddressRecord {
                        ttl,
                        address: IpAddr::V6(Ipv6Addr::from(octets)),
                    });
                }
                _ => {}
            }

            pos = rdata_start + rdlength;
        }

        Ok(Self {
            id,
            flags,
            question,
            answers,
            authority_count,
            additional_count,
        })
    }

    /// Encode the message to wire format bytes.
    ///
    /// Answer names are written as a pointer to the question name. Authority
    /// and additional sections are not carried, so their counts are zero.
    pub fn encode(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        self.question.encode(&mut data);

        for answer in &self.answers {
            encode_answer(&mut data, answer.ttl, answer.address);
        }

        data
    }

    /// Whether the message carries authority: the AA bit or a non-empty
    /// authority section (referrals, NXDOMAIN/NODATA with SOA).
    pub fn is_authoritative(&self) -> bool {
        self.flags & FLAG_AUTHORITATIVE != 0 || self.authority_count > 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Cache key for the question in this message.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.question)
    }
}

/// First usable address in a reply, if any.
///
/// Authoritative replies yield nothing for A queries; AAAA queries always
/// attempt extraction.
pub fn first_address(message: &Message) -> Option<IpAddr> {
    all_addresses(message).next()
}

/// Every address answer in a reply, in wire order, subject to the same
/// authority rule as [`first_address`].
pub fn all_addresses(message: &Message) -> impl Iterator<Item = IpAddr> + '_ {
    let skip = message.is_authoritative() && message.question.qtype != TYPE_AAAA;
    message
        .answers
        .iter()
        .filter(move |_| !skip)
        .map(|record| record.address)
}

/// Cache key: lower-cased wire-encoded name plus query type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: Vec<u8>,
    qtype: u16,
}

impl CacheKey {
    pub fn new(question: &Question) -> Self {
        Self {
            name: question.name.to_ascii_lowercase(),
            qtype: question.qtype,
        }
    }
}

/// A pre-rendered synthesized response without its transaction ID.
///
/// Layout: flags, counts, the echoed question, then a single answer whose
/// data is the last field of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnswerTemplate {
    bytes: Vec<u8>,
    answer_offset: usize,
}

impl AnswerTemplate {
    /// Render an answer for `question` pointing at `address`.
    pub fn new(question: &Question, ttl: u32, address: IpAddr) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + question.name.len() + 32);
        bytes.extend_from_slice(&RESPONSE_FLAGS.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        bytes.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
        bytes.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
        question.encode(&mut bytes);
        let answer_offset = bytes.len();
        encode_answer(&mut bytes, ttl, address);

        Self {
            bytes,
            answer_offset,
        }
    }

    /// The address the answer currently points at.
    pub fn address(&self) -> IpAddr {
        let rdata = &self.bytes[self.answer_offset + 12..];
        match <[u8; 4]>::try_from(rdata) {
            Ok(v4) => IpAddr::V4(Ipv4Addr::from(v4)),
            Err(_) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rdata[..16]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }

    pub fn ttl(&self) -> u32 {
        let at = self.answer_offset + 6;
        u32::from_be_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ])
    }

    /// Rewrite the answer to point at `address`, keeping name, class and TTL.
    pub fn with_address(&self, address: IpAddr) -> Self {
        let mut bytes = self.bytes[..self.answer_offset].to_vec();
        encode_answer(&mut bytes, self.ttl(), address);
        Self {
            bytes,
            answer_offset: self.answer_offset,
        }
    }

    /// Full response bytes with `id` as transaction ID.
    pub fn with_transaction_id(&self, id: u16) -> Vec<u8> {
        let mut response = Vec::with_capacity(self.bytes.len() + 2);
        response.extend_from_slice(&id.to_be_bytes());
        response.extend_from_slice(&self.bytes);
        response
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn encode_answer(buf: &mut Vec<u8>, ttl: u32, address: IpAddr) {
    buf.extend_from_slice(&[0xC0, 0x0C]); // Pointer to the question name
    match address {
        IpAddr::V4(v4) => {
            buf.extend_from_slice(&TYPE_A.to_be_bytes());
            buf.extend_from_slice(&CLASS_IN.to_be_bytes());
            buf.extend_from_slice(&ttl.to_be_bytes());
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.extend_from_slice(&TYPE_AAAA.to_be_bytes());
            buf.extend_from_slice(&CLASS_IN.to_be_bytes());
            buf.extend_from_slice(&ttl.to_be_bytes());
            buf.extend_from_slice(&16u16.to_be_bytes());
            buf.extend_from_slice(&v6.octets());
        }
    }
}

fn is_address_record(rtype: u16, rdlength: usize) -> bool {
    matches!((rtype, rdlength), (TYPE_A, 4) | (TYPE_AAAA, 16))
}

fn decode_question(data: &[u8], start: usize) -> Result<(Question, usize), DecodeError> {
    let mut pos = start;

    loop {
        let len = *data.get(pos).ok_or(DecodeError::Truncated(data.len()))?;
        if len & POINTER_MASK == POINTER_MASK {
            return Err(DecodeError::UnsupportedPointer(pos));
        }
        if len as usize > MAX_LABEL_LEN {
            return Err(DecodeError::InvalidLabel { offset: pos, len });
        }
        pos += 1;
        if len == 0 {
            break;
        }
        pos += len as usize;
    }

    let name = data
        .get(start..pos)
        .ok_or(DecodeError::Truncated(data.len()))?
        .to_vec();
    let qtype = read_u16(data, pos)?;
    let qclass = read_u16(data, pos + 2)?;

    Ok((Question { name, qtype, qclass }, pos + 4))
}

/// Skip a possibly compressed name, returning the offset just past it.
fn skip_name(data: &[u8], mut pos: usize) -> Result<usize, DecodeError> {
    loop {
        let len = *data.get(pos).ok_or(DecodeError::Truncated(data.len()))?;
        if len & POINTER_MASK == POINTER_MASK {
            if pos + 2 > data.len() {
                return Err(DecodeError::Truncated(data.len()));
            }
            return Ok(pos + 2);
        }
        if len as usize > MAX_LABEL_LEN {
            return Err(DecodeError::InvalidLabel { offset: pos, len });
        }
        pos += 1;
        if len == 0 {
            return Ok(pos);
        }
        pos += len as usize;
    }
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, DecodeError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DecodeError::Truncated(data.len()))
}

fn read_u32(data: &[u8], pos: usize) -> Result<u32, DecodeError> {
    data.get(pos..pos + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(DecodeError::Truncated(data.len()))
}
