//! implements the DNS protocol in a transport agnostic fashion

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_more::{Display, Error, From};
use serde::{Deserialize, Serialize};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};

#[derive(Debug, Display, From, Error)]
pub enum ProtocolError {
    Buffer(crate::dns::buffer::BufferError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ProtocolError>;

/// The only class this server answers with data
pub const CLASS_IN: u16 = 1;

/// `QueryType` represents the requested Record Type of a query
///
/// The specific type Unknown that an integer parameter in order to retain the
/// id of an unknown query when compiling the reply. An integer can be converted
/// to a querytype using the `from_num` function, and back to an integer using
/// the `to_num` method.
#[derive(PartialEq, Eq, Debug, Clone, Hash, Copy, Serialize, Deserialize)]
pub enum QueryType {
    Unknown(u16),
    A,     // 1
    Ns,    // 2
    Cname, // 5
    Soa,   // 6
    Mx,    // 15
    Txt,   // 16
    Aaaa,  // 28
    Srv,   // 33
    Opt,   // 41
}

impl QueryType {
    pub fn to_num(&self) -> u16 {
        match *self {
            QueryType::Unknown(x) => x,
            QueryType::A => 1,
            QueryType::Ns => 2,
            QueryType::Cname => 5,
            QueryType::Soa => 6,
            QueryType::Mx => 15,
            QueryType::Txt => 16,
            QueryType::Aaaa => 28,
            QueryType::Srv => 33,
            QueryType::Opt => 41,
        }
    }

    pub fn from_num(num: u16) -> QueryType {
        match num {
            1 => QueryType::A,
            2 => QueryType::Ns,
            5 => QueryType::Cname,
            6 => QueryType::Soa,
            15 => QueryType::Mx,
            16 => QueryType::Txt,
            28 => QueryType::Aaaa,
            33 => QueryType::Srv,
            41 => QueryType::Opt,
            _ => QueryType::Unknown(num),
        }
    }

    /// Parse a mnemonic such as `TXT` or `aaaa`
    pub fn from_name(name: &str) -> Option<QueryType> {
        match name.to_ascii_uppercase().as_str() {
            "A" => Some(QueryType::A),
            "NS" => Some(QueryType::Ns),
            "CNAME" => Some(QueryType::Cname),
            "SOA" => Some(QueryType::Soa),
            "MX" => Some(QueryType::Mx),
            "TXT" => Some(QueryType::Txt),
            "AAAA" => Some(QueryType::Aaaa),
            "SRV" => Some(QueryType::Srv),
            _ => None,
        }
    }
}

/// `DnsRecord` is the representation of a resource record on the wire
///
/// Only the types this service serves or meets in upstream answers are kept
/// structurally. Anything else is skipped over and surfaces as `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DnsRecord {
    Unknown {
        domain: String,
        qtype: u16,
        data_len: u16,
        ttl: u32,
    }, // 0
    A {
        domain: String,
        addr: Ipv4Addr,
        ttl: u32,
    }, // 1
    Cname {
        domain: String,
        host: String,
        ttl: u32,
    }, // 5
    Soa {
        domain: String,
        m_name: String,
        r_name: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    }, // 6
    Txt {
        domain: String,
        data: String,
        ttl: u32,
    }, // 16
    Aaaa {
        domain: String,
        addr: Ipv6Addr,
        ttl: u32,
    }, // 28
    Opt {
        packet_len: u16,
        flags: u32,
    }, // 41
}

impl DnsRecord {
    pub fn read<T: PacketBuffer>(buffer: &mut T) -> Result<DnsRecord> {
        let mut domain = String::new();
        buffer.read_qname(&mut domain)?;

        let qtype_num = buffer.read_u16()?;
        let qtype = QueryType::from_num(qtype_num);
        let class = buffer.read_u16()?;
        let ttl = buffer.read_u32()?;
        let data_len = buffer.read_u16()?;

        let data_start = buffer.pos();

        let record = match qtype {
            QueryType::A => {
                let raw_addr = buffer.read_u32()?;
                DnsRecord::A {
                    domain,
                    addr: Ipv4Addr::from(raw_addr),
                    ttl,
                }
            }
            QueryType::Aaaa => {
                let mut octets = [0u8; 16];
                for octet in octets.iter_mut() {
                    *octet = buffer.read()?;
                }
                DnsRecord::Aaaa {
                    domain,
                    addr: Ipv6Addr::from(octets),
                    ttl,
                }
            }
            QueryType::Cname => {
                let mut host = String::new();
                buffer.read_qname(&mut host)?;
                DnsRecord::Cname { domain, host, ttl }
            }
            QueryType::Soa => {
                let mut m_name = String::new();
                buffer.read_qname(&mut m_name)?;

                let mut r_name = String::new();
                buffer.read_qname(&mut r_name)?;

                DnsRecord::Soa {
                    domain,
                    m_name,
                    r_name,
                    serial: buffer.read_u32()?,
                    refresh: buffer.read_u32()?,
                    retry: buffer.read_u32()?,
                    expire: buffer.read_u32()?,
                    minimum: buffer.read_u32()?,
                    ttl,
                }
            }
            QueryType::Txt => {
                // one RR may carry several character-strings, which are joined
                let mut bytes = Vec::with_capacity(data_len as usize);
                let target_pos = data_start + data_len as usize;

                while buffer.pos() < target_pos {
                    let len = buffer.read()? as usize;
                    let pos = buffer.pos();
                    bytes.extend_from_slice(buffer.get_range(pos, len)?);
                    buffer.step(len)?;
                }

                // decode once, a chunk boundary may split a multibyte character
                let data = String::from_utf8_lossy(&bytes).into_owned();
                DnsRecord::Txt { domain, data, ttl }
            }
            QueryType::Opt => DnsRecord::Opt {
                packet_len: class,
                flags: ttl,
            },
            _ => DnsRecord::Unknown {
                domain,
                qtype: qtype_num,
                data_len,
                ttl,
            },
        };

        // always land exactly after the rdata, whatever was consumed above
        buffer.seek(data_start + data_len as usize)?;

        Ok(record)
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<usize> {
        let start_pos = buffer.pos();

        match *self {
            DnsRecord::A {
                ref domain,
                ref addr,
                ttl,
            } => {
                write_rr_preamble(buffer, domain, QueryType::A, ttl)?;
                buffer.write_u16(4)?;

                for octet in &addr.octets() {
                    buffer.write_u8(*octet)?;
                }
            }
            DnsRecord::Aaaa {
                ref domain,
                ref addr,
                ttl,
            } => {
                write_rr_preamble(buffer, domain, QueryType::Aaaa, ttl)?;
                buffer.write_u16(16)?;

                for segment in &addr.segments() {
                    buffer.write_u16(*segment)?;
                }
            }
            DnsRecord::Cname {
                ref domain,
                ref host,
                ttl,
            } => {
                write_rr_preamble(buffer, domain, QueryType::Cname, ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(host)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Soa {
                ref domain,
                ref m_name,
                ref r_name,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ttl,
            } => {
                write_rr_preamble(buffer, domain, QueryType::Soa, ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_qname(m_name)?;
                buffer.write_qname(r_name)?;
                buffer.write_u32(serial)?;
                buffer.write_u32(refresh)?;
                buffer.write_u32(retry)?;
                buffer.write_u32(expire)?;
                buffer.write_u32(minimum)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Txt {
                ref domain,
                ref data,
                ttl,
            } => {
                write_rr_preamble(buffer, domain, QueryType::Txt, ttl)?;

                let pos = buffer.pos();
                buffer.write_u16(0)?;

                buffer.write_character_strings(data)?;

                let size = buffer.pos() - (pos + 2);
                buffer.set_u16(pos, size as u16)?;
            }
            DnsRecord::Opt { packet_len, flags } => {
                buffer.write_u8(0)?;
                buffer.write_u16(QueryType::Opt.to_num())?;
                buffer.write_u16(packet_len)?;
                buffer.write_u32(flags)?;
                buffer.write_u16(0)?;
            }
            DnsRecord::Unknown { .. } => {
                log::debug!("Skipping record: {:?}", self);
            }
        }

        Ok(buffer.pos() - start_pos)
    }

    pub fn get_querytype(&self) -> QueryType {
        match *self {
            DnsRecord::A { .. } => QueryType::A,
            DnsRecord::Aaaa { .. } => QueryType::Aaaa,
            DnsRecord::Cname { .. } => QueryType::Cname,
            DnsRecord::Soa { .. } => QueryType::Soa,
            DnsRecord::Txt { .. } => QueryType::Txt,
            DnsRecord::Opt { .. } => QueryType::Opt,
            DnsRecord::Unknown { qtype, .. } => QueryType::Unknown(qtype),
        }
    }

    pub fn get_domain(&self) -> Option<&str> {
        match *self {
            DnsRecord::A { ref domain, .. }
            | DnsRecord::Aaaa { ref domain, .. }
            | DnsRecord::Cname { ref domain, .. }
            | DnsRecord::Soa { ref domain, .. }
            | DnsRecord::Txt { ref domain, .. }
            | DnsRecord::Unknown { ref domain, .. } => Some(domain),
            DnsRecord::Opt { .. } => None,
        }
    }

    pub fn get_ttl(&self) -> u32 {
        match *self {
            DnsRecord::A { ttl, .. }
            | DnsRecord::Aaaa { ttl, .. }
            | DnsRecord::Cname { ttl, .. }
            | DnsRecord::Soa { ttl, .. }
            | DnsRecord::Txt { ttl, .. }
            | DnsRecord::Unknown { ttl, .. } => ttl,
            DnsRecord::Opt { .. } => 0,
        }
    }
}

fn write_rr_preamble<T: PacketBuffer>(
    buffer: &mut T,
    domain: &str,
    qtype: QueryType,
    ttl: u32,
) -> Result<()> {
    buffer.write_qname(domain)?;
    buffer.write_u16(qtype.to_num())?;
    buffer.write_u16(CLASS_IN)?;
    buffer.write_u32(ttl)?;

    Ok(())
}

/// The result code for a DNS query, as described in RFC 1035
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResultCode {
    NOERROR = 0,
    FORMERR = 1,
    SERVFAIL = 2,
    NXDOMAIN = 3,
    NOTIMP = 4,
    REFUSED = 5,
}

impl Default for ResultCode {
    fn default() -> Self {
        ResultCode::NOERROR
    }
}

impl ResultCode {
    pub fn from_num(num: u8) -> ResultCode {
        match num {
            1 => ResultCode::FORMERR,
            2 => ResultCode::SERVFAIL,
            3 => ResultCode::NXDOMAIN,
            4 => ResultCode::NOTIMP,
            5 => ResultCode::REFUSED,
            _ => ResultCode::NOERROR,
        }
    }
}

/// Representation of a DNS header
#[derive(Clone, Debug, Default)]
pub struct DnsHeader {
    pub id: u16, // 16 bits

    pub recursion_desired: bool,    // 1 bit
    pub truncated_message: bool,    // 1 bit
    pub authoritative_answer: bool, // 1 bit
    pub opcode: u8,                 // 4 bits
    pub response: bool,             // 1 bit

    pub rescode: ResultCode,       // 4 bits
    pub checking_disabled: bool,   // 1 bit
    pub authed_data: bool,         // 1 bit
    pub z: bool,                   // 1 bit
    pub recursion_available: bool, // 1 bit

    pub questions: u16,             // 16 bits
    pub answers: u16,               // 16 bits
    pub authoritative_entries: u16, // 16 bits
    pub resource_entries: u16,      // 16 bits
}

impl DnsHeader {
    pub fn new() -> DnsHeader {
        DnsHeader::default()
    }

    pub fn binary_len(&self) -> usize {
        12
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_u16(self.id)?;

        buffer.write_u8(
            (self.recursion_desired as u8)
                | ((self.truncated_message as u8) << 1)
                | ((self.authoritative_answer as u8) << 2)
                | ((self.opcode & 0x0F) << 3)
                | ((self.response as u8) << 7),
        )?;

        buffer.write_u8(
            (self.rescode as u8)
                | ((self.checking_disabled as u8) << 4)
                | ((self.authed_data as u8) << 5)
                | ((self.z as u8) << 6)
                | ((self.recursion_available as u8) << 7),
        )?;

        buffer.write_u16(self.questions)?;
        buffer.write_u16(self.answers)?;
        buffer.write_u16(self.authoritative_entries)?;
        buffer.write_u16(self.resource_entries)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        self.id = buffer.read_u16()?;

        let flags = buffer.read_u16()?;
        let a = (flags >> 8) as u8;
        let b = (flags & 0xFF) as u8;
        self.recursion_desired = (a & (1 << 0)) > 0;
        self.truncated_message = (a & (1 << 1)) > 0;
        self.authoritative_answer = (a & (1 << 2)) > 0;
        self.opcode = (a >> 3) & 0x0F;
        self.response = (a & (1 << 7)) > 0;

        self.rescode = ResultCode::from_num(b & 0x0F);
        self.checking_disabled = (b & (1 << 4)) > 0;
        self.authed_data = (b & (1 << 5)) > 0;
        self.z = (b & (1 << 6)) > 0;
        self.recursion_available = (b & (1 << 7)) > 0;

        self.questions = buffer.read_u16()?;
        self.answers = buffer.read_u16()?;
        self.authoritative_entries = buffer.read_u16()?;
        self.resource_entries = buffer.read_u16()?;

        Ok(())
    }
}

/// Representation of a DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
}

impl DnsQuestion {
    pub fn new(name: String, qtype: QueryType) -> DnsQuestion {
        DnsQuestion {
            name,
            qtype,
            qclass: CLASS_IN,
        }
    }

    pub fn binary_len(&self) -> usize {
        self.name
            .split('.')
            .map(|x| x.len() + 1)
            .fold(1, |x, y| x + y)
            + 4
    }

    pub fn write<T: PacketBuffer>(&self, buffer: &mut T) -> Result<()> {
        buffer.write_qname(&self.name)?;
        buffer.write_u16(self.qtype.to_num())?;
        buffer.write_u16(self.qclass)?;

        Ok(())
    }

    pub fn read<T: PacketBuffer>(&mut self, buffer: &mut T) -> Result<()> {
        buffer.read_qname(&mut self.name)?;
        self.qtype = QueryType::from_num(buffer.read_u16()?);
        self.qclass = buffer.read_u16()?;

        Ok(())
    }
}

impl fmt::Display for DnsQuestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} (class {})", self.name, self.qtype, self.qclass)
    }
}

/// Representation of a complete DNS packet
///
/// A DNS packet can be read and written in a single operation, and is used
/// both by the responder and by the outbound client.
#[derive(Clone, Debug, Default)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub resources: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn new() -> DnsPacket {
        DnsPacket::default()
    }

    pub fn from_buffer<T: PacketBuffer>(buffer: &mut T) -> Result<DnsPacket> {
        let mut result = DnsPacket::new();
        result.header.read(buffer)?;

        for _ in 0..result.header.questions {
            let mut question = DnsQuestion::new(String::new(), QueryType::Unknown(0));
            question.read(buffer)?;
            result.questions.push(question);
        }

        for _ in 0..result.header.answers {
            result.answers.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.authoritative_entries {
            result.authorities.push(DnsRecord::read(buffer)?);
        }
        for _ in 0..result.header.resource_entries {
            result.resources.push(DnsRecord::read(buffer)?);
        }

        Ok(result)
    }

    /// The UDP payload size advertised through EDNS, if any
    pub fn edns_payload_size(&self) -> Option<u16> {
        self.resources.iter().find_map(|rec| match *rec {
            DnsRecord::Opt { packet_len, .. } => Some(packet_len),
            _ => None,
        })
    }

    /// Text of every TXT answer owned by `qname`, one entry per resource record
    pub fn txt_answers(&self, qname: &str) -> Vec<String> {
        self.answers
            .iter()
            .filter_map(|rec| match *rec {
                DnsRecord::Txt {
                    ref domain,
                    ref data,
                    ..
                } if domain.eq_ignore_ascii_case(qname) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    /// Write the packet, dropping records that would push it past `max_size`
    /// and flagging the header as truncated when that happens.
    pub fn write<T: PacketBuffer>(&mut self, buffer: &mut T, max_size: usize) -> Result<()> {
        let mut test_buffer = VectorPacketBuffer::new();

        self.header.answers = 0;
        self.header.authoritative_entries = 0;
        self.header.resource_entries = 0;

        let mut size = self.header.binary_len();
        for question in &self.questions {
            size += question.binary_len();
            question.write(&mut test_buffer)?;
        }

        let mut record_count = self.answers.len() + self.authorities.len() + self.resources.len();

        for (i, rec) in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .enumerate()
        {
            size += rec.write(&mut test_buffer)?;
            if size > max_size {
                record_count = i;
                self.header.truncated_message = true;
                break;
            } else if i < self.answers.len() {
                self.header.answers += 1;
            } else if i < self.answers.len() + self.authorities.len() {
                self.header.authoritative_entries += 1;
            } else {
                self.header.resource_entries += 1;
            }
        }

        self.header.questions = self.questions.len() as u16;

        self.header.write(buffer)?;

        for question in &self.questions {
            question.write(buffer)?;
        }

        for rec in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.resources.iter())
            .take(record_count)
        {
            rec.write(buffer)?;
        }

        Ok(())
    }
}
