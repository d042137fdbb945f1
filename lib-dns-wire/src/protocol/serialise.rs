//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }

    /// Serialises this message, dropping trailing records (answer
    /// first, then authority, then additional) so the result never
    /// exceeds `max_len` octets. The header's AA bit is cleared
    /// whenever any record had to be dropped, since the response is no
    /// longer a complete authoritative answer. Returns the encoded
    /// octets and whether anything was dropped.
    ///
    /// # Errors
    ///
    /// If the message's section counts do not fit a `u16`.
    pub fn serialise_bounded(mut self, max_len: usize) -> Result<(Vec<u8>, bool), Error> {
        let mut dropped = false;
        {
            // Try the full message first; only pay for the
            // record-by-record budget walk if it doesn't fit.
            let mut probe = WritableBuffer::default();
            let fits = self.clone().serialise(&mut probe).is_ok() && probe.index() <= max_len;
            if fits {
                return Ok((probe.octets, false));
            }
        }

        let mut buffer = WritableBuffer::default();
        self.header.is_authoritative = false;
        self.header.serialise(&mut buffer);
        let counts_index = buffer.index();
        buffer.write_u16(0);
        buffer.write_u16(0);
        buffer.write_u16(0);
        buffer.write_u16(0);

        let qdcount = usize_to_u16(self.questions.len())?;
        for question in self.questions {
            question.serialise(&mut buffer);
        }

        let mut write_section = |buffer: &mut WritableBuffer, rrs: Vec<ResourceRecord>| -> Result<u16, Error> {
            let mut count = 0u16;
            for rr in rrs {
                let checkpoint = buffer.index();
                match rr.serialise(buffer) {
                    Ok(()) if buffer.index() <= max_len => count += 1,
                    _ => {
                        buffer.truncate(checkpoint);
                        dropped = true;
                        break;
                    }
                }
            }
            Ok(count)
        };

        let ancount = write_section(&mut buffer, self.answers)?;
        let nscount = if dropped { 0 } else { write_section(&mut buffer, self.authority)? };
        let arcount = if dropped { 0 } else { write_section(&mut buffer, self.additional)? };

        buffer.octets[counts_index..counts_index + 2].copy_from_slice(&qdcount.to_be_bytes());
        buffer.octets[counts_index + 2..counts_index + 4].copy_from_slice(&ancount.to_be_bytes());
        buffer.octets[counts_index + 4..counts_index + 6].copy_from_slice(&nscount.to_be_bytes());
        buffer.octets[counts_index + 6..counts_index + 8].copy_from_slice(&arcount.to_be_bytes());

        Ok((buffer.octets, dropped))
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer),
            RecordTypeWithData::MD { madname } => madname.serialise(buffer),
            RecordTypeWithData::MF { madname } => madname.serialise(buffer),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer),
            RecordTypeWithData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                mname.serialise(buffer);
                rname.serialise(buffer);
                buffer.write_u32(serial);
                buffer.write_u32(refresh);
                buffer.write_u32(retry);
                buffer.write_u32(expire);
                buffer.write_u32(minimum);
            }
            RecordTypeWithData::MB { madname } => madname.serialise(buffer),
            RecordTypeWithData::MG { mdmname } => mdmname.serialise(buffer),
            RecordTypeWithData::MR { newname } => newname.serialise(buffer),
            RecordTypeWithData::NULL { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::WKS { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer),
            RecordTypeWithData::HINFO { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::MINFO { rmailbx, emailbx } => {
                rmailbx.serialise(buffer);
                emailbx.serialise(buffer);
            }
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(preference);
                exchange.serialise(buffer);
            }
            RecordTypeWithData::TXT { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(&octets),
        };

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Writes this domain to the buffer, using the pointer
    /// compression scheme of RFC 1035 section 4.1.4: if some suffix
    /// of this name's labels has already been written earlier in the
    /// buffer, a pointer to that earlier occurrence is emitted
    /// instead of repeating the labels.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        let mut labels = self.labels;

        loop {
            // the root label: always a single zero octet, never
            // worth pointing at.
            if labels.len() == 1 {
                buffer.write_u8(0);
                return;
            }

            if let Some(ptr) = buffer.compression.find(&labels) {
                buffer.write_u16(0xC000 | ptr);
                return;
            }

            let offset = buffer.index();
            buffer.compression.insert(&labels, offset);

            let label = labels.remove(0);
            // labels are bounded to 63 octets by construction
            // (`DomainName::from_labels`/`deserialise`), so this cast
            // never truncates.
            buffer.write_u8(label.len() as u8);
            buffer.write_octets(&label);
        }
    }
}

impl QueryType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl QueryClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

/// Table of domain-name suffixes already written to a buffer, so that
/// later occurrences can be replaced with a 2-octet pointer.
///
/// Lookup is an exact-match linear scan over previously-registered
/// suffixes, in registration order - the same approach `rbldnsd`
/// takes, rather than a hash map keyed on the label sequence.
/// Registration is bounded to keep both the scan and the table
/// itself cheap: at most [`CompressionTable::MAX_ENTRIES`] suffixes
/// are kept, and a suffix longer than
/// [`CompressionTable::MAX_SUFFIX_LEN`] octets is never registered
/// (compressing it back would save little, and it'd dominate the
/// scan).
#[derive(Debug, Default)]
pub struct CompressionTable {
    entries: Vec<(Vec<Vec<u8>>, u16)>,
}

impl CompressionTable {
    /// Mirrors the maximum number of labels permitted in a domain
    /// name (`DNS_MAXLABELS`); a packet cannot contain more distinct
    /// compressible suffixes than this without being malformed.
    pub const MAX_ENTRIES: usize = 128;

    /// A suffix this long would not fit in a pointer-addressable
    /// 14-bit offset's worth of savings anyway.
    pub const MAX_SUFFIX_LEN: usize = 128;

    fn suffix_len(labels: &[Vec<u8>]) -> usize {
        labels.iter().map(|l| l.len() + 1).sum()
    }

    fn find(&self, labels: &[Vec<u8>]) -> Option<u16> {
        self.entries
            .iter()
            .find(|(suffix, _)| suffix.as_slice() == labels)
            .map(|(_, offset)| *offset)
    }

    /// Registers `labels` (a domain name, or a label-suffix of one)
    /// as appearing at `offset` in the buffer, so that later domains
    /// sharing this suffix can point back to it instead.  A no-op
    /// once the table is full, the suffix is too long, or `offset`
    /// doesn't fit in a 14-bit pointer.
    pub fn insert(&mut self, labels: &[Vec<u8>], offset: usize) {
        if self.entries.len() >= Self::MAX_ENTRIES {
            return;
        }
        if Self::suffix_len(labels) >= Self::MAX_SUFFIX_LEN {
            return;
        }
        if let Ok(offset) = u16::try_from(offset) {
            if offset < 0xC000 {
                self.entries.push((labels.to_vec(), offset));
            }
        }
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
    compression: CompressionTable,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
            compression: CompressionTable::default(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Discards everything written after `len`. Does not unwind
    /// compression-table entries registered while writing the
    /// discarded bytes - callers that truncate must not serialise
    /// anything further into this buffer.
    pub fn truncate(&mut self, len: usize) {
        self.octets.truncate(len);
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        for octet in octets {
            self.octets.push(*octet);
        }
    }

    /// Pre-seeds the compression table with a domain's labels at a
    /// known offset, without writing anything.  Used by callers which
    /// copy the question verbatim into the response ahead of calling
    /// into this codec, so that answer records can point back into
    /// that copied question.
    pub fn register_compressible_domain(&mut self, name: &DomainName, offset: usize) {
        let mut relative_offset = 0usize;
        let mut labels = name.labels.clone();
        while labels.len() > 1 {
            self.compression.insert(&labels, offset + relative_offset);
            relative_offset += labels[0].len() + 1;
            labels.remove(0);
        }
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(Error::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn test_sets_rdlength_and_compresses_shared_suffix() {
        let mut buf = WritableBuffer::default();
        buf.write_u8(1);
        buf.write_u8(2);
        buf.write_u8(3);
        buf.write_u8(4);

        let rr = ResourceRecord {
            name: domain("www.example.com."),
            rtype_with_data: RecordTypeWithData::MX {
                preference: 32,
                exchange: domain("mx.example.com."),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        };
        let _ = rr.serialise(&mut buf);

        assert_eq!(
            vec![
                1, 2, 3, 4,
                // NAME: www.example.com.
                3, 119, 119, 119, // "www"
                7, 101, 120, 97, 109, 112, 108, 101, // "example"
                3, 99, 111, 109, 0, // "com"
                // TYPE
                0b0000_0000, 0b0000_1111, // MX
                // CLASS
                0b0000_0000, 0b0000_0001, // IN
                // TTL
                0b0000_0000, 0b0000_0000, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0, 7,
                // RDATA: preference, then "mx" followed by a pointer
                // back to "example.com." inside the NAME field above.
                0, 32, // preference
                2, 109, 120, // "mx"
                0b1100_0000, 8, // pointer to offset 8 ("example.com.")
            ],
            buf.octets,
        );
    }

    #[test]
    fn roundtrips_through_compression() {
        let rr1 = a_record("www.example.com.", std::net::Ipv4Addr::new(1, 2, 3, 4));
        let rr2 = a_record("mail.example.com.", std::net::Ipv4Addr::new(5, 6, 7, 8));

        let msg = Message {
            header: crate::protocol::types::Header {
                id: 1,
                is_response: true,
                opcode: Opcode::Standard,
                is_authoritative: true,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("www.example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: vec![rr1, rr2],
            authority: Vec::new(),
            additional: Vec::new(),
        };

        let octets = msg.clone().into_octets().unwrap();
        let parsed = Message::from_octets(&octets).unwrap();

        assert_eq!(msg.header.id, parsed.header.id);
        assert_eq!(msg.answers, parsed.answers);
        // compression should have made the second A record smaller
        // than it would be if the name were repeated in full.
        assert!(octets.len() < 512);
    }

    fn make_message(answers: Vec<ResourceRecord>) -> Message {
        Message {
            header: Header {
                id: 1,
                is_response: true,
                opcode: Opcode::Standard,
                is_authoritative: true,
                is_truncated: false,
                recursion_desired: false,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain("example.com."),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers,
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    #[test]
    fn serialise_bounded_keeps_everything_under_budget() {
        let msg = make_message(vec![a_record("example.com.", std::net::Ipv4Addr::new(1, 2, 3, 4))]);
        let (octets, dropped) = msg.serialise_bounded(512).unwrap();
        assert!(!dropped);
        assert_eq!(1, Message::from_octets(&octets).unwrap().answers.len());
    }

    #[test]
    fn serialise_bounded_drops_trailing_records_and_clears_aa() {
        let answers: Vec<_> = (0..100u8)
            .map(|i| a_record("example.com.", std::net::Ipv4Addr::new(10, 0, 0, i)))
            .collect();
        let msg = make_message(answers);
        let (octets, dropped) = msg.serialise_bounded(512).unwrap();
        assert!(dropped);
        assert!(octets.len() <= 512);
        let parsed = Message::from_octets(&octets).unwrap();
        assert!(!parsed.header.is_authoritative);
        assert!(parsed.answers.len() < 100);
    }
}
