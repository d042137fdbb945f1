//! Record emitters: the logical half of response assembly. Builds the
//! answer/authority/additional record lists a query should get;
//! `dispatch` is responsible for turning these into wire bytes
//! (including name compression and the 512-byte overflow policy).

use std::net::Ipv4Addr;

use dns_wire::protocol::types::{DomainName, RecordClass, RecordTypeWithData, ResourceRecord};

use crate::dataset::Soa;

/// Which section an SOA emission targets - the TTL and the emission
/// rule on "no SOA configured" differ between the two.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SoaSection {
    Answer,
    Authority,
}

/// Accumulates the records a query's answer should contain. Built up
/// by zone-apex handling and/or dataset `query` callbacks, then
/// finalized into wire sections by `dispatch`.
#[derive(Debug, Default)]
pub struct ResponseBuilder {
    answers: Vec<ResourceRecord>,
    authority: Vec<ResourceRecord>,
    additional: Vec<ResourceRecord>,
    /// Set when an emitter hits a condition that must clear AA on the
    /// final response (an SOA was requested but the zone has none).
    pub clear_aa: bool,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer_count(&self) -> usize {
        self.answers.len()
    }

    pub fn add_a(&mut self, name: &DomainName, ttl: u32, address: Ipv4Addr) {
        self.push_answer(ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::A { address },
            rclass: RecordClass::IN,
            ttl,
        });
    }

    pub fn add_ns(&mut self, name: &DomainName, ttl: u32, nsdname: DomainName) {
        self.push_answer(ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::NS { nsdname },
            rclass: RecordClass::IN,
            ttl,
        });
    }

    pub fn add_mx(&mut self, name: &DomainName, ttl: u32, preference: u16, exchange: DomainName) {
        self.push_answer(ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::MX { preference, exchange },
            rclass: RecordClass::IN,
            ttl,
        });
    }

    /// Produces a single TXT string of at most 254 content bytes,
    /// substituting every `$` in `text` with `subst` before the
    /// truncation is applied.
    pub fn add_txt(&mut self, name: &DomainName, ttl: u32, text: &str, subst: &str) {
        let octets = encode_txt(text, subst);
        self.push_answer(ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::TXT { octets },
            rclass: RecordClass::IN,
            ttl,
        });
    }

    /// Emits `zone_soa` into the answer or authority section. If the
    /// zone carries no SOA: emitting into the answer section clears
    /// AA and emits nothing; emitting into authority (on a negative
    /// answer) is silently skipped. `serial_fallback` substitutes for
    /// a configured serial of 0 (meaning "use the zone's load
    /// timestamp").
    pub fn add_soa(
        &mut self,
        zone_dn: &DomainName,
        zone_soa: Option<&Soa>,
        section: SoaSection,
        serial_fallback: u32,
    ) {
        let Some(soa) = zone_soa else {
            if section == SoaSection::Answer {
                self.clear_aa = true;
            }
            return;
        };

        let serial = if soa.serial == 0 { serial_fallback } else { soa.serial };
        let ttl = match section {
            SoaSection::Answer => soa.ttl,
            SoaSection::Authority => soa.minimum,
        };

        let rr = ResourceRecord {
            name: zone_dn.clone(),
            rtype_with_data: RecordTypeWithData::SOA {
                mname: soa.origin.clone(),
                rname: soa.rp.clone(),
                serial,
                refresh: soa.refresh,
                retry: soa.retry,
                expire: soa.expire,
                minimum: soa.minimum,
            },
            rclass: RecordClass::IN,
            ttl,
        };

        // SOA is always last in its section - callers are expected to
        // call add_soa after every other emitter for that section.
        match section {
            SoaSection::Answer => self.answers.push(rr),
            SoaSection::Authority => self.authority.push(rr),
        }
    }

    /// Answer-section duplicate suppression: a record with the same
    /// TYPE and RDATA as one already present is dropped. `RDATA`
    /// equality falls directly out of `RecordTypeWithData`'s
    /// structural `PartialEq`, since it carries both the type tag and
    /// the decoded data together.
    fn push_answer(&mut self, rr: ResourceRecord) {
        if self.answers.iter().any(|existing| existing.rtype_with_data == rr.rtype_with_data) {
            return;
        }
        self.answers.push(rr);
    }

    pub fn into_sections(self) -> (Vec<ResourceRecord>, Vec<ResourceRecord>, Vec<ResourceRecord>) {
        (self.answers, self.authority, self.additional)
    }
}

fn encode_txt(text: &str, subst: &str) -> Vec<u8> {
    let mut content = Vec::with_capacity(text.len());
    for ch in text.chars() {
        if ch == '$' {
            content.extend_from_slice(subst.as_bytes());
        } else {
            let mut buf = [0u8; 4];
            content.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
        }
        if content.len() >= 254 {
            break;
        }
    }
    content.truncate(254);

    let mut octets = Vec::with_capacity(content.len() + 1);
    octets.push(content.len() as u8);
    octets.extend_from_slice(&content);
    octets
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_wire::protocol::types::test_util::domain;

    #[test]
    fn txt_substitutes_and_truncates() {
        let mut builder = ResponseBuilder::new();
        builder.add_txt(&domain("example.com."), 300, "blocked: $", "1.2.3.4");
        let (answers, _, _) = builder.into_sections();
        let RecordTypeWithData::TXT { octets } = &answers[0].rtype_with_data else {
            panic!("expected TXT");
        };
        assert_eq!(b"blocked: 1.2.3.4".len() as u8, octets[0]);
        assert_eq!(b"blocked: 1.2.3.4", &octets[1..]);
    }

    #[test]
    fn txt_truncates_at_254_bytes() {
        let mut builder = ResponseBuilder::new();
        let long = "x".repeat(1000);
        builder.add_txt(&domain("example.com."), 300, &long, "$");
        let (answers, _, _) = builder.into_sections();
        let RecordTypeWithData::TXT { octets } = &answers[0].rtype_with_data else {
            panic!("expected TXT");
        };
        assert_eq!(254, octets[0]);
        assert_eq!(255, octets.len());
    }

    #[test]
    fn duplicate_a_records_are_suppressed() {
        let mut builder = ResponseBuilder::new();
        let name = domain("rbl.example.");
        builder.add_a(&name, 300, Ipv4Addr::new(127, 0, 0, 2));
        builder.add_a(&name, 300, Ipv4Addr::new(127, 0, 0, 2));
        builder.add_a(&name, 300, Ipv4Addr::new(127, 0, 0, 3));
        assert_eq!(2, builder.answer_count());
    }

    #[test]
    fn missing_soa_clears_aa_for_answer_section() {
        let mut builder = ResponseBuilder::new();
        builder.add_soa(&domain("example.com."), None, SoaSection::Answer, 0);
        assert!(builder.clear_aa);
        assert_eq!(0, builder.answer_count());
    }

    #[test]
    fn missing_soa_is_silent_for_authority_section() {
        let mut builder = ResponseBuilder::new();
        builder.add_soa(&domain("example.com."), None, SoaSection::Authority, 0);
        assert!(!builder.clear_aa);
    }
}
