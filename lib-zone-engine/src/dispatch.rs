//! Ties zone match and query dispatch together: takes a parsed
//! [`Query`] plus the skeleton `Message` it was parsed from and
//! produces the logical response `Message` - header, question, and
//! the three record sections. Turning that into bounded wire bytes is
//! `Message::serialise_bounded`; this module only ever builds the
//! in-memory record lists.

use std::net::Ipv4Addr;

use dns_wire::protocol::types::{Message, Opcode, Rcode, ResourceRecord};

use crate::query::{self, is_meta_qtype, qclass_is_in, qclass_is_wildcard, Query};
use crate::response::{ResponseBuilder, SoaSection};
use crate::zone::{Zone, ZoneTable};

/// True if `flags` requested `wanted`, either directly or via an ANY
/// query (which matches every type flag, not just its own bit).
fn wants(flags: u16, wanted: u16) -> bool {
    flags & (wanted | query::type_flags::ANY) != 0
}

/// Decodes up to 4 leading labels of an IPv4-reverse sub-name into an
/// address. Labels closest to the zone apex are the most significant
/// octets, matching the convention rbldnsd reverse zones share with
/// `in-addr.arpa`. Fewer than 4 labels decodes the octets given and
/// leaves the rest zero - datasets interpret the returned octet count
/// to know how many are significant for range matching.
fn decode_ipv4_reverse(labels: &[Vec<u8>]) -> Option<(Ipv4Addr, u8)> {
    if labels.is_empty() || labels.len() > 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, label) in labels.iter().enumerate() {
        let text = std::str::from_utf8(label).ok()?;
        if text.is_empty() || text.len() > 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u16 = text.parse().ok()?;
        octets[i] = u8::try_from(value).ok()?;
    }
    Some((Ipv4Addr::from(octets), labels.len() as u8))
}

/// Runs zone match and query dispatch against a parsed query, and
/// builds the logical response message. `message` is the parsed
/// request (its header and question are reused to build the
/// response skeleton); `query` is the same request's parsed query
/// form, as produced by [`crate::query::parse_query`].
pub fn dispatch(message: &Message, mut query: Query, zones: &ZoneTable) -> Message {
    let mut response = message.make_response();
    response.header.recursion_available = false;

    if message.header.opcode != Opcode::Standard || message.header.is_authoritative || message.header.is_truncated {
        response.header.rcode = Rcode::NotImplemented;
        return response;
    }

    if qclass_is_in(query.qclass) {
        response.header.is_authoritative = true;
    } else if !qclass_is_wildcard(query.qclass) {
        response.header.rcode = Rcode::FormatError;
        return response;
    }

    if is_meta_qtype(query.qtype) {
        response.header.is_authoritative = false;
        response.header.rcode = Rcode::NotImplemented;
        return response;
    }

    let Some(zone) = zones.find_match(&query.reversed_labels) else {
        response.header.is_authoritative = false;
        response.header.rcode = Rcode::Refused;
        return response;
    };

    if !zone.is_loaded() {
        response.header.is_authoritative = false;
        response.header.rcode = Rcode::ServerFailure;
        return response;
    }

    // The dataset's `$SOA` serial may be 0, meaning "substitute the
    // zone's load timestamp" - truncated to 32 bits, which is fine
    // until the year 2106.
    let serial_fallback = zone.stamp() as u32;
    let delta = query.reversed_labels.len() - zone.label_count();

    let mut builder = ResponseBuilder::new();
    let found = if delta == 0 {
        match apex_query(&mut query, zone, &mut builder, serial_fallback) {
            Some(found) => found,
            None => {
                response.header.is_authoritative = false;
                response.header.rcode = Rcode::Refused;
                return response;
            }
        }
    } else {
        subname_query(&mut query, zone, &mut builder)
    };

    if builder.clear_aa {
        response.header.is_authoritative = false;
    }

    let (answers, mut authority, additional) = builder.into_sections();
    response.answers = answers;

    if !found {
        response.header.rcode = Rcode::NameError;
        authority.extend(negative_soa(zone, serial_fallback));
    } else if response.answers.is_empty() {
        authority.extend(negative_soa(zone, serial_fallback));
    }

    response.authority = authority;
    response.additional = additional;
    response
}

fn negative_soa(zone: &Zone, serial_fallback: u32) -> Vec<ResourceRecord> {
    let mut soa_builder = ResponseBuilder::new();
    soa_builder.add_soa(&zone.dn, zone.effective_soa().as_ref(), SoaSection::Authority, serial_fallback);
    let (_, authority, _) = soa_builder.into_sections();
    authority
}

/// Query at the zone apex: serve only NS and/or SOA from the zone's
/// own metadata. Returns `None` if the client asked for a record kind
/// the zone doesn't carry, which the caller turns into REFUSED;
/// otherwise `Some(true)` (an apex query is always "found", even if it
/// added no records).
fn apex_query(query: &mut Query, zone: &Zone, builder: &mut ResponseBuilder, serial_fallback: u32) -> Option<bool> {
    let wants_ns = wants(query.type_flags, query::type_flags::NS);
    let wants_soa = wants(query.type_flags, query::type_flags::SOA);
    let ns = zone.effective_ns();
    let soa = zone.effective_soa();

    if (wants_ns && ns.is_none()) || (wants_soa && soa.is_none()) {
        return None;
    }

    if wants_ns {
        if let Some(ns) = &ns {
            for server in &ns.servers {
                builder.add_ns(&zone.dn, ns.ttl, server.clone());
            }
        }
    }
    if wants_soa {
        builder.add_soa(&zone.dn, soa.as_ref(), SoaSection::Answer, serial_fallback);
    }

    Some(true)
}

/// Query under the zone (not at its apex): optionally decode an
/// IPv4-reverse address, then consult every attached dataset in
/// attachment order.
fn subname_query(query: &mut Query, zone: &Zone, builder: &mut ResponseBuilder) -> bool {
    let delta = query.reversed_labels.len() - zone.label_count();
    if zone.is_ipv4_reverse && delta <= 4 {
        let suffix = &query.reversed_labels[zone.label_count()..];
        query.ipv4 = decode_ipv4_reverse(suffix);
    }

    let mut found = false;
    for dataset in &zone.datasets {
        if dataset.type_impl.query(query, builder) {
            found = true;
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dns_wire::protocol::types::test_util::domain;
    use dns_wire::protocol::types::{Header, QueryClass, QueryType, Question, RecordClass, RecordType};

    use crate::dataset::{Dataset, DatasetCommon, DatasetType, LineOutcome};
    use crate::directive::DirectiveContext;

    use super::*;

    struct StubDataset;

    impl DatasetType for StubDataset {
        fn flags(&self) -> u16 {
            0
        }
        fn start(&self) {}
        fn line(&self, _line: &str, _ctx: &DirectiveContext) -> LineOutcome {
            LineOutcome::Ok
        }
        fn finish(&self, _ctx: &DirectiveContext) {}
        fn reset(&self) {}
        fn query(&self, query: &Query, response: &mut ResponseBuilder) -> bool {
            if query.name.to_dotted_string() == "blocked.rbl.example." {
                response.add_a(&query.name, 300, Ipv4Addr::new(127, 0, 0, 2));
                true
            } else {
                false
            }
        }
    }

    fn soa(serial: u32) -> crate::dataset::Soa {
        crate::dataset::Soa {
            ttl: 3600,
            origin: domain("ns1.rbl.example."),
            rp: domain("hostmaster.rbl.example."),
            serial,
            refresh: 7200,
            retry: 900,
            expire: 604_800,
            minimum: 3600,
        }
    }

    fn zone_with_dataset(soa_value: Option<crate::dataset::Soa>) -> Zone {
        let dataset = Dataset::new("stub".to_string(), "spec".to_string(), Box::new(StubDataset), Vec::new());
        *dataset.common.write().unwrap() = DatasetCommon {
            soa: soa_value,
            ..DatasetCommon::default()
        };
        dataset.stamp.store(1, std::sync::atomic::Ordering::Release);
        Zone::new(domain("rbl.example."), vec![Arc::new(dataset)], None)
    }

    fn zone_with_soa_and_ns(soa_value: crate::dataset::Soa) -> Zone {
        let dataset = Dataset::new("stub".to_string(), "spec".to_string(), Box::new(StubDataset), Vec::new());
        *dataset.common.write().unwrap() = DatasetCommon {
            soa: Some(soa_value),
            ns: Some(crate::dataset::NsSet {
                ttl: 3600,
                servers: vec![domain("ns1.rbl.example.")],
            }),
            ..DatasetCommon::default()
        };
        dataset.stamp.store(1, std::sync::atomic::Ordering::Release);
        Zone::new(domain("rbl.example."), vec![Arc::new(dataset)], None)
    }

    fn query_message(name: &str, qtype: QueryType) -> Message {
        Message {
            header: Header {
                id: 7,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: true,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: domain(name),
                qtype,
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    #[test]
    fn positive_answer_is_authoritative_noerror() {
        let zone = zone_with_dataset(Some(soa(42)));
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("blocked.rbl.example.", QueryType::Record(RecordType::A));
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert!(response.header.is_authoritative);
        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(1, response.answers.len());
        assert!(response.authority.is_empty());
    }

    #[test]
    fn negative_answer_gets_nxdomain_and_authority_soa() {
        let zone = zone_with_dataset(Some(soa(42)));
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("nonexistent.rbl.example.", QueryType::Record(RecordType::A));
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::NameError, response.header.rcode);
        assert_eq!(0, response.answers.len());
        assert_eq!(1, response.authority.len());
    }

    #[test]
    fn unmatched_zone_is_refused() {
        let table = ZoneTable::new();
        let message = query_message("other.test.", QueryType::Record(RecordType::A));
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::Refused, response.header.rcode);
        assert!(!response.header.is_authoritative);
    }

    #[test]
    fn unloaded_zone_is_servfail() {
        let dataset = Dataset::new("stub".to_string(), "spec".to_string(), Box::new(StubDataset), Vec::new());
        // stamp left at 0: never loaded.
        let zone = Zone::new(domain("rbl.example."), vec![Arc::new(dataset)], None);
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("blocked.rbl.example.", QueryType::Record(RecordType::A));
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::ServerFailure, response.header.rcode);
    }

    #[test]
    fn apex_query_without_ns_or_soa_requested_gets_empty_answer_and_authority_soa() {
        let zone = zone_with_dataset(Some(soa(42)));
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("rbl.example.", QueryType::Record(RecordType::A));
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(0, response.answers.len());
        assert_eq!(1, response.authority.len());
    }

    #[test]
    fn apex_soa_query_is_refused_without_configured_soa() {
        let zone = zone_with_dataset(None);
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("rbl.example.", QueryType::Record(RecordType::SOA));
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::Refused, response.header.rcode);
        assert!(!response.header.is_authoritative);
    }

    #[test]
    fn apex_any_query_is_not_notimpl_and_gets_ns_and_soa() {
        let zone = zone_with_soa_and_ns(soa(42));
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("rbl.example.", QueryType::Wildcard);
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert!(response.header.is_authoritative);
        // NS goes to the answer section here (apex handling treats the
        // zone's own NS/SOA as the "found" records), SOA follows it.
        assert_eq!(2, response.answers.len());
    }

    #[test]
    fn subname_any_query_reaches_datasets_instead_of_notimpl() {
        let zone = zone_with_dataset(Some(soa(42)));
        let mut table = ZoneTable::new();
        table.insert(zone);

        let message = query_message("blocked.rbl.example.", QueryType::Wildcard);
        let (_, query) = query::parse_query(&message.clone().into_octets().unwrap()).unwrap();
        let response = dispatch(&message, query, &table);

        assert_eq!(Rcode::NoError, response.header.rcode);
        assert_eq!(1, response.answers.len());
    }

    #[test]
    fn ipv4_reverse_octets_decode_in_zone_apex_order() {
        assert_eq!(
            Some((Ipv4Addr::new(192, 168, 0, 1), 4)),
            decode_ipv4_reverse(&[b"192".to_vec(), b"168".to_vec(), b"0".to_vec(), b"1".to_vec()])
        );
        assert_eq!(None, decode_ipv4_reverse(&[b"256".to_vec()]));
        assert_eq!(None, decode_ipv4_reverse(&[b"1".to_vec(); 5]));
    }
}
