//! Worked-example [`DatasetType`] implementations. These are
//! illustrations of the collaborator interface, not an attempt to
//! cover real-world blocklist dataset types exhaustively - concrete
//! deployments are expected to bring their own.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use crate::dataset::{type_flags, DatasetType, LineOutcome};
use crate::directive::DirectiveContext;
use crate::query::{self, Query};
use crate::response::ResponseBuilder;

struct Entry {
    text: Option<String>,
}

#[derive(Default)]
struct Loaded {
    entries: HashMap<Ipv4Addr, Entry>,
    ttl: u32,
}

/// A flat list of IPv4 addresses under an IPv4-reverse zone, each
/// optionally carrying a TXT message. An exact match on all four
/// octets answers `A` with a fixed result address (the conventional
/// rbldnsd "listed" response, typically `127.0.0.2`) and, if present,
/// `TXT` with the entry's message - `$` in the message is replaced
/// with the queried address's dotted form.
///
/// Source lines are `address` or `address:text`.
pub struct AddressListDataset {
    result: Ipv4Addr,
    loaded: RwLock<Loaded>,
}

impl AddressListDataset {
    pub fn new(result: Ipv4Addr) -> Self {
        Self {
            result,
            loaded: RwLock::new(Loaded::default()),
        }
    }
}

impl DatasetType for AddressListDataset {
    fn flags(&self) -> u16 {
        type_flags::IS_IPV4_REVERSE
    }

    fn start(&self) {}

    fn line(&self, line: &str, _ctx: &DirectiveContext) -> LineOutcome {
        let mut parts = line.splitn(2, ':');
        let addr_text = parts.next().unwrap_or("").trim();
        let text = parts.next().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);

        match addr_text.parse::<Ipv4Addr>() {
            Ok(addr) => {
                self.loaded.write().expect("lock poisoned").entries.insert(addr, Entry { text });
                LineOutcome::Ok
            }
            Err(_) => LineOutcome::SoftError(format!("not an ipv4 address: {addr_text}")),
        }
    }

    fn finish(&self, ctx: &DirectiveContext) {
        self.loaded.write().expect("lock poisoned").ttl = ctx.common.default_ttl;
    }

    fn reset(&self) {
        *self.loaded.write().expect("lock poisoned") = Loaded::default();
    }

    fn query(&self, query: &Query, response: &mut ResponseBuilder) -> bool {
        let Some((addr, octet_count)) = query.ipv4 else {
            return false;
        };
        if octet_count != 4 {
            return false;
        }

        let loaded = self.loaded.read().expect("lock poisoned");
        let Some(entry) = loaded.entries.get(&addr) else {
            return false;
        };

        if query.type_flags & (query::type_flags::A | query::type_flags::ANY) != 0 {
            response.add_a(&query.name, loaded.ttl, self.result);
        }
        if let Some(text) = &entry.text {
            if query.type_flags & (query::type_flags::TXT | query::type_flags::ANY) != 0 {
                response.add_txt(&query.name, loaded.ttl, text, &addr.to_string());
            }
        }
        true
    }
}

/// A list of client network prefixes, loaded from lines of the form
/// `a.b.c.d/prefix` (bare addresses are treated as `/32`). Contributes
/// no records to any answer - `query` always returns `false` - the
/// entries exist purely to be consulted by the transport layer before
/// a query ever reaches zone dispatch, per the "accepting a plug-in
/// ACL dataset" carve-out.
pub struct AclDataset {
    entries: RwLock<Vec<(Ipv4Addr, u32)>>,
}

impl AclDataset {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl Default for AclDataset {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_prefix(s: &str) -> Option<(Ipv4Addr, u32)> {
    let (addr_text, prefix_len) = match s.split_once('/') {
        Some((addr_text, prefix_text)) => (addr_text, prefix_text.parse::<u32>().ok()?),
        None => (s, 32),
    };
    if prefix_len > 32 {
        return None;
    }
    let addr = addr_text.parse::<Ipv4Addr>().ok()?;
    let mask = if prefix_len == 0 { 0 } else { u32::MAX << (32 - prefix_len) };
    Some((addr, mask))
}

impl DatasetType for AclDataset {
    fn flags(&self) -> u16 {
        type_flags::IS_ACL
    }

    fn start(&self) {}

    fn line(&self, line: &str, _ctx: &DirectiveContext) -> LineOutcome {
        match parse_prefix(line.trim()) {
            Some(entry) => {
                self.entries.write().expect("lock poisoned").push(entry);
                LineOutcome::Ok
            }
            None => LineOutcome::SoftError(format!("not an ipv4 network: {line}")),
        }
    }

    fn finish(&self, _ctx: &DirectiveContext) {}

    fn reset(&self) {
        self.entries.write().expect("lock poisoned").clear();
    }

    fn query(&self, _query: &Query, _response: &mut ResponseBuilder) -> bool {
        false
    }

    /// Consulted by the transport layer before a query ever reaches
    /// zone dispatch, per the global-ACL and zone-ACL carve-outs in
    /// `build_zone_table` - see `bin-rbld`'s `handle_datagram`.
    fn allows(&self, client: Ipv4Addr) -> bool {
        let client = u32::from(client);
        self.entries
            .read()
            .expect("lock poisoned")
            .iter()
            .any(|(net, mask)| client & mask == u32::from(*net) & mask)
    }
}

/// Resolves a dataset-type tag from a zone spec string to one of the
/// two worked-example implementations above. Concrete deployments are
/// expected to write their own registry over their own dataset types
/// instead of extending this one.
pub fn example_registry(type_tag: &str) -> Option<Box<dyn DatasetType>> {
    match type_tag {
        "addrlist" => Some(Box::new(AddressListDataset::new(Ipv4Addr::new(127, 0, 0, 2)))),
        "acl" => Some(Box::new(AclDataset::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_wire::protocol::types::test_util::domain;
    use dns_wire::protocol::types::{QueryClass, QueryType, RecordClass, RecordType};

    fn query_for(name: &str, ip: Ipv4Addr, octets: u8, qtype: QueryType) -> Query {
        Query {
            name: domain(name),
            qtype,
            qclass: QueryClass::Record(RecordClass::IN),
            type_flags: query::classify_qtype(qtype),
            reversed_labels: Vec::new(),
            ipv4: Some((ip, octets)),
        }
    }

    #[test]
    fn address_list_answers_exact_match() {
        let ds = AddressListDataset::new(Ipv4Addr::new(127, 0, 0, 2));
        let ctx = DirectiveContext::default();
        ds.line("192.168.0.1:blocked host $", &ctx);
        ds.finish(&ctx);

        let query = query_for(
            "1.0.168.192.rbl.example.",
            Ipv4Addr::new(192, 168, 0, 1),
            4,
            QueryType::Record(RecordType::A),
        );
        let mut response = ResponseBuilder::new();
        assert!(ds.query(&query, &mut response));
        assert_eq!(1, response.answer_count());
    }

    #[test]
    fn address_list_misses_unlisted_address() {
        let ds = AddressListDataset::new(Ipv4Addr::new(127, 0, 0, 2));
        let query = query_for(
            "2.0.168.192.rbl.example.",
            Ipv4Addr::new(192, 168, 0, 2),
            4,
            QueryType::Record(RecordType::A),
        );
        let mut response = ResponseBuilder::new();
        assert!(!ds.query(&query, &mut response));
    }

    #[test]
    fn acl_dataset_matches_prefix() {
        let acl = AclDataset::new();
        let ctx = DirectiveContext::default();
        acl.line("10.0.0.0/8", &ctx);
        assert!(acl.allows(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!acl.allows(Ipv4Addr::new(11, 1, 2, 3)));
    }
}
