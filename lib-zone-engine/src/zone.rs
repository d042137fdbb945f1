//! The zone graph: a zone is a DN the server is authoritative for,
//! with its own SOA/NS metadata and a list of attached datasets.
//! Zones hold shared ownership of their datasets; datasets never
//! reference zones back.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use dns_wire::protocol::types::DomainName;

use crate::dataset::{Dataset, NsSet, Soa};

/// A zone: the DN it's authoritative for, its attached datasets (in
/// attachment order - dataset `query` callbacks run in this order),
/// an optional per-zone ACL dataset, and whether it should be treated
/// as an IPv4-reverse zone for dotted-octet decoding.
pub struct Zone {
    pub dn: DomainName,
    pub reversed_labels: Vec<Vec<u8>>,
    pub datasets: Vec<Arc<Dataset>>,
    pub acl: Option<Arc<Dataset>>,
    pub is_ipv4_reverse: bool,
}

impl Zone {
    pub fn new(dn: DomainName, datasets: Vec<Arc<Dataset>>, acl: Option<Arc<Dataset>>) -> Self {
        let reversed_labels = dn.reversed_labels().into_iter().map(<[u8]>::to_vec).collect();
        let is_ipv4_reverse = datasets.iter().any(|d| d.is_ipv4_reverse());
        Self {
            dn,
            reversed_labels,
            datasets,
            acl,
            is_ipv4_reverse,
        }
    }

    /// A zone is serviceable iff its own load timestamp is nonzero
    /// and every attached dataset has a nonzero load timestamp.
    pub fn stamp(&self) -> u64 {
        if self.datasets.is_empty() {
            // A zone with no attached datasets (e.g. one that exists
            // solely to publish SOA/NS at its apex) is serviceable as
            // soon as it is configured.
            return 1;
        }
        let mut max = 0;
        for dataset in &self.datasets {
            let stamp = dataset.stamp.load(Ordering::Acquire);
            if stamp == 0 {
                return 0;
            }
            max = max.max(stamp);
        }
        max
    }

    pub fn is_loaded(&self) -> bool {
        self.stamp() != 0
    }

    /// The DN's label count, excluding the root terminator - used to
    /// decide whether a matched query name equals the zone apex.
    pub fn label_count(&self) -> usize {
        self.reversed_labels.len()
    }

    /// The SOA to serve for this zone: the first attached dataset
    /// that carries one, in attachment order.
    pub fn effective_soa(&self) -> Option<Soa> {
        self.datasets
            .iter()
            .find_map(|d| d.common.read().expect("dataset lock poisoned").soa.clone())
    }

    /// The NS set to serve for this zone: the first attached dataset
    /// that carries one, in attachment order.
    pub fn effective_ns(&self) -> Option<NsSet> {
        self.datasets
            .iter()
            .find_map(|d| d.common.read().expect("dataset lock poisoned").ns.clone())
    }
}

/// The configured zone list, ordered so that more specific (longer)
/// zones are tried before their ancestors - this makes longest-suffix
/// match a simple linear scan.
pub struct ZoneTable {
    zones: Vec<Zone>,
}

impl ZoneTable {
    pub fn new() -> Self {
        Self { zones: Vec::new() }
    }

    /// Inserts a zone, keeping the table ordered longest-label-count
    /// first.
    pub fn insert(&mut self, zone: Zone) {
        let pos = self
            .zones
            .partition_point(|existing| existing.label_count() >= zone.label_count());
        self.zones.insert(pos, zone);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    /// Walks the zone list and returns the first (longest) zone whose
    /// reversed DN is a prefix of the query's reversed labels.
    pub fn find_match(&self, query_reversed_labels: &[Vec<u8>]) -> Option<&Zone> {
        self.zones.iter().find(|zone| {
            zone.reversed_labels.len() <= query_reversed_labels.len()
                && query_reversed_labels[..zone.reversed_labels.len()] == zone.reversed_labels[..]
        })
    }
}

impl Default for ZoneTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_wire::protocol::types::test_util::domain;

    fn reversed(name: &str) -> Vec<Vec<u8>> {
        domain(name).reversed_labels().into_iter().map(<[u8]>::to_vec).collect()
    }

    #[test]
    fn longer_zone_matches_before_ancestor() {
        let mut table = ZoneTable::new();
        table.insert(Zone::new(domain("example.com."), Vec::new(), None));
        table.insert(Zone::new(domain("rbl.example.com."), Vec::new(), None));

        let query = reversed("host.rbl.example.com.");
        let matched = table.find_match(&query).unwrap();
        assert_eq!("rbl.example.com.", matched.dn.to_dotted_string());
    }

    #[test]
    fn no_match_outside_any_zone() {
        let mut table = ZoneTable::new();
        table.insert(Zone::new(domain("example.com."), Vec::new(), None));

        let query = reversed("other.test.");
        assert!(table.find_match(&query).is_none());
    }

    #[test]
    fn zone_with_no_datasets_is_always_loaded() {
        let zone = Zone::new(domain("example.com."), Vec::new(), None);
        assert!(zone.is_loaded());
    }
}
