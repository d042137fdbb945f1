//! Zone configuration: turning `zone-name:dataset-type:file1,file2,…`
//! spec strings into a populated [`ZoneTable`] plus an optional global
//! ACL dataset. Grounded directly on `addzone`/`newdataset` in
//! `rbldnsd_zones.c` - the same `(type, spec)` dataset-sharing rule,
//! the same "empty zone name means global ACL" carve-out.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use dns_wire::protocol::types::DomainName;

use crate::dataset::{Dataset, DatasetType};
use crate::zone::{Zone, ZoneTable};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// Spec string is missing the `zone-name:` or `type:` separator.
    MalformedSpec(String),
    /// The zone name portion isn't a valid domain name.
    InvalidDomainName(String),
    UnknownDatasetType(String),
    /// An empty zone name was given for a non-ACL dataset type.
    GlobalAclRequiresAclType(String),
    GlobalAclSpecifiedTwice,
    /// The same zone got two ACL dataset attachments.
    RepeatedZoneAcl(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::MalformedSpec(spec) => write!(f, "invalid zone spec `{spec}`"),
            ConfigError::InvalidDomainName(name) => write!(f, "invalid domain name `{name}`"),
            ConfigError::UnknownDatasetType(ty) => write!(f, "unknown dataset type `{ty}`"),
            ConfigError::GlobalAclRequiresAclType(ty) => {
                write!(f, "missing domain name in spec with non-acl dataset type `{ty}`")
            }
            ConfigError::GlobalAclSpecifiedTwice => write!(f, "global acl specified more than once"),
            ConfigError::RepeatedZoneAcl(name) => write!(f, "repeated ACL definition for zone `{name}`"),
        }
    }
}

/// One `zone-name:dataset-type:file1,file2,…` spec, split into parts
/// but not yet resolved against a dataset-type registry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ZoneSpec {
    pub zone_name: String,
    pub dataset_type: String,
    /// The raw `file1,file2,…` remainder, kept whole as the dataset's
    /// sharing key (matching `ds_spec` in the original).
    pub dataset_spec: String,
    pub files: Vec<PathBuf>,
}

/// Splits a spec string into its three colon-delimited parts. The
/// dataset-type and file list are split on the *first* remaining
/// colon, so file paths themselves must not contain one.
pub fn parse_zone_spec(spec: &str) -> Result<ZoneSpec, ConfigError> {
    let (zone_name, rest) = spec.split_once(':').ok_or_else(|| ConfigError::MalformedSpec(spec.to_string()))?;
    let (dataset_type, dataset_spec) = rest.split_once(':').ok_or_else(|| ConfigError::MalformedSpec(spec.to_string()))?;

    let files = dataset_spec.split(',').map(str::trim).filter(|s| !s.is_empty()).map(PathBuf::from).collect();

    Ok(ZoneSpec {
        zone_name: zone_name.to_string(),
        dataset_type: dataset_type.to_string(),
        dataset_spec: dataset_spec.to_string(),
        files,
    })
}

/// The result of resolving every configured spec: the zone table, the
/// global ACL dataset if one was installed, and the deduplicated set
/// of every distinct `(type, spec)` dataset - this is the list the
/// hot-reload supervisor should tick, since a dataset shared between
/// zones must only be reloaded once per tick.
pub struct Loaded {
    pub zones: ZoneTable,
    pub global_acl: Option<Arc<Dataset>>,
    pub datasets: Vec<Arc<Dataset>>,
}

/// Builds a [`ZoneTable`] (plus optional global ACL) from a list of
/// raw spec strings. `construct` maps a dataset-type tag to a fresh
/// `DatasetType` implementation; it is consulted at most once per
/// distinct `(type, spec)` pair, matching the original's dataset
/// sharing rule - the same files backing two zones load once.
///
/// # Errors
///
/// Returns the first spec or domain-name error encountered; a partial
/// registry is not returned on failure.
pub fn build_zone_table(
    specs: &[String],
    mut construct: impl FnMut(&str) -> Option<Box<dyn DatasetType>>,
) -> Result<Loaded, ConfigError> {
    let mut datasets: HashMap<(String, String), Arc<Dataset>> = HashMap::new();
    let mut zone_datasets: HashMap<DomainName, Vec<Arc<Dataset>>> = HashMap::new();
    let mut zone_acls: HashMap<DomainName, Arc<Dataset>> = HashMap::new();
    let mut zone_order: Vec<DomainName> = Vec::new();
    let mut global_acl: Option<Arc<Dataset>> = None;

    for raw in specs {
        let parsed = parse_zone_spec(raw)?;
        let key = (parsed.dataset_type.clone(), parsed.dataset_spec.clone());

        let dataset = match datasets.get(&key) {
            Some(existing) => Arc::clone(existing),
            None => {
                let type_impl = construct(&parsed.dataset_type).ok_or_else(|| ConfigError::UnknownDatasetType(parsed.dataset_type.clone()))?;
                let dataset = Arc::new(Dataset::new(parsed.dataset_type.clone(), parsed.dataset_spec.clone(), type_impl, parsed.files.clone()));
                datasets.insert(key, Arc::clone(&dataset));
                dataset
            }
        };

        if parsed.zone_name.is_empty() {
            if !dataset.is_acl() {
                return Err(ConfigError::GlobalAclRequiresAclType(parsed.dataset_type));
            }
            if global_acl.is_some() {
                return Err(ConfigError::GlobalAclSpecifiedTwice);
            }
            global_acl = Some(dataset);
            continue;
        }

        let dn = parse_dn(&parsed.zone_name).ok_or_else(|| ConfigError::InvalidDomainName(parsed.zone_name.clone()))?;

        if dataset.is_acl() {
            if zone_acls.contains_key(&dn) {
                return Err(ConfigError::RepeatedZoneAcl(parsed.zone_name));
            }
            zone_acls.insert(dn.clone(), dataset);
        } else {
            zone_datasets.entry(dn.clone()).or_default().push(dataset);
        }

        if !zone_order.iter().any(|existing| *existing == dn) {
            zone_order.push(dn);
        }
    }

    let mut zones = ZoneTable::new();
    for dn in zone_order {
        let datasets = zone_datasets.remove(&dn).unwrap_or_default();
        let acl = zone_acls.remove(&dn);
        zones.insert(Zone::new(dn, datasets, acl));
    }

    Ok(Loaded {
        zones,
        global_acl,
        datasets: datasets.into_values().collect(),
    })
}

fn parse_dn(s: &str) -> Option<DomainName> {
    if s.ends_with('.') {
        DomainName::from_dotted_string(s)
    } else {
        DomainName::from_dotted_string(&format!("{s}."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset_types::{AclDataset, AddressListDataset};
    use std::net::Ipv4Addr;

    fn registry(ty: &str) -> Option<Box<dyn DatasetType>> {
        match ty {
            "addrlist" => Some(Box::new(AddressListDataset::new(Ipv4Addr::new(127, 0, 0, 2)))),
            "acl" => Some(Box::new(AclDataset::new())),
            _ => None,
        }
    }

    #[test]
    fn parses_basic_spec() {
        let spec = parse_zone_spec("rbl.example.:addrlist:/etc/rbl/list1,/etc/rbl/list2").unwrap();
        assert_eq!("rbl.example.", spec.zone_name);
        assert_eq!("addrlist", spec.dataset_type);
        assert_eq!(vec![PathBuf::from("/etc/rbl/list1"), PathBuf::from("/etc/rbl/list2")], spec.files);
    }

    #[test]
    fn rejects_spec_without_second_colon() {
        assert!(parse_zone_spec("rbl.example.:addrlist").is_err());
    }

    #[test]
    fn shares_dataset_between_zones_with_identical_key() {
        let specs = vec![
            "a.example.:addrlist:/data/list".to_string(),
            "b.example.:addrlist:/data/list".to_string(),
        ];
        let loaded = build_zone_table(&specs, registry).unwrap();
        let a = loaded.zones.iter().find(|z| z.dn.to_dotted_string() == "a.example.").unwrap();
        let b = loaded.zones.iter().find(|z| z.dn.to_dotted_string() == "b.example.").unwrap();
        assert!(Arc::ptr_eq(&a.datasets[0], &b.datasets[0]));
    }

    #[test]
    fn empty_zone_name_installs_global_acl() {
        let specs = vec![":acl:/data/acl".to_string()];
        let loaded = build_zone_table(&specs, registry).unwrap();
        assert!(loaded.global_acl.is_some());
        assert_eq!(0, loaded.zones.iter().count());
    }

    #[test]
    fn empty_zone_name_with_non_acl_type_is_rejected() {
        let specs = vec![":addrlist:/data/list".to_string()];
        let err = build_zone_table(&specs, registry).unwrap_err();
        assert_eq!(ConfigError::GlobalAclRequiresAclType("addrlist".to_string()), err);
    }

    #[test]
    fn unknown_dataset_type_is_rejected() {
        let specs = vec!["rbl.example.:bogus:/data/list".to_string()];
        let err = build_zone_table(&specs, registry).unwrap_err();
        assert_eq!(ConfigError::UnknownDatasetType("bogus".to_string()), err);
    }
}
