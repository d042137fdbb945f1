//! The dataset model: a typed, file-backed collection of records that
//! contributes answers for queries below a zone. Concrete record
//! producers (A/TXT/NS/ACL lookups, …) implement [`DatasetType`];
//! everything common to all dataset types - source files, SOA, NS,
//! default TTL, `$0`..`$9` substitutions, and the load stamp - lives
//! on [`Dataset`] itself.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::SystemTime;

use dns_wire::protocol::types::DomainName;

use crate::directive::DirectiveContext;
use crate::response::ResponseBuilder;
use crate::query::Query;

/// Flags describing a dataset *type* (not a particular loaded
/// dataset instance).
pub mod type_flags {
    pub const IS_IPV4_REVERSE: u16 = 0b001;
    pub const IS_ACL: u16 = 0b010;
    pub const SUPPORTS_SUBDATASET: u16 = 0b100;
}

/// Outcome of feeding one non-directive line to a dataset type's
/// `line` callback.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LineOutcome {
    Ok,
    /// Log and continue; the rest of the file still loads.
    SoftError(String),
    /// Abort this dataset's reload entirely.
    FatalError(String),
}

/// The collaborator interface every concrete dataset type implements.
/// Mutable per-type state is expected to live behind interior
/// mutability on the implementing type (a `RwLock` around whatever
/// the type needs) - `Dataset` itself only tracks the state common to
/// every dataset type.
pub trait DatasetType: Send + Sync {
    fn flags(&self) -> u16;

    /// Called once at the beginning of each file load.
    fn start(&self);

    /// Called once per non-directive line.
    fn line(&self, line: &str, ctx: &DirectiveContext) -> LineOutcome;

    /// Called once at the end of each file load.
    fn finish(&self, ctx: &DirectiveContext);

    /// Tears down per-type data, called before a reload begins.
    fn reset(&self);

    /// Returns whether this dataset contributed a positive answer,
    /// appending any matching records to `response`.
    fn query(&self, query: &Query, response: &mut ResponseBuilder) -> bool;

    /// Writes this dataset's records back out in master-file form.
    /// Optional: the master-file dumper is a separate external tool,
    /// not part of query serving, so most dataset types never override
    /// this default.
    fn dump(&self, _zone_dn: &DomainName, _out: &mut dyn std::io::Write) -> std::io::Result<()> {
        Ok(())
    }

    /// Whether `client` may be served at all. Only meaningful for a
    /// dataset type with `IS_ACL` set (an ACL dataset contributes no
    /// records of its own via `query`; this is its entire purpose).
    /// Every other dataset type allows everyone, which is why this has
    /// a default body instead of being required.
    fn allows(&self, _client: Ipv4Addr) -> bool {
        true
    }
}

/// The responsible-person/origin/timer fields of an SOA record, plus
/// the TTL it should be served with. Serial 0 means "substitute the
/// zone's load timestamp at emit time".
#[derive(Debug, Clone)]
pub struct Soa {
    pub ttl: u32,
    pub origin: DomainName,
    pub rp: DomainName,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

/// A dataset's NS set: one TTL shared by every server DN.
#[derive(Debug, Clone)]
pub struct NsSet {
    pub ttl: u32,
    pub servers: Vec<DomainName>,
}

/// Per-dataset state set via the `$`-directives in its source
/// file(s), reset (and rebuilt) on every successful reload.
#[derive(Debug, Clone, Default)]
pub struct DatasetCommon {
    pub soa: Option<Soa>,
    pub ns: Option<NsSet>,
    pub default_ttl: u32,
    pub max_range4: Option<u32>,
    pub substitutions: [Option<String>; 10],
}

/// One source file backing a dataset, and the stat values recorded
/// the last time it was successfully loaded.
#[derive(Debug)]
pub struct DatasetFile {
    pub path: PathBuf,
    pub last_mtime: RwLock<Option<SystemTime>>,
    pub last_size: RwLock<Option<u64>>,
}

impl DatasetFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_mtime: RwLock::new(None),
            last_size: RwLock::new(None),
        }
    }
}

/// A typed, file-backed collection of records, identified by
/// `(type_tag, spec)`. Datasets are shared: the same `(type_tag,
/// spec)` is instantiated once and may be attached to multiple zones.
pub struct Dataset {
    pub type_tag: String,
    pub spec: String,
    pub type_impl: Box<dyn DatasetType>,
    pub files: Vec<DatasetFile>,
    pub common: RwLock<DatasetCommon>,
    /// Monotonic load stamp (max mtime across files); 0 means "not
    /// (yet, or no longer) loaded".
    pub stamp: AtomicU64,
}

impl Dataset {
    pub fn new(type_tag: String, spec: String, type_impl: Box<dyn DatasetType>, files: Vec<PathBuf>) -> Self {
        Self {
            type_tag,
            spec,
            type_impl,
            files: files.into_iter().map(DatasetFile::new).collect(),
            common: RwLock::new(DatasetCommon::default()),
            stamp: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.type_tag, &self.spec)
    }

    pub fn is_loaded(&self) -> bool {
        self.stamp.load(Ordering::Acquire) != 0
    }

    pub fn is_acl(&self) -> bool {
        self.type_impl.flags() & type_flags::IS_ACL != 0
    }

    pub fn is_ipv4_reverse(&self) -> bool {
        self.type_impl.flags() & type_flags::IS_IPV4_REVERSE != 0
    }
}
