//! Parser for the `$`-directives embedded in dataset source files:
//! `$SOA`, `$NS`, `$TTL`, `$MAXRANGE4`, `$0`..`$9`, and `$DATASET`.
//!
//! Each dataset's `DirectiveContext` accumulates the directive state
//! for the file(s) currently being loaded; it is committed into the
//! dataset's [`DatasetCommon`](crate::dataset::DatasetCommon) only on
//! a fully successful reload.

use std::fmt;

use dns_wire::protocol::types::DomainName;

use crate::dataset::{type_flags, DatasetCommon, NsSet, Soa};

/// Accumulates directive state across a dataset reload. Dropped (not
/// committed) if the reload aborts.
#[derive(Debug, Default)]
pub struct DirectiveContext {
    pub common: DatasetCommon,
    soa_assigned: bool,
    ns_assigned: bool,
    subst_assigned: [bool; 10],
    /// Name of the currently-open `$DATASET` sub-dataset, if the
    /// dataset type supports them. Plain (non-combined) datasets
    /// never see this set.
    pub current_subdataset: Option<String>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DirectiveError {
    Unrecognized(String),
    BadArgs { directive: &'static str, reason: String },
    ForbiddenInAcl(&'static str),
    MaxRangeIncreaseIgnored,
    /// `$DATASET` was used against a dataset type that never
    /// advertised `SUPPORTS_SUBDATASET`.
    DatasetNotCombined,
}

impl fmt::Display for DirectiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirectiveError::Unrecognized(line) => write!(f, "unrecognized directive: {line}"),
            DirectiveError::BadArgs { directive, reason } => {
                write!(f, "bad arguments to {directive}: {reason}")
            }
            DirectiveError::ForbiddenInAcl(directive) => {
                write!(f, "{directive} is not permitted in an ACL dataset")
            }
            DirectiveError::MaxRangeIncreaseIgnored => {
                write!(f, "$MAXRANGE4 may only decrease; increase ignored")
            }
            DirectiveError::DatasetNotCombined => {
                write!(f, "$DATASET is not supported by this dataset type")
            }
        }
    }
}

/// Feeds one `$`-prefixed line to the directive parser. `flags` is the
/// dataset type's own [`DatasetType::flags`](crate::dataset::DatasetType::flags)
/// word, which gates `$SOA`/`$NS` (forbidden for `IS_ACL`) and
/// `$DATASET` (requires `SUPPORTS_SUBDATASET`).
///
/// # Errors
///
/// A genuinely malformed or unrecognized directive is an error that
/// the caller should treat as a parse failure for the whole line (the
/// `$MAXRANGE4` "raised" case is the one exception: it is a no-op
/// warning, not a hard error, and is still returned as `Err` so the
/// caller can log it, but reload should continue).
pub fn parse_directive(line: &str, ctx: &mut DirectiveContext, flags: u16) -> Result<(), DirectiveError> {
    let is_acl = flags & type_flags::IS_ACL != 0;
    let rest = line.strip_prefix('$').expect("caller only passes $-lines");
    let mut parts = rest.split_whitespace();
    let keyword = parts.next().unwrap_or("");
    let args: Vec<&str> = parts.collect();

    match keyword.to_ascii_uppercase().as_str() {
        "SOA" => {
            if is_acl {
                return Err(DirectiveError::ForbiddenInAcl("$SOA"));
            }
            if ctx.soa_assigned {
                return Ok(());
            }
            ctx.common.soa = Some(parse_soa_args(&args)?);
            ctx.soa_assigned = true;
            Ok(())
        }
        "NS" => {
            if is_acl {
                return Err(DirectiveError::ForbiddenInAcl("$NS"));
            }
            if ctx.ns_assigned {
                // Per the dropped INCOMPAT_0_99 compatibility path:
                // only the first $NS line in a load is honored.
                return Ok(());
            }
            ctx.common.ns = Some(parse_ns_args(&args)?);
            ctx.ns_assigned = true;
            Ok(())
        }
        "TTL" => {
            let ttl = args
                .first()
                .ok_or_else(|| bad_args("$TTL", "missing ttl"))
                .and_then(|s| parse_ttl(s).map_err(|e| bad_args("$TTL", &e)))?;
            ctx.common.default_ttl = ttl;
            Ok(())
        }
        "MAXRANGE4" => {
            let arg = args.first().ok_or_else(|| bad_args("$MAXRANGE4", "missing argument"))?;
            let candidate = parse_maxrange4(arg).map_err(|e| bad_args("$MAXRANGE4", &e))?;
            match ctx.common.max_range4 {
                Some(current) if candidate > current => Err(DirectiveError::MaxRangeIncreaseIgnored),
                _ => {
                    ctx.common.max_range4 = Some(candidate);
                    Ok(())
                }
            }
        }
        "0" | "1" | "2" | "3" | "4" | "5" | "6" | "7" | "8" | "9" => {
            let n: usize = keyword.parse().expect("matched a single digit");
            if ctx.subst_assigned[n] {
                return Ok(());
            }
            ctx.common.substitutions[n] = Some(args.join(" "));
            ctx.subst_assigned[n] = true;
            Ok(())
        }
        "DATASET" => {
            if flags & type_flags::SUPPORTS_SUBDATASET == 0 {
                return Err(DirectiveError::DatasetNotCombined);
            }
            let name = args.first().ok_or_else(|| bad_args("$DATASET", "missing name"))?;
            ctx.current_subdataset = Some((*name).to_string());
            Ok(())
        }
        _ => Err(DirectiveError::Unrecognized(line.to_string())),
    }
}

fn bad_args(directive: &'static str, reason: impl Into<String>) -> DirectiveError {
    DirectiveError::BadArgs {
        directive,
        reason: reason.into(),
    }
}

fn parse_soa_args(args: &[&str]) -> Result<Soa, DirectiveError> {
    let [ttl, origin, rp, serial, refresh, retry, expire, minimum] = args else {
        return Err(bad_args(
            "$SOA",
            format!("expected 8 arguments, got {}", args.len()),
        ));
    };

    Ok(Soa {
        ttl: parse_ttl(ttl).map_err(|e| bad_args("$SOA", e))?,
        origin: parse_dn(origin).ok_or_else(|| bad_args("$SOA", "bad origin"))?,
        rp: parse_dn(rp).ok_or_else(|| bad_args("$SOA", "bad responsible-person"))?,
        serial: parse_uint32(serial).map_err(|e| bad_args("$SOA", e))?,
        refresh: parse_ttl(refresh).map_err(|e| bad_args("$SOA", e))?,
        retry: parse_ttl(retry).map_err(|e| bad_args("$SOA", e))?,
        expire: parse_ttl(expire).map_err(|e| bad_args("$SOA", e))?,
        minimum: parse_ttl(minimum).map_err(|e| bad_args("$SOA", e))?,
    })
}

fn parse_ns_args(args: &[&str]) -> Result<NsSet, DirectiveError> {
    let (ttl, rest) = args.split_first().ok_or_else(|| bad_args("$NS", "missing ttl"))?;
    let ttl = parse_ttl(ttl).map_err(|e| bad_args("$NS", e))?;

    let servers = rest
        .iter()
        .filter(|dn| !dn.starts_with('-'))
        .map(|dn| parse_dn(dn).ok_or_else(|| bad_args("$NS", format!("bad nameserver dn: {dn}"))))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NsSet { ttl, servers })
}

/// Parses a domain name argument; accepts both absolute
/// (trailing-dot) and bare names, treating a bare name as relative to
/// the root.
fn parse_dn(s: &str) -> Option<DomainName> {
    if s.ends_with('.') {
        DomainName::from_dotted_string(s)
    } else {
        DomainName::from_dotted_string(&format!("{s}."))
    }
}

fn parse_uint32(s: &str) -> Result<u32, String> {
    s.parse::<u32>().map_err(|_| format!("'{s}' is not a valid 32-bit integer"))
}

/// Parses an unsigned duration in seconds, with an optional trailing
/// unit suffix (`s`, `m`, `h`, `d`, `w` - seconds, minutes, hours,
/// days, weeks), mirroring `parse_time_nb`.
pub fn parse_ttl(s: &str) -> Result<u32, String> {
    let (digits, multiplier) = match s.chars().last() {
        Some('s') | Some('S') => (&s[..s.len() - 1], 1),
        Some('m') | Some('M') => (&s[..s.len() - 1], 60),
        Some('h') | Some('H') => (&s[..s.len() - 1], 3600),
        Some('d') | Some('D') => (&s[..s.len() - 1], 86400),
        Some('w') | Some('W') => (&s[..s.len() - 1], 604_800),
        _ => (s, 1),
    };

    let value: u64 = digits.parse().map_err(|_| format!("'{s}' is not a valid duration"))?;
    u32::try_from(value.saturating_mul(multiplier)).map_err(|_| format!("'{s}' overflows a u32 duration"))
}

/// Parses a `$MAXRANGE4` argument, either a bare count or a `/cidr`
/// suffix giving the number of host addresses `2^(32-prefix)`.
fn parse_maxrange4(s: &str) -> Result<u32, String> {
    if let Some(cidr) = s.strip_prefix('/') {
        let prefix: u32 = cidr.parse().map_err(|_| format!("'{s}' is not a valid cidr"))?;
        if prefix > 32 {
            return Err(format!("'{s}' is not a valid cidr"));
        }
        // `/0` covers the whole address space (2^32 host addresses),
        // which doesn't fit in a u32 - cap it at u32::MAX rather than
        // overflowing the shift (matches the netmask special-case in
        // `dataset_types.rs`'s CIDR parser).
        let count = 1u64 << (32 - prefix);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    } else {
        s.parse().map_err(|_| format!("'{s}' is not a valid range count"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_parses_suffixes() {
        assert_eq!(Ok(60), parse_ttl("60"));
        assert_eq!(Ok(60), parse_ttl("1m"));
        assert_eq!(Ok(3600), parse_ttl("1h"));
        assert_eq!(Ok(86400), parse_ttl("1d"));
        assert_eq!(Ok(604_800), parse_ttl("1w"));
    }

    #[test]
    fn soa_is_assign_once() {
        let mut ctx = DirectiveContext::default();
        parse_directive(
            "$SOA 3600 ns1.example.com. hostmaster.example.com. 1 7200 900 604800 3600",
            &mut ctx,
            0,
        )
        .unwrap();
        let first = ctx.common.soa.clone().unwrap().serial;

        parse_directive(
            "$SOA 3600 ns2.example.com. hostmaster.example.com. 2 7200 900 604800 3600",
            &mut ctx,
            0,
        )
        .unwrap();
        assert_eq!(first, ctx.common.soa.unwrap().serial);
    }

    #[test]
    fn soa_forbidden_in_acl() {
        let mut ctx = DirectiveContext::default();
        let err = parse_directive(
            "$SOA 3600 ns1.example.com. hostmaster.example.com. 1 7200 900 604800 3600",
            &mut ctx,
            type_flags::IS_ACL,
        )
        .unwrap_err();
        assert_eq!(DirectiveError::ForbiddenInAcl("$SOA"), err);
    }

    #[test]
    fn maxrange4_only_decreases() {
        let mut ctx = DirectiveContext::default();
        parse_directive("$MAXRANGE4 256", &mut ctx, 0).unwrap();
        assert_eq!(Some(256), ctx.common.max_range4);

        let err = parse_directive("$MAXRANGE4 512", &mut ctx, 0).unwrap_err();
        assert_eq!(DirectiveError::MaxRangeIncreaseIgnored, err);
        assert_eq!(Some(256), ctx.common.max_range4);

        parse_directive("$MAXRANGE4 64", &mut ctx, 0).unwrap();
        assert_eq!(Some(64), ctx.common.max_range4);
    }

    #[test]
    fn maxrange4_slash_zero_caps_at_u32_max_without_overflow() {
        let mut ctx = DirectiveContext::default();
        parse_directive("$MAXRANGE4 /0", &mut ctx, 0).unwrap();
        assert_eq!(Some(u32::MAX), ctx.common.max_range4);
    }

    #[test]
    fn maxrange4_cidr_matches_host_count() {
        let mut ctx = DirectiveContext::default();
        parse_directive("$MAXRANGE4 /24", &mut ctx, 0).unwrap();
        assert_eq!(Some(256), ctx.common.max_range4);
    }

    #[test]
    fn substitutions_are_assign_once() {
        let mut ctx = DirectiveContext::default();
        parse_directive("$0 first", &mut ctx, 0).unwrap();
        parse_directive("$0 second", &mut ctx, 0).unwrap();
        assert_eq!(Some("first".to_string()), ctx.common.substitutions[0]);
    }

    #[test]
    fn unrecognized_directive_is_an_error() {
        let mut ctx = DirectiveContext::default();
        assert!(parse_directive("$BOGUS foo", &mut ctx, 0).is_err());
    }

    #[test]
    fn dataset_directive_requires_subdataset_support() {
        let mut ctx = DirectiveContext::default();
        let err = parse_directive("$DATASET spam", &mut ctx, 0).unwrap_err();
        assert_eq!(DirectiveError::DatasetNotCombined, err);
        assert_eq!(None, ctx.current_subdataset);
    }

    #[test]
    fn dataset_directive_succeeds_when_type_supports_it() {
        let mut ctx = DirectiveContext::default();
        parse_directive("$DATASET spam", &mut ctx, type_flags::SUPPORTS_SUBDATASET).unwrap();
        assert_eq!(Some("spam".to_string()), ctx.current_subdataset);
    }
}
