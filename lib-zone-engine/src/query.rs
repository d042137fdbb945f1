//! Parsing and validation of an inbound query, ahead of zone match and
//! dispatch.

use std::net::Ipv4Addr;

use dns_wire::protocol::types::{DomainName, Message, QueryClass, QueryType, RecordClass, RecordType};

/// Bitmask of the record types a query can be asking about, used to
/// decide which emitters a dataset or the zone apex handler should
/// run. `OTHER` matches nothing but still earns an authority-section
/// SOA on an empty answer.
pub mod type_flags {
    pub const ANY: u16 = 0b0000_0001;
    pub const A: u16 = 0b0000_0010;
    pub const TXT: u16 = 0b0000_0100;
    pub const NS: u16 = 0b0000_1000;
    pub const SOA: u16 = 0b0001_0000;
    pub const MX: u16 = 0b0010_0000;
    pub const OTHER: u16 = 0b0100_0000;
}

/// The parsed, validated query, ready for zone match.
#[derive(Debug, Clone)]
pub struct Query {
    pub name: DomainName,
    pub qtype: QueryType,
    pub qclass: QueryClass,
    pub type_flags: u16,
    /// Labels in root-first order (the terminating root label
    /// dropped), used for longest-suffix zone matching.
    pub reversed_labels: Vec<Vec<u8>>,
    /// Populated by dispatch once a zone is matched, if that zone is
    /// marked IPv4-reverse and the leading labels under the zone
    /// decode as dotted octets.
    pub ipv4: Option<(Ipv4Addr, u8)>,
}

/// Why a datagram was rejected before it could be turned into a
/// [`Query`]. Every variant means "drop the packet, do not respond" -
/// see [`ResponseOutcome`](crate::dispatch::ResponseOutcome) for the
/// cases that do get a response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RejectReason {
    TooShort,
    NotAQuery,
    WrongQuestionCount,
    Malformed,
}

/// Minimum datagram length: a 12-byte header plus a single root-only
/// question (1-byte root label + 2-byte QTYPE + 2-byte QCLASS).
const MIN_QUERY_LEN: usize = 12 + 5;

/// Parses and validates a raw datagram into a `(Message, Query)` pair.
///
/// # Errors
///
/// Returns a [`RejectReason`] for any datagram that must be dropped
/// without a response, per the wire-codec query-parse rules.
pub fn parse_query(datagram: &[u8]) -> Result<(Message, Query), RejectReason> {
    if datagram.len() < MIN_QUERY_LEN {
        return Err(RejectReason::TooShort);
    }

    let message = Message::from_octets(datagram).map_err(|_| RejectReason::Malformed)?;

    if message.header.is_response {
        return Err(RejectReason::NotAQuery);
    }
    if message.questions.len() != 1 {
        return Err(RejectReason::WrongQuestionCount);
    }

    let question = &message.questions[0];
    // Lowercase the query name for matching and dataset lookups; the
    // question section echoed back to the client stays byte-identical
    // to what it sent (`Message::make_response` clones it unchanged).
    let lowered_labels: Vec<Vec<u8>> = question
        .name
        .labels
        .iter()
        .map(|label| label.iter().map(u8::to_ascii_lowercase).collect())
        .collect();
    let name = DomainName::from_labels(lowered_labels).unwrap_or_else(|| question.name.clone());
    let reversed_labels = name.reversed_labels().into_iter().map(<[u8]>::to_vec).collect();
    let type_flags = classify_qtype(question.qtype);

    let query = Query {
        name,
        qtype: question.qtype,
        qclass: question.qclass,
        type_flags,
        reversed_labels,
        ipv4: None,
    };

    Ok((message, query))
}

/// Maps a QTYPE to the internal type-flag bitmask, per the wire-codec
/// response-skeleton rules: A/TXT/NS/SOA/MX map to their own flag,
/// ANY maps to ANY, anything at or above TSIG (250) is handled by the
/// caller as NOTIMPL, and everything else is OTHER.
pub fn classify_qtype(qtype: QueryType) -> u16 {
    match qtype {
        QueryType::Wildcard => type_flags::ANY,
        QueryType::Record(RecordType::A) => type_flags::A,
        QueryType::Record(RecordType::TXT) => type_flags::TXT,
        QueryType::Record(RecordType::NS) => type_flags::NS,
        QueryType::Record(RecordType::SOA) => type_flags::SOA,
        QueryType::Record(RecordType::MX) => type_flags::MX,
        _ => type_flags::OTHER,
    }
}

/// True once a QTYPE's numeric value reaches TSIG (250) or beyond -
/// these are meta-RR types this server does not implement at all, and
/// are answered with NOTIMPL rather than OTHER. ANY (255) is excluded:
/// it is a meta-QTYPE numerically but is handled like any other QTYPE
/// per SPEC §4.2/§4.6 (it maps to `type_flags::ANY`, not NOTIMPL).
pub fn is_meta_qtype(qtype: QueryType) -> bool {
    qtype != QueryType::Wildcard && u16::from(qtype) >= 250
}

pub fn qclass_is_in(qclass: QueryClass) -> bool {
    matches!(qclass, QueryClass::Record(RecordClass::IN))
}

pub fn qclass_is_wildcard(qclass: QueryClass) -> bool {
    matches!(qclass, QueryClass::Wildcard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_wire::protocol::types::test_util::domain;
    use dns_wire::protocol::types::{Header, Opcode, Question, Rcode};

    fn query_datagram(name: &str, qtype: QueryType, qclass: QueryClass) -> Vec<u8> {
        let msg = Message {
            header: Header {
                id: 42,
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
                qclass,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };
        msg.into_octets().unwrap()
    }

    #[test]
    fn accepts_a_valid_query() {
        let datagram = query_datagram(
            "example.com.",
            QueryType::Record(RecordType::A),
            QueryClass::Record(RecordClass::IN),
        );
        let (_, query) = parse_query(&datagram).unwrap();
        assert_eq!(type_flags::A, query.type_flags);
        assert_eq!(vec![b"com".to_vec(), b"example".to_vec()], query.reversed_labels);
    }

    /// `DomainName::from_dotted_string` (used by the `domain()` test
    /// helper elsewhere in this crate) already lowercases, so it can't
    /// exercise this behaviour - build the mixed-case wire bytes by
    /// hand, as a client that skips lowercasing would send them.
    fn mixed_case_name() -> DomainName {
        let labels: Vec<Vec<u8>> = vec![b"Rbl".to_vec(), b"EXAMPLE".to_vec(), b"com".to_vec(), Vec::new()];
        let mut octets = Vec::new();
        for label in &labels {
            octets.push(label.len() as u8);
            octets.extend_from_slice(label);
        }
        DomainName { octets, labels }
    }

    #[test]
    fn lowercases_the_name_for_matching_but_not_the_echoed_question() {
        let msg = Message {
            header: Header {
                id: 42,
                is_response: false,
                opcode: Opcode::Standard,
                is_authoritative: false,
                is_truncated: false,
                recursion_desired: true,
                recursion_available: false,
                rcode: Rcode::NoError,
            },
            questions: vec![Question {
                name: mixed_case_name(),
                qtype: QueryType::Record(RecordType::A),
                qclass: QueryClass::Record(RecordClass::IN),
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        };
        let datagram = msg.into_octets().unwrap();

        let (message, query) = parse_query(&datagram).unwrap();
        assert_eq!(vec![b"com".to_vec(), b"example".to_vec(), b"rbl".to_vec()], query.reversed_labels);
        // the response skeleton is built from `message`, which still
        // carries the client's original-case question.
        assert_eq!("Rbl.EXAMPLE.com.", message.questions[0].name.to_dotted_string());
    }

    #[test]
    fn rejects_too_short() {
        assert_eq!(Err(RejectReason::TooShort), parse_query(&[0; 10]));
    }

    #[test]
    fn rejects_responses() {
        let mut datagram = query_datagram(
            "example.com.",
            QueryType::Record(RecordType::A),
            QueryClass::Record(RecordClass::IN),
        );
        datagram[2] |= 0b1000_0000; // set QR
        assert_eq!(Err(RejectReason::NotAQuery), parse_query(&datagram));
    }
}
