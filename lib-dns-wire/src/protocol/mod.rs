//! RFC 1035 wire types, and their serialisation/deserialisation
//! to/from the wire format, including the per-packet name
//! compression the response assembler relies on.

pub mod deserialise;
pub mod serialise;
pub mod types;
