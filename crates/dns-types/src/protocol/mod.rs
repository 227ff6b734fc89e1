//! DNS wire protocol: the message model and its serialised form.
//!
//! Only the record types this nameserver answers with get a structured
//! representation (A, NS, CNAME, SOA, TXT, CAA); anything else is
//! carried as opaque octets so it can at least be passed through.

pub mod deserialise;
pub mod serialise;
pub mod types;
