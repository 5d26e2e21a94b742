//! # devbus-core
//!
//! Shared library for the devbus message broker containing the wire envelope
//! types, the JSON codec, envelope-id generation, and the bounded trace
//! buffer used for replay diagnostics.
//!
//! This crate is used by both the broker and client applications.
//! It has zero dependencies on OS APIs, network sockets, or the async runtime.

pub mod buffer;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `devbus_core::Envelope` instead of `devbus_core::protocol::envelope::Envelope`.
pub use buffer::TraceBuffer;
pub use protocol::codec::{decode, encode, DecodeError, EncodeError};
pub use protocol::envelope::{Envelope, EnvelopeKind, PROTOCOL_VERSION};
pub use protocol::sequence::EnvelopeIdGen;
