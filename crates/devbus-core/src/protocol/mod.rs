//! Wire protocol: envelope types, JSON codec, and id generation.

pub mod codec;
pub mod envelope;
pub mod sequence;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use envelope::{Envelope, EnvelopeKind, PROTOCOL_VERSION};
pub use sequence::EnvelopeIdGen;
