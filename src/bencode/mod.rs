//! Bencode codec
//!
//! Encodes and decodes the self-describing serialization format used by
//! torrent descriptors, tracker responses and extension-protocol payloads.
//! Dictionaries are kept sorted by raw key bytes so that re-encoding a
//! decoded dictionary always reproduces the canonical byte stream the
//! content identifier was computed over.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{decode, decode_all, MAX_DEPTH};
pub use encode::{encode, encode_into};
pub use value::{Dict, Value};
