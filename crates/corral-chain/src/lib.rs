//! Canonical serialization and chain hashing.
//!
//! Every hash in the system — log hash, partition hash, payload digest,
//! anchor hash, hardware-profile hash — is SHA-256 over the same canonical
//! JSON encoding. These functions have no I/O and no state; they are the only
//! place the chain touches cryptographic primitives.

pub mod canonical;
pub mod hash;

pub use canonical::canonical_json;
pub use hash::{
    anchor_hash, log_hash, partition_hash, partition_of, payload_digest, payload_hmac,
    profile_hash, sha256_hex,
};
