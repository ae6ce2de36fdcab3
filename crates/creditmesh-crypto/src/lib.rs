pub mod canonical;
pub mod hash;

pub use canonical::{canonical_json, payload_hash};
pub use hash::{pid_from_pubkey, sha256};
