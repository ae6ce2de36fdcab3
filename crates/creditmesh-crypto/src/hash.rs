use creditmesh_core::types::Pid;
use sha2::{Digest, Sha256};

/// Compute SHA-256 of arbitrary bytes → 32-byte array.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&digest);
    arr
}

/// Derive a PID from raw public key bytes: `Base58(SHA-256(public_key))`,
/// carried internally as the digest itself.
pub fn pid_from_pubkey(pubkey_bytes: &[u8]) -> Pid {
    Pid::from_bytes(sha256(pubkey_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_is_deterministic() {
        let key = [0x42u8; 32];
        assert_eq!(pid_from_pubkey(&key), pid_from_pubkey(&key));
        assert_ne!(pid_from_pubkey(&key), pid_from_pubkey(&[0x43u8; 32]));
    }

    #[test]
    fn pid_b58_is_roughly_44_chars() {
        let pid = pid_from_pubkey(&[7u8; 32]);
        let s = pid.to_b58();
        assert!((42..=45).contains(&s.len()), "unexpected length {}", s.len());
    }
}
