//! Wire protocol, codec and reconnection policy shared by the octoporty
//! agent and gateway binaries.

pub mod backoff;
pub mod codec;
pub mod message;
pub mod version;

pub use codec::{CodecError, COMPRESSION_THRESHOLD_BYTES};
pub use message::{LogEntryWire, LogLevel, Message, PortMapping, UpdateStatus};

use sha2::{Digest, Sha256};

/// Compute the 16-hex-char configuration snapshot hash used in
/// `ConfigSync`/`ConfigAck` to let both sides agree they hold the same
/// mapping set without re-sending it.
///
/// Mappings are sorted by id first so that hash is independent of the
/// order they were loaded or iterated in.
pub fn config_hash(mappings: &[PortMapping]) -> String {
    let mut sorted: Vec<&PortMapping> = mappings.iter().collect();
    sorted.sort_by_key(|m| m.id);

    let mut hasher = Sha256::new();
    for mapping in sorted {
        hasher.update(mapping.id.as_bytes());
        hasher.update(mapping.external_domain.as_bytes());
        hasher.update(mapping.internal_host.as_bytes());
        hasher.update(mapping.internal_port.to_le_bytes());
        hasher.update([mapping.internal_use_tls as u8, mapping.allow_self_signed as u8, mapping.enabled as u8]);
    }
    let digest = hasher.finalize();
    hex_prefix(&digest, 8)
}

fn hex_prefix(bytes: &[u8], byte_count: usize) -> String {
    bytes
        .iter()
        .take(byte_count)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Headers excluded on both proxy hops (agent→internal-service and
/// gateway→external-client): these are connection-scoped and meaningless
/// once relayed across a message-based tunnel.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn mapping(id: Uuid) -> PortMapping {
        PortMapping {
            id,
            external_domain: "a.test".into(),
            internal_host: "127.0.0.1".into(),
            internal_port: 80,
            internal_use_tls: false,
            allow_self_signed: false,
            enabled: true,
            description: String::new(),
        }
    }

    #[test]
    fn hash_is_sixteen_hex_chars() {
        let hash = config_hash(&[mapping(Uuid::nil())]);
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_is_order_independent() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let forward = config_hash(&[mapping(a), mapping(b)]);
        let backward = config_hash(&[mapping(b), mapping(a)]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn hash_changes_when_mapping_changes() {
        let mut m = mapping(Uuid::nil());
        let before = config_hash(&[m.clone()]);
        m.internal_port = 81;
        let after = config_hash(&[m]);
        assert_ne!(before, after);
    }

    #[test]
    fn empty_mappings_hash_is_stable() {
        let first = config_hash(&[]);
        let second = config_hash(&[]);
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }
}
