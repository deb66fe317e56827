use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use isohost_contracts::{CHANNEL_NAME_MAX_LEN, CHANNEL_NAME_PREFIX};
use log::warn;
use sha2::{Digest, Sha256};

use crate::HostError;

/// Binding name of a call channel. Also names the host's artifact directory, so it must
/// stay filesystem-safe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn generate() -> Self {
        ChannelName(format!("{CHANNEL_NAME_PREFIX}-{:016x}", unique_hash64()))
    }

    pub fn parse(raw: &str) -> Result<Self, HostError> {
        validate_channel_name(raw)?;
        Ok(ChannelName(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate_channel_name(name: &str) -> Result<(), HostError> {
    let invalid = |why: String| HostError::Validation(format!("channel name {name:?}: {why}"));
    if name.is_empty() {
        return Err(invalid("is empty".to_string()));
    }
    if name.len() > CHANNEL_NAME_MAX_LEN {
        return Err(invalid(format!("must be <= {CHANNEL_NAME_MAX_LEN} bytes")));
    }
    let first = name.as_bytes()[0] as char;
    if !first.is_ascii_alphanumeric() {
        return Err(invalid("must start with [A-Za-z0-9]".to_string()));
    }
    for c in name.chars() {
        if !matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '_' | '.' | '-') {
            return Err(invalid(format!("contains invalid character {c:?}")));
        }
    }
    Ok(())
}

/// 64 random bits, salted with a per-process counter so that a failing OS source still
/// yields distinct names within one process.
fn unique_hash64() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut seed = [0u8; 16];
    if let Err(err) = getrandom::getrandom(&mut seed) {
        warn!("OS randomness unavailable for channel names: {err}");
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    mix64(&seed, COUNTER.fetch_add(1, Ordering::Relaxed), nanos)
}

fn mix64(seed: &[u8; 16], count: u64, nanos: u128) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(std::process::id().to_le_bytes());
    hasher.update(count.to_le_bytes());
    hasher.update(nanos.to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    #[test]
    fn generated_names_are_prefixed_hex() {
        let name = ChannelName::generate();
        let s = name.as_str();
        assert!(s.starts_with("isohost-"), "{s}");
        assert_eq!(s.len(), "isohost-".len() + 16);
        ChannelName::parse(s).unwrap();
    }

    #[test]
    fn generated_names_do_not_collide_across_threads() {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                std::thread::spawn(|| (0..256).map(|_| ChannelName::generate()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = BTreeSet::new();
        for h in handles {
            for name in h.join().unwrap() {
                assert!(seen.insert(name.clone()), "duplicate {name}");
            }
        }
        assert_eq!(seen.len(), 16 * 256);
    }

    #[test]
    fn ids_depend_on_the_random_seed() {
        let a = mix64(&[1; 16], 7, 42);
        assert_eq!(a, mix64(&[1; 16], 7, 42));
        assert_ne!(a, mix64(&[2; 16], 7, 42));
        assert_ne!(a, mix64(&[1; 16], 8, 42));
    }

    #[test]
    fn parse_rejects_unsafe_names() {
        assert!(ChannelName::parse("").is_err());
        assert!(ChannelName::parse("-leading").is_err());
        assert!(ChannelName::parse("a/b").is_err());
        assert!(ChannelName::parse("a b").is_err());
        assert!(ChannelName::parse(&"a".repeat(65)).is_err());
        ChannelName::parse("isohost-custom_1.x").unwrap();
    }
}
