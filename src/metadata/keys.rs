//! Deterministic key derivation
//!
//! Keys are hashes of the identity strings, so every process derives the same
//! key for the same tuple without coordination. The metric half uses the
//! 128-bit xxh3 digest, the host half the low 32 bits of the 64-bit digest.

use xxhash_rust::xxh3::{xxh3_128, xxh3_64};

use crate::types::{HostKey, MetricIdentity, MetricKey, SeriesIdentity, SeriesKey};

/// Field separator; cannot appear in metric, app or instance names
const SEPARATOR: u8 = 0x1f;

/// Derive the 16-byte key of a metric identity
pub fn metric_key_for(identity: &MetricIdentity) -> MetricKey {
    let instance = identity.instance_id.as_deref().unwrap_or("");
    let mut buf = Vec::with_capacity(
        identity.metric_name.len() + identity.app_id.len() + instance.len() + 2,
    );
    buf.extend_from_slice(identity.metric_name.as_bytes());
    buf.push(SEPARATOR);
    buf.extend_from_slice(identity.app_id.as_bytes());
    buf.push(SEPARATOR);
    buf.extend_from_slice(instance.as_bytes());

    MetricKey(xxh3_128(&buf).to_be_bytes())
}

/// Derive the 4-byte key of a host name
pub fn host_key_for(host_name: &str) -> HostKey {
    let digest = xxh3_64(host_name.as_bytes());
    HostKey((digest as u32).to_be_bytes())
}

/// Derive the full 20-byte series key
pub fn series_key_for(identity: &SeriesIdentity) -> SeriesKey {
    SeriesKey::new(
        metric_key_for(&identity.metric),
        host_key_for(&identity.host_name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_stable() {
        let a = MetricIdentity::new("cpu_user", "HOST").on_host("h1");
        let b = MetricIdentity::new("cpu_user", "HOST").on_host("h1");
        assert_eq!(series_key_for(&a), series_key_for(&b));
    }

    #[test]
    fn test_fields_are_separated() {
        // "ab" + "c" must not hash like "a" + "bc"
        let left = MetricIdentity::new("ab", "c");
        let right = MetricIdentity::new("a", "bc");
        assert_ne!(metric_key_for(&left), metric_key_for(&right));

        let with_instance = MetricIdentity::new("ab", "c").with_instance("i1");
        assert_ne!(metric_key_for(&left), metric_key_for(&with_instance));
    }

    #[test]
    fn test_hosts_share_metric_prefix() {
        let m = MetricIdentity::new("disk_free", "HOST");
        let k1 = series_key_for(&m.clone().on_host("h1"));
        let k2 = series_key_for(&m.clone().on_host("h2"));
        assert_eq!(k1.metric_key(), k2.metric_key());
        assert_ne!(k1.host_key(), k2.host_key());
        assert_eq!(k1.metric_key(), metric_key_for(&m));
    }
}
