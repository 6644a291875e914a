use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::cache::HostCache;
use crate::entry::{CacheEntry, EntrySource};
use crate::error::ResolveError;
use crate::key::{
    AnonymizationKey, CacheKey, HostKey, KeyFlags, QueryType, QueryTypeSet, ResolveSource,
    SecureDnsMode,
};

// One serialized cache entry. Unknown fields are ignored on restore and
// most fields default, so the format can grow without breaking old data.
#[derive(Serialize, Deserialize)]
struct PersistedEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scheme: Option<String>,
    hostname: String,
    #[serde(default)]
    port: u16,
    query_types: Vec<QueryType>,
    #[serde(default)]
    flags: u8,
    #[serde(default)]
    source: ResolveSource,
    #[serde(default)]
    secure_dns_mode: SecureDnsMode,
    #[serde(default)]
    anonymization_key: String,
    #[serde(default)]
    secure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ResolveError>,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    text_records: Vec<String>,
    #[serde(default)]
    hostnames: Vec<(String, u16)>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    entry_source: EntrySource,

    /// TTL in seconds; negative means unknown.
    ttl_secs: i64,
    /// Validity remaining when serialized; negative if already expired.
    expires_in_ms: i64,
    /// Network changes the entry had already seen when serialized.
    #[serde(default)]
    network_changes: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    staleness: Option<PersistedStaleness>,
}

#[derive(Serialize, Deserialize)]
struct PersistedStaleness {
    expired_by_ms: i64,
    network_changes: u64,
    stale_hits: u32,
}

impl HostCache {
    /// Serializes the cache contents for persistence, per entry: key
    /// fields, addresses as strings, TTL seconds, and (when
    /// `include_staleness`) the staleness descriptor at `now`.
    pub fn serialize(&self, now: Instant, include_staleness: bool) -> Vec<serde_json::Value> {
        let network_generation = self.network_generation();
        self.iter()
            .map(|(key, entry)| {
                let staleness = entry.staleness(now, network_generation);
                let expires_in_ms = match entry.expires() {
                    Some(expires) => match expires.checked_duration_since(now) {
                        Some(left) => i64::try_from(left.as_millis()).unwrap_or(i64::MAX),
                        None => match staleness.expired_by {
                            Some(past) => -i64::try_from(past.as_millis()).unwrap_or(i64::MAX),
                            None => 0,
                        },
                    },
                    None => 0,
                };
                let persisted = PersistedEntry {
                    scheme: key.host.scheme().map(str::to_string),
                    hostname: key.host.hostname().to_string(),
                    port: key.host.port(),
                    query_types: key.query_types.iter().collect(),
                    flags: key.flags.bits(),
                    source: key.source,
                    secure_dns_mode: key.secure_dns_mode,
                    anonymization_key: key.anonymization_key.as_str().to_string(),
                    secure: key.secure,
                    error: entry.error(),
                    addresses: entry.addresses().iter().map(SocketAddr::to_string).collect(),
                    text_records: entry.text_records().to_vec(),
                    hostnames: entry.hostnames().to_vec(),
                    aliases: entry.aliases().iter().cloned().collect(),
                    entry_source: entry.source(),
                    ttl_secs: entry
                        .ttl()
                        .map(|ttl| i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX))
                        .unwrap_or(-1),
                    expires_in_ms,
                    network_changes: staleness.network_changes,
                    staleness: include_staleness.then(|| PersistedStaleness {
                        expired_by_ms: staleness
                            .expired_by
                            .map(|past| i64::try_from(past.as_millis()).unwrap_or(i64::MAX))
                            .unwrap_or(-1),
                        network_changes: staleness.network_changes,
                        stale_hits: staleness.stale_hits,
                    }),
                };
                serde_json::to_value(persisted).expect("persisted entry serializes")
            })
            .collect()
    }

    /// Restores serialized entries, skipping any with corrupt fields and
    /// any whose key already has an entry. Returns false if anything was
    /// skipped as corrupt.
    pub fn restore(&mut self, values: &[serde_json::Value], now: Instant) -> bool {
        let mut restored = 0;
        let mut all_parsed = true;
        for value in values {
            match self.restore_entry(value, now) {
                Ok(true) => restored += 1,
                Ok(false) => (), // Key collision; keep the live entry.
                Err(()) => all_parsed = false,
            }
        }
        self.set_restore_size(restored);
        if restored > 0 {
            self.schedule_write();
        }
        tracing::debug!(restored, all_parsed, "restored cache entries");
        all_parsed
    }

    fn restore_entry(&mut self, value: &serde_json::Value, now: Instant) -> Result<bool, ()> {
        let persisted: PersistedEntry =
            serde_json::from_value(value.clone()).map_err(|_| ())?;

        let host = match persisted.scheme {
            Some(scheme) => HostKey::for_scheme(&scheme, &persisted.hostname, persisted.port),
            None => HostKey::for_pair(&persisted.hostname, persisted.port),
        }
        .map_err(|_| ())?;
        let query_types = QueryTypeSet::of(&persisted.query_types);
        if query_types.is_empty() {
            return Err(());
        }
        let key = CacheKey {
            host,
            query_types,
            flags: KeyFlags::from_bits(persisted.flags),
            source: persisted.source,
            secure_dns_mode: persisted.secure_dns_mode,
            anonymization_key: AnonymizationKey::new(persisted.anonymization_key),
            secure: persisted.secure,
        };
        if self.contains_key(&key) {
            return Ok(false);
        }
        // Restoration never evicts live entries or exceeds capacity.
        if self.len() >= self.max_entries() {
            return Ok(false);
        }

        let addresses = persisted
            .addresses
            .iter()
            .map(|address| address.parse::<SocketAddr>().map_err(|_| ()))
            .collect::<Result<Vec<_>, ()>>()?;
        let ttl = u64::try_from(persisted.ttl_secs)
            .ok()
            .map(Duration::from_secs);
        let expires = if persisted.expires_in_ms >= 0 {
            now + Duration::from_millis(persisted.expires_in_ms as u64)
        } else {
            now.checked_sub(Duration::from_millis(persisted.expires_in_ms.unsigned_abs()))
                .unwrap_or(now)
        };

        let (generation, insertion_index) = self.generation_and_next_index();
        let entry = CacheEntry::restored(
            persisted.error,
            addresses,
            persisted.text_records,
            persisted.hostnames,
            persisted.aliases.into_iter().collect::<BTreeSet<_>>(),
            persisted.entry_source,
            ttl,
            expires,
            generation.saturating_sub(persisted.network_changes),
            insertion_index,
        );
        self.insert_restored(key, entry);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntrySource;
    use pretty_assertions::assert_eq;

    fn key(hostname: &str, secure: bool) -> CacheKey {
        CacheKey {
            host: HostKey::for_scheme("https", hostname, 443).unwrap(),
            query_types: QueryTypeSet::of(&[QueryType::A, QueryType::Aaaa, QueryType::Https]),
            flags: KeyFlags::CANONNAME,
            source: ResolveSource::Any,
            secure_dns_mode: SecureDnsMode::Automatic,
            anonymization_key: AnonymizationKey::new("partition-a"),
            secure,
        }
    }

    fn entry(ip: &str, ttl: Option<Duration>) -> CacheEntry {
        let address: SocketAddr = format!("{ip}:443").parse().unwrap();
        CacheEntry::for_success(vec![address], EntrySource::Dns, ttl)
            .with_aliases(["alias.test".to_string()].into_iter().collect())
            .with_text_records(vec!["v=spf1".to_string()])
    }

    #[test]
    fn round_trip_preserves_lookup_results() {
        let now = Instant::now();
        let mut cache = HostCache::new(10);
        cache.set(
            key("a.test", false),
            entry("1.1.1.1", Some(Duration::from_secs(300))),
            now,
            Duration::from_secs(300),
        );
        cache.set(
            key("b.test", true),
            entry("2.2.2.2", None),
            now,
            Duration::from_secs(60),
        );

        let serialized = cache.serialize(now, true);
        assert_eq!(serialized.len(), 2);

        let mut restored = HostCache::new(10);
        assert!(restored.restore(&serialized, now));
        assert_eq!(restored.last_restore_size(), 2);

        for key in [key("a.test", false), key("b.test", true)] {
            let original = cache.lookup(&key, now).expect("entry in original");
            let copy = restored.lookup(&key, now).expect("entry restored");
            assert_eq!(original.error(), copy.error());
            assert_eq!(original.addresses(), copy.addresses());
            assert_eq!(original.aliases(), copy.aliases());
            assert_eq!(original.text_records(), copy.text_records());
            assert_eq!(original.ttl(), copy.ttl());
        }
    }

    #[test]
    fn restore_skips_colliding_keys() {
        let now = Instant::now();
        let mut cache = HostCache::new(10);
        cache.set(
            key("a.test", false),
            entry("1.1.1.1", None),
            now,
            Duration::from_secs(60),
        );
        let serialized = cache.serialize(now, false);

        let mut target = HostCache::new(10);
        target.set(
            key("a.test", false),
            entry("9.9.9.9", None),
            now,
            Duration::from_secs(60),
        );
        assert!(target.restore(&serialized, now));
        assert_eq!(target.last_restore_size(), 0);

        let live = target.lookup(&key("a.test", false), now).unwrap();
        assert_eq!(live.addresses()[0].ip().to_string(), "9.9.9.9");
    }

    #[test]
    fn restore_skips_corrupt_entries_and_tolerates_unknown_fields() {
        let now = Instant::now();
        let mut cache = HostCache::new(10);

        let corrupt_address = serde_json::json!({
            "hostname": "bad.test",
            "query_types": ["A"],
            "addresses": ["not-an-address"],
            "ttl_secs": 60,
            "expires_in_ms": 1000,
        });
        let empty_types = serde_json::json!({
            "hostname": "empty.test",
            "query_types": [],
            "ttl_secs": 60,
            "expires_in_ms": 1000,
        });
        let good_with_extras = serde_json::json!({
            "hostname": "good.test",
            "query_types": ["A"],
            "addresses": ["3.3.3.3:0"],
            "ttl_secs": 60,
            "expires_in_ms": 60000,
            "some_future_field": {"ignored": true},
        });

        assert!(!cache.restore(&[corrupt_address, empty_types, good_with_extras], now));
        assert_eq!(cache.last_restore_size(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn expired_entries_restore_expired() {
        let now = Instant::now();
        let mut cache = HostCache::new(10);
        cache.set(
            key("a.test", false),
            entry("1.1.1.1", None),
            now,
            Duration::from_secs(30),
        );

        // Serialize a minute later, past the TTL.
        let later = now + Duration::from_secs(90);
        let serialized = cache.serialize(later, false);

        let mut restored = HostCache::new(10);
        assert!(restored.restore(&serialized, later));
        assert!(restored.lookup(&key("a.test", false), later).is_none());
        let (_, staleness) = restored
            .lookup_stale(&key("a.test", false), later)
            .unwrap();
        assert_eq!(staleness.expired_by, Some(Duration::from_secs(60)));
    }
}
