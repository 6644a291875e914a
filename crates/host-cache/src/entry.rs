use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ResolveError;

/// Where a cached result was obtained.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    #[default]
    Unknown,
    Dns,
    Hosts,
}

/// Connection metadata attached to an endpoint by an HTTPS record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpsMetadata {
    pub priority: u16,
    pub target_name: String,
    pub alpns: Vec<String>,
}

/// How stale a cache entry was at lookup time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Staleness {
    /// How far past expiry the entry is, or `None` if not yet expired.
    pub expired_by: Option<Duration>,
    /// Network changes observed since the entry was cached.
    pub network_changes: u64,
    /// Times this entry had already been served stale before this lookup.
    pub stale_hits: u32,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        self.network_changes > 0 || self.expired_by.is_some()
    }
}

/// A resolution result: the latest addresses (or error) looked up for a
/// cache key, with TTL bookkeeping added when the entry is stored.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    error: Option<ResolveError>,
    addresses: Vec<SocketAddr>,
    text_records: Vec<String>,
    hostnames: Vec<(String, u16)>,
    aliases: BTreeSet<String>,
    metadata: Vec<HttpsMetadata>,
    source: EntrySource,
    /// TTL reported by the source; `None` if unknown.
    ttl: Option<Duration>,

    // Stamped by the cache on set(); defaults until then.
    expires: Option<Instant>,
    network_generation: u64,
    insertion_index: u64,
    total_hits: u32,
    stale_hits: u32,
}

impl CacheEntry {
    pub fn for_success(
        addresses: Vec<SocketAddr>,
        source: EntrySource,
        ttl: Option<Duration>,
    ) -> Self {
        Self::raw(None, addresses, source, ttl)
    }

    pub fn for_error(error: ResolveError, ttl: Option<Duration>) -> Self {
        Self::raw(Some(error), Vec::new(), EntrySource::Unknown, ttl)
    }

    fn raw(
        error: Option<ResolveError>,
        addresses: Vec<SocketAddr>,
        source: EntrySource,
        ttl: Option<Duration>,
    ) -> Self {
        CacheEntry {
            error,
            addresses,
            text_records: Vec::new(),
            hostnames: Vec::new(),
            aliases: BTreeSet::new(),
            metadata: Vec::new(),
            source,
            ttl,
            expires: None,
            network_generation: 0,
            insertion_index: 0,
            total_hits: 0,
            stale_hits: 0,
        }
    }

    pub fn with_aliases(mut self, aliases: BTreeSet<String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_text_records(mut self, text_records: Vec<String>) -> Self {
        self.text_records = text_records;
        self
    }

    pub fn with_hostnames(mut self, hostnames: Vec<(String, u16)>) -> Self {
        self.hostnames = hostnames;
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<HttpsMetadata>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn error(&self) -> Option<ResolveError> {
        self.error
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn text_records(&self) -> &[String] {
        &self.text_records
    }

    pub fn hostnames(&self) -> &[(String, u16)] {
        &self.hostnames
    }

    pub fn aliases(&self) -> &BTreeSet<String> {
        &self.aliases
    }

    pub fn metadata(&self) -> &[HttpsMetadata] {
        &self.metadata
    }

    pub fn source(&self) -> EntrySource {
        self.source
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn expires(&self) -> Option<Instant> {
        self.expires
    }

    pub fn network_generation(&self) -> u64 {
        self.network_generation
    }

    pub fn total_hits(&self) -> u32 {
        self.total_hits
    }

    pub fn stale_hits(&self) -> u32 {
        self.stale_hits
    }

    pub(crate) fn insertion_index(&self) -> u64 {
        self.insertion_index
    }

    /// A copy whose port-0 addresses (and hostnames) carry `port`; turns
    /// a cache hit into a result for the request's port.
    pub fn with_default_port(&self, port: u16) -> Self {
        let mut entry = self.clone();
        for address in &mut entry.addresses {
            if address.port() == 0 {
                address.set_port(port);
            }
        }
        for (_, hostname_port) in &mut entry.hostnames {
            if *hostname_port == 0 {
                *hostname_port = port;
            }
        }
        entry
    }

    /// Merges the halves of one lookup (typically AAAA in `front` and A
    /// in `back`): addresses concatenate in that order, the TTL takes the
    /// minimum known value, aliases and records union. An error survives
    /// only if both halves failed.
    pub fn merge(front: CacheEntry, back: CacheEntry) -> CacheEntry {
        let error = match (front.error, back.error) {
            (Some(error), Some(_)) => Some(error),
            _ => None,
        };
        let mut addresses = front.addresses;
        addresses.extend(back.addresses);
        let mut text_records = front.text_records;
        text_records.extend(back.text_records);
        let mut hostnames = front.hostnames;
        hostnames.extend(back.hostnames);
        let mut aliases = front.aliases;
        aliases.extend(back.aliases);
        let mut metadata = front.metadata;
        metadata.extend(back.metadata);

        CacheEntry {
            error,
            addresses,
            text_records,
            hostnames,
            aliases,
            metadata,
            source: if front.source == back.source {
                front.source
            } else {
                EntrySource::Unknown
            },
            ttl: match (front.ttl, back.ttl) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (ttl, None) | (None, ttl) => ttl,
            },
            expires: None,
            network_generation: 0,
            insertion_index: 0,
            total_hits: 0,
            stale_hits: 0,
        }
    }

    /// An entry is stale once its expiry has passed or the network has
    /// changed since it was cached.
    pub fn is_stale(&self, now: Instant, network_generation: u64) -> bool {
        self.staleness(now, network_generation).is_stale()
    }

    pub fn staleness(&self, now: Instant, network_generation: u64) -> Staleness {
        Staleness {
            expired_by: self
                .expires
                .and_then(|expires| now.checked_duration_since(expires)),
            network_changes: network_generation.saturating_sub(self.network_generation),
            stale_hits: self.stale_hits,
        }
    }

    pub(crate) fn count_hit(&mut self, hit_is_stale: bool) {
        self.total_hits += 1;
        if hit_is_stale {
            self.stale_hits += 1;
        }
    }

    // The copy actually stored by the cache: expiry and generation are
    // stamped, hit counters start over.
    pub(crate) fn prepare_for_cache(
        &self,
        now: Instant,
        ttl: Duration,
        network_generation: u64,
        insertion_index: u64,
    ) -> Self {
        let mut entry = self.clone();
        entry.expires = Some(now + ttl);
        entry.network_generation = network_generation;
        entry.insertion_index = insertion_index;
        entry.total_hits = 0;
        entry.stale_hits = 0;
        entry
    }

    pub(crate) fn restored(
        error: Option<ResolveError>,
        addresses: Vec<SocketAddr>,
        text_records: Vec<String>,
        hostnames: Vec<(String, u16)>,
        aliases: BTreeSet<String>,
        source: EntrySource,
        ttl: Option<Duration>,
        expires: Instant,
        network_generation: u64,
        insertion_index: u64,
    ) -> Self {
        CacheEntry {
            error,
            addresses,
            text_records,
            hostnames,
            aliases,
            metadata: Vec::new(),
            source,
            ttl,
            expires: Some(expires),
            network_generation,
            insertion_index,
            total_hits: 0,
            stale_hits: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn addr(ip: IpAddr, port: u16) -> SocketAddr {
        SocketAddr::new(ip, port)
    }

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

    #[test]
    fn with_default_port_only_touches_port_zero() {
        let entry = CacheEntry::for_success(
            vec![addr(V4, 0), addr(V6, 8080)],
            EntrySource::Dns,
            None,
        );
        let entry = entry.with_default_port(443);
        assert_eq!(entry.addresses()[0].port(), 443);
        assert_eq!(entry.addresses()[1].port(), 8080);
    }

    #[test]
    fn merge_concatenates_and_takes_min_ttl() {
        let front = CacheEntry::for_success(
            vec![addr(V6, 0)],
            EntrySource::Dns,
            Some(Duration::from_secs(300)),
        );
        let back = CacheEntry::for_success(
            vec![addr(V4, 0)],
            EntrySource::Dns,
            Some(Duration::from_secs(60)),
        );
        let merged = CacheEntry::merge(front, back);
        assert!(merged.is_ok());
        assert_eq!(merged.addresses(), &[addr(V6, 0), addr(V4, 0)]);
        assert_eq!(merged.ttl(), Some(Duration::from_secs(60)));
        assert_eq!(merged.source(), EntrySource::Dns);
    }

    #[test]
    fn merge_error_survives_only_if_both_fail() {
        let ok = CacheEntry::for_success(vec![addr(V4, 0)], EntrySource::Dns, None);
        let err = CacheEntry::for_error(ResolveError::NameNotResolved, None);
        assert!(CacheEntry::merge(ok.clone(), err.clone()).is_ok());
        assert!(CacheEntry::merge(err.clone(), ok).is_ok());
        assert_eq!(
            CacheEntry::merge(err.clone(), err).error(),
            Some(ResolveError::NameNotResolved)
        );
    }

    #[test]
    fn staleness_tracks_expiry_and_generation() {
        let now = Instant::now();
        let entry = CacheEntry::for_success(vec![addr(V4, 0)], EntrySource::Dns, None)
            .prepare_for_cache(now, Duration::from_secs(60), 3, 0);

        let fresh = entry.staleness(now + Duration::from_secs(30), 3);
        assert_eq!(fresh.expired_by, None);
        assert_eq!(fresh.network_changes, 0);
        assert!(!fresh.is_stale());

        let expired = entry.staleness(now + Duration::from_secs(90), 3);
        assert_eq!(expired.expired_by, Some(Duration::from_secs(30)));
        assert!(expired.is_stale());

        let past_network = entry.staleness(now, 5);
        assert_eq!(past_network.network_changes, 2);
        assert!(past_network.is_stale());
    }
}
