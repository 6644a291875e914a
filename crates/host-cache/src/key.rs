use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

use crate::error::ResolveError;

/// Canonicalizes a hostname for use in a [`CacheKey`]: ASCII lowercase,
/// surrounding `[` `]` stripped from IPv6 literals. Callers supply
/// A-labels; no IDN mapping happens here. Empty hostnames are rejected.
pub fn canonicalize_hostname(hostname: &str) -> Result<String, ResolveError> {
    let hostname = hostname
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(hostname);
    if hostname.is_empty() {
        return Err(ResolveError::NameNotResolved);
    }
    Ok(hostname.to_ascii_lowercase())
}

/// Host identity of a request and of a cache slot: either scheme + host +
/// port, or a bare host + port pair. The hostname is always stored in
/// canonical form.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HostKey {
    Scheme {
        scheme: String,
        hostname: String,
        port: u16,
    },
    Plain {
        hostname: String,
        port: u16,
    },
}

impl HostKey {
    /// Builds a scheme-bearing host, canonicalizing the hostname. The
    /// scheme string is preserved exactly.
    pub fn for_scheme(scheme: &str, hostname: &str, port: u16) -> Result<Self, ResolveError> {
        Ok(HostKey::Scheme {
            scheme: scheme.to_string(),
            hostname: canonicalize_hostname(hostname)?,
            port,
        })
    }

    /// Builds a bare host + port pair, canonicalizing the hostname.
    pub fn for_pair(hostname: &str, port: u16) -> Result<Self, ResolveError> {
        Ok(HostKey::Plain {
            hostname: canonicalize_hostname(hostname)?,
            port,
        })
    }

    pub fn hostname(&self) -> &str {
        match self {
            HostKey::Scheme { hostname, .. } | HostKey::Plain { hostname, .. } => hostname,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            HostKey::Scheme { port, .. } | HostKey::Plain { port, .. } => *port,
        }
    }

    pub fn scheme(&self) -> Option<&str> {
        match self {
            HostKey::Scheme { scheme, .. } => Some(scheme),
            HostKey::Plain { .. } => None,
        }
    }

    /// Returns a copy with the hostname (and optionally port) replaced,
    /// keeping the scheme shape. Used by host-mapping rewrites.
    pub fn with_replacement(&self, hostname: &str, port: Option<u16>) -> Result<Self, ResolveError> {
        let hostname = canonicalize_hostname(hostname)?;
        Ok(match self {
            HostKey::Scheme { scheme, port: old, .. } => HostKey::Scheme {
                scheme: scheme.clone(),
                hostname,
                port: port.unwrap_or(*old),
            },
            HostKey::Plain { port: old, .. } => HostKey::Plain {
                hostname,
                port: port.unwrap_or(*old),
            },
        })
    }
}

impl fmt::Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKey::Scheme {
                scheme,
                hostname,
                port,
            } => write!(f, "{scheme}://{hostname}:{port}"),
            HostKey::Plain { hostname, port } => write!(f, "{hostname}:{port}"),
        }
    }
}

/// A DNS query type requestable through the resolver.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    A,
    Aaaa,
    Https,
    Txt,
    Srv,
    Ptr,
}

impl QueryType {
    const ALL: [QueryType; 6] = [
        QueryType::A,
        QueryType::Aaaa,
        QueryType::Https,
        QueryType::Txt,
        QueryType::Srv,
        QueryType::Ptr,
    ];

    fn bit(self) -> u8 {
        match self {
            QueryType::A => 1 << 0,
            QueryType::Aaaa => 1 << 1,
            QueryType::Https => 1 << 2,
            QueryType::Txt => 1 << 3,
            QueryType::Srv => 1 << 4,
            QueryType::Ptr => 1 << 5,
        }
    }
}

/// Non-empty set of [`QueryType`]s. `{A, AAAA}` and `{A, AAAA, HTTPS}`
/// are the common shapes.
#[derive(
    Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct QueryTypeSet(u8);

impl QueryTypeSet {
    pub const EMPTY: QueryTypeSet = QueryTypeSet(0);

    pub fn of(types: &[QueryType]) -> Self {
        let mut set = QueryTypeSet::EMPTY;
        for query_type in types {
            set.insert(*query_type);
        }
        set
    }

    pub fn insert(&mut self, query_type: QueryType) {
        self.0 |= query_type.bit();
    }

    pub fn remove(&mut self, query_type: QueryType) {
        self.0 &= !query_type.bit();
    }

    pub fn contains(&self, query_type: QueryType) -> bool {
        self.0 & query_type.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(&self) -> impl Iterator<Item = QueryType> + '_ {
        let set = *self;
        QueryType::ALL
            .iter()
            .copied()
            .filter(move |query_type| set.contains(*query_type))
    }
}

impl fmt::Debug for QueryTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Request flags which partition the cache.
#[derive(
    Copy, Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct KeyFlags(u8);

impl KeyFlags {
    pub const NONE: KeyFlags = KeyFlags(0);
    /// Request the canonical name alongside addresses.
    pub const CANONNAME: KeyFlags = KeyFlags(1 << 0);
    /// Only resolve loopback names.
    pub const LOOPBACK_ONLY: KeyFlags = KeyFlags(1 << 1);
    /// Never resolve over multicast protocols.
    pub const AVOID_MULTICAST: KeyFlags = KeyFlags(1 << 2);
    /// The default address family was narrowed because IPv6 is unreachable.
    pub const DEFAULT_FAMILY_DUE_TO_NO_IPV6: KeyFlags = KeyFlags(1 << 3);

    pub fn contains(&self, flags: KeyFlags) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        KeyFlags(bits)
    }
}

impl BitOr for KeyFlags {
    type Output = KeyFlags;
    fn bitor(self, rhs: KeyFlags) -> KeyFlags {
        KeyFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for KeyFlags {
    fn bitor_assign(&mut self, rhs: KeyFlags) {
        self.0 |= rhs.0;
    }
}

/// Which resolution mechanism a request is willing to use.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResolveSource {
    #[default]
    Any,
    System,
    Dns,
    Mdns,
    LocalOnly,
}

/// Secure-DNS (DoH) mode in effect for a request or cache slot.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SecureDnsMode {
    #[default]
    Off,
    Automatic,
    Secure,
}

/// Opaque network partition identifier. The empty key is the shared,
/// unpartitioned space; when partitioning is globally disabled every key
/// collapses to it so that entries match across partitions.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AnonymizationKey(String);

impl AnonymizationKey {
    pub fn new(partition: impl Into<String>) -> Self {
        AnonymizationKey(partition.into())
    }

    pub fn empty() -> Self {
        AnonymizationKey(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of a cache slot, and of the coalescing group for concurrent
/// jobs. Two keys which compare equal yield interchangeable entries.
///
/// Ordering is lexicographic over the field tuple, cheap fields first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub host: HostKey,
    pub query_types: QueryTypeSet,
    pub flags: KeyFlags,
    pub source: ResolveSource,
    pub secure_dns_mode: SecureDnsMode,
    pub anonymization_key: AnonymizationKey,
    /// Whether the result was (or must be) obtained over secure transport;
    /// secure and insecure results age independently.
    pub secure: bool,
}

impl CacheKey {
    pub fn hostname(&self) -> &str {
        self.host.hostname()
    }
}

impl Ord for CacheKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (
            self.query_types,
            self.flags,
            self.source,
            self.secure_dns_mode,
            self.secure,
            &self.anonymization_key,
            &self.host,
        )
            .cmp(&(
                other.query_types,
                other.flags,
                other.source,
                other.secure_dns_mode,
                other.secure,
                &other.anonymization_key,
                &other.host,
            ))
    }
}

impl PartialOrd for CacheKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
