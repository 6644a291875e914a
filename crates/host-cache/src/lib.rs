//! Result cache for host-name resolution.
//!
//! Defines the canonical cache identity ([`CacheKey`] and the vocabulary
//! types it is built from), the result payload ([`CacheEntry`] with its
//! [`Staleness`] descriptor), and a bounded TTL cache ([`HostCache`]) with
//! explicit staleness tracking across network-change events and a
//! serde-based persistence format.

mod cache;
mod entry;
mod error;
mod key;
mod persist;

pub use cache::{HostCache, PersistenceDelegate};
pub use entry::{CacheEntry, EntrySource, HttpsMetadata, Staleness};
pub use error::ResolveError;
pub use key::{
    canonicalize_hostname, AnonymizationKey, CacheKey, HostKey, KeyFlags, QueryType, QueryTypeSet,
    ResolveSource, SecureDnsMode,
};
