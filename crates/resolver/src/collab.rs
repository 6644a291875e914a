//! Interfaces to the collaborators the resolution core drives but does
//! not implement: the DNS wire client, the system resolver, mDNS, the
//! reachability probes, NAT64 synthesis, and address sorting. Production
//! wiring supplies real transports; tests supply scripted fakes.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;

use futures::future::LocalBoxFuture;

use host_cache::{AnonymizationKey, CacheEntry, KeyFlags, QueryType, ResolveError};

/// One DNS transaction: a single (hostname, rrtype) query over either
/// secure (DoH) or insecure transport. The returned entry carries the
/// records and observed TTL for that rrtype only.
///
/// A transaction signals the HTTPS-only upgrade with
/// [`ResolveError::HttpsOnly`]; the task treats that as fatal.
pub trait DnsTransactionFactory {
    fn query(
        &self,
        hostname: &str,
        query_type: QueryType,
        secure: bool,
        anonymization_key: &AnonymizationKey,
    ) -> LocalBoxFuture<'static, Result<CacheEntry, ResolveError>>;
}

/// Blocking system resolution (getaddrinfo), offloaded by the embedder to
/// a worker pool; the future completes on the owner executor.
pub trait SystemResolver {
    fn resolve(
        &self,
        hostname: &str,
        flags: KeyFlags,
        max_retry_attempts: u32,
    ) -> LocalBoxFuture<'static, Result<Vec<IpAddr>, ResolveError>>;
}

/// Multicast DNS resolution for local names.
pub trait MdnsClient {
    fn resolve(
        &self,
        hostname: &str,
        query_type: QueryType,
    ) -> LocalBoxFuture<'static, Result<CacheEntry, ResolveError>>;
}

/// Probes whether any globally reachable IPv6 destination exists.
///
/// `cached` returns a still-valid prior probe outcome without suspending;
/// `probe` performs (or awaits) an actual probe. `on_wifi` reports
/// whether the active network is Wi-Fi, for the `check_ipv6_on_wifi`
/// manager option.
pub trait ReachabilityProbe {
    fn cached(&self) -> Option<bool>;
    fn probe(&self) -> LocalBoxFuture<'static, bool>;
    fn on_wifi(&self) -> bool {
        false
    }
}

/// NAT64 prefix discovery and address synthesis for IPv4 literals on
/// IPv6-only networks. Returns `None` when no prefix is available.
pub trait Nat64Synthesizer {
    fn synthesize(&self, address: Ipv4Addr) -> LocalBoxFuture<'static, Option<Vec<IpAddr>>>;
}

/// Orders addresses for connection attempts (IPv6 preference, Happy
/// Eyeballs interleaving).
pub trait AddressSorter {
    fn sort(&self, addresses: Vec<SocketAddr>) -> Vec<SocketAddr>;
}

/// Stable sort with IPv6 ahead of IPv4; the default when the embedder
/// supplies no platform sorter.
pub struct Ipv6PrioritySorter;

impl AddressSorter for Ipv6PrioritySorter {
    fn sort(&self, mut addresses: Vec<SocketAddr>) -> Vec<SocketAddr> {
        addresses.sort_by_key(|address| match address {
            SocketAddr::V6(_) => 0,
            SocketAddr::V4(_) => 1,
        });
        addresses
    }
}

/// The full collaborator set handed to the manager. mDNS and NAT64 are
/// optional capabilities; their absence removes the corresponding tasks
/// from every task sequence.
pub struct Collaborators {
    pub dns: Rc<dyn DnsTransactionFactory>,
    pub system: Rc<dyn SystemResolver>,
    pub mdns: Option<Rc<dyn MdnsClient>>,
    pub ipv6_probe: Rc<dyn ReachabilityProbe>,
    pub nat64: Option<Rc<dyn Nat64Synthesizer>>,
    pub sorter: Rc<dyn AddressSorter>,
}
