//! Host-name resolution core: turns host identifiers plus a request
//! context into resolved endpoints.
//!
//! The pipeline is a prioritized admission gate (the `dispatch` crate), a
//! bounded staleness-aware result cache (the `host-cache` crate), and a
//! per-key coalescing job engine with a configurable task sequence
//! (cache, HOSTS, DoH, insecure DNS, system, mDNS, NAT64). Two wrappers
//! compose in front of the [`Manager`]: [`StaleResolver`] hides lookup
//! latency behind possibly-stale cached data, and [`MappedResolver`]
//! rewrites hostnames through `MAP`/`EXCLUDE` rules.
//!
//! Everything is single-threaded and cooperative: state lives in
//! `Rc`/`RefCell`, background work is `tokio::task::spawn_local`ed, and
//! all observable transitions happen on the owner executor. Run the
//! manager inside a `tokio::task::LocalSet` on a current-thread runtime.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::rc::Rc;

use futures::future::LocalBoxFuture;

mod collab;
mod config;
mod dns_task;
mod endpoint;
mod error;
mod job;
mod manager;
mod mapped;
mod params;
mod request;
mod stale;
mod tasks;

pub use collab::{
    AddressSorter, Collaborators, DnsTransactionFactory, Ipv6PrioritySorter, MdnsClient,
    Nat64Synthesizer, ReachabilityProbe, SystemResolver,
};
pub use config::{DnsConfigOverrides, HttpsSvcbOptions, ManagerOptions};
pub use endpoint::EndpointResult;
pub use error::ResolveErrorInfo;
pub use manager::Manager;
pub use mapped::{HostMappingRules, MappedResolver, RuleParseError};
pub use params::{
    CacheUsage, RequestPriority, ResolveParameters, SecureDnsPolicy, MINIMUM_PRIORITY,
    NUM_PRIORITIES,
};
pub use stale::{StaleOptions, StaleResolver};

pub use host_cache::{
    AnonymizationKey, CacheEntry, CacheKey, EntrySource, HostCache, HostKey, HttpsMetadata,
    KeyFlags, QueryType, QueryTypeSet, ResolveError, ResolveSource, SecureDnsMode, Staleness,
};

/// Result of starting a request.
#[derive(Debug)]
pub enum StartOutcome {
    /// The request completed synchronously: `Ok` with readable results,
    /// or the squashed error. No completion is delivered later.
    Finished(Result<(), ResolveError>),
    /// The resolution continues; await [`ResolveRequest::wait`] for the
    /// completion. Dropping the request first cancels it and the
    /// completion is never delivered.
    Pending,
}

impl StartOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, StartOutcome::Pending)
    }
}

/// One host resolution, owned by the caller.
///
/// Result accessors read `None`/empty until the request completes
/// (synchronously from `start`, or once `wait` resolves). A request
/// whose `cache_usage` is `StaleAllowedWhileRefreshing` additionally
/// exposes a stale intermediate result while pending. Dropping the
/// request cancels the resolution.
pub trait ResolveRequest {
    fn start(&mut self) -> StartOutcome;

    /// Resolves exactly once with the squashed completion result after
    /// `start` returned [`StartOutcome::Pending`]. May be re-awaited
    /// after completion; it then yields the stored result.
    fn wait(&mut self) -> LocalBoxFuture<'_, Result<(), ResolveError>>;

    /// The completed (or stale intermediate) result entry.
    fn result_entry(&self) -> Option<&CacheEntry>;

    /// Unsquashed error detail, including whether a failure came from a
    /// secure (DoH) transport.
    fn error_info(&self) -> ResolveErrorInfo;

    /// Staleness of the served entry, when it came from a stale-allowed
    /// cache read.
    fn stale_info(&self) -> Option<&Staleness>;

    /// Re-prioritizes the request; an attached job recomputes its
    /// aggregate priority.
    fn change_priority(&mut self, priority: RequestPriority);

    fn address_results(&self) -> Option<&[SocketAddr]> {
        self.result_entry().map(|entry| entry.addresses())
    }

    fn endpoint_results(&self) -> Option<Vec<EndpointResult>> {
        self.result_entry().map(crate::endpoint::endpoints_from_entry)
    }

    fn text_results(&self) -> Option<&[String]> {
        self.result_entry().map(|entry| entry.text_records())
    }

    fn hostname_results(&self) -> Option<&[(String, u16)]> {
        self.result_entry().map(|entry| entry.hostnames())
    }

    fn dns_alias_results(&self) -> Option<&BTreeSet<String>> {
        self.result_entry().map(|entry| entry.aliases())
    }
}

/// Receives the event stream of a [`ServiceEndpointRequest`].
pub trait ServiceEndpointDelegate {
    /// Invoked as DNS transactions complete with the endpoints assembled
    /// so far.
    fn on_service_endpoints_updated(&self, endpoints: &[EndpointResult]);
    /// Invoked exactly once with the final squashed result.
    fn on_service_endpoint_request_finished(&self, result: Result<(), ResolveError>);
}

/// A resolution which streams partial endpoint updates to a delegate
/// before finishing. Requires a scheme-bearing host identifier.
pub trait ServiceEndpointRequest {
    fn start(&mut self, delegate: Rc<dyn ServiceEndpointDelegate>) -> StartOutcome;
    fn endpoint_results(&self) -> Vec<EndpointResult>;
    fn dns_alias_results(&self) -> BTreeSet<String>;
    /// Whether the endpoints' connection metadata (ALPN, ECH) is final.
    fn endpoints_crypto_ready(&self) -> bool;
    fn error_info(&self) -> ResolveErrorInfo;
    fn change_priority(&mut self, priority: RequestPriority);
}

/// A resolver: the [`Manager`] itself, or a wrapper composed in front of
/// one.
pub trait HostResolver {
    fn create_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ResolveRequest>;

    fn create_service_endpoint_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ServiceEndpointRequest>;

    /// Fails requests from here on with `ContextShutDown` and releases
    /// background work. Existing pending requests complete with the same
    /// error.
    fn on_shutdown(&self);
}
