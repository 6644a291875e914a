use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use host_cache::{AnonymizationKey, CacheEntry, HostKey, ResolveError, ResolveSource, Staleness};

use crate::error::ResolveErrorInfo;
use crate::params::{CacheUsage, RequestPriority, ResolveParameters};
use crate::{HostResolver, ResolveRequest, ServiceEndpointRequest, StartOutcome};

/// When a stale result can be served in place of waiting for the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaleOptions {
    /// How long to wait for fresh data before serving stale data.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// How long past expiry stale data stays usable; `None` means
    /// indefinitely.
    #[serde(with = "humantime_serde::option")]
    pub max_expired_time: Option<Duration>,
    /// Whether stale data recorded on a previous network is usable.
    pub allow_other_network: bool,
    /// Maximum times one entry may be served stale; zero means no limit.
    pub max_stale_uses: u32,
    /// Serve stale data when the network answers `NameNotResolved`.
    pub use_stale_on_name_not_resolved: bool,
}

impl Default for StaleOptions {
    fn default() -> Self {
        StaleOptions {
            delay: Duration::ZERO,
            max_expired_time: Some(Duration::from_secs(6 * 60 * 60)),
            allow_other_network: true,
            max_stale_uses: 0,
            use_stale_on_name_not_resolved: false,
        }
    }
}

impl StaleOptions {
    fn usable(&self, staleness: &Staleness) -> bool {
        if let Some(max_expired) = self.max_expired_time {
            if !max_expired.is_zero() {
                if let Some(expired_by) = staleness.expired_by {
                    if expired_by > max_expired {
                        return false;
                    }
                }
            }
        }
        if self.max_stale_uses > 0 && staleness.stale_hits > self.max_stale_uses {
            return false;
        }
        if !self.allow_other_network && staleness.network_changes > 0 {
            return false;
        }
        true
    }
}

struct StaleShared {
    inner: Box<dyn HostResolver>,
    options: StaleOptions,
    // Requests whose results were discarded in favor of stale data but
    // which keep running to backfill the cache. Erased when they finish;
    // dropped wholesale with the resolver.
    detached: RefCell<HashMap<u64, JoinHandle<()>>>,
    next_detached_id: Cell<u64>,
    shut_down: Cell<bool>,
}

impl StaleShared {
    fn detach(self: &Rc<Self>, mut request: Box<dyn ResolveRequest>) {
        if self.shut_down.get() {
            return;
        }
        let id = self.next_detached_id.get();
        self.next_detached_id.set(id + 1);
        let weak = Rc::downgrade(self);
        let join = tokio::task::spawn_local(async move {
            let _ = request.wait().await;
            if let Some(shared) = weak.upgrade() {
                shared.detached.borrow_mut().remove(&id);
            }
        });
        self.detached.borrow_mut().insert(id, join);
    }

    fn drop_detached(&self) {
        for (_, join) in self.detached.borrow_mut().drain() {
            join.abort();
        }
    }
}

impl Drop for StaleShared {
    fn drop(&mut self) {
        self.drop_detached();
    }
}

/// Wraps an inner resolver and impatiently serves stale cached data
/// after [`StaleOptions::delay`], letting the real lookup finish in the
/// background to repopulate the cache. Reduces latency at the cost of
/// accuracy.
pub struct StaleResolver {
    shared: Rc<StaleShared>,
}

impl StaleResolver {
    pub fn new(inner: Box<dyn HostResolver>, options: StaleOptions) -> Self {
        StaleResolver {
            shared: Rc::new(StaleShared {
                inner,
                options,
                detached: RefCell::new(HashMap::new()),
                next_detached_id: Cell::new(0),
                shut_down: Cell::new(false),
            }),
        }
    }

    pub fn num_detached_requests(&self) -> usize {
        self.shared.detached.borrow().len()
    }
}

impl HostResolver for StaleResolver {
    fn create_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ResolveRequest> {
        Box::new(StaleRequest {
            resolver: Rc::downgrade(&self.shared),
            host,
            anonymization_key,
            parameters,
            state: StaleState::NotStarted,
        })
    }

    fn create_service_endpoint_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ServiceEndpointRequest> {
        // Endpoint streams have their own intermediate-result mechanism;
        // stale serving does not apply.
        self.shared
            .inner
            .create_service_endpoint_request(host, anonymization_key, parameters)
    }

    fn on_shutdown(&self) {
        self.shared.shut_down.set(true);
        self.shared.drop_detached();
        self.shared.inner.on_shutdown();
    }
}

enum StaleState {
    NotStarted,
    Waiting {
        /// Probe result holding usable stale data, when there is any.
        cache_request: Option<Box<dyn ResolveRequest>>,
        network_request: Option<Box<dyn ResolveRequest>>,
        /// When to give up on the network and serve stale data.
        deadline: Option<Instant>,
    },
    /// Serving results through whichever inner request won.
    Finished(Box<dyn ResolveRequest>),
    FinishedError(ResolveErrorInfo),
}

struct StaleRequest {
    resolver: Weak<StaleShared>,
    host: HostKey,
    anonymization_key: AnonymizationKey,
    parameters: ResolveParameters,
    state: StaleState,
}

impl StaleRequest {
    fn finish_error(&mut self, error: ResolveError) -> StartOutcome {
        self.state = StaleState::FinishedError(ResolveErrorInfo::from_error(error));
        StartOutcome::Finished(Err(error.squash()))
    }

    async fn wait_inner(&mut self) -> Result<(), ResolveError> {
        loop {
            match &mut self.state {
                StaleState::NotStarted => panic!("wait called before start"),
                StaleState::Finished(request) => return request.error_info().squashed(),
                StaleState::FinishedError(info) => return info.squashed(),
                StaleState::Waiting {
                    cache_request,
                    network_request,
                    deadline,
                } => {
                    let network = network_request
                        .as_mut()
                        .expect("waiting implies a live network request");
                    let serve_stale = match *deadline {
                        Some(deadline) => {
                            tokio::select! {
                                _ = network.wait() => false,
                                _ = tokio::time::sleep_until(deadline) => true,
                            }
                        }
                        None => {
                            let _ = network.wait().await;
                            false
                        }
                    };

                    if serve_stale {
                        // Let the network request run on in the background
                        // to backfill the cache.
                        let network = network_request.take().expect("checked above");
                        if let Some(resolver) = self.resolver.upgrade() {
                            tracing::debug!(host = %self.host, "serving stale result after delay");
                            resolver.detach(network);
                        }
                        let cache = cache_request.take().expect("stale data was usable");
                        self.state = StaleState::Finished(cache);
                        continue;
                    }

                    let network = network_request.take().expect("checked above");
                    let stale_instead = self
                        .resolver
                        .upgrade()
                        .map_or(false, |resolver| resolver.options.use_stale_on_name_not_resolved)
                        && network.error_info().error == Some(ResolveError::NameNotResolved)
                        && cache_request.is_some();
                    if stale_instead {
                        tracing::debug!(
                            host = %self.host,
                            "network said name-not-resolved; serving stale result instead"
                        );
                        let cache = cache_request.take().expect("checked above");
                        self.state = StaleState::Finished(cache);
                    } else {
                        self.state = StaleState::Finished(network);
                    }
                }
            }
        }
    }
}

impl ResolveRequest for StaleRequest {
    fn start(&mut self) -> StartOutcome {
        assert!(
            matches!(self.state, StaleState::NotStarted),
            "request started twice"
        );
        let Some(resolver) = self.resolver.upgrade() else {
            return self.finish_error(ResolveError::ContextShutDown);
        };
        if resolver.shut_down.get() {
            return self.finish_error(ResolveError::ContextShutDown);
        }

        // Probe the cache through a local-only, stale-allowed request.
        let mut probe_parameters = self.parameters.clone();
        probe_parameters.source = ResolveSource::LocalOnly;
        probe_parameters.cache_usage = CacheUsage::StaleAllowed;
        let mut cache_request = resolver.inner.create_request(
            self.host.clone(),
            self.anonymization_key.clone(),
            probe_parameters,
        );
        let probe = cache_request.start();
        debug_assert!(
            !matches!(probe, StartOutcome::Pending),
            "local-only probes complete synchronously"
        );
        let cache_error = cache_request.error_info().error;
        let staleness = cache_request.stale_info().cloned();

        let have_cache_data = cache_error != Some(ResolveError::CacheMiss);
        let is_fresh = staleness.as_ref().map_or(true, |info| !info.is_stale());
        if have_cache_data && is_fresh {
            // Fresh hit or literal; serve synchronously.
            let result = cache_request.error_info().squashed();
            self.state = StaleState::Finished(cache_request);
            return StartOutcome::Finished(result);
        }
        if have_cache_data && self.parameters.cache_usage == CacheUsage::StaleAllowed {
            // The caller asked for stale data; no need to be impatient.
            let result = cache_request.error_info().squashed();
            self.state = StaleState::Finished(cache_request);
            return StartOutcome::Finished(result);
        }

        let usable = cache_error.is_none()
            && staleness
                .as_ref()
                .map_or(false, |info| resolver.options.usable(info));
        let (cache_request, deadline) = if usable {
            (
                Some(cache_request),
                Some(Instant::now() + resolver.options.delay),
            )
        } else {
            (None, None)
        };

        // The real lookup, bypassing cache reads.
        let mut network_parameters = self.parameters.clone();
        network_parameters.cache_usage = CacheUsage::Disallowed;
        let mut network_request = resolver.inner.create_request(
            self.host.clone(),
            self.anonymization_key.clone(),
            network_parameters,
        );
        match network_request.start() {
            StartOutcome::Finished(result) => {
                self.state = StaleState::Finished(network_request);
                StartOutcome::Finished(result)
            }
            StartOutcome::Pending => {
                self.state = StaleState::Waiting {
                    cache_request,
                    network_request: Some(network_request),
                    deadline,
                };
                StartOutcome::Pending
            }
        }
    }

    fn wait(&mut self) -> LocalBoxFuture<'_, Result<(), ResolveError>> {
        Box::pin(self.wait_inner())
    }

    fn result_entry(&self) -> Option<&CacheEntry> {
        match &self.state {
            StaleState::Finished(request) => request.result_entry(),
            _ => None,
        }
    }

    fn error_info(&self) -> ResolveErrorInfo {
        match &self.state {
            StaleState::Finished(request) => request.error_info(),
            StaleState::FinishedError(info) => *info,
            _ => ResolveErrorInfo::ok(),
        }
    }

    fn stale_info(&self) -> Option<&Staleness> {
        match &self.state {
            StaleState::Finished(request) => request.stale_info(),
            _ => None,
        }
    }

    fn change_priority(&mut self, priority: RequestPriority) {
        match &mut self.state {
            StaleState::Waiting {
                cache_request,
                network_request,
                ..
            } => {
                if let Some(network) = network_request {
                    network.change_priority(priority);
                } else if let Some(cache) = cache_request {
                    cache.change_priority(priority);
                }
            }
            StaleState::Finished(request) => request.change_priority(priority),
            _ => (),
        }
    }
}
