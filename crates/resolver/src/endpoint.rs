use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use host_cache::{AnonymizationKey, CacheEntry, HostKey, HttpsMetadata, ResolveError, ResolveSource};

use crate::error::ResolveErrorInfo;
use crate::job::Job;
use crate::manager::ManagerInner;
use crate::params::{RequestPriority, ResolveParameters};
use crate::request::{resolve_locally, LocalOutcome};
use crate::{ServiceEndpointDelegate, ServiceEndpointRequest, StartOutcome};

/// One connectable endpoint: an address set plus optional HTTPS-record
/// metadata (ALPN and friends). The metadata-free fallback endpoint
/// always sorts last.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointResult {
    pub addresses: Vec<SocketAddr>,
    pub metadata: Option<HttpsMetadata>,
}

/// Expands a result entry into endpoints: one per HTTPS-record metadata
/// in priority order, then the plain fallback endpoint.
pub(crate) fn endpoints_from_entry(entry: &CacheEntry) -> Vec<EndpointResult> {
    if entry.addresses().is_empty() {
        return Vec::new();
    }
    let mut metadata: Vec<&HttpsMetadata> = entry.metadata().iter().collect();
    metadata.sort_by_key(|m| m.priority);
    let mut endpoints: Vec<EndpointResult> = metadata
        .into_iter()
        .map(|m| EndpointResult {
            addresses: entry.addresses().to_vec(),
            metadata: Some(m.clone()),
        })
        .collect();
    endpoints.push(EndpointResult {
        addresses: entry.addresses().to_vec(),
        metadata: None,
    });
    endpoints
}

#[derive(Default)]
struct SinkState {
    endpoints: Vec<EndpointResult>,
    aliases: BTreeSet<String>,
    crypto_ready: bool,
    error_info: ResolveErrorInfo,
    finished: bool,
}

/// Shared between a service-endpoint request and its job: stores the
/// latest endpoint snapshot and forwards update/finish events to the
/// user's delegate.
pub(crate) struct EndpointSink {
    delegate: Rc<dyn ServiceEndpointDelegate>,
    state: RefCell<SinkState>,
}

impl EndpointSink {
    fn new(delegate: Rc<dyn ServiceEndpointDelegate>) -> Self {
        EndpointSink {
            delegate,
            state: RefCell::new(SinkState::default()),
        }
    }

    pub(crate) fn update(
        &self,
        endpoints: &[EndpointResult],
        aliases: &BTreeSet<String>,
        crypto_ready: bool,
    ) {
        {
            let mut state = self.state.borrow_mut();
            if state.finished {
                return;
            }
            state.endpoints = endpoints.to_vec();
            state.aliases = aliases.clone();
            state.crypto_ready = crypto_ready;
        }
        self.delegate.on_service_endpoints_updated(endpoints);
    }

    /// Final event: records the result and notifies the delegate once.
    pub(crate) fn complete(&self, entry: CacheEntry, secure_network_error: bool) {
        let result = {
            let mut state = self.state.borrow_mut();
            if state.finished {
                return;
            }
            state.finished = true;
            state.endpoints = endpoints_from_entry(&entry);
            state.aliases = entry.aliases().clone();
            state.crypto_ready = true;
            state.error_info = ResolveErrorInfo {
                error: entry.error(),
                is_secure_network_error: secure_network_error,
            };
            state.error_info.squashed()
        };
        self.delegate.on_service_endpoint_request_finished(result);
    }

    // A synchronous outcome: state is recorded but the delegate is not
    // called, matching the start contract.
    fn finish_quietly(&self, entry: &CacheEntry) {
        let mut state = self.state.borrow_mut();
        state.finished = true;
        state.endpoints = endpoints_from_entry(entry);
        state.aliases = entry.aliases().clone();
        state.crypto_ready = true;
        state.error_info = ResolveErrorInfo {
            error: entry.error(),
            is_secure_network_error: false,
        };
    }

    fn fail_quietly(&self, error: ResolveError) {
        let mut state = self.state.borrow_mut();
        state.finished = true;
        state.error_info = ResolveErrorInfo::from_error(error);
    }
}

struct EndpointInner {
    manager: Weak<ManagerInner>,
    host: HostKey,
    anonymization_key: AnonymizationKey,
    parameters: ResolveParameters,
    priority: Cell<RequestPriority>,
    sink: RefCell<Option<Rc<EndpointSink>>>,
    attached: RefCell<Option<(Weak<Job>, u64)>>,
}

impl EndpointInner {
    // Local phase, then job attachment. `sync` distinguishes the start
    // path (quiet finishes) from the post-probe path (delegate fires).
    fn attach(self: &Rc<Self>, ipv6_reachable: bool, sync: bool) -> StartOutcome {
        let sink = self
            .sink
            .borrow()
            .clone()
            .expect("start installed the sink");
        let Some(manager) = self.manager.upgrade() else {
            return self.finish(&sink, Err(ResolveError::ContextShutDown), sync);
        };
        match resolve_locally(
            &manager,
            &self.host,
            &self.anonymization_key,
            &self.parameters,
            ipv6_reachable,
        ) {
            LocalOutcome::Finished { entry, .. } => {
                let entry = entry.with_default_port(self.host.port());
                self.finish(&sink, Ok(entry), sync)
            }
            LocalOutcome::Fail(error) => self.finish(&sink, Err(error), sync),
            LocalOutcome::StartJob { key, tasks, .. } => {
                let (job, waiter_id) = manager.attach_endpoint_job(
                    key,
                    tasks,
                    self.priority.get(),
                    sink,
                );
                *self.attached.borrow_mut() = Some((job, waiter_id));
                StartOutcome::Pending
            }
        }
    }

    fn finish(
        &self,
        sink: &Rc<EndpointSink>,
        result: Result<CacheEntry, ResolveError>,
        sync: bool,
    ) -> StartOutcome {
        match (result, sync) {
            (Ok(entry), true) => {
                sink.finish_quietly(&entry);
                StartOutcome::Finished(sink.state.borrow().error_info.squashed())
            }
            (Err(error), true) => {
                sink.fail_quietly(error);
                StartOutcome::Finished(Err(error.squash()))
            }
            (Ok(entry), false) => {
                sink.complete(entry, false);
                StartOutcome::Pending
            }
            (Err(error), false) => {
                sink.complete(CacheEntry::for_error(error, None), false);
                StartOutcome::Pending
            }
        }
    }
}

/// Streams partial endpoint updates to a delegate as DNS transactions
/// complete, then a single finished event. Requires a scheme-bearing
/// host.
pub(crate) struct ServiceEndpointRequestImpl {
    inner: Rc<EndpointInner>,
    started: bool,
}

impl ServiceEndpointRequestImpl {
    pub(crate) fn new(
        manager: Weak<ManagerInner>,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Self {
        let priority = parameters.initial_priority;
        ServiceEndpointRequestImpl {
            inner: Rc::new(EndpointInner {
                manager,
                host,
                anonymization_key,
                parameters,
                priority: Cell::new(priority),
                sink: RefCell::new(None),
                attached: RefCell::new(None),
            }),
            started: false,
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&SinkState) -> T) -> Option<T> {
        let sink = self.inner.sink.borrow();
        sink.as_ref().map(|sink| f(&sink.state.borrow()))
    }
}

impl ServiceEndpointRequest for ServiceEndpointRequestImpl {
    fn start(&mut self, delegate: Rc<dyn ServiceEndpointDelegate>) -> StartOutcome {
        assert!(!self.started, "request started twice");
        self.started = true;
        let sink = Rc::new(EndpointSink::new(delegate));
        *self.inner.sink.borrow_mut() = Some(sink.clone());

        let Some(manager) = self.inner.manager.upgrade() else {
            return self
                .inner
                .finish(&sink, Err(ResolveError::ContextShutDown), true);
        };
        if manager.shut_down.get() {
            return self
                .inner
                .finish(&sink, Err(ResolveError::ContextShutDown), true);
        }

        let needs_probe = self.inner.parameters.query_type.is_none();
        if !needs_probe {
            return self.inner.attach(true, true);
        }
        match manager.cached_ipv6_reachability() {
            Some(reachable) => self.inner.attach(reachable, true),
            None if self.inner.parameters.source == ResolveSource::LocalOnly => self
                .inner
                .finish(&sink, Err(ResolveError::NameNotResolved), true),
            None => {
                let weak = Rc::downgrade(&self.inner);
                let probe = manager.collaborators.ipv6_probe.clone();
                tokio::task::spawn_local(async move {
                    let reachable = probe.probe().await;
                    // The request may have been dropped while probing.
                    let Some(inner) = weak.upgrade() else { return };
                    let _ = inner.attach(reachable, false);
                });
                StartOutcome::Pending
            }
        }
    }

    fn endpoint_results(&self) -> Vec<EndpointResult> {
        self.with_state(|state| state.endpoints.clone())
            .unwrap_or_default()
    }

    fn dns_alias_results(&self) -> BTreeSet<String> {
        self.with_state(|state| state.aliases.clone())
            .unwrap_or_default()
    }

    fn endpoints_crypto_ready(&self) -> bool {
        self.with_state(|state| state.crypto_ready).unwrap_or(false)
    }

    fn error_info(&self) -> ResolveErrorInfo {
        self.with_state(|state| state.error_info).unwrap_or_default()
    }

    fn change_priority(&mut self, priority: RequestPriority) {
        let old_priority = self.inner.priority.get();
        self.inner.priority.set(priority);
        if let Some((job, waiter_id)) = &*self.inner.attached.borrow() {
            if let Some(job) = job.upgrade() {
                job.change_request_priority(*waiter_id, old_priority, priority);
            }
        }
    }
}

impl Drop for ServiceEndpointRequestImpl {
    fn drop(&mut self) {
        if let Some((job, waiter_id)) = &*self.inner.attached.borrow() {
            if let Some(job) = job.upgrade() {
                job.detach_request(*waiter_id, self.inner.priority.get());
            }
        }
    }
}
