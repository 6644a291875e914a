use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::rc::Rc;

use tokio::sync::oneshot;

use dispatch::{Limits, PrioritizedDispatcher};
use host_cache::{
    AnonymizationKey, CacheKey, HostCache, HostKey, KeyFlags, QueryTypeSet, ResolveSource,
    SecureDnsMode,
};

use crate::collab::Collaborators;
use crate::config::{DnsConfigOverrides, ManagerOptions};
use crate::endpoint::{EndpointSink, ServiceEndpointRequestImpl};
use crate::job::{Job, JobOutcome};
use crate::params::{RequestPriority, ResolveParameters, NUM_PRIORITIES};
use crate::request::ResolveHostRequestImpl;
use crate::tasks::TaskType;
use crate::{HostResolver, ResolveRequest, ServiceEndpointRequest};

/// Identity of a resolution coalescing group: requests whose keys compare
/// equal share one [`Job`] and one set of external transactions.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct JobKey {
    pub host: HostKey,
    pub anonymization_key: AnonymizationKey,
    pub query_types: QueryTypeSet,
    pub flags: KeyFlags,
    pub source: ResolveSource,
    pub secure_dns_mode: SecureDnsMode,
}

impl JobKey {
    pub(crate) fn to_cache_key(&self, secure: bool) -> CacheKey {
        CacheKey {
            host: self.host.clone(),
            query_types: self.query_types,
            flags: self.flags,
            source: self.source,
            secure_dns_mode: self.secure_dns_mode,
            anonymization_key: self.anonymization_key.clone(),
            secure,
        }
    }
}

pub(crate) struct ManagerInner {
    pub(crate) options: ManagerOptions,
    pub(crate) overrides: RefCell<DnsConfigOverrides>,
    pub(crate) dispatcher: PrioritizedDispatcher<Rc<Job>>,
    pub(crate) jobs: RefCell<BTreeMap<JobKey, Rc<Job>>>,
    pub(crate) cache: RefCell<HostCache>,
    pub(crate) collaborators: Collaborators,
    pub(crate) shut_down: Cell<bool>,
}

impl ManagerInner {
    pub(crate) fn secure_dns_mode(&self) -> SecureDnsMode {
        self.overrides
            .borrow()
            .secure_dns_mode
            .unwrap_or_else(|| self.options.effective_secure_dns_mode())
    }

    pub(crate) fn doh_available(&self) -> bool {
        self.overrides.borrow().doh_available.unwrap_or(false)
    }

    pub(crate) fn hosts_lookup(&self, hostname: &str) -> Option<Vec<IpAddr>> {
        self.overrides
            .borrow()
            .hosts
            .as_ref()
            .and_then(|hosts| hosts.get(hostname).cloned())
    }

    pub(crate) fn doh_preset_lookup(&self, hostname: &str) -> Option<Vec<IpAddr>> {
        self.overrides
            .borrow()
            .doh_preset_addresses
            .as_ref()
            .and_then(|presets| presets.get(hostname).cloned())
    }

    /// The cached IPv6-reachability verdict, with the `check_ipv6_on_wifi`
    /// carve-out applied: on Wi-Fi with probing disabled, reachability is
    /// assumed rather than measured.
    pub(crate) fn cached_ipv6_reachability(&self) -> Option<bool> {
        if !self.options.check_ipv6_on_wifi && self.collaborators.ipv6_probe.on_wifi() {
            return Some(true);
        }
        self.collaborators.ipv6_probe.cached()
    }

    /// The effective partition for a request: collapses to the shared
    /// empty partition when partitioning is globally disabled.
    pub(crate) fn effective_partition(&self, key: AnonymizationKey) -> AnonymizationKey {
        if self.options.network_partitioning_enabled {
            key
        } else {
            AnonymizationKey::empty()
        }
    }

    /// Attaches a waiter for `key` to its live job, creating (and
    /// starting) the job if none exists. Returns the job, the waiter id,
    /// and the completion channel.
    pub(crate) fn attach_job(
        self: &Rc<Self>,
        key: JobKey,
        tasks: VecDeque<TaskType>,
        priority: RequestPriority,
        is_speculative: bool,
    ) -> (std::rc::Weak<Job>, u64, oneshot::Receiver<JobOutcome>) {
        let (job, created) = self.job_for_key(key, tasks);
        let (waiter_id, receiver) = job.attach_request(priority, is_speculative);
        if created {
            job.run_next_task();
            self.check_queue_overflow();
        }
        (Rc::downgrade(&job), waiter_id, receiver)
    }

    /// Endpoint-request flavor of [`attach_job`](Self::attach_job).
    pub(crate) fn attach_endpoint_job(
        self: &Rc<Self>,
        key: JobKey,
        tasks: VecDeque<TaskType>,
        priority: RequestPriority,
        sink: Rc<EndpointSink>,
    ) -> (std::rc::Weak<Job>, u64) {
        let (job, created) = self.job_for_key(key, tasks);
        let waiter_id = job.attach_endpoint_request(priority, sink);
        if created {
            job.run_next_task();
            self.check_queue_overflow();
        }
        (Rc::downgrade(&job), waiter_id)
    }

    fn job_for_key(self: &Rc<Self>, key: JobKey, tasks: VecDeque<TaskType>) -> (Rc<Job>, bool) {
        let mut jobs = self.jobs.borrow_mut();
        if let Some(job) = jobs.get(&key) {
            tracing::debug!(host = %key.host, "coalescing request onto live job");
            return (job.clone(), false);
        }
        let job = Job::create(
            self,
            key.clone(),
            tasks,
            self.options.https_svcb_options.clone(),
        );
        jobs.insert(key, job.clone());
        (job, true)
    }

    pub(crate) fn remove_job(&self, key: &JobKey) {
        self.jobs.borrow_mut().remove(key);
    }

    // Enforces the global queued-job ceiling by evicting the oldest
    // lowest-priority queued jobs; each completes asynchronously with
    // `QueueTooLarge`.
    fn check_queue_overflow(&self) {
        let limit = self.options.effective_max_queued_jobs();
        while self.dispatcher.num_queued_jobs() > limit {
            let Some(evicted) = self.dispatcher.evict_oldest_lowest() else {
                break;
            };
            tracing::warn!(host = %evicted.key().host, "evicting job, queue over capacity");
            evicted.on_evicted();
        }
    }
}

/// The resolution core: owns the job map, the dispatcher, and the host
/// cache, and turns requests into coalesced jobs.
///
/// Everything runs on a single-threaded executor; spawned work uses
/// `tokio::task::spawn_local`, so the manager must live inside a
/// `tokio::task::LocalSet` (or current-thread runtime driving one).
#[derive(Clone)]
pub struct Manager {
    pub(crate) inner: Rc<ManagerInner>,
}

impl Manager {
    pub fn new(options: ManagerOptions, collaborators: Collaborators) -> Manager {
        let limits = Limits::new(NUM_PRIORITIES, options.max_concurrent_resolves);
        let cache = HostCache::new(options.effective_cache_entries());
        let overrides = options.dns_config_overrides.clone();
        Manager {
            inner: Rc::new(ManagerInner {
                options,
                overrides: RefCell::new(overrides),
                dispatcher: PrioritizedDispatcher::new(&limits),
                jobs: RefCell::new(BTreeMap::new()),
                cache: RefCell::new(cache),
                collaborators,
                shut_down: Cell::new(false),
            }),
        }
    }

    /// Number of live (queued or running) jobs.
    pub fn num_jobs(&self) -> usize {
        self.inner.jobs.borrow().len()
    }

    pub fn num_running_dispatcher_jobs(&self) -> usize {
        self.inner.dispatcher.num_running_jobs()
    }

    pub fn num_queued_dispatcher_jobs(&self) -> usize {
        self.inner.dispatcher.num_queued_jobs()
    }

    /// Direct access to the owned host cache, e.g. for persistence and
    /// tests. Single-threaded; must not be held across an await.
    pub fn with_cache<T>(&self, f: impl FnOnce(&mut HostCache) -> T) -> T {
        f(&mut self.inner.cache.borrow_mut())
    }

    /// Aborts every job not bound to a specific network with
    /// `NetworkChanged` and marks all cache entries stale.
    pub fn on_network_change(&self) {
        self.inner.cache.borrow_mut().on_network_change();
        let jobs: Vec<Rc<Job>> = self.inner.jobs.borrow().values().cloned().collect();
        tracing::debug!(aborted = jobs.len(), "network changed; aborting live jobs");
        for job in jobs {
            job.abort_network_changed();
        }
    }

    /// Applies new DNS configuration. Insecure DNS tasks in flight are
    /// aborted: each affected job first tries the HOSTS map, then its
    /// remaining fallback tasks.
    pub fn on_dns_config_changed(&self, overrides: DnsConfigOverrides) {
        *self.inner.overrides.borrow_mut() = overrides;
        let jobs: Vec<Rc<Job>> = self.inner.jobs.borrow().values().cloned().collect();
        for job in jobs {
            job.abort_insecure_dns_task();
        }
    }
}

impl HostResolver for Manager {
    fn create_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ResolveRequest> {
        let anonymization_key = self.inner.effective_partition(anonymization_key);
        Box::new(ResolveHostRequestImpl::new(
            Rc::downgrade(&self.inner),
            host,
            anonymization_key,
            parameters,
        ))
    }

    fn create_service_endpoint_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ServiceEndpointRequest> {
        assert!(
            host.scheme().is_some(),
            "service endpoint requests require a scheme-bearing host"
        );
        let anonymization_key = self.inner.effective_partition(anonymization_key);
        Box::new(ServiceEndpointRequestImpl::new(
            Rc::downgrade(&self.inner),
            host,
            anonymization_key,
            parameters,
        ))
    }

    /// Completes every live job with `ContextShutDown`; subsequent
    /// requests fail immediately with the same error.
    fn on_shutdown(&self) {
        self.inner.shut_down.set(true);
        let jobs: Vec<Rc<Job>> = self.inner.jobs.borrow().values().cloned().collect();
        for job in jobs {
            job.abort_shut_down();
        }
    }
}
