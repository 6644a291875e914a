use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use host_cache::{CacheEntry, EntrySource, QueryType, QueryTypeSet, ResolveError, Staleness};

use crate::config::HttpsSvcbOptions;
use crate::dns_task::{self, DnsTaskConfig, DnsTaskFailure};
use crate::endpoint::{endpoints_from_entry, EndpointSink};
use crate::manager::{JobKey, ManagerInner};
use crate::params::{RequestPriority, MINIMUM_PRIORITY, NUM_PRIORITIES};
use crate::tasks::TaskType;

/// Any DNS, system, or mDNS result carrying this address is rewritten to
/// [`ResolveError::IcannNameCollision`]; the literal is never surfaced.
/// IP-literal lookups are exempt, including the NAT64 literal fallback.
const ICANN_COLLISION_ADDRESS: Ipv4Addr = Ipv4Addr::new(127, 0, 53, 53);

/// Applied to successful results whose source reported no TTL.
const DEFAULT_SUCCESS_TTL: Duration = Duration::from_secs(60);

/// What a completed job hands to each attached request.
#[derive(Clone, Debug)]
pub(crate) struct JobOutcome {
    pub entry: CacheEntry,
    pub staleness: Option<Staleness>,
    pub secure_network_error: bool,
}

// Tracks the highest priority across attached requests in O(1) reads and
// O(num_priorities) updates.
struct PriorityTracker {
    counts: [usize; NUM_PRIORITIES],
    total: usize,
    highest: RequestPriority,
}

impl PriorityTracker {
    fn new(initial: RequestPriority) -> Self {
        PriorityTracker {
            counts: [0; NUM_PRIORITIES],
            total: 0,
            highest: initial,
        }
    }

    fn highest(&self) -> RequestPriority {
        self.highest
    }

    fn total(&self) -> usize {
        self.total
    }

    fn add(&mut self, priority: RequestPriority) {
        self.total += 1;
        self.counts[priority as usize] += 1;
        if priority > self.highest {
            self.highest = priority;
        }
    }

    fn remove(&mut self, priority: RequestPriority) {
        assert!(self.total > 0 && self.counts[priority as usize] > 0);
        self.total -= 1;
        self.counts[priority as usize] -= 1;
        let mut index = self.highest as usize;
        while index > MINIMUM_PRIORITY as usize && self.counts[index] == 0 {
            index -= 1;
        }
        self.highest = RequestPriority::from_index(index);
    }
}

struct Waiter {
    id: u64,
    priority: RequestPriority,
    sender: oneshot::Sender<JobOutcome>,
}

struct EndpointWaiter {
    id: u64,
    priority: RequestPriority,
    sink: Rc<EndpointSink>,
}

enum TaskKind {
    Dns { secure: bool },
    System,
    Mdns,
    Nat64,
}

struct RunningTask {
    kind: TaskKind,
    join: JoinHandle<()>,
}

struct CompletionResult {
    entry: CacheEntry,
    /// Whether the failing task ran over secure transport.
    secure: bool,
}

/// Per-key coordinator for one resolution. Aggregates every request with
/// the same [`JobKey`], consumes its task sequence in order, and
/// completes all attached requests with the winning result.
///
/// A job exists iff it is registered in the manager's key-to-job map or
/// is running its final fan-out; completion removes it from the map
/// before any waiter observes the result, so requests arriving during
/// fan-out start a fresh job.
pub(crate) struct Job {
    manager: Weak<ManagerInner>,
    self_weak: RefCell<Weak<Job>>,
    key: JobKey,
    https_svcb_options: HttpsSvcbOptions,

    tasks: RefCell<VecDeque<TaskType>>,
    priority_tracker: RefCell<PriorityTracker>,
    waiters: RefCell<Vec<Waiter>>,
    endpoint_waiters: RefCell<Vec<EndpointWaiter>>,
    next_waiter_id: Cell<u64>,

    handle: Cell<Option<dispatch::Handle>>,
    dispatched: Cell<bool>,
    running: Cell<bool>,
    num_occupied_slots: Cell<u32>,

    current_task: RefCell<Option<RunningTask>>,
    // Grants the second dispatcher slot to a running insecure DNS task.
    dns_extra_slot: RefCell<Option<oneshot::Sender<()>>>,

    completion_results: RefCell<Vec<CompletionResult>>,
    completed: Cell<bool>,
}

impl Job {
    pub(crate) fn create(
        manager: &Rc<ManagerInner>,
        key: JobKey,
        tasks: VecDeque<TaskType>,
        https_svcb_options: HttpsSvcbOptions,
    ) -> Rc<Job> {
        let job = Rc::new(Job {
            manager: Rc::downgrade(manager),
            self_weak: RefCell::new(Weak::new()),
            key,
            https_svcb_options,
            tasks: RefCell::new(tasks),
            priority_tracker: RefCell::new(PriorityTracker::new(MINIMUM_PRIORITY)),
            waiters: RefCell::new(Vec::new()),
            endpoint_waiters: RefCell::new(Vec::new()),
            next_waiter_id: Cell::new(0),
            handle: Cell::new(None),
            dispatched: Cell::new(false),
            running: Cell::new(false),
            num_occupied_slots: Cell::new(0),
            current_task: RefCell::new(None),
            dns_extra_slot: RefCell::new(None),
            completion_results: RefCell::new(Vec::new()),
            completed: Cell::new(false),
        });
        *job.self_weak.borrow_mut() = Rc::downgrade(&job);
        tracing::debug!(host = %job.key.host, "job created");
        job
    }

    pub(crate) fn key(&self) -> &JobKey {
        &self.key
    }

    fn self_rc(&self) -> Rc<Job> {
        self.self_weak
            .borrow()
            .upgrade()
            .expect("job is alive while referenced")
    }

    // ---- request attachment ----

    pub(crate) fn attach_request(
        &self,
        priority: RequestPriority,
        _is_speculative: bool,
    ) -> (u64, oneshot::Receiver<JobOutcome>) {
        let id = self.next_waiter_id.get();
        self.next_waiter_id.set(id + 1);
        let (sender, receiver) = oneshot::channel();
        self.waiters.borrow_mut().push(Waiter {
            id,
            priority,
            sender,
        });
        self.priority_tracker.borrow_mut().add(priority);
        self.update_dispatcher_priority();
        (id, receiver)
    }

    pub(crate) fn attach_endpoint_request(
        &self,
        priority: RequestPriority,
        sink: Rc<EndpointSink>,
    ) -> u64 {
        let id = self.next_waiter_id.get();
        self.next_waiter_id.set(id + 1);
        self.endpoint_waiters.borrow_mut().push(EndpointWaiter {
            id,
            priority,
            sink,
        });
        self.priority_tracker.borrow_mut().add(priority);
        self.update_dispatcher_priority();
        id
    }

    /// Detaches a dropped request. The request's callback never fires; if
    /// it was the last one attached, the job cancels without completing.
    pub(crate) fn detach_request(&self, id: u64, priority: RequestPriority) {
        if self.completed.get() {
            return;
        }
        self.waiters.borrow_mut().retain(|waiter| waiter.id != id);
        self.endpoint_waiters
            .borrow_mut()
            .retain(|waiter| waiter.id != id);
        self.priority_tracker.borrow_mut().remove(priority);
        if self.priority_tracker.borrow().total() == 0 {
            self.cancel();
        } else {
            self.update_dispatcher_priority();
        }
    }

    pub(crate) fn change_request_priority(
        &self,
        id: u64,
        old_priority: RequestPriority,
        new_priority: RequestPriority,
    ) {
        if self.completed.get() || old_priority == new_priority {
            return;
        }
        for waiter in self.waiters.borrow_mut().iter_mut() {
            if waiter.id == id {
                waiter.priority = new_priority;
            }
        }
        for waiter in self.endpoint_waiters.borrow_mut().iter_mut() {
            if waiter.id == id {
                waiter.priority = new_priority;
            }
        }
        let mut tracker = self.priority_tracker.borrow_mut();
        tracker.remove(old_priority);
        tracker.add(new_priority);
        drop(tracker);
        self.update_dispatcher_priority();
    }

    pub(crate) fn priority(&self) -> RequestPriority {
        self.priority_tracker.borrow().highest()
    }

    fn update_dispatcher_priority(&self) {
        let Some(handle) = self.handle.get() else {
            return;
        };
        let priority = self.priority().as_dispatch();
        if handle.priority() == priority {
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        self.handle
            .set(manager.dispatcher.change_priority(handle, priority));
    }

    // ---- task sequencing ----

    /// Starts the next task; registers with the dispatcher first when the
    /// task requires a slot and the job has none yet. An exhausted task
    /// list completes the job with the accumulated failure.
    pub(crate) fn run_next_task(&self) {
        if self.completed.get() {
            return;
        }
        let Some(&next) = self.tasks.borrow().front() else {
            self.complete_with_accumulated_failure();
            return;
        };
        if next.needs_dispatch_slot() && !self.dispatched.get() {
            self.dispatched.set(true);
            self.schedule(false);
            return;
        }
        let task = self
            .tasks
            .borrow_mut()
            .pop_front()
            .expect("task list is non-empty");
        self.start_task(task);
    }

    fn schedule(&self, at_head: bool) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let priority = self.priority().as_dispatch();
        let handle = if at_head {
            manager.dispatcher.add_at_head(self.self_rc(), priority)
        } else {
            manager.dispatcher.add(self.self_rc(), priority)
        };
        if let Some(handle) = handle {
            tracing::debug!(host = %self.key.host, "job queued behind dispatcher limits");
            self.handle.set(Some(handle));
        }
    }

    fn start_task(&self, task: TaskType) {
        match task {
            TaskType::InsecureCacheLookup => self.insecure_cache_lookup(),
            TaskType::Hosts => {
                if !self.serve_from_hosts() {
                    self.run_next_task();
                }
            }
            // Request-phase tasks have already been consumed; skip any
            // that leaked through.
            TaskType::SecureCacheLookup | TaskType::CacheLookup | TaskType::ConfigPreset => {
                self.run_next_task()
            }
            TaskType::Dns => self.start_dns_task(false),
            TaskType::SecureDns => self.start_dns_task(true),
            TaskType::System => self.start_system_task(),
            TaskType::Mdns => self.start_mdns_task(),
            TaskType::Nat64 => self.start_nat64_task(),
        }
    }

    fn insecure_cache_lookup(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let key = self.key.to_cache_key(false);
        let hit = manager
            .cache
            .borrow_mut()
            .lookup(&key, Instant::now())
            .cloned();
        match hit {
            Some(entry) => {
                tracing::debug!(host = %self.key.host, "mid-job insecure cache hit");
                self.post_complete_without_cache(entry);
            }
            None => self.run_next_task(),
        }
    }

    /// Serves the job from the HOSTS map if its hostname is present.
    /// Returns whether the job completed.
    fn serve_from_hosts(&self) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let Some(addresses) = manager.hosts_lookup(self.key.host.hostname()) else {
            return false;
        };
        let addresses = filter_addresses_for_types(&addresses, self.key.query_types);
        if addresses.is_empty() {
            return false;
        }
        let entry = CacheEntry::for_success(addresses, EntrySource::Hosts, None);
        self.post_complete_without_cache(entry);
        true
    }

    // Completions never run synchronously from inside task starts; they
    // are posted back through the executor.
    fn post_complete_without_cache(&self, entry: CacheEntry) {
        let job = self.self_rc();
        tokio::task::spawn_local(async move {
            job.complete(entry, None, false, false, false);
        });
    }

    fn start_dns_task(&self, secure: bool) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let multi_transaction = self.key.query_types.len() > 1;
        let extra_slot = if !secure && multi_transaction {
            let (grant, granted) = oneshot::channel();
            *self.dns_extra_slot.borrow_mut() = Some(grant);
            Some(granted)
        } else {
            None
        };
        let request_extra_slot = extra_slot.is_some();

        let config = DnsTaskConfig {
            hostname: self.key.host.hostname().to_string(),
            query_types: self.key.query_types,
            anonymization_key: self.key.anonymization_key.clone(),
            secure,
            https_options: self.https_svcb_options.clone(),
        };
        let join = tokio::task::spawn_local(dns_task::run_dns_task(
            self.self_weak.borrow().clone(),
            manager.collaborators.dns.clone(),
            manager.collaborators.sorter.clone(),
            config,
            extra_slot,
        ));
        *self.current_task.borrow_mut() = Some(RunningTask {
            kind: TaskKind::Dns { secure },
            join,
        });

        if request_extra_slot {
            // A second slot lets the A and AAAA transactions run in
            // parallel; until granted, the task runs one at a time.
            let handle = manager
                .dispatcher
                .add_at_head(self.self_rc(), self.priority().as_dispatch());
            if let Some(handle) = handle {
                self.handle.set(Some(handle));
            }
        }
    }

    pub(crate) fn on_dns_task_complete(
        &self,
        result: Result<CacheEntry, DnsTaskFailure>,
        secure: bool,
    ) {
        if self.completed.get() {
            return;
        }
        *self.current_task.borrow_mut() = None;
        self.release_extra_slots();
        match result {
            Ok(entry) => {
                let entry = self.guard_name_collision(entry);
                self.complete(entry, None, true, secure, false)
            }
            Err(failure) => {
                tracing::debug!(
                    host = %self.key.host,
                    error = ?failure.entry.error(),
                    secure,
                    fallback = failure.allow_fallback,
                    "dns task failed"
                );
                if failure.allow_fallback {
                    self.completion_results.borrow_mut().push(CompletionResult {
                        entry: failure.entry,
                        secure,
                    });
                    self.run_next_task();
                } else {
                    self.complete(failure.entry, None, true, secure, secure);
                }
            }
        }
    }

    /// Forwarded by the DNS task as individual transactions complete, to
    /// stream partial endpoints to attached service-endpoint requests.
    pub(crate) fn on_intermediate_dns_results(&self, partial: &CacheEntry, crypto_ready: bool) {
        if self.completed.get() {
            return;
        }
        let sinks: Vec<Rc<EndpointSink>> = self
            .endpoint_waiters
            .borrow()
            .iter()
            .map(|waiter| waiter.sink.clone())
            .collect();
        if sinks.is_empty() {
            return;
        }
        let partial = partial.with_default_port(self.key.host.port());
        let endpoints = endpoints_from_entry(&partial);
        for sink in sinks {
            sink.update(&endpoints, partial.aliases(), crypto_ready);
        }
    }

    fn start_system_task(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let system = manager.collaborators.system.clone();
        let hostname = self.key.host.hostname().to_string();
        let flags = self.key.flags;
        let attempts = manager.options.max_system_retry_attempts;
        let weak = self.self_weak.borrow().clone();
        let join = tokio::task::spawn_local(async move {
            let result = system.resolve(&hostname, flags, attempts).await;
            let Some(job) = weak.upgrade() else { return };
            job.on_system_task_complete(result);
        });
        *self.current_task.borrow_mut() = Some(RunningTask {
            kind: TaskKind::System,
            join,
        });
    }

    fn on_system_task_complete(&self, result: Result<Vec<IpAddr>, ResolveError>) {
        if self.completed.get() {
            return;
        }
        *self.current_task.borrow_mut() = None;
        match result {
            Ok(addresses) if !addresses.is_empty() => {
                let addresses = filter_addresses_for_types(&addresses, self.key.query_types);
                let entry = self.guard_name_collision(CacheEntry::for_success(
                    addresses,
                    EntrySource::Unknown,
                    None,
                ));
                self.complete(entry, None, true, false, false);
            }
            Ok(_) => self.record_failure_and_continue(ResolveError::NameNotResolved, false),
            Err(error) => self.record_failure_and_continue(error, false),
        }
    }

    fn start_mdns_task(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(mdns) = manager.collaborators.mdns.clone() else {
            self.record_failure_and_continue(ResolveError::NameNotResolved, false);
            return;
        };
        let query_type = self
            .key
            .query_types
            .iter()
            .next()
            .unwrap_or(QueryType::A);
        let hostname = self.key.host.hostname().to_string();
        let weak = self.self_weak.borrow().clone();
        let join = tokio::task::spawn_local(async move {
            let result = mdns.resolve(&hostname, query_type).await;
            let Some(job) = weak.upgrade() else { return };
            if job.completed.get() {
                return;
            }
            *job.current_task.borrow_mut() = None;
            match result {
                Ok(entry) => {
                    let entry = job.guard_name_collision(entry);
                    job.complete(entry, None, true, false, false)
                }
                Err(error) => job.record_failure_and_continue(error, false),
            }
        });
        *self.current_task.borrow_mut() = Some(RunningTask {
            kind: TaskKind::Mdns,
            join,
        });
    }

    fn start_nat64_task(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Ok(literal) = self.key.host.hostname().parse::<Ipv4Addr>() else {
            self.record_failure_and_continue(ResolveError::NameNotResolved, false);
            return;
        };
        let Some(nat64) = manager.collaborators.nat64.clone() else {
            self.record_failure_and_continue(ResolveError::NameNotResolved, false);
            return;
        };
        let weak = self.self_weak.borrow().clone();
        let join = tokio::task::spawn_local(async move {
            let synthesized = nat64.synthesize(literal).await;
            let Some(job) = weak.upgrade() else { return };
            if job.completed.get() {
                return;
            }
            *job.current_task.borrow_mut() = None;
            let addresses = match synthesized {
                Some(addresses) if !addresses.is_empty() => addresses,
                // No NAT64 prefix; the literal itself is the result.
                _ => vec![IpAddr::V4(literal)],
            };
            let addresses = addresses
                .into_iter()
                .map(|ip| SocketAddr::new(ip, 0))
                .collect();
            let entry = CacheEntry::for_success(addresses, EntrySource::Unknown, None);
            job.complete(entry, None, false, false, false);
        });
        *self.current_task.borrow_mut() = Some(RunningTask {
            kind: TaskKind::Nat64,
            join,
        });
    }

    fn record_failure_and_continue(&self, error: ResolveError, secure: bool) {
        self.completion_results.borrow_mut().push(CompletionResult {
            entry: CacheEntry::for_error(error, None),
            secure,
        });
        self.run_next_task();
    }

    // ---- abort paths ----

    /// Network transition: terminal, synchronous, uncached.
    pub(crate) fn abort_network_changed(&self) {
        self.complete(
            CacheEntry::for_error(ResolveError::NetworkChanged, None),
            None,
            false,
            false,
            false,
        );
    }

    pub(crate) fn abort_shut_down(&self) {
        self.complete(
            CacheEntry::for_error(ResolveError::ContextShutDown, None),
            None,
            false,
            false,
            false,
        );
    }

    /// Queue-overflow eviction. The dispatcher already erased the queue
    /// handle; completion is posted so waiting requests never observe it
    /// reentrantly from the add that overflowed the queue.
    pub(crate) fn on_evicted(&self) {
        self.handle.set(None);
        let job = self.self_rc();
        tokio::task::spawn_local(async move {
            job.complete(
                CacheEntry::for_error(ResolveError::QueueTooLarge, None),
                None,
                false,
                false,
                false,
            );
        });
    }

    /// DNS configuration changed: drop insecure DNS work. A job running
    /// an insecure DNS task tries the HOSTS map, then its remaining
    /// fallback tasks.
    pub(crate) fn abort_insecure_dns_task(&self) {
        if self.completed.get() {
            return;
        }
        self.tasks.borrow_mut().retain(|task| *task != TaskType::Dns);
        let running_insecure = matches!(
            &*self.current_task.borrow(),
            Some(RunningTask {
                kind: TaskKind::Dns { secure: false },
                ..
            })
        );
        if !running_insecure {
            return;
        }
        tracing::debug!(host = %self.key.host, "aborting insecure dns task on config change");
        self.kill_current_task();
        self.release_extra_slots();
        if self.serve_from_hosts() {
            return;
        }
        self.run_next_task();
    }

    // ---- completion ----

    fn cancel(&self) {
        if self.completed.replace(true) {
            return;
        }
        tracing::debug!(host = %self.key.host, "job cancelled; last request detached");
        self.kill_current_task();
        self.release_dispatcher(None);
    }

    fn complete_with_accumulated_failure(&self) {
        let last = self.completion_results.borrow_mut().pop();
        match last {
            Some(result) => {
                let secure = result.secure;
                self.complete(result.entry, None, true, secure, secure)
            }
            None => self.complete(
                CacheEntry::for_error(ResolveError::NameNotResolved, None),
                None,
                true,
                false,
                false,
            ),
        }
    }

    // Substitutes the collision error for any task result carrying the
    // sentinel address. IP-literal lookups never pass through here: they
    // resolve in the request phase or through the NAT64 fallback.
    fn guard_name_collision(&self, entry: CacheEntry) -> CacheEntry {
        if entry
            .addresses()
            .iter()
            .any(|address| address.ip() == IpAddr::V4(ICANN_COLLISION_ADDRESS))
        {
            tracing::warn!(host = %self.key.host, "result hit the ICANN name-collision sentinel");
            return CacheEntry::for_error(ResolveError::IcannNameCollision, entry.ttl());
        }
        entry
    }

    fn complete(
        &self,
        entry: CacheEntry,
        staleness: Option<Staleness>,
        allow_cache: bool,
        secure: bool,
        secure_network_error: bool,
    ) {
        if self.completed.replace(true) {
            return;
        }
        self.kill_current_task();

        self.release_dispatcher(if allow_cache {
            Some((entry.clone(), secure))
        } else {
            None
        });

        let waiters = std::mem::take(&mut *self.waiters.borrow_mut());
        let endpoint_waiters = std::mem::take(&mut *self.endpoint_waiters.borrow_mut());
        tracing::debug!(
            host = %self.key.host,
            requests = waiters.len() + endpoint_waiters.len(),
            error = ?entry.error(),
            "job complete"
        );
        for waiter in waiters {
            let _ = waiter.sender.send(JobOutcome {
                entry: entry.clone(),
                staleness: staleness.clone(),
                secure_network_error,
            });
        }
        for waiter in endpoint_waiters {
            waiter.sink.complete(
                entry.with_default_port(self.key.host.port()),
                secure_network_error,
            );
        }
    }

    // Removes the job from the manager map, returns dispatcher slots, and
    // optionally writes the result to the cache.
    fn release_dispatcher(&self, cache_write: Option<(CacheEntry, bool)>) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        manager.remove_job(&self.key);
        if let Some(handle) = self.handle.take() {
            let _ = manager.dispatcher.cancel(handle);
        }
        let slots = self.num_occupied_slots.replace(0);
        for _ in 0..slots {
            manager.dispatcher.on_job_finished();
        }
        if let Some((entry, secure)) = cache_write {
            let ttl = entry.ttl().unwrap_or(if entry.is_ok() {
                DEFAULT_SUCCESS_TTL
            } else {
                Duration::ZERO
            });
            manager.cache.borrow_mut().set(
                self.key.to_cache_key(secure),
                entry,
                Instant::now(),
                ttl,
            );
        }
    }

    // Returns the extra A/AAAA transaction slot to the dispatcher as soon
    // as the DNS task no longer needs it, cancelling the slot request if
    // it was still queued. The job keeps its primary slot, so fallback
    // tasks never hold capacity a queued job could use.
    fn release_extra_slots(&self) {
        self.dns_extra_slot.borrow_mut().take();
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        if self.running.get() {
            if let Some(handle) = self.handle.take() {
                let _ = manager.dispatcher.cancel(handle);
            }
        }
        while self.num_occupied_slots.get() > 1 {
            self.num_occupied_slots.set(self.num_occupied_slots.get() - 1);
            manager.dispatcher.on_job_finished();
        }
    }

    fn kill_current_task(&self) {
        if let Some(task) = self.current_task.borrow_mut().take() {
            task.join.abort();
        }
        self.dns_extra_slot.borrow_mut().take();
    }
}

impl dispatch::Job for Job {
    // Called by the dispatcher, either to start the job or to grant an
    // extra transaction slot to a running insecure DNS task. Synchronous;
    // reenters the dispatcher freely.
    fn start(&self) {
        assert!(!self.completed.get(), "dispatcher started a completed job");
        self.num_occupied_slots.set(self.num_occupied_slots.get() + 1);
        if self.running.get() {
            if let Some(grant) = self.dns_extra_slot.borrow_mut().take() {
                let _ = grant.send(());
            }
            return;
        }
        self.running.set(true);
        self.handle.set(None);
        self.run_next_task();
    }
}

/// Keeps only addresses whose family matches the requested query types.
pub(crate) fn filter_addresses_for_types(
    addresses: &[IpAddr],
    query_types: QueryTypeSet,
) -> Vec<SocketAddr> {
    let want_v4 = query_types.contains(QueryType::A);
    let want_v6 = query_types.contains(QueryType::Aaaa);
    addresses
        .iter()
        .filter(|ip| match ip {
            IpAddr::V4(_) => want_v4,
            IpAddr::V6(_) => want_v6,
        })
        .map(|ip| SocketAddr::new(*ip, 0))
        .collect()
}
