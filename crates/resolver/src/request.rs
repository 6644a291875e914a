use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};

use futures::future::LocalBoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;

use host_cache::{
    AnonymizationKey, CacheEntry, EntrySource, HostKey, KeyFlags, QueryType, QueryTypeSet,
    ResolveError, ResolveSource, SecureDnsMode, Staleness,
};

use crate::error::ResolveErrorInfo;
use crate::job::{filter_addresses_for_types, Job, JobOutcome};
use crate::manager::{JobKey, ManagerInner};
use crate::params::{CacheUsage, RequestPriority, ResolveParameters, SecureDnsPolicy};
use crate::tasks::{build_task_sequence, TaskSequenceParams, TaskType};
use crate::{ResolveRequest, StartOutcome};

/// Result of the synchronous local phase: IP literal, localhost, cache,
/// HOSTS, and DoH-preset handling, in that order.
pub(crate) enum LocalOutcome {
    Finished {
        entry: CacheEntry,
        staleness: Option<Staleness>,
    },
    Fail(ResolveError),
    StartJob {
        key: JobKey,
        tasks: VecDeque<TaskType>,
        /// A stale hit usable as an intermediate result while the job
        /// refreshes (`STALE_ALLOWED_WHILE_REFRESHING`).
        stale_intermediate: Option<(CacheEntry, Staleness)>,
    },
}

fn has_address_types(query_types: QueryTypeSet) -> bool {
    query_types.contains(QueryType::A) || query_types.contains(QueryType::Aaaa)
}

// Derives the effective query-type set, flags, and secure-DNS mode, then
// builds the job key and task sequence.
fn plan_job(
    manager: &ManagerInner,
    host: &HostKey,
    anonymization_key: &AnonymizationKey,
    parameters: &ResolveParameters,
    ipv6_reachable: bool,
) -> Result<(JobKey, VecDeque<TaskType>), ResolveError> {
    let secure_dns_mode = match parameters.secure_dns_policy {
        SecureDnsPolicy::Allow => manager.secure_dns_mode(),
        SecureDnsPolicy::Disable | SecureDnsPolicy::Bootstrap => SecureDnsMode::Off,
    };

    let mut flags = KeyFlags::NONE;
    if parameters.include_canonical_name {
        flags |= KeyFlags::CANONNAME;
    }
    if parameters.loopback_only {
        flags |= KeyFlags::LOOPBACK_ONLY;
    }
    if parameters.avoid_multicast_resolution {
        flags |= KeyFlags::AVOID_MULTICAST;
    }

    let query_types = match parameters.query_type {
        Some(query_type) => {
            let additional = matches!(
                query_type,
                QueryType::Https | QueryType::Txt | QueryType::Srv | QueryType::Ptr
            );
            if additional && !manager.options.additional_dns_types_enabled {
                return Err(ResolveError::NameNotResolved);
            }
            QueryTypeSet::of(&[query_type])
        }
        None => {
            let mut set = QueryTypeSet::of(&[QueryType::A]);
            if ipv6_reachable {
                set.insert(QueryType::Aaaa);
            } else {
                flags |= KeyFlags::DEFAULT_FAMILY_DUE_TO_NO_IPV6;
            }
            let https_scheme = matches!(host.scheme(), Some("https" | "wss"));
            if https_scheme
                && manager.options.https_svcb_options.enable
                && manager.options.additional_dns_types_enabled
            {
                set.insert(QueryType::Https);
            }
            set
        }
    };

    let tasks = build_task_sequence(&TaskSequenceParams {
        source: parameters.source,
        secure_dns_mode,
        cache_usage: parameters.cache_usage,
        insecure_dns_enabled: manager.options.insecure_dns_client_enabled,
        doh_available: manager.doh_available(),
        mdns_available: manager.collaborators.mdns.is_some()
            && !parameters.avoid_multicast_resolution,
    });

    Ok((
        JobKey {
            host: host.clone(),
            anonymization_key: anonymization_key.clone(),
            query_types,
            flags,
            source: parameters.source,
            secure_dns_mode,
        },
        tasks,
    ))
}

/// The synchronous local resolution phase shared by host and
/// service-endpoint requests.
pub(crate) fn resolve_locally(
    manager: &Rc<ManagerInner>,
    host: &HostKey,
    anonymization_key: &AnonymizationKey,
    parameters: &ResolveParameters,
    ipv6_reachable: bool,
) -> LocalOutcome {
    let (key, mut tasks) =
        match plan_job(manager, host, anonymization_key, parameters, ipv6_reachable) {
            Ok(plan) => plan,
            Err(error) => return LocalOutcome::Fail(error),
        };

    // IP literal. Exempt from the name-collision guard and never cached.
    if let Ok(ip) = host.hostname().parse::<IpAddr>() {
        if !has_address_types(key.query_types) {
            return LocalOutcome::Fail(ResolveError::NameNotResolved);
        }
        let family_matches = match ip {
            IpAddr::V4(_) => key.query_types.contains(QueryType::A),
            IpAddr::V6(_) => key.query_types.contains(QueryType::Aaaa),
        };
        if !family_matches {
            return LocalOutcome::Fail(ResolveError::NameNotResolved);
        }
        if let IpAddr::V4(_) = ip {
            // On an IPv6-reachable network an IPv4 literal may still need
            // NAT64 synthesis.
            if ipv6_reachable
                && manager.collaborators.nat64.is_some()
                && parameters.source != ResolveSource::LocalOnly
            {
                return LocalOutcome::StartJob {
                    key,
                    tasks: VecDeque::from([TaskType::Nat64]),
                    stale_intermediate: None,
                };
            }
        }
        let entry = CacheEntry::for_success(
            vec![SocketAddr::new(ip, 0)],
            EntrySource::Unknown,
            None,
        );
        return LocalOutcome::Finished {
            entry,
            staleness: None,
        };
    }

    // localhost and *.localhost resolve to loopback without ever hitting
    // the network.
    let hostname = host.hostname();
    if hostname == "localhost" || hostname.ends_with(".localhost") {
        let mut addresses = Vec::new();
        if key.query_types.contains(QueryType::Aaaa) {
            addresses.push(SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::LOCALHOST), 0));
        }
        if key.query_types.contains(QueryType::A) {
            addresses.push(SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 0));
        }
        if addresses.is_empty() {
            return LocalOutcome::Fail(ResolveError::NameNotResolved);
        }
        let entry = CacheEntry::for_success(addresses, EntrySource::Unknown, None);
        return LocalOutcome::Finished {
            entry,
            staleness: None,
        };
    }

    // Consume the leading request-phase tasks.
    let mut stale_intermediate: Option<(CacheEntry, Staleness)> = None;
    while tasks.front().map_or(false, |task| task.is_request_phase()) {
        let task = tasks.pop_front().expect("front was present");
        let outcome = match task {
            TaskType::SecureCacheLookup => cache_lookup(manager, &key, parameters.cache_usage, &[true], &mut stale_intermediate),
            TaskType::CacheLookup => cache_lookup(
                manager,
                &key,
                parameters.cache_usage,
                &[true, false],
                &mut stale_intermediate,
            ),
            TaskType::Hosts => hosts_lookup(manager, &key),
            TaskType::ConfigPreset => preset_lookup(manager, &key),
            _ => None,
        };
        if let Some(outcome) = outcome {
            return outcome;
        }
    }

    if tasks.is_empty() {
        // Nothing but local sources were permitted and none produced a
        // result.
        let error = if parameters.source == ResolveSource::LocalOnly {
            ResolveError::CacheMiss
        } else {
            ResolveError::NameNotResolved
        };
        return LocalOutcome::Fail(error);
    }

    LocalOutcome::StartJob {
        key,
        tasks,
        stale_intermediate,
    }
}

fn cache_lookup(
    manager: &ManagerInner,
    key: &JobKey,
    cache_usage: CacheUsage,
    halves: &[bool],
    stale_intermediate: &mut Option<(CacheEntry, Staleness)>,
) -> Option<LocalOutcome> {
    let now = Instant::now();
    let mut cache = manager.cache.borrow_mut();
    for &secure in halves {
        let cache_key = key.to_cache_key(secure);
        match cache_usage {
            CacheUsage::Allowed => {
                if let Some(entry) = cache.lookup(&cache_key, now).cloned() {
                    return Some(LocalOutcome::Finished {
                        entry,
                        staleness: None,
                    });
                }
            }
            CacheUsage::StaleAllowed => {
                if let Some((entry, staleness)) = cache.lookup_stale(&cache_key, now) {
                    return Some(LocalOutcome::Finished {
                        entry: entry.clone(),
                        staleness: Some(staleness),
                    });
                }
            }
            CacheUsage::StaleAllowedWhileRefreshing => {
                if let Some((entry, staleness)) = cache.lookup_stale(&cache_key, now) {
                    if !staleness.is_stale() {
                        return Some(LocalOutcome::Finished {
                            entry: entry.clone(),
                            staleness: Some(staleness),
                        });
                    }
                    if stale_intermediate.is_none() {
                        *stale_intermediate = Some((entry.clone(), staleness));
                    }
                }
            }
            CacheUsage::Disallowed => (),
        }
    }
    None
}

fn hosts_lookup(manager: &ManagerInner, key: &JobKey) -> Option<LocalOutcome> {
    let addresses = manager.hosts_lookup(key.host.hostname())?;
    let addresses = filter_addresses_for_types(&addresses, key.query_types);
    if addresses.is_empty() {
        return None;
    }
    Some(LocalOutcome::Finished {
        entry: CacheEntry::for_success(addresses, EntrySource::Hosts, None),
        staleness: None,
    })
}

fn preset_lookup(manager: &ManagerInner, key: &JobKey) -> Option<LocalOutcome> {
    let addresses = manager.doh_preset_lookup(key.host.hostname())?;
    let addresses = filter_addresses_for_types(&addresses, key.query_types);
    if addresses.is_empty() {
        return None;
    }
    Some(LocalOutcome::Finished {
        entry: CacheEntry::for_success(addresses, EntrySource::Unknown, None),
        staleness: None,
    })
}

enum Phase {
    NotStarted,
    /// The IPv6 reachability probe must run before local resolution.
    ProbeThenResolve,
    Attached {
        job: Weak<Job>,
        waiter_id: u64,
        receiver: oneshot::Receiver<JobOutcome>,
    },
    Finished,
}

/// One user-visible resolution. Dropping it cancels the resolution; the
/// completion is then never delivered.
pub(crate) struct ResolveHostRequestImpl {
    manager: Weak<ManagerInner>,
    host: HostKey,
    anonymization_key: AnonymizationKey,
    parameters: ResolveParameters,
    priority: RequestPriority,
    phase: Phase,
    results: Option<CacheEntry>,
    error_info: ResolveErrorInfo,
    stale_info: Option<Staleness>,
}

impl ResolveHostRequestImpl {
    pub(crate) fn new(
        manager: Weak<ManagerInner>,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Self {
        let priority = parameters.initial_priority;
        ResolveHostRequestImpl {
            manager,
            host,
            anonymization_key,
            parameters,
            priority,
            phase: Phase::NotStarted,
            results: None,
            error_info: ResolveErrorInfo::ok(),
            stale_info: None,
        }
    }

    fn needs_reachability_probe(&self) -> bool {
        self.parameters.query_type.is_none() && self.host.hostname().parse::<IpAddr>().is_err()
    }

    fn continue_resolution(
        &mut self,
        manager: &Rc<ManagerInner>,
        ipv6_reachable: bool,
    ) -> StartOutcome {
        match resolve_locally(
            manager,
            &self.host,
            &self.anonymization_key,
            &self.parameters,
            ipv6_reachable,
        ) {
            LocalOutcome::Finished { entry, staleness } => self.finish_entry(entry, staleness),
            LocalOutcome::Fail(error) => self.finish_error(error),
            LocalOutcome::StartJob {
                key,
                tasks,
                stale_intermediate,
            } => {
                let (job, waiter_id, receiver) = manager.attach_job(
                    key,
                    tasks,
                    self.priority,
                    self.parameters.is_speculative,
                );
                if let Some((entry, staleness)) = stale_intermediate {
                    // Readable right away; the final fresh result
                    // overwrites it.
                    if !self.parameters.is_speculative {
                        self.results = Some(entry.with_default_port(self.host.port()));
                    }
                    self.stale_info = Some(staleness);
                }
                self.phase = Phase::Attached {
                    job,
                    waiter_id,
                    receiver,
                };
                StartOutcome::Pending
            }
        }
    }

    fn finish_entry(
        &mut self,
        entry: CacheEntry,
        staleness: Option<Staleness>,
    ) -> StartOutcome {
        self.error_info = ResolveErrorInfo {
            error: entry.error(),
            is_secure_network_error: false,
        };
        self.stale_info = staleness;
        if !self.parameters.is_speculative {
            self.results = Some(entry.with_default_port(self.host.port()));
        }
        self.phase = Phase::Finished;
        StartOutcome::Finished(self.error_info.squashed())
    }

    fn finish_error(&mut self, error: ResolveError) -> StartOutcome {
        self.error_info = ResolveErrorInfo::from_error(error);
        self.results = None;
        self.phase = Phase::Finished;
        StartOutcome::Finished(Err(error.squash()))
    }

    fn apply_outcome(&mut self, outcome: JobOutcome) {
        self.error_info = ResolveErrorInfo {
            error: outcome.entry.error(),
            is_secure_network_error: outcome.secure_network_error,
        };
        self.stale_info = outcome.staleness;
        if self.parameters.is_speculative {
            self.results = None;
        } else {
            self.results = Some(outcome.entry.with_default_port(self.host.port()));
        }
        self.phase = Phase::Finished;
    }

    async fn wait_inner(&mut self) -> Result<(), ResolveError> {
        loop {
            match &self.phase {
                Phase::NotStarted => panic!("wait called before start"),
                Phase::Finished => return self.error_info.squashed(),
                Phase::ProbeThenResolve => {
                    let Some(manager) = self.manager.upgrade() else {
                        self.error_info =
                            ResolveErrorInfo::from_error(ResolveError::ContextShutDown);
                        self.phase = Phase::Finished;
                        continue;
                    };
                    let reachable = match manager.cached_ipv6_reachability() {
                        Some(reachable) => reachable,
                        None => manager.collaborators.ipv6_probe.probe().await,
                    };
                    let _ = self.continue_resolution(&manager, reachable);
                }
                Phase::Attached { .. } => {
                    let outcome = {
                        let Phase::Attached { receiver, .. } = &mut self.phase else {
                            unreachable!()
                        };
                        receiver.await
                    };
                    match outcome {
                        Ok(outcome) => self.apply_outcome(outcome),
                        // The job vanished without completing; treat as a
                        // failed resolution.
                        Err(_) => {
                            self.error_info =
                                ResolveErrorInfo::from_error(ResolveError::NameNotResolved);
                            self.phase = Phase::Finished;
                        }
                    }
                }
            }
        }
    }
}

impl ResolveRequest for ResolveHostRequestImpl {
    fn start(&mut self) -> StartOutcome {
        assert!(
            matches!(self.phase, Phase::NotStarted),
            "request started twice"
        );
        let Some(manager) = self.manager.upgrade() else {
            return self.finish_error(ResolveError::ContextShutDown);
        };
        if manager.shut_down.get() {
            return self.finish_error(ResolveError::ContextShutDown);
        }

        if self.needs_reachability_probe() {
            match manager.cached_ipv6_reachability() {
                Some(reachable) => self.continue_resolution(&manager, reachable),
                // A local-only lookup may not block on a probe.
                None if self.parameters.source == ResolveSource::LocalOnly => {
                    self.finish_error(ResolveError::NameNotResolved)
                }
                None => {
                    self.phase = Phase::ProbeThenResolve;
                    StartOutcome::Pending
                }
            }
        } else {
            self.continue_resolution(&manager, true)
        }
    }

    fn wait(&mut self) -> LocalBoxFuture<'_, Result<(), ResolveError>> {
        Box::pin(self.wait_inner())
    }

    fn result_entry(&self) -> Option<&CacheEntry> {
        self.results.as_ref()
    }

    fn error_info(&self) -> ResolveErrorInfo {
        self.error_info
    }

    fn stale_info(&self) -> Option<&Staleness> {
        self.stale_info.as_ref()
    }

    fn change_priority(&mut self, priority: RequestPriority) {
        let old_priority = self.priority;
        self.priority = priority;
        if let Phase::Attached { job, waiter_id, .. } = &self.phase {
            if let Some(job) = job.upgrade() {
                job.change_request_priority(*waiter_id, old_priority, priority);
            }
        }
    }
}

impl Drop for ResolveHostRequestImpl {
    fn drop(&mut self) {
        if let Phase::Attached { job, waiter_id, .. } = &self.phase {
            if let Some(job) = job.upgrade() {
                job.detach_request(*waiter_id, self.priority);
            }
        }
    }
}
