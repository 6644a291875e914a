use std::collections::VecDeque;

use host_cache::{ResolveSource, SecureDnsMode};

use crate::params::CacheUsage;

/// One step of a job's resolution strategy. Tasks run in order; a
/// recoverable failure advances to the next task, success short-circuits
/// the rest.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TaskType {
    /// Fresh lookup against the secure half of the cache (request phase).
    SecureCacheLookup,
    /// Fresh lookup against both cache halves (request phase).
    CacheLookup,
    /// Serve a configured DoH server hostname from preset addresses
    /// (request phase).
    ConfigPreset,
    /// Serve from the HOSTS map (request phase).
    Hosts,
    /// Mid-sequence fresh lookup against the insecure cache half, run
    /// synchronously from the job after secure tasks failed.
    InsecureCacheLookup,
    /// Insecure DNS transactions.
    Dns,
    /// DoH transactions. Never waits for a dispatcher slot.
    SecureDns,
    /// The system (getaddrinfo) resolver.
    System,
    /// Multicast DNS.
    Mdns,
    /// NAT64 synthesis for an IPv4 literal.
    Nat64,
}

impl TaskType {
    /// Insecure transactions and worker-pool tasks are gated by the
    /// dispatcher; DoH, NAT64, and local lookups start immediately.
    pub(crate) fn needs_dispatch_slot(self) -> bool {
        matches!(self, TaskType::Dns | TaskType::System | TaskType::Mdns)
    }

    /// Tasks consumed synchronously by the request's local phase.
    pub(crate) fn is_request_phase(self) -> bool {
        matches!(
            self,
            TaskType::SecureCacheLookup
                | TaskType::CacheLookup
                | TaskType::ConfigPreset
                | TaskType::Hosts
        )
    }
}

pub(crate) struct TaskSequenceParams {
    pub source: ResolveSource,
    pub secure_dns_mode: SecureDnsMode,
    pub cache_usage: CacheUsage,
    pub insecure_dns_enabled: bool,
    pub doh_available: bool,
    pub mdns_available: bool,
}

/// Builds the ordered task list for one job key. An empty remainder after
/// the request phase means the lookup fails without external work.
pub(crate) fn build_task_sequence(params: &TaskSequenceParams) -> VecDeque<TaskType> {
    let mut tasks = VecDeque::new();

    if params.cache_usage.reads_cache() {
        match params.secure_dns_mode {
            SecureDnsMode::Secure | SecureDnsMode::Automatic => {
                tasks.push_back(TaskType::SecureCacheLookup)
            }
            SecureDnsMode::Off => tasks.push_back(TaskType::CacheLookup),
        }
    }
    tasks.push_back(TaskType::Hosts);
    tasks.push_back(TaskType::ConfigPreset);

    match params.source {
        ResolveSource::Any | ResolveSource::Dns => match params.secure_dns_mode {
            SecureDnsMode::Secure => {
                // Secure mode without a usable DoH server resolves nothing.
                if params.doh_available {
                    tasks.push_back(TaskType::SecureDns);
                }
            }
            SecureDnsMode::Automatic => {
                if params.doh_available {
                    tasks.push_back(TaskType::SecureDns);
                }
                if params.cache_usage.reads_cache() {
                    tasks.push_back(TaskType::InsecureCacheLookup);
                }
                if params.insecure_dns_enabled {
                    tasks.push_back(TaskType::Dns);
                }
                if params.source == ResolveSource::Any {
                    tasks.push_back(TaskType::System);
                }
            }
            SecureDnsMode::Off => {
                if params.insecure_dns_enabled {
                    tasks.push_back(TaskType::Dns);
                }
                if params.source == ResolveSource::Any {
                    tasks.push_back(TaskType::System);
                }
            }
        },
        ResolveSource::System => tasks.push_back(TaskType::System),
        ResolveSource::Mdns => {
            if params.mdns_available {
                tasks.push_back(TaskType::Mdns);
            }
        }
        ResolveSource::LocalOnly => (),
    }

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params() -> TaskSequenceParams {
        TaskSequenceParams {
            source: ResolveSource::Any,
            secure_dns_mode: SecureDnsMode::Off,
            cache_usage: CacheUsage::Allowed,
            insecure_dns_enabled: true,
            doh_available: false,
            mdns_available: false,
        }
    }

    #[test]
    fn off_mode_tries_dns_then_system() {
        let tasks = build_task_sequence(&params());
        assert_eq!(
            Vec::from(tasks),
            vec![
                TaskType::CacheLookup,
                TaskType::Hosts,
                TaskType::ConfigPreset,
                TaskType::Dns,
                TaskType::System,
            ]
        );
    }

    #[test]
    fn automatic_mode_interleaves_insecure_cache_lookup() {
        let mut p = params();
        p.secure_dns_mode = SecureDnsMode::Automatic;
        p.doh_available = true;
        let tasks = build_task_sequence(&p);
        assert_eq!(
            Vec::from(tasks),
            vec![
                TaskType::SecureCacheLookup,
                TaskType::Hosts,
                TaskType::ConfigPreset,
                TaskType::SecureDns,
                TaskType::InsecureCacheLookup,
                TaskType::Dns,
                TaskType::System,
            ]
        );
    }

    #[test]
    fn secure_mode_never_falls_back() {
        let mut p = params();
        p.secure_dns_mode = SecureDnsMode::Secure;
        p.doh_available = true;
        let tasks = build_task_sequence(&p);
        assert_eq!(
            Vec::from(tasks),
            vec![
                TaskType::SecureCacheLookup,
                TaskType::Hosts,
                TaskType::ConfigPreset,
                TaskType::SecureDns,
            ]
        );
    }

    #[test]
    fn local_only_has_no_external_tasks() {
        let mut p = params();
        p.source = ResolveSource::LocalOnly;
        let tasks = build_task_sequence(&p);
        assert!(tasks.iter().all(|task| task.is_request_phase()));
    }

    #[test]
    fn insecure_client_disabled_uses_system() {
        let mut p = params();
        p.insecure_dns_enabled = false;
        let tasks = build_task_sequence(&p);
        assert!(!tasks.contains(&TaskType::Dns));
        assert!(tasks.contains(&TaskType::System));
    }

    #[test]
    fn disallowed_cache_skips_cache_lookups() {
        let mut p = params();
        p.cache_usage = CacheUsage::Disallowed;
        let tasks = build_task_sequence(&p);
        assert!(!tasks.contains(&TaskType::CacheLookup));
        assert!(!tasks.contains(&TaskType::SecureCacheLookup));
    }
}
