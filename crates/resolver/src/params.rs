use serde::{Deserialize, Serialize};

use host_cache::QueryType;

pub const NUM_PRIORITIES: usize = 5;

/// Scheduling priority of a request. Higher dispatches first.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    #[default]
    Idle,
    Lowest,
    Low,
    Medium,
    Highest,
}

pub const MINIMUM_PRIORITY: RequestPriority = RequestPriority::Idle;

impl RequestPriority {
    pub const ALL: [RequestPriority; NUM_PRIORITIES] = [
        RequestPriority::Idle,
        RequestPriority::Lowest,
        RequestPriority::Low,
        RequestPriority::Medium,
        RequestPriority::Highest,
    ];

    pub fn as_dispatch(self) -> dispatch::Priority {
        self as dispatch::Priority
    }

    pub(crate) fn from_index(index: usize) -> RequestPriority {
        RequestPriority::ALL[index]
    }
}

/// How a request may use the host cache.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUsage {
    /// Fresh cache results are usable.
    #[default]
    Allowed,
    /// Cache reads are bypassed; the result is still written back for
    /// other requests to find.
    Disallowed,
    /// Stale results are usable as final results.
    StaleAllowed,
    /// A stale result is served as an intermediate result while the job
    /// refreshes it in the background.
    StaleAllowedWhileRefreshing,
}

impl CacheUsage {
    pub(crate) fn reads_cache(self) -> bool {
        !matches!(self, CacheUsage::Disallowed)
    }
}

/// Per-request secure-DNS policy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureDnsPolicy {
    /// Follow the configured secure-DNS mode.
    #[default]
    Allow,
    /// Force-disable secure DNS for this request.
    Disable,
    /// Resolution needed to bootstrap a DoH server itself; secure DNS is
    /// disabled to avoid a dependency cycle.
    Bootstrap,
}

/// Per-request resolution parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolveParameters {
    /// `None` requests the default address families (A and AAAA, subject
    /// to IPv6 reachability), plus HTTPS when applicable.
    pub query_type: Option<QueryType>,
    pub initial_priority: RequestPriority,
    pub source: host_cache::ResolveSource,
    pub cache_usage: CacheUsage,
    /// Request the canonical name (alias chain) alongside addresses.
    pub include_canonical_name: bool,
    /// Only resolve names which map to loopback.
    pub loopback_only: bool,
    pub avoid_multicast_resolution: bool,
    pub secure_dns_policy: SecureDnsPolicy,
    /// Speculative completions skip result population but still cache.
    pub is_speculative: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_map_to_dispatch_levels_in_order() {
        let mut last = None;
        for priority in RequestPriority::ALL {
            let level = priority.as_dispatch();
            if let Some(previous) = last {
                assert!(level > previous);
            }
            last = Some(level);
            assert_eq!(RequestPriority::from_index(usize::from(level)), priority);
        }
        assert_eq!(RequestPriority::ALL.len(), NUM_PRIORITIES);
    }
}
