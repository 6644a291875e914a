use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use host_cache::SecureDnsMode;

/// Extra time allowed for supplemental HTTPS transactions after the
/// address transactions of a lookup complete:
/// `clamp(address_elapsed * percent / 100, min, max)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsSvcbOptions {
    pub enable: bool,
    #[serde(with = "humantime_serde")]
    pub insecure_extra_time_max: Duration,
    pub insecure_extra_time_percent: u32,
    #[serde(with = "humantime_serde")]
    pub insecure_extra_time_min: Duration,
    #[serde(with = "humantime_serde")]
    pub secure_extra_time_max: Duration,
    pub secure_extra_time_percent: u32,
    #[serde(with = "humantime_serde")]
    pub secure_extra_time_min: Duration,
}

impl Default for HttpsSvcbOptions {
    fn default() -> Self {
        HttpsSvcbOptions {
            enable: true,
            insecure_extra_time_max: Duration::from_millis(50),
            insecure_extra_time_percent: 20,
            insecure_extra_time_min: Duration::from_millis(5),
            secure_extra_time_max: Duration::from_millis(50),
            secure_extra_time_percent: 20,
            secure_extra_time_min: Duration::from_millis(5),
        }
    }
}

impl HttpsSvcbOptions {
    pub(crate) fn extra_time(&self, address_elapsed: Duration, secure: bool) -> Duration {
        let (percent, min, max) = if secure {
            (
                self.secure_extra_time_percent,
                self.secure_extra_time_min,
                self.secure_extra_time_max,
            )
        } else {
            (
                self.insecure_extra_time_percent,
                self.insecure_extra_time_min,
                self.insecure_extra_time_max,
            )
        };
        (address_elapsed * percent / 100).clamp(min, max)
    }
}

/// Structured overrides applied on top of the discovered DNS
/// configuration. `None` leaves the discovered value in place.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfigOverrides {
    pub nameservers: Option<Vec<SocketAddr>>,
    pub search: Option<Vec<String>>,
    pub attempts: Option<u32>,
    #[serde(with = "humantime_serde::option")]
    pub fallback_period: Option<Duration>,
    pub rotate: Option<bool>,
    pub secure_dns_mode: Option<SecureDnsMode>,
    /// Whether a DoH server is configured and usable.
    pub doh_available: Option<bool>,
    /// Preparsed HOSTS-file contents, hostname to addresses.
    pub hosts: Option<HashMap<String, Vec<IpAddr>>>,
    /// Preset addresses for configured DoH server hostnames, served from
    /// the local phase so DoH bootstrap never recurses into itself.
    pub doh_preset_addresses: Option<HashMap<String, Vec<IpAddr>>>,
}

/// Manager-wide configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Dispatcher slot count (`total_jobs`).
    pub max_concurrent_resolves: usize,
    /// Queue ceiling; the oldest lowest-priority queued job is evicted
    /// beyond it. Defaults to 100x the concurrency limit.
    pub max_queued_jobs: Option<usize>,
    pub max_system_retry_attempts: u32,
    /// Gates inclusion of the insecure DNS task; when false, lookups use
    /// the system resolver instead.
    pub insecure_dns_client_enabled: bool,
    /// Gates TXT/SRV/PTR/HTTPS query types.
    pub additional_dns_types_enabled: bool,
    /// When false, IPv6 reachability is assumed on Wi-Fi rather than
    /// probed.
    pub check_ipv6_on_wifi: bool,
    pub cache_enabled: bool,
    pub max_cache_entries: usize,
    /// When false, the anonymization key of every request collapses to
    /// the shared empty partition.
    pub network_partitioning_enabled: bool,
    pub https_svcb_options: HttpsSvcbOptions,
    pub dns_config_overrides: DnsConfigOverrides,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            max_concurrent_resolves: 8,
            max_queued_jobs: None,
            max_system_retry_attempts: 4,
            insecure_dns_client_enabled: true,
            additional_dns_types_enabled: true,
            check_ipv6_on_wifi: true,
            cache_enabled: true,
            max_cache_entries: 1000,
            network_partitioning_enabled: true,
            https_svcb_options: HttpsSvcbOptions::default(),
            dns_config_overrides: DnsConfigOverrides::default(),
        }
    }
}

impl ManagerOptions {
    pub(crate) fn effective_max_queued_jobs(&self) -> usize {
        self.max_queued_jobs
            .unwrap_or(100 * self.max_concurrent_resolves.max(1))
    }

    pub(crate) fn effective_secure_dns_mode(&self) -> SecureDnsMode {
        self.dns_config_overrides
            .secure_dns_mode
            .unwrap_or(SecureDnsMode::Off)
    }

    pub(crate) fn effective_cache_entries(&self) -> usize {
        if self.cache_enabled {
            self.max_cache_entries
        } else {
            0
        }
    }
}
