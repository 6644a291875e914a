//! Stale-serving wrapper scenarios: fresh hits pass through, stale data
//! is served after the configured delay, and the real lookup backfills
//! the cache in the background.

mod common;

use std::time::Duration;

use tokio::task::LocalSet;
use tokio::time::Instant;

use host_cache::ResolveError;
use resolver::{
    CacheUsage, HostResolver, Manager, ManagerOptions, ResolveParameters, StaleOptions,
    StaleResolver, StartOutcome,
};

use common::{collaborators, default_cache_key, fakes, ips, resolve, success_entry};

struct Setup {
    manager: Manager,
    resolver: StaleResolver,
    fakes: common::Fakes,
}

fn setup(options: StaleOptions) -> Setup {
    let fakes = fakes();
    let manager = Manager::new(ManagerOptions::default(), collaborators(&fakes));
    let resolver = StaleResolver::new(Box::new(manager.clone()), options);
    Setup {
        manager,
        resolver,
        fakes,
    }
}

// Inserts an entry for example.com:80 and expires it by `expired_by`.
async fn populate_expired(setup: &Setup, ips: &[&str], expired_by: Duration) {
    let ttl = Duration::from_secs(300);
    setup.manager.with_cache(|cache| {
        cache.set(
            default_cache_key("example.com", 80),
            success_entry(ips),
            Instant::now(),
            ttl,
        );
    });
    tokio::time::advance(ttl + expired_by).await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn fresh_cache_hit_returns_synchronously() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions::default());
            setup.manager.with_cache(|cache| {
                cache.set(
                    default_cache_key("example.com", 80),
                    success_entry(&["1.1.1.1"]),
                    Instant::now(),
                    Duration::from_secs(300),
                );
            });

            let mut request = setup.resolver.create_request(
                host_cache::HostKey::for_pair("example.com", 80).unwrap(),
                host_cache::AnonymizationKey::empty(),
                ResolveParameters::default(),
            );
            assert!(matches!(request.start(), StartOutcome::Finished(Ok(()))));
            assert_eq!(ips(&*request), vec!["1.1.1.1"]);
            assert_eq!(setup.fakes.dns.transactions(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn zero_delay_serves_stale_and_backfills_cache() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions {
                delay: Duration::ZERO,
                ..StaleOptions::default()
            });
            populate_expired(&setup, &["1.1.1.1"], Duration::from_secs(300)).await;
            setup.fakes.dns.answer("example.com", &["2.2.2.2"], 300);
            setup.fakes.dns.set_delay(Duration::from_millis(10));

            let (request, result) =
                resolve(&setup.resolver, "example.com", 80, ResolveParameters::default()).await;
            assert_eq!(result, Ok(()));
            assert_eq!(ips(&*request), vec!["1.1.1.1"]);
            assert!(request.stale_info().expect("served stale").is_stale());
            // The network lookup was detached, not cancelled.
            assert_eq!(setup.resolver.num_detached_requests(), 1);

            // Let the detached request finish and repopulate the cache.
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(setup.resolver.num_detached_requests(), 0);

            let (request, result) =
                resolve(&setup.resolver, "example.com", 80, ResolveParameters::default()).await;
            assert_eq!(result, Ok(()));
            assert_eq!(ips(&*request), vec!["2.2.2.2"]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn stale_served_instead_of_name_not_resolved() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions {
                delay: Duration::from_secs(3600),
                use_stale_on_name_not_resolved: true,
                ..StaleOptions::default()
            });
            populate_expired(&setup, &["1.1.1.1"], Duration::from_secs(300)).await;
            setup
                .fakes
                .dns
                .fail("example.com", ResolveError::NameNotResolved);

            let (request, result) =
                resolve(&setup.resolver, "example.com", 80, ResolveParameters::default()).await;
            assert_eq!(result, Ok(()));
            assert_eq!(ips(&*request), vec!["1.1.1.1"]);
            assert_eq!(setup.resolver.num_detached_requests(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn too_expired_data_waits_for_the_network() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions {
                delay: Duration::ZERO,
                max_expired_time: Some(Duration::from_secs(1)),
                ..StaleOptions::default()
            });
            populate_expired(&setup, &["1.1.1.1"], Duration::from_secs(300)).await;
            setup.fakes.dns.answer("example.com", &["2.2.2.2"], 300);
            setup.fakes.dns.set_delay(Duration::from_millis(10));

            let (request, result) =
                resolve(&setup.resolver, "example.com", 80, ResolveParameters::default()).await;
            assert_eq!(result, Ok(()));
            // Too stale to serve; the network result wins despite the
            // zero delay.
            assert_eq!(ips(&*request), vec!["2.2.2.2"]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn other_network_data_is_unusable_when_disallowed() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions {
                delay: Duration::ZERO,
                allow_other_network: false,
                ..StaleOptions::default()
            });
            setup.manager.with_cache(|cache| {
                cache.set(
                    default_cache_key("example.com", 80),
                    success_entry(&["1.1.1.1"]),
                    Instant::now(),
                    Duration::from_secs(300),
                );
            });
            // Stale by network change only, still within its TTL.
            setup.manager.on_network_change();
            setup.fakes.dns.answer("example.com", &["2.2.2.2"], 300);
            setup.fakes.dns.set_delay(Duration::from_millis(10));

            let (request, result) =
                resolve(&setup.resolver, "example.com", 80, ResolveParameters::default()).await;
            assert_eq!(result, Ok(()));
            assert_eq!(ips(&*request), vec!["2.2.2.2"]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn explicit_stale_allowed_is_served_without_refresh() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions::default());
            populate_expired(&setup, &["1.1.1.1"], Duration::from_secs(300)).await;

            let parameters = ResolveParameters {
                cache_usage: CacheUsage::StaleAllowed,
                ..ResolveParameters::default()
            };
            let mut request = setup.resolver.create_request(
                host_cache::HostKey::for_pair("example.com", 80).unwrap(),
                host_cache::AnonymizationKey::empty(),
                parameters,
            );
            assert!(matches!(request.start(), StartOutcome::Finished(Ok(()))));
            assert_eq!(ips(&*request), vec!["1.1.1.1"]);
            assert_eq!(setup.fakes.dns.transactions(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn dropping_the_request_cancels_timer_and_network() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions {
                delay: Duration::from_secs(60),
                ..StaleOptions::default()
            });
            populate_expired(&setup, &["1.1.1.1"], Duration::from_secs(300)).await;
            setup.fakes.dns.hang("example.com");

            let mut request = setup.resolver.create_request(
                host_cache::HostKey::for_pair("example.com", 80).unwrap(),
                host_cache::AnonymizationKey::empty(),
                ResolveParameters::default(),
            );
            assert!(request.start().is_pending());
            assert_eq!(setup.manager.num_jobs(), 1);

            drop(request);
            assert_eq!(setup.manager.num_jobs(), 0);
            assert_eq!(setup.resolver.num_detached_requests(), 0);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shutdown_fails_new_requests() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let setup = setup(StaleOptions::default());
            setup.resolver.on_shutdown();

            let mut request = setup.resolver.create_request(
                host_cache::HostKey::for_pair("example.com", 80).unwrap(),
                host_cache::AnonymizationKey::empty(),
                ResolveParameters::default(),
            );
            assert!(matches!(
                request.start(),
                StartOutcome::Finished(Err(ResolveError::NameNotResolved))
            ));
            assert_eq!(
                request.error_info().error,
                Some(ResolveError::ContextShutDown)
            );
        })
        .await;
}
