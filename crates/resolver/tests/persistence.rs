//! Cache persistence driven through the manager: results learned in one
//! session serve lookups in the next without touching the network.

mod common;

use anyhow::Context;
use tokio::task::LocalSet;
use tokio::time::Instant;

use resolver::{Manager, ManagerOptions, ResolveParameters};

use common::{collaborators, fakes, ips, resolve};

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cache_round_trips_between_managers() -> anyhow::Result<()> {
    let local = LocalSet::new();
    local
        .run_until(async {
            let first_session = fakes();
            let manager = Manager::new(ManagerOptions::default(), collaborators(&first_session));
            first_session.dns.answer("example.com", &["1.2.3.4"], 300);

            let (request, result) =
                resolve(&manager, "example.com", 443, ResolveParameters::default()).await;
            result.ok().context("lookup failed")?;
            assert_eq!(ips(&*request), vec!["1.2.3.4"]);

            // Persist through an intermediate string, the way an embedder
            // writing to disk would.
            let serialized = manager.with_cache(|cache| {
                serde_json::to_string(&cache.serialize(Instant::now(), false))
            })?;

            let second_session = fakes();
            let restored =
                Manager::new(ManagerOptions::default(), collaborators(&second_session));
            let values: Vec<serde_json::Value> =
                serde_json::from_str(&serialized).context("reading persisted cache")?;
            let clean =
                restored.with_cache(|cache| cache.restore(&values, Instant::now()));
            assert!(clean);
            assert_eq!(restored.with_cache(|cache| cache.last_restore_size()), 1);

            // Served from the restored cache; the network is never asked.
            let (request, result) =
                resolve(&restored, "example.com", 443, ResolveParameters::default()).await;
            assert_eq!(result, Ok(()));
            assert_eq!(ips(&*request), vec!["1.2.3.4"]);
            assert_eq!(second_session.dns.transactions(), 0);
            Ok(())
        })
        .await
}
