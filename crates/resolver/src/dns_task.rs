use std::collections::VecDeque;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use host_cache::{
    AnonymizationKey, CacheEntry, EntrySource, QueryType, QueryTypeSet, ResolveError,
};

use crate::collab::{AddressSorter, DnsTransactionFactory};
use crate::config::HttpsSvcbOptions;
use crate::job::Job;

/// Floor applied to observed DNS TTLs before caching.
const MIN_TTL: Duration = Duration::from_secs(60);

pub(crate) struct DnsTaskConfig {
    pub hostname: String,
    pub query_types: QueryTypeSet,
    pub anonymization_key: AnonymizationKey,
    pub secure: bool,
    pub https_options: HttpsSvcbOptions,
}

/// A failed DNS task: the error entry to record (and possibly cache),
/// and whether the job may fall back to its next task.
pub(crate) struct DnsTaskFailure {
    pub entry: CacheEntry,
    pub allow_fallback: bool,
}

type TransactionOutcome = (QueryType, Result<CacheEntry, ResolveError>);
type InFlight = FuturesUnordered<LocalBoxFuture<'static, TransactionOutcome>>;

/// Runs one DNS task: one transaction per query type, the error-behavior
/// policy per transaction, and the supplemental-HTTPS timeout. Reports
/// the outcome back to the owning job; if the job is gone the outcome is
/// discarded.
///
/// For insecure lookups with more than one transaction, `extra_slot`
/// carries the dispatcher's grant of a second slot; transactions beyond
/// the first wait for it. Secure (DoH) transactions all start at once.
pub(crate) async fn run_dns_task(
    job: Weak<Job>,
    factory: Rc<dyn DnsTransactionFactory>,
    sorter: Rc<dyn AddressSorter>,
    config: DnsTaskConfig,
    extra_slot: Option<oneshot::Receiver<()>>,
) {
    let secure = config.secure;
    let result = run_transactions(&job, &*factory, &*sorter, &config, extra_slot).await;
    let Some(job) = job.upgrade() else { return };
    job.on_dns_task_complete(result, secure);
}

async fn run_transactions(
    job: &Weak<Job>,
    factory: &dyn DnsTransactionFactory,
    sorter: &dyn AddressSorter,
    config: &DnsTaskConfig,
    extra_slot: Option<oneshot::Receiver<()>>,
) -> Result<CacheEntry, DnsTaskFailure> {
    let types: Vec<QueryType> = config.query_types.iter().collect();
    let address_types: Vec<QueryType> = types
        .iter()
        .copied()
        .filter(|query_type| matches!(query_type, QueryType::A | QueryType::Aaaa))
        .collect();
    let wants_https = config.query_types.contains(QueryType::Https);
    // The HTTPS transaction is supplemental (and so time-bounded) only
    // when it rides along with address transactions.
    let supplemental_https = wants_https && !address_types.is_empty();

    let mut pending: VecDeque<QueryType> = types.into();
    let mut in_flight: InFlight = FuturesUnordered::new();
    let mut completed: Vec<(QueryType, CacheEntry)> = Vec::new();

    let start_time = Instant::now();

    // Insecure multi-transaction tasks start serially: the first
    // transaction immediately, the rest once the second slot arrives.
    if let Some(mut slot_rx) = extra_slot {
        let first = pending.pop_front().expect("query type set is non-empty");
        start_transaction(factory, config, first, &mut in_flight);

        loop {
            tokio::select! {
                _ = &mut slot_rx => {
                    while let Some(query_type) = pending.pop_front() {
                        start_transaction(factory, config, query_type, &mut in_flight);
                    }
                    break;
                }
                outcome = in_flight.next(), if !in_flight.is_empty() => {
                    if let Some((query_type, result)) = outcome {
                        handle_outcome(
                            job,
                            query_type,
                            result,
                            &mut completed,
                            wants_https,
                            supplemental_https,
                        )?;
                    }
                }
            }
        }
    } else {
        while let Some(query_type) = pending.pop_front() {
            start_transaction(factory, config, query_type, &mut in_flight);
        }
    }

    let mut https_timer: Option<Pin<Box<Sleep>>> = None;
    loop {
        if in_flight.is_empty() {
            break;
        }
        if supplemental_https
            && https_timer.is_none()
            && addresses_done(&address_types, &completed)
            && !type_completed(&completed, QueryType::Https)
        {
            // Supplemental HTTPS may not stall the result indefinitely.
            let extra = config
                .https_options
                .extra_time(start_time.elapsed(), config.secure);
            https_timer = Some(Box::pin(tokio::time::sleep(extra)));
        }

        let outcome = match https_timer.as_mut() {
            Some(timer) => {
                tokio::select! {
                    _ = timer.as_mut() => {
                        tracing::debug!(
                            hostname = %config.hostname,
                            "supplemental https transaction timed out"
                        );
                        break;
                    }
                    outcome = in_flight.next() => outcome,
                }
            }
            None => in_flight.next().await,
        };
        if let Some((query_type, result)) = outcome {
            handle_outcome(
                job,
                query_type,
                result,
                &mut completed,
                wants_https,
                supplemental_https,
            )?;
        }
    }

    let merged = merge_completed(&completed);
    if !address_types.is_empty() && merged.addresses().is_empty() {
        // NOERROR with no usable records is still a negative result; its
        // TTL is kept so the failure can be cached.
        return Err(DnsTaskFailure {
            entry: CacheEntry::for_error(ResolveError::NameNotResolved, merged.ttl()),
            allow_fallback: true,
        });
    }

    let ttl = merged.ttl().map(|ttl| ttl.max(MIN_TTL));
    let entry = CacheEntry::for_success(
        sorter.sort(merged.addresses().to_vec()),
        EntrySource::Dns,
        ttl,
    )
    .with_aliases(merged.aliases().clone())
    .with_text_records(merged.text_records().to_vec())
    .with_hostnames(merged.hostnames().to_vec())
    .with_metadata(merged.metadata().to_vec());
    Ok(entry)
}

fn start_transaction(
    factory: &dyn DnsTransactionFactory,
    config: &DnsTaskConfig,
    query_type: QueryType,
    in_flight: &mut InFlight,
) {
    let future = factory.query(
        &config.hostname,
        query_type,
        config.secure,
        &config.anonymization_key,
    );
    in_flight.push(Box::pin(async move { (query_type, future.await) }));
}

// Applies the per-transaction error policy: address transactions fail
// the task with fallback allowed; HTTPS transactions synthesize an empty
// success, except the HTTPS-only signal which is fatal.
fn handle_outcome(
    job: &Weak<Job>,
    query_type: QueryType,
    result: Result<CacheEntry, ResolveError>,
    completed: &mut Vec<(QueryType, CacheEntry)>,
    wants_https: bool,
    supplemental_https: bool,
) -> Result<(), DnsTaskFailure> {
    match result {
        Ok(entry) => completed.push((query_type, entry)),
        Err(ResolveError::HttpsOnly) => {
            return Err(DnsTaskFailure {
                entry: CacheEntry::for_error(ResolveError::HttpsOnly, None),
                allow_fallback: false,
            });
        }
        Err(error) if query_type == QueryType::Https && supplemental_https => {
            completed.push((
                query_type,
                CacheEntry::for_success(Vec::new(), EntrySource::Dns, None),
            ));
            tracing::debug!(?error, "https transaction failed; synthesizing empty result");
        }
        Err(error) => {
            return Err(DnsTaskFailure {
                entry: CacheEntry::for_error(error, None),
                allow_fallback: true,
            });
        }
    }

    if let Some(job) = job.upgrade() {
        let crypto_ready = !wants_https || type_completed(completed, QueryType::Https);
        job.on_intermediate_dns_results(&merge_completed(completed), crypto_ready);
    }
    Ok(())
}

fn addresses_done(address_types: &[QueryType], completed: &[(QueryType, CacheEntry)]) -> bool {
    address_types
        .iter()
        .all(|query_type| type_completed(completed, *query_type))
}

fn type_completed(completed: &[(QueryType, CacheEntry)], query_type: QueryType) -> bool {
    completed.iter().any(|(done, _)| *done == query_type)
}

// Merge per-type results with AAAA records sorting ahead of A, then
// supplemental record types.
fn merge_completed(completed: &[(QueryType, CacheEntry)]) -> CacheEntry {
    const MERGE_ORDER: [QueryType; 6] = [
        QueryType::Aaaa,
        QueryType::A,
        QueryType::Https,
        QueryType::Txt,
        QueryType::Srv,
        QueryType::Ptr,
    ];
    let mut merged: Option<CacheEntry> = None;
    for query_type in MERGE_ORDER {
        for (done, entry) in completed {
            if *done != query_type {
                continue;
            }
            merged = Some(match merged.take() {
                None => entry.clone(),
                Some(previous) => CacheEntry::merge(previous, entry.clone()),
            });
        }
    }
    merged.unwrap_or_else(|| CacheEntry::for_success(Vec::new(), EntrySource::Dns, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};

    fn success(ips: &[&str], ttl_secs: u64) -> CacheEntry {
        let addresses: Vec<SocketAddr> = ips
            .iter()
            .map(|ip| SocketAddr::new(ip.parse::<IpAddr>().unwrap(), 0))
            .collect();
        CacheEntry::for_success(addresses, EntrySource::Dns, Some(Duration::from_secs(ttl_secs)))
    }

    #[test]
    fn merge_orders_aaaa_before_a() {
        let completed = vec![
            (QueryType::A, success(&["1.1.1.1"], 300)),
            (QueryType::Aaaa, success(&["2001:db8::1"], 120)),
        ];
        let merged = merge_completed(&completed);
        let rendered: Vec<String> = merged
            .addresses()
            .iter()
            .map(|address| address.ip().to_string())
            .collect();
        assert_eq!(rendered, vec!["2001:db8::1", "1.1.1.1"]);
        assert_eq!(merged.ttl(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn empty_merge_is_an_empty_success() {
        let merged = merge_completed(&[]);
        assert!(merged.is_ok());
        assert!(merged.addresses().is_empty());
    }
}
