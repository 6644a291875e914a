//! Scripted collaborator fakes shared by the integration tests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use futures::future::LocalBoxFuture;

use host_cache::{
    AnonymizationKey, CacheEntry, CacheKey, EntrySource, HostKey, HttpsMetadata, KeyFlags,
    QueryType, QueryTypeSet, ResolveError, ResolveSource, SecureDnsMode,
};
use resolver::{
    Collaborators, DnsTransactionFactory, HostResolver, Ipv6PrioritySorter, MdnsClient,
    Nat64Synthesizer, ReachabilityProbe, ResolveParameters, ResolveRequest, StartOutcome,
    SystemResolver,
};

#[derive(Clone, Debug)]
pub enum DnsAnswer {
    /// Addresses split per family across the A and AAAA transactions.
    Addresses { ips: Vec<IpAddr>, ttl: Option<Duration> },
    Error(ResolveError),
    /// Never completes; the transaction hangs until cancelled.
    Hang,
}

pub struct FakeDns {
    answers: RefCell<HashMap<String, DnsAnswer>>,
    transactions: Cell<usize>,
    delay: Cell<Option<Duration>>,
}

impl FakeDns {
    pub fn new() -> Rc<Self> {
        Rc::new(FakeDns {
            answers: RefCell::new(HashMap::new()),
            transactions: Cell::new(0),
            delay: Cell::new(None),
        })
    }

    pub fn answer(&self, hostname: &str, ips: &[&str], ttl_secs: u64) {
        self.answers.borrow_mut().insert(
            hostname.to_string(),
            DnsAnswer::Addresses {
                ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                ttl: Some(Duration::from_secs(ttl_secs)),
            },
        );
    }

    pub fn fail(&self, hostname: &str, error: ResolveError) {
        self.answers
            .borrow_mut()
            .insert(hostname.to_string(), DnsAnswer::Error(error));
    }

    pub fn hang(&self, hostname: &str) {
        self.answers
            .borrow_mut()
            .insert(hostname.to_string(), DnsAnswer::Hang);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay.set(Some(delay));
    }

    pub fn transactions(&self) -> usize {
        self.transactions.get()
    }
}

impl DnsTransactionFactory for FakeDns {
    fn query(
        &self,
        hostname: &str,
        query_type: QueryType,
        _secure: bool,
        _anonymization_key: &AnonymizationKey,
    ) -> LocalBoxFuture<'static, Result<CacheEntry, ResolveError>> {
        self.transactions.set(self.transactions.get() + 1);
        let answer = self
            .answers
            .borrow()
            .get(hostname)
            .cloned()
            .unwrap_or(DnsAnswer::Error(ResolveError::NameNotResolved));
        let delay = self.delay.get();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match answer {
                DnsAnswer::Hang => futures::future::pending().await,
                DnsAnswer::Error(error) => Err(error),
                DnsAnswer::Addresses { ips, ttl } => match query_type {
                    QueryType::A | QueryType::Aaaa => {
                        let want_v4 = query_type == QueryType::A;
                        let addresses: Vec<SocketAddr> = ips
                            .into_iter()
                            .filter(|ip| ip.is_ipv4() == want_v4)
                            .map(|ip| SocketAddr::new(ip, 0))
                            .collect();
                        Ok(CacheEntry::for_success(addresses, EntrySource::Dns, ttl))
                    }
                    QueryType::Https => Ok(CacheEntry::for_success(
                        Vec::new(),
                        EntrySource::Dns,
                        ttl,
                    )
                    .with_metadata(vec![HttpsMetadata {
                        priority: 1,
                        target_name: ".".to_string(),
                        alpns: vec!["h2".to_string()],
                    }])),
                    _ => Ok(CacheEntry::for_success(Vec::new(), EntrySource::Dns, ttl)),
                },
            }
        })
    }
}

pub struct FakeSystem {
    answers: RefCell<HashMap<String, Vec<IpAddr>>>,
    hangs: RefCell<Vec<String>>,
    calls: Cell<usize>,
}

impl FakeSystem {
    pub fn new() -> Rc<Self> {
        Rc::new(FakeSystem {
            answers: RefCell::new(HashMap::new()),
            hangs: RefCell::new(Vec::new()),
            calls: Cell::new(0),
        })
    }

    pub fn answer(&self, hostname: &str, ips: &[&str]) {
        self.answers.borrow_mut().insert(
            hostname.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
    }

    pub fn hang(&self, hostname: &str) {
        self.hangs.borrow_mut().push(hostname.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl SystemResolver for FakeSystem {
    fn resolve(
        &self,
        hostname: &str,
        _flags: KeyFlags,
        _max_retry_attempts: u32,
    ) -> LocalBoxFuture<'static, Result<Vec<IpAddr>, ResolveError>> {
        self.calls.set(self.calls.get() + 1);
        if self.hangs.borrow().iter().any(|hang| hang == hostname) {
            return Box::pin(futures::future::pending());
        }
        let answer = self.answers.borrow().get(hostname).cloned();
        Box::pin(async move { answer.ok_or(ResolveError::NameNotResolved) })
    }
}

pub struct FakeProbe {
    cached: Cell<Option<bool>>,
    probe_result: Cell<bool>,
}

impl FakeProbe {
    pub fn new(cached: Option<bool>) -> Rc<Self> {
        Rc::new(FakeProbe {
            cached: Cell::new(cached),
            probe_result: Cell::new(true),
        })
    }

    pub fn set_probe_result(&self, reachable: bool) {
        self.probe_result.set(reachable);
    }

    pub fn set_cached(&self, cached: Option<bool>) {
        self.cached.set(cached);
    }
}

impl ReachabilityProbe for FakeProbe {
    fn cached(&self) -> Option<bool> {
        self.cached.get()
    }

    fn probe(&self) -> LocalBoxFuture<'static, bool> {
        let result = self.probe_result.get();
        // The probe result becomes the cached verdict, like a real probe.
        self.cached.set(Some(result));
        Box::pin(async move { result })
    }
}

/// Synthesizes through the well-known 64:ff9b::/96 prefix, or reports no
/// prefix at all.
pub struct FakeNat64 {
    prefix_available: Cell<bool>,
    calls: Cell<usize>,
}

impl FakeNat64 {
    pub fn new(prefix_available: bool) -> Rc<Self> {
        Rc::new(FakeNat64 {
            prefix_available: Cell::new(prefix_available),
            calls: Cell::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Nat64Synthesizer for FakeNat64 {
    fn synthesize(&self, address: Ipv4Addr) -> LocalBoxFuture<'static, Option<Vec<IpAddr>>> {
        self.calls.set(self.calls.get() + 1);
        let available = self.prefix_available.get();
        Box::pin(async move {
            available.then(|| {
                let [a, b, c, d] = address.octets();
                vec![IpAddr::V6(Ipv6Addr::new(
                    0x64,
                    0xff9b,
                    0,
                    0,
                    0,
                    0,
                    u16::from_be_bytes([a, b]),
                    u16::from_be_bytes([c, d]),
                ))]
            })
        })
    }
}

pub struct FakeMdns {
    answers: RefCell<HashMap<String, Vec<IpAddr>>>,
    calls: Cell<usize>,
}

impl FakeMdns {
    pub fn new() -> Rc<Self> {
        Rc::new(FakeMdns {
            answers: RefCell::new(HashMap::new()),
            calls: Cell::new(0),
        })
    }

    pub fn answer(&self, hostname: &str, ips: &[&str]) {
        self.answers.borrow_mut().insert(
            hostname.to_string(),
            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        );
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl MdnsClient for FakeMdns {
    fn resolve(
        &self,
        hostname: &str,
        query_type: QueryType,
    ) -> LocalBoxFuture<'static, Result<CacheEntry, ResolveError>> {
        self.calls.set(self.calls.get() + 1);
        let answer = self.answers.borrow().get(hostname).cloned();
        Box::pin(async move {
            let ips = answer.ok_or(ResolveError::NameNotResolved)?;
            let want_v4 = query_type == QueryType::A;
            let addresses: Vec<SocketAddr> = ips
                .into_iter()
                .filter(|ip| ip.is_ipv4() == want_v4)
                .map(|ip| SocketAddr::new(ip, 0))
                .collect();
            Ok(CacheEntry::for_success(
                addresses,
                EntrySource::Unknown,
                None,
            ))
        })
    }
}

pub struct Fakes {
    pub dns: Rc<FakeDns>,
    pub system: Rc<FakeSystem>,
    pub probe: Rc<FakeProbe>,
}

pub fn fakes() -> Fakes {
    // Honor RUST_LOG when a test run wants pipeline traces.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Fakes {
        dns: FakeDns::new(),
        system: FakeSystem::new(),
        probe: FakeProbe::new(Some(true)),
    }
}

pub fn collaborators(fakes: &Fakes) -> Collaborators {
    collaborators_with(fakes, None, None)
}

pub fn collaborators_with(
    fakes: &Fakes,
    mdns: Option<Rc<FakeMdns>>,
    nat64: Option<Rc<FakeNat64>>,
) -> Collaborators {
    Collaborators {
        dns: fakes.dns.clone(),
        system: fakes.system.clone(),
        mdns: mdns.map(|mdns| mdns as Rc<dyn MdnsClient>),
        ipv6_probe: fakes.probe.clone(),
        nat64: nat64.map(|nat64| nat64 as Rc<dyn Nat64Synthesizer>),
        sorter: Rc::new(Ipv6PrioritySorter),
    }
}

/// The cache key a default-parameter request for `host:port` derives on
/// an IPv6-reachable network with secure DNS off.
pub fn default_cache_key(host: &str, port: u16) -> CacheKey {
    CacheKey {
        host: HostKey::for_pair(host, port).unwrap(),
        query_types: QueryTypeSet::of(&[QueryType::A, QueryType::Aaaa]),
        flags: KeyFlags::NONE,
        source: ResolveSource::Any,
        secure_dns_mode: SecureDnsMode::Off,
        anonymization_key: AnonymizationKey::empty(),
        secure: false,
    }
}

pub fn success_entry(ips: &[&str]) -> CacheEntry {
    let addresses: Vec<SocketAddr> = ips
        .iter()
        .map(|ip| format!("{ip}:0").parse().unwrap())
        .collect();
    CacheEntry::for_success(addresses, EntrySource::Dns, None)
}

/// Starts a request and drives it to completion, returning the request
/// for result inspection alongside the completion result.
pub async fn resolve(
    resolver: &dyn HostResolver,
    host: &str,
    port: u16,
    parameters: ResolveParameters,
) -> (Box<dyn ResolveRequest>, Result<(), ResolveError>) {
    let mut request = resolver.create_request(
        HostKey::for_pair(host, port).unwrap(),
        AnonymizationKey::empty(),
        parameters,
    );
    let result = match request.start() {
        StartOutcome::Finished(result) => result,
        StartOutcome::Pending => request.wait().await,
    };
    (request, result)
}

pub fn ips(request: &dyn ResolveRequest) -> Vec<String> {
    request
        .address_results()
        .unwrap_or_default()
        .iter()
        .map(|address| address.ip().to_string())
        .collect()
}
