use std::cell::RefCell;
use std::collections::BTreeSet;

use futures::future::LocalBoxFuture;

use host_cache::{AnonymizationKey, CacheEntry, HostKey, ResolveError, Staleness};

use crate::error::ResolveErrorInfo;
use crate::params::{RequestPriority, ResolveParameters};
use crate::{
    HostResolver, ResolveRequest, ServiceEndpointDelegate, ServiceEndpointRequest, StartOutcome,
};

/// The literal replacement which maps matches to an immediate
/// `NameNotResolved` failure.
const NOTFOUND_REPLACEMENT: &str = "^NOTFOUND";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("unrecognized rule format")]
    Malformed,
    #[error("invalid replacement port")]
    BadPort,
}

#[derive(Clone, Debug)]
enum MappingRule {
    Map {
        pattern: String,
        replacement_host: String,
        replacement_port: Option<u16>,
    },
    Exclude {
        pattern: String,
    },
}

enum RewriteResult {
    Rewritten(HostKey),
    NotFound,
    NoMatch,
}

/// Host rewriting rules:
///
/// ```text
/// MAP <hostname_pattern> <replacement_host>[:<replacement_port>]
/// EXCLUDE <hostname_pattern>
/// ```
///
/// Patterns support `*` wildcards and match the hostname, or
/// `hostname:port` when the pattern itself contains a colon. The first
/// matching rule wins; the replacement `^NOTFOUND` fails the lookup.
#[derive(Clone, Debug, Default)]
pub struct HostMappingRules {
    rules: Vec<MappingRule>,
}

impl HostMappingRules {
    pub fn add_rule_from_string(&mut self, rule: &str) -> Result<(), RuleParseError> {
        let mut tokens = rule.trim().split_whitespace();
        let keyword = tokens.next().ok_or(RuleParseError::Malformed)?;
        let rule = match keyword.to_ascii_uppercase().as_str() {
            "MAP" => {
                let pattern = tokens.next().ok_or(RuleParseError::Malformed)?;
                let replacement = tokens.next().ok_or(RuleParseError::Malformed)?;
                let (replacement_host, replacement_port) = if replacement == NOTFOUND_REPLACEMENT {
                    (replacement.to_string(), None)
                } else {
                    let (host, port) = split_host_port(replacement)?;
                    (host.to_ascii_lowercase(), port)
                };
                MappingRule::Map {
                    pattern: pattern.to_ascii_lowercase(),
                    replacement_host,
                    replacement_port,
                }
            }
            "EXCLUDE" => {
                let pattern = tokens.next().ok_or(RuleParseError::Malformed)?;
                MappingRule::Exclude {
                    pattern: pattern.to_ascii_lowercase(),
                }
            }
            _ => return Err(RuleParseError::Malformed),
        };
        if tokens.next().is_some() {
            return Err(RuleParseError::Malformed);
        }
        self.rules.push(rule);
        Ok(())
    }

    /// Replaces the rule set with a comma-separated list; rules which do
    /// not parse are skipped.
    pub fn set_rules_from_string(&mut self, rules: &str) {
        self.rules.clear();
        for rule in rules.split(',') {
            if rule.trim().is_empty() {
                continue;
            }
            if let Err(error) = self.add_rule_from_string(rule) {
                tracing::warn!(rule, %error, "skipping unparseable host mapping rule");
            }
        }
    }

    fn rewrite(&self, host: &HostKey) -> RewriteResult {
        let hostname = host.hostname();
        let host_port = format!("{}:{}", hostname, host.port());
        for rule in &self.rules {
            match rule {
                MappingRule::Exclude { pattern } => {
                    if pattern_matches(pattern, hostname, &host_port) {
                        return RewriteResult::NoMatch;
                    }
                }
                MappingRule::Map {
                    pattern,
                    replacement_host,
                    replacement_port,
                } => {
                    if !pattern_matches(pattern, hostname, &host_port) {
                        continue;
                    }
                    if replacement_host == NOTFOUND_REPLACEMENT {
                        return RewriteResult::NotFound;
                    }
                    return match host.with_replacement(replacement_host, *replacement_port) {
                        Ok(rewritten) => RewriteResult::Rewritten(rewritten),
                        // An unusable replacement behaves like ^NOTFOUND.
                        Err(_) => RewriteResult::NotFound,
                    };
                }
            }
        }
        RewriteResult::NoMatch
    }
}

// Patterns with a colon match against "host:port", others against the
// bare hostname.
fn pattern_matches(pattern: &str, hostname: &str, host_port: &str) -> bool {
    if pattern.contains(':') {
        matches_wildcard(pattern, host_port)
    } else {
        matches_wildcard(pattern, hostname)
    }
}

fn matches_wildcard(pattern: &str, text: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == text,
        Some((prefix, remainder)) => {
            let Some(stripped) = text.strip_prefix(prefix) else {
                return false;
            };
            if remainder.is_empty() {
                return true;
            }
            (0..=stripped.len())
                .filter(|index| stripped.is_char_boundary(*index))
                .any(|index| matches_wildcard(remainder, &stripped[index..]))
        }
    }
}

// Splits "host[:port]", with bracketed IPv6 literals supported.
fn split_host_port(replacement: &str) -> Result<(String, Option<u16>), RuleParseError> {
    if let Some(rest) = replacement.strip_prefix('[') {
        let end = rest.find(']').ok_or(RuleParseError::Malformed)?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(port) => Some(port.parse().map_err(|_| RuleParseError::BadPort)?),
            None if rest[end + 1..].is_empty() => None,
            None => return Err(RuleParseError::Malformed),
        };
        return Ok((host.to_string(), port));
    }
    match replacement.split_once(':') {
        Some((host, port)) if !port.contains(':') => {
            let port = port.parse().map_err(|_| RuleParseError::BadPort)?;
            Ok((host.to_string(), Some(port)))
        }
        // More than one colon without brackets: a bare IPv6 literal.
        Some(_) => Ok((replacement.to_string(), None)),
        None => Ok((replacement.to_string(), None)),
    }
}

/// Rewrites request hosts through [`HostMappingRules`] before handing
/// them to the wrapped resolver. Because remapping happens above the
/// cache, cache effectiveness is preserved for the rewritten host.
pub struct MappedResolver {
    inner: Box<dyn HostResolver>,
    rules: RefCell<HostMappingRules>,
}

impl MappedResolver {
    pub fn new(inner: Box<dyn HostResolver>) -> Self {
        MappedResolver {
            inner,
            rules: RefCell::new(HostMappingRules::default()),
        }
    }

    pub fn add_rule_from_string(&self, rule: &str) -> Result<(), RuleParseError> {
        self.rules.borrow_mut().add_rule_from_string(rule)
    }

    pub fn set_rules_from_string(&self, rules: &str) {
        self.rules.borrow_mut().set_rules_from_string(rules)
    }
}

impl HostResolver for MappedResolver {
    fn create_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ResolveRequest> {
        match self.rules.borrow().rewrite(&host) {
            RewriteResult::Rewritten(rewritten) => {
                tracing::debug!(from = %host, to = %rewritten, "host mapping applied");
                self.inner
                    .create_request(rewritten, anonymization_key, parameters)
            }
            RewriteResult::NotFound => Box::new(FailingRequest::new(ResolveError::NameNotResolved)),
            RewriteResult::NoMatch => self.inner.create_request(host, anonymization_key, parameters),
        }
    }

    fn create_service_endpoint_request(
        &self,
        host: HostKey,
        anonymization_key: AnonymizationKey,
        parameters: ResolveParameters,
    ) -> Box<dyn ServiceEndpointRequest> {
        match self.rules.borrow().rewrite(&host) {
            RewriteResult::Rewritten(rewritten) => self.inner.create_service_endpoint_request(
                rewritten,
                anonymization_key,
                parameters,
            ),
            RewriteResult::NotFound => {
                Box::new(FailingEndpointRequest::new(ResolveError::NameNotResolved))
            }
            RewriteResult::NoMatch => {
                self.inner
                    .create_service_endpoint_request(host, anonymization_key, parameters)
            }
        }
    }

    fn on_shutdown(&self) {
        self.inner.on_shutdown()
    }
}

/// A request which fails synchronously at start and never resolves
/// anything.
struct FailingRequest {
    error: ResolveError,
    started: bool,
}

impl FailingRequest {
    fn new(error: ResolveError) -> Self {
        FailingRequest {
            error,
            started: false,
        }
    }
}

impl ResolveRequest for FailingRequest {
    fn start(&mut self) -> StartOutcome {
        self.started = true;
        StartOutcome::Finished(Err(self.error.squash()))
    }

    fn wait(&mut self) -> LocalBoxFuture<'_, Result<(), ResolveError>> {
        let error = self.error;
        Box::pin(async move { Err(error.squash()) })
    }

    fn result_entry(&self) -> Option<&CacheEntry> {
        None
    }

    fn error_info(&self) -> ResolveErrorInfo {
        ResolveErrorInfo::from_error(self.error)
    }

    fn stale_info(&self) -> Option<&Staleness> {
        None
    }

    fn change_priority(&mut self, _priority: RequestPriority) {}
}

struct FailingEndpointRequest {
    error: ResolveError,
}

impl FailingEndpointRequest {
    fn new(error: ResolveError) -> Self {
        FailingEndpointRequest { error }
    }
}

impl ServiceEndpointRequest for FailingEndpointRequest {
    fn start(&mut self, _delegate: std::rc::Rc<dyn ServiceEndpointDelegate>) -> StartOutcome {
        StartOutcome::Finished(Err(self.error.squash()))
    }

    fn endpoint_results(&self) -> Vec<crate::EndpointResult> {
        Vec::new()
    }

    fn dns_alias_results(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn endpoints_crypto_ready(&self) -> bool {
        false
    }

    fn error_info(&self) -> ResolveErrorInfo {
        ResolveErrorInfo::from_error(self.error)
    }

    fn change_priority(&mut self, _priority: RequestPriority) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(text: &str) -> HostMappingRules {
        let mut rules = HostMappingRules::default();
        rules.set_rules_from_string(text);
        rules
    }

    fn rewrite(rules: &HostMappingRules, hostname: &str, port: u16) -> Option<String> {
        match rules.rewrite(&HostKey::for_pair(hostname, port).unwrap()) {
            RewriteResult::Rewritten(host) => Some(host.to_string()),
            RewriteResult::NotFound => Some("<notfound>".to_string()),
            RewriteResult::NoMatch => None,
        }
    }

    #[test]
    fn map_replaces_host_and_optionally_port() {
        let rules = rules("MAP *.example.com proxy:99, MAP plain.test backend.test");
        assert_eq!(
            rewrite(&rules, "www.example.com", 80),
            Some("proxy:99".to_string())
        );
        assert_eq!(
            rewrite(&rules, "plain.test", 8080),
            Some("backend.test:8080".to_string())
        );
        assert_eq!(rewrite(&rules, "other.test", 80), None);
    }

    #[test]
    fn exclude_wins_over_later_maps() {
        let rules = rules("EXCLUDE www.example.com, MAP *.example.com proxy");
        assert_eq!(rewrite(&rules, "www.example.com", 80), None);
        assert_eq!(
            rewrite(&rules, "api.example.com", 80),
            Some("proxy:80".to_string())
        );
    }

    #[test]
    fn notfound_fails_the_match() {
        let rules = rules("MAP blocked.test ^NOTFOUND");
        assert_eq!(
            rewrite(&rules, "blocked.test", 443),
            Some("<notfound>".to_string())
        );
    }

    #[test]
    fn patterns_with_ports_match_host_port() {
        let rules = rules("MAP *.example.com:99 secure-proxy");
        assert_eq!(rewrite(&rules, "www.example.com", 80), None);
        assert_eq!(
            rewrite(&rules, "www.example.com", 99),
            Some("secure-proxy:99".to_string())
        );
    }

    #[test]
    fn ipv6_replacements_parse_with_and_without_port() {
        let rules = rules("MAP a.test [2001:db8::1]:8080, MAP b.test [2001:db8::2]");
        assert_eq!(
            rewrite(&rules, "a.test", 80),
            Some("2001:db8::1:8080".to_string())
        );
        assert_eq!(
            rewrite(&rules, "b.test", 80),
            Some("2001:db8::2:80".to_string())
        );
    }

    #[test]
    fn invalid_rules_report_errors() {
        let mut rules = HostMappingRules::default();
        assert_eq!(
            rules.add_rule_from_string("REMAP a b"),
            Err(RuleParseError::Malformed)
        );
        assert_eq!(
            rules.add_rule_from_string("MAP a.test b.test:notaport"),
            Err(RuleParseError::BadPort)
        );
        assert_eq!(
            rules.add_rule_from_string("MAP onlypattern"),
            Err(RuleParseError::Malformed)
        );
        assert_eq!(
            rules.add_rule_from_string("MAP a b c"),
            Err(RuleParseError::Malformed)
        );
    }

    #[test]
    fn wildcard_matching_is_greedy_enough() {
        assert!(matches_wildcard("*.example.com", "a.b.example.com"));
        assert!(matches_wildcard("*", "anything"));
        assert!(matches_wildcard("a*c", "abc"));
        assert!(matches_wildcard("a*c", "ac"));
        assert!(!matches_wildcard("a*c", "ab"));
        assert!(!matches_wildcard("*.example.com", "example.com"));
    }
}
