//! Fact extractor registry: maps an artifact name to exactly one rule that
//! turns the artifact text into proposed host-fact updates.
//!
//! Rules are pure. Registration is validated once at startup so that no
//! artifact name can be claimed by two rules; dispatch is then first-match.

use std::fmt;

use hinv_core::FactUpdate;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub mod rules;

pub use rules::builtin_registry;

pub const CRATE_NAME: &str = "hinv-extractors";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid name pattern for rule {rule}: {source}")]
    InvalidPattern {
        rule: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("pattern rule {rule} must declare at least one sample name")]
    MissingSamples { rule: &'static str },
    #[error("sample {sample:?} of rule {rule} does not match its own pattern")]
    SampleMismatch { rule: &'static str, sample: String },
    #[error("artifact name {name:?} is claimed by both {first} and {second}")]
    Ambiguous {
        name: String,
        first: &'static str,
        second: &'static str,
    },
}

/// Pure classification rule for one artifact kind.
pub trait FactExtractor: Send + Sync {
    fn rule_id(&self) -> &'static str;

    /// Proposed updates for this artifact. No match is `vec![]`, never an error.
    fn extract(&self, name: &str, content: &str) -> Vec<FactUpdate>;
}

/// Adapts a plain function into a [`FactExtractor`].
#[derive(Clone, Copy)]
pub struct FnExtractor {
    rule_id: &'static str,
    extract: fn(&str, &str) -> Vec<FactUpdate>,
}

impl FnExtractor {
    pub const fn new(rule_id: &'static str, extract: fn(&str, &str) -> Vec<FactUpdate>) -> Self {
        Self { rule_id, extract }
    }
}

impl FactExtractor for FnExtractor {
    fn rule_id(&self) -> &'static str {
        self.rule_id
    }

    fn extract(&self, name: &str, content: &str) -> Vec<FactUpdate> {
        (self.extract)(name, content)
    }
}

/// How a rule claims artifact names.
#[derive(Debug, Clone)]
pub enum ArtifactMatcher {
    Exact(String),
    /// Samples are representative names used to prove at startup that the
    /// pattern does not overlap any other rule.
    Pattern { regex: Regex, samples: Vec<String> },
}

impl ArtifactMatcher {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            ArtifactMatcher::Exact(exact) => exact == name,
            ArtifactMatcher::Pattern { regex, .. } => regex.is_match(name),
        }
    }

    fn probes(&self) -> Vec<&str> {
        match self {
            ArtifactMatcher::Exact(exact) => vec![exact.as_str()],
            ArtifactMatcher::Pattern { samples, .. } => samples.iter().map(String::as_str).collect(),
        }
    }
}

impl fmt::Display for ArtifactMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactMatcher::Exact(name) => write!(f, "{name:?}"),
            ArtifactMatcher::Pattern { regex, .. } => write!(f, "/{}/", regex.as_str()),
        }
    }
}

pub struct RegisteredRule {
    matcher: ArtifactMatcher,
    extractor: Box<dyn FactExtractor>,
}

impl RegisteredRule {
    pub fn rule_id(&self) -> &'static str {
        self.extractor.rule_id()
    }
}

impl fmt::Debug for RegisteredRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRule")
            .field("rule_id", &self.rule_id())
            .field("matcher", &self.matcher.to_string())
            .finish()
    }
}

enum PendingMatcher {
    Exact(String),
    Pattern { pattern: String, samples: Vec<String> },
}

#[derive(Default)]
pub struct RegistryBuilder {
    pending: Vec<(PendingMatcher, Box<dyn FactExtractor>)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exact(mut self, name: impl Into<String>, extractor: impl FactExtractor + 'static) -> Self {
        self.pending
            .push((PendingMatcher::Exact(name.into()), Box::new(extractor)));
        self
    }

    pub fn pattern(
        mut self,
        pattern: impl Into<String>,
        samples: &[&str],
        extractor: impl FactExtractor + 'static,
    ) -> Self {
        self.pending.push((
            PendingMatcher::Pattern {
                pattern: pattern.into(),
                samples: samples.iter().map(|s| s.to_string()).collect(),
            },
            Box::new(extractor),
        ));
        self
    }

    /// Compiles patterns and rejects any registration set in which one
    /// artifact name could reach two rules.
    pub fn build(self) -> Result<ExtractorRegistry, RegistryError> {
        let mut rules = Vec::with_capacity(self.pending.len());
        for (pending, extractor) in self.pending {
            let rule = extractor.rule_id();
            let matcher = match pending {
                PendingMatcher::Exact(name) => ArtifactMatcher::Exact(name),
                PendingMatcher::Pattern { pattern, samples } => {
                    let regex = Regex::new(&pattern)
                        .map_err(|source| RegistryError::InvalidPattern { rule, source })?;
                    if samples.is_empty() {
                        return Err(RegistryError::MissingSamples { rule });
                    }
                    if let Some(bad) = samples.iter().find(|s| !regex.is_match(s)) {
                        return Err(RegistryError::SampleMismatch {
                            rule,
                            sample: bad.clone(),
                        });
                    }
                    ArtifactMatcher::Pattern { regex, samples }
                }
            };
            rules.push(RegisteredRule { matcher, extractor });
        }

        for (i, owner) in rules.iter().enumerate() {
            for probe in owner.matcher.probes() {
                if let Some((_, other)) = rules
                    .iter()
                    .enumerate()
                    .find(|(j, other)| *j != i && other.matcher.matches(probe))
                {
                    return Err(RegistryError::Ambiguous {
                        name: probe.to_string(),
                        first: owner.rule_id(),
                        second: other.rule_id(),
                    });
                }
            }
        }

        Ok(ExtractorRegistry { rules })
    }
}

/// Outcome of classifying one artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub rule_id: Option<&'static str>,
    pub updates: Vec<FactUpdate>,
}

#[derive(Debug)]
pub struct ExtractorRegistry {
    rules: Vec<RegisteredRule>,
}

impl ExtractorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn rules(&self) -> &[RegisteredRule] {
        &self.rules
    }

    pub fn rule_for(&self, name: &str) -> Option<&RegisteredRule> {
        self.rules.iter().find(|rule| rule.matcher.matches(name))
    }

    /// Runs the single rule claiming `name`, dropping empty updates.
    /// Unknown names classify to nothing; that is the common case.
    pub fn classify(&self, name: &str, content: &str) -> Classification {
        let Some(rule) = self.rule_for(name) else {
            return Classification::default();
        };
        let updates: Vec<FactUpdate> = rule
            .extractor
            .extract(name, content)
            .into_iter()
            .filter(|u| !u.is_empty())
            .collect();
        debug!(rule = rule.rule_id(), name, updates = updates.len(), "classified artifact");
        Classification {
            rule_id: Some(rule.rule_id()),
            updates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hinv_core::HostFact;

    fn constant_os(_name: &str, _content: &str) -> Vec<FactUpdate> {
        vec![FactUpdate::new().set(HostFact::Os, "TestOS")]
    }

    fn nothing(_name: &str, _content: &str) -> Vec<FactUpdate> {
        vec![FactUpdate::new()]
    }

    #[test]
    fn duplicate_exact_names_are_rejected() {
        let err = ExtractorRegistry::builder()
            .exact("/etc/issue", FnExtractor::new("issue-a", constant_os))
            .exact("/etc/issue", FnExtractor::new("issue-b", constant_os))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Ambiguous { first: "issue-a", second: "issue-b", .. }));
    }

    #[test]
    fn pattern_claiming_an_exact_name_is_rejected() {
        let err = ExtractorRegistry::builder()
            .exact("/etc/os-release", FnExtractor::new("os-release", constant_os))
            .pattern(r"^/etc/.*-release$", &["/etc/system-release"], FnExtractor::new("any-release", constant_os))
            .build()
            .unwrap_err();
        match err {
            RegistryError::Ambiguous { name, .. } => assert_eq!(name, "/etc/os-release"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn overlapping_patterns_are_rejected_via_samples() {
        let err = ExtractorRegistry::builder()
            .pattern(r"^/var/log/", &["/var/log/messages"], FnExtractor::new("logs", constant_os))
            .pattern(r"messages$", &["/tmp/messages"], FnExtractor::new("messages", constant_os))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Ambiguous { .. }));
    }

    #[test]
    fn pattern_rules_need_matching_samples() {
        let missing = ExtractorRegistry::builder()
            .pattern(r"^/opt/", &[], FnExtractor::new("opt", constant_os))
            .build()
            .unwrap_err();
        assert!(matches!(missing, RegistryError::MissingSamples { rule: "opt" }));

        let mismatch = ExtractorRegistry::builder()
            .pattern(r"^/opt/", &["/srv/x"], FnExtractor::new("opt", constant_os))
            .build()
            .unwrap_err();
        assert!(matches!(mismatch, RegistryError::SampleMismatch { .. }));

        let invalid = ExtractorRegistry::builder()
            .pattern(r"^/opt/(", &["/opt/x"], FnExtractor::new("opt", constant_os))
            .build()
            .unwrap_err();
        assert!(matches!(invalid, RegistryError::InvalidPattern { .. }));
    }

    #[test]
    fn classify_dispatches_and_drops_empty_updates() {
        let registry = ExtractorRegistry::builder()
            .exact("/etc/issue", FnExtractor::new("issue", constant_os))
            .exact("/etc/motd", FnExtractor::new("motd", nothing))
            .build()
            .unwrap();

        let hit = registry.classify("/etc/issue", "");
        assert_eq!(hit.rule_id, Some("issue"));
        assert_eq!(hit.updates.len(), 1);

        let empty = registry.classify("/etc/motd", "anything");
        assert_eq!(empty.rule_id, Some("motd"));
        assert!(empty.updates.is_empty());

        assert_eq!(registry.classify("/etc/hosts", "127.0.0.1"), Classification::default());
    }
}
