//! Routes enriched attrs to a set of target vaults.
//!
//! A full expression language is out of scope; `FilterRule` is a predicate
//! over attrs built from equality/prefix matchers, enough to realize
//! ordered evaluation, union of matching targets, and fan-out-when-empty.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;

use crate::id::VaultId;
use crate::record::Attrs;

#[derive(Clone, Debug)]
pub enum Matcher {
    Equals { key: String, value: String },
    Prefix { key: String, prefix: String },
}

impl Matcher {
    fn matches(&self, attrs: &Attrs) -> bool {
        match self {
            Matcher::Equals { key, value } => attrs.get(key).map_or(false, |v| v == value),
            Matcher::Prefix { key, prefix } => attrs.get(key).map_or(false, |v| v.starts_with(prefix.as_str())),
        }
    }
}

/// One routing rule: every matcher must hold (conjunction) for its targets
/// to be included in the route.
#[derive(Clone, Debug)]
pub struct FilterRule {
    pub matchers: Vec<Matcher>,
    pub targets: Vec<VaultId>,
}

impl FilterRule {
    fn matches(&self, attrs: &Attrs) -> bool {
        self.matchers.iter().all(|m| m.matches(attrs))
    }
}

/// Ordered rule list plus the enabled-vault set used for fan-out when no
/// rule is configured.
pub struct FilterSet {
    rules: Vec<FilterRule>,
    warned_empty: AtomicBool,
}

impl FilterSet {
    pub fn new(rules: Vec<FilterRule>) -> Self {
        Self { rules, warned_empty: AtomicBool::new(false) }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the union of every matching rule's targets, evaluated in
    /// rule order. If no rule is configured, fans out to every enabled
    /// vault and logs a one-time warning. Targets naming a disabled or
    /// nonexistent vault are silently dropped by the caller when it
    /// resolves ids to vaults.
    pub fn route(&self, attrs: &Attrs, enabled_vaults: &[VaultId]) -> BTreeSet<VaultId> {
        if self.rules.is_empty() {
            if !self.warned_empty.swap(true, Ordering::Relaxed) {
                warn!("no filter rules configured; fanning out every message to all enabled vaults");
            }
            return enabled_vaults.iter().copied().collect();
        }

        let mut targets = BTreeSet::new();
        for rule in &self.rules {
            if rule.matches(attrs) {
                targets.extend(rule.targets.iter().copied());
            }
        }
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> Attrs {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn no_rules_fans_out_to_every_enabled_vault() {
        let set = FilterSet::new(vec![]);
        let v1 = VaultId::new();
        let v2 = VaultId::new();
        let result = set.route(&attrs(&[("host", "a")]), &[v1, v2]);
        assert_eq!(result, BTreeSet::from([v1, v2]));
    }

    #[test]
    fn matching_rules_union_their_targets() {
        let v1 = VaultId::new();
        let v2 = VaultId::new();
        let v3 = VaultId::new();
        let rules = vec![
            FilterRule {
                matchers: vec![Matcher::Equals { key: "level".to_string(), value: "error".to_string() }],
                targets: vec![v1],
            },
            FilterRule {
                matchers: vec![Matcher::Prefix { key: "service".to_string(), prefix: "api".to_string() }],
                targets: vec![v2, v3],
            },
        ];
        let set = FilterSet::new(rules);
        let result = set.route(&attrs(&[("level", "error"), ("service", "api-gateway")]), &[]);
        assert_eq!(result, BTreeSet::from([v1, v2, v3]));
    }

    #[test]
    fn non_matching_rule_contributes_nothing() {
        let v1 = VaultId::new();
        let rules = vec![FilterRule {
            matchers: vec![Matcher::Equals { key: "level".to_string(), value: "error".to_string() }],
            targets: vec![v1],
        }];
        let set = FilterSet::new(rules);
        let result = set.route(&attrs(&[("level", "info")]), &[]);
        assert!(result.is_empty());
    }

    #[test]
    fn conjunction_requires_every_matcher() {
        let v1 = VaultId::new();
        let rules = vec![FilterRule {
            matchers: vec![
                Matcher::Equals { key: "level".to_string(), value: "error".to_string() },
                Matcher::Equals { key: "host".to_string(), value: "web1".to_string() },
            ],
            targets: vec![v1],
        }];
        let set = FilterSet::new(rules);
        assert!(set.route(&attrs(&[("level", "error")]), &[]).is_empty());
        assert!(!set.route(&attrs(&[("level", "error"), ("host", "web1")]), &[]).is_empty());
    }
}
