//! Metric filter: classifies samples into cost/observability/dropped sinks.
//!
//! Pure and synchronous — no I/O, no locking. See model.rs for the rule
//! and sample types this operates on.

use regex::Regex;

use crate::model::{FilterRule, MatchKind, Sample};

/// The four ordered rule lists that drive classification.
#[derive(Debug, Clone, Default)]
pub struct FilterConfig {
    pub cost_names: Vec<FilterRule>,
    pub observability_names: Vec<FilterRule>,
    pub cost_labels: Vec<FilterRule>,
    pub observability_labels: Vec<FilterRule>,
}

/// Result of classifying a batch: three ordered lists, each preserving
/// input order, each sample appearing at most once per sink.
#[derive(Debug, Default)]
pub struct Classified {
    pub cost: Vec<Sample>,
    pub observability: Vec<Sample>,
    pub dropped: Vec<Sample>,
}

fn rule_matches(rule: &FilterRule, value: &str) -> bool {
    match rule.match_kind {
        MatchKind::Exact => rule.pattern == value,
        MatchKind::Prefix => value.starts_with(&rule.pattern),
        MatchKind::Substring => value.contains(&rule.pattern),
        MatchKind::Regex => Regex::new(&rule.pattern)
            .map(|re| re.is_match(value))
            .unwrap_or(false),
    }
}

fn any_matches(rules: &[FilterRule], value: &str) -> bool {
    rules.iter().any(|r| rule_matches(r, value))
}

/// `labels` restricted to keys matching at least one rule's pattern.
fn apply_label_filter(sample: &Sample, rules: &[FilterRule]) -> Sample {
    if rules.is_empty() {
        return sample.clone();
    }
    let mut out = sample.clone();
    out.labels.retain(|k, _| any_matches(rules, k));
    out
}

impl FilterConfig {
    fn is_pass_through(&self) -> bool {
        self.cost_names.is_empty()
            && self.observability_names.is_empty()
            && self.cost_labels.is_empty()
            && self.observability_labels.is_empty()
    }

    /// Classify a single sample, returning which sinks it lands in (in
    /// fixed cost-then-observability order) with labels already rewritten.
    pub fn classify_one(&self, sample: &Sample) -> (Option<Sample>, Option<Sample>) {
        if self.is_pass_through() {
            return (Some(sample.clone()), Some(sample.clone()));
        }

        let is_cost = self.cost_names.is_empty() || any_matches(&self.cost_names, &sample.metric_name);
        let is_obs = self.observability_names.is_empty()
            || any_matches(&self.observability_names, &sample.metric_name);

        let cost = is_cost.then(|| apply_label_filter(sample, &self.cost_labels));
        let obs = is_obs.then(|| apply_label_filter(sample, &self.observability_labels));
        (cost, obs)
    }

    /// Classify a batch, preserving input order within each output sink.
    pub fn classify(&self, samples: &[Sample]) -> Classified {
        let mut out = Classified::default();
        for sample in samples {
            let (cost, obs) = self.classify_one(sample);
            let mut kept = false;
            if let Some(s) = cost {
                out.cost.push(s);
                kept = true;
            }
            if let Some(s) = obs {
                out.observability.push(s);
                kept = true;
            }
            if !kept {
                out.dropped.push(sample.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn sample(name: &str, labels: &[(&str, &str)]) -> Sample {
        Sample {
            id: Uuid::new_v4(),
            metric_name: name.to_string(),
            cluster_name: "cluster".into(),
            cloud_account_id: "acct".into(),
            node_name: "node".into(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            value: "1".into(),
            created_at: Utc::now(),
            timestamp: Utc::now(),
        }
    }

    fn rule(pattern: &str, kind: MatchKind) -> FilterRule {
        FilterRule {
            pattern: pattern.to_string(),
            match_kind: kind,
        }
    }

    #[test]
    fn pass_through_when_all_rules_empty() {
        let cfg = FilterConfig::default();
        let s = sample("anything", &[]);
        let out = cfg.classify(&[s.clone()]);
        assert_eq!(out.cost, vec![s.clone()]);
        assert_eq!(out.observability, vec![s]);
        assert!(out.dropped.is_empty());
    }

    #[test]
    fn dropped_when_neither_list_matches() {
        let cfg = FilterConfig {
            cost_names: vec![rule("foo", MatchKind::Exact)],
            observability_names: vec![rule("bar", MatchKind::Exact)],
            ..Default::default()
        };
        let s = sample("baz", &[]);
        let out = cfg.classify(&[s.clone()]);
        assert!(out.cost.is_empty());
        assert!(out.observability.is_empty());
        assert_eq!(out.dropped, vec![s]);
    }

    #[test]
    fn label_filter_restricts_keys() {
        let cfg = FilterConfig {
            cost_names: vec![rule("foo", MatchKind::Exact)],
            cost_labels: vec![rule("pod", MatchKind::Exact)],
            ..Default::default()
        };
        let s = sample("foo", &[("pod", "a"), ("node", "b")]);
        let out = cfg.classify(&[s]);
        assert_eq!(out.cost.len(), 1);
        assert_eq!(out.cost[0].labels.len(), 1);
        assert_eq!(out.cost[0].labels.get("pod"), Some(&"a".to_string()));
    }

    #[test]
    fn label_filter_idempotent() {
        let cfg = FilterConfig {
            cost_labels: vec![rule("pod", MatchKind::Exact)],
            ..Default::default()
        };
        let s = sample("foo", &[("pod", "a"), ("node", "b")]);
        let once = apply_label_filter(&s, &cfg.cost_labels);
        let twice = apply_label_filter(&once, &cfg.cost_labels);
        assert_eq!(once.labels, twice.labels);
    }

    #[test]
    fn preserves_order_and_classifies_both_sinks() {
        let cfg = FilterConfig {
            cost_names: vec![rule("foo", MatchKind::Prefix)],
            observability_names: vec![rule("foo", MatchKind::Prefix)],
            ..Default::default()
        };
        let a = sample("foo_a", &[]);
        let b = sample("foo_b", &[]);
        let out = cfg.classify(&[a.clone(), b.clone()]);
        assert_eq!(out.cost, vec![a.clone(), b.clone()]);
        assert_eq!(out.observability, vec![a, b]);
    }

    #[test]
    fn regex_rule_matches() {
        let cfg = FilterConfig {
            cost_names: vec![rule("^foo_[0-9]+$", MatchKind::Regex)],
            ..Default::default()
        };
        let matching = sample("foo_42", &[]);
        let nonmatching = sample("foo_bar", &[]);
        let out = cfg.classify(&[matching.clone(), nonmatching.clone()]);
        assert_eq!(out.cost, vec![matching]);
        assert!(!out.cost.contains(&nonmatching));
    }
}
