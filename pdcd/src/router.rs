//! Live traffic routing between baseline and canary targets.
//!
//! The request path calls [`TrafficRouter::route`] only; rule mutations
//! are administrative operations owned by the controller. Precedence per
//! request: whitelist (force canary) > blacklist (force baseline) >
//! configured rules by strategy > default target.

use crate::metrics;
use pdc_common::errors::ControlError;
use pdc_common::types::{
    MatchPredicate, RouteContext, RouteStrategy, RouterStats, TrafficRule, TARGET_CANARY,
};
use rand::Rng;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tracing::{debug, info};

/// Name of the rule the controller drives during a rollout.
const ROLLOUT_RULE: &str = "rollout-weight";

/// Priority of the rollout rule; evaluated before operator rules.
const ROLLOUT_RULE_PRIORITY: i32 = 1_000;

/// Header consulted by the header-based strategy for explicit routing.
const ROUTE_HEADER: &str = "x-route-to";

/// Cookie consulted by the cookie-based strategy for canary opt-in.
const CANARY_COOKIE: &str = "canary";

/// A traffic rule with its regex predicates compiled once.
#[derive(Debug)]
struct CompiledRule {
    rule: TrafficRule,
    regexes: HashMap<String, Regex>,
}

impl CompiledRule {
    fn compile(rule: TrafficRule) -> Result<Self, ControlError> {
        let mut regexes = HashMap::new();
        if let Some(condition) = &rule.condition {
            for (key, predicate) in condition {
                if let MatchPredicate::Regex(pattern) = predicate {
                    let compiled = Regex::new(pattern).map_err(|e| ControlError::InvalidRule {
                        name: rule.name.clone(),
                        reason: e.to_string(),
                    })?;
                    regexes.insert(key.clone(), compiled);
                }
            }
        }
        Ok(Self { rule, regexes })
    }

    /// Whether every condition predicate holds for the context.
    ///
    /// An absent context value fails every predicate except `NotIn`,
    /// which treats absence as "not in the set".
    fn matches(&self, ctx: &RouteContext) -> bool {
        let Some(condition) = &self.rule.condition else {
            return true;
        };
        condition.iter().all(|(key, predicate)| {
            let value = ctx.value(key);
            match predicate {
                MatchPredicate::Equals(expected) => value == Some(expected.as_str()),
                MatchPredicate::In(set) => {
                    value.is_some_and(|v| set.iter().any(|item| item == v))
                }
                MatchPredicate::NotIn(set) => {
                    value.is_none_or(|v| !set.iter().any(|item| item == v))
                }
                MatchPredicate::Prefix(prefix) => value.is_some_and(|v| v.starts_with(prefix)),
                MatchPredicate::Regex(_) => value.is_some_and(|v| {
                    self.regexes.get(key).is_some_and(|re| re.is_match(v))
                }),
            }
        })
    }
}

/// Decides, per request, whether traffic goes to baseline or canary.
pub struct TrafficRouter {
    strategy: RouteStrategy,
    default_target: String,
    /// Enabled rules, kept sorted by descending priority.
    rules: RwLock<Vec<CompiledRule>>,
    whitelist: RwLock<HashSet<String>>,
    blacklist: RwLock<HashSet<String>>,
    stats: RwLock<HashMap<String, u64>>,
}

impl TrafficRouter {
    pub fn new(strategy: RouteStrategy, default_target: impl Into<String>) -> Self {
        Self {
            strategy,
            default_target: default_target.into(),
            rules: RwLock::new(Vec::new()),
            whitelist: RwLock::new(HashSet::new()),
            blacklist: RwLock::new(HashSet::new()),
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Register a rule, replacing any existing rule of the same name.
    pub fn add_rule(&self, rule: TrafficRule) -> Result<(), ControlError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        rules.retain(|r| r.rule.name != compiled.rule.name);
        info!(
            name = %compiled.rule.name,
            target = %compiled.rule.target,
            weight = compiled.rule.weight,
            "traffic rule registered"
        );
        rules.push(compiled);
        rules.sort_by(|a, b| b.rule.priority.cmp(&a.rule.priority));
        Ok(())
    }

    /// Remove a rule by name; unknown names are ignored.
    pub fn remove_rule(&self, name: &str) {
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        let before = rules.len();
        rules.retain(|r| r.rule.name != name);
        if rules.len() != before {
            info!(name, "traffic rule removed");
        }
    }

    /// Drive the canary share of traffic; the controller's single
    /// integration point. Weight 0 removes the rollout rule entirely.
    pub fn set_canary_weight(&self, weight: u8) {
        if weight == 0 {
            self.remove_rule(ROLLOUT_RULE);
            return;
        }
        // Compile never fails here: the rollout rule carries no condition.
        let _ = self.add_rule(TrafficRule {
            name: ROLLOUT_RULE.to_string(),
            target: TARGET_CANARY.to_string(),
            weight: weight.min(100),
            condition: None,
            priority: ROLLOUT_RULE_PRIORITY,
            enabled: true,
        });
    }

    /// Force an identity to the canary regardless of strategy or weight.
    pub fn add_to_whitelist(&self, user_id: impl Into<String>) {
        self.whitelist
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.into());
    }

    /// Force an identity to the baseline regardless of strategy.
    pub fn add_to_blacklist(&self, user_id: impl Into<String>) {
        self.blacklist
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.into());
    }

    /// Route one request to a target name.
    pub fn route(&self, ctx: &RouteContext) -> String {
        let target = self.decide(ctx);

        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        *stats.entry(target.clone()).or_insert(0) += 1;
        drop(stats);
        metrics::record_route(&target);

        target
    }

    fn decide(&self, ctx: &RouteContext) -> String {
        if !ctx.user_id.is_empty() {
            if self
                .whitelist
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&ctx.user_id)
            {
                return TARGET_CANARY.to_string();
            }
            if self
                .blacklist
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&ctx.user_id)
            {
                return self.default_target.clone();
            }
        }

        match self.strategy {
            RouteStrategy::Random => self.route_random(),
            RouteStrategy::Weighted => self.route_weighted(ctx),
            RouteStrategy::HeaderBased => self.route_by_header(ctx),
            RouteStrategy::CookieBased => self.route_by_cookie(ctx),
            RouteStrategy::UserBased => self.route_hashed(&ctx.user_id),
            RouteStrategy::IpBased => self.route_hashed(&ctx.client_ip),
        }
    }

    /// Weighted pick across all enabled rules, ignoring conditions.
    fn route_random(&self) -> String {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let total: u32 = rules
            .iter()
            .filter(|r| r.rule.enabled)
            .map(|r| u32::from(r.rule.weight))
            .sum();
        if total == 0 {
            return self.default_target.clone();
        }

        let roll = rand::rng().random_range(1..=total);
        let mut cumulative = 0u32;
        for rule in rules.iter().filter(|r| r.rule.enabled) {
            cumulative += u32::from(rule.rule.weight);
            if roll <= cumulative {
                return rule.rule.target.clone();
            }
        }
        self.default_target.clone()
    }

    /// Per-rule weighted coin for condition-matching rules, by priority.
    fn route_weighted(&self, ctx: &RouteContext) -> String {
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let mut rng = rand::rng();
        for rule in rules.iter() {
            if rule.rule.enabled
                && rule.matches(ctx)
                && rng.random_range(1..=100u32) <= u32::from(rule.rule.weight)
            {
                return rule.rule.target.clone();
            }
        }
        self.default_target.clone()
    }

    fn route_by_header(&self, ctx: &RouteContext) -> String {
        if let Some(target) = ctx.headers.get(ROUTE_HEADER) {
            return target.clone();
        }
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        for rule in rules.iter() {
            if rule.rule.enabled && rule.rule.condition.is_some() && rule.matches(ctx) {
                return rule.rule.target.clone();
            }
        }
        self.default_target.clone()
    }

    fn route_by_cookie(&self, ctx: &RouteContext) -> String {
        if ctx.cookies.get(CANARY_COOKIE).map(String::as_str) == Some("true") {
            return TARGET_CANARY.to_string();
        }
        self.default_target.clone()
    }

    /// Consistent-hash routing: a stable identity always lands in the
    /// same 0-99 bucket, so it is routed identically while the rule set
    /// and weights are unchanged.
    fn route_hashed(&self, identity: &str) -> String {
        if identity.is_empty() {
            return self.default_target.clone();
        }
        let bucket = hash_bucket(identity);
        let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
        let mut cumulative = 0u32;
        for rule in rules.iter().filter(|r| r.rule.enabled) {
            cumulative += u32::from(rule.rule.weight);
            if u32::from(bucket) < cumulative {
                return rule.rule.target.clone();
            }
        }
        self.default_target.clone()
    }

    /// Routing counts and percentages per target.
    ///
    /// Observational only: controller decisions come from the per-target
    /// accumulators fed by actual request outcomes, not routing counts.
    pub fn stats(&self) -> RouterStats {
        let stats = self.stats.read().unwrap_or_else(|e| e.into_inner());
        let total: u64 = stats.values().sum();
        let percentages = stats
            .iter()
            .map(|(target, count)| {
                let share = if total > 0 {
                    *count as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                (target.clone(), share)
            })
            .collect();
        RouterStats {
            total_requests: total,
            by_target: stats.clone(),
            percentages,
        }
    }

    pub fn reset_stats(&self) {
        self.stats
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        debug!("router stats reset");
    }
}

/// Map a stable identity into a 0-99 bucket.
fn hash_bucket(identity: &str) -> u8 {
    let digest = blake3::hash(identity.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}
