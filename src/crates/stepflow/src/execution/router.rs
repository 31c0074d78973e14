//! Target selection for delegated work
//!
//! The router keeps the registered execution targets in registration order
//! and picks one for each work unit according to a [`RoutingStrategy`].

use super::work::WorkUnit;
use crate::error::{Result, StepflowError};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// How the router picks a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// First target whose capabilities cover the work's requirements
    CapabilityMatch,
    /// Target whose keywords appear most often in the work text
    ContentMatch,
    /// Target with the fewest in-flight runs
    LoadBalanced,
    /// Rotate through targets
    #[default]
    RoundRobin,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CapabilityMatch => "capability_match",
            Self::ContentMatch => "content_match",
            Self::LoadBalanced => "load_balanced",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RoutingStrategy {
    type Err = StepflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "capability_match" => Ok(Self::CapabilityMatch),
            "content_match" => Ok(Self::ContentMatch),
            "load_balanced" => Ok(Self::LoadBalanced),
            "round_robin" => Ok(Self::RoundRobin),
            other => Err(StepflowError::Config(format!(
                "unknown routing strategy '{}'",
                other
            ))),
        }
    }
}

/// Routing profile of an execution target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProfile {
    pub id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl TargetProfile {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Vec::new(),
            keywords: Vec::new(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }
}

/// Target router
#[derive(Debug, Default)]
pub struct Router {
    strategy: RoutingStrategy,
    targets: RwLock<Vec<TargetProfile>>,
    in_flight: DashMap<String, usize>,
    cursor: AtomicUsize,
}

impl Router {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    /// Register a target, replacing any profile with the same id in place
    pub fn register(&self, profile: TargetProfile) {
        let mut targets = self.targets.write();
        match targets.iter_mut().find(|t| t.id == profile.id) {
            Some(existing) => *existing = profile,
            None => targets.push(profile),
        }
    }

    /// Remove a target
    pub fn unregister(&self, id: &str) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t.id != id);
        self.in_flight.remove(id);
        targets.len() != before
    }

    /// Registered target ids in registration order
    pub fn target_ids(&self) -> Vec<String> {
        self.targets.read().iter().map(|t| t.id.clone()).collect()
    }

    /// Number of runs currently in flight on `target`
    pub fn in_flight(&self, target: &str) -> usize {
        self.in_flight.get(target).map(|count| *count).unwrap_or(0)
    }

    pub(crate) fn begin(&self, target: &str) {
        *self.in_flight.entry(target.to_string()).or_insert(0) += 1;
    }

    pub(crate) fn finish(&self, target: &str) {
        if let Some(mut count) = self.in_flight.get_mut(target) {
            *count = count.saturating_sub(1);
        }
    }

    /// Pick a target for `work`
    pub fn select(&self, work: &WorkUnit) -> Result<String> {
        let targets = self.targets.read();
        if targets.is_empty() {
            return Err(StepflowError::NoTargetAvailable(work.name.clone()));
        }

        let selected = match self.strategy {
            RoutingStrategy::CapabilityMatch => self.by_capability(&targets, work)?,
            RoutingStrategy::ContentMatch => self
                .by_content(&targets, work)
                .unwrap_or_else(|| self.round_robin(&targets)),
            RoutingStrategy::LoadBalanced => self.least_loaded(&targets),
            RoutingStrategy::RoundRobin => self.round_robin(&targets),
        };

        debug!(
            work_id = %work.id,
            strategy = %self.strategy,
            target = %selected,
            "Target selected"
        );

        Ok(selected)
    }

    fn round_robin(&self, targets: &[TargetProfile]) -> String {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % targets.len();
        targets[index].id.clone()
    }

    fn by_capability(&self, targets: &[TargetProfile], work: &WorkUnit) -> Result<String> {
        if work.required_capabilities.is_empty() {
            return Ok(self.round_robin(targets));
        }

        targets
            .iter()
            .find(|target| {
                let offered: HashSet<&str> =
                    target.capabilities.iter().map(String::as_str).collect();
                work.required_capabilities
                    .iter()
                    .all(|required| offered.contains(required.as_str()))
            })
            .map(|target| target.id.clone())
            .ok_or_else(|| {
                StepflowError::NoTargetAvailable(format!(
                    "{} (requires {})",
                    work.name,
                    work.required_capabilities.join(", ")
                ))
            })
    }

    fn by_content(&self, targets: &[TargetProfile], work: &WorkUnit) -> Option<String> {
        let text = format!("{} {}", work.name, work.description).to_lowercase();
        let words: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| !w.is_empty())
            .collect();

        let mut best: Option<(&TargetProfile, usize)> = None;
        for target in targets {
            let hits: usize = target
                .keywords
                .iter()
                .map(|keyword| {
                    let keyword = keyword.to_lowercase();
                    words.iter().filter(|w| **w == keyword).count()
                })
                .sum();

            if hits > 0 && best.map_or(true, |(_, top)| hits > top) {
                best = Some((target, hits));
            }
        }

        best.map(|(target, _)| target.id.clone())
    }

    fn least_loaded(&self, targets: &[TargetProfile]) -> String {
        let mut best = &targets[0];
        let mut best_load = self.in_flight(&best.id);
        for target in &targets[1..] {
            let load = self.in_flight(&target.id);
            if load < best_load {
                best = target;
                best_load = load;
            }
        }
        best.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(name: &str, description: &str) -> WorkUnit {
        WorkUnit::new(name, description)
    }

    #[test]
    fn test_no_targets() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        let result = router.select(&work("a", "b"));
        assert!(matches!(result, Err(StepflowError::NoTargetAvailable(_))));
    }

    #[test]
    fn test_round_robin_rotates() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        router.register(TargetProfile::new("a"));
        router.register(TargetProfile::new("b"));

        let picks: Vec<_> = (0..4)
            .map(|_| router.select(&work("w", "d")).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn test_register_replaces_in_place() {
        let router = Router::new(RoutingStrategy::RoundRobin);
        router.register(TargetProfile::new("a"));
        router.register(TargetProfile::new("b"));
        router.register(TargetProfile::new("a").with_keywords(["x"]));
        assert_eq!(router.target_ids(), vec!["a", "b"]);
        assert!(router.unregister("a"));
        assert!(!router.unregister("a"));
        assert_eq!(router.target_ids(), vec!["b"]);
    }

    #[test]
    fn test_capability_match() {
        let router = Router::new(RoutingStrategy::CapabilityMatch);
        router.register(TargetProfile::new("coder").with_capabilities(["code"]));
        router.register(TargetProfile::new("full").with_capabilities(["code", "review"]));

        let needs_review = work("r", "review it").with_capabilities(vec![
            "code".to_string(),
            "review".to_string(),
        ]);
        assert_eq!(router.select(&needs_review).unwrap(), "full");

        let needs_code = work("c", "write it").with_capabilities(vec!["code".to_string()]);
        assert_eq!(router.select(&needs_code).unwrap(), "coder");

        let needs_deploy = work("d", "ship it").with_capabilities(vec!["deploy".to_string()]);
        assert!(matches!(
            router.select(&needs_deploy),
            Err(StepflowError::NoTargetAvailable(_))
        ));
    }

    #[test]
    fn test_content_match_whole_words() {
        let router = Router::new(RoutingStrategy::ContentMatch);
        router.register(TargetProfile::new("writer").with_keywords(["summary", "write"]));
        router.register(TargetProfile::new("analyst").with_keywords(["data", "analyze"]));

        let w = work("report", "Analyze the data and write a data summary");
        assert_eq!(router.select(&w).unwrap(), "analyst");

        // "database" does not count as "data"
        let w = work("report", "Write to the database");
        assert_eq!(router.select(&w).unwrap(), "writer");
    }

    #[test]
    fn test_content_match_tie_and_fallback() {
        let router = Router::new(RoutingStrategy::ContentMatch);
        router.register(TargetProfile::new("first").with_keywords(["alpha"]));
        router.register(TargetProfile::new("second").with_keywords(["beta"]));

        assert_eq!(router.select(&work("x", "alpha beta")).unwrap(), "first");

        let fallback: Vec<_> = (0..2)
            .map(|_| router.select(&work("x", "nothing relevant")).unwrap())
            .collect();
        assert_eq!(fallback, vec!["first", "second"]);
    }

    #[test]
    fn test_load_balanced() {
        let router = Router::new(RoutingStrategy::LoadBalanced);
        router.register(TargetProfile::new("a"));
        router.register(TargetProfile::new("b"));

        router.begin("a");
        assert_eq!(router.select(&work("w", "d")).unwrap(), "b");

        router.begin("b");
        router.begin("b");
        assert_eq!(router.select(&work("w", "d")).unwrap(), "a");

        router.finish("b");
        router.finish("b");
        assert_eq!(router.in_flight("b"), 0);
        assert_eq!(router.select(&work("w", "d")).unwrap(), "b");
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "load_balanced".parse::<RoutingStrategy>().unwrap(),
            RoutingStrategy::LoadBalanced
        );
        assert!("fastest".parse::<RoutingStrategy>().is_err());
        assert_eq!(RoutingStrategy::default(), RoutingStrategy::RoundRobin);
    }
}
