// packages/control-plane/src/discovery/strategy.rs
//! Selection strategies and discovery requests

use crate::utils::errors::ControlPlaneError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// How to order candidate agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    #[default]
    LeastLoaded,
    Random,
    HealthWeighted,
    FastestResponse,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLoaded => "least_loaded",
            SelectionStrategy::Random => "random",
            SelectionStrategy::HealthWeighted => "health_weighted",
            SelectionStrategy::FastestResponse => "fastest_response",
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SelectionStrategy {
    type Err = ControlPlaneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "least_loaded" => Ok(SelectionStrategy::LeastLoaded),
            "random" => Ok(SelectionStrategy::Random),
            "health_weighted" => Ok(SelectionStrategy::HealthWeighted),
            "fastest_response" => Ok(SelectionStrategy::FastestResponse),
            other => Err(ControlPlaneError::ValidationFailed(format!(
                "Unsupported selection strategy: {}",
                other
            ))),
        }
    }
}

/// What the caller is looking for
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryRequest {
    pub capability: String,
    pub strategy: SelectionStrategy,

    /// Narrows candidates only if at least one agent runs this version
    pub preferred_version: Option<String>,

    /// Every key must be present with an equal value
    pub required_tags: HashMap<String, String>,

    pub exclude_agents: HashSet<String>,
    pub min_health_score: Option<f64>,
}

impl DiscoveryRequest {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn prefer_version(mut self, version: impl Into<String>) -> Self {
        self.preferred_version = Some(version.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.required_tags.insert(key.into(), value.into());
        self
    }

    pub fn exclude(mut self, agent_id: impl Into<String>) -> Self {
        self.exclude_agents.insert(agent_id.into());
        self
    }

    pub fn with_min_health(mut self, score: f64) -> Self {
        self.min_health_score = Some(score);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("round_robin".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::RoundRobin);
        assert_eq!("Least-Loaded".parse::<SelectionStrategy>().unwrap(), SelectionStrategy::LeastLoaded);
        assert_eq!(
            "fastest_response".parse::<SelectionStrategy>().unwrap(),
            SelectionStrategy::FastestResponse
        );
        assert!(matches!(
            "cheapest".parse::<SelectionStrategy>(),
            Err(ControlPlaneError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_strategy_round_trips_through_display() {
        for strategy in [
            SelectionStrategy::RoundRobin,
            SelectionStrategy::LeastLoaded,
            SelectionStrategy::Random,
            SelectionStrategy::HealthWeighted,
            SelectionStrategy::FastestResponse,
        ] {
            assert_eq!(strategy.to_string().parse::<SelectionStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_request_defaults_to_least_loaded() {
        let request = DiscoveryRequest::new("x");
        assert_eq!(request.strategy, SelectionStrategy::LeastLoaded);
        assert!(request.exclude_agents.is_empty());
    }
}
