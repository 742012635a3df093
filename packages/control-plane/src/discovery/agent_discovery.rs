// packages/control-plane/src/discovery/agent_discovery.rs
//! Agent discovery engine
//!
//! Never fails for "nothing found": empty candidate sets come back as `None`
//! or an empty list and the caller decides whether to retry, queue or reject.

use crate::discovery::strategy::{DiscoveryRequest, SelectionStrategy};
use crate::registry::{AgentRecord, AgentRegistry};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Selection engine over the registry
pub struct AgentDiscovery {
    registry: Arc<AgentRegistry>,

    /// Round-robin cursor per capability string
    cursors: DashMap<String, usize>,
}

impl AgentDiscovery {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            cursors: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Best single agent for the request
    pub fn discover_agent(&self, request: &DiscoveryRequest) -> Option<AgentRecord> {
        self.discover_agents(request, 1).into_iter().next()
    }

    /// Up to `count` agents, ordered by the request's strategy
    pub fn discover_agents(&self, request: &DiscoveryRequest, count: usize) -> Vec<AgentRecord> {
        if count == 0 {
            return vec![];
        }

        let candidates = self.candidates(request);
        if candidates.is_empty() {
            debug!(
                "No available agent for capability '{}' ({})",
                request.capability, request.strategy
            );
            return vec![];
        }

        let selected = self.apply_strategy(request, candidates, count);
        debug!(
            "Discovered {} agent(s) for '{}' via {}",
            selected.len(),
            request.capability,
            request.strategy
        );
        selected
    }

    /// Resolve each capability independently with the least-loaded strategy
    pub fn get_agents_for_workflow(&self, capabilities: &[String]) -> HashMap<String, Option<AgentRecord>> {
        capabilities
            .iter()
            .map(|capability| {
                let request = DiscoveryRequest::new(capability.clone())
                    .with_strategy(SelectionStrategy::LeastLoaded);
                (capability.clone(), self.discover_agent(&request))
            })
            .collect()
    }

    /// Sorted union of capabilities across healthy agents
    pub fn get_available_capabilities(&self) -> Vec<String> {
        self.registry
            .get_all_agents(false)
            .into_iter()
            .filter(|agent| agent.is_healthy())
            .flat_map(|agent| agent.capabilities.into_iter())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Current cursor for a capability (0 if never used)
    pub fn round_robin_cursor(&self, capability: &str) -> usize {
        self.cursors.get(capability).map(|c| *c).unwrap_or(0)
    }

    fn candidates(&self, request: &DiscoveryRequest) -> Vec<AgentRecord> {
        let mut candidates: Vec<AgentRecord> = self
            .registry
            .get_agents_by_capability(&request.capability, true)
            .into_iter()
            .filter(|agent| !request.exclude_agents.contains(&agent.agent_id))
            .filter(|agent| {
                request
                    .min_health_score
                    .map_or(true, |min| agent.health_score >= min)
            })
            .collect();

        // A preferred version narrows the set only when someone runs it
        if let Some(version) = &request.preferred_version {
            if candidates.iter().any(|agent| &agent.version == version) {
                candidates.retain(|agent| &agent.version == version);
            }
        }

        if !request.required_tags.is_empty() {
            candidates.retain(|agent| agent.matches_tags(&request.required_tags));
        }

        candidates
    }

    fn apply_strategy(
        &self,
        request: &DiscoveryRequest,
        mut candidates: Vec<AgentRecord>,
        count: usize,
    ) -> Vec<AgentRecord> {
        match request.strategy {
            // Registry order is already load asc, health desc
            SelectionStrategy::LeastLoaded => {
                candidates.truncate(count);
                candidates
            }
            SelectionStrategy::RoundRobin => {
                let start = self.advance_cursor(&request.capability, candidates.len());
                candidates.rotate_left(start);
                candidates.truncate(count);
                candidates
            }
            SelectionStrategy::Random => {
                let mut rng = rand::thread_rng();
                candidates.choose_multiple(&mut rng, count).cloned().collect()
            }
            SelectionStrategy::HealthWeighted => {
                candidates.sort_by(|a, b| {
                    b.health_score
                        .total_cmp(&a.health_score)
                        .then_with(|| a.load_ratio().total_cmp(&b.load_ratio()))
                });
                candidates.truncate(count);
                candidates
            }
            SelectionStrategy::FastestResponse => {
                candidates.sort_by(|a, b| {
                    a.average_response_time_ms
                        .total_cmp(&b.average_response_time_ms)
                        .then_with(|| a.load_ratio().total_cmp(&b.load_ratio()))
                });
                candidates.truncate(count);
                candidates
            }
        }
    }

    /// Return the index to use for this call and move the cursor on by one
    fn advance_cursor(&self, capability: &str, size: usize) -> usize {
        let mut cursor = self.cursors.entry(capability.to_string()).or_insert(0);
        let index = *cursor % size;
        *cursor = (index + 1) % size;
        index
    }
}
