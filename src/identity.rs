//! Agent identity anonymisation.
//!
//! The `agent_id <-> anon_id` mapping is the only place peer identities leak to an
//! agent, so it lives in exactly one module and every outward-facing consumer
//! (prompt construction, the shared-state bus, the tracker) goes through it rather
//! than re-deriving anon ids ad hoc.

use std::collections::HashMap;

/// Fixed-for-the-run mapping between a stable `agent_id` and its anonymous,
/// deterministically-assigned `agent1`, `agent2`, ... identifier.
#[derive(Debug, Clone)]
pub struct AnonRegistry {
    /// `agent_id -> anon_id`.
    to_anon: HashMap<String, String>,
    /// `anon_id -> agent_id`, and the insertion order used to assign anon ids.
    order: Vec<String>,
    from_anon: HashMap<String, String>,
}

impl AnonRegistry {
    /// Build the mapping from agent ids in declaration order: the first agent
    /// becomes `agent1`, the second `agent2`, and so on.
    pub fn new(agent_ids: &[String]) -> Self {
        let mut to_anon = HashMap::with_capacity(agent_ids.len());
        let mut from_anon = HashMap::with_capacity(agent_ids.len());
        let mut order = Vec::with_capacity(agent_ids.len());

        for (idx, agent_id) in agent_ids.iter().enumerate() {
            let anon_id = format!("agent{}", idx + 1);
            to_anon.insert(agent_id.clone(), anon_id.clone());
            from_anon.insert(anon_id.clone(), agent_id.clone());
            order.push(anon_id);
        }

        Self {
            to_anon,
            order,
            from_anon,
        }
    }

    /// Look up the anon id for a stable agent id.
    pub fn anon_id(&self, agent_id: &str) -> Option<&str> {
        self.to_anon.get(agent_id).map(String::as_str)
    }

    /// Look up the stable agent id behind an anon id.
    pub fn agent_id(&self, anon_id: &str) -> Option<&str> {
        self.from_anon.get(anon_id).map(String::as_str)
    }

    /// Anon ids in declaration order (`agent1`, `agent2`, ...).
    pub fn anon_ids(&self) -> &[String] {
        &self.order
    }

    /// Whether `anon_id` is a valid, registered anonymous identifier.
    pub fn is_valid(&self, anon_id: &str) -> bool {
        self.from_anon.contains_key(anon_id)
    }

    /// Number of registered agents.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_anon_ids_in_declaration_order() {
        let registry = AnonRegistry::new(&[
            "claude-backend".to_string(),
            "gpt-backend".to_string(),
            "gemini-backend".to_string(),
        ]);

        assert_eq!(registry.anon_id("claude-backend"), Some("agent1"));
        assert_eq!(registry.anon_id("gpt-backend"), Some("agent2"));
        assert_eq!(registry.anon_id("gemini-backend"), Some("agent3"));
        assert_eq!(registry.agent_id("agent2"), Some("gpt-backend"));
        assert!(registry.is_valid("agent3"));
        assert!(!registry.is_valid("agent4"));
    }

    #[test]
    fn mapping_is_stable_and_hides_identity_elsewhere() {
        let registry = AnonRegistry::new(&["a".to_string(), "b".to_string()]);
        assert_eq!(registry.anon_ids(), &["agent1".to_string(), "agent2".to_string()]);
        assert_eq!(registry.len(), 2);
    }
}
