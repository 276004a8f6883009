// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use runa_config::AgentId;
use runa_core::{Agent, AgentConfig, AgentDeps, Deregister};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool at capacity ({0})")]
    AtCapacity(usize),
    #[error("agent already pooled: {0}")]
    Duplicate(AgentId),
    #[error(transparent)]
    Agent(#[from] runa_core::AgentError),
}

struct PoolInner {
    capacity: usize,
    agents: Mutex<HashMap<AgentId, Agent>>,
}

impl Deregister for PoolInner {
    fn deregister(&self, id: &AgentId) {
        if self.agents.lock().unwrap().remove(id).is_some() {
            debug!(agent = %id, "agent deregistered from pool");
        }
    }
}

/// Bounded roster of live agents.
///
/// Creation and destruction go through the pool so concurrent agent count
/// (and therefore memory) is deterministic.  The pool holds agents by id;
/// agents hold only a weak back-pointer for deregistration on dispose.
#[derive(Clone)]
pub struct AgentPool {
    inner: Arc<PoolInner>,
}

impl AgentPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity: capacity.max(1),
                agents: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn create(&self, config: AgentConfig, deps: AgentDeps) -> Result<Agent, PoolError> {
        {
            let agents = self.inner.agents.lock().unwrap();
            if agents.len() >= self.inner.capacity {
                return Err(PoolError::AtCapacity(self.inner.capacity));
            }
            if agents.contains_key(&config.id) {
                return Err(PoolError::Duplicate(config.id.clone()));
            }
        }
        let agent = Agent::create(config, deps)?;
        let owner_arc: Arc<dyn Deregister> = self.inner.clone();
        let owner: std::sync::Weak<dyn Deregister> = Arc::downgrade(&owner_arc);
        agent.attach_owner(owner);
        self.inner
            .agents
            .lock()
            .unwrap()
            .insert(agent.id().clone(), agent.clone());
        Ok(agent)
    }

    /// Adopt an already-constructed agent (e.g. a fork) into the roster.
    pub fn adopt(&self, agent: Agent) -> Result<(), PoolError> {
        let mut agents = self.inner.agents.lock().unwrap();
        if agents.len() >= self.inner.capacity {
            return Err(PoolError::AtCapacity(self.inner.capacity));
        }
        if agents.contains_key(agent.id()) {
            return Err(PoolError::Duplicate(agent.id().clone()));
        }
        let owner_arc: Arc<dyn Deregister> = self.inner.clone();
        let owner: std::sync::Weak<dyn Deregister> = Arc::downgrade(&owner_arc);
        agent.attach_owner(owner);
        agents.insert(agent.id().clone(), agent);
        Ok(())
    }

    pub fn get(&self, id: &AgentId) -> Option<Agent> {
        self.inner.agents.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.agents.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.inner.agents.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Dispose an agent and drop it from the roster.
    pub async fn destroy(&self, id: &AgentId) {
        let agent = self.inner.agents.lock().unwrap().remove(id);
        if let Some(agent) = agent {
            agent.dispose().await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use runa_core::Template;
    use runa_model::ScriptedProvider;
    use runa_store::Store;
    use runa_tools::ToolRegistry;

    use super::*;

    fn deps(tmp: &tempfile::TempDir) -> AgentDeps {
        AgentDeps::new(
            Arc::new(ScriptedProvider::always_text("ok")),
            Arc::new(ToolRegistry::new()),
            Arc::new(Store::open(tmp.path()).unwrap()),
        )
    }

    fn config(id: &str) -> AgentConfig {
        AgentConfig::new(id, Template::builder("t").build())
    }

    #[tokio::test]
    async fn create_up_to_capacity() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(2);
        pool.create(config("a"), deps(&tmp)).unwrap();
        pool.create(config("b"), deps(&tmp)).unwrap();
        assert_eq!(pool.len(), 2);
        let err = pool.create(config("c"), deps(&tmp)).unwrap_err();
        assert!(matches!(err, PoolError::AtCapacity(2)));
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(4);
        pool.create(config("a"), deps(&tmp)).unwrap();
        assert!(matches!(
            pool.create(config("a"), deps(&tmp)),
            Err(PoolError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn dispose_deregisters_via_weak_pointer() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(2);
        let agent = pool.create(config("a"), deps(&tmp)).unwrap();
        assert_eq!(pool.len(), 1);
        agent.dispose().await;
        assert_eq!(pool.len(), 0, "dispose must deregister from the pool");
    }

    #[tokio::test]
    async fn destroy_removes_and_disposes() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = AgentPool::new(2);
        pool.create(config("a"), deps(&tmp)).unwrap();
        pool.destroy(&AgentId::new("a")).await;
        assert!(pool.get(&AgentId::new("a")).is_none());
    }
}
