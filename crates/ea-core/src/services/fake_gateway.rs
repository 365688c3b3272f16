//! Server gateway that records every call, for tests.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::{FleetError, Result};
use crate::models::{Agent, AgentConfigState, Agents};

use super::gateway::{HealthMessage, ServerGateway};

#[derive(Debug, Default)]
struct Recorded {
    agents: Agents,
    disabled: Vec<String>,
    deleted: Vec<String>,
    messages: Vec<HealthMessage>,
    fail_listing: bool,
}

#[derive(Debug, Default)]
pub struct RecordingGateway {
    state: Mutex<Recorded>,
}

impl RecordingGateway {
    pub fn new(agents: Agents) -> Self {
        Self {
            state: Mutex::new(Recorded {
                agents,
                ..Recorded::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Recorded> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_agents(&self, agents: Agents) {
        self.state().agents = agents;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state().fail_listing = fail;
    }

    pub fn disabled(&self) -> Vec<String> {
        self.state().disabled.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn messages(&self) -> Vec<HealthMessage> {
        self.state().messages.clone()
    }
}

#[async_trait]
impl ServerGateway for RecordingGateway {
    async fn list_agents(&self) -> Result<Agents> {
        let state = self.state();
        if state.fail_listing {
            return Err(FleetError::Server("server unavailable".into()));
        }
        Ok(state.agents.clone())
    }

    /// Disabling flips the agent's config state, as the server would.
    async fn disable_agents(&self, agents: &[Agent]) -> Result<()> {
        let mut state = self.state();
        let updated: Agents = state
            .agents
            .agents()
            .map(|a| {
                let mut a = a.clone();
                if agents.iter().any(|d| d.agent_id == a.agent_id) {
                    a.config_state = AgentConfigState::Disabled;
                }
                a
            })
            .collect();
        state.agents = updated;
        state
            .disabled
            .extend(agents.iter().map(|a| a.agent_id.clone()));
        Ok(())
    }

    async fn delete_agents(&self, agents: &[Agent]) -> Result<()> {
        let mut state = self.state();
        let kept: Agents = state
            .agents
            .agents()
            .filter(|a| !agents.iter().any(|d| d.agent_id == a.agent_id))
            .cloned()
            .collect();
        state.agents = kept;
        state.deleted.extend(agents.iter().map(|a| a.agent_id.clone()));
        Ok(())
    }

    async fn add_server_health_messages(&self, messages: &[HealthMessage]) -> Result<()> {
        self.state().messages.extend_from_slice(messages);
        Ok(())
    }
}
