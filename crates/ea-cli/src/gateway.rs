use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use ea_core::models::{Agent, AgentConfigState, Agents};
use ea_core::services::gateway::{HealthMessage, ServerGateway};
use ea_core::Result;

/// Everything the daemon asked of the server while handling one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCalls {
    pub disabled: Vec<String>,
    pub deleted: Vec<String>,
    pub health_messages: Vec<HealthMessage>,
}

#[derive(Debug, Default)]
struct GatewayState {
    agents: Agents,
    calls: ServerCalls,
}

/// Server gateway fed by the driver: the agent list comes from the last
/// `server-ping` line and outgoing calls are collected for the response.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    state: Mutex<GatewayState>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_agents(&self, agents: Agents) {
        self.state().agents = agents;
    }

    /// Hand over the calls recorded so far and start a fresh record.
    pub fn take_calls(&self) -> ServerCalls {
        std::mem::take(&mut self.state().calls)
    }
}

#[async_trait]
impl ServerGateway for ScriptedGateway {
    async fn list_agents(&self) -> Result<Agents> {
        Ok(self.state().agents.clone())
    }

    async fn disable_agents(&self, agents: &[Agent]) -> Result<()> {
        let mut state = self.state();
        state.agents = state
            .agents
            .agents()
            .cloned()
            .map(|mut agent| {
                if agents.iter().any(|d| d.agent_id == agent.agent_id) {
                    agent.config_state = AgentConfigState::Disabled;
                }
                agent
            })
            .collect();
        state
            .calls
            .disabled
            .extend(agents.iter().map(|a| a.agent_id.clone()));
        tracing::debug!(count = agents.len(), "server_disable_agents");
        Ok(())
    }

    async fn delete_agents(&self, agents: &[Agent]) -> Result<()> {
        let mut state = self.state();
        state.agents = state
            .agents
            .agents()
            .filter(|a| !agents.iter().any(|d| d.agent_id == a.agent_id))
            .cloned()
            .collect();
        state
            .calls
            .deleted
            .extend(agents.iter().map(|a| a.agent_id.clone()));
        tracing::debug!(count = agents.len(), "server_delete_agents");
        Ok(())
    }

    async fn add_server_health_messages(&self, messages: &[HealthMessage]) -> Result<()> {
        self.state()
            .calls
            .health_messages
            .extend_from_slice(messages);
        Ok(())
    }
}
