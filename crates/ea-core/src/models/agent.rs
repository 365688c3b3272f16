use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentState {
    Pending,
    Building,
    Idle,
    LostContact,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BuildState {
    Idle,
    Building,
    Cancelled,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentConfigState {
    Pending,
    Enabled,
    Disabled,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One agent as the server reports it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub agent_id: String,
    #[serde(default, deserialize_with = "or_default")]
    pub agent_state: AgentState,
    #[serde(default, deserialize_with = "or_default")]
    pub build_state: BuildState,
    #[serde(default, deserialize_with = "or_default")]
    pub config_state: AgentConfigState,
}

fn or_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Agent {
    pub fn new(
        agent_id: impl Into<String>,
        agent_state: AgentState,
        build_state: BuildState,
        config_state: AgentConfigState,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_state,
            build_state,
            config_state,
        }
    }

    /// An agent we only know the id of.
    pub fn with_id(agent_id: impl Into<String>) -> Self {
        Self::new(
            agent_id,
            AgentState::Unknown,
            BuildState::Unknown,
            AgentConfigState::Unknown,
        )
    }

    pub fn is_idle(&self) -> bool {
        self.agent_state == AgentState::Idle
    }

    pub fn is_disabled(&self) -> bool {
        self.config_state == AgentConfigState::Disabled
    }
}

/// Snapshot of the server's agent list, keyed by agent id.
///
/// Never patched in place: every poll builds a new one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Agents {
    agents: BTreeMap<String, Agent>,
}

impl Agents {
    pub fn new(agents: impl IntoIterator<Item = Agent>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|agent| (agent.agent_id.clone(), agent))
                .collect(),
        }
    }

    pub fn from_json(json: &str) -> crate::Result<Self> {
        let agents: Vec<Agent> = serde_json::from_str(json)?;
        Ok(Self::new(agents))
    }

    pub fn contains_id(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn find_by_id(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Idle agents, the only ones safe to disable.
    pub fn idle(&self) -> Vec<Agent> {
        self.agents().filter(|a| a.is_idle()).cloned().collect()
    }

    /// Disabled agents, whose backing services can be torn down.
    pub fn disabled(&self) -> Vec<Agent> {
        self.agents().filter(|a| a.is_disabled()).cloned().collect()
    }
}

impl FromIterator<Agent> for Agents {
    fn from_iter<I: IntoIterator<Item = Agent>>(iter: I) -> Self {
        Self::new(iter)
    }
}
