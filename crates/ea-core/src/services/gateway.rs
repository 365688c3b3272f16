use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Agent, Agents};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthMessageKind {
    Warning,
    Error,
}

/// A message shown on the server's health panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthMessage {
    #[serde(rename = "type")]
    pub kind: HealthMessageKind,
    pub message: String,
}

impl HealthMessage {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: HealthMessageKind::Warning,
            message: message.into(),
        }
    }
}

/// Requests this plugin sends back to the CD server.
#[async_trait]
pub trait ServerGateway: Send + Sync {
    async fn list_agents(&self) -> Result<Agents>;

    async fn disable_agents(&self, agents: &[Agent]) -> Result<()>;

    async fn delete_agents(&self, agents: &[Agent]) -> Result<()>;

    async fn add_server_health_messages(&self, messages: &[HealthMessage]) -> Result<()>;
}
