//! Line-oriented request protocol spoken on stdin/stdout.
//!
//! Every input line is one JSON request tagged by `request`; every handled
//! line yields one JSON response tagged by `response`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ea_core::models::{Agent, Agents, ClusterProfile, CreateAgentRequest};
use ea_core::services::gateway::HealthMessage;
use ea_core::services::ping::{self, PingReport};
use ea_core::services::registry::ServiceRegistry;
use ea_core::services::status::{self, AgentStatusReport};
use ea_core::{FleetError, Result};

use crate::gateway::ScriptedGateway;

#[derive(Debug, Deserialize)]
#[serde(tag = "request", rename_all = "kebab-case")]
pub enum Request {
    CreateAgent(CreateAgentRequest),
    ServerPing {
        #[serde(default)]
        agents: Vec<Agent>,
    },
    AgentStatus {
        agent_id: String,
        cluster_profile_id: String,
    },
    Instances {
        cluster_profile_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "response", rename_all = "kebab-case")]
pub enum Response {
    Created {
        agent_id: String,
        cluster_profile_id: String,
    },
    AtCapacity {
        cluster_profile_id: String,
        health_messages: Vec<HealthMessage>,
    },
    Pinged {
        #[serde(flatten)]
        report: PingReport,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        health_messages: Vec<HealthMessage>,
    },
    AgentStatus {
        agent_id: String,
        status: Option<AgentStatusReport>,
    },
    Instances {
        cluster_profile_id: String,
        agent_ids: Vec<String>,
    },
    Error {
        message: String,
    },
}

/// Routes requests to the registry and keeps track of known cluster profiles.
pub struct Driver {
    registry: Arc<ServiceRegistry>,
    profiles: BTreeMap<String, ClusterProfile>,
    gateway: ScriptedGateway,
}

impl Driver {
    pub fn new(registry: Arc<ServiceRegistry>, profiles: Vec<ClusterProfile>) -> Self {
        Self {
            registry,
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
            gateway: ScriptedGateway::new(),
        }
    }

    pub fn profile_ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Handle one input line. Blank lines and `#` comments produce nothing.
    pub async fn handle_line(&mut self, line: &str) -> Option<Response> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.dispatch(request).await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "request_failed");
                Response::Error {
                    message: e.to_string(),
                }
            }),
            Err(e) => {
                tracing::warn!(error = %e, "malformed_request");
                Response::Error {
                    message: format!("malformed request: {e}"),
                }
            }
        };
        Some(response)
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::CreateAgent(request) => self.create_agent(request).await,
            Request::ServerPing { agents } => self.server_ping(agents).await,
            Request::AgentStatus {
                agent_id,
                cluster_profile_id,
            } => {
                let profile = self.profile(&cluster_profile_id)?;
                let status = status::agent_status(&self.registry, &agent_id, profile).await?;
                Ok(Response::AgentStatus { agent_id, status })
            }
            Request::Instances { cluster_profile_id } => {
                let profile = self.profile(&cluster_profile_id)?;
                let agent_ids = self
                    .registry
                    .instances(profile)
                    .iter()
                    .map(|s| s.name().to_string())
                    .collect();
                Ok(Response::Instances {
                    cluster_profile_id,
                    agent_ids,
                })
            }
        }
    }

    async fn create_agent(&mut self, request: CreateAgentRequest) -> Result<Response> {
        let profile = request.cluster_profile.clone();
        if self.profiles.get(&profile.id) != Some(&profile) {
            tracing::debug!(cluster_profile = %profile.id, "cluster_profile_updated");
            self.profiles.insert(profile.id.clone(), profile.clone());
        }
        let created = self.registry.create(&request, Some(&self.gateway)).await;
        let calls = self.gateway.take_calls();
        match created? {
            Some(service) => Ok(Response::Created {
                agent_id: service.name().to_string(),
                cluster_profile_id: profile.id,
            }),
            None => Ok(Response::AtCapacity {
                cluster_profile_id: profile.id,
                health_messages: calls.health_messages,
            }),
        }
    }

    async fn server_ping(&mut self, agents: Vec<Agent>) -> Result<Response> {
        self.gateway.set_agents(Agents::new(agents));
        let profiles: Vec<ClusterProfile> = self.profiles.values().cloned().collect();
        let report = ping::server_ping(&self.registry, &self.gateway, &profiles).await;
        let calls = self.gateway.take_calls();
        Ok(Response::Pinged {
            report: report?,
            health_messages: calls.health_messages,
        })
    }

    fn profile(&self, id: &str) -> Result<&ClusterProfile> {
        self.profiles
            .get(id)
            .ok_or_else(|| FleetError::InvalidRequest(format!("unknown cluster profile '{id}'")))
    }
}
