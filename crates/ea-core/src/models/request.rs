use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::docker_service::JobIdentifier;
use super::settings::ClusterProfile;
use crate::error::{FleetError, Result};

pub const IMAGE_PROPERTY: &str = "Image";
pub const COMMAND_PROPERTY: &str = "Command";
pub const ENVIRONMENT_PROPERTY: &str = "Environment";
pub const MAX_MEMORY_PROPERTY: &str = "MaxMemory";
pub const RESERVED_MEMORY_PROPERTY: &str = "ReservedMemory";
pub const CONSTRAINTS_PROPERTY: &str = "Constraints";

/// The server asking for one more agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAgentRequest {
    pub auto_register_key: String,
    #[serde(default)]
    pub elastic_agent_profile_properties: HashMap<String, String>,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub job_identifier: JobIdentifier,
    pub cluster_profile: ClusterProfile,
}

impl CreateAgentRequest {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn property(&self, key: &str) -> Option<&str> {
        self.elastic_agent_profile_properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn image(&self) -> Result<&str> {
        self.property(IMAGE_PROPERTY).ok_or_else(|| {
            FleetError::InvalidRequest(format!("elastic profile property '{IMAGE_PROPERTY}' is required"))
        })
    }

    fn lines(&self, key: &str) -> Vec<String> {
        self.property(key)
            .map(|raw| {
                raw.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One argument per line.
    pub fn command(&self) -> Vec<String> {
        self.lines(COMMAND_PROPERTY)
    }

    pub fn environment_variables(&self) -> Vec<String> {
        self.lines(ENVIRONMENT_PROPERTY)
    }

    pub fn constraints(&self) -> Vec<String> {
        self.lines(CONSTRAINTS_PROPERTY)
    }

    pub fn max_memory(&self) -> Option<&str> {
        self.property(MAX_MEMORY_PROPERTY)
    }

    pub fn reserved_memory(&self) -> Option<&str> {
        self.property(RESERVED_MEMORY_PROPERTY)
    }
}
