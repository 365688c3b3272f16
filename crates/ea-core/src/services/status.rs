use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::ClusterProfile;

use super::instance;
use super::registry::ServiceRegistry;

/// Point-in-time view of one agent's service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatusReport {
    pub name: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub age_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
    pub running: bool,
}

/// Describe a tracked service. `None` when the scope does not track `id`.
///
/// Never changes the registry, even if docker no longer knows the service.
pub async fn agent_status(
    registry: &ServiceRegistry,
    id: &str,
    profile: &ClusterProfile,
) -> Result<Option<AgentStatusReport>> {
    let Some(service) = registry.find(id, profile) else {
        return Ok(None);
    };
    let docker = registry.connect(profile).await?;
    let running = instance::is_alive(service.name(), docker.as_ref()).await?;
    let now = registry.clock().now();
    Ok(Some(AgentStatusReport {
        name: service.name().to_string(),
        image: service.image().to_string(),
        created_at: service.created_at(),
        age_seconds: service.age(now).num_seconds(),
        job_id: service.job_id(),
        running,
    }))
}
