use std::collections::BTreeMap;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{FleetError, Result};
use crate::models::docker_service::{
    CLUSTER_PROFILE_LABEL_KEY, CREATED_BY_LABEL_KEY, ENVIRONMENT_LABEL_KEY,
    JOB_IDENTIFIER_LABEL_KEY, SERVICE_NAME_PREFIX,
};
use crate::models::{CreateAgentRequest, DockerService, ServiceSpec};
use crate::PLUGIN_ID;

use super::docker::DockerClient;

/// A fresh, cluster-unique service name.
pub fn new_service_name() -> String {
    format!("{SERVICE_NAME_PREFIX}-{}", Uuid::new_v4().simple())
}

/// Merge `NAME=value` lines; a later line replaces an earlier one with the
/// same name but keeps its position.
fn merge_env(lines: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for line in lines {
        let key = line.split('=').next().unwrap_or_default().to_string();
        match merged.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = line,
            None => merged.push((key, line)),
        }
    }
    merged.into_iter().map(|(_, line)| line).collect()
}

/// Everything the daemon needs to start the agent for `request`.
pub fn build_spec(request: &CreateAgentRequest, name: &str) -> Result<ServiceSpec> {
    let settings = &request.cluster_profile.properties;
    let image = request.image()?.to_string();

    let mut env = vec![
        format!("GO_EA_SERVER_URL={}", settings.go_server_url()),
        format!("GO_EA_AUTO_REGISTER_KEY={}", request.auto_register_key),
        format!("GO_EA_AUTO_REGISTER_ELASTIC_AGENT_ID={name}"),
        format!("GO_EA_AUTO_REGISTER_ELASTIC_PLUGIN_ID={PLUGIN_ID}"),
    ];
    if let Some(environment) = request.environment.as_deref().filter(|e| !e.is_empty()) {
        env.push(format!("GO_EA_AUTO_REGISTER_ENVIRONMENT={environment}"));
    }
    env.extend(settings.environment_variables().iter().cloned());
    env.extend(request.environment_variables());

    let mut labels = BTreeMap::new();
    labels.insert(CREATED_BY_LABEL_KEY.to_string(), PLUGIN_ID.to_string());
    labels.insert(
        CLUSTER_PROFILE_LABEL_KEY.to_string(),
        request.cluster_profile.id.clone(),
    );
    labels.insert(
        JOB_IDENTIFIER_LABEL_KEY.to_string(),
        serde_json::to_string(&request.job_identifier)?,
    );
    if let Some(environment) = &request.environment {
        labels.insert(ENVIRONMENT_LABEL_KEY.to_string(), environment.clone());
    }

    Ok(ServiceSpec {
        name: name.to_string(),
        image,
        command: request.command(),
        env: merge_env(env),
        labels,
        constraints: request.constraints(),
        limit_memory: request.max_memory().map(str::to_string),
        reserve_memory: request.reserved_memory().map(str::to_string),
        with_registry_auth: settings.registry_auth().is_some(),
    })
}

/// Start the service backing a new agent.
pub async fn create(
    request: &CreateAgentRequest,
    docker: &dyn DockerClient,
    clock: &dyn Clock,
) -> Result<DockerService> {
    let name = new_service_name();
    let spec = build_spec(request, &name)?;
    let handle = docker.create_service(&spec).await?;
    tracing::info!(
        service = %handle.name,
        image = %spec.image,
        cluster_profile = %request.cluster_profile.id,
        job = %request.job_identifier.represent(),
        "service_created"
    );
    Ok(DockerService::new(
        handle.name,
        spec.image,
        clock.now(),
        request.job_identifier.job_id,
    ))
}

/// Remove a service. Returns `false` when it was already gone.
pub async fn terminate(name: &str, docker: &dyn DockerClient) -> Result<bool> {
    match docker.remove_service(name).await {
        Ok(()) => {
            tracing::info!(service = %name, "service_removed");
            Ok(true)
        }
        Err(FleetError::ServiceNotFound(_)) => {
            tracing::debug!(service = %name, "service_already_gone");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

pub async fn is_alive(name: &str, docker: &dyn DockerClient) -> Result<bool> {
    Ok(docker.inspect_service(name).await?.is_some())
}
