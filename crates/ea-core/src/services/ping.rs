//! Periodic reconciliation between the server's agent list and the fleet.

use serde::Serialize;

use crate::error::Result;
use crate::models::{Agent, Agents, ClusterProfile};

use super::gateway::ServerGateway;
use super::registry::ServiceRegistry;

/// What one server ping changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PingReport {
    pub disabled: Vec<String>,
    pub deleted: Vec<String>,
    pub terminated: Vec<String>,
    pub failures: Vec<String>,
}

/// Reconcile every cluster profile against the server.
///
/// Idle agents that outlived their registration window, or whose service is
/// tracked nowhere, are disabled. Disabled agents lose their service and are
/// deleted from the server. Services that never registered are terminated.
///
/// Agents without a tracked service only count as missing when every
/// profile refreshed; otherwise they are left for a later ping.
pub async fn server_ping(
    registry: &ServiceRegistry,
    gateway: &dyn ServerGateway,
    profiles: &[ClusterProfile],
) -> Result<PingReport> {
    let mut report = PingReport::default();

    let mut live: Vec<&ClusterProfile> = Vec::new();
    for profile in profiles {
        match registry.refresh_all(profile).await {
            Ok(()) => live.push(profile),
            Err(e) => report
                .failures
                .push(format!("cluster profile {}: {e}", profile.id)),
        }
    }

    // Without every listing an untracked agent may still have a live service.
    let complete = report.failures.is_empty();

    let agents = gateway.list_agents().await?;

    let mut candidates: Vec<Agent> = Vec::new();
    if complete {
        candidates.extend(
            agents
                .agents()
                .filter(|a| !registry.has_instance(&a.agent_id))
                .cloned(),
        );
    }
    for profile in &live {
        candidates.extend(
            registry
                .registered_agents_past_timeout(profile, &agents)
                .agents()
                .cloned(),
        );
    }
    let to_disable: Vec<Agent> = Agents::new(candidates)
        .idle()
        .into_iter()
        .filter(|a| !a.is_disabled())
        .collect();
    if !to_disable.is_empty() {
        gateway.disable_agents(&to_disable).await?;
        report
            .disabled
            .extend(to_disable.iter().map(|a| a.agent_id.clone()));
        tracing::info!(count = to_disable.len(), "agents_disabled");
    }

    let agents = gateway.list_agents().await?;

    let mut to_delete: Vec<Agent> = Vec::new();
    for agent in agents.disabled() {
        let owner = live
            .iter()
            .find(|p| registry.find(&agent.agent_id, p).is_some());
        match owner {
            Some(profile) => match registry.terminate(&agent.agent_id, profile).await {
                Ok(()) => {
                    report.terminated.push(agent.agent_id.clone());
                    to_delete.push(agent);
                }
                Err(e) => report.failures.push(format!("{}: {e}", agent.agent_id)),
            },
            // Possibly owned by a profile whose refresh failed: leave it for next time.
            None if !complete || registry.has_instance(&agent.agent_id) => {}
            None => to_delete.push(agent),
        }
    }
    if !to_delete.is_empty() {
        gateway.delete_agents(&to_delete).await?;
        report
            .deleted
            .extend(to_delete.iter().map(|a| a.agent_id.clone()));
        tracing::info!(count = to_delete.len(), "agents_deleted");
    }

    for profile in &live {
        let outcome = registry.terminate_unregistered_instances(profile, &agents).await;
        report.terminated.extend(outcome.terminated);
        report
            .failures
            .extend(outcome.failed.into_iter().map(|(name, e)| format!("{name}: {e}")));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::{TimeDelta, TimeZone, Utc};

    use super::*;
    use crate::clock::{Clock, TestClock};
    use crate::models::docker_service::{CLUSTER_PROFILE_LABEL_KEY, CREATED_BY_LABEL_KEY};
    use crate::models::{
        AgentConfigState, AgentState, BuildState, CreateAgentRequest, PluginSettings, ServiceHandle,
    };
    use crate::PLUGIN_ID;
    use crate::services::fake_docker::{FakeConnector, FakeDocker};
    use crate::services::fake_gateway::RecordingGateway;

    fn profile(id: &str) -> ClusterProfile {
        let settings = PluginSettings::from_json(
            r#"{"go_server_url":"https://ci/go","docker_uri":"tcp://swarm:2375","max_docker_containers":"5"}"#,
        )
        .unwrap();
        ClusterProfile::new(id, settings)
    }

    fn request(profile: &ClusterProfile) -> CreateAgentRequest {
        CreateAgentRequest {
            auto_register_key: "key".into(),
            elastic_agent_profile_properties: [("Image".to_string(), "alpine".to_string())]
                .into_iter()
                .collect(),
            environment: None,
            job_identifier: Default::default(),
            cluster_profile: profile.clone(),
        }
    }

    fn idle(id: &str) -> Agent {
        Agent::new(id, AgentState::Idle, BuildState::Idle, AgentConfigState::Enabled)
    }

    fn building(id: &str) -> Agent {
        Agent::new(id, AgentState::Building, BuildState::Building, AgentConfigState::Enabled)
    }

    /// A service another process created for `profile_id`.
    fn existing(name: &str, profile_id: &str, clock: &TestClock) -> ServiceHandle {
        let mut labels = BTreeMap::new();
        labels.insert(CREATED_BY_LABEL_KEY.to_string(), PLUGIN_ID.to_string());
        labels.insert(CLUSTER_PROFILE_LABEL_KEY.to_string(), profile_id.to_string());
        ServiceHandle {
            name: name.into(),
            image: "alpine".into(),
            created_at: clock.now(),
            labels,
        }
    }

    struct Fixture {
        clock: Arc<TestClock>,
        docker: Arc<FakeDocker>,
        registry: ServiceRegistry,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(TestClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
        let docker = FakeDocker::new(clock.clone());
        let registry = ServiceRegistry::new(Arc::new(FakeConnector(docker.clone())), clock.clone());
        Fixture {
            clock,
            docker,
            registry,
        }
    }

    #[tokio::test]
    async fn quiet_ping_changes_nothing() {
        let f = fixture();
        let prod = profile("prod");
        let service = f.registry.create(&request(&prod), None).await.unwrap().unwrap();
        let gateway = RecordingGateway::new(Agents::new([building(service.name())]));

        let report = server_ping(&f.registry, &gateway, &[prod]).await.unwrap();

        assert_eq!(report, PingReport::default());
        assert!(f.docker.service_exists(service.name()));
    }

    #[tokio::test]
    async fn idle_agent_past_timeout_is_retired() {
        let f = fixture();
        let prod = profile("prod");
        let service = f.registry.create(&request(&prod), None).await.unwrap().unwrap();
        let gateway = RecordingGateway::new(Agents::new([idle(service.name())]));

        f.clock.forward(TimeDelta::minutes(11));
        let report = server_ping(&f.registry, &gateway, &[prod]).await.unwrap();

        assert_eq!(report.disabled, [service.name().to_string()]);
        assert_eq!(report.terminated, [service.name().to_string()]);
        assert_eq!(report.deleted, [service.name().to_string()]);
        assert!(!f.docker.service_exists(service.name()));
        assert!(!f.registry.has_instance(service.name()));
    }

    #[tokio::test]
    async fn busy_agent_past_timeout_is_left_alone() {
        let f = fixture();
        let prod = profile("prod");
        let service = f.registry.create(&request(&prod), None).await.unwrap().unwrap();
        let gateway = RecordingGateway::new(Agents::new([building(service.name())]));

        f.clock.forward(TimeDelta::hours(1));
        let report = server_ping(&f.registry, &gateway, &[prod]).await.unwrap();

        assert!(report.disabled.is_empty());
        assert!(f.docker.service_exists(service.name()));
    }

    #[tokio::test]
    async fn agent_without_service_is_disabled_and_deleted() {
        let f = fixture();
        let gateway = RecordingGateway::new(Agents::new([idle("gocd-agent-ghost")]));

        let report = server_ping(&f.registry, &gateway, &[profile("prod")]).await.unwrap();

        assert_eq!(gateway.disabled(), ["gocd-agent-ghost"]);
        assert_eq!(gateway.deleted(), ["gocd-agent-ghost"]);
        assert!(report.terminated.is_empty());
    }

    #[tokio::test]
    async fn unregistered_service_is_terminated_after_timeout() {
        let f = fixture();
        let prod = profile("prod");
        let service = f.registry.create(&request(&prod), None).await.unwrap().unwrap();
        let gateway = RecordingGateway::default();

        f.clock.forward(TimeDelta::minutes(5));
        let report = server_ping(&f.registry, &gateway, &[prod.clone()]).await.unwrap();
        assert!(report.terminated.is_empty());

        f.clock.forward(TimeDelta::minutes(6));
        let report = server_ping(&f.registry, &gateway, &[prod]).await.unwrap();
        assert_eq!(report.terminated, [service.name().to_string()]);
        assert!(!f.docker.service_exists(service.name()));
    }

    #[tokio::test]
    async fn broken_profile_does_not_stop_the_others() {
        let f = fixture();
        let prod = profile("prod");
        let service = f.registry.create(&request(&prod), None).await.unwrap().unwrap();
        f.docker.fail_lists(true);
        let gateway = RecordingGateway::default();

        f.clock.forward(TimeDelta::minutes(11));
        let report = server_ping(&f.registry, &gateway, &[profile("staging"), prod])
            .await
            .unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("staging"));
        assert_eq!(report.terminated, [service.name().to_string()]);
        assert!(f.clock.now() > service.created_at());
    }

    #[tokio::test]
    async fn agents_are_kept_while_a_listing_fails() {
        let f = fixture();
        let prod = profile("prod");
        f.docker.add_existing(existing("gocd-agent-live", "prod", &f.clock));
        f.docker.fail_lists(true);
        let gateway = RecordingGateway::new(Agents::new([idle("gocd-agent-live")]));

        let report = server_ping(&f.registry, &gateway, &[prod.clone()]).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("prod"));
        assert!(gateway.disabled().is_empty());
        assert!(gateway.deleted().is_empty());
        assert!(f.docker.service_exists("gocd-agent-live"));

        f.docker.fail_lists(false);
        let report = server_ping(&f.registry, &gateway, &[prod]).await.unwrap();

        assert_eq!(report, PingReport::default());
        assert!(f.registry.has_instance("gocd-agent-live"));
        assert!(f.docker.service_exists("gocd-agent-live"));
    }

    #[tokio::test]
    async fn disabled_agent_survives_a_failed_listing() {
        let f = fixture();
        let prod = profile("prod");
        f.docker.add_existing(existing("gocd-agent-live", "prod", &f.clock));
        f.docker.fail_lists(true);
        let gateway = RecordingGateway::new(Agents::new([Agent::new(
            "gocd-agent-live",
            AgentState::Idle,
            BuildState::Idle,
            AgentConfigState::Disabled,
        )]));

        let report = server_ping(&f.registry, &gateway, &[prod.clone()]).await.unwrap();

        assert!(report.deleted.is_empty());
        assert!(gateway.deleted().is_empty());
        assert!(f.docker.service_exists("gocd-agent-live"));

        f.docker.fail_lists(false);
        let report = server_ping(&f.registry, &gateway, &[prod]).await.unwrap();

        assert_eq!(report.terminated, ["gocd-agent-live"]);
        assert_eq!(gateway.deleted(), ["gocd-agent-live"]);
        assert!(!f.docker.service_exists("gocd-agent-live"));
    }

    #[tokio::test]
    async fn server_outage_is_an_error() {
        let f = fixture();
        let gateway = RecordingGateway::default();
        gateway.fail_listing(true);
        assert!(server_ping(&f.registry, &gateway, &[profile("prod")]).await.is_err());
    }
}
