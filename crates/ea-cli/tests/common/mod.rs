// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use ea_cli::driver::{Driver, Response};
use ea_core::models::{ClusterProfile, PluginSettings};
use ea_core::services::fake_docker::{FakeConnector, FakeDocker};
use ea_core::services::registry::ServiceRegistry;
use ea_core::TestClock;

pub struct Harness {
    pub clock: Arc<TestClock>,
    pub docker: Arc<FakeDocker>,
    pub driver: Driver,
}

/// A driver over an in-memory swarm, with the clock frozen at a fixed instant.
pub fn harness(profiles: Vec<ClusterProfile>) -> Harness {
    let clock = Arc::new(TestClock::at(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
    let docker = FakeDocker::new(clock.clone());
    let registry = Arc::new(ServiceRegistry::new(
        Arc::new(FakeConnector(docker.clone())),
        clock.clone(),
    ));
    Harness {
        clock,
        docker,
        driver: Driver::new(registry, profiles),
    }
}

pub fn profile(id: &str, max: u32) -> ClusterProfile {
    let settings = PluginSettings::from_json(&format!(
        r#"{{"go_server_url":"https://ci/go","docker_uri":"tcp://swarm:2375","max_docker_containers":"{max}"}}"#
    ))
    .unwrap();
    ClusterProfile::new(id, settings)
}

/// A `create-agent` line for the given cluster profile.
pub fn create_line(profile_id: &str, max: u32) -> String {
    format!(
        r#"{{"request":"create-agent","auto_register_key":"key","elastic_agent_profile_properties":{{"Image":"alpine:latest"}},"job_identifier":{{"job_id":1}},"cluster_profile":{{"id":"{profile_id}","properties":{{"go_server_url":"https://ci/go","docker_uri":"tcp://swarm:2375","max_docker_containers":"{max}"}}}}}}"#
    )
}

/// Feed one line and render the response the way the daemon writes it.
pub async fn send(driver: &mut Driver, line: &str) -> String {
    let response = driver.handle_line(line).await.expect("line produced no response");
    serde_json::to_string(&response).unwrap()
}

pub async fn create(driver: &mut Driver, profile_id: &str, max: u32) -> String {
    match driver.handle_line(&create_line(profile_id, max)).await {
        Some(Response::Created { agent_id, .. }) => agent_id,
        other => panic!("expected a created agent, got {other:?}"),
    }
}
