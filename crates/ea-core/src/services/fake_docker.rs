//! In-memory stand-in for a swarm manager, for tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Clock;
use crate::error::{FleetError, Result};
use crate::models::{PluginSettings, ServiceHandle, ServiceSpec};

use super::docker::{DockerClient, DockerConnector};

#[derive(Debug, Default)]
struct FakeState {
    services: BTreeMap<String, ServiceHandle>,
    created: Vec<ServiceSpec>,
    removed: Vec<String>,
    connects: usize,
    list_calls: usize,
    fail_creates: bool,
    fail_lists: bool,
    fail_removes: HashSet<String>,
    create_delay: Option<Duration>,
    ack_delay: Option<Duration>,
}

#[derive(Debug)]
pub struct FakeDocker {
    clock: Arc<dyn Clock>,
    state: Mutex<FakeState>,
}

impl FakeDocker {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(FakeState::default()),
        })
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a service on the "cluster" without going through the registry.
    pub fn add_existing(&self, handle: ServiceHandle) {
        self.state().services.insert(handle.name.clone(), handle);
    }

    pub fn service_exists(&self, name: &str) -> bool {
        self.state().services.contains_key(name)
    }

    /// Drop a service as if someone ran `docker service rm` by hand.
    pub fn remove_service_out_of_band(&self, name: &str) {
        self.state().services.remove(name);
    }

    pub fn service_count(&self) -> usize {
        self.state().services.len()
    }

    pub fn created_specs(&self) -> Vec<ServiceSpec> {
        self.state().created.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn list_calls(&self) -> usize {
        self.state().list_calls
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state().fail_creates = fail;
    }

    pub fn fail_lists(&self, fail: bool) {
        self.state().fail_lists = fail;
    }

    pub fn fail_remove_of(&self, name: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.fail_removes.insert(name.to_string());
        } else {
            state.fail_removes.remove(name);
        }
    }

    pub fn delay_creates(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    /// Answer create calls only `delay` after the service exists.
    pub fn delay_acks(&self, delay: Duration) {
        self.state().ack_delay = Some(delay);
    }
}

#[async_trait]
impl DockerClient for FakeDocker {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceHandle> {
        let delay = self.state().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let (handle, ack_delay) = {
            let mut state = self.state();
            if state.fail_creates {
                return Err(FleetError::Docker("connection refused".into()));
            }
            let handle = ServiceHandle {
                name: spec.name.clone(),
                image: spec.image.clone(),
                created_at: self.clock.now(),
                labels: spec.labels.clone(),
            };
            state.created.push(spec.clone());
            state.services.insert(handle.name.clone(), handle.clone());
            (handle, state.ack_delay)
        };
        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handle)
    }

    async fn list_services(&self, labels: &[(&str, &str)]) -> Result<Vec<ServiceHandle>> {
        let mut state = self.state();
        state.list_calls += 1;
        if state.fail_lists {
            return Err(FleetError::Docker("connection refused".into()));
        }
        Ok(state
            .services
            .values()
            .filter(|h| {
                labels
                    .iter()
                    .all(|(k, v)| h.labels.get(*k).map(String::as_str) == Some(*v))
            })
            .cloned()
            .collect())
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceHandle>> {
        Ok(self.state().services.get(name).cloned())
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_removes.contains(name) {
            return Err(FleetError::Docker(format!("timeout removing {name}")));
        }
        match state.services.remove(name) {
            Some(_) => {
                state.removed.push(name.to_string());
                Ok(())
            }
            None => Err(FleetError::ServiceNotFound(name.to_string())),
        }
    }
}

/// Hands out the same fake for every cluster profile.
#[derive(Debug, Clone)]
pub struct FakeConnector(pub Arc<FakeDocker>);

#[async_trait]
impl DockerConnector for FakeConnector {
    async fn connect(&self, _settings: &PluginSettings) -> Result<Arc<dyn DockerClient>> {
        self.0.state().connects += 1;
        Ok(self.0.clone())
    }
}
