use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::clock::Clock;
use crate::error::{FleetError, Result};
use crate::models::docker_service::{CLUSTER_PROFILE_LABEL_KEY, CREATED_BY_LABEL_KEY};
use crate::models::{Agents, ClusterProfile, CreateAgentRequest, DockerService};
use crate::PLUGIN_ID;

use super::docker::{DockerClient, DockerConnector};
use super::gateway::{HealthMessage, ServerGateway};
use super::instance;

/// Whether a scope has been rebuilt from the cluster since process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    NotRefreshed,
    Refreshed,
}

#[derive(Debug)]
struct ScopeState {
    refresh: RefreshState,
    services: HashMap<String, DockerService>,
    /// Creates that passed the capacity check and are still talking to docker.
    reserved: usize,
}

#[derive(Debug)]
struct Scope {
    state: Mutex<ScopeState>,
    /// Held for the whole listing so only one refresh per scope is in flight.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl Scope {
    fn new() -> Self {
        Self {
            state: Mutex::new(ScopeState {
                refresh: RefreshState::NotRefreshed,
                services: HashMap::new(),
                reserved: 0,
            }),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Claim one slot if the scope is below `max`, counting in-flight creates.
fn reserve(scope: &Arc<Scope>, max: usize) -> Option<Reservation> {
    let mut state = scope.lock();
    if state.services.len() + state.reserved >= max {
        return None;
    }
    state.reserved += 1;
    Some(Reservation {
        scope: scope.clone(),
        released: false,
    })
}

/// A claimed capacity slot. Dropping it without committing gives it back.
struct Reservation {
    scope: Arc<Scope>,
    released: bool,
}

impl Reservation {
    fn commit(mut self, service: DockerService) {
        let mut state = self.scope.lock();
        state.reserved -= 1;
        state.services.insert(service.name().to_string(), service);
        self.released = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.scope.lock().reserved -= 1;
        }
    }
}

/// Result of an eviction sweep. One failure never stops the others.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub terminated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Every agent service this process knows about, grouped by cluster profile.
///
/// Each scope is rebuilt from the cluster once, on first use; after that only
/// [`create`](Self::create) and [`terminate`](Self::terminate) change it.
pub struct ServiceRegistry {
    scopes: RwLock<HashMap<String, Arc<Scope>>>,
    connector: Arc<dyn DockerConnector>,
    clock: Arc<dyn Clock>,
}

impl ServiceRegistry {
    pub fn new(connector: Arc<dyn DockerConnector>, clock: Arc<dyn Clock>) -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            connector,
            clock,
        }
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub async fn connect(&self, profile: &ClusterProfile) -> Result<Arc<dyn DockerClient>> {
        self.connector.connect(&profile.properties).await
    }

    fn scope(&self, id: &str) -> Arc<Scope> {
        if let Some(scope) = self.existing_scope(id) {
            return scope;
        }
        let mut scopes = self.scopes.write().unwrap_or_else(PoisonError::into_inner);
        scopes
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Scope::new()))
            .clone()
    }

    fn existing_scope(&self, id: &str) -> Option<Arc<Scope>> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn all_scopes(&self) -> Vec<Arc<Scope>> {
        self.scopes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn refresh_state(&self, profile: &ClusterProfile) -> RefreshState {
        self.existing_scope(&profile.id)
            .map_or(RefreshState::NotRefreshed, |scope| scope.lock().refresh)
    }

    /// Start an agent service for `request`, or return `None` when the
    /// cluster profile is already at capacity.
    pub async fn create(
        &self,
        request: &CreateAgentRequest,
        gateway: Option<&dyn ServerGateway>,
    ) -> Result<Option<DockerService>> {
        let profile = &request.cluster_profile;
        self.refresh_all(profile).await?;

        let scope = self.scope(&profile.id);
        let max = profile.properties.max_docker_containers() as usize;
        let Some(reservation) = reserve(&scope, max) else {
            tracing::warn!(
                cluster_profile = %profile.id,
                max,
                "capacity_reached"
            );
            if let Some(gateway) = gateway {
                let message = HealthMessage::warning(format!(
                    "The number of services currently running is at the maximum permissible limit ({max}). Not creating any more services."
                ));
                if let Err(e) = gateway.add_server_health_messages(&[message]).await {
                    tracing::warn!(error = %e, "health_message_failed");
                }
            }
            return Ok(None);
        };

        let docker = self.connect(profile).await?;
        let request = request.clone();
        let clock = self.clock.clone();
        // Runs to completion even when the caller stops waiting.
        let creation = tokio::spawn(async move {
            let service = instance::create(&request, docker.as_ref(), clock.as_ref()).await?;
            reservation.commit(service.clone());
            Ok::<_, FleetError>(service)
        });
        let service = creation
            .await
            .map_err(|e| FleetError::Docker(format!("service creation task failed: {e}")))??;
        Ok(Some(service))
    }

    /// Remove a service from the cluster and stop tracking it.
    ///
    /// A service that is already gone counts as removed. Any other failure
    /// keeps it tracked so a later sweep tries again.
    pub async fn terminate(&self, name: &str, profile: &ClusterProfile) -> Result<()> {
        let docker = self.connect(profile).await?;
        if let Err(e) = instance::terminate(name, docker.as_ref()).await {
            tracing::warn!(service = %name, cluster_profile = %profile.id, error = %e, "terminate_failed");
            return Err(e);
        }
        if let Some(scope) = self.existing_scope(&profile.id) {
            scope.lock().services.remove(name);
        }
        Ok(())
    }

    /// Rebuild the scope from the services labelled with it. Only the first
    /// successful call does anything.
    pub async fn refresh_all(&self, profile: &ClusterProfile) -> Result<()> {
        let scope = self.scope(&profile.id);
        let refreshed = scope.lock().refresh == RefreshState::Refreshed;
        if refreshed {
            return Ok(());
        }
        let _gate = scope.refresh_gate.lock().await;
        let refreshed = scope.lock().refresh == RefreshState::Refreshed;
        if refreshed {
            return Ok(());
        }

        let docker = self.connect(profile).await?;
        let handles = docker
            .list_services(&[
                (CREATED_BY_LABEL_KEY, PLUGIN_ID),
                (CLUSTER_PROFILE_LABEL_KEY, profile.id.as_str()),
            ])
            .await
            .inspect_err(|e| {
                tracing::warn!(cluster_profile = %profile.id, error = %e, "refresh_failed");
            })?;

        let services: HashMap<String, DockerService> = handles
            .iter()
            .map(DockerService::from_handle)
            .map(|s| (s.name().to_string(), s))
            .collect();
        let count = services.len();
        {
            let mut state = scope.lock();
            state.services = services;
            state.refresh = RefreshState::Refreshed;
        }
        tracing::info!(cluster_profile = %profile.id, count, "scope_refreshed");
        Ok(())
    }

    pub fn find(&self, name: &str, profile: &ClusterProfile) -> Option<DockerService> {
        self.existing_scope(&profile.id)
            .and_then(|scope| scope.lock().services.get(name).cloned())
    }

    /// Whether any scope tracks `name`.
    pub fn has_instance(&self, name: &str) -> bool {
        self.all_scopes()
            .iter()
            .any(|scope| scope.lock().services.contains_key(name))
    }

    /// Tracked services of a scope, oldest first.
    pub fn instances(&self, profile: &ClusterProfile) -> Vec<DockerService> {
        let mut services: Vec<DockerService> = self
            .existing_scope(&profile.id)
            .map(|scope| scope.lock().services.values().cloned().collect())
            .unwrap_or_default();
        services.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.name().cmp(b.name()))
        });
        services
    }

    pub fn instance_count(&self, profile: &ClusterProfile) -> usize {
        self.existing_scope(&profile.id)
            .map_or(0, |scope| scope.lock().services.len())
    }

    /// Services still inside their registration grace period that the server
    /// has not seen yet.
    pub fn instances_created_after_timeout(
        &self,
        profile: &ClusterProfile,
        agents: &Agents,
    ) -> Vec<DockerService> {
        let now = self.clock.now();
        let timeout = profile.properties.auto_register_timeout();
        self.instances(profile)
            .into_iter()
            .filter(|s| !s.is_past_timeout(now, timeout) && !agents.contains_id(s.name()))
            .collect()
    }

    /// Services that never registered and whose grace period is over.
    pub fn unregistered_instances_past_timeout(
        &self,
        profile: &ClusterProfile,
        agents: &Agents,
    ) -> Vec<DockerService> {
        let now = self.clock.now();
        let timeout = profile.properties.auto_register_timeout();
        self.instances(profile)
            .into_iter()
            .filter(|s| s.is_past_timeout(now, timeout) && !agents.contains_id(s.name()))
            .collect()
    }

    /// Registered agents whose service in this scope is older than the timeout.
    pub fn registered_agents_past_timeout(
        &self,
        profile: &ClusterProfile,
        agents: &Agents,
    ) -> Agents {
        let now = self.clock.now();
        let timeout = profile.properties.auto_register_timeout();
        agents
            .agents()
            .filter(|agent| {
                self.find(&agent.agent_id, profile)
                    .is_some_and(|s| s.is_past_timeout(now, timeout))
            })
            .cloned()
            .collect()
    }

    /// Terminate every service that missed its registration window.
    pub async fn terminate_unregistered_instances(
        &self,
        profile: &ClusterProfile,
        agents: &Agents,
    ) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        for service in self.unregistered_instances_past_timeout(profile, agents) {
            tracing::warn!(
                service = %service.name(),
                cluster_profile = %profile.id,
                created_at = %service.created_at(),
                "service_never_registered"
            );
            match self.terminate(service.name(), profile).await {
                Ok(()) => outcome.terminated.push(service.name().to_string()),
                Err(e) => outcome.failed.push((service.name().to_string(), e.to_string())),
            }
        }
        outcome
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("scopes", &self.all_scopes().len())
            .field("clock", &self.clock)
            .finish()
    }
}
