use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{
    Limit, ResourceObject, Service, ServiceSpec as SwarmServiceSpec, TaskSpec,
    TaskSpecContainerSpec, TaskSpecPlacement, TaskSpecResources,
};
use bollard::service::{InspectServiceOptions, ListServicesOptions};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};

use crate::error::{FleetError, Result};
use crate::models::{PluginSettings, RegistryAuth, ServiceHandle, ServiceSpec};

/// Seconds before a request to the daemon is abandoned.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// The slice of the swarm API the registry needs.
#[async_trait]
pub trait DockerClient: Send + Sync {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceHandle>;

    /// Services carrying every one of the given labels.
    async fn list_services(&self, labels: &[(&str, &str)]) -> Result<Vec<ServiceHandle>>;

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceHandle>>;

    /// Fails with [`FleetError::ServiceNotFound`] when there is nothing to remove.
    async fn remove_service(&self, name: &str) -> Result<()>;
}

/// Builds a client for the endpoint described by a cluster profile.
#[async_trait]
pub trait DockerConnector: Send + Sync {
    async fn connect(&self, settings: &PluginSettings) -> Result<Arc<dyn DockerClient>>;
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn docker_error(what: &str, e: bollard::errors::Error) -> FleetError {
    FleetError::Docker(format!("{what} failed: {e}"))
}

/// Parse a docker memory size such as `512M` or `2g` into bytes.
pub fn parse_memory(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let invalid = || FleetError::InvalidRequest(format!("'{raw}' is not a memory size"));
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: i64 = digits.parse().map_err(|_| invalid())?;
    let multiplier: i64 = match unit.to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kb" => 1 << 10,
        "m" | "mb" => 1 << 20,
        "g" | "gb" => 1 << 30,
        _ => return Err(invalid()),
    };
    value.checked_mul(multiplier).ok_or_else(invalid)
}

/// Translate a service request into the swarm API's service spec.
pub fn swarm_spec(spec: &ServiceSpec) -> Result<SwarmServiceSpec> {
    let limits = spec
        .limit_memory
        .as_deref()
        .map(parse_memory)
        .transpose()?
        .map(|bytes| Limit {
            memory_bytes: Some(bytes),
            ..Default::default()
        });
    let reservations = spec
        .reserve_memory
        .as_deref()
        .map(parse_memory)
        .transpose()?
        .map(|bytes| ResourceObject {
            memory_bytes: Some(bytes),
            ..Default::default()
        });
    let resources = (limits.is_some() || reservations.is_some()).then(|| TaskSpecResources {
        limits,
        reservations,
        ..Default::default()
    });
    let placement = (!spec.constraints.is_empty()).then(|| TaskSpecPlacement {
        constraints: Some(spec.constraints.clone()),
        ..Default::default()
    });

    Ok(SwarmServiceSpec {
        name: Some(spec.name.clone()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(spec.image.clone()),
                args: (!spec.command.is_empty()).then(|| spec.command.clone()),
                env: Some(spec.env.clone()),
                labels: Some(spec.labels.clone().into_iter().collect()),
                ..Default::default()
            }),
            resources,
            placement,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Read back what the registry needs from an inspected service.
pub fn handle_from_service(service: Service) -> Result<ServiceHandle> {
    let spec = service
        .spec
        .ok_or_else(|| FleetError::Docker("service has no spec".into()))?;
    let name = spec
        .name
        .ok_or_else(|| FleetError::Docker("service has no name".into()))?;
    let image = spec
        .task_template
        .and_then(|t| t.container_spec)
        .and_then(|c| c.image)
        .unwrap_or_default();
    let created_at = service
        .created_at
        .as_deref()
        .map(DateTime::parse_from_rfc3339)
        .transpose()
        .map_err(|e| FleetError::Docker(format!("service '{name}' has a bad creation time: {e}")))?
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| FleetError::Docker(format!("service '{name}' has no creation time")))?;

    Ok(ServiceHandle {
        // Pinned images come back as `image:tag@sha256:...`.
        image: image.split('@').next().unwrap_or_default().to_string(),
        labels: spec.labels.unwrap_or_default().into_iter().collect::<BTreeMap<_, _>>(),
        name,
        created_at,
    })
}

/// Talks to the swarm manager over the engine API.
#[derive(Debug, Clone)]
pub struct DockerApi {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerApi {
    pub fn new(docker: Docker, registry_auth: Option<&RegistryAuth>) -> Self {
        let credentials = registry_auth.map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            serveraddress: Some(auth.server_address.clone()),
            ..Default::default()
        });
        Self {
            docker,
            credentials,
        }
    }
}

#[async_trait]
impl DockerClient for DockerApi {
    async fn create_service(&self, spec: &ServiceSpec) -> Result<ServiceHandle> {
        let credentials = if spec.with_registry_auth {
            self.credentials.clone()
        } else {
            None
        };
        self.docker
            .create_service(swarm_spec(spec)?, credentials)
            .await
            .map_err(|e| docker_error("service create", e))?;
        tracing::debug!(service = %spec.name, "docker_service_created");

        self.inspect_service(&spec.name).await?.ok_or_else(|| {
            FleetError::Docker(format!("service '{}' vanished right after creation", spec.name))
        })
    }

    async fn list_services(&self, labels: &[(&str, &str)]) -> Result<Vec<ServiceHandle>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>(),
        );
        let services = self
            .docker
            .list_services(Some(ListServicesOptions {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| docker_error("service ls", e))?;
        services.into_iter().map(handle_from_service).collect()
    }

    async fn inspect_service(&self, name: &str) -> Result<Option<ServiceHandle>> {
        match self
            .docker
            .inspect_service(name, None::<InspectServiceOptions>)
            .await
        {
            Ok(service) => handle_from_service(service).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(docker_error("service inspect", e)),
        }
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        match self.docker.delete_service(name).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(FleetError::ServiceNotFound(name.to_string())),
            Err(e) => Err(docker_error("service rm", e)),
        }
    }
}

/// Produces [`DockerApi`] clients, materialising TLS material on disk.
#[derive(Debug, Clone)]
pub struct DockerApiConnector {
    cert_root: PathBuf,
}

impl DockerApiConnector {
    pub fn new(cert_root: PathBuf) -> Self {
        Self { cert_root }
    }

    fn cert_dir(&self, docker_uri: &str) -> PathBuf {
        let slug: String = docker_uri
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.cert_root.join(slug)
    }

    /// Write the profile's PEM files, returning their directory.
    async fn write_tls_material(&self, settings: &PluginSettings) -> Result<Option<PathBuf>> {
        let Some(tls) = settings.tls() else {
            return Ok(None);
        };
        let dir = self.cert_dir(settings.docker_uri());
        tokio::fs::create_dir_all(&dir).await?;
        write_private(&dir.join("ca.pem"), &tls.ca_cert).await?;
        write_private(&dir.join("cert.pem"), &tls.client_cert).await?;
        write_private(&dir.join("key.pem"), &tls.client_key).await?;
        Ok(Some(dir))
    }
}

impl Default for DockerApiConnector {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("ea-docker-certs"))
    }
}

async fn write_private(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

fn open(docker_uri: &str, tls_dir: Option<&Path>) -> Result<Docker> {
    let connected = match (docker_uri.strip_prefix("unix://"), tls_dir) {
        (Some(socket), _) => {
            Docker::connect_with_unix(socket, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
        (None, Some(dir)) => Docker::connect_with_ssl(
            docker_uri,
            &dir.join("key.pem"),
            &dir.join("cert.pem"),
            &dir.join("ca.pem"),
            REQUEST_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        ),
        (None, None) => {
            Docker::connect_with_http(docker_uri, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
        }
    };
    connected.map_err(|e| docker_error(&format!("connecting to {docker_uri}"), e))
}

#[async_trait]
impl DockerConnector for DockerApiConnector {
    async fn connect(&self, settings: &PluginSettings) -> Result<Arc<dyn DockerClient>> {
        let tls_dir = self.write_tls_material(settings).await?;
        let docker = open(settings.docker_uri(), tls_dir.as_deref())?;
        Ok(Arc::new(DockerApi::new(docker, settings.registry_auth())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inspected(name: &str, image: &str, created_at: Option<&str>) -> Service {
        let mut labels = HashMap::new();
        labels.insert("go.cd.elastic-agent.cluster-profile".to_string(), "prod".to_string());
        Service {
            id: Some("q1w2e3".into()),
            created_at: created_at.map(str::to_string),
            spec: Some(SwarmServiceSpec {
                name: Some(name.into()),
                labels: Some(labels),
                task_template: Some(TaskSpec {
                    container_spec: Some(TaskSpecContainerSpec {
                        image: Some(image.into()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn handle_from_inspected_service() {
        let handle = handle_from_service(inspected(
            "gocd-agent-abc",
            "alpine:latest@sha256:deadbeef",
            Some("2024-03-01T09:00:00.123456789Z"),
        ))
        .unwrap();
        assert_eq!(handle.name, "gocd-agent-abc");
        assert_eq!(handle.image, "alpine:latest");
        assert_eq!(handle.labels["go.cd.elastic-agent.cluster-profile"], "prod");
        assert_eq!(handle.created_at.to_rfc3339(), "2024-03-01T09:00:00.123456789+00:00");
    }

    #[test]
    fn service_without_creation_time_is_rejected() {
        let err = handle_from_service(inspected("gocd-agent-abc", "busybox", None)).unwrap_err();
        assert!(matches!(err, FleetError::Docker(_)));
    }

    #[test]
    fn swarm_spec_carries_every_field() {
        let mut labels = BTreeMap::new();
        labels.insert("a".to_string(), "1".to_string());
        let spec = ServiceSpec {
            name: "gocd-agent-x".into(),
            image: "alpine:latest".into(),
            command: vec!["/bin/sleep".into(), "5".into()],
            env: vec!["GO_EA_SERVER_URL=https://ci/go".into()],
            labels,
            constraints: vec!["node.role==worker".into()],
            limit_memory: Some("1G".into()),
            reserve_memory: Some("512m".into()),
            with_registry_auth: true,
        };
        let swarm = swarm_spec(&spec).unwrap();
        assert_eq!(swarm.name.as_deref(), Some("gocd-agent-x"));
        assert_eq!(swarm.labels.as_ref().unwrap()["a"], "1");

        let task = swarm.task_template.unwrap();
        let container = task.container_spec.unwrap();
        assert_eq!(container.image.as_deref(), Some("alpine:latest"));
        assert_eq!(container.args.unwrap(), ["/bin/sleep", "5"]);
        assert_eq!(container.env.unwrap(), ["GO_EA_SERVER_URL=https://ci/go"]);

        let resources = task.resources.unwrap();
        assert_eq!(resources.limits.unwrap().memory_bytes, Some(1 << 30));
        assert_eq!(resources.reservations.unwrap().memory_bytes, Some(512 << 20));
        assert_eq!(task.placement.unwrap().constraints.unwrap(), ["node.role==worker"]);
    }

    #[test]
    fn minimal_swarm_spec_leaves_optional_parts_out() {
        let spec = ServiceSpec {
            name: "gocd-agent-y".into(),
            image: "busybox".into(),
            ..Default::default()
        };
        let task = swarm_spec(&spec).unwrap().task_template.unwrap();
        assert!(task.resources.is_none());
        assert!(task.placement.is_none());
        assert!(task.container_spec.unwrap().args.is_none());
    }

    #[test]
    fn memory_sizes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("2k").unwrap(), 2048);
        assert_eq!(parse_memory(" 512M ").unwrap(), 512 << 20);
        assert_eq!(parse_memory("3gb").unwrap(), 3 << 30);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("12x").is_err());
        assert!(parse_memory("").is_err());
    }

    #[test]
    fn bad_memory_size_fails_the_spec() {
        let spec = ServiceSpec {
            name: "gocd-agent-z".into(),
            image: "busybox".into(),
            limit_memory: Some("plenty".into()),
            ..Default::default()
        };
        assert!(matches!(swarm_spec(&spec), Err(FleetError::InvalidRequest(_))));
    }

    #[test]
    fn only_404_means_not_found() {
        let missing = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "service gocd-agent-x not found".into(),
        };
        let refused = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "context not found".into(),
        };
        assert!(is_not_found(&missing));
        assert!(!is_not_found(&refused));
    }

    #[tokio::test]
    async fn connector_writes_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let connector = DockerApiConnector::new(dir.path().to_path_buf());
        let settings = PluginSettings::from_json(
            r#"{"go_server_url":"https://ci/go","docker_uri":"https://swarm:2376","max_docker_containers":"1",
                "docker_ca_cert":"CA","docker_client_cert":"CERT","docker_client_key":"KEY"}"#,
        )
        .unwrap();
        let cert_dir = connector.write_tls_material(&settings).await.unwrap().unwrap();

        assert_eq!(cert_dir, connector.cert_dir("https://swarm:2376"));
        assert_eq!(std::fs::read_to_string(cert_dir.join("ca.pem")).unwrap(), "CA");
        assert_eq!(std::fs::read_to_string(cert_dir.join("cert.pem")).unwrap(), "CERT");
        assert_eq!(std::fs::read_to_string(cert_dir.join("key.pem")).unwrap(), "KEY");
    }

    #[tokio::test]
    async fn plain_endpoint_needs_no_tls_material() {
        let dir = tempfile::tempdir().unwrap();
        let connector = DockerApiConnector::new(dir.path().to_path_buf());
        let settings = PluginSettings::from_json(
            r#"{"go_server_url":"https://ci/go","docker_uri":"tcp://swarm:2375","max_docker_containers":"1"}"#,
        )
        .unwrap();
        assert!(connector.write_tls_material(&settings).await.unwrap().is_none());
        assert!(connector.connect(&settings).await.is_ok());
    }
}
