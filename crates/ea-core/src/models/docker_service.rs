use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of every service name this plugin generates.
pub const SERVICE_NAME_PREFIX: &str = "gocd-agent";

pub const CREATED_BY_LABEL_KEY: &str = "go.cd.elastic-agent.created-by";
pub const CLUSTER_PROFILE_LABEL_KEY: &str = "go.cd.elastic-agent.cluster-profile";
pub const ENVIRONMENT_LABEL_KEY: &str = "go.cd.elastic-agent.environment";
pub const JOB_IDENTIFIER_LABEL_KEY: &str = "go.cd.elastic-agent.job-identifier";

/// A swarm service as the docker daemon reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHandle {
    pub name: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// What to ask the daemon for when creating an agent service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub constraints: Vec<String>,
    pub limit_memory: Option<String>,
    pub reserve_memory: Option<String>,
    pub with_registry_auth: bool,
}

/// One agent instance tracked by the registry.
///
/// `name` doubles as the elastic agent id the server knows the agent by.
/// Two descriptors are equal when their names are.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerService {
    name: String,
    image: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<u64>,
}

impl DockerService {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        created_at: DateTime<Utc>,
        job_id: Option<u64>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            created_at,
            job_id,
        }
    }

    /// Rebuild a descriptor from a listed service.
    pub fn from_handle(handle: &ServiceHandle) -> Self {
        let job_id = handle
            .labels
            .get(JOB_IDENTIFIER_LABEL_KEY)
            .and_then(|raw| serde_json::from_str::<JobIdentifier>(raw).ok())
            .and_then(|job| job.job_id);
        Self::new(&handle.name, &handle.image, handle.created_at, job_id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn job_id(&self) -> Option<u64> {
        self.job_id
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.created_at
    }

    /// Whether the registration grace period has run out.
    ///
    /// An age exactly equal to the timeout is still within the grace period.
    pub fn is_past_timeout(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        self.age(now) > timeout
    }
}

impl PartialEq for DockerService {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for DockerService {}

impl Hash for DockerService {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// The build job an agent is being created for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobIdentifier {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_counter: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_counter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
}

impl JobIdentifier {
    pub fn with_job_id(job_id: u64) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    /// `pipeline/counter/stage/counter/job`, with blanks for unknown parts.
    pub fn represent(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.pipeline_name.as_deref().unwrap_or_default(),
            self.pipeline_counter.map(|c| c.to_string()).unwrap_or_default(),
            self.stage_name.as_deref().unwrap_or_default(),
            self.stage_counter.as_deref().unwrap_or_default(),
            self.job_name.as_deref().unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn equality_is_by_name() {
        let a = DockerService::new("gocd-agent-1", "alpine:latest", t0(), Some(1));
        let b = DockerService::new("gocd-agent-1", "busybox", t0() + TimeDelta::hours(1), None);
        let c = DockerService::new("gocd-agent-2", "alpine:latest", t0(), Some(1));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn timeout_boundary_is_lenient() {
        let service = DockerService::new("gocd-agent-1", "alpine", t0(), None);
        let timeout = TimeDelta::minutes(10);
        assert!(!service.is_past_timeout(t0() + TimeDelta::minutes(9), timeout));
        assert!(!service.is_past_timeout(t0() + timeout, timeout));
        assert!(service.is_past_timeout(t0() + timeout + TimeDelta::seconds(1), timeout));
    }

    #[test]
    fn from_handle_reads_job_label() {
        let mut labels = BTreeMap::new();
        labels.insert(
            JOB_IDENTIFIER_LABEL_KEY.to_string(),
            serde_json::to_string(&JobIdentifier::with_job_id(42)).unwrap(),
        );
        let handle = ServiceHandle {
            name: "gocd-agent-abc".into(),
            image: "alpine:latest".into(),
            created_at: t0(),
            labels,
        };
        let service = DockerService::from_handle(&handle);
        assert_eq!(service.name(), "gocd-agent-abc");
        assert_eq!(service.image(), "alpine:latest");
        assert_eq!(service.created_at(), t0());
        assert_eq!(service.job_id(), Some(42));
    }

    #[test]
    fn from_handle_tolerates_garbage_job_label() {
        let mut labels = BTreeMap::new();
        labels.insert(JOB_IDENTIFIER_LABEL_KEY.to_string(), "not json".to_string());
        let handle = ServiceHandle {
            name: "gocd-agent-abc".into(),
            image: "alpine".into(),
            created_at: t0(),
            labels,
        };
        assert_eq!(DockerService::from_handle(&handle).job_id(), None);
    }

    #[test]
    fn job_identifier_represent() {
        let job = JobIdentifier {
            pipeline_name: Some("build".into()),
            pipeline_counter: Some(12),
            stage_name: Some("test".into()),
            stage_counter: Some("1".into()),
            job_name: Some("unit".into()),
            ..JobIdentifier::with_job_id(7)
        };
        assert_eq!(job.represent(), "build/12/test/1/unit");
        assert_eq!(JobIdentifier::default().represent(), "////");
    }
}
