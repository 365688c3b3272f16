pub mod agent;
pub mod docker_service;
pub mod request;
pub mod settings;

pub use agent::{Agent, AgentConfigState, AgentState, Agents, BuildState};
pub use docker_service::{DockerService, JobIdentifier, ServiceHandle, ServiceSpec};
pub use request::CreateAgentRequest;
pub use settings::{ClusterProfile, DockerTls, PluginSettings, RegistryAuth};
