#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("invalid plugin settings: {0}")]
    InvalidSettings(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("cluster profiles file not found at {0}")]
    ProfilesNotFound(std::path::PathBuf),

    #[error("docker operation failed: {0}")]
    Docker(String),

    #[error("docker service '{0}' not found")]
    ServiceNotFound(String),

    #[error("server request failed: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
