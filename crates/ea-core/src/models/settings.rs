use std::fmt;
use std::sync::LazyLock;

use chrono::TimeDelta;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{FleetError, Result};

/// Registration grace period applied when the server sends none.
pub const DEFAULT_AUTO_REGISTER_TIMEOUT_MINUTES: u32 = 10;

static ENV_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*=").unwrap());

/// PEM material for a TLS-protected docker endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct DockerTls {
    pub ca_cert: String,
    pub client_cert: String,
    pub client_key: String,
}

impl fmt::Debug for DockerTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DockerTls")
            .field("ca_cert", &format_args!("<{} bytes>", self.ca_cert.len()))
            .field("client_cert", &format_args!("<{} bytes>", self.client_cert.len()))
            .field("client_key", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub server_address: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("server_address", &self.server_address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings of one cluster profile, validated once when they arrive.
///
/// The wire form carries every number as a string; parsing happens in
/// `TryFrom<PluginSettingsWire>` and nothing is re-parsed later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PluginSettingsWire", into = "PluginSettingsWire")]
pub struct PluginSettings {
    go_server_url: String,
    docker_uri: String,
    tls: Option<DockerTls>,
    max_docker_containers: u32,
    auto_register_timeout_minutes: u32,
    environment_variables: Vec<String>,
    private_registry: Option<RegistryAuth>,
    private_registry_auth_enabled: bool,
}

impl PluginSettings {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn go_server_url(&self) -> &str {
        &self.go_server_url
    }

    pub fn docker_uri(&self) -> &str {
        &self.docker_uri
    }

    pub fn tls(&self) -> Option<&DockerTls> {
        self.tls.as_ref()
    }

    pub fn max_docker_containers(&self) -> u32 {
        self.max_docker_containers
    }

    pub fn auto_register_timeout_minutes(&self) -> u32 {
        self.auto_register_timeout_minutes
    }

    pub fn auto_register_timeout(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.auto_register_timeout_minutes))
    }

    /// `NAME=value` lines, in the order the operator wrote them.
    pub fn environment_variables(&self) -> &[String] {
        &self.environment_variables
    }

    /// Credentials to pull agent images with, when authentication is switched on.
    pub fn registry_auth(&self) -> Option<&RegistryAuth> {
        if self.private_registry_auth_enabled {
            self.private_registry.as_ref()
        } else {
            None
        }
    }

    pub fn with_max_docker_containers(mut self, max: u32) -> Self {
        self.max_docker_containers = max;
        self
    }

    pub fn with_auto_register_timeout_minutes(mut self, minutes: u32) -> Self {
        self.auto_register_timeout_minutes = minutes;
        self
    }
}

/// A named scope: every service is owned by exactly one cluster profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProfile {
    pub id: String,
    pub properties: PluginSettings,
}

impl ClusterProfile {
    pub fn new(id: impl Into<String>, properties: PluginSettings) -> Self {
        Self {
            id: id.into(),
            properties,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PluginSettingsWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    go_server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    environment_variables: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    max_docker_containers: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker_uri: Option<String>,
    #[serde(default, deserialize_with = "scalar", skip_serializing_if = "Option::is_none")]
    auto_register_timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker_ca_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker_client_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docker_client_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_registry_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_registry_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_registry_password: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    enable_private_registry_authentication: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(u64),
    Flag(bool),
}

impl Scalar {
    fn into_text(self) -> String {
        match self {
            Scalar::Text(text) => text,
            Scalar::Number(n) => n.to_string(),
            Scalar::Flag(b) => b.to_string(),
        }
    }
}

fn scalar<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(deserializer)?.map(Scalar::into_text))
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Option::<Scalar>::deserialize(deserializer)? {
        Some(Scalar::Flag(b)) => b,
        Some(Scalar::Number(n)) => n != 0,
        Some(Scalar::Text(text)) => text.trim().eq_ignore_ascii_case("true"),
        None => false,
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_count(field: &str, raw: &str) -> Result<u32> {
    raw.trim().parse::<u32>().map_err(|_| {
        FleetError::InvalidSettings(format!("{field} must be a non-negative integer, got '{raw}'"))
    })
}

fn split_lines(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl TryFrom<PluginSettingsWire> for PluginSettings {
    type Error = FleetError;

    fn try_from(wire: PluginSettingsWire) -> Result<Self> {
        let go_server_url = non_blank(wire.go_server_url)
            .ok_or_else(|| FleetError::InvalidSettings("go_server_url is required".into()))?;
        let docker_uri = non_blank(wire.docker_uri)
            .ok_or_else(|| FleetError::InvalidSettings("docker_uri is required".into()))?;

        let max_docker_containers = match non_blank(wire.max_docker_containers) {
            Some(raw) => parse_count("max_docker_containers", &raw)?,
            None => {
                return Err(FleetError::InvalidSettings(
                    "max_docker_containers is required".into(),
                ))
            }
        };
        let auto_register_timeout_minutes = match non_blank(wire.auto_register_timeout) {
            Some(raw) => parse_count("auto_register_timeout", &raw)?,
            None => DEFAULT_AUTO_REGISTER_TIMEOUT_MINUTES,
        };

        let tls = match (
            non_blank(wire.docker_ca_cert),
            non_blank(wire.docker_client_cert),
            non_blank(wire.docker_client_key),
        ) {
            (Some(ca_cert), Some(client_cert), Some(client_key)) => Some(DockerTls {
                ca_cert,
                client_cert,
                client_key,
            }),
            (None, None, None) => None,
            _ => {
                return Err(FleetError::InvalidSettings(
                    "docker_ca_cert, docker_client_cert and docker_client_key must be set together"
                        .into(),
                ))
            }
        };
        if docker_uri.starts_with("https://") && tls.is_none() {
            return Err(FleetError::InvalidSettings(
                "an https docker_uri needs TLS certificates".into(),
            ));
        }

        let environment_variables = split_lines(wire.environment_variables.as_deref());
        if let Some(bad) = environment_variables
            .iter()
            .find(|line| !ENV_LINE_RE.is_match(line))
        {
            return Err(FleetError::InvalidSettings(format!(
                "environment variable '{bad}' is not of the form NAME=value"
            )));
        }

        let server = wire.private_registry_server.unwrap_or_default();
        let username = wire.private_registry_username.unwrap_or_default();
        let password = wire.private_registry_password.unwrap_or_default();
        let private_registry = if [&server, &username, &password]
            .iter()
            .all(|v| v.trim().is_empty())
        {
            None
        } else {
            Some(RegistryAuth {
                server_address: server.trim().to_string(),
                username: username.trim().to_string(),
                password,
            })
        };
        let private_registry_auth_enabled = wire.enable_private_registry_authentication;
        if private_registry_auth_enabled {
            let complete = private_registry
                .as_ref()
                .is_some_and(|auth| !auth.server_address.is_empty() && !auth.username.is_empty());
            if !complete {
                return Err(FleetError::InvalidSettings(
                    "private registry authentication needs a server and a username".into(),
                ));
            }
        }

        Ok(Self {
            go_server_url: go_server_url.trim().to_string(),
            docker_uri: docker_uri.trim().to_string(),
            tls,
            max_docker_containers,
            auto_register_timeout_minutes,
            environment_variables,
            private_registry,
            private_registry_auth_enabled,
        })
    }
}

impl From<PluginSettings> for PluginSettingsWire {
    fn from(settings: PluginSettings) -> Self {
        let (docker_ca_cert, docker_client_cert, docker_client_key) = match settings.tls {
            Some(tls) => (Some(tls.ca_cert), Some(tls.client_cert), Some(tls.client_key)),
            None => (None, None, None),
        };
        let (private_registry_server, private_registry_username, private_registry_password) =
            match settings.private_registry {
                Some(auth) => (
                    Some(auth.server_address),
                    Some(auth.username),
                    Some(auth.password),
                ),
                None => (None, None, None),
            };
        let environment_variables = if settings.environment_variables.is_empty() {
            None
        } else {
            Some(settings.environment_variables.join("\n"))
        };

        Self {
            go_server_url: Some(settings.go_server_url),
            environment_variables,
            max_docker_containers: Some(settings.max_docker_containers.to_string()),
            docker_uri: Some(settings.docker_uri),
            auto_register_timeout: Some(settings.auto_register_timeout_minutes.to_string()),
            docker_ca_cert,
            docker_client_cert,
            docker_client_key,
            private_registry_server,
            private_registry_username,
            private_registry_password,
            enable_private_registry_authentication: settings.private_registry_auth_enabled,
        }
    }
}
