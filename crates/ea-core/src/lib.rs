pub mod clock;
pub mod error;
pub mod models;
pub mod services;

pub use clock::{Clock, SystemClock, TestClock};
pub use error::{FleetError, Result};

/// Identifier this plugin stamps on every service it creates.
pub const PLUGIN_ID: &str = "cd.go.contrib.elastic-agent.docker-swarm";
