pub mod config_loader;
pub mod docker;
#[cfg(any(test, feature = "test-support"))]
pub mod fake_docker;
#[cfg(any(test, feature = "test-support"))]
pub mod fake_gateway;
pub mod gateway;
pub mod instance;
pub mod ping;
pub mod registry;
pub mod status;
