pub mod driver;
pub mod gateway;
