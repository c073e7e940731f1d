pub mod cli;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod notifications;
pub mod registry;
pub mod runtime;
pub mod startup;

pub use engine::InstanceManager;
pub use error::{InstanceError, InstanceResult};
