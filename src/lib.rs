//! Offline cache and push-notification agent for a web application.
//!
//! The agent is purely reactive: the host hands it lifecycle, fetch, push and
//! notification-click events, and it answers them from a versioned cache
//! store, the network, and the platform's notification and window APIs.

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod host;
pub mod interceptor;
pub mod lifecycle;
pub mod net;
pub mod notify;
pub mod platform;

#[cfg(test)]
mod testing;

pub use agent::{Agent, EventOutcome};
pub use config::AgentConfig;
pub use host::{AgentHost, RegistrationOutcome};
