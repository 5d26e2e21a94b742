//! devbus-broker library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod broker;
pub mod config;
pub mod devices;
pub mod router;
pub mod telemetry;
pub mod transport;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use router::{Router, RouterError};
