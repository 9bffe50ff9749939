//! Provision Common - DUT provisioning shared by the host tool and the agent.
//!
//! OS images are streamed from the blob store onto the inactive A/B slot by
//! the on-device agent; firmware is flashed by a step chain with per-step
//! rollback, either on the DUT or through its servo host.

pub mod blob;
pub mod build;
pub mod config;
pub mod copy;
pub mod engine;
pub mod error;
pub mod firmware;
pub mod flash;
pub mod logging;
pub mod orchestrator;
pub mod os_update;
pub mod partition;
pub mod progress;
pub mod transport;
pub mod wire;

pub use error::{ErrorKind, ProvisionError, Result};
