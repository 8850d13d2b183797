//! Control plane for remote Android device sessions.
//!
//! A session is a set of cluster objects rendered from a device-profile
//! template and labelled `session=<id>`. The crate covers the whole path:
//!
//! - [`manifest`] renders profiles and screens the result for privileged settings.
//! - [`apply`] creates or replaces the objects in dependency order.
//! - [`session`] finds a session's pods by label and caches their address.
//! - [`relay`] forwards client commands to the agent running next to the device.
//! - [`stream`] connects clients to the device's screen stream.
//!
//! Cluster access goes through [`cluster::ClusterApi`], implemented by a
//! Kubernetes REST client and an in-memory cluster.

pub mod apply;
pub mod cluster;
pub mod error;
pub mod manifest;
pub mod provision;
pub mod relay;
pub mod session;
pub mod stream;

pub use error::{Error, Result};
