//! Client side of the attach protocol: authenticate, open the transport,
//! arbitrate the driver lease and render the remote terminal locally.

pub mod arbitration;
pub mod auth;
pub mod cli;
pub mod config;
pub mod controller;
pub mod credential;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod resize;
pub mod transport;

pub use controller::{ControllerOptions, SessionController, SessionEnd, SessionEvent};
pub use error::AttachError;
pub use lifecycle::{connect, AttachTarget, Connection, LifecycleConfig};
