//! kache informer: reflector, listener fan-out and the controller run loop.
//!
//! ```text
//! ObjectSource → Reflector → DeltaQueue → dispatch loop → { Store, Processor → listeners }
//! ```
//!
//! Build a [`Controller`] over any [`kache_core::ObjectSource`], register listeners, call
//! [`Controller::run`] on a task and [`Controller::wait_for_cache_sync`] before trusting the
//! store.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod controller;
pub mod handler;
pub mod processor;
pub mod reflector;
pub mod testing;

pub use controller::Controller;
pub use handler::{HandlerFuncs, Notification, ResourceEventHandler};
pub use processor::{HandlerId, Processor};
pub use reflector::{Reflector, ReflectorState};

use kache_core::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("fatal source error: {0}")]
    Fatal(#[from] SourceError),
    #[error("informer is already running")]
    AlreadyRunning,
    #[error("internal: {0}")]
    Internal(String),
}

pub type InformerResult<T> = Result<T, InformerError>;
