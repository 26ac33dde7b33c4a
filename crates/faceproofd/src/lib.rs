//! faceproofd — face comparison, liveness and head-turn challenge service.
//!
//! [`engine::Engine`] owns the loaded models and runs each request under a
//! timeout. Images come in through [`fetch`], challenge state lives in a
//! [`cache::KeyValueCache`], and results leave as a
//! [`response::ServiceResponse`] over D-Bus.

pub mod cache;
pub mod challenge;
pub mod config;
pub mod dbus_interface;
pub mod engine;
pub mod fetch;
pub mod response;
pub mod stats;
pub mod store;
pub mod verifier;

pub use engine::{Engine, EngineError, EngineOptions};
pub use response::ServiceResponse;
