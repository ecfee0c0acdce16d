//! # TimeLoop Core
//!
//! Configuration and error types shared by the scheduler, the gateway and the
//! `timeloop` binary.

pub mod config;
pub mod error;

pub use config::TimeLoopConfig;
pub use error::{Result, TimeLoopError};
