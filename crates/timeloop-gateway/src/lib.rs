//! # TimeLoop Gateway
//!
//! REST API over the TimeLoop database: registration and login (bcrypt + JWT),
//! capsule creation and listing, push token registration and the in-app
//! notification inbox.

pub mod auth;
pub mod error;
pub mod routes;
pub mod server;

pub use error::ApiError;
pub use server::{AppState, build_router, start};
