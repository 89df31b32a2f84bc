//! HTTP bridge between the dashboard and the connection pool

pub mod server;

pub use server::{router, serve, ApiError, AppState};
