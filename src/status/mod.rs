//! Read-only status API

pub mod handlers;
pub mod server;

pub use handlers::ApiResponse;
pub use server::StatusServer;
