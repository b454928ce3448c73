//! Gateway assembly: the dynamic policy handler and the HTTP server.

pub mod dynamic;
pub mod server;

pub use dynamic::DynamicGateway;
pub use server::{build_app, AppState};
