//! # FW Service Gateway
//!
//! An HTTP API gateway for the FW environment: terminates client requests,
//! authorizes them against a policy catalog, rewrites and forwards them to
//! backend services, and emits a structured audit trail over Kafka. A
//! single correlation identifier (TCID, carried in `X-Fw-Header`) is woven
//! through every hop.
//!
//! Core subsystems:
//! - `routing`: declarative route descriptors compiled into an ordered
//!   matcher with typed path variables
//! - `middleware`: body limit, forwarded headers, correlation weaving,
//!   rate limiting, circuit breaking, access log
//! - `gateway`: the dynamic policy gateway and the server assembly
//! - `policy`: the catalog interface with MariaDB and mock backends
//! - `audit`: per-phase audit events over a bounded async publisher

pub mod audit;
pub mod core;
pub mod correlation;
pub mod gateway;
pub mod middleware;
pub mod policy;
pub mod proxy;
pub mod routing;

pub use crate::core::config::GatewayConfig;
pub use crate::core::error::{GatewayError, GatewayResult};
