//! Route descriptors, the compiled matcher, and the code-registered table.

pub mod registry;
pub mod table;

pub use registry::{json_validator, JsonValidator, RegisteredOptions, RouteRegistry};
pub use table::{build_upstream_path, Backend, PathParams, Route, RouteTable};
