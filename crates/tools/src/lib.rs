//! `tools` crate: the `Action` trait, the tool registry, and built-in actions.
//!
//! Every action the engine can run must implement [`Action`] and be
//! registered by name in a [`ToolRegistry`]. The engine crate resolves step
//! actions through the registry at execution time.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod schema;
pub mod traits;

pub use error::{RegistryError, ToolError};
pub use registry::{ActionConstructor, RemoteSource, ResolvedTool, ToolHandle, ToolRegistry};
pub use schema::{ParamKind, ParamSpec, ToolSchema};
pub use traits::{Action, Args, InvocationContext};
