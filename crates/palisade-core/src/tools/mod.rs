//! Tool registry consumed by the chat/tool loop.
//!
//! Concrete tool implementations (web fetch, filesystem, browser bridges)
//! live outside the gateway; this module defines the interface the core
//! consumes plus the registry the loop and the plugin loader share.

pub mod registry;
pub mod traits;

pub use registry::ToolRegistry;
pub use traits::{ArgKind, ArgSpec, Tool, ToolInfo};
