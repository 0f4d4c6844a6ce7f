//! Agent-callable tool trait and registry, shared by the memory crate's
//! `memory_search` / `memory_get` / `kb_search` / `memory_write` tools.

pub mod tool_registry;

pub use tool_registry::{AgentTool, ToolRegistry};
