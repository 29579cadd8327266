//! Tool registry: the set of tools the model may call, keyed by name.
//!
//! Built once from the enabled toolsets, immutable afterwards, and therefore
//! safe to share across concurrent runs. Background toolset refresh replaces
//! the whole registry atomically rather than mutating it.

use crate::tools::{Tool, Toolset, ToolsetStatus, tool_schema};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Immutable lookup table of enabled tools plus their pre-computed schema view.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    schemas: Vec<Value>,
}

impl ToolRegistry {
    /// An empty registry; the loop still works, it just never dispatches.
    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
            schemas: Vec::new(),
        }
    }

    /// Build a registry from toolsets.
    ///
    /// Only toolsets whose status is `Enabled` contribute tools. When two
    /// tools share a name the later registration wins and a warning is
    /// emitted. At most one logging toolset is registered: the first
    /// non-default enabled one, or the first default if no user-supplied
    /// logging toolset is enabled.
    pub fn build(toolsets: &[Arc<dyn Toolset>]) -> Self {
        let enabled: Vec<&Arc<dyn Toolset>> = toolsets
            .iter()
            .filter(|ts| ts.status() == ToolsetStatus::Enabled)
            .collect();

        let selected_logging = select_logging_toolset(&enabled);

        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        // Insertion order drives the schema view, so track it separately
        // from the lookup map.
        let mut order: Vec<String> = Vec::new();

        for toolset in enabled {
            if toolset.is_logging() && Some(toolset.name()) != selected_logging.as_deref() {
                continue;
            }
            for tool in toolset.tools() {
                let name = tool.name().to_string();
                if tools.insert(name.clone(), tool).is_some() {
                    warn!(
                        tool = %name,
                        toolset = toolset.name(),
                        "overriding previously registered tool"
                    );
                } else {
                    order.push(name);
                }
            }
        }

        let schemas = order
            .iter()
            .map(|name| tool_schema(tools[name].as_ref()))
            .collect();

        Self { tools, schemas }
    }

    /// Look up a tool by name. Unknown names return `None`; the executor
    /// turns that into an in-band error result.
    pub fn lookup(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// The pre-computed OpenAI-format schema view for completions.
    pub fn schemas(&self) -> &[Value] {
        &self.schemas
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry holds no tools.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Pick the single logging toolset to register: the first non-default
/// enabled one wins over any default.
fn select_logging_toolset(enabled: &[&Arc<dyn Toolset>]) -> Option<String> {
    let logging: Vec<_> = enabled.iter().filter(|ts| ts.is_logging()).collect();
    if logging.is_empty() {
        return None;
    }

    let selected = logging
        .iter()
        .find(|ts| !ts.is_default())
        .or_else(|| logging.first())
        .map(|ts| ts.name().to_string());

    if logging.len() > 1 {
        warn!(
            selected = selected.as_deref().unwrap_or(""),
            candidates = logging.len(),
            "multiple logging toolsets enabled, registering only one"
        );
    }
    selected
}
