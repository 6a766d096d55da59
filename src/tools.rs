//! Tool registry: name → (declaration, handler) with exception isolation
//!
//! Tool failures are first-class protocol results, not JSON-RPC errors:
//! clients want to see them and present them to the user. A handler that
//! panics therefore produces an `is_error` result instead of tearing
//! anything down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::protocol::{Tool, ToolCallResult};

/// Handler invoked for `tools/call`; receives the arguments object
pub type ToolHandler = Arc<dyn Fn(&Value) -> ToolCallResult + Send + Sync>;

struct RegisteredTool {
    tool: Tool,
    handler: ToolHandler,
}

/// Thread-safe mapping from tool name to declaration and handler.
///
/// The registry lock is held across the handler invocation, which serializes
/// tool calls process-wide.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<Mutex<HashMap<String, RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Returns `false` when the name is empty or already
    /// taken; an existing registration is never overwritten.
    pub fn register(&self, tool: Tool, handler: ToolHandler) -> bool {
        if tool.name.is_empty() {
            return false;
        }
        let mut tools = self.tools.lock().unwrap();
        if tools.contains_key(&tool.name) {
            return false;
        }
        tools.insert(tool.name.clone(), RegisteredTool { tool, handler });
        true
    }

    /// Remove a tool; removing an unknown name is a no-op.
    pub fn unregister(&self, name: &str) {
        self.tools.lock().unwrap().remove(name);
    }

    /// Snapshot of all declarations. Ordering is unspecified.
    pub fn list(&self) -> Vec<Tool> {
        let tools = self.tools.lock().unwrap();
        tools.values().map(|entry| entry.tool.clone()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.lock().unwrap().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.lock().unwrap().is_empty()
    }

    /// Invoke a tool by name.
    ///
    /// Unknown names and panicking handlers both surface as tool-level
    /// error results.
    pub fn call(&self, name: &str, arguments: &Value) -> ToolCallResult {
        let tools = self.tools.lock().unwrap();
        let Some(entry) = tools.get(name) else {
            return ToolCallResult::error(format!("Tool not found: {name}"));
        };
        match catch_unwind(AssertUnwindSafe(|| (entry.handler)(arguments))) {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned());
                match detail {
                    Some(detail) => {
                        ToolCallResult::error(format!("Tool execution error: {detail}"))
                    }
                    None => ToolCallResult::error("Unknown error during tool execution"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ToolContent;
    use serde_json::json;

    fn echo_tool(name: &str) -> (Tool, ToolHandler) {
        let tool = Tool::new(name, "echoes its input");
        let handler: ToolHandler =
            Arc::new(|args| ToolCallResult::success(args.to_string()));
        (tool, handler)
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = ToolRegistry::new();
        let (tool, handler) = echo_tool("echo");
        assert!(registry.register(tool.clone(), handler.clone()));
        assert!(!registry.register(tool, handler));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn register_rejects_empty_name() {
        let registry = ToolRegistry::new();
        let (tool, handler) = echo_tool("");
        assert!(!registry.register(tool, handler));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ToolRegistry::new();
        let (tool, handler) = echo_tool("echo");
        registry.register(tool, handler);
        registry.unregister("echo");
        registry.unregister("echo");
        assert!(!registry.has("echo"));
    }

    #[test]
    fn call_unknown_tool_reports_not_found() {
        let registry = ToolRegistry::new();
        let result = registry.call("missing", &json!({}));
        assert!(result.is_error);
        assert_eq!(
            result.content,
            vec![ToolContent::text("Tool not found: missing")]
        );
    }

    #[test]
    fn call_passes_arguments_to_handler() {
        let registry = ToolRegistry::new();
        let handler: ToolHandler = Arc::new(|args| {
            let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
            let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            ToolCallResult::success((a + b).to_string())
        });
        registry.register(Tool::new("add", "adds"), handler);

        let result = registry.call("add", &json!({"a": 2, "b": 3}));
        assert!(!result.is_error);
        assert_eq!(result.content[0].text, "5");
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let registry = ToolRegistry::new();
        let handler: ToolHandler = Arc::new(|_| panic!("handler exploded"));
        registry.register(Tool::new("boom", "panics"), handler);

        let result = registry.call("boom", &json!({}));
        assert!(result.is_error);
        assert_eq!(
            result.content[0].text,
            "Tool execution error: handler exploded"
        );

        // Registry stays usable afterwards.
        let (tool, echo) = echo_tool("echo");
        registry.register(tool, echo);
        assert!(!registry.call("echo", &json!({"x": 1})).is_error);
    }

    #[test]
    fn non_string_panic_payload_gets_generic_message() {
        let registry = ToolRegistry::new();
        let handler: ToolHandler = Arc::new(|_| std::panic::panic_any(42_u32));
        registry.register(Tool::new("odd", "panics oddly"), handler);

        let result = registry.call("odd", &json!({}));
        assert!(result.is_error);
        assert_eq!(result.content[0].text, "Unknown error during tool execution");
    }

    #[test]
    fn formatted_panic_message_is_captured() {
        let registry = ToolRegistry::new();
        let handler: ToolHandler = Arc::new(|args| {
            let divisor = args.get("b").and_then(Value::as_i64).unwrap_or(0);
            panic!("division by {divisor} is undefined")
        });
        registry.register(Tool::new("div", "divides"), handler);

        let result = registry.call("div", &json!({"b": 0}));
        assert_eq!(
            result.content[0].text,
            "Tool execution error: division by 0 is undefined"
        );
    }
}
