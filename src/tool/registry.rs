//! The canonical directory of tools (§4.1).
//!
//! Read-mostly: tools are typically registered at startup and then only
//! looked up, but runtime registration is supported and synchronized.
//! The registry never validates tool *semantics* — only that names are
//! unique and parameter declarations are well-formed.

use super::types::{Tool, ToolError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe, read-mostly tool directory.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a single tool. Rejects duplicate names and tools with
    /// malformed parameter declarations (e.g. a required parameter that
    /// also declares a default, which is self-contradictory).
    pub fn register(&self, tool: Tool) -> Result<(), ToolError> {
        validate_tool_shape(&tool)?;
        let mut map = self.inner.write().expect("tool registry lock poisoned");
        if map.contains_key(&tool.name) {
            return Err(ToolError::AlreadyRegistered(tool.name));
        }
        map.insert(tool.name.clone(), Arc::new(tool));
        Ok(())
    }

    pub fn register_all(&self, tools: Vec<Tool>) -> Result<(), ToolError> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.inner.write().expect("tool registry lock poisoned").remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.inner.read().expect("tool registry lock poisoned").get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().expect("tool registry lock poisoned").contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.read().expect("tool registry lock poisoned").len()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.inner.read().expect("tool registry lock poisoned").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list(&self) -> Vec<Arc<Tool>> {
        let map = self.inner.read().expect("tool registry lock poisoned");
        let mut tools: Vec<_> = map.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// The textual tools catalog injected verbatim into planner and
    /// binding prompts: one line per tool, name-sorted for determinism.
    pub fn catalog_text(&self) -> String {
        self.list().iter().map(|t| t.catalog_line()).collect::<Vec<_>>().join("\n")
    }

    /// OpenAI-style function-calling schemas, one per registered tool.
    pub fn function_schemas(&self) -> Vec<serde_json::Value> {
        self.list().iter().map(|t| t.to_function_schema()).collect()
    }
}

fn validate_tool_shape(tool: &Tool) -> Result<(), ToolError> {
    if tool.name.trim().is_empty() {
        return Err(ToolError::Malformed(tool.name.clone(), "tool name must not be empty".into()));
    }
    let mut seen = std::collections::HashSet::new();
    for p in &tool.parameters {
        if !seen.insert(p.name.clone()) {
            return Err(ToolError::Malformed(
                tool.name.clone(),
                format!("duplicate parameter declaration: {}", p.name),
            ));
        }
        if p.required && p.default.is_some() {
            return Err(ToolError::Malformed(
                tool.name.clone(),
                format!("parameter {} is both required and defaulted", p.name),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::types::{ParamType, ToolCallResult, ToolHandler, ToolParameter};
    use async_trait::async_trait;
    use serde_json::Map;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn execute(&self, _args: Map<String, serde_json::Value>) -> ToolCallResult {
            ToolCallResult::success(Map::new())
        }
    }

    fn sample_tool(name: &str) -> Tool {
        Tool::new(name, "a sample tool", Arc::new(NoopHandler))
    }

    #[test]
    fn register_and_lookup() {
        let registry = ToolRegistry::new();
        registry.register(sample_tool("search")).unwrap();
        assert!(registry.contains("search"));
        assert_eq!(registry.get("search").unwrap().name, "search");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ToolRegistry::new();
        registry.register(sample_tool("search")).unwrap();
        let err = registry.register(sample_tool("search")).unwrap_err();
        assert!(matches!(err, ToolError::AlreadyRegistered(_)));
    }

    #[test]
    fn malformed_parameter_declaration_is_rejected() {
        let registry = ToolRegistry::new();
        let mut p = ToolParameter::required("x", ParamType::String);
        p.default = Some(serde_json::json!("oops"));
        let tool = sample_tool("bad").with_parameters(vec![p]);
        let err = registry.register(tool).unwrap_err();
        assert!(matches!(err, ToolError::Malformed(_, _)));
    }

    #[test]
    fn catalog_text_is_name_sorted() {
        let registry = ToolRegistry::new();
        registry.register(sample_tool("zebra")).unwrap();
        registry.register(sample_tool("alpha")).unwrap();
        let catalog = registry.catalog_text();
        let lines: Vec<&str> = catalog.lines().collect();
        assert!(lines[0].starts_with("alpha"));
        assert!(lines[1].starts_with("zebra"));
    }

    #[test]
    fn unregister_removes_tool() {
        let registry = ToolRegistry::new();
        registry.register(sample_tool("search")).unwrap();
        assert!(registry.unregister("search"));
        assert!(!registry.contains("search"));
        assert!(!registry.unregister("search"));
    }

    #[test]
    fn concurrent_lookups_are_safe() {
        use std::thread;
        let registry = ToolRegistry::new();
        registry.register(sample_tool("search")).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = registry.clone();
                thread::spawn(move || r.get("search").is_some())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
