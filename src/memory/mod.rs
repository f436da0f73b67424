//! Per-task working memory: an append-only blackboard of decisions,
//! constraints, TODOs, and interface definitions (§3, §4.6).

pub mod consistency;

pub use consistency::{ConsistencyChecker, ConsistencyCheckpoint, ConsistencyViolation, Severity};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignDecision {
    pub decision: String,
    pub reason: String,
    pub step_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Constraint {
    pub text: String,
    pub source: String,
    pub scope: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TodoItem {
    pub text: String,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_step: Option<String>,
    pub priority: Priority,
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterfaceDefinition {
    pub name: String,
    pub definition: String,
    pub defined_by: String,
    #[serde(rename = "type")]
    pub interface_type: String,
}

/// Append-only per-task store of decisions, constraints, TODOs, and
/// interface definitions consumed by later steps' prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkingMemory {
    decisions: Vec<DesignDecision>,
    constraints: Vec<Constraint>,
    todos: Vec<TodoItem>,
    interfaces: Vec<InterfaceDefinition>,
    /// `file → files[]` dependency map.
    #[serde(default)]
    dependencies: HashMap<String, Vec<String>>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_decision(&mut self, decision: DesignDecision) {
        self.decisions.push(decision);
    }

    pub fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub fn add_todo(&mut self, todo: TodoItem) {
        self.todos.push(todo);
    }

    pub fn add_interface(&mut self, interface: InterfaceDefinition) {
        self.interfaces.push(interface);
    }

    pub fn add_dependency(&mut self, file: impl Into<String>, depends_on: impl Into<String>) {
        self.dependencies.entry(file.into()).or_default().push(depends_on.into());
    }

    pub fn complete_todo(&mut self, text: &str) {
        if let Some(todo) = self.todos.iter_mut().find(|t| t.text == text && !t.completed) {
            todo.completed = true;
        }
    }

    /// Items (decisions) matching any of `tags`.
    pub fn decisions_by_tag(&self, tag: &str) -> Vec<&DesignDecision> {
        self.decisions.iter().filter(|d| d.tags.iter().any(|t| t == tag)).collect()
    }

    pub fn recent_decisions(&self, n: usize) -> Vec<&DesignDecision> {
        self.decisions.iter().rev().take(n).collect()
    }

    pub fn pending_todos(&self) -> Vec<&TodoItem> {
        self.todos.iter().filter(|t| !t.completed).collect()
    }

    /// Renders a context block prepended to LLM prompts (§4.6): the ten
    /// most recent decisions, constraints sorted by priority with
    /// critical/high flagged, the first five pending todos, and the first
    /// five interface names with their types. Completed todos never
    /// appear here but remain queryable for audit.
    pub fn render_context(&self) -> String {
        let mut out = String::new();

        out.push_str("Recent decisions:\n");
        for d in self.decisions.iter().rev().take(10) {
            out.push_str(&format!("- [{}] {} ({})\n", d.step_id, d.decision, d.reason));
        }

        let mut sorted_constraints: Vec<&Constraint> = self.constraints.iter().collect();
        sorted_constraints.sort_by(|a, b| b.priority.cmp(&a.priority));
        out.push_str("\nConstraints:\n");
        for c in sorted_constraints {
            let marker = match c.priority {
                Priority::Critical | Priority::High => "\u{26a0}\u{fe0f} ",
                _ => "",
            };
            out.push_str(&format!("- {marker}{} (source: {})\n", c.text, c.source));
        }

        out.push_str("\nPending TODOs:\n");
        for t in self.pending_todos().into_iter().take(5) {
            out.push_str(&format!("- {}\n", t.text));
        }

        out.push_str("\nInterfaces:\n");
        for i in self.interfaces.iter().take(5) {
            out.push_str(&format!("- {} ({})\n", i.name, i.interface_type));
        }

        out
    }
}
