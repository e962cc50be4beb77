// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The node execution contract and the registry that resolves node kinds.
//!
//! Nodes are opaque to the engine: a node receives the carried context and
//! returns the next step's shape. Anything a node wants the engine to do on
//! its behalf (open an activity manager, arm a timeout, start a child
//! process) travels back in [`NodeOutput`].

mod builtin;

pub use self::builtin::{
    FinishNode, StartNode, SubProcessNode, SystemTaskNode, TimerNode, UserTaskNode,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::activity::ActivityManagerType;
use crate::blueprint::NodeSpec;
use crate::error::{EngineError, Result};
use crate::process_state::ProcessStatus;

/// Node type tag, serialised as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    /// Entry point.
    Start,
    /// Terminal node.
    Finish,
    /// Bag manipulation without outside interaction.
    SystemTask,
    /// Human task backed by an activity manager.
    UserTask,
    /// Waits a fixed number of seconds.
    Timer,
    /// Delegates to a child process.
    SubProcess,
    /// Externally registered kind.
    Custom(String),
}

impl NodeKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Finish => "finish",
            Self::SystemTask => "system_task",
            Self::UserTask => "user_task",
            Self::Timer => "timer",
            Self::SubProcess => "sub_process",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start" => Self::Start,
            "finish" => Self::Finish,
            "system_task" => Self::SystemTask,
            "user_task" => Self::UserTask,
            "timer" => Self::Timer,
            "sub_process" => Self::SubProcess,
            _ => Self::Custom(s),
        }
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a node sees.
#[derive(Debug, Clone, Default)]
pub struct NodeInput {
    /// Carried context.
    pub bag: Value,
    /// Result of the previous step.
    pub input: Value,
    /// Input supplied from outside on resumption.
    pub external_input: Value,
    /// Actor on whose behalf the process runs.
    pub actor_data: Value,
    /// Blueprint environment.
    pub environment: Value,
    /// Owning process.
    pub process_id: Uuid,
}

/// Request to open an activity manager at this step.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRequest {
    /// Barrier flavour.
    pub kind: ActivityManagerType,
    /// Data exposed to the actor.
    pub props: Value,
    /// `timeout` (seconds), `channels`, `encrypted_data`.
    pub parameters: Value,
}

/// Request to run a child process while this one is `delegated`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delegation {
    /// Latest version of this workflow is instantiated.
    pub workflow_name: String,
    /// Initial bag of the child.
    pub input: Value,
}

/// The shape of the next step, as decided by a node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutput {
    /// Node that produced the output.
    pub node_id: String,
    /// Bag to carry forward.
    pub bag: Value,
    /// External input to record on the step.
    pub external_input: Value,
    /// Node result.
    pub result: Value,
    /// Failure text.
    pub error: Option<String>,
    /// Resulting status.
    pub status: ProcessStatus,
    /// Node to execute next.
    pub next_node_id: Option<String>,
    /// Filled in by the engine.
    pub time_elapsed: Option<f64>,
    /// Open an activity manager.
    pub activity_manager: Option<ActivityRequest>,
    /// Arm a timer on the process, in seconds.
    pub timeout: Option<f64>,
    /// Start a child process.
    pub delegate: Option<Delegation>,
}

impl NodeOutput {
    /// Output that carries the input forward unchanged to `spec.next`.
    pub fn passthrough(spec: &NodeSpec, input: &NodeInput, status: ProcessStatus) -> Self {
        Self {
            node_id: spec.id.clone(),
            bag: input.bag.clone(),
            external_input: input.external_input.clone(),
            result: input.input.clone(),
            error: None,
            status,
            next_node_id: spec.next.clone(),
            time_elapsed: None,
            activity_manager: None,
            timeout: None,
            delegate: None,
        }
    }

    /// Output recording a node failure.
    pub fn failed(node_id: &str, input: &NodeInput, error: impl Into<String>) -> Self {
        Self {
            node_id: node_id.to_string(),
            bag: input.bag.clone(),
            external_input: input.external_input.clone(),
            result: Value::Null,
            error: Some(error.into()),
            status: ProcessStatus::Error,
            next_node_id: None,
            time_elapsed: None,
            activity_manager: None,
            timeout: None,
            delegate: None,
        }
    }
}

/// A node implementation.
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute the node.
    ///
    /// An `Err` is recorded as an `error` step; it never unwinds past the
    /// execution loop.
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput>;
}

/// Node implementations keyed by kind, fixed when the engine is built.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    nodes: HashMap<NodeKind, Arc<dyn Node>>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.nodes.keys().map(NodeKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("NodeRegistry").field("kinds", &kinds).finish()
    }
}

impl NodeRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in kind.
    pub fn with_builtins() -> Self {
        Self::new()
            .with(NodeKind::Start, StartNode)
            .with(NodeKind::Finish, FinishNode)
            .with(NodeKind::SystemTask, SystemTaskNode)
            .with(NodeKind::UserTask, UserTaskNode)
            .with(NodeKind::Timer, TimerNode)
            .with(NodeKind::SubProcess, SubProcessNode)
    }

    /// Register (or replace) the implementation of `kind`.
    pub fn register(&mut self, kind: NodeKind, node: Arc<dyn Node>) {
        self.nodes.insert(kind, node);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, kind: NodeKind, node: impl Node + 'static) -> Self {
        self.register(kind, Arc::new(node));
        self
    }

    /// Implementation for the node, or `NodeNotFound`.
    pub fn resolve(&self, spec: &NodeSpec) -> Result<Arc<dyn Node>> {
        self.nodes
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound {
                node_id: spec.id.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(kind: NodeKind) -> NodeSpec {
        NodeSpec {
            id: "7".to_string(),
            name: "node".to_string(),
            kind,
            lane_id: "1".to_string(),
            next: None,
            parameters: Value::Null,
        }
    }

    #[test]
    fn test_kind_serde() {
        assert_eq!(serde_json::to_value(NodeKind::UserTask).unwrap(), json!("user_task"));
        let kind: NodeKind = serde_json::from_value(json!("sub_process")).unwrap();
        assert_eq!(kind, NodeKind::SubProcess);
        let kind: NodeKind = serde_json::from_value(json!("webhook")).unwrap();
        assert_eq!(kind, NodeKind::Custom("webhook".to_string()));
        assert_eq!(kind.to_string(), "webhook");
    }

    #[test]
    fn test_registry_resolution() {
        let registry = NodeRegistry::with_builtins();
        assert!(registry.resolve(&spec(NodeKind::Timer)).is_ok());

        let err = registry
            .resolve(&spec(NodeKind::Custom("webhook".to_string())))
            .err()
            .unwrap();
        assert_eq!(err.error_code(), "NODE_NOT_FOUND");
        assert!(format!("{registry:?}").contains("user_task"));
    }

    #[tokio::test]
    async fn test_custom_registration() {
        struct Echo;

        #[async_trait]
        impl Node for Echo {
            async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
                let mut out = NodeOutput::passthrough(spec, &input, ProcessStatus::Running);
                out.result = json!({"echo": input.bag});
                Ok(out)
            }
        }

        let kind = NodeKind::Custom("echo".to_string());
        let registry = NodeRegistry::new().with(kind.clone(), Echo);
        let node = registry.resolve(&spec(kind.clone())).unwrap();

        let input = NodeInput {
            bag: json!({"a": 1}),
            ..NodeInput::default()
        };
        let out = node.run(&spec(kind), input).await.unwrap();
        assert_eq!(out.result, json!({"echo": {"a": 1}}));
        assert_eq!(out.node_id, "7");
    }
}
