// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Built-in node kinds.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::{ActivityRequest, Delegation, Node, NodeInput, NodeOutput};
use crate::activity::ActivityManagerType;
use crate::blueprint::NodeSpec;
use crate::process_state::ProcessStatus;

/// Entry point. Never runs on creation, since step 1 already names the start
/// node's successor; it runs only when an operator override points
/// `next_node_id` back at a start node, and then passes the bag through.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartNode;

#[async_trait]
impl Node for StartNode {
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
        Ok(NodeOutput::passthrough(spec, &input, ProcessStatus::Running))
    }
}

/// Terminal node. Result is `parameters.result` when set, else the previous result.
#[derive(Debug, Clone, Copy, Default)]
pub struct FinishNode;

#[async_trait]
impl Node for FinishNode {
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
        let mut out = NodeOutput::passthrough(spec, &input, ProcessStatus::Finished);
        out.next_node_id = None;
        if let Some(result) = spec.parameters.get("result") {
            out.result = result.clone();
        }
        Ok(out)
    }
}

/// Merges `parameters.input` (or, without it, an object previous result) into the bag.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTaskNode;

#[async_trait]
impl Node for SystemTaskNode {
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
        let mut out = NodeOutput::passthrough(spec, &input, ProcessStatus::Running);
        let source = spec
            .parameters
            .get("input")
            .cloned()
            .unwrap_or_else(|| input.input.clone());

        let mut bag = match input.bag {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        if let Value::Object(values) = &source {
            for (key, value) in values {
                bag.insert(key.clone(), value.clone());
            }
        }
        out.bag = Value::Object(bag);
        out.result = source;
        Ok(out)
    }
}

/// Human task.
///
/// Opens a `commit` activity manager and waits, or with
/// `parameters.activity_manager = "notify"` opens a `notify` manager and keeps
/// running.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserTaskNode;

#[async_trait]
impl Node for UserTaskNode {
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
        let notify =
            spec.parameters.get("activity_manager").and_then(Value::as_str) == Some("notify");
        let (kind, status) = if notify {
            (ActivityManagerType::Notify, ProcessStatus::Running)
        } else {
            (ActivityManagerType::Commit, ProcessStatus::Waiting)
        };

        let mut parameters = Map::new();
        for key in ["timeout", "channels", "encrypted_data"] {
            if let Some(value) = spec.parameters.get(key) {
                parameters.insert(key.to_string(), value.clone());
            }
        }

        let mut out = NodeOutput::passthrough(spec, &input, status);
        out.activity_manager = Some(ActivityRequest {
            kind,
            props: json!({
                "action": spec.parameters.get("action").cloned().unwrap_or(Value::Null),
                "node_name": spec.name,
            }),
            parameters: Value::Object(parameters),
        });
        Ok(out)
    }
}

/// Suspends the process as `pending` for `parameters.timeout` seconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerNode;

#[async_trait]
impl Node for TimerNode {
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
        let seconds = spec
            .parameters
            .get("timeout")
            .and_then(Value::as_f64)
            .with_context(|| format!("timer node '{}' has no numeric timeout", spec.id))?;
        if seconds < 0.0 {
            return Err(anyhow!("timer node '{}' has a negative timeout", spec.id));
        }

        let mut out = NodeOutput::passthrough(spec, &input, ProcessStatus::Pending);
        out.timeout = Some(seconds);
        Ok(out)
    }
}

/// Delegates to the latest version of `parameters.workflow_name`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubProcessNode;

#[async_trait]
impl Node for SubProcessNode {
    async fn run(&self, spec: &NodeSpec, input: NodeInput) -> anyhow::Result<NodeOutput> {
        let workflow_name = spec
            .parameters
            .get("workflow_name")
            .and_then(Value::as_str)
            .with_context(|| format!("sub process node '{}' has no workflow_name", spec.id))?;

        let mut out = NodeOutput::passthrough(spec, &input, ProcessStatus::Delegated);
        out.timeout = spec.parameters.get("timeout").and_then(Value::as_f64);
        out.delegate = Some(Delegation {
            workflow_name: workflow_name.to_string(),
            input: spec
                .parameters
                .get("input")
                .cloned()
                .unwrap_or_else(|| json!({})),
        });
        Ok(out)
    }
}
