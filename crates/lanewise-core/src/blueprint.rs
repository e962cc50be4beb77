// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative process graphs.
//!
//! A blueprint is immutable once a process is created from it: the process
//! row carries its own copy, so later workflow versions never change a
//! running process.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::nodes::NodeKind;

/// One node of the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique within the blueprint.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Which registered node implementation runs it.
    #[serde(rename = "type")]
    pub kind: NodeKind,
    /// Lane whose rule gates actors on this node.
    pub lane_id: String,
    /// Static successor, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    /// Kind-specific configuration.
    #[serde(default)]
    pub parameters: Value,
}

/// A permission rule shared by the nodes assigned to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneSpec {
    /// Unique within the blueprint.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Expression handed to the evaluator with `{actor_data, bag}`.
    pub rule: Value,
}

/// The immutable graph of nodes, lanes and environment of a workflow version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Graph nodes.
    pub nodes: Vec<NodeSpec>,
    /// Permission lanes.
    pub lanes: Vec<LaneSpec>,
    /// Static values exposed to every node.
    #[serde(default)]
    pub environment: Map<String, Value>,
}

impl Blueprint {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Look up a lane by id.
    pub fn lane(&self, id: &str) -> Option<&LaneSpec> {
        self.lanes.iter().find(|l| l.id == id)
    }

    /// Every node of kind [`NodeKind::Start`].
    pub fn start_nodes(&self) -> Vec<&NodeSpec> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .collect()
    }

    /// Environment as a JSON object.
    pub fn environment_value(&self) -> Value {
        Value::Object(self.environment.clone())
    }
}
