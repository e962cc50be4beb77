// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The append-only step ledger.
//!
//! One [`ProcessState`] row per executed step. Rows are never updated after
//! insertion; the process pointer always names the row with the highest
//! `step_number`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, Table, Transaction};

/// Status of a step and, denormalised, of its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Created, first node not yet executed.
    Unstarted,
    /// The execution loop keeps going.
    Running,
    /// Suspended on a human task.
    Waiting,
    /// Suspended on a timer.
    Pending,
    /// Suspended on a child process.
    Delegated,
    /// Reached a finish node.
    Finished,
    /// A node failed.
    Error,
    /// The actor failed a lane rule.
    Forbidden,
    /// Suspension outlived its deadline.
    Expired,
    /// Interrupted by an actor.
    Interrupted,
}

impl ProcessStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "unstarted",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Pending => "pending",
            Self::Delegated => "delegated",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Forbidden => "forbidden",
            Self::Expired => "expired",
            Self::Interrupted => "interrupted",
        }
    }

    /// Parse a status, `None` for unknown strings.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "unstarted" => Self::Unstarted,
            "running" => Self::Running,
            "waiting" => Self::Waiting,
            "pending" => Self::Pending,
            "delegated" => Self::Delegated,
            "finished" => Self::Finished,
            "error" => Self::Error,
            "forbidden" => Self::Forbidden,
            "expired" => Self::Expired,
            "interrupted" => Self::Interrupted,
            _ => return None,
        })
    }

    /// Suspensions that `continue` resumes by appending a step.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Pending | Self::Delegated)
    }

    /// No further step will ever be appended.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Forbidden | Self::Expired | Self::Interrupted
        )
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable, persisted execution step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    /// Row id.
    pub id: Uuid,
    /// Owning process.
    pub process_id: Uuid,
    /// Strictly increasing per process, starting at 1.
    pub step_number: i64,
    /// Node just executed.
    pub node_id: String,
    /// Node to execute on the following step.
    pub next_node_id: Option<String>,
    /// Context carried forward step to step.
    pub bag: Value,
    /// Input supplied from outside the process.
    pub external_input: Value,
    /// Output of the node.
    pub result: Value,
    /// Failure text for `error`/`forbidden` steps.
    pub error: Option<String>,
    /// Step status.
    pub status: ProcessStatus,
    /// Actor on whose behalf the step ran.
    pub actor_data: Value,
    /// Engine instance that wrote the row.
    pub engine_id: String,
    /// Node execution time in seconds.
    pub time_elapsed: Option<f64>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

impl Entity for ProcessState {
    const TABLE: Table = Table::ProcessState;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl ProcessState {
    /// Next step derived from this one: same context, new id, no node output yet.
    pub(crate) fn successor(
        &self,
        step_number: i64,
        status: ProcessStatus,
        engine_id: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            process_id: self.process_id,
            step_number,
            node_id: self.node_id.clone(),
            next_node_id: self.next_node_id.clone(),
            bag: self.bag.clone(),
            external_input: Value::Null,
            result: self.result.clone(),
            error: None,
            status,
            actor_data: self.actor_data.clone(),
            engine_id: engine_id.to_string(),
            time_elapsed: None,
            created_at: Utc::now(),
        }
    }
}

/// Highest step number recorded for a process, 0 when the ledger is empty.
pub(crate) async fn max_step_number(tx: &mut dyn Transaction, process_id: Uuid) -> Result<i64> {
    let last: Option<ProcessState> = repo::find_one(
        tx,
        Filter::new()
            .eq("process_id", process_id)
            .order_desc("step_number"),
    )
    .await?;
    Ok(last.map(|s| s.step_number).unwrap_or(0))
}

/// Every step of a process in ledger order.
pub(crate) async fn history(
    tx: &mut dyn Transaction,
    process_id: Uuid,
) -> Result<Vec<ProcessState>> {
    repo::find(
        tx,
        &Filter::new()
            .eq("process_id", process_id)
            .order_asc("step_number"),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryStore, Store};
    use serde_json::json;

    fn state(process_id: Uuid, step_number: i64) -> ProcessState {
        ProcessState {
            id: Uuid::new_v4(),
            process_id,
            step_number,
            node_id: "1".to_string(),
            next_node_id: Some("2".to_string()),
            bag: json!({"order": 42}),
            external_input: Value::Null,
            result: Value::Null,
            error: None,
            status: ProcessStatus::Running,
            actor_data: json!({"id": "u1"}),
            engine_id: "engine-a".to_string(),
            time_elapsed: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_strings() {
        for status in [
            ProcessStatus::Unstarted,
            ProcessStatus::Running,
            ProcessStatus::Waiting,
            ProcessStatus::Pending,
            ProcessStatus::Delegated,
            ProcessStatus::Finished,
            ProcessStatus::Error,
            ProcessStatus::Forbidden,
            ProcessStatus::Expired,
            ProcessStatus::Interrupted,
        ] {
            assert_eq!(ProcessStatus::parse(status.as_str()), Some(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                json!(status.as_str())
            );
        }
        assert_eq!(ProcessStatus::parse("paused"), None);
    }

    #[test]
    fn test_status_classes() {
        assert!(ProcessStatus::Waiting.is_resumable());
        assert!(ProcessStatus::Delegated.is_resumable());
        assert!(!ProcessStatus::Running.is_resumable());
        assert!(ProcessStatus::Expired.is_terminal());
        assert!(!ProcessStatus::Unstarted.is_terminal());
        assert!(!ProcessStatus::Pending.is_terminal());
    }

    #[test]
    fn test_successor_carries_context() {
        let first = state(Uuid::new_v4(), 1);
        let next = first.successor(2, ProcessStatus::Running, "engine-b");
        assert_ne!(next.id, first.id);
        assert_eq!(next.step_number, 2);
        assert_eq!(next.bag, first.bag);
        assert_eq!(next.next_node_id, first.next_node_id);
        assert_eq!(next.engine_id, "engine-b");
    }

    #[tokio::test]
    async fn test_history_and_max_step() {
        let store = MemoryStore::new();
        let process_id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();

        assert_eq!(max_step_number(tx.as_mut(), process_id).await.unwrap(), 0);

        for step in [2, 1, 3] {
            repo::save(tx.as_mut(), &state(process_id, step)).await.unwrap();
        }
        repo::save(tx.as_mut(), &state(Uuid::new_v4(), 9)).await.unwrap();

        assert_eq!(max_step_number(tx.as_mut(), process_id).await.unwrap(), 3);
        let steps: Vec<i64> = history(tx.as_mut(), process_id)
            .await
            .unwrap()
            .iter()
            .map(|s| s.step_number)
            .collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }
}
