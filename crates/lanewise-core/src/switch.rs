// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Switches: N-of-M join barriers across the processes of one workflow.
//!
//! Each pass forces a bounded batch of processes parked at the switch node
//! to continue. A forced process has its open `commit` barriers interrupted
//! in the same step. After the policy's window the outcome is checked in each
//! process's ledger; once enough processes reached the expected node with
//! the expected status (and result), the switch closes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, LockMode, Table};
use crate::process::{Process, Resumption};
use crate::process_state::{ProcessState, ProcessStatus};

/// Opening and closing rules of a switch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchPolicy {
    /// Processes forced per pass.
    pub batch_size: i64,
    /// Wait before checking the outcome of a batch.
    pub timeout_ms: u64,
    /// Node whose steps are inspected; defaults to the switch node.
    #[serde(default)]
    pub expected_node_id: Option<String>,
    /// Status the inspected step must have.
    pub expected_status: ProcessStatus,
    /// Result the inspected step must have, if set.
    #[serde(default)]
    pub expected_result: Option<Value>,
    /// Successes after which the switch closes.
    pub required_successes: i64,
}

/// An N-of-M barrier on one node of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Switch {
    /// Row id.
    pub id: Uuid,
    /// Workflow version whose processes are forced.
    pub workflow_id: Uuid,
    /// Node the processes are parked at.
    pub node_id: String,
    /// Opening and closing rules.
    pub policy: SwitchPolicy,
    /// Successful processes so far.
    pub successes: i64,
    /// Open.
    pub active: bool,
    /// Last pass that forced a batch.
    pub fired_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Switch {
    const TABLE: Table = Table::Switch;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Switch {
    fn expected_node(&self) -> &str {
        self.policy.expected_node_id.as_deref().unwrap_or(&self.node_id)
    }

    /// Whether a ledger entry written since `since` satisfies the policy.
    fn satisfied_by(&self, state: &ProcessState, since: DateTime<Utc>) -> bool {
        state.created_at >= since
            && state.node_id == self.expected_node()
            && state.status == self.policy.expected_status
            && self
                .policy
                .expected_result
                .as_ref()
                .is_none_or(|expected| *expected == state.result)
    }
}

impl Engine {
    /// Open a switch on `node_id` of a workflow version.
    #[instrument(skip(self, policy))]
    pub async fn create_switch(
        &self,
        workflow_id: Uuid,
        node_id: &str,
        policy: SwitchPolicy,
    ) -> Result<Switch> {
        if policy.batch_size <= 0 || policy.required_successes <= 0 {
            return Err(EngineError::Validation {
                field: "policy".to_string(),
                message: "batch_size and required_successes must be positive".to_string(),
            });
        }
        let workflow = self.fetch_workflow(workflow_id).await?;
        if workflow.blueprint.node(node_id).is_none() {
            return Err(EngineError::NodeNotFound {
                node_id: node_id.to_string(),
            });
        }

        let switch = Switch {
            id: Uuid::new_v4(),
            workflow_id,
            node_id: node_id.to_string(),
            policy,
            successes: 0,
            active: true,
            fired_at: None,
            created_at: Utc::now(),
        };
        let mut tx = self.store().begin().await?;
        repo::save(tx.as_mut(), &switch).await?;
        tx.commit().await?;
        Ok(switch)
    }

    /// Fetch a switch.
    pub async fn fetch_switch(&self, switch_id: Uuid) -> Result<Option<Switch>> {
        repo::fetch(self.store(), switch_id).await
    }

    /// Claim open switches with `SKIP LOCKED` and force their next batch.
    ///
    /// Batch outcomes are checked by a background task once the policy
    /// window has passed.
    #[instrument(skip(self), fields(engine_id = %self.engine_id()))]
    pub async fn check_switches(&self) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.store().begin().await?;
        let switches: Vec<Switch> = repo::lock(
            tx.as_mut(),
            &Filter::new()
                .eq("active", true)
                .order_asc("created_at")
                .limit(self.config().switch_batch_size),
            LockMode::SkipLocked,
        )
        .await?;

        let mut batches = Vec::with_capacity(switches.len());
        for mut switch in switches {
            let parked: Vec<Process> = repo::lock(
                tx.as_mut(),
                &Filter::new()
                    .eq("workflow_id", switch.workflow_id)
                    .eq("current_node_id", switch.node_id.as_str())
                    .is_in(
                        "current_status",
                        [ProcessStatus::Waiting.as_str(), ProcessStatus::Pending.as_str()],
                    )
                    .order_asc("created_at")
                    .limit(switch.policy.batch_size),
                LockMode::SkipLocked,
            )
            .await?;
            let batch: Vec<Uuid> = parked.iter().map(|p| p.id).collect();

            switch.fired_at = Some(now);
            repo::save(tx.as_mut(), &switch).await?;
            batches.push((switch, batch));
        }
        tx.commit().await?;

        let checked = batches.len();
        for (switch, batch) in batches {
            if batch.is_empty() {
                continue;
            }
            debug!(switch_id = %switch.id, processes = batch.len(), "Forcing switch batch");
            for process_id in &batch {
                let forced = Resumption {
                    external_input: json!({ "switch_id": switch.id }),
                    force: true,
                    ..Resumption::default()
                };
                if let Err(e) = self.resume_with(*process_id, forced).await {
                    warn!(switch_id = %switch.id, process_id = %process_id, error = %e, "Switch could not continue process");
                }
            }

            let engine = self.clone();
            let window = Duration::from_millis(switch.policy.timeout_ms);
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                if let Err(e) = engine.evaluate_switch(switch.id, batch, now).await {
                    error!(switch_id = %switch.id, error = %e, "Switch evaluation failed");
                }
            });
        }
        Ok(checked)
    }

    /// Count batch processes that satisfied the policy and close the switch
    /// once enough did.
    pub(crate) async fn evaluate_switch(
        &self,
        switch_id: Uuid,
        batch: Vec<Uuid>,
        since: DateTime<Utc>,
    ) -> Result<Switch> {
        let switch = self
            .fetch_switch(switch_id)
            .await?
            .ok_or_else(|| EngineError::Validation {
                field: "switch_id".to_string(),
                message: format!("switch '{switch_id}' not found"),
            })?;

        let mut successes = 0;
        for process_id in &batch {
            let history = self.state_history(*process_id).await?;
            if history.iter().any(|state| switch.satisfied_by(state, since)) {
                successes += 1;
            }
        }

        let mut tx = self.store().begin().await?;
        let mut switch: Switch =
            repo::lock::<Switch>(tx.as_mut(), &Filter::by_id(switch_id), LockMode::Wait)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    EngineError::lock_conflict("switch", switch_id, "switch row missing")
                })?;
        if !switch.active {
            tx.rollback().await?;
            return Ok(switch);
        }
        switch.successes += successes;
        if switch.successes >= switch.policy.required_successes {
            switch.active = false;
        }
        repo::save(tx.as_mut(), &switch).await?;
        tx.commit().await?;

        if switch.active {
            debug!(switch_id = %switch_id, successes = switch.successes, "Switch still open");
        } else {
            info!(switch_id = %switch_id, successes = switch.successes, "Switch closed");
        }
        Ok(switch)
    }
}
