// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signals: triggers fan out to the targets subscribed to their name.
//!
//! A claimed trigger is deactivated in the claim transaction, so every
//! trigger is delivered by exactly one engine. Targets then run outside that
//! transaction and the outcome of each match is recorded on the trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, LockMode, Table};
use crate::process::Creation;

/// A pending "something happened" fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Row id.
    pub id: Uuid,
    /// Signal name matched against targets.
    pub signal: String,
    /// Payload handed to every target.
    pub input: Value,
    /// Unclaimed.
    pub active: bool,
    /// One `{target_id, resource_id, success, error}` entry per matched target.
    pub results: Value,
    /// Claim time.
    pub fired_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Trigger {
    const TABLE: Table = Table::Trigger;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// What a target activates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// Start a new process of a workflow version.
    Workflow,
    /// Continue a suspended process.
    Process,
}

/// Resource bound to a signal subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetResource {
    /// Start a new process; the subscription stays active.
    Workflow(Uuid),
    /// Continue a process; the subscription is consumed on success.
    Process(Uuid),
}

/// Subscription of a resource to a signal name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// Row id.
    pub id: Uuid,
    /// Signal name.
    pub signal: String,
    /// Kind of `resource_id`.
    pub resource_type: TargetType,
    /// Workflow or process id.
    pub resource_id: Uuid,
    /// Still subscribed.
    pub active: bool,
    /// Last successful match.
    pub matched_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Target {
    const TABLE: Table = Table::Target;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Target {
    /// Bound resource.
    pub fn resource(&self) -> TargetResource {
        match self.resource_type {
            TargetType::Workflow => TargetResource::Workflow(self.resource_id),
            TargetType::Process => TargetResource::Process(self.resource_id),
        }
    }

    /// Activate the resource with the trigger's input. Returns the process touched.
    pub async fn run(&self, engine: &Engine, trigger: &Trigger) -> Result<Uuid> {
        match self.resource() {
            TargetResource::Workflow(workflow_id) => {
                let actor_data = trigger
                    .input
                    .get("actor_data")
                    .cloned()
                    .unwrap_or_else(|| json!({ "signal": trigger.signal }));
                match engine
                    .create_process(workflow_id, actor_data, trigger.input.clone())
                    .await?
                {
                    Creation::Created(process) => {
                        engine.run_process(process.id, None).await?;
                        Ok(process.id)
                    }
                    Creation::Forbidden => Err(EngineError::Forbidden {
                        operation: "start workflow from signal",
                    }),
                    Creation::Rejected { error } => Err(EngineError::Validation {
                        field: "workflow".to_string(),
                        message: error,
                    }),
                }
            }
            TargetResource::Process(process_id) => {
                engine
                    .continue_process(process_id, None, trigger.input.clone())
                    .await?;
                Ok(process_id)
            }
        }
    }
}

impl Engine {
    /// Record a signal for delivery by the next trigger pass.
    #[instrument(skip(self, input))]
    pub async fn emit_signal(&self, signal: &str, input: Value) -> Result<Trigger> {
        let trigger = Trigger {
            id: Uuid::new_v4(),
            signal: signal.to_string(),
            input,
            active: true,
            results: json!([]),
            fired_at: None,
            created_at: Utc::now(),
        };
        let mut tx = self.store().begin().await?;
        repo::save(tx.as_mut(), &trigger).await?;
        tx.commit().await?;
        debug!(trigger_id = %trigger.id, "Signal emitted");
        Ok(trigger)
    }

    /// Subscribe a resource to a signal.
    #[instrument(skip(self))]
    pub async fn register_target(&self, signal: &str, resource: TargetResource) -> Result<Target> {
        let (resource_type, resource_id) = match resource {
            TargetResource::Workflow(id) => (TargetType::Workflow, id),
            TargetResource::Process(id) => (TargetType::Process, id),
        };
        let target = Target {
            id: Uuid::new_v4(),
            signal: signal.to_string(),
            resource_type,
            resource_id,
            active: true,
            matched_at: None,
            created_at: Utc::now(),
        };
        let mut tx = self.store().begin().await?;
        repo::save(tx.as_mut(), &target).await?;
        tx.commit().await?;
        Ok(target)
    }

    /// Fetch a trigger with its recorded results.
    pub async fn fetch_trigger(&self, trigger_id: Uuid) -> Result<Option<Trigger>> {
        repo::fetch(self.store(), trigger_id).await
    }

    /// Fetch a target.
    pub async fn fetch_target(&self, target_id: Uuid) -> Result<Option<Target>> {
        repo::fetch(self.store(), target_id).await
    }

    /// Claim active triggers with `SKIP LOCKED` and deliver them.
    #[instrument(skip(self), fields(engine_id = %self.engine_id()))]
    pub async fn fire_triggers(&self) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.store().begin().await?;
        let claimed: Vec<Trigger> = repo::lock(
            tx.as_mut(),
            &Filter::new()
                .eq("active", true)
                .order_asc("created_at")
                .limit(self.config().trigger_batch_size),
            LockMode::SkipLocked,
        )
        .await?;

        let mut deliveries = Vec::with_capacity(claimed.len());
        for mut trigger in claimed {
            trigger.active = false;
            trigger.fired_at = Some(now);
            repo::save(tx.as_mut(), &trigger).await?;
            let targets: Vec<Target> = repo::find(
                tx.as_mut(),
                &Filter::new()
                    .eq("signal", trigger.signal.as_str())
                    .eq("active", true)
                    .order_asc("created_at"),
            )
            .await?;
            deliveries.push((trigger, targets));
        }
        tx.commit().await?;

        let delivered = deliveries.len();
        for (trigger, targets) in deliveries {
            let mut results = Vec::with_capacity(targets.len());
            let mut matched = Vec::new();
            for target in targets {
                match target.run(self, &trigger).await {
                    Ok(resource_id) => {
                        results.push(json!({
                            "target_id": target.id,
                            "resource_id": resource_id,
                            "success": true,
                            "error": null,
                        }));
                        matched.push(target);
                    }
                    Err(e) => {
                        warn!(trigger_id = %trigger.id, target_id = %target.id, error = %e, "Target failed");
                        results.push(json!({
                            "target_id": target.id,
                            "resource_id": target.resource_id,
                            "success": false,
                            "error": e.to_string(),
                        }));
                    }
                }
            }

            if let Err(e) = self.record_delivery(trigger.id, results, matched).await {
                warn!(trigger_id = %trigger.id, error = %e, "Failed to record trigger results");
            }
            info!(trigger_id = %trigger.id, signal = %trigger.signal, "Trigger delivered");
        }
        Ok(delivered)
    }

    async fn record_delivery(
        &self,
        trigger_id: Uuid,
        results: Vec<Value>,
        matched: Vec<Target>,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.store().begin().await?;
        if let Some(mut trigger) = repo::get::<Trigger>(tx.as_mut(), trigger_id).await? {
            trigger.results = Value::Array(results);
            repo::save(tx.as_mut(), &trigger).await?;
        }
        for mut target in matched {
            target.matched_at = Some(now);
            if target.resource_type == TargetType::Process {
                target.active = false;
            }
            repo::save(tx.as_mut(), &target).await?;
        }
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_trigger_without_targets_is_consumed() {
        let engine = engine();
        let trigger = engine.emit_signal("nobody.listens", json!({})).await.unwrap();

        assert_eq!(engine.fire_triggers().await.unwrap(), 1);
        assert_eq!(engine.fire_triggers().await.unwrap(), 0);

        let trigger = engine.fetch_trigger(trigger.id).await.unwrap().unwrap();
        assert!(!trigger.active);
        assert!(trigger.fired_at.is_some());
        assert_eq!(trigger.results, json!([]));
    }

    #[tokio::test]
    async fn test_failed_target_is_recorded_and_kept() {
        let engine = engine();
        let missing = Uuid::new_v4();
        let target = engine
            .register_target("order.paid", TargetResource::Process(missing))
            .await
            .unwrap();
        let trigger = engine.emit_signal("order.paid", json!({"paid": true})).await.unwrap();

        engine.fire_triggers().await.unwrap();

        let trigger = engine.fetch_trigger(trigger.id).await.unwrap().unwrap();
        assert_eq!(trigger.results[0]["target_id"], json!(target.id));
        assert_eq!(trigger.results[0]["success"], json!(false));
        assert!(trigger.results[0]["error"].as_str().unwrap().contains("not found"));

        let target = engine.fetch_target(target.id).await.unwrap().unwrap();
        assert!(target.active);
        assert!(target.matched_at.is_none());
    }
}
