// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity managers: suspension barriers for work done outside the engine.
//!
//! A `commit` manager holds its process until at least one [`Activity`] has
//! been submitted and the barrier is closed. A `notify` manager never holds
//! the process; it is completed at the next resumption.
//!
//! Re-saving a started manager that carries a `timeout` parameter deactivates
//! its previous timer and arms a new one, so every commit resets the clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::evaluator::{encrypt_fields, lane_allows};
use crate::nodes::ActivityRequest;
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, LockMode, Table, Transaction};
use crate::process::{Process, Resumption};
use crate::process_state::ProcessState;
use crate::timer::{ResourceType, Timeoutable, Timer};

/// Barrier flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityManagerType {
    /// Requires submitted activities before the process resumes.
    Commit,
    /// Informational; closes at the next resumption.
    Notify,
}

impl ActivityManagerType {
    /// Returns the string representation of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Notify => "notify",
        }
    }
}

/// Lifecycle: `started` then `completed` or `interrupted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityManagerStatus {
    /// Accepting activities.
    Started,
    /// Closed normally.
    Completed,
    /// Closed by abort, expiry or an explicit interrupt.
    Interrupted,
}

impl ActivityManagerStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for ActivityManagerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a submission. Submissions are immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    /// Recorded against a started manager.
    Completed,
}

/// One submission by an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    /// Row id.
    pub id: Uuid,
    /// Owning manager.
    pub activity_manager_id: Uuid,
    /// Submitting actor.
    pub actor_data: Value,
    /// Payload, with configured fields encrypted.
    pub data: Value,
    /// Submission status.
    pub status: ActivityStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Activity {
    const TABLE: Table = Table::Activity;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// A human-task barrier opened at one step of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityManager {
    /// Row id.
    pub id: Uuid,
    /// Owning process.
    pub process_id: Uuid,
    /// Step at which the barrier was opened.
    pub process_state_id: Uuid,
    /// Barrier flavour.
    #[serde(rename = "type")]
    pub kind: ActivityManagerType,
    /// Lifecycle status.
    pub status: ActivityManagerStatus,
    /// Data exposed to the actor.
    pub props: Value,
    /// `timeout`, `timeout_id`, `next_step_number`, `channels`, `encrypted_data`.
    pub parameters: Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Submissions, newest first. Loaded on demand, never persisted here.
    #[serde(skip)]
    pub activities: Vec<Activity>,
}

impl Entity for ActivityManager {
    const TABLE: Table = Table::ActivityManager;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl ActivityManager {
    pub(crate) fn open(process: &Process, state: &ProcessState, request: ActivityRequest) -> Self {
        let mut parameters = match request.parameters {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        parameters.insert("next_step_number".to_string(), json!(state.step_number + 1));

        Self {
            id: Uuid::new_v4(),
            process_id: process.id,
            process_state_id: state.id,
            kind: request.kind,
            status: ActivityManagerStatus::Started,
            props: request.props,
            parameters: Value::Object(parameters),
            created_at: Utc::now(),
            activities: Vec::new(),
        }
    }

    /// Timeout in seconds, when one is configured.
    pub fn timeout_seconds(&self) -> Option<f64> {
        self.parameters
            .get("timeout")
            .and_then(Value::as_f64)
            .filter(|t| *t > 0.0)
    }

    /// Id of the timer currently armed for this manager.
    pub fn timeout_id(&self) -> Option<Uuid> {
        self.parameters
            .get("timeout_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Step number the owning process resumes at when the barrier closes.
    pub fn next_step_number(&self) -> Option<i64> {
        self.parameters.get("next_step_number").and_then(Value::as_i64)
    }

    /// Persist the manager, re-arming its timer while it is started.
    pub(crate) async fn save_in(&mut self, tx: &mut dyn Transaction) -> Result<()> {
        if self.status == ActivityManagerStatus::Started
            && let Some(seconds) = self.timeout_seconds()
        {
            self.deactivate_timer(tx).await?;
            let timer = Timer::after(ResourceType::ActivityManager, self.id, seconds, json!({}));
            repo::save(tx, &timer).await?;
            if let Value::Object(map) = &mut self.parameters {
                map.insert("timeout_id".to_string(), json!(timer.id));
            }
            debug!(activity_manager_id = %self.id, timer_id = %timer.id, "Activity manager timer armed");
        }
        repo::save(tx, &*self).await
    }

    async fn deactivate_timer(&self, tx: &mut dyn Transaction) -> Result<()> {
        let Some(timer_id) = self.timeout_id() else {
            return Ok(());
        };
        if let Some(mut timer) = repo::get::<Timer>(tx, timer_id).await? {
            timer.active = false;
            repo::save(tx, &timer).await?;
        }
        Ok(())
    }

    async fn load_activities(&mut self, tx: &mut dyn Transaction) -> Result<()> {
        self.activities = repo::find(
            tx,
            &Filter::new()
                .eq("activity_manager_id", self.id)
                .order_desc("created_at"),
        )
        .await?;
        Ok(())
    }

    /// Submissions shaped for the resuming step's `external_input`.
    pub(crate) fn resume_input(&self) -> Value {
        let activities: Vec<Value> = self
            .activities
            .iter()
            .map(|a| {
                json!({
                    "id": a.id,
                    "actor_data": a.actor_data,
                    "data": a.data,
                    "created_at": a.created_at,
                })
            })
            .collect();
        json!({ "activities": activities, "activity_manager_id": self.id })
    }
}

/// Move every started manager of a process (optionally of one type) to `status`.
pub(crate) async fn settle_open_managers(
    tx: &mut dyn Transaction,
    process_id: Uuid,
    only: Option<ActivityManagerType>,
    status: ActivityManagerStatus,
) -> Result<Vec<ActivityManager>> {
    let open: Vec<ActivityManager> = repo::lock(
        tx,
        &Filter::new()
            .eq("process_id", process_id)
            .eq("status", ActivityManagerStatus::Started.as_str()),
        LockMode::Wait,
    )
    .await?;

    let mut settled = Vec::new();
    for mut manager in open {
        if only.is_some_and(|kind| kind != manager.kind) {
            continue;
        }
        manager.deactivate_timer(tx).await?;
        manager.status = status;
        repo::save(tx, &manager).await?;
        settled.push(manager);
    }
    Ok(settled)
}

/// Complete a started commit barrier inside the transaction of the step that
/// resumes its process.
pub(crate) async fn close_barrier(
    tx: &mut dyn Transaction,
    process_id: Uuid,
    activity_manager_id: Uuid,
) -> Result<ActivityManager> {
    let mut manager: ActivityManager =
        repo::lock::<ActivityManager>(tx, &Filter::by_id(activity_manager_id), LockMode::Wait)
            .await?
            .into_iter()
            .find(|m: &ActivityManager| m.process_id == process_id)
            .ok_or(EngineError::ActivityManagerNotFound { activity_manager_id })?;

    if manager.status != ActivityManagerStatus::Started {
        return Err(EngineError::InvalidStatus {
            entity: "activity_manager",
            id: activity_manager_id,
            operation: "close activity manager",
            actual: manager.status.to_string(),
        });
    }

    manager.deactivate_timer(tx).await?;
    manager.status = ActivityManagerStatus::Completed;
    repo::save(tx, &manager).await?;
    manager.load_activities(tx).await?;
    Ok(manager)
}

impl Engine {
    /// Fetch an activity manager with its activities.
    pub async fn fetch_activity_manager(
        &self,
        activity_manager_id: Uuid,
    ) -> Result<ActivityManager> {
        let mut tx = self.store().begin().await?;
        let mut manager = repo::get::<ActivityManager>(tx.as_mut(), activity_manager_id)
            .await?
            .ok_or(EngineError::ActivityManagerNotFound { activity_manager_id })?;
        manager.load_activities(tx.as_mut()).await?;
        tx.commit().await?;
        Ok(manager)
    }

    /// Every activity manager opened for a process, oldest first.
    pub async fn process_activity_managers(
        &self,
        process_id: Uuid,
    ) -> Result<Vec<ActivityManager>> {
        repo::fetch_all(
            self.store(),
            &Filter::new().eq("process_id", process_id).order_asc("created_at"),
        )
        .await
    }

    /// Lock a started manager and check the actor may act on it.
    async fn claim_manager(
        &self,
        tx: &mut dyn Transaction,
        activity_manager_id: Uuid,
        actor_data: Option<&Value>,
        operation: &'static str,
    ) -> Result<ActivityManager> {
        let manager: ActivityManager =
            repo::lock::<ActivityManager>(tx, &Filter::by_id(activity_manager_id), LockMode::Wait)
                .await?
                .into_iter()
                .next()
                .ok_or(EngineError::ActivityManagerNotFound { activity_manager_id })?;

        if manager.status != ActivityManagerStatus::Started {
            return Err(EngineError::InvalidStatus {
                entity: "activity_manager",
                id: activity_manager_id,
                operation,
                actual: manager.status.to_string(),
            });
        }

        if let Some(actor) = actor_data
            && !self.may_act(tx, &manager, actor).await?
        {
            return Err(EngineError::Forbidden { operation });
        }
        Ok(manager)
    }

    /// Lane rule of the owning node plus the optional channel allow-list.
    async fn may_act(
        &self,
        tx: &mut dyn Transaction,
        manager: &ActivityManager,
        actor_data: &Value,
    ) -> Result<bool> {
        if let Some(channels) = manager.parameters.get("channels").and_then(Value::as_array) {
            let channel = actor_data.get("channel");
            if !channels.iter().any(|c| Some(c) == channel) {
                return Ok(false);
            }
        }

        let process = repo::get::<Process>(tx, manager.process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound {
                process_id: manager.process_id,
            })?;
        let state = repo::get::<ProcessState>(tx, manager.process_state_id)
            .await?
            .ok_or_else(|| {
                EngineError::lock_conflict(
                    "process_state",
                    manager.process_state_id,
                    "state row missing",
                )
            })?;
        let node = process
            .blueprint
            .node(&state.node_id)
            .ok_or_else(|| EngineError::NodeNotFound {
                node_id: state.node_id.clone(),
            })?;

        match process.blueprint.lane(&node.lane_id) {
            Some(lane) => lane_allows(self.evaluator(), &lane.rule, actor_data, &state.bag),
            None => Ok(false),
        }
    }

    /// Record a submission and reset the manager's timer.
    #[instrument(skip(self, actor_data, data))]
    pub async fn commit_activity(
        &self,
        activity_manager_id: Uuid,
        actor_data: Value,
        data: Value,
    ) -> Result<ActivityManager> {
        let mut tx = self.store().begin().await?;
        let mut manager = self
            .claim_manager(tx.as_mut(), activity_manager_id, Some(&actor_data), "commit activity")
            .await?;

        let encrypted = manager
            .parameters
            .get("encrypted_data")
            .cloned()
            .unwrap_or(Value::Null);
        let activity = Activity {
            id: Uuid::new_v4(),
            activity_manager_id,
            actor_data,
            data: encrypt_fields(self.crypto(), data, &encrypted)?,
            status: ActivityStatus::Completed,
            created_at: Utc::now(),
        };
        repo::save(tx.as_mut(), &activity).await?;
        manager.save_in(tx.as_mut()).await?;
        manager.load_activities(tx.as_mut()).await?;
        tx.commit().await?;

        debug!(activity_manager_id = %manager.id, activity_id = %activity.id, "Activity committed");
        self.notify_activity_manager(&manager);
        Ok(manager)
    }

    /// Close the barrier on behalf of an actor.
    ///
    /// A `commit` manager needs at least one recorded activity; its process
    /// then resumes with the activities as external input.
    #[instrument(skip(self, actor_data))]
    pub async fn push_activity(
        &self,
        activity_manager_id: Uuid,
        actor_data: Value,
    ) -> Result<ActivityManager> {
        let mut tx = self.store().begin().await?;
        let mut manager = self
            .claim_manager(tx.as_mut(), activity_manager_id, Some(&actor_data), "push activity")
            .await?;
        manager.load_activities(tx.as_mut()).await?;
        if manager.kind == ActivityManagerType::Commit && manager.activities.is_empty() {
            return Err(EngineError::Validation {
                field: "activities".to_string(),
                message: "no activity committed".to_string(),
            });
        }
        tx.rollback().await?;

        self.validate_activity(activity_manager_id, Some(actor_data)).await
    }

    /// Complete the barrier and, for `commit` managers, resume the process at
    /// the recorded step.
    ///
    /// A `commit` barrier closes in the transaction of the resuming step, so a
    /// resumption that loses its step leaves the barrier started.
    pub(crate) async fn validate_activity(
        &self,
        activity_manager_id: Uuid,
        actor_data: Option<Value>,
    ) -> Result<ActivityManager> {
        let mut tx = self.store().begin().await?;
        let mut manager = self
            .claim_manager(tx.as_mut(), activity_manager_id, None, "close activity manager")
            .await?;

        if manager.kind == ActivityManagerType::Commit {
            tx.rollback().await?;
            self.resume_with(
                manager.process_id,
                Resumption {
                    actor_data,
                    required_step: manager.next_step_number(),
                    closing: Some(manager.id),
                    ..Resumption::default()
                },
            )
            .await?;
            info!(activity_manager_id = %manager.id, process_id = %manager.process_id, "Activity manager completed");
            return self.fetch_activity_manager(activity_manager_id).await;
        }

        manager.load_activities(tx.as_mut()).await?;
        manager.deactivate_timer(tx.as_mut()).await?;
        manager.status = ActivityManagerStatus::Completed;
        repo::save(tx.as_mut(), &manager).await?;
        tx.commit().await?;

        info!(activity_manager_id = %manager.id, process_id = %manager.process_id, "Activity manager completed");
        self.notify_activity_manager(&manager);
        Ok(manager)
    }

    /// Interrupt a started manager without resuming its process.
    #[instrument(skip(self, actor_data))]
    pub async fn interrupt_activity(
        &self,
        activity_manager_id: Uuid,
        actor_data: Option<Value>,
    ) -> Result<ActivityManager> {
        let mut tx = self.store().begin().await?;
        let mut manager = self
            .claim_manager(
                tx.as_mut(),
                activity_manager_id,
                actor_data.as_ref(),
                "interrupt activity",
            )
            .await?;
        manager.deactivate_timer(tx.as_mut()).await?;
        manager.status = ActivityManagerStatus::Interrupted;
        repo::save(tx.as_mut(), &manager).await?;
        manager.load_activities(tx.as_mut()).await?;
        tx.commit().await?;

        info!(activity_manager_id = %manager.id, "Activity manager interrupted");
        self.notify_activity_manager(&manager);
        Ok(manager)
    }
}

#[async_trait]
impl Timeoutable for ActivityManager {
    async fn timeout(&self, engine: &Engine, timer: &Timer) -> Result<()> {
        if self.status != ActivityManagerStatus::Started {
            debug!(activity_manager_id = %self.id, status = %self.status, "Timeout on a closed activity manager");
            return Ok(());
        }
        if self.timeout_id().is_some_and(|id| id != timer.id) {
            debug!(activity_manager_id = %self.id, timer_id = %timer.id, "Superseded activity manager timer");
            return Ok(());
        }
        engine.validate_activity(self.id, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{Blueprint, LaneSpec, NodeSpec};
    use crate::nodes::NodeKind;
    use crate::persistence::{MemoryStore, Store};
    use crate::process_state::ProcessStatus;
    use std::sync::Arc;

    fn engine() -> Engine {
        Engine::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap()
    }

    async fn waiting_process(
        engine: &Engine,
        parameters: Value,
        rule: Value) -> (Process, ActivityManager,
    ) {
        let node = |id: &str, kind, next: Option<&str>, parameters: Value| NodeSpec {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            lane_id: "1".to_string(),
            next: next.map(str::to_string),
            parameters,
        };
        let blueprint = Blueprint {
            nodes: vec![
                node("1", NodeKind::Start, Some("2"), json!({})),
                node("2", NodeKind::UserTask, Some("3"), parameters),
                node("3", NodeKind::Finish, None, json!({})),
            ],
            lanes: vec![LaneSpec {
                id: "1".to_string(),
                name: "lane".to_string(),
                rule,
            }],
            environment: Default::default(),
        };
        let workflow = engine.save_workflow("approval", None, blueprint).await.unwrap();
        let actor = json!({"claims": ["approver"], "channel": "web"});
        let process = engine
            .create_process(workflow.id, actor, json!({}))
            .await
            .unwrap()
            .process()
            .unwrap();
        let process = engine.run_process(process.id, None).await.unwrap();
        let manager = engine
            .process_activity_managers(process.id)
            .await
            .unwrap()
            .remove(0);
        (process, manager)
    }

    #[tokio::test]
    async fn test_recommit_rearms_timer() {
        let engine = engine();
        let (_, manager) = waiting_process(&engine, json!({"timeout": 60}), json!(true)).await;
        let first_timer = manager.timeout_id().unwrap();
        assert_eq!(manager.next_step_number(), Some(3));

        let manager = engine
            .commit_activity(manager.id, json!({}), json!({"ok": true}))
            .await
            .unwrap();
        let second_timer = manager.timeout_id().unwrap();
        assert_ne!(first_timer, second_timer);

        let mut tx = engine.store().begin().await.unwrap();
        let old: Timer = repo::get(tx.as_mut(), first_timer).await.unwrap().unwrap();
        let new: Timer = repo::get(tx.as_mut(), second_timer).await.unwrap().unwrap();
        assert!(!old.active);
        assert!(new.active);
        let active: Vec<Timer> = repo::find(
            tx.as_mut(),
            &Filter::new().eq("resource_id", manager.id).eq("active", true),
        )
        .await
        .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_requires_permission() {
        let engine = engine();
        let (_, manager) = waiting_process(
            &engine,
            json!({"channels": ["web"]}),
            json!({"claims_any": ["approver"]}),
        )
        .await;

        let wrong_claim = json!({"claims": ["guest"], "channel": "web"});
        let err = engine
            .commit_activity(manager.id, wrong_claim, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        let wrong_channel = json!({"claims": ["approver"], "channel": "email"});
        let err = engine
            .commit_activity(manager.id, wrong_channel, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        let allowed = json!({"claims": ["approver"], "channel": "web"});
        let manager = engine
            .commit_activity(manager.id, allowed, json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(manager.activities.len(), 1);
    }

    #[tokio::test]
    async fn test_push_without_activity_is_rejected() {
        let engine = engine();
        let (process, manager) = waiting_process(&engine, json!({}), json!(true)).await;

        let err = engine.push_activity(manager.id, json!({})).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let manager = engine.fetch_activity_manager(manager.id).await.unwrap();
        assert_eq!(manager.status, ActivityManagerStatus::Started);
        assert_eq!(
            engine.fetch_process(process.id).await.unwrap().current_status,
            ProcessStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_activities_are_newest_first() {
        let engine = engine();
        let (_, manager) = waiting_process(&engine, json!({}), json!(true)).await;

        engine
            .commit_activity(manager.id, json!({}), json!({"n": 1}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let manager = engine
            .commit_activity(manager.id, json!({}), json!({"n": 2}))
            .await
            .unwrap();

        let order: Vec<i64> = manager
            .activities
            .iter()
            .map(|a| a.data["n"].as_i64().unwrap())
            .collect();
        assert_eq!(order, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_interrupt_closes_without_resuming() {
        let engine = engine();
        let (process, manager) =
            waiting_process(&engine, json!({"timeout": 60}), json!(true)).await;

        let manager = engine.interrupt_activity(manager.id, None).await.unwrap();
        assert_eq!(manager.status, ActivityManagerStatus::Interrupted);
        assert_eq!(
            engine.fetch_process(process.id).await.unwrap().current_status,
            ProcessStatus::Waiting
        );

        let err = engine
            .commit_activity(manager.id, json!({}), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_STATUS");
    }

    async fn active_timers(engine: &Engine, manager_id: Uuid) -> usize {
        repo::fetch_all::<Timer>(
            engine.store(),
            &Filter::new().eq("resource_id", manager_id).eq("active", true),
        )
        .await
        .unwrap()
        .len()
    }

    #[tokio::test]
    async fn test_lost_resumption_leaves_barrier_open() {
        let engine = engine();
        let (process, manager) =
            waiting_process(&engine, json!({"timeout": 60}), json!(true)).await;
        engine
            .commit_activity(manager.id, json!({}), json!({"ok": true}))
            .await
            .unwrap();

        let mut writer = engine.store().begin().await.unwrap();
        let _: Vec<ProcessState> = repo::lock(
            writer.as_mut(),
            &Filter::by_id(process.current_state_id),
            LockMode::Wait,
        )
        .await
        .unwrap();

        let err = engine.push_activity(manager.id, json!({})).await.unwrap_err();
        assert!(err.is_lock_conflict(), "unexpected error: {err}");
        let still_open = engine.fetch_activity_manager(manager.id).await.unwrap();
        assert_eq!(still_open.status, ActivityManagerStatus::Started);
        assert_eq!(active_timers(&engine, manager.id).await, 1);

        drop(writer);
        let closed = engine.push_activity(manager.id, json!({})).await.unwrap();
        assert_eq!(closed.status, ActivityManagerStatus::Completed);
        assert_eq!(active_timers(&engine, manager.id).await, 0);
        assert_eq!(
            engine.fetch_process(process.id).await.unwrap().current_status,
            ProcessStatus::Finished
        );
    }

    #[tokio::test]
    async fn test_stale_barrier_is_not_closed() {
        let engine = engine();
        let (process, manager) =
            waiting_process(&engine, json!({"timeout": 60}), json!(true)).await;
        engine
            .commit_activity(manager.id, json!({}), json!({"ok": true}))
            .await
            .unwrap();
        engine
            .set_process_state(process.id, Default::default())
            .await
            .unwrap();

        let err = engine.push_activity(manager.id, json!({})).await.unwrap_err();
        assert!(err.is_lock_conflict(), "unexpected error: {err}");

        let manager = engine.fetch_activity_manager(manager.id).await.unwrap();
        assert_eq!(manager.status, ActivityManagerStatus::Started);
        assert_eq!(active_timers(&engine, manager.id).await, 1);
        assert_eq!(
            engine.fetch_process(process.id).await.unwrap().current_status,
            ProcessStatus::Pending
        );
    }
}
