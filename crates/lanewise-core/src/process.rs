// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Processes and the execution loop.
//!
//! Every step of a process runs in one transaction:
//!
//! 1. Lock the process row filtered by id and the captured state pointer
//!    (`FOR UPDATE`). No row means another writer already moved the pointer.
//! 2. Lock the captured state row without waiting (`FOR UPDATE NOWAIT`).
//! 3. Run the node named by the captured state's `next_node_id`.
//! 4. Number the new step `max(step_number) + 1` and check it is exactly one
//!    past the captured step.
//! 5. Persist the step, move the pointer and apply side effects (timers,
//!    activity managers).
//! 6. Commit, then notify observers and run follow-ups (child processes,
//!    parent continuation) outside the transaction.
//!
//! Any failure rolls the transaction back and ends the loop without retry.
//! Abandoned work is picked up by the heartbeat's orphan pass.

use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{self, Activity, ActivityManager, ActivityManagerStatus, ActivityManagerType};
use crate::blueprint::Blueprint;
use crate::engine::{BoxFuture, Engine};
use crate::error::{EngineError, Result};
use crate::evaluator::lane_allows;
use crate::nodes::{Delegation, NodeInput, NodeOutput};
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, LockMode, Table};
use crate::process_state::{self, ProcessState, ProcessStatus};
use crate::timer::{ResourceType, Timeoutable, Timer};
use crate::workflow::Workflow;

/// A running (or finished) instance of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    /// Process id.
    pub id: Uuid,
    /// Workflow version the process was created from.
    pub workflow_id: Uuid,
    /// Copy of the workflow blueprint, immutable for the process lifetime.
    pub blueprint: Blueprint,
    /// Latest ledger entry.
    pub current_state_id: Uuid,
    /// Status of the latest ledger entry.
    pub current_status: ProcessStatus,
    /// Node of the latest ledger entry.
    pub current_node_id: String,
    /// Process that delegated to this one.
    pub parent_process_id: Option<Uuid>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Process {
    const TABLE: Table = Table::Process;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Outcome of instantiating a workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum Creation {
    /// Persisted as `unstarted`.
    Created(Process),
    /// No start node admits the actor. Nothing was persisted.
    Forbidden,
    /// The blueprint cannot be started. Nothing was persisted.
    Rejected {
        /// Why.
        error: String,
    },
}

impl Creation {
    /// The created process, if any.
    pub fn process(self) -> Option<Process> {
        match self {
            Creation::Created(process) => Some(process),
            _ => None,
        }
    }
}

/// Operator override applied by [`Engine::set_process_state`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateOverride {
    /// Replacement bag; `None` keeps the current one.
    pub bag: Option<Value>,
    /// Replacement result; `None` keeps the current one.
    pub result: Option<Value>,
    /// Node executed on the next `continue`; `None` keeps the current one.
    pub next_node_id: Option<String>,
}

/// Work scheduled by a step, run after its commit.
enum FollowUp {
    StartChild {
        parent_id: Uuid,
        delegation: Delegation,
        actor_data: Value,
    },
    ContinueParent {
        parent_id: Uuid,
        child_id: Uuid,
        bag: Value,
    },
}

struct StepOutcome {
    process: Process,
    state: ProcessState,
    manager: Option<ActivityManager>,
    follow_ups: Vec<FollowUp>,
}

/// What happens to open activity managers when a step is appended outside
/// the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cascade {
    None,
    CompleteNotify,
    /// Complete `notify` managers and interrupt `commit` managers.
    Force,
    Interrupt,
}

struct Transition {
    operation: &'static str,
    allowed: fn(ProcessStatus) -> bool,
    expected_state: Option<Uuid>,
    required_step: Option<i64>,
    /// Commit barrier completed by the appended step.
    closing: Option<Uuid>,
    cascade: Cascade,
}

/// How a process is brought back into the execution loop.
#[derive(Debug, Default)]
pub(crate) struct Resumption {
    pub actor_data: Option<Value>,
    pub external_input: Value,
    /// Step number the resumption must produce.
    pub required_step: Option<i64>,
    /// Ledger entry the process pointer must still name.
    pub expected_state: Option<Uuid>,
    /// Started commit barrier closed by the resuming step. Its submissions
    /// replace `external_input`.
    pub closing: Option<Uuid>,
    /// Interrupt open commit barriers instead of leaving them started.
    pub force: bool,
}

fn not_terminal(status: ProcessStatus) -> bool {
    !status.is_terminal()
}

fn overridable(status: ProcessStatus) -> bool {
    !matches!(status, ProcessStatus::Finished | ProcessStatus::Interrupted)
}

fn resumable(status: ProcessStatus) -> bool {
    status.is_resumable()
}

impl Engine {
    /// Instantiate a workflow version for an actor.
    #[instrument(skip(self, actor_data, bag))]
    pub async fn create_process(
        &self,
        workflow_id: Uuid,
        actor_data: Value,
        bag: Value,
    ) -> Result<Creation> {
        let workflow = self.fetch_workflow(workflow_id).await?;
        self.instantiate(&workflow, actor_data, bag, None).await
    }

    /// Instantiate the latest version of a workflow by name.
    #[instrument(skip(self, actor_data, bag))]
    pub async fn create_process_by_workflow_name(
        &self,
        name: &str,
        actor_data: Value,
        bag: Value,
    ) -> Result<Creation> {
        let workflow = self.fetch_workflow_by_name(name).await?;
        self.instantiate(&workflow, actor_data, bag, None).await
    }

    pub(crate) async fn instantiate(
        &self,
        workflow: &Workflow,
        actor_data: Value,
        bag: Value,
        parent_process_id: Option<Uuid>,
    ) -> Result<Creation> {
        let blueprint = &workflow.blueprint;
        let starts = blueprint.start_nodes();
        if starts.is_empty() {
            return Ok(Creation::Rejected {
                error: "No start node".to_string(),
            });
        }

        let bag = if bag.is_null() { json!({}) } else { bag };
        let mut admitted = Vec::new();
        for start in starts {
            let allowed = match blueprint.lane(&start.lane_id) {
                Some(lane) => lane_allows(self.evaluator(), &lane.rule, &actor_data, &bag)?,
                None => false,
            };
            if allowed {
                admitted.push(start);
            }
        }

        let start = match admitted.as_slice() {
            [] => {
                debug!(workflow_id = %workflow.id, "No start node admits the actor");
                return Ok(Creation::Forbidden);
            }
            [start] => *start,
            _ => {
                return Ok(Creation::Rejected {
                    error: "Multiple start nodes".to_string(),
                });
            }
        };

        let process_id = Uuid::new_v4();
        let now = Utc::now();
        let state = ProcessState {
            id: Uuid::new_v4(),
            process_id,
            step_number: 1,
            node_id: start.id.clone(),
            next_node_id: start.next.clone(),
            bag,
            external_input: Value::Null,
            result: Value::Null,
            error: None,
            status: ProcessStatus::Unstarted,
            actor_data,
            engine_id: self.engine_id().to_string(),
            time_elapsed: None,
            created_at: now,
        };
        let process = Process {
            id: process_id,
            workflow_id: workflow.id,
            blueprint: blueprint.clone(),
            current_state_id: state.id,
            current_status: ProcessStatus::Unstarted,
            current_node_id: start.id.clone(),
            parent_process_id,
            created_at: now,
        };

        let mut tx = self.store().begin().await?;
        repo::save(tx.as_mut(), &process).await?;
        repo::save(tx.as_mut(), &state).await?;
        tx.commit().await?;

        info!(process_id = %process.id, workflow_id = %workflow.id, "Process created");
        self.notify_process_state(&state);
        Ok(Creation::Created(process))
    }

    /// Fetch a process.
    pub async fn fetch_process(&self, process_id: Uuid) -> Result<Process> {
        repo::fetch(self.store(), process_id)
            .await?
            .ok_or(EngineError::ProcessNotFound { process_id })
    }

    /// Latest ledger entry of a process.
    pub async fn current_state(&self, process_id: Uuid) -> Result<ProcessState> {
        let process = self.fetch_process(process_id).await?;
        self.load_state(process.current_state_id).await
    }

    /// Every ledger entry of a process in step order.
    pub async fn state_history(&self, process_id: Uuid) -> Result<Vec<ProcessState>> {
        let mut tx = self.store().begin().await?;
        let states = process_state::history(tx.as_mut(), process_id).await?;
        tx.commit().await?;
        Ok(states)
    }

    async fn load_state(&self, state_id: Uuid) -> Result<ProcessState> {
        repo::fetch(self.store(), state_id)
            .await?
            .ok_or_else(|| {
                EngineError::lock_conflict("process_state", state_id, "state row missing")
            })
    }

    /// Start an `unstarted` process, resume a suspended one without input,
    /// or re-enter the loop of a `running` one.
    ///
    /// With `actor_data` the lane rule of the current node is checked first;
    /// without it the call is treated as engine-internal.
    pub async fn run_process(
        &self,
        process_id: Uuid,
        actor_data: Option<Value>,
    ) -> Result<Process> {
        self.resume(process_id, actor_data, Value::Null, None).await
    }

    /// Resume a process with external input.
    pub async fn continue_process(
        &self,
        process_id: Uuid,
        actor_data: Option<Value>,
        external_input: Value,
    ) -> Result<Process> {
        self.resume(process_id, actor_data, external_input, None).await
    }

    /// Shared entry point of `run`, `continue`, timers, triggers and orphan
    /// recovery.
    ///
    /// `required_step` pins the step number the resumption must produce.
    pub(crate) fn resume(
        &self,
        process_id: Uuid,
        actor_data: Option<Value>,
        external_input: Value,
        required_step: Option<i64>,
    ) -> BoxFuture<'_, Result<Process>> {
        self.resume_with(
            process_id,
            Resumption {
                actor_data,
                external_input,
                required_step,
                ..Resumption::default()
            },
        )
    }

    /// [`Engine::resume`] with barrier handling.
    ///
    /// A suspended process gets a `running` step first. A `running` one
    /// re-enters the loop directly; the step locks serialise it against a
    /// live writer.
    pub(crate) fn resume_with(
        &self,
        process_id: Uuid,
        resumption: Resumption,
    ) -> BoxFuture<'_, Result<Process>> {
        Box::pin(async move {
            let Resumption {
                actor_data,
                external_input,
                required_step,
                expected_state,
                closing,
                force,
            } = resumption;

            let process = self.fetch_process(process_id).await?;
            if expected_state.is_some_and(|expected| expected != process.current_state_id) {
                return Err(EngineError::lock_conflict(
                    "process",
                    process_id,
                    "state pointer moved past the captured step",
                ));
            }
            let current = self.load_state(process.current_state_id).await?;

            if let Some(actor) = &actor_data
                && !self.lane_permits(&process.blueprint, &current, actor)?
            {
                let actor = actor.clone();
                let (process, _) = self
                    .append_step(
                        process_id,
                        Transition {
                            operation: "continue",
                            allowed: not_terminal,
                            expected_state: Some(current.id),
                            required_step: None,
                            closing: None,
                            cascade: Cascade::None,
                        },
                        move |current, step, engine_id| {
                            let mut state =
                                current.successor(step, ProcessStatus::Forbidden, engine_id);
                            state.actor_data = actor;
                            state.next_node_id = None;
                            state.error = Some(format!(
                                "Actor is not allowed to act on node '{}'",
                                current.node_id
                            ));
                            state
                        },
                    )
                    .await?;
                warn!(process_id = %process_id, "Lane rule rejected the actor");
                return Ok(process);
            }

            let direct = required_step.is_none() && closing.is_none();
            let process = match process.current_status {
                ProcessStatus::Unstarted | ProcessStatus::Running if direct => process,
                status if status.is_resumable() => {
                    let (process, _) = self
                        .append_step(
                            process_id,
                            Transition {
                                operation: "continue",
                                allowed: resumable,
                                expected_state: Some(current.id),
                                required_step,
                                closing,
                                cascade: if force {
                                    Cascade::Force
                                } else {
                                    Cascade::CompleteNotify
                                },
                            },
                            move |current, step, engine_id| {
                                let mut state =
                                    current.successor(step, ProcessStatus::Running, engine_id);
                                state.external_input = external_input;
                                if let Some(actor) = actor_data {
                                    state.actor_data = actor;
                                }
                                state
                            },
                        )
                        .await?;
                    process
                }
                status => {
                    return Err(EngineError::InvalidStatus {
                        entity: "process",
                        id: process_id,
                        operation: "continue",
                        actual: status.to_string(),
                    });
                }
            };

            self.execute(process).await
        })
    }

    /// Append an `interrupted` step and interrupt every open activity manager.
    #[instrument(skip(self, actor_data))]
    pub async fn abort_process(
        &self,
        process_id: Uuid,
        actor_data: Option<Value>,
    ) -> Result<Process> {
        let (process, _) = self
            .append_step(
                process_id,
                Transition {
                    operation: "abort",
                    allowed: not_terminal,
                    expected_state: None,
                    required_step: None,
                    closing: None,
                    cascade: Cascade::Interrupt,
                },
                move |current, step, engine_id| {
                    let mut state = current.successor(step, ProcessStatus::Interrupted, engine_id);
                    state.next_node_id = None;
                    if let Some(actor) = actor_data {
                        state.actor_data = actor;
                    }
                    state
                },
            )
            .await?;
        info!(process_id = %process_id, "Process interrupted");
        Ok(process)
    }

    /// Append an `expired` step and interrupt every open activity manager.
    #[instrument(skip(self))]
    pub async fn expire_process(&self, process_id: Uuid) -> Result<Process> {
        let (process, _) = self
            .append_step(
                process_id,
                Transition {
                    operation: "expire",
                    allowed: not_terminal,
                    expected_state: None,
                    required_step: None,
                    closing: None,
                    cascade: Cascade::Interrupt,
                },
                |current, step, engine_id| {
                    let mut state = current.successor(step, ProcessStatus::Expired, engine_id);
                    state.next_node_id = None;
                    state
                },
            )
            .await?;
        info!(process_id = %process_id, "Process expired");
        Ok(process)
    }

    /// Append a `pending` step carrying operator-supplied values, without
    /// running a node.
    #[instrument(skip(self, values))]
    pub async fn set_process_state(
        &self,
        process_id: Uuid,
        values: StateOverride,
    ) -> Result<Process> {
        let (process, _) = self
            .append_step(
                process_id,
                Transition {
                    operation: "set state",
                    allowed: overridable,
                    expected_state: None,
                    required_step: None,
                    closing: None,
                    cascade: Cascade::None,
                },
                move |current, step, engine_id| {
                    let mut state = current.successor(step, ProcessStatus::Pending, engine_id);
                    if let Some(bag) = values.bag {
                        state.bag = bag;
                    }
                    if let Some(result) = values.result {
                        state.result = result;
                    }
                    if let Some(next) = values.next_node_id {
                        state.next_node_id = Some(next);
                    }
                    state
                },
            )
            .await?;
        Ok(process)
    }

    /// Delete a process with its ledger, activity managers, activities and timers.
    #[instrument(skip(self))]
    pub async fn delete_process(&self, process_id: Uuid) -> Result<()> {
        let mut tx = self.store().begin().await?;
        let found: Vec<Process> =
            repo::lock(tx.as_mut(), &Filter::by_id(process_id), LockMode::Wait).await?;
        if found.is_empty() {
            return Err(EngineError::ProcessNotFound { process_id });
        }

        let managers: Vec<ActivityManager> =
            repo::find(tx.as_mut(), &Filter::new().eq("process_id", process_id)).await?;
        for manager in &managers {
            repo::delete_where::<Activity>(
                tx.as_mut(),
                &Filter::new().eq("activity_manager_id", manager.id),
            )
            .await?;
            repo::delete_where::<Timer>(tx.as_mut(), &Filter::new().eq("resource_id", manager.id))
                .await?;
        }
        repo::delete_where::<ActivityManager>(
            tx.as_mut(),
            &Filter::new().eq("process_id", process_id),
        )
        .await?;
        repo::delete_where::<Timer>(tx.as_mut(), &Filter::new().eq("resource_id", process_id))
            .await?;
        repo::delete_where::<ProcessState>(tx.as_mut(), &Filter::new().eq("process_id", process_id))
            .await?;
        repo::delete::<Process>(tx.as_mut(), process_id).await?;
        tx.commit().await?;

        info!(process_id = %process_id, "Process deleted");
        Ok(())
    }

    fn lane_permits(
        &self,
        blueprint: &Blueprint,
        state: &ProcessState,
        actor_data: &Value,
    ) -> Result<bool> {
        let node = blueprint
            .node(&state.node_id)
            .ok_or_else(|| EngineError::NodeNotFound {
                node_id: state.node_id.clone(),
            })?;
        match blueprint.lane(&node.lane_id) {
            Some(lane) => lane_allows(self.evaluator(), &lane.rule, actor_data, &state.bag),
            None => Ok(false),
        }
    }

    /// Run steps while the process is `running` (or not yet started).
    async fn execute(&self, mut process: Process) -> Result<Process> {
        let mut captured = self.load_state(process.current_state_id).await?;

        while matches!(
            process.current_status,
            ProcessStatus::Unstarted | ProcessStatus::Running
        ) {
            let outcome = self.step(&process, &captured).await?;
            debug!(
                process_id = %process.id,
                step_number = outcome.state.step_number,
                node_id = %outcome.state.node_id,
                status = %outcome.state.status,
                "Step committed"
            );

            self.notify_process_state(&outcome.state);
            if let Some(manager) = &outcome.manager {
                self.notify_activity_manager(manager);
            }
            for follow_up in outcome.follow_ups {
                if let Err(e) = self.follow_up(follow_up).await {
                    warn!(process_id = %process.id, error = %e, "Follow-up failed");
                }
            }

            process = outcome.process;
            captured = outcome.state;
        }

        if process.current_status == ProcessStatus::Finished {
            info!(process_id = %process.id, "Process finished");
        }

        // Follow-ups may have moved the process on since the last step.
        self.fetch_process(process.id).await
    }

    /// One iteration of the execution loop.
    async fn step(&self, process: &Process, captured: &ProcessState) -> Result<StepOutcome> {
        let mut tx = self.store().begin().await?;

        let mut process: Process = repo::lock::<Process>(
            tx.as_mut(),
            &Filter::by_id(process.id).eq("current_state_id", captured.id),
            LockMode::Wait,
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| {
            EngineError::lock_conflict(
                "process",
                process.id,
                "state pointer moved past the captured step",
            )
        })?;

        let held: Vec<ProcessState> =
            repo::lock(tx.as_mut(), &Filter::by_id(captured.id), LockMode::NoWait)
                .await
                .map_err(|e| {
                    if e.is_lock_conflict() {
                        EngineError::lock_conflict(
                            "process_state",
                            captured.id,
                            "held by another writer",
                        )
                    } else {
                        e
                    }
                })?;
        if held.is_empty() {
            return Err(EngineError::lock_conflict(
                "process_state",
                captured.id,
                "state row missing",
            ));
        }

        let input = NodeInput {
            bag: captured.bag.clone(),
            input: captured.result.clone(),
            external_input: captured.external_input.clone(),
            actor_data: captured.actor_data.clone(),
            environment: process.blueprint.environment_value(),
            process_id: process.id,
        };
        let started = Instant::now();
        let mut output = self.run_node(&process.blueprint, captured, input).await;
        output.time_elapsed = Some(started.elapsed().as_secs_f64());

        let step_number = process_state::max_step_number(tx.as_mut(), process.id).await? + 1;
        if step_number != captured.step_number + 1 {
            return Err(EngineError::lock_conflict(
                "process",
                process.id,
                format!(
                    "expected step {} but ledger is at {}",
                    captured.step_number + 1,
                    step_number - 1
                ),
            ));
        }

        let state = ProcessState {
            id: Uuid::new_v4(),
            process_id: process.id,
            step_number,
            node_id: output.node_id,
            next_node_id: output.next_node_id,
            bag: output.bag,
            external_input: output.external_input,
            result: output.result,
            error: output.error,
            status: output.status,
            actor_data: captured.actor_data.clone(),
            engine_id: self.engine_id().to_string(),
            time_elapsed: output.time_elapsed,
            created_at: Utc::now(),
        };
        repo::save(tx.as_mut(), &state).await?;
        process.current_state_id = state.id;
        process.current_status = state.status;
        process.current_node_id = state.node_id.clone();
        repo::save(tx.as_mut(), &process).await?;

        if let Some(seconds) = output.timeout {
            let action = match state.status {
                ProcessStatus::Pending => Some("continue"),
                ProcessStatus::Waiting | ProcessStatus::Delegated => Some("expire"),
                _ => None,
            };
            if let Some(action) = action {
                let timer = Timer::after(
                    ResourceType::Process,
                    process.id,
                    seconds,
                    json!({ "process_state_id": state.id, "action": action }),
                );
                repo::save(tx.as_mut(), &timer).await?;
                debug!(process_id = %process.id, timer_id = %timer.id, action, "Timer armed");
            }
        }

        let manager = match output.activity_manager {
            Some(request) => {
                let mut manager = ActivityManager::open(&process, &state, request);
                manager.save_in(tx.as_mut()).await?;
                Some(manager)
            }
            None => None,
        };

        let mut follow_ups = Vec::new();
        match (state.status, output.delegate) {
            (ProcessStatus::Delegated, Some(delegation)) => follow_ups.push(FollowUp::StartChild {
                parent_id: process.id,
                delegation,
                actor_data: state.actor_data.clone(),
            }),
            (ProcessStatus::Finished, _) => {
                if let Some(parent_id) = process.parent_process_id {
                    follow_ups.push(FollowUp::ContinueParent {
                        parent_id,
                        child_id: process.id,
                        bag: state.bag.clone(),
                    });
                }
            }
            _ => {}
        }

        tx.commit().await?;

        Ok(StepOutcome {
            process,
            state,
            manager,
            follow_ups,
        })
    }

    /// Resolve and run the node after `captured`. Failures become `error` output.
    async fn run_node(
        &self,
        blueprint: &Blueprint,
        captured: &ProcessState,
        input: NodeInput,
    ) -> NodeOutput {
        let Some(node_id) = captured.next_node_id.as_deref() else {
            return NodeOutput::failed(
                &captured.node_id,
                &input,
                format!("Node '{}' has no successor", captured.node_id),
            );
        };
        let Some(spec) = blueprint.node(node_id) else {
            let err = EngineError::NodeNotFound {
                node_id: node_id.to_string(),
            };
            return NodeOutput::failed(node_id, &input, err.to_string());
        };
        let node = match self.nodes().resolve(spec) {
            Ok(node) => node,
            Err(e) => return NodeOutput::failed(node_id, &input, e.to_string()),
        };

        match node.run(spec, input.clone()).await {
            Ok(output) => output,
            Err(e) => {
                warn!(process_id = %input.process_id, node_id, error = %e, "Node failed");
                NodeOutput::failed(node_id, &input, format!("{e:#}"))
            }
        }
    }

    async fn follow_up(&self, follow_up: FollowUp) -> Result<()> {
        match follow_up {
            FollowUp::StartChild {
                parent_id,
                delegation,
                actor_data,
            } => {
                let workflow = self.fetch_workflow_by_name(&delegation.workflow_name).await?;
                match self
                    .instantiate(&workflow, actor_data, delegation.input, Some(parent_id))
                    .await?
                {
                    Creation::Created(child) => {
                        info!(process_id = %parent_id, child_id = %child.id, "Child process started");
                        self.resume(child.id, None, Value::Null, None).await?;
                    }
                    other => {
                        warn!(process_id = %parent_id, outcome = ?other, "Child process not created");
                    }
                }
            }
            FollowUp::ContinueParent {
                parent_id,
                child_id,
                bag,
            } => {
                debug!(process_id = %parent_id, child_id = %child_id, "Continuing parent process");
                self.resume(parent_id, None, bag, None).await?;
            }
        }
        Ok(())
    }

    /// Append one step outside the execution loop under the same locking
    /// protocol, then notify observers.
    async fn append_step<F>(
        &self,
        process_id: Uuid,
        transition: Transition,
        build: F,
    ) -> Result<(Process, ProcessState)>
    where
        F: FnOnce(&ProcessState, i64, &str) -> ProcessState + Send,
    {
        let mut tx = self.store().begin().await?;

        let mut process: Process =
            repo::lock::<Process>(tx.as_mut(), &Filter::by_id(process_id), LockMode::Wait)
                .await?
                .into_iter()
                .next()
                .ok_or(EngineError::ProcessNotFound { process_id })?;

        if let Some(expected) = transition.expected_state
            && process.current_state_id != expected
        {
            return Err(EngineError::lock_conflict(
                "process",
                process_id,
                "state pointer moved past the captured step",
            ));
        }

        let current: ProcessState = repo::lock::<ProcessState>(
            tx.as_mut(),
            &Filter::by_id(process.current_state_id),
            LockMode::NoWait,
        )
        .await
        .map_err(|e| {
            if e.is_lock_conflict() {
                EngineError::lock_conflict(
                    "process_state",
                    process.current_state_id,
                    "held by another writer",
                )
            } else {
                e
            }
        })?
        .into_iter()
        .next()
        .ok_or_else(|| {
            EngineError::lock_conflict(
                "process_state",
                process.current_state_id,
                "state row missing",
            )
        })?;

        if !(transition.allowed)(process.current_status) {
            return Err(EngineError::InvalidStatus {
                entity: "process",
                id: process_id,
                operation: transition.operation,
                actual: process.current_status.to_string(),
            });
        }

        let step_number = process_state::max_step_number(tx.as_mut(), process_id).await? + 1;
        if step_number != current.step_number + 1 {
            return Err(EngineError::lock_conflict(
                "process",
                process_id,
                format!("ledger is at step {} past the current state", step_number - 1),
            ));
        }
        if let Some(required) = transition.required_step
            && required != step_number
        {
            return Err(EngineError::lock_conflict(
                "process",
                process_id,
                format!("resumption expected step {required}, next step is {step_number}"),
            ));
        }

        let closed = match transition.closing {
            Some(manager_id) => {
                Some(activity::close_barrier(tx.as_mut(), process_id, manager_id).await?)
            }
            None => None,
        };

        let mut state = build(&current, step_number, self.engine_id());
        if let Some(manager) = &closed {
            // Submissions are read under the barrier's lock.
            state.external_input = manager.resume_input();
        }
        repo::save(tx.as_mut(), &state).await?;
        process.current_state_id = state.id;
        process.current_status = state.status;
        process.current_node_id = state.node_id.clone();
        repo::save(tx.as_mut(), &process).await?;

        let mut managers: Vec<ActivityManager> = closed.into_iter().collect();
        managers.extend(match transition.cascade {
            Cascade::None => Vec::new(),
            Cascade::CompleteNotify => {
                activity::settle_open_managers(
                    tx.as_mut(),
                    process_id,
                    Some(ActivityManagerType::Notify),
                    ActivityManagerStatus::Completed,
                )
                .await?
            }
            Cascade::Force => {
                let mut settled = activity::settle_open_managers(
                    tx.as_mut(),
                    process_id,
                    Some(ActivityManagerType::Notify),
                    ActivityManagerStatus::Completed,
                )
                .await?;
                settled.extend(
                    activity::settle_open_managers(
                        tx.as_mut(),
                        process_id,
                        Some(ActivityManagerType::Commit),
                        ActivityManagerStatus::Interrupted,
                    )
                    .await?,
                );
                settled
            }
            Cascade::Interrupt => {
                activity::settle_open_managers(
                    tx.as_mut(),
                    process_id,
                    None,
                    ActivityManagerStatus::Interrupted,
                )
                .await?
            }
        });

        tx.commit().await?;

        debug!(
            process_id = %process_id,
            step_number,
            status = %state.status,
            operation = transition.operation,
            "Step appended"
        );
        self.notify_process_state(&state);
        for manager in &managers {
            self.notify_activity_manager(manager);
        }
        Ok((process, state))
    }

    /// Resume processes left `running` by engines that stopped mid-step.
    ///
    /// A candidate must be claimable with `SKIP LOCKED` (process row and
    /// current state row), its current step must have been written by another
    /// engine, and that step must be older than the configured grace period.
    #[instrument(skip(self), fields(engine_id = %self.engine_id()))]
    pub async fn resolve_orphans(&self) -> Result<usize> {
        let grace = chrono::Duration::from_std(self.config().orphan_grace)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;

        let mut tx = self.store().begin().await?;
        let running: Vec<Process> = repo::lock(
            tx.as_mut(),
            &Filter::new()
                .eq("current_status", ProcessStatus::Running.as_str())
                .order_asc("created_at")
                .limit(self.config().orphan_batch_size),
            LockMode::SkipLocked,
        )
        .await?;

        let mut orphans = Vec::new();
        for process in running {
            let state: Option<ProcessState> = repo::lock::<ProcessState>(
                tx.as_mut(),
                &Filter::by_id(process.current_state_id),
                LockMode::SkipLocked,
            )
            .await?
            .into_iter()
            .next();

            // An empty claim means a live writer holds the state row.
            let Some(state) = state else { continue };
            if state.engine_id == self.engine_id() || state.created_at >= cutoff {
                continue;
            }
            orphans.push((process.id, state.id, state.engine_id));
        }
        tx.commit().await?;

        let mut resumed = 0;
        for (process_id, state_id, previous_engine) in orphans {
            info!(process_id = %process_id, previous_engine = %previous_engine, "Resuming orphaned process");
            let resumption = Resumption {
                expected_state: Some(state_id),
                ..Resumption::default()
            };
            match self.resume_with(process_id, resumption).await {
                Ok(_) => resumed += 1,
                Err(e) if e.is_lock_conflict() => {
                    debug!(process_id = %process_id, error = %e, "Orphan claimed by another writer");
                }
                Err(e) => warn!(process_id = %process_id, error = %e, "Orphan recovery failed"),
            }
        }
        Ok(resumed)
    }
}

#[async_trait]
impl Timeoutable for Process {
    async fn timeout(&self, engine: &Engine, timer: &Timer) -> Result<()> {
        let pinned_state = timer
            .params
            .get("process_state_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok());
        if let Some(state_id) = pinned_state
            && state_id != self.current_state_id
        {
            debug!(process_id = %self.id, timer_id = %timer.id, "Timer bound to a superseded step, ignoring");
            return Ok(());
        }

        let action = timer.params.get("action").and_then(Value::as_str);
        match (self.current_status, action) {
            (ProcessStatus::Pending, _) => {
                engine.resume(self.id, None, Value::Null, None).await?;
            }
            (ProcessStatus::Waiting | ProcessStatus::Delegated, Some("expire")) => {
                engine.expire_process(self.id).await?;
            }
            (status, _) => {
                debug!(process_id = %self.id, status = %status, "Timeout has no effect in this status");
            }
        }
        Ok(())
    }
}
