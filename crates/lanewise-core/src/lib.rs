// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lanewise Core - Durable Process Engine
//!
//! This crate executes BPMN-style process graphs ("blueprints") whose every
//! step is persisted as an append-only ledger row. Any number of engine
//! instances may share one store; row locks decide which engine advances a
//! process, and a periodic heartbeat recovers work abandoned by dead engines.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Embedder                                    │
//! │        create_process / continue_process / commit_activity / ...         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               Engine                                     │
//! │   execution loop ── NodeRegistry ── Evaluator (lane rules) ── Crypto     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              ▲
//!           │ Store / Transaction                          │ continue / timeout
//!           ▼                                              │
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │  PostgreSQL / Memory  │◄───── SKIP LOCKED ─│         Heartbeat           │
//! │ processes, states,    │                    │ orphans, timers, triggers,  │
//! │ managers, timers, ... │                    │ switches                    │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # Step Protocol
//!
//! Each iteration of the execution loop runs in one transaction:
//!
//! 1. Lock the process row, requiring the captured current state is still current
//! 2. Lock the captured state with `NOWAIT`; a held lock is a live writer
//! 3. Run the node named by the captured state's `next_node_id`
//! 4. Insert the new state with `step_number = captured + 1` and move the pointer
//! 5. Create timers and activity managers requested by the node, then commit
//!
//! Losing any of those races surfaces as [`EngineError::LockConflict`]; the
//! ledger never forks.
//!
//! # Process Status State Machine
//!
//! ```text
//!                    ┌───────────┐
//!                    │ UNSTARTED │
//!                    └─────┬─────┘
//!                          │ run
//!                          ▼
//!     ┌──────────────►┌─────────┐◄──────────────┐
//!     │     ┌─────────│ RUNNING │──────────┐    │
//!     │     │         └────┬────┘          │    │
//!     │ user task     timer node    sub-process │
//!     │     ▼              ▼               ▼    │
//!     │ ┌─────────┐  ┌─────────┐   ┌───────────┐│
//!     └─│ WAITING │  │ PENDING │   │ DELEGATED │┘ continue
//!       └─────────┘  └─────────┘   └───────────┘
//!
//!   RUNNING ──► FINISHED | ERROR
//!   any non-terminal ──► FORBIDDEN | EXPIRED | INTERRUPTED
//! ```
//!
//! ## Status Descriptions
//!
//! | Status | Description |
//! |--------|-------------|
//! | `unstarted` | Created, no node executed yet |
//! | `running` | The execution loop keeps going |
//! | `waiting` | Suspended on a human task |
//! | `pending` | Suspended on a timer |
//! | `delegated` | Suspended on a child process |
//! | `finished` | Reached a finish node |
//! | `error` | A node failed |
//! | `forbidden` | The actor failed a lane rule |
//! | `expired` | A suspension outlived its deadline |
//! | `interrupted` | Interrupted by an actor |
//!
//! # Configuration
//!
//! The standalone binary loads its configuration from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `LANEWISE_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `LANEWISE_MAX_CONNECTIONS` | No | `10` | Pool size |
//! | `LANEWISE_ENGINE_ID` | No | random UUID | Identity stamped on written steps |
//! | `LANEWISE_HEARTBEAT_INTERVAL_MS` | No | `1000` | Heartbeat tick |
//! | `LANEWISE_HEARTBEAT_MODE` | No | `parallel` | `parallel` or `sequential` |
//! | `LANEWISE_ORPHAN_GRACE_MS` | No | `3000` | Age before a foreign running step is orphaned |
//! | `LANEWISE_*_BATCH_SIZE` | No | `10` | Orphan, timer, trigger and switch batch sizes |
//! | `LANEWISE_HEARTBEAT_ENABLED` | No | `true` | Start the heartbeat |
//!
//! # Modules
//!
//! - [`activity`]: Human-task activity managers and their activities
//! - [`blueprint`]: Process graph definitions
//! - [`config`]: Configuration from environment variables
//! - [`engine`]: The engine handle and its builder
//! - [`error`]: Error types with stable error codes
//! - [`evaluator`]: Lane rule evaluation and field encryption seams
//! - [`heartbeat`]: Periodic recovery and time-based resumption
//! - [`migrations`]: Embedded PostgreSQL schema
//! - [`nodes`]: Node behaviours and the registry resolving them
//! - [`persistence`]: Store abstraction with PostgreSQL and in-memory backends
//! - [`process`]: Process lifecycle and the execution loop
//! - [`process_state`]: The append-only step ledger
//! - [`switch`]: N-of-M join barriers
//! - [`timer`]: Expiry timers
//! - [`trigger`]: Signals and their targets
//! - [`workflow`]: Versioned workflow definitions

#![warn(missing_docs)]

/// Activity managers: human tasks collecting activities.
pub mod activity;

/// Blueprint graph types.
pub mod blueprint;

/// Configuration loaded from environment variables.
pub mod config;

/// Engine handle, builder and observer hooks.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Expression evaluation and field encryption seams.
pub mod evaluator;

/// Heartbeat loop driving the resolution passes.
pub mod heartbeat;

/// Embedded database migrations.
pub mod migrations;

/// Node behaviours.
pub mod nodes;

/// Storage port and its backends.
pub mod persistence;

/// Processes and the execution loop.
pub mod process;

/// Step ledger rows.
pub mod process_state;

/// N-of-M switches.
pub mod switch;

/// Expiry timers.
pub mod timer;

/// Signals, triggers and targets.
pub mod trigger;

/// Versioned workflows.
pub mod workflow;

pub use activity::{Activity, ActivityManager, ActivityManagerStatus, ActivityManagerType};
pub use blueprint::{Blueprint, LaneSpec, NodeSpec};
pub use config::{Config, EngineConfig, HeartbeatMode};
pub use engine::{ActivityManagerNotifier, Engine, EngineBuilder, ProcessStateNotifier};
pub use error::{EngineError, Result};
pub use evaluator::{Crypto, DefaultEvaluator, Evaluator, NoopCrypto};
pub use heartbeat::{HeartbeatHandle, HeartbeatPass, HeartbeatReport};
pub use nodes::{Node, NodeInput, NodeKind, NodeOutput, NodeRegistry};
pub use persistence::{MemoryStore, PostgresStore, Store};
pub use process::{Creation, Process, StateOverride};
pub use process_state::{ProcessState, ProcessStatus};
pub use switch::{Switch, SwitchPolicy};
pub use timer::{ResourceType, Timeoutable, Timer};
pub use trigger::{Target, TargetResource, TargetType, Trigger};
pub use workflow::Workflow;
