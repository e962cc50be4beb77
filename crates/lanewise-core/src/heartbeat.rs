// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The heartbeat: periodic recovery and time-based resumption.
//!
//! Every tick runs one or all of four passes, each claiming its work with
//! `SKIP LOCKED` in its own transaction so engines sharing a store partition
//! the work instead of blocking each other:
//!
//! | Pass | Claims | Then |
//! |------|--------|------|
//! | orphans | `running` processes abandoned by another engine | re-enter the execution loop |
//! | timers | active timers past `expires_at` | resource timeout handler |
//! | triggers | active triggers | run matching targets |
//! | switches | active switches | force a batch, check it later |
//!
//! A failed pass is logged and the next tick runs regardless.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::HeartbeatMode;
use crate::engine::Engine;
use crate::error::Result;

/// One resolution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatPass {
    /// [`Engine::resolve_orphans`]
    Orphans,
    /// [`Engine::fire_timers`]
    Timers,
    /// [`Engine::fire_triggers`]
    Triggers,
    /// [`Engine::check_switches`]
    Switches,
}

impl HeartbeatPass {
    /// Round-robin order of sequential mode.
    pub const ALL: [HeartbeatPass; 4] = [
        HeartbeatPass::Orphans,
        HeartbeatPass::Timers,
        HeartbeatPass::Triggers,
        HeartbeatPass::Switches,
    ];

    /// Returns the string representation of the pass.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orphans => "orphans",
            Self::Timers => "timers",
            Self::Triggers => "triggers",
            Self::Switches => "switches",
        }
    }
}

/// Items handled per pass in one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Orphaned processes resumed.
    pub orphans: usize,
    /// Timers fired.
    pub timers: usize,
    /// Triggers delivered.
    pub triggers: usize,
    /// Switches checked.
    pub switches: usize,
}

/// Handle to a running heartbeat task.
pub struct HeartbeatHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the heartbeat and wait for the current tick to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.task.await {
            error!(error = %e, "Heartbeat task panicked");
        }
    }

    /// Check if the heartbeat is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Engine {
    /// Run one pass, logging its failure instead of returning it.
    async fn run_pass(&self, pass: HeartbeatPass) -> usize {
        let outcome: Result<usize> = match pass {
            HeartbeatPass::Orphans => self.resolve_orphans().await,
            HeartbeatPass::Timers => self.fire_timers().await,
            HeartbeatPass::Triggers => self.fire_triggers().await,
            HeartbeatPass::Switches => self.check_switches().await,
        };
        match outcome {
            Ok(count) => {
                if count > 0 {
                    debug!(pass = pass.as_str(), count, "Heartbeat pass handled work");
                }
                count
            }
            Err(e) => {
                error!(pass = pass.as_str(), error = %e, "Heartbeat pass failed");
                0
            }
        }
    }

    /// Run all four passes concurrently, once.
    pub async fn heartbeat_once(&self) -> HeartbeatReport {
        let (orphans, timers, triggers, switches) = tokio::join!(
            self.run_pass(HeartbeatPass::Orphans),
            self.run_pass(HeartbeatPass::Timers),
            self.run_pass(HeartbeatPass::Triggers),
            self.run_pass(HeartbeatPass::Switches),
        );
        HeartbeatReport {
            orphans,
            timers,
            triggers,
            switches,
        }
    }

    /// Spawn the heartbeat loop on the current tokio runtime.
    pub fn start_heartbeat(&self) -> HeartbeatHandle {
        let shutdown = Arc::new(Notify::new());
        let engine = self.clone();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move { engine.heartbeat_loop(signal).await });
        HeartbeatHandle { shutdown, task }
    }

    async fn heartbeat_loop(self, shutdown: Arc<Notify>) {
        let interval = self.config().heartbeat_interval;
        let mode = self.config().heartbeat_mode;
        info!(
            engine_id = %self.engine_id(),
            interval_ms = interval.as_millis() as u64,
            mode = ?mode,
            "Heartbeat started"
        );

        let mut cursor = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!(engine_id = %self.engine_id(), "Heartbeat shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    match mode {
                        HeartbeatMode::Parallel => {
                            self.heartbeat_once().await;
                        }
                        HeartbeatMode::Sequential => {
                            let pass = HeartbeatPass::ALL[cursor % HeartbeatPass::ALL.len()];
                            cursor = cursor.wrapping_add(1);
                            self.run_pass(pass).await;
                        }
                    }
                }
            }
        }
    }
}
