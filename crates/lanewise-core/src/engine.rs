// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine context.
//!
//! [`Engine`] is a cheap, cloneable handle over everything a process needs:
//! the store, the node registry, the evaluator and crypto collaborators, the
//! configuration and the observer hooks. Operations are spread over the
//! domain modules as `impl Engine` blocks ([`crate::process`],
//! [`crate::activity`], [`crate::timer`], [`crate::trigger`],
//! [`crate::switch`], [`crate::heartbeat`]).
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lanewise_core::{Engine, persistence::MemoryStore};
//!
//! let engine = Engine::builder()
//!     .store(Arc::new(MemoryStore::new()))
//!     .build()?;
//!
//! let heartbeat = engine.start_heartbeat();
//! // ... create and run processes ...
//! heartbeat.shutdown().await;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::activity::ActivityManager;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::evaluator::{Crypto, DefaultEvaluator, Evaluator, NoopCrypto};
use crate::nodes::NodeRegistry;
use crate::persistence::Store;
use crate::process_state::ProcessState;

/// Boxed future used where engine operations re-enter each other.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Called after every persisted step with the step and the acting actor.
pub type ProcessStateNotifier = Arc<dyn Fn(&ProcessState, &Value) + Send + Sync>;

/// Called after every activity manager creation or mutation.
pub type ActivityManagerNotifier = Arc<dyn Fn(&ActivityManager) + Send + Sync>;

#[derive(Default)]
struct Observers {
    process_state: RwLock<Option<ProcessStateNotifier>>,
    activity_manager: RwLock<Option<ActivityManagerNotifier>>,
}

struct EngineInner {
    store: Arc<dyn Store>,
    nodes: NodeRegistry,
    evaluator: Arc<dyn Evaluator>,
    crypto: Arc<dyn Crypto>,
    config: EngineConfig,
    observers: Observers,
}

/// Handle to a configured engine. Clones share the same context.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("engine_id", &self.inner.config.engine_id)
            .field("store", &self.inner.store.backend())
            .field("nodes", &self.inner.nodes)
            .finish()
    }
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Identity stamped on every step this engine writes.
    pub fn engine_id(&self) -> &str {
        &self.inner.config.engine_id
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Backing store.
    pub fn store(&self) -> &dyn Store {
        self.inner.store.as_ref()
    }

    pub(crate) fn nodes(&self) -> &NodeRegistry {
        &self.inner.nodes
    }

    pub(crate) fn evaluator(&self) -> &dyn Evaluator {
        self.inner.evaluator.as_ref()
    }

    pub(crate) fn crypto(&self) -> &dyn Crypto {
        self.inner.crypto.as_ref()
    }

    /// Replace the process-state observer. `None` removes it.
    pub fn set_process_state_notifier(&self, notifier: Option<ProcessStateNotifier>) {
        let mut slot = self
            .inner
            .observers
            .process_state
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = notifier;
    }

    /// Replace the activity-manager observer. `None` removes it.
    pub fn set_activity_manager_notifier(&self, notifier: Option<ActivityManagerNotifier>) {
        let mut slot = self
            .inner
            .observers
            .activity_manager
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = notifier;
    }

    pub(crate) fn notify_process_state(&self, state: &ProcessState) {
        let notifier = self
            .inner
            .observers
            .process_state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(notify) = notifier {
            notify(state, &state.actor_data);
        }
    }

    pub(crate) fn notify_activity_manager(&self, manager: &ActivityManager) {
        let notifier = self
            .inner
            .observers
            .activity_manager
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(notify) = notifier {
            notify(manager);
        }
    }
}

/// Builder for creating an [`Engine`].
pub struct EngineBuilder {
    store: Option<Arc<dyn Store>>,
    nodes: NodeRegistry,
    evaluator: Arc<dyn Evaluator>,
    crypto: Arc<dyn Crypto>,
    config: EngineConfig,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("store", &self.store.as_ref().map(|s| s.backend()))
            .field("nodes", &self.nodes)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            store: None,
            nodes: NodeRegistry::with_builtins(),
            evaluator: Arc::new(DefaultEvaluator),
            crypto: Arc::new(NoopCrypto),
            config: EngineConfig::default(),
        }
    }
}

impl EngineBuilder {
    /// Create a new builder with built-in nodes and default collaborators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the node registry.
    ///
    /// Default: [`NodeRegistry::with_builtins`]
    pub fn nodes(mut self, nodes: NodeRegistry) -> Self {
        self.nodes = nodes;
        self
    }

    /// Replace the rule evaluator.
    ///
    /// Default: [`DefaultEvaluator`]
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Replace the field encryption collaborator.
    ///
    /// Default: [`NoopCrypto`]
    pub fn crypto(mut self, crypto: Arc<dyn Crypto>) -> Self {
        self.crypto = crypto;
        self
    }

    /// Replace the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<Engine> {
        let store = self
            .store
            .ok_or_else(|| EngineError::Config("store is required".to_string()))?;
        if self.config.engine_id.is_empty() {
            return Err(EngineError::Config("engine_id must not be empty".to_string()));
        }

        Ok(Engine {
            inner: Arc::new(EngineInner {
                store,
                nodes: self.nodes,
                evaluator: self.evaluator,
                crypto: self.crypto,
                config: self.config,
                observers: Observers::default(),
            }),
        })
    }
}
