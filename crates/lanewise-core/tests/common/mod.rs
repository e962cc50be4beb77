// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for lanewise-core integration tests.
//!
//! Provides TestContext over a shared in-memory store plus blueprint helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use lanewise_core::blueprint::{Blueprint, LaneSpec, NodeSpec};
use lanewise_core::config::EngineConfig;
use lanewise_core::persistence::{MemoryStore, Store, repo};
use lanewise_core::{Engine, NodeKind, Process, ProcessState, ProcessStatus, Workflow};

/// Skip test if TEST_DATABASE_URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        }
    };
}

/// One store, any number of engines.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub engine: Engine,
}

impl TestContext {
    /// Context with a single engine using default tuning.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_on(&store, config);
        Self { store, engine }
    }

    /// Another engine sharing this context's store.
    pub fn peer(&self, engine_id: &str, orphan_grace: Duration) -> Engine {
        engine_on(
            &self.store,
            EngineConfig {
                engine_id: engine_id.to_string(),
                orphan_grace,
                ..EngineConfig::default()
            },
        )
    }

    /// Save `blueprint` and create and run a process from it.
    pub async fn start(&self, name: &str, blueprint: Blueprint, actor: Value) -> Process {
        let workflow = self.engine.save_workflow(name, None, blueprint).await.unwrap();
        self.start_workflow(&workflow, actor).await
    }

    pub async fn start_workflow(&self, workflow: &Workflow, actor: Value) -> Process {
        let process = self
            .engine
            .create_process(workflow.id, actor, json!({}))
            .await
            .unwrap()
            .process()
            .expect("process should be created");
        self.engine.run_process(process.id, None).await.unwrap()
    }

    /// `(step_number, status)` of every ledger entry.
    pub async fn ledger(&self, process_id: Uuid) -> Vec<(i64, ProcessStatus)> {
        self.engine
            .state_history(process_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| (s.step_number, s.status))
            .collect()
    }
}

pub fn engine_on(store: &Arc<MemoryStore>, config: EngineConfig) -> Engine {
    Engine::builder()
        .store(store.clone())
        .config(config)
        .build()
        .unwrap()
}

pub fn node(id: &str, kind: NodeKind, next: Option<&str>, parameters: Value) -> NodeSpec {
    NodeSpec {
        id: id.to_string(),
        name: format!("node {id}"),
        kind,
        lane_id: "1".to_string(),
        next: next.map(str::to_string),
        parameters,
    }
}

/// Blueprint with a single lane governed by `rule`.
pub fn blueprint(nodes: Vec<NodeSpec>, rule: Value) -> Blueprint {
    Blueprint {
        nodes,
        lanes: vec![LaneSpec {
            id: "1".to_string(),
            name: "main".to_string(),
            rule,
        }],
        environment: Default::default(),
    }
}

/// start -> finish
pub fn straight_line() -> Blueprint {
    blueprint(
        vec![
            node("1", NodeKind::Start, Some("2"), json!({})),
            node("2", NodeKind::Finish, None, json!({})),
        ],
        json!(true),
    )
}

/// start -> user task -> finish
pub fn approval(parameters: Value, rule: Value) -> Blueprint {
    blueprint(
        vec![
            node("1", NodeKind::Start, Some("2"), json!({})),
            node("2", NodeKind::UserTask, Some("3"), parameters),
            node("3", NodeKind::Finish, None, json!({})),
        ],
        rule,
    )
}

/// start -> timer -> finish
pub fn delayed(seconds: f64) -> Blueprint {
    blueprint(
        vec![
            node("1", NodeKind::Start, Some("2"), json!({})),
            node("2", NodeKind::Timer, Some("3"), json!({"timeout": seconds})),
            node("3", NodeKind::Finish, None, json!({})),
        ],
        json!(true),
    )
}

/// Leave a process `running` at step 2 as if `engine_id` died mid-loop.
///
/// The workflow is start -> system task -> finish over the bag `{"order": 7}`.
pub async fn abandon(
    engine: &Engine,
    workflow_name: &str,
    engine_id: &str,
    age: chrono::Duration,
) -> Uuid {
    let flow = blueprint(
        vec![
            node("1", NodeKind::Start, Some("2"), json!({})),
            node("2", NodeKind::SystemTask, Some("3"), json!({})),
            node("3", NodeKind::Finish, None, json!({})),
        ],
        json!(true),
    );
    let workflow = engine.save_workflow(workflow_name, None, flow).await.unwrap();
    let mut process = engine
        .create_process(workflow.id, json!({}), json!({"order": 7}))
        .await
        .unwrap()
        .process()
        .unwrap();
    let first = engine.current_state(process.id).await.unwrap();

    let state = ProcessState {
        id: Uuid::new_v4(),
        process_id: process.id,
        step_number: 2,
        node_id: "2".to_string(),
        next_node_id: Some("3".to_string()),
        bag: first.bag.clone(),
        external_input: Value::Null,
        result: Value::Null,
        error: None,
        status: ProcessStatus::Running,
        actor_data: json!({}),
        engine_id: engine_id.to_string(),
        time_elapsed: None,
        created_at: Utc::now() - age,
    };
    process.current_state_id = state.id;
    process.current_status = ProcessStatus::Running;
    process.current_node_id = state.node_id.clone();

    let mut tx = engine.store().begin().await.unwrap();
    repo::save(tx.as_mut(), &state).await.unwrap();
    repo::save::<Process>(tx.as_mut(), &process).await.unwrap();
    tx.commit().await.unwrap();
    process.id
}
