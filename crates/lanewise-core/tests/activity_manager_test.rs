// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity manager tests: human tasks, submissions and closing the barrier.

mod common;

use std::sync::{Arc, Mutex};

use serde_json::{Value, json};

use common::*;
use lanewise_core::evaluator::Crypto;
use lanewise_core::{
    ActivityManager, ActivityManagerStatus, ActivityManagerType, Engine, EngineError, NodeKind,
    ProcessStatus, Result,
};

async fn waiting_manager(
    ctx: &TestContext,
    parameters: Value,
    rule: Value,
    actor: Value,
) -> ActivityManager {
    let process = ctx.start("approval", approval(parameters, rule), actor).await;
    assert_eq!(process.current_status, ProcessStatus::Waiting);
    let mut managers = ctx.engine.process_activity_managers(process.id).await.unwrap();
    assert_eq!(managers.len(), 1);
    managers.remove(0)
}

#[tokio::test]
async fn test_user_task_opens_commit_manager() {
    let ctx = TestContext::new();
    let manager = waiting_manager(&ctx, json!({"action": "approve"}), json!(true), json!({})).await;

    assert_eq!(manager.kind, ActivityManagerType::Commit);
    assert_eq!(manager.status, ActivityManagerStatus::Started);
    assert_eq!(manager.props, json!({"action": "approve", "node_name": "node 2"}));
    assert_eq!(manager.next_step_number(), Some(3));
    assert!(manager.timeout_id().is_none());

    let state = ctx.engine.current_state(manager.process_id).await.unwrap();
    assert_eq!(manager.process_state_id, state.id);
}

#[tokio::test]
async fn test_commit_then_push_resumes_with_activities() {
    let ctx = TestContext::new();
    let manager = waiting_manager(&ctx, json!({}), json!(true), json!({})).await;
    let actor = json!({"user": "alice"});

    let committed = ctx
        .engine
        .commit_activity(manager.id, actor.clone(), json!({"any": "external_input"}))
        .await
        .unwrap();
    assert_eq!(committed.activities.len(), 1);
    assert_eq!(committed.status, ActivityManagerStatus::Started);

    let pushed = ctx.engine.push_activity(manager.id, actor.clone()).await.unwrap();
    assert_eq!(pushed.status, ActivityManagerStatus::Completed);

    let process = ctx.engine.fetch_process(manager.process_id).await.unwrap();
    assert_eq!(process.current_status, ProcessStatus::Finished);
    assert_eq!(
        ctx.ledger(process.id).await,
        vec![
            (1, ProcessStatus::Unstarted),
            (2, ProcessStatus::Waiting),
            (3, ProcessStatus::Running),
            (4, ProcessStatus::Finished),
        ]
    );

    let resumed = &ctx.engine.state_history(process.id).await.unwrap()[2];
    assert_eq!(resumed.actor_data, actor);
    assert_eq!(
        resumed.external_input["activities"][0]["data"],
        json!({"any": "external_input"})
    );
    assert_eq!(resumed.external_input["activity_manager_id"], json!(manager.id));
}

#[tokio::test]
async fn test_push_without_activity_is_rejected() {
    let ctx = TestContext::new();
    let manager = waiting_manager(&ctx, json!({}), json!(true), json!({})).await;

    let err = ctx.engine.push_activity(manager.id, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation { .. }));

    let manager = ctx.engine.fetch_activity_manager(manager.id).await.unwrap();
    assert_eq!(manager.status, ActivityManagerStatus::Started);
}

#[tokio::test]
async fn test_closed_manager_rejects_operations() {
    let ctx = TestContext::new();
    let manager = waiting_manager(&ctx, json!({}), json!(true), json!({})).await;

    let interrupted = ctx.engine.interrupt_activity(manager.id, None).await.unwrap();
    assert_eq!(interrupted.status, ActivityManagerStatus::Interrupted);

    let err = ctx
        .engine
        .commit_activity(manager.id, json!({}), json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStatus { .. }));

    // Interrupting leaves the process suspended.
    let process = ctx.engine.fetch_process(manager.process_id).await.unwrap();
    assert_eq!(process.current_status, ProcessStatus::Waiting);
}

#[tokio::test]
async fn test_channel_allow_list_and_lane_rule() {
    let ctx = TestContext::new();
    let approver = json!({"claims": ["approver"], "channel": "web"});
    let manager = waiting_manager(
        &ctx,
        json!({"channels": ["web"]}),
        json!({"claims_any": ["approver"]}),
        approver.clone(),
    )
    .await;

    let wrong_channel = json!({"claims": ["approver"], "channel": "sms"});
    let err = ctx
        .engine
        .commit_activity(manager.id, wrong_channel, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    let wrong_claims = json!({"claims": ["guest"], "channel": "web"});
    let err = ctx
        .engine
        .commit_activity(manager.id, wrong_claims, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { .. }));

    ctx.engine
        .commit_activity(manager.id, approver, json!({"ok": true}))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_notify_manager_completes_on_next_resume() {
    let ctx = TestContext::new();
    let flow = blueprint(
        vec![
            node("1", NodeKind::Start, Some("2"), json!({})),
            node("2", NodeKind::UserTask, Some("3"), json!({"activity_manager": "notify"})),
            node("3", NodeKind::UserTask, Some("4"), json!({})),
            node("4", NodeKind::Finish, None, json!({})),
        ],
        json!(true),
    );
    let process = ctx.start("notify", flow, json!({})).await;
    assert_eq!(process.current_status, ProcessStatus::Waiting);

    let managers = ctx.engine.process_activity_managers(process.id).await.unwrap();
    assert_eq!(managers.len(), 2);
    let notify = managers
        .iter()
        .find(|m| m.kind == ActivityManagerType::Notify)
        .unwrap()
        .clone();
    assert_eq!(notify.status, ActivityManagerStatus::Started);

    ctx.engine
        .continue_process(process.id, None, json!({"skip": true}))
        .await
        .unwrap();

    let notify = ctx.engine.fetch_activity_manager(notify.id).await.unwrap();
    assert_eq!(notify.status, ActivityManagerStatus::Completed);
}

#[tokio::test]
async fn test_recommit_supersedes_timer() {
    let ctx = TestContext::new();
    let manager = waiting_manager(&ctx, json!({"timeout": 60}), json!(true), json!({})).await;
    let first = manager.timeout_id().unwrap();

    let manager = ctx
        .engine
        .commit_activity(manager.id, json!({}), json!({"draft": 1}))
        .await
        .unwrap();
    let second = manager.timeout_id().unwrap();
    assert_ne!(first, second);

    let manager = ctx
        .engine
        .commit_activity(manager.id, json!({}), json!({"draft": 2}))
        .await
        .unwrap();
    assert_eq!(manager.activities.len(), 2);
    assert_eq!(manager.activities[0].data, json!({"draft": 2}));
}

struct Mask;

impl Crypto for Mask {
    fn encrypt(&self, _value: &Value) -> Result<Value> {
        Ok(json!("***"))
    }
}

#[tokio::test]
async fn test_encrypted_fields_and_observer() {
    let ctx = TestContext::new();
    let engine = Engine::builder()
        .store(ctx.store.clone())
        .crypto(Arc::new(Mask))
        .build()
        .unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    engine.set_activity_manager_notifier(Some(Arc::new(move |manager: &ActivityManager| {
        sink.lock().unwrap().push(manager.status);
    })));

    let workflow = engine
        .save_workflow(
            "secret",
            None,
            approval(json!({"encrypted_data": ["iban"]}), json!(true)),
        )
        .await
        .unwrap();
    let process = engine
        .create_process(workflow.id, json!({}), json!({}))
        .await
        .unwrap()
        .process()
        .unwrap();
    engine.run_process(process.id, None).await.unwrap();
    let manager = engine.process_activity_managers(process.id).await.unwrap()[0].clone();

    let manager = engine
        .commit_activity(
            manager.id,
            json!({}),
            json!({"iban": "PL61109010140000071219812874", "name": "Ada"}),
        )
        .await
        .unwrap();
    assert_eq!(manager.activities[0].data, json!({"iban": "***", "name": "Ada"}));

    engine.push_activity(manager.id, json!({})).await.unwrap();
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ActivityManagerStatus::Started,
            ActivityManagerStatus::Started,
            ActivityManagerStatus::Completed,
        ]
    );
}
