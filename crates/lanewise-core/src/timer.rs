// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Timers: "wake this resource at time T".
//!
//! A timer is consumed when it fires. The row is deleted and committed before
//! the resource's timeout handler runs, so a timer never fires twice even
//! when several engines poll the same store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityManager;
use crate::engine::Engine;
use crate::error::Result;
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, LockMode, Table};
use crate::process::Process;

/// Kind of resource a timer is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// A [`Process`].
    Process,
    /// An [`ActivityManager`].
    ActivityManager,
}

/// A resource that reacts to its timers.
#[async_trait]
pub trait Timeoutable: Send + Sync {
    /// Handle an expired timer. The timer row is already gone.
    async fn timeout(&self, engine: &Engine, timer: &Timer) -> Result<()>;
}

/// Expiry primitive bound to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Row id.
    pub id: Uuid,
    /// Kind of the bound resource.
    pub resource_type: ResourceType,
    /// Bound resource.
    pub resource_id: Uuid,
    /// Due time.
    pub expires_at: DateTime<Utc>,
    /// Inactive timers never fire.
    pub active: bool,
    /// Handler-specific data.
    pub params: Value,
    /// Set on the in-memory copy handed to the handler.
    pub fired_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Timer {
    const TABLE: Table = Table::Timer;

    fn id(&self) -> Uuid {
        self.id
    }
}

impl Timer {
    /// Active timer due `seconds` from now.
    pub fn after(
        resource_type: ResourceType,
        resource_id: Uuid,
        seconds: f64,
        params: Value,
    ) -> Self {
        let now = Utc::now();
        let millis = (seconds.max(0.0) * 1000.0).round() as i64;
        Self {
            id: Uuid::new_v4(),
            resource_type,
            resource_id,
            expires_at: now + chrono::Duration::milliseconds(millis),
            active: true,
            params,
            fired_at: None,
            created_at: now,
        }
    }

    /// Consume this timer and dispatch to its resource.
    ///
    /// Returns `false` when the row was already consumed elsewhere.
    pub async fn run(mut self, engine: &Engine) -> Result<bool> {
        let mut tx = engine.store().begin().await?;
        let deleted = repo::delete::<Timer>(tx.as_mut(), self.id).await?;
        tx.commit().await?;
        if !deleted {
            return Ok(false);
        }
        self.fired_at = Some(Utc::now());
        self.dispatch(engine).await?;
        Ok(true)
    }

    async fn dispatch(&self, engine: &Engine) -> Result<()> {
        let resource: Option<Box<dyn Timeoutable>> = match self.resource_type {
            ResourceType::Process => repo::fetch::<Process>(engine.store(), self.resource_id)
                .await?
                .map(|p| Box::new(p) as Box<dyn Timeoutable>),
            ResourceType::ActivityManager => {
                repo::fetch::<ActivityManager>(engine.store(), self.resource_id)
                    .await?
                    .map(|m| Box::new(m) as Box<dyn Timeoutable>)
            }
        };

        match resource {
            Some(resource) => resource.timeout(engine, self).await,
            None => {
                debug!(timer_id = %self.id, resource_id = %self.resource_id, "Timer resource is gone");
                Ok(())
            }
        }
    }
}

impl Engine {
    /// Claim due timers with `SKIP LOCKED`, consume them, then run their handlers.
    #[instrument(skip(self), fields(engine_id = %self.engine_id()))]
    pub async fn fire_timers(&self) -> Result<usize> {
        let mut tx = self.store().begin().await?;
        let due: Vec<Timer> = repo::lock(
            tx.as_mut(),
            &Filter::new()
                .eq("active", true)
                .lt("expires_at", Utc::now())
                .order_asc("expires_at")
                .limit(self.config().timer_batch_size),
            LockMode::SkipLocked,
        )
        .await?;
        for timer in &due {
            repo::delete::<Timer>(tx.as_mut(), timer.id).await?;
        }
        tx.commit().await?;

        let fired = due.len();
        let now = Utc::now();
        for mut timer in due {
            timer.fired_at = Some(now);
            debug!(timer_id = %timer.id, resource_id = %timer.resource_id, "Timer fired");
            if let Err(e) = timer.dispatch(self).await {
                warn!(timer_id = %timer.id, error = %e, "Timer handler failed");
            }
        }
        Ok(fired)
    }
}
