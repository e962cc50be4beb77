// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Versioned workflow catalogue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::blueprint::Blueprint;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::persistence::repo::{self, Entity};
use crate::persistence::{Filter, Table, Transaction};

/// One version of a named blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Row id; processes reference this.
    pub id: Uuid,
    /// Name shared by every version.
    pub name: String,
    /// Free text.
    pub description: Option<String>,
    /// 1 for the first version of a name.
    pub version: i64,
    /// Graph instantiated by processes.
    pub blueprint: Blueprint,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

impl Entity for Workflow {
    const TABLE: Table = Table::Workflow;

    fn id(&self) -> Uuid {
        self.id
    }
}

/// Latest version of `name`.
pub(crate) async fn latest_by_name(
    tx: &mut dyn Transaction,
    name: &str,
) -> Result<Option<Workflow>> {
    repo::find_one(tx, Filter::new().eq("name", name).order_desc("version")).await
}

impl Engine {
    /// Store `blueprint` as the next version of `name`.
    #[instrument(skip(self, blueprint))]
    pub async fn save_workflow(
        &self,
        name: &str,
        description: Option<&str>,
        blueprint: Blueprint,
    ) -> Result<Workflow> {
        let mut tx = self.store().begin().await?;
        let version = latest_by_name(tx.as_mut(), name)
            .await?
            .map(|w| w.version + 1)
            .unwrap_or(1);

        let workflow = Workflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(str::to_string),
            version,
            blueprint,
            created_at: Utc::now(),
        };
        repo::save(tx.as_mut(), &workflow).await?;
        tx.commit().await?;

        info!(workflow_id = %workflow.id, version, "Workflow saved");
        Ok(workflow)
    }

    /// Fetch a workflow version by id.
    pub async fn fetch_workflow(&self, workflow_id: Uuid) -> Result<Workflow> {
        repo::fetch(self.store(), workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound {
                workflow: workflow_id.to_string(),
            })
    }

    /// Latest version of a workflow by name.
    pub async fn fetch_workflow_by_name(&self, name: &str) -> Result<Workflow> {
        let mut tx = self.store().begin().await?;
        let workflow = latest_by_name(tx.as_mut(), name).await?;
        tx.commit().await?;
        workflow.ok_or_else(|| EngineError::WorkflowNotFound {
            workflow: name.to_string(),
        })
    }
}
