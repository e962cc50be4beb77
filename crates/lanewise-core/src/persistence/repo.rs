// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed repository functions over the generic storage port.
//!
//! Every record type implements [`Entity`]; the free functions here convert
//! between records and rows so domain modules never touch raw JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use super::{Filter, LockMode, Store, Table, Transaction};
use crate::error::Result;

/// A record persisted in one [`Table`].
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    /// Backing table.
    const TABLE: Table;

    /// Primary key.
    fn id(&self) -> Uuid;
}

fn decode<E: Entity>(rows: Vec<serde_json::Value>) -> Result<Vec<E>> {
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(Into::into))
        .collect()
}

/// Fetch one record by id.
pub async fn get<E: Entity>(tx: &mut dyn Transaction, id: Uuid) -> Result<Option<E>> {
    match tx.get(E::TABLE, id).await? {
        Some(row) => Ok(Some(serde_json::from_value(row)?)),
        None => Ok(None),
    }
}

/// Fetch every record matching `filter`.
pub async fn find<E: Entity>(tx: &mut dyn Transaction, filter: &Filter) -> Result<Vec<E>> {
    decode(tx.find(E::TABLE, filter).await?)
}

/// Fetch the first record matching `filter`.
pub async fn find_one<E: Entity>(tx: &mut dyn Transaction, filter: Filter) -> Result<Option<E>> {
    Ok(find(tx, &filter.limit(1)).await?.into_iter().next())
}

/// Fetch and lock records matching `filter`.
pub async fn lock<E: Entity>(
    tx: &mut dyn Transaction,
    filter: &Filter,
    mode: LockMode,
) -> Result<Vec<E>> {
    decode(tx.lock(E::TABLE, filter, mode).await?)
}

/// Insert or update a record.
pub async fn save<E: Entity>(tx: &mut dyn Transaction, entity: &E) -> Result<()> {
    let row = serde_json::to_value(entity)?;
    tx.save(E::TABLE, row).await
}

/// Delete one record by id. Returns whether it existed.
pub async fn delete<E: Entity>(tx: &mut dyn Transaction, id: Uuid) -> Result<bool> {
    Ok(tx.delete(E::TABLE, &Filter::by_id(id)).await? > 0)
}

/// Delete every record matching `filter`.
pub async fn delete_where<E: Entity>(tx: &mut dyn Transaction, filter: &Filter) -> Result<u64> {
    tx.delete(E::TABLE, filter).await
}

/// Read one record in a short-lived transaction of its own.
pub async fn fetch<E: Entity>(store: &dyn Store, id: Uuid) -> Result<Option<E>> {
    let mut tx = store.begin().await?;
    let entity = get::<E>(tx.as_mut(), id).await?;
    tx.commit().await?;
    Ok(entity)
}

/// Read every record matching `filter` in a short-lived transaction.
pub async fn fetch_all<E: Entity>(store: &dyn Store, filter: &Filter) -> Result<Vec<E>> {
    let mut tx = store.begin().await?;
    let entities = find::<E>(tx.as_mut(), filter).await?;
    tx.commit().await?;
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use chrono::{DateTime, Utc};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Signal {
        id: Uuid,
        signal: String,
        input: serde_json::Value,
        active: bool,
        results: serde_json::Value,
        fired_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
    }

    impl Entity for Signal {
        const TABLE: Table = Table::Trigger;
        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn signal(name: &str) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            signal: name.to_string(),
            input: serde_json::json!({}),
            active: true,
            results: serde_json::json!([]),
            fired_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_typed_roundtrip_through_store() {
        let store = MemoryStore::new();
        let record = signal("order.paid");

        let mut tx = store.begin().await.unwrap();
        save(tx.as_mut(), &record).await.unwrap();
        tx.commit().await.unwrap();

        let loaded: Signal = fetch(&store, record.id()).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_find_one_and_delete() {
        let store = MemoryStore::new();
        let a = signal("a");
        let b = signal("b");

        let mut tx = store.begin().await.unwrap();
        save(tx.as_mut(), &a).await.unwrap();
        save(tx.as_mut(), &b).await.unwrap();

        let found: Option<Signal> = find_one(tx.as_mut(), Filter::new().eq("signal", "b"))
            .await
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(b.id));

        assert!(delete::<Signal>(tx.as_mut(), a.id).await.unwrap());
        assert!(!delete::<Signal>(tx.as_mut(), a.id).await.unwrap());
        tx.commit().await.unwrap();

        let remaining: Vec<Signal> = fetch_all(&store, &Filter::new()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }
}
