// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory persistence with row-level locking.
//!
//! Transactions run concurrently. Each one buffers its writes and applies
//! them on commit; reads see committed rows overlaid with the transaction's
//! own writes. Row locks are tracked per `(table, id)` and released when the
//! transaction commits, rolls back or is dropped:
//!
//! - `Wait` blocks until no matching row is held by another transaction, then
//!   re-evaluates the filter against the latest committed rows.
//! - `NoWait` fails with [`EngineError::LockConflict`] if any matching row is
//!   held.
//! - `SkipLocked` leaves held rows out before the limit is applied.
//!
//! Updating or deleting an existing row takes its lock implicitly, like
//! `UPDATE` and `DELETE` do in Postgres. There is no deadlock detection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{Cmp, Condition, Filter, LockMode, Order, Param, Store, Table, Transaction};
use crate::error::{EngineError, Result};

type Rows = BTreeMap<Uuid, Value>;

#[derive(Debug, Default)]
struct Shared {
    rows: HashMap<Table, Rows>,
    locks: HashMap<(Table, Uuid), u64>,
}

#[derive(Debug, Default)]
struct Inner {
    shared: Mutex<Shared>,
    released: Notify,
    next_tx: AtomicU64,
}

/// In-memory store for tests and embedded single-process use.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            id: self.inner.next_tx.fetch_add(1, AtomicOrdering::Relaxed),
            inner: self.inner.clone(),
            writes: HashMap::new(),
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTransaction {
    id: u64,
    inner: Arc<Inner>,
    /// Pending writes; `None` marks a delete.
    writes: HashMap<Table, BTreeMap<Uuid, Option<Value>>>,
}

fn row_id(row: &Value) -> Option<Uuid> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

impl MemoryTransaction {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Committed rows of `table` overlaid with this transaction's writes.
    fn visible(&self, shared: &Shared, table: Table) -> Rows {
        let mut rows = shared.rows.get(&table).cloned().unwrap_or_default();
        if let Some(writes) = self.writes.get(&table) {
            for (id, row) in writes {
                match row {
                    Some(row) => {
                        rows.insert(*id, row.clone());
                    }
                    None => {
                        rows.remove(id);
                    }
                }
            }
        }
        rows
    }

    fn select(
        &self,
        shared: &Shared,
        table: Table,
        filter: &Filter,
        limited: bool,
    ) -> Result<Vec<Value>> {
        filter.validate(table)?;

        let mut rows: Vec<Value> = self
            .visible(shared, table)
            .into_values()
            .filter(|row| filter.conditions.iter().all(|c| matches(row, c)))
            .collect();

        if !filter.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for (column, order) in &filter.order_by {
                    let ordering = compare_values(&a[*column], &b[*column]);
                    let ordering = match order {
                        Order::Asc => ordering,
                        Order::Desc => ordering.reverse(),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                Ordering::Equal
            });
        }

        if limited {
            if let Some(limit) = filter.limit {
                rows.truncate(limit.max(0) as usize);
            }
        }

        Ok(rows)
    }

    fn held_by_other(&self, shared: &Shared, table: Table, id: Uuid) -> bool {
        shared
            .locks
            .get(&(table, id))
            .is_some_and(|owner| *owner != self.id)
    }

    fn acquire(&self, shared: &mut Shared, table: Table, rows: &[Value]) {
        for id in rows.iter().filter_map(row_id) {
            shared.locks.insert((table, id), self.id);
        }
    }

    /// Lock the rows chosen by `pick`, waiting while any is held elsewhere.
    ///
    /// `pick` runs again after every release, so rows that stopped matching
    /// while we waited are not returned.
    async fn wait_for<F>(&self, table: Table, pick: F) -> Result<Vec<Value>>
    where
        F: Fn(&Shared) -> Result<Vec<Value>> + Send,
    {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut shared = self.shared();
                let rows = pick(&*shared)?;
                let blocked = rows
                    .iter()
                    .filter_map(row_id)
                    .any(|id| self.held_by_other(&shared, table, id));
                if !blocked {
                    self.acquire(&mut shared, table, &rows);
                    return Ok(rows);
                }
            }

            released.await;
        }
    }

    fn release(&self) {
        {
            let mut shared = self.shared();
            shared.locks.retain(|_, owner| *owner != self.id);
        }
        self.inner.released.notify_waiters();
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&mut self, table: Table, id: Uuid) -> Result<Option<Value>> {
        let shared = self.shared();
        Ok(self.visible(&shared, table).remove(&id))
    }

    async fn find(&mut self, table: Table, filter: &Filter) -> Result<Vec<Value>> {
        let shared = self.shared();
        self.select(&shared, table, filter, true)
    }

    async fn lock(&mut self, table: Table, filter: &Filter, mode: LockMode) -> Result<Vec<Value>> {
        filter.validate(table)?;
        match mode {
            LockMode::Wait => {
                self.wait_for(table, |shared| self.select(shared, table, filter, true))
                    .await
            }
            LockMode::NoWait => {
                let mut shared = self.shared();
                let rows = self.select(&shared, table, filter, true)?;
                if let Some(id) = rows
                    .iter()
                    .filter_map(row_id)
                    .find(|id| self.held_by_other(&shared, table, *id))
                {
                    return Err(EngineError::lock_conflict(
                        table.name(),
                        id,
                        "row is locked by another transaction",
                    ));
                }
                self.acquire(&mut shared, table, &rows);
                Ok(rows)
            }
            LockMode::SkipLocked => {
                let mut shared = self.shared();
                let mut rows = self.select(&shared, table, filter, false)?;
                rows.retain(|row| {
                    row_id(row).is_some_and(|id| !self.held_by_other(&shared, table, id))
                });
                if let Some(limit) = filter.limit {
                    rows.truncate(limit.max(0) as usize);
                }
                self.acquire(&mut shared, table, &rows);
                Ok(rows)
            }
        }
    }

    async fn save(&mut self, table: Table, row: Value) -> Result<()> {
        let id = row_id(&row).ok_or_else(|| EngineError::Validation {
            field: "id".to_string(),
            message: format!("row for '{}' has no valid id", table.name()),
        })?;

        let row = match row {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| table.has_column(k))
                    .collect(),
            ),
            other => other,
        };

        self.wait_for(table, |shared| {
            Ok(shared
                .rows
                .get(&table)
                .and_then(|rows| rows.get(&id))
                .cloned()
                .into_iter()
                .collect())
        })
        .await?;

        self.writes.entry(table).or_default().insert(id, Some(row));
        Ok(())
    }

    async fn delete(&mut self, table: Table, filter: &Filter) -> Result<u64> {
        // Ordering and limits do not apply to deletes.
        let conditions = Filter {
            conditions: filter.conditions.clone(),
            ..Filter::default()
        };
        let rows = self
            .wait_for(table, |shared| self.select(shared, table, &conditions, false))
            .await?;

        let writes = self.writes.entry(table).or_default();
        for id in rows.iter().filter_map(row_id) {
            writes.insert(id, None);
        }
        Ok(rows.len() as u64)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        {
            let mut shared = self.shared();
            for (table, changes) in writes {
                let rows = shared.rows.entry(table).or_default();
                for (id, row) in changes {
                    match row {
                        Some(row) => {
                            rows.insert(id, row);
                        }
                        None => {
                            rows.remove(&id);
                        }
                    }
                }
            }
        }
        // Locks are released when the box drops.
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn matches(row: &Value, condition: &Condition) -> bool {
    let value = row.get(condition.column).unwrap_or(&Value::Null);

    match (&condition.cmp, &condition.value) {
        (Cmp::Eq, Param::Null) => value.is_null(),
        (Cmp::Ne, Param::Null) => !value.is_null(),
        (Cmp::In, Param::TextList(list)) => value
            .as_str()
            .map(|s| list.iter().any(|item| item == s))
            .unwrap_or(false),
        (Cmp::In, _) => false,
        (cmp, param) => {
            // SQL semantics: comparing NULL yields no match.
            if value.is_null() {
                return false;
            }
            match compare_param(value, param) {
                Some(ordering) => match cmp {
                    Cmp::Eq => ordering == Ordering::Equal,
                    Cmp::Ne => ordering != Ordering::Equal,
                    Cmp::Lt => ordering == Ordering::Less,
                    Cmp::Gt => ordering == Ordering::Greater,
                    Cmp::In => false,
                },
                None => false,
            }
        }
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Order `value` relative to `param`; `None` when the types don't line up.
fn compare_param(value: &Value, param: &Param) -> Option<Ordering> {
    match param {
        Param::Bool(b) => value.as_bool().map(|v| v.cmp(b)),
        Param::Int(i) => value.as_i64().map(|v| v.cmp(i)),
        Param::Text(s) => value.as_str().map(|v| v.cmp(s.as_str())),
        Param::Uuid(u) => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(|v| v.cmp(u)),
        Param::Time(t) => parse_time(value).map(|v| v.cmp(t)),
        Param::Null | Param::TextList(_) => None,
    }
}

/// Total order over stored values, nulls last like Postgres ascending sorts.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => match (parse_time(a), parse_time(b)) {
            (Some(ta), Some(tb)) => ta.cmp(&tb),
            _ => x.cmp(y),
        },
        _ => a.to_string().cmp(&b.to_string()),
    }
}
