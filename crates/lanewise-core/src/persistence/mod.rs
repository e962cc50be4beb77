// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for lanewise-core.
//!
//! The storage port is deliberately small: a [`Store`] hands out
//! [`Transaction`]s, and a transaction reads, locks, writes and deletes rows of
//! a [`Table`]. Rows travel as JSON objects whose keys are the table's
//! columns; typed access lives in [`repo`].
//!
//! Locking is expressed with [`LockMode`]:
//!
//! | Mode | Postgres | Used by |
//! |------|----------|---------|
//! | `Wait` | `FOR UPDATE` | process pointer lock (step 1 of the execution loop) |
//! | `NoWait` | `FOR UPDATE NOWAIT` | current ProcessState lock (step 2) |
//! | `SkipLocked` | `FOR UPDATE SKIP LOCKED` | heartbeat batch claims |

pub mod memory;
pub mod postgres;
pub mod repo;

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Every persisted collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Versioned blueprints.
    Workflow,
    /// Process aggregates.
    Process,
    /// Append-only step ledger.
    ProcessState,
    /// Human-task barriers.
    ActivityManager,
    /// Submissions to an activity manager.
    Activity,
    /// Expiry primitives.
    Timer,
    /// Pending signals.
    Trigger,
    /// Signal subscriptions.
    Target,
    /// N-of-M join barriers.
    Switch,
}

impl Table {
    /// All tables, in dependency order.
    pub const ALL: [Table; 9] = [
        Table::Workflow,
        Table::Process,
        Table::ProcessState,
        Table::ActivityManager,
        Table::Activity,
        Table::Timer,
        Table::Trigger,
        Table::Target,
        Table::Switch,
    ];

    /// Table name in the relational schema.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Workflow => "workflow",
            Table::Process => "process",
            Table::ProcessState => "process_state",
            Table::ActivityManager => "activity_manager",
            Table::Activity => "activity",
            Table::Timer => "timer",
            Table::Trigger => "trigger",
            Table::Target => "target",
            Table::Switch => "switch",
        }
    }

    /// Columns in schema order. `id` is always first.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Workflow => &[
                "id",
                "name",
                "description",
                "version",
                "blueprint",
                "created_at",
            ],
            Table::Process => &[
                "id",
                "workflow_id",
                "blueprint",
                "current_state_id",
                "current_status",
                "current_node_id",
                "parent_process_id",
                "created_at",
            ],
            Table::ProcessState => &[
                "id",
                "process_id",
                "step_number",
                "node_id",
                "next_node_id",
                "bag",
                "external_input",
                "result",
                "error",
                "status",
                "actor_data",
                "engine_id",
                "time_elapsed",
                "created_at",
            ],
            Table::ActivityManager => &[
                "id",
                "process_id",
                "process_state_id",
                "type",
                "status",
                "props",
                "parameters",
                "created_at",
            ],
            Table::Activity => &[
                "id",
                "activity_manager_id",
                "actor_data",
                "data",
                "status",
                "created_at",
            ],
            Table::Timer => &[
                "id",
                "resource_type",
                "resource_id",
                "expires_at",
                "active",
                "params",
                "fired_at",
                "created_at",
            ],
            Table::Trigger => &[
                "id",
                "signal",
                "input",
                "active",
                "results",
                "fired_at",
                "created_at",
            ],
            Table::Target => &[
                "id",
                "signal",
                "resource_type",
                "resource_id",
                "active",
                "matched_at",
                "created_at",
            ],
            Table::Switch => &[
                "id",
                "workflow_id",
                "node_id",
                "policy",
                "successes",
                "active",
                "fired_at",
                "created_at",
            ],
        }
    }

    pub(crate) fn has_column(&self, column: &str) -> bool {
        self.columns().contains(&column)
    }
}

/// A typed filter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// SQL NULL / JSON null.
    Null,
    /// Boolean column.
    Bool(bool),
    /// Integer column.
    Int(i64),
    /// Text column.
    Text(String),
    /// UUID column.
    Uuid(Uuid),
    /// Timestamp column.
    Time(DateTime<Utc>),
    /// Text set, only valid with [`Cmp::In`].
    TextList(Vec<String>),
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int(v as i64)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<Uuid> for Param {
    fn from(v: Uuid) -> Self {
        Param::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Param {
    fn from(v: DateTime<Utc>) -> Self {
        Param::Time(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Param::Null)
    }
}

/// Comparison operator of a [`Condition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmp {
    /// `=` (or `IS NULL` against [`Param::Null`]).
    Eq,
    /// `<>` (or `IS NOT NULL` against [`Param::Null`]).
    Ne,
    /// `<`
    Lt,
    /// `>`
    Gt,
    /// `= ANY(...)` against a [`Param::TextList`].
    In,
}

/// One `column <cmp> value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// Column name.
    pub column: &'static str,
    /// Operator.
    pub cmp: Cmp,
    /// Right-hand side.
    pub value: Param,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// Conjunction of conditions with optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// All must hold.
    pub conditions: Vec<Condition>,
    /// Sort keys, applied in order.
    pub order_by: Vec<(&'static str, Order)>,
    /// Maximum rows returned.
    pub limit: Option<i64>,
}

impl Filter {
    /// Empty filter (matches every row).
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter on the primary key.
    pub fn by_id(id: Uuid) -> Self {
        Self::new().eq("id", id)
    }

    fn push(mut self, column: &'static str, cmp: Cmp, value: Param) -> Self {
        self.conditions.push(Condition { column, cmp, value });
        self
    }

    /// `column = value`
    pub fn eq(self, column: &'static str, value: impl Into<Param>) -> Self {
        self.push(column, Cmp::Eq, value.into())
    }

    /// `column <> value`
    pub fn ne(self, column: &'static str, value: impl Into<Param>) -> Self {
        self.push(column, Cmp::Ne, value.into())
    }

    /// `column < value`
    pub fn lt(self, column: &'static str, value: impl Into<Param>) -> Self {
        self.push(column, Cmp::Lt, value.into())
    }

    /// `column > value`
    pub fn gt(self, column: &'static str, value: impl Into<Param>) -> Self {
        self.push(column, Cmp::Gt, value.into())
    }

    /// `column IN (values)`
    pub fn is_in<I, S>(self, column: &'static str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.push(column, Cmp::In, Param::TextList(values))
    }

    /// Append an ascending sort key.
    pub fn order_asc(mut self, column: &'static str) -> Self {
        self.order_by.push((column, Order::Asc));
        self
    }

    /// Append a descending sort key.
    pub fn order_desc(mut self, column: &'static str) -> Self {
        self.order_by.push((column, Order::Desc));
        self
    }

    /// Cap the number of rows.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Reject columns the table does not have before touching the backend.
    pub(crate) fn validate(&self, table: Table) -> Result<()> {
        let unknown = self
            .conditions
            .iter()
            .map(|c| c.column)
            .chain(self.order_by.iter().map(|(c, _)| *c))
            .find(|c| !table.has_column(c));
        match unknown {
            Some(column) => Err(crate::error::EngineError::Validation {
                field: column.to_string(),
                message: format!("unknown column for table '{}'", table.name()),
            }),
            None => Ok(()),
        }
    }
}

/// Row-locking behavior of [`Transaction::lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Block until the rows are free.
    Wait,
    /// Fail with a lock conflict if any matching row is held.
    NoWait,
    /// Silently leave out rows held by others.
    SkipLocked,
}

/// A unit of work against the store.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Fetch one row by primary key.
    async fn get(&mut self, table: Table, id: Uuid) -> Result<Option<Value>>;

    /// Fetch rows matching a filter.
    async fn find(&mut self, table: Table, filter: &Filter) -> Result<Vec<Value>>;

    /// Fetch and lock rows matching a filter until the transaction ends.
    async fn lock(&mut self, table: Table, filter: &Filter, mode: LockMode) -> Result<Vec<Value>>;

    /// Insert or update a row keyed by its `id`.
    async fn save(&mut self, table: Table, row: Value) -> Result<()>;

    /// Delete rows matching a filter, returning how many were removed.
    async fn delete(&mut self, table: Table, filter: &Filter) -> Result<u64>;

    /// Make every change visible to other transactions.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every change.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A backend capable of opening transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Open a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}
