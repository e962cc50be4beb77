// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence for lanewise-core.
//!
//! Rows are mapped generically: reads project each row with `to_jsonb(t)`,
//! writes go through `jsonb_populate_record` so the JSON produced by the
//! record types lands in properly typed columns. Lock modes map directly onto
//! `FOR UPDATE`, `FOR UPDATE NOWAIT` and `FOR UPDATE SKIP LOCKED`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use super::{Cmp, Filter, LockMode, Order, Param, Store, Table, Transaction};
use crate::error::Result;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn push_param(builder: &mut QueryBuilder<'static, Postgres>, param: &Param) {
    match param {
        Param::Null => {
            builder.push("NULL");
        }
        Param::Bool(v) => {
            builder.push_bind(*v);
        }
        Param::Int(v) => {
            builder.push_bind(*v);
        }
        Param::Text(v) => {
            builder.push_bind(v.clone());
        }
        Param::Uuid(v) => {
            builder.push_bind(*v);
        }
        Param::Time(v) => {
            builder.push_bind(*v);
        }
        Param::TextList(v) => {
            builder.push_bind(v.clone());
        }
    }
}

/// Append `WHERE`, `ORDER BY` and `LIMIT` for `filter` against alias `t`.
fn push_filter(builder: &mut QueryBuilder<'static, Postgres>, filter: &Filter) {
    for (i, condition) in filter.conditions.iter().enumerate() {
        builder.push(if i == 0 { " WHERE " } else { " AND " });
        builder.push(format!("t.{}", quote(condition.column)));

        match (&condition.cmp, &condition.value) {
            (Cmp::Eq, Param::Null) => {
                builder.push(" IS NULL");
            }
            (Cmp::Ne, Param::Null) => {
                builder.push(" IS NOT NULL");
            }
            (Cmp::In, Param::TextList(_)) => {
                builder.push(" = ANY(");
                push_param(builder, &condition.value);
                builder.push(")");
            }
            (Cmp::In, _) | (_, Param::Null) => {
                builder.push(" IS NULL AND FALSE");
            }
            (cmp, value) => {
                builder.push(match cmp {
                    Cmp::Eq => " = ",
                    Cmp::Ne => " <> ",
                    Cmp::Lt => " < ",
                    Cmp::Gt => " > ",
                    Cmp::In => unreachable!("handled above"),
                });
                push_param(builder, value);
            }
        }
    }

    for (i, (column, order)) in filter.order_by.iter().enumerate() {
        builder.push(if i == 0 { " ORDER BY " } else { ", " });
        builder.push(format!("t.{}", quote(column)));
        builder.push(match order {
            Order::Asc => " ASC",
            Order::Desc => " DESC",
        });
    }

    if let Some(limit) = filter.limit {
        builder.push(" LIMIT ");
        builder.push_bind(limit);
    }
}

fn select_query(
    table: Table,
    filter: &Filter,
    lock: Option<LockMode>,
) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT to_jsonb(t) AS row FROM {} t",
        quote(table.name())
    ));
    push_filter(&mut builder, filter);
    if let Some(mode) = lock {
        builder.push(match mode {
            LockMode::Wait => " FOR UPDATE OF t",
            LockMode::NoWait => " FOR UPDATE OF t NOWAIT",
            LockMode::SkipLocked => " FOR UPDATE OF t SKIP LOCKED",
        });
    }
    builder
}

fn upsert_query(table: Table, row: Value) -> QueryBuilder<'static, Postgres> {
    let name = quote(table.name());
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {name} SELECT * FROM jsonb_populate_record(NULL::{name}, "
    ));
    builder.push_bind(row);
    builder.push(") ON CONFLICT (id) DO UPDATE SET ");

    let assignments: Vec<String> = table
        .columns()
        .iter()
        .skip(1)
        .map(|c| format!("{0} = EXCLUDED.{0}", quote(c)))
        .collect();
    builder.push(assignments.join(", "));
    builder
}

fn delete_query(table: Table, filter: &Filter) -> QueryBuilder<'static, Postgres> {
    // Ordering and limits are meaningless for DELETE; only conditions apply.
    let conditions = Filter {
        conditions: filter.conditions.clone(),
        ..Filter::default()
    };
    let mut builder = QueryBuilder::new(format!("DELETE FROM {} t", quote(table.name())));
    push_filter(&mut builder, &conditions);
    builder
}

impl PostgresTransaction {
    async fn fetch(&mut self, mut query: QueryBuilder<'static, Postgres>) -> Result<Vec<Value>> {
        let rows = query.build().fetch_all(&mut *self.tx).await?;
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(row.try_get::<Value, _>("row")?);
        }
        Ok(values)
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn get(&mut self, table: Table, id: Uuid) -> Result<Option<Value>> {
        let rows = self.fetch(select_query(table, &Filter::by_id(id), None)).await?;
        Ok(rows.into_iter().next())
    }

    async fn find(&mut self, table: Table, filter: &Filter) -> Result<Vec<Value>> {
        filter.validate(table)?;
        self.fetch(select_query(table, filter, None)).await
    }

    async fn lock(&mut self, table: Table, filter: &Filter, mode: LockMode) -> Result<Vec<Value>> {
        filter.validate(table)?;
        self.fetch(select_query(table, filter, Some(mode))).await
    }

    async fn save(&mut self, table: Table, row: Value) -> Result<()> {
        upsert_query(table, row).build().execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn delete(&mut self, table: Table, filter: &Filter) -> Result<u64> {
        filter.validate(table)?;
        let result = delete_query(table, filter)
            .build()
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
