use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    ActiveSaga, CorrelationId, OutboxMessage, Result, SagaInstance, SagaStoreError, Version,
    store::{SagaStore, validate_for_save, validate_state_name},
};

/// PostgreSQL-backed saga store implementation.
///
/// The version column doubles as the optimistic concurrency token: updates
/// are conditional on it, and outbox rows are inserted in the same
/// transaction.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    /// Creates a new PostgreSQL saga store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_instance(row: PgRow) -> Result<SagaInstance> {
        Ok(SagaInstance {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            current_state: row.try_get("current_state")?,
            previous_state: row.try_get("previous_state")?,
            version: Version::new(row.try_get("version")?),
            payload: row.try_get("payload")?,
        })
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: row.try_get("id")?,
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            destination: row.try_get("destination")?,
            message_type: row.try_get("message_type")?,
            body: row.try_get("body")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn load(&self, correlation_id: CorrelationId) -> Result<SagaInstance> {
        let row = sqlx::query(
            r#"
            SELECT correlation_id, current_state, previous_state, version, payload
            FROM saga_instances
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::row_to_instance(row),
            None => Err(SagaStoreError::NotFound(correlation_id)),
        }
    }

    async fn create_if_absent(
        &self,
        correlation_id: CorrelationId,
        initial_state: &str,
    ) -> Result<SagaInstance> {
        validate_state_name(initial_state)?;

        // Concurrent creators race on the primary key; losers insert nothing
        sqlx::query(
            r#"
            INSERT INTO saga_instances (correlation_id, current_state, previous_state, version)
            VALUES ($1, $2, '', 0)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(correlation_id.as_uuid())
        .bind(initial_state)
        .execute(&self.pool)
        .await?;

        self.load(correlation_id).await
    }

    async fn save_with_outbox(
        &self,
        instance: &SagaInstance,
        expected: Version,
        outbox: Vec<OutboxMessage>,
    ) -> Result<Version> {
        validate_for_save(instance, expected)?;

        let correlation_id = instance.correlation_id;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE saga_instances
            SET current_state = $2, previous_state = $3, version = $4, payload = $5, updated_at = NOW()
            WHERE correlation_id = $1 AND version = $6
            "#,
        )
        .bind(correlation_id.as_uuid())
        .bind(&instance.current_state)
        .bind(&instance.previous_state)
        .bind(instance.version.as_i64())
        .bind(&instance.payload)
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Either another writer won or the row never existed
            let actual = sqlx::query_scalar::<_, i64>(
                "SELECT version FROM saga_instances WHERE correlation_id = $1",
            )
            .bind(correlation_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;

            return match actual {
                Some(actual) => Err(SagaStoreError::ConcurrencyConflict {
                    correlation_id,
                    expected,
                    actual: Version::new(actual),
                }),
                None => Err(SagaStoreError::NotFound(correlation_id)),
            };
        }

        for message in &outbox {
            sqlx::query(
                r#"
                INSERT INTO saga_outbox (id, correlation_id, destination, message_type, body, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(message.id)
            .bind(message.correlation_id.as_uuid())
            .bind(&message.destination)
            .bind(&message.message_type)
            .bind(&message.body)
            .bind(message.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(instance.version)
    }

    async fn pending_outbox(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OutboxMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            r#"
            SELECT id, correlation_id, destination, message_type, body, created_at, dispatched_at
            FROM saga_outbox
            WHERE dispatched_at IS NULL AND created_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(created_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }

    async fn mark_dispatched(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE saga_outbox SET dispatched_at = NOW() WHERE id = $1 AND dispatched_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_active(&self, states: &[String]) -> Result<Vec<ActiveSaga>> {
        let rows = sqlx::query(
            r#"
            SELECT correlation_id, current_state, previous_state, version, payload, updated_at
            FROM saga_instances
            WHERE current_state = ANY($1)
            ORDER BY updated_at ASC
            "#,
        )
        .bind(states)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let updated_at = row.try_get("updated_at")?;
                Ok(ActiveSaga {
                    instance: Self::row_to_instance(row)?,
                    updated_at,
                })
            })
            .collect()
    }
}
