/// SQLite-backed persistent store for definitions, instances and gate rows
///
/// Every write is scoped to one row keyed by `instance_id` or `(scope, entity_id)`.
/// Status writes are compare-and-set on the previous status so a terminal row
/// can never be re-opened.
use crate::errors::{WorkflowError, WorkflowResult};
use crate::state_machine::LifecycleStatus;
use crate::types::{
    Definition, GateAction, GateHistoryEntry, GateRow, Instance, InstanceFilter, PayloadSchema,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const TERMINAL_STATUSES: &str = "('completed', 'cancelled', 'failed')";

/// SQLite task-package store
pub struct SqliteTaskStore {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl SqliteTaskStore {
    /// Open (or create) a store backed by a database file
    pub async fn new<P: AsRef<Path>>(db_path: P, max_connections: u32) -> WorkflowResult<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    WorkflowError::ProviderUnavailable(format!("Failed to create directory: {}", e))
                })?;
            }
        }

        let connect_options = SqliteConnectOptions::from_str(db_path.to_string_lossy().as_ref())?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await?;

        let store = SqliteTaskStore {
            pool,
            db_path: Some(db_path),
        };
        store.initialize().await?;
        Ok(store)
    }

    /// Open a private in-memory store (single connection, never recycled)
    pub async fn in_memory() -> WorkflowResult<Self> {
        let connect_options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await?;

        let store = SqliteTaskStore {
            pool,
            db_path: None,
        };
        store.initialize().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create tables and indexes
    async fn initialize(&self) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS definitions (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                form_path TEXT,
                payload_schema TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instances (
                id TEXT PRIMARY KEY NOT NULL,
                definition_id TEXT NOT NULL REFERENCES definitions(id),
                cached_display_name TEXT NOT NULL,
                principal TEXT NOT NULL,
                lifecycle_status TEXT NOT NULL,
                user_status TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_definition ON instances(definition_id);
            CREATE INDEX IF NOT EXISTS idx_instances_status ON instances(lifecycle_status);
            CREATE INDEX IF NOT EXISTS idx_instances_principal ON instances(principal);

            CREATE TABLE IF NOT EXISTS gate_rows (
                scope TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                reason TEXT,
                updated_by TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (scope, entity_id)
            );

            CREATE TABLE IF NOT EXISTS gate_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                entity_id TEXT,
                action TEXT NOT NULL,
                reason TEXT,
                updated_by TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_gate_history_scope ON gate_history(scope, entity_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------------

    /// Insert or refresh a definition; `created_at` survives updates
    pub async fn upsert_definition(
        &self,
        definition_id: &str,
        display_name: &str,
        form_path: Option<&str>,
        payload_schema: Option<&PayloadSchema>,
    ) -> WorkflowResult<Definition> {
        let now = Utc::now().to_rfc3339();
        let schema = payload_schema.map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO definitions (id, name, form_path, payload_schema, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                form_path = excluded.form_path,
                payload_schema = excluded.payload_schema,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(definition_id)
        .bind(display_name)
        .bind(form_path)
        .bind(&schema)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get_definition(definition_id)
            .await?
            .ok_or_else(|| WorkflowError::Internal(format!("definition {} vanished", definition_id)))
    }

    pub async fn get_definition(&self, definition_id: &str) -> WorkflowResult<Option<Definition>> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            "SELECT id, name, form_path, payload_schema, created_at, updated_at FROM definitions WHERE id = ?",
        )
        .bind(definition_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DefinitionRow::into_definition).transpose()
    }

    pub async fn list_definitions(&self) -> WorkflowResult<Vec<Definition>> {
        let rows = sqlx::query_as::<_, DefinitionRow>(
            "SELECT id, name, form_path, payload_schema, created_at, updated_at FROM definitions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DefinitionRow::into_definition).collect()
    }

    // ------------------------------------------------------------------------
    // Instances
    // ------------------------------------------------------------------------

    pub async fn insert_instance(&self, instance: &Instance) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO instances (id, definition_id, cached_display_name, principal,
                                   lifecycle_status, user_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.definition_id)
        .bind(&instance.cached_display_name)
        .bind(&instance.principal)
        .bind(instance.lifecycle_status.as_str())
        .bind(&instance.user_status)
        .bind(instance.created_at.to_rfc3339())
        .bind(instance.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> WorkflowResult<Option<Instance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, definition_id, cached_display_name, principal, lifecycle_status,
                   user_status, created_at, updated_at
            FROM instances WHERE id = ?
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(InstanceRow::into_instance).transpose()
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> WorkflowResult<Vec<Instance>> {
        let status = filter.lifecycle_status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT id, definition_id, cached_display_name, principal, lifecycle_status,
                   user_status, created_at, updated_at
            FROM instances
            WHERE (? IS NULL OR definition_id = ?)
              AND (? IS NULL OR principal = ?)
              AND (? IS NULL OR lifecycle_status = ?)
            ORDER BY created_at DESC
            "#,
        )
        .bind(&filter.definition_id)
        .bind(&filter.definition_id)
        .bind(&filter.principal)
        .bind(&filter.principal)
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    /// Compare-and-set the lifecycle status. Returns false when the row was
    /// not in `expected` (or does not exist).
    pub async fn compare_and_set_status(
        &self,
        instance_id: &str,
        expected: LifecycleStatus,
        next: LifecycleStatus,
    ) -> WorkflowResult<bool> {
        let sql = format!(
            "UPDATE instances SET lifecycle_status = ?, updated_at = ? \
             WHERE id = ? AND lifecycle_status = ? AND lifecycle_status NOT IN {}",
            TERMINAL_STATUSES
        );
        let result = sqlx::query(&sql)
            .bind(next.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(instance_id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

        debug!(
            "CAS {} {} -> {}: {} row(s)",
            instance_id,
            expected,
            next,
            result.rows_affected()
        );
        Ok(result.rows_affected() > 0)
    }

    /// Write `user_status` only; the lifecycle status is left untouched
    pub async fn set_user_status(&self, instance_id: &str, user_status: &str) -> WorkflowResult<bool> {
        let result =
            sqlx::query("UPDATE instances SET user_status = ?, updated_at = ? WHERE id = ?")
                .bind(user_status)
                .bind(Utc::now().to_rfc3339())
                .bind(instance_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------------
    // Gate rows
    // ------------------------------------------------------------------------

    pub async fn get_gate(&self, scope: &str, entity_id: &str) -> WorkflowResult<Option<GateRow>> {
        let row = sqlx::query_as::<_, GateRowRecord>(
            r#"
            SELECT scope, entity_id, enabled, reason, updated_by, created_at, updated_at
            FROM gate_rows WHERE scope = ? AND entity_id = ?
            "#,
        )
        .bind(scope)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(GateRowRecord::into_gate_row))
    }

    pub async fn list_gates(&self, scope: &str) -> WorkflowResult<Vec<GateRow>> {
        let rows = sqlx::query_as::<_, GateRowRecord>(
            r#"
            SELECT scope, entity_id, enabled, reason, updated_by, created_at, updated_at
            FROM gate_rows WHERE scope = ? ORDER BY entity_id
            "#,
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(GateRowRecord::into_gate_row).collect())
    }

    /// Create the row unless one exists. The unique constraint makes this
    /// safe under concurrent callers: exactly one of them sees `true`.
    pub async fn insert_gate_if_absent(
        &self,
        scope: &str,
        entity_id: &str,
        enabled: bool,
        reason: Option<&str>,
        updated_by: Option<&str>,
    ) -> WorkflowResult<(GateRow, bool)> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO gate_rows (scope, entity_id, enabled, reason, updated_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope, entity_id) DO NOTHING
            "#,
        )
        .bind(scope)
        .bind(entity_id)
        .bind(enabled)
        .bind(reason)
        .bind(updated_by)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() > 0;
        let row = self.get_gate(scope, entity_id).await?.ok_or_else(|| {
            WorkflowError::Internal(format!("gate row {}/{} vanished", scope, entity_id))
        })?;
        Ok((row, created))
    }

    /// Upsert a gate row and append the matching history entry atomically
    pub async fn set_gate(
        &self,
        scope: &str,
        entity_id: &str,
        enabled: bool,
        reason: Option<&str>,
        updated_by: Option<&str>,
    ) -> WorkflowResult<GateRow> {
        let now = Utc::now().to_rfc3339();
        let action = if enabled {
            GateAction::Enable
        } else {
            GateAction::Disable
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO gate_rows (scope, entity_id, enabled, reason, updated_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scope, entity_id) DO UPDATE SET
                enabled = excluded.enabled,
                reason = excluded.reason,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(scope)
        .bind(entity_id)
        .bind(enabled)
        .bind(reason)
        .bind(updated_by)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO gate_history (scope, entity_id, action, reason, updated_by, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(scope)
        .bind(entity_id)
        .bind(action.as_str())
        .bind(reason)
        .bind(updated_by)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_gate(scope, entity_id).await?.ok_or_else(|| {
            WorkflowError::Internal(format!("gate row {}/{} vanished", scope, entity_id))
        })
    }

    /// Delete every row of a scope, recording one `clear_scope` history entry
    pub async fn clear_scope(
        &self,
        scope: &str,
        reason: Option<&str>,
        updated_by: Option<&str>,
    ) -> WorkflowResult<u64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM gate_rows WHERE scope = ?")
            .bind(scope)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query(
            r#"
            INSERT INTO gate_history (scope, entity_id, action, reason, updated_by, created_at)
            VALUES (?, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(scope)
        .bind(GateAction::ClearScope.as_str())
        .bind(reason)
        .bind(updated_by)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(removed)
    }

    /// History entries of a scope (optionally one entity), oldest first
    pub async fn gate_history(
        &self,
        scope: &str,
        entity_id: Option<&str>,
    ) -> WorkflowResult<Vec<GateHistoryEntry>> {
        let rows = sqlx::query_as::<_, GateHistoryRecord>(
            r#"
            SELECT id, scope, entity_id, action, reason, updated_by, created_at
            FROM gate_history
            WHERE scope = ? AND (? IS NULL OR entity_id = ?)
            ORDER BY id
            "#,
        )
        .bind(scope)
        .bind(entity_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(GateHistoryRecord::into_entry).collect()
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Helper struct for SQLite row mapping
#[derive(FromRow)]
struct DefinitionRow {
    id: String,
    name: String,
    form_path: Option<String>,
    payload_schema: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DefinitionRow {
    fn into_definition(self) -> WorkflowResult<Definition> {
        let payload_schema = self
            .payload_schema
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Definition {
            definition_id: self.id,
            display_name: self.name,
            form_path: self.form_path,
            payload_schema,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[derive(FromRow)]
struct InstanceRow {
    id: String,
    definition_id: String,
    cached_display_name: String,
    principal: String,
    lifecycle_status: String,
    user_status: Option<String>,
    created_at: String,
    updated_at: String,
}

impl InstanceRow {
    fn into_instance(self) -> WorkflowResult<Instance> {
        Ok(Instance {
            lifecycle_status: self.lifecycle_status.parse()?,
            instance_id: self.id,
            definition_id: self.definition_id,
            cached_display_name: self.cached_display_name,
            principal: self.principal,
            user_status: self.user_status,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        })
    }
}

#[derive(FromRow)]
struct GateRowRecord {
    scope: String,
    entity_id: String,
    enabled: bool,
    reason: Option<String>,
    updated_by: Option<String>,
    created_at: String,
    updated_at: String,
}

impl GateRowRecord {
    fn into_gate_row(self) -> GateRow {
        GateRow {
            scope: self.scope,
            entity_id: self.entity_id,
            enabled: self.enabled,
            reason: self.reason,
            updated_by: self.updated_by,
            created_at: parse_timestamp(&self.created_at),
            updated_at: parse_timestamp(&self.updated_at),
        }
    }
}

#[derive(FromRow)]
struct GateHistoryRecord {
    id: i64,
    scope: String,
    entity_id: Option<String>,
    action: String,
    reason: Option<String>,
    updated_by: Option<String>,
    created_at: String,
}

impl GateHistoryRecord {
    fn into_entry(self) -> WorkflowResult<GateHistoryEntry> {
        let action = GateAction::parse(&self.action).ok_or_else(|| {
            WorkflowError::Internal(format!("unknown gate action in history: {}", self.action))
        })?;
        Ok(GateHistoryEntry {
            id: self.id,
            scope: self.scope,
            entity_id: self.entity_id,
            action,
            reason: self.reason,
            updated_by: self.updated_by,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use uuid::Uuid;

    async fn store_with_definition() -> SqliteTaskStore {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        store
            .upsert_definition("tp01", "Room cleaning", Some("/forms/tp01"), None)
            .await
            .unwrap();
        store
    }

    fn new_instance(definition_id: &str, principal: &str) -> Instance {
        let now = Utc::now();
        Instance {
            instance_id: Uuid::new_v4().to_string(),
            definition_id: definition_id.to_string(),
            cached_display_name: "Room cleaning".to_string(),
            principal: principal.to_string(),
            lifecycle_status: LifecycleStatus::Created,
            user_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_definition_upsert_keeps_created_at() {
        let store = store_with_definition().await;
        let first = store.get_definition("tp01").await.unwrap().unwrap();

        let updated = store
            .upsert_definition("tp01", "Room cleaning v2", None, None)
            .await
            .unwrap();

        assert_eq!(updated.display_name, "Room cleaning v2");
        assert_eq!(updated.created_at, first.created_at);
        assert_eq!(store.list_definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instance_insert_and_filter() {
        let store = store_with_definition().await;
        let a = new_instance("tp01", "alice");
        let b = new_instance("tp01", "bob");
        store.insert_instance(&a).await.unwrap();
        store.insert_instance(&b).await.unwrap();

        let loaded = store.get_instance(&a.instance_id).await.unwrap().unwrap();
        assert_eq!(loaded.principal, "alice");
        assert_eq!(loaded.lifecycle_status, LifecycleStatus::Created);

        let all = store.list_instances(&InstanceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let bobs = store
            .list_instances(&InstanceFilter {
                principal: Some("bob".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].instance_id, b.instance_id);
    }

    #[tokio::test]
    async fn test_instance_requires_known_definition() {
        let store = store_with_definition().await;
        let orphan = new_instance("unknown", "alice");
        assert!(store.insert_instance(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn test_compare_and_set_never_reopens_terminal() {
        let store = store_with_definition().await;
        let inst = new_instance("tp01", "alice");
        store.insert_instance(&inst).await.unwrap();

        assert!(store
            .compare_and_set_status(&inst.instance_id, LifecycleStatus::Created, LifecycleStatus::Completed)
            .await
            .unwrap());
        // Stale expectation
        assert!(!store
            .compare_and_set_status(&inst.instance_id, LifecycleStatus::Created, LifecycleStatus::Started)
            .await
            .unwrap());
        // Terminal rows reject even a matching expectation
        assert!(!store
            .compare_and_set_status(&inst.instance_id, LifecycleStatus::Completed, LifecycleStatus::Failed)
            .await
            .unwrap());

        let row = store.get_instance(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(row.lifecycle_status, LifecycleStatus::Completed);
    }

    #[tokio::test]
    async fn test_user_status_leaves_lifecycle() {
        let store = store_with_definition().await;
        let inst = new_instance("tp01", "alice");
        store.insert_instance(&inst).await.unwrap();

        assert!(store.set_user_status(&inst.instance_id, "Waiting for lift").await.unwrap());
        let row = store.get_instance(&inst.instance_id).await.unwrap().unwrap();
        assert_eq!(row.user_status.as_deref(), Some("Waiting for lift"));
        assert_eq!(row.lifecycle_status, LifecycleStatus::Created);
    }

    #[tokio::test]
    async fn test_gate_set_appends_history() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        assert!(store.get_gate("beds", "bed_1").await.unwrap().is_none());

        let row = store
            .set_gate("beds", "bed_1", false, Some("night"), Some("nurse"))
            .await
            .unwrap();
        assert!(!row.enabled);
        store.set_gate("beds", "bed_1", true, None, None).await.unwrap();

        let history = store.gate_history("beds", Some("bed_1")).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, GateAction::Disable);
        assert_eq!(history[0].reason.as_deref(), Some("night"));
        assert_eq!(history[1].action, GateAction::Enable);
    }

    #[tokio::test]
    async fn test_clear_scope() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        store.set_gate("beds", "bed_1", false, None, None).await.unwrap();
        store.set_gate("beds", "bed_2", false, None, None).await.unwrap();
        store.set_gate("rooms", "r1", false, None, None).await.unwrap();

        assert_eq!(store.clear_scope("beds", None, Some("admin")).await.unwrap(), 2);
        assert!(store.list_gates("beds").await.unwrap().is_empty());
        assert_eq!(store.list_gates("rooms").await.unwrap().len(), 1);

        let history = store.gate_history("beds", None).await.unwrap();
        assert_eq!(history.last().unwrap().action, GateAction::ClearScope);
        assert!(history.last().unwrap().entity_id.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_gate_creation_yields_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteTaskStore::new(dir.path().join("gates.db"), 8).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_gate_if_absent("beds", "bed_9", true, None, Some("auto"))
                    .await
                    .unwrap()
                    .1
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.list_gates("beds").await.unwrap().len(), 1);
    }
}
