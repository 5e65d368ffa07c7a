//! SQLite registry store
//!
//! Persists the two logical tables:
//!
//! ```text
//! services(service_uuid PK, system_name, name, instance_id, callback_uri,
//!          broker_uri, exchange, listen_queue, publish_queue,
//!          grpc_timeout_ms, missed_heartbeats, state, routing_keys)
//!          UNIQUE(name, instance_id)
//! route_interests(key, service_uuid, PK(key, service_uuid))
//! ```
//!
//! rusqlite is blocking, so every call runs on the blocking pool behind a
//! single connection mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{
    timeout_millis, HeartbeatUpdate, InterestChange, RegistryStore, StoreError, StoreResult,
};
use crate::broker::RoutingKey;
use crate::registry::{Route, Service, ServiceId, ServiceState};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    service_uuid      TEXT PRIMARY KEY,
    system_name       TEXT NOT NULL DEFAULT '',
    name              TEXT NOT NULL,
    instance_id       TEXT NOT NULL,
    callback_uri      TEXT NOT NULL,
    broker_uri        TEXT NOT NULL DEFAULT '',
    exchange          TEXT NOT NULL DEFAULT '',
    listen_queue      TEXT NOT NULL DEFAULT '',
    publish_queue     TEXT NOT NULL DEFAULT '',
    grpc_timeout_ms   INTEGER NOT NULL,
    missed_heartbeats INTEGER NOT NULL DEFAULT 0,
    state             TEXT NOT NULL,
    routing_keys      TEXT NOT NULL DEFAULT '[]'
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_services_name_instance
    ON services(name, instance_id);

CREATE TABLE IF NOT EXISTS route_interests (
    key          TEXT NOT NULL,
    service_uuid TEXT NOT NULL,
    PRIMARY KEY (key, service_uuid)
);

CREATE INDEX IF NOT EXISTS idx_route_interests_service
    ON route_interests(service_uuid);
"#;

const SERVICE_COLUMNS: &str = "s.service_uuid, s.system_name, s.name, s.instance_id, \
     s.callback_uri, s.broker_uri, s.exchange, s.listen_queue, s.publish_queue, \
     s.grpc_timeout_ms, s.missed_heartbeats, s.state, s.routing_keys";

/// Durable store backed by a SQLite database file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Unavailable(format!("failed to open {}: {e}", path.display()))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(map_err)?;

        tracing::info!(path = %path.display(), "Registry database opened");
        Self::initialize(conn)
    }

    /// Create a private in-memory database
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(map_err)?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA).map_err(map_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard).map_err(map_err)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }
}

fn map_err(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict(err.to_string())
        }
        _ => StoreError::Unavailable(err.to_string()),
    }
}

fn conversion_err(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn service_from_row(row: &Row<'_>) -> rusqlite::Result<Service> {
    let id: String = row.get(0)?;
    let id: ServiceId = id.parse().map_err(|e| conversion_err(0, e))?;

    let timeout_ms: i64 = row.get(9)?;
    let missed: i64 = row.get(10)?;

    let state: String = row.get(11)?;
    let state: ServiceState = state.parse().map_err(|e| conversion_err(11, e))?;

    let keys: String = row.get(12)?;
    let routing_keys: Vec<RoutingKey> =
        serde_json::from_str(&keys).map_err(|e| conversion_err(12, e))?;

    Ok(Service {
        id,
        system_name: row.get(1)?,
        name: row.get(2)?,
        instance_id: row.get(3)?,
        callback_uri: row.get(4)?,
        broker_uri: row.get(5)?,
        exchange: row.get(6)?,
        listen_queue: row.get(7)?,
        publish_queue: row.get(8)?,
        grpc_timeout: Duration::from_millis(
            u64::try_from(timeout_ms).map_err(|e| conversion_err(9, e))?,
        ),
        routing_keys,
        missed_heartbeats: missed.clamp(0, u32::MAX as i64) as u32,
        state,
    })
}

fn count_interests(conn: &Connection, key: &str) -> rusqlite::Result<usize> {
    conn.query_row(
        "SELECT COUNT(*) FROM route_interests WHERE key = ?1",
        params![key],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as usize)
}

#[async_trait]
impl RegistryStore for SqliteStore {
    async fn get_service(&self, id: ServiceId) -> StoreResult<Option<Service>> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {SERVICE_COLUMNS} FROM services s WHERE s.service_uuid = ?1"),
                params![id.to_string()],
                service_from_row,
            )
            .optional()
        })
        .await
    }

    async fn find_service(&self, name: &str, instance_id: &str) -> StoreResult<Option<Service>> {
        let name = name.to_string();
        let instance_id = instance_id.to_string();

        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {SERVICE_COLUMNS} FROM services s \
                     WHERE s.name = ?1 AND s.instance_id = ?2"
                ),
                params![name, instance_id],
                service_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list_services(&self) -> StoreResult<Vec<Service>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVICE_COLUMNS} FROM services s ORDER BY s.name, s.instance_id"
            ))?;
            let rows = stmt.query_map([], service_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn upsert_service(&self, service: &Service) -> StoreResult<()> {
        let service = service.clone();
        let timeout_ms = timeout_millis(&service)?;
        let keys = serde_json::to_string(&service.routing_keys)
            .map_err(|e| StoreError::Unavailable(format!("failed to encode keys: {e}")))?;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO services (service_uuid, system_name, name, instance_id, \
                    callback_uri, broker_uri, exchange, listen_queue, publish_queue, \
                    grpc_timeout_ms, missed_heartbeats, state, routing_keys) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(service_uuid) DO UPDATE SET \
                    system_name = excluded.system_name, \
                    name = excluded.name, \
                    instance_id = excluded.instance_id, \
                    callback_uri = excluded.callback_uri, \
                    broker_uri = excluded.broker_uri, \
                    exchange = excluded.exchange, \
                    listen_queue = excluded.listen_queue, \
                    publish_queue = excluded.publish_queue, \
                    grpc_timeout_ms = excluded.grpc_timeout_ms, \
                    missed_heartbeats = excluded.missed_heartbeats, \
                    state = excluded.state, \
                    routing_keys = excluded.routing_keys",
                params![
                    service.id.to_string(),
                    service.system_name,
                    service.name,
                    service.instance_id,
                    service.callback_uri,
                    service.broker_uri,
                    service.exchange,
                    service.listen_queue,
                    service.publish_queue,
                    timeout_ms,
                    service.missed_heartbeats as i64,
                    service.state.as_str(),
                    keys,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete_service(&self, id: ServiceId) -> StoreResult<Option<Service>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let id = id.to_string();

            let existing = tx
                .query_row(
                    &format!("SELECT {SERVICE_COLUMNS} FROM services s WHERE s.service_uuid = ?1"),
                    params![id],
                    service_from_row,
                )
                .optional()?;

            if existing.is_some() {
                tx.execute(
                    "DELETE FROM route_interests WHERE service_uuid = ?1",
                    params![id],
                )?;
                tx.execute("DELETE FROM services WHERE service_uuid = ?1", params![id])?;
            }

            tx.commit()?;
            Ok(existing)
        })
        .await
    }

    async fn update_heartbeats(
        &self,
        id: ServiceId,
        update: HeartbeatUpdate,
    ) -> StoreResult<Option<u32>> {
        let sql = match update {
            HeartbeatUpdate::Reset => {
                "UPDATE services SET missed_heartbeats = 0 \
                 WHERE service_uuid = ?1 RETURNING missed_heartbeats"
            }
            HeartbeatUpdate::Increment => {
                "UPDATE services SET missed_heartbeats = missed_heartbeats + 1 \
                 WHERE service_uuid = ?1 RETURNING missed_heartbeats"
            }
        };

        self.with_conn(move |conn| {
            conn.query_row(sql, params![id.to_string()], |row| row.get::<_, i64>(0))
                .optional()
                .map(|n| n.map(|n| n.clamp(0, u32::MAX as i64) as u32))
        })
        .await
    }

    async fn add_interest(&self, key: &RoutingKey, id: ServiceId) -> StoreResult<InterestChange> {
        let key = key.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO route_interests (key, service_uuid) VALUES (?1, ?2)",
                params![key, id.to_string()],
            )?;
            let remaining = count_interests(&tx, &key)?;
            tx.commit()?;

            Ok(InterestChange {
                changed: inserted == 1,
                remaining,
            })
        })
        .await
    }

    async fn remove_interest(
        &self,
        key: &RoutingKey,
        id: ServiceId,
    ) -> StoreResult<InterestChange> {
        let key = key.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let deleted = tx.execute(
                "DELETE FROM route_interests WHERE key = ?1 AND service_uuid = ?2",
                params![key, id.to_string()],
            )?;
            let remaining = count_interests(&tx, &key)?;
            tx.commit()?;

            Ok(InterestChange {
                changed: deleted == 1,
                remaining,
            })
        })
        .await
    }

    async fn list_subscribers(&self, key: &RoutingKey) -> StoreResult<Vec<Service>> {
        let key = key.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SERVICE_COLUMNS} FROM services s \
                 JOIN route_interests r ON r.service_uuid = s.service_uuid \
                 WHERE r.key = ?1 ORDER BY s.service_uuid"
            ))?;
            let rows = stmt.query_map(params![key], service_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn list_routes(&self) -> StoreResult<Vec<Route>> {
        let rows: Vec<(String, String)> = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key, service_uuid FROM route_interests ORDER BY key, service_uuid",
                )?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect()
            })
            .await?;

        let mut routes: Vec<Route> = Vec::new();
        for (key, id) in rows {
            let key = RoutingKey::parse(key)
                .map_err(|e| StoreError::Unavailable(format!("corrupt route row: {e}")))?;
            let id: ServiceId = id
                .parse()
                .map_err(|e| StoreError::Unavailable(format!("corrupt route row: {e}")))?;

            match routes.last_mut() {
                Some(route) if route.key == key => route.service_ids.push(id),
                _ => routes.push(Route {
                    key,
                    service_ids: vec![id],
                }),
            }
        }

        Ok(routes)
    }

    async fn keys_of(&self, id: ServiceId) -> StoreResult<Vec<RoutingKey>> {
        let keys: Vec<String> = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT key FROM route_interests WHERE service_uuid = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![id.to_string()], |row| row.get(0))?;
                rows.collect()
            })
            .await?;

        keys.into_iter()
            .map(|k| {
                RoutingKey::parse(k)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt route row: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;

    #[tokio::test]
    async fn test_service_rows() {
        conformance::service_rows(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_heartbeats() {
        conformance::heartbeats(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_interests() {
        conformance::interests(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_timeouts() {
        conformance::timeouts(&SqliteStore::in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = std::env::temp_dir().join(format!("msg-client-{}", ServiceId::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("registry.db");

        let svc = conformance::service("node", "i1");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_service(&svc).await.unwrap();
            store
                .add_interest(&RoutingKey::parse("event.a").unwrap(), svc.id)
                .await
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_service(svc.id).await.unwrap(), Some(svc.clone()));
        assert_eq!(store.list_routes().await.unwrap().len(), 1);

        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
