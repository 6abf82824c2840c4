//! SQLite 存储：快照、HITL 记录与 Trace 事件落盘，进程重启后可恢复
//!
//! 单连接放在 Mutex 中，异步接口通过 spawn_blocking 访问；TraceSink 只把事件送入队列，
//! 由专用写入线程按顺序落盘，发射方从不等待连接锁。

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use super::{HitlStore, SnapshotStore, StoreError, SubmitOutcome, TraceSink};
use crate::observability::TraceEvent;
use crate::workflow::{HitlRecord, HitlResponse, HitlStatus};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workflow_snapshots (
    session_id TEXT PRIMARY KEY,
    blob TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS hitl_records (
    session_id TEXT NOT NULL,
    request_id TEXT NOT NULL,
    status TEXT NOT NULL,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (session_id, request_id)
);
CREATE TABLE IF NOT EXISTS trace_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    event TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_trace_events_run ON trace_events(run_id);
";

enum SinkMessage {
    Event {
        run_id: String,
        event_type: &'static str,
        timestamp: String,
        raw: String,
    },
    Flush(oneshot::Sender<()>),
}

/// 写入线程：发送端全部释放后排空队列并退出
fn write_events(conn: Arc<Mutex<Connection>>, mut rx: mpsc::UnboundedReceiver<SinkMessage>) {
    while let Some(message) = rx.blocking_recv() {
        match message {
            SinkMessage::Event {
                run_id,
                event_type,
                timestamp,
                raw,
            } => {
                let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = conn.execute(
                    "INSERT INTO trace_events (run_id, event_type, timestamp, event) VALUES (?1, ?2, ?3, ?4)",
                    params![run_id, event_type, timestamp, raw],
                ) {
                    tracing::warn!(error = %e, run_id = %run_id, "trace event not persisted");
                }
            }
            SinkMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    events: mpsc::UnboundedSender<SinkMessage>,
    ttl_secs: i64,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>, ttl_secs: u64) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn, ttl_secs)
    }

    pub fn open_in_memory(ttl_secs: u64) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, ttl_secs)
    }

    fn from_connection(conn: Connection, ttl_secs: u64) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        let conn = Arc::new(Mutex::new(conn));
        let (events, rx) = mpsc::unbounded_channel();
        let writer = Arc::clone(&conn);
        std::thread::Builder::new()
            .name("trace-sink".to_string())
            .spawn(move || write_events(writer, rx))
            .map_err(|e| StoreError::Join(e.to_string()))?;
        Ok(Self {
            conn,
            events,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        })
    }

    /// 等待此前提交的 trace 事件全部落盘
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.events.send(SinkMessage::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    fn expires_at(&self) -> i64 {
        Utc::now().timestamp().saturating_add(self.ttl_secs)
    }

    /// 某次运行已落盘的事件（按写入顺序）
    pub async fn events_for_run(&self, run_id: &str) -> Result<Vec<TraceEvent>, StoreError> {
        self.flush().await;
        let run_id = run_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT event FROM trace_events WHERE run_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
            let mut events = Vec::new();
            for raw in rows {
                events.push(serde_json::from_str(&raw?)?);
            }
            Ok(events)
        })
        .await
    }

    /// 删除已过期的快照与 HITL 记录，返回删除行数
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let now = Utc::now().timestamp();
            let snapshots =
                conn.execute("DELETE FROM workflow_snapshots WHERE expires_at <= ?1", params![now])?;
            let records =
                conn.execute("DELETE FROM hitl_records WHERE expires_at <= ?1", params![now])?;
            Ok(snapshots + records)
        })
        .await
    }
}

fn status_str(status: HitlStatus) -> &'static str {
    match status {
        HitlStatus::Pending => "pending",
        HitlStatus::Responded => "responded",
        HitlStatus::TimedOut => "timed_out",
    }
}

fn load_record(
    conn: &Connection,
    session_id: &str,
    request_id: &str,
) -> Result<Option<HitlRecord>, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT record FROM hitl_records
             WHERE session_id = ?1 AND request_id = ?2 AND expires_at > ?3",
            params![session_id, request_id, Utc::now().timestamp()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match raw {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    })
}

fn store_record(conn: &Connection, record: &HitlRecord) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE hitl_records SET status = ?1, record = ?2 WHERE session_id = ?3 AND request_id = ?4",
        params![
            status_str(record.status),
            serde_json::to_string(record)?,
            record.session_id,
            record.request.id,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl SnapshotStore for SqliteStore {
    async fn save(&self, session_id: &str, blob: String) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        let expires_at = self.expires_at();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO workflow_snapshots (session_id, blob, updated_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                    blob = excluded.blob,
                    updated_at = excluded.updated_at,
                    expires_at = excluded.expires_at",
                params![session_id, blob, Utc::now().to_rfc3339(), expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn load(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let blob = conn
                .query_row(
                    "SELECT blob FROM workflow_snapshots WHERE session_id = ?1 AND expires_at > ?2",
                    params![session_id, Utc::now().timestamp()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(blob)
        })
        .await
    }

    async fn delete(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM workflow_snapshots WHERE session_id = ?1",
                params![session_id],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl HitlStore for SqliteStore {
    async fn create(&self, record: HitlRecord) -> Result<(), StoreError> {
        let expires_at = self.expires_at();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO hitl_records
                    (session_id, request_id, status, record, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.session_id,
                    record.request.id,
                    status_str(record.status),
                    serde_json::to_string(&record)?,
                    record.request.created_at.to_rfc3339(),
                    expires_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<HitlRecord>, StoreError> {
        let (session_id, request_id) = (session_id.to_string(), request_id.to_string());
        self.with_conn(move |conn| load_record(conn, &session_id, &request_id))
            .await
    }

    async fn pending(&self, session_id: &str) -> Result<Vec<HitlRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT record FROM hitl_records
                 WHERE session_id = ?1 AND status = 'pending' AND expires_at > ?2
                 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![session_id, Utc::now().timestamp()], |row| {
                row.get::<_, String>(0)
            })?;
            let mut records = Vec::new();
            for raw in rows {
                records.push(serde_json::from_str(&raw?)?);
            }
            Ok(records)
        })
        .await
    }

    async fn submit_response(
        &self,
        session_id: &str,
        response: HitlResponse,
    ) -> Result<SubmitOutcome, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut record) = load_record(&tx, &session_id, &response.request_id)? else {
                return Ok(SubmitOutcome::NotFound);
            };
            if record.status != HitlStatus::Pending {
                return Ok(SubmitOutcome::AlreadyFinal(record));
            }
            record.status = HitlStatus::Responded;
            record.response = Some(response);
            record.updated_at = Utc::now();
            store_record(&tx, &record)?;
            tx.commit()?;
            Ok(SubmitOutcome::Applied(record))
        })
        .await
    }

    async fn mark_timed_out(&self, session_id: &str, request_id: &str) -> Result<bool, StoreError> {
        let (session_id, request_id) = (session_id.to_string(), request_id.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let Some(mut record) = load_record(&tx, &session_id, &request_id)? else {
                return Ok(false);
            };
            if record.status != HitlStatus::Pending {
                return Ok(false);
            }
            record.status = HitlStatus::TimedOut;
            record.updated_at = Utc::now();
            store_record(&tx, &record)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }
}

impl TraceSink for SqliteStore {
    fn record(&self, event: &TraceEvent) {
        let raw = match serde_json::to_string(event) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "trace event serialization failed");
                return;
            }
        };
        let message = SinkMessage::Event {
            run_id: event.run_id.clone(),
            event_type: event.event_type.as_str(),
            timestamp: event.timestamp.to_rfc3339(),
            raw,
        };
        if self.events.send(message).is_err() {
            tracing::warn!(run_id = %event.run_id, "trace writer stopped, event dropped");
        }
    }
}
