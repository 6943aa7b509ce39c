//! SQLite 版用户存储
//!
//! r2d2 连接池 + WAL；所有数据库操作放进 `spawn_blocking`，不阻塞运行时。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::store::{PreferenceUpdate, UserStore};
use crate::error::{RelayError, RelayResult};
use crate::models::{RequesterId, UsageDelta, UserPreferences};

pub type UserStorePool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    custom_model TEXT,
    temperature REAL,
    show_thinking INTEGER NOT NULL DEFAULT 0,
    max_execution_seconds INTEGER NOT NULL DEFAULT 0,
    timeout_until TEXT,
    locale TEXT,
    characters INTEGER NOT NULL DEFAULT 0,
    requests INTEGER NOT NULL DEFAULT 0
)";

pub struct SqliteUserStore {
    pool: Arc<UserStorePool>,
    db_path: PathBuf,
}

impl SqliteUserStore {
    pub fn open(db_path: &Path) -> RelayResult<Self> {
        info!("[UserStore] opening SQLite store at {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::Store(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 3000i64)?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute(SCHEMA, [])?;

        Ok(Self {
            pool: Arc::new(pool),
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    async fn with_conn<T, F>(&self, op: F) -> RelayResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> RelayResult<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            op(&conn)
        })
        .await
        .map_err(|e| RelayError::Store(format!("blocking task failed: {}", e)))?
    }
}

fn load_preferences(conn: &Connection, requester: RequesterId) -> RelayResult<UserPreferences> {
    let prefs = conn
        .query_row(
            "SELECT custom_model, temperature, show_thinking, max_execution_seconds, timeout_until, locale
             FROM users WHERE user_id = ?1",
            params![requester],
            |row| {
                Ok(UserPreferences {
                    custom_model: row.get(0)?,
                    temperature: row.get::<_, Option<f64>>(1)?.map(|t| t as f32),
                    show_thinking: row.get::<_, i64>(2)? != 0,
                    max_execution_seconds: row.get::<_, i64>(3)?.max(0) as u64,
                    timeout_until: row.get(4)?,
                    locale: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(prefs.unwrap_or_default())
}

fn save_preferences(conn: &Connection, requester: RequesterId, prefs: &UserPreferences) -> RelayResult<()> {
    conn.execute(
        "INSERT INTO users (user_id, custom_model, temperature, show_thinking, max_execution_seconds, timeout_until, locale)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(user_id) DO UPDATE SET
            custom_model = excluded.custom_model,
            temperature = excluded.temperature,
            show_thinking = excluded.show_thinking,
            max_execution_seconds = excluded.max_execution_seconds,
            timeout_until = excluded.timeout_until,
            locale = excluded.locale",
        params![
            requester,
            prefs.custom_model,
            prefs.temperature.map(|t| t as f64),
            prefs.show_thinking as i64,
            prefs.max_execution_seconds as i64,
            prefs.timeout_until,
            prefs.locale,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn preferences(&self, requester: RequesterId) -> RelayResult<UserPreferences> {
        self.with_conn(move |conn| load_preferences(conn, requester)).await
    }

    async fn update_preferences(
        &self,
        requester: RequesterId,
        update: PreferenceUpdate,
    ) -> RelayResult<UserPreferences> {
        self.with_conn(move |conn| {
            let mut prefs = load_preferences(conn, requester)?;
            update.apply(&mut prefs);
            save_preferences(conn, requester, &prefs)?;
            debug!("[UserStore] updated preferences for {}", requester);
            Ok(prefs)
        })
        .await
    }

    async fn increment_usage(&self, requester: RequesterId, delta: UsageDelta) -> RelayResult<()> {
        if delta.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (user_id, characters, requests) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    characters = characters + excluded.characters,
                    requests = requests + excluded.requests",
                params![requester, delta.characters as i64, delta.requests as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn usage(&self, requester: RequesterId) -> RelayResult<UsageDelta> {
        self.with_conn(move |conn| {
            let usage = conn
                .query_row(
                    "SELECT characters, requests FROM users WHERE user_id = ?1",
                    params![requester],
                    |row| {
                        Ok(UsageDelta {
                            characters: row.get::<_, i64>(0)?.max(0) as u64,
                            requests: row.get::<_, i64>(1)?.max(0) as u64,
                        })
                    },
                )
                .optional()?;
            Ok(usage.unwrap_or_default())
        })
        .await
    }
}
