//! SQLite-backed conversation history.

use anyhow::Context;
use async_trait::async_trait;
use rb_core::{ChatTurn, CoreError, HistoryStore, TurnRole, UserKey};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS turns (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_key TEXT NOT NULL,
  role TEXT NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS turns_user_idx ON turns (user_key, id);
"#;

#[derive(Clone)]
pub struct SqliteHistoryStore {
    path: Arc<PathBuf>,
    max_turns: usize,
}

impl SqliteHistoryStore {
    #[tracing::instrument(level = "info", skip_all, fields(path = %path.display(), max_turns))]
    pub async fn open(path: PathBuf, max_turns: usize) -> anyhow::Result<Self> {
        let init_path = path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            if let Some(parent) = init_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create history dir {}", parent.display()))?;
            }
            let conn = open_db(&init_path)?;
            conn.execute_batch(SCHEMA).context("init history schema")?;
            Ok(())
        })
        .await??;
        Ok(Self {
            path: Arc::new(path),
            max_turns,
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> rb_core::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_db(&path)?;
            op(&conn)
        })
        .await
        .map_err(|e| CoreError::History(format!("history task failed: {e}")))?
        .map_err(|e| CoreError::History(format!("{e:#}")))
    }

    async fn append(&self, user: &UserKey, role: TurnRole, content: &str) -> rb_core::Result<()> {
        let user = user.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO turns (user_key, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user, role_label(role), content, chrono::Utc::now().to_rfc3339()],
            )
            .context("insert turn")?;
            Ok(())
        })
        .await
    }
}

fn open_db(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open history db: {}", path.display()))?;
    conn.busy_timeout(Duration::from_millis(1000))
        .context("set sqlite busy timeout")?;
    Ok(conn)
}

fn role_label(role: TurnRole) -> &'static str {
    match role {
        TurnRole::User => "user",
        TurnRole::Assistant => "assistant",
    }
}

fn parse_role(label: &str) -> Option<TurnRole> {
    match label {
        "user" => Some(TurnRole::User),
        "assistant" => Some(TurnRole::Assistant),
        _ => None,
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    #[tracing::instrument(level = "debug", skip_all, fields(user = %user))]
    async fn load(&self, user: &UserKey) -> rb_core::Result<Vec<ChatTurn>> {
        let key = user.to_string();
        let limit = i64::try_from(self.max_turns).unwrap_or(i64::MAX);
        let turns = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
SELECT role, content FROM (
  SELECT id, role, content FROM turns
  WHERE user_key = ?1
  ORDER BY id DESC
  LIMIT ?2
) ORDER BY id ASC
"#,
                )?;
                let rows = stmt.query_map(params![key, limit], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                let mut turns = Vec::new();
                for row in rows {
                    let (role, content) = row?;
                    match parse_role(&role) {
                        Some(role) => turns.push(ChatTurn { role, content }),
                        None => tracing::warn!(role = %role, "skipping turn with unknown role"),
                    }
                }
                Ok(turns)
            })
            .await?;
        tracing::debug!(turns = turns.len(), "history loaded");
        Ok(turns)
    }

    async fn append_user(&self, user: &UserKey, content: &str) -> rb_core::Result<()> {
        self.append(user, TurnRole::User, content).await
    }

    async fn append_bot(&self, user: &UserKey, content: &str) -> rb_core::Result<()> {
        self.append(user, TurnRole::Assistant, content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store(dir: &tempfile::TempDir, max_turns: usize) -> SqliteHistoryStore {
        SqliteHistoryStore::open(dir.path().join("nested").join("history.db"), max_turns)
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn turns_round_trip_in_order_per_user() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 10).await;
        let alice = UserKey::from("1555000");
        let bob = UserKey::from("1555999");

        store.append_user(&alice, "hi").await.expect("append");
        store.append_user(&bob, "yo").await.expect("append");
        store.append_bot(&alice, "Hello\n\nHow can I help?").await.expect("append");
        store.append_user(&alice, "weather?").await.expect("append");

        assert_eq!(
            store.load(&alice).await.expect("load"),
            vec![
                ChatTurn::user("hi"),
                ChatTurn::assistant("Hello\n\nHow can I help?"),
                ChatTurn::user("weather?"),
            ]
        );
        assert_eq!(store.load(&bob).await.expect("load"), vec![ChatTurn::user("yo")]);
        assert!(store.load(&UserKey::from("nobody")).await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn load_keeps_only_the_most_recent_turns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir, 2).await;
        let user = UserKey::from("1555000");
        for text in ["one", "two", "three"] {
            store.append_user(&user, text).await.expect("append");
        }
        assert_eq!(
            store.load(&user).await.expect("load"),
            vec![ChatTurn::user("two"), ChatTurn::user("three")]
        );
    }

    #[tokio::test]
    async fn reopening_keeps_existing_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let user = UserKey::from("1555000");
        store(&dir, 10).await.append_user(&user, "persisted").await.expect("append");

        let reopened = store(&dir, 10).await;
        assert_eq!(
            reopened.load(&user).await.expect("load"),
            vec![ChatTurn::user("persisted")]
        );
    }
}
