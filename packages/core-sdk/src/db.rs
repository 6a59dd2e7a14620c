use anyhow::{bail, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::{thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::anchoring::ReviewSink;
use crate::gateway::CredentialSource;
use crate::models::{AiConfigSummary, ConfigKind, DirectionStatus, LiteratureSite, StoredCredential};
use crate::prompts::PromptKind;

/**
 * \brief 打开数据库文件并设置忙等待超时。
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS ai_configs (
            user_id TEXT NOT NULL,
            api_name TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'cloud',
            url_enc TEXT,
            key_enc TEXT,
            model_path TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, api_name)
        );

        CREATE TABLE IF NOT EXISTS literature_sites (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            site_name TEXT NOT NULL,
            url TEXT NOT NULL,
            auth_enc TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE (user_id, site_name)
        );

        CREATE TABLE IF NOT EXISTS prompt_templates (
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            content TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (user_id, kind)
        );

        CREATE TABLE IF NOT EXISTS direction_reviews (
            direction_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            review TEXT,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;

    // params_json arrived after the first schema
    ensure_column(conn, "ai_configs", "params_json", "TEXT")?;
    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, ddl: &str) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        retry_on_locked(|| {
            conn.execute(
                &format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, ddl),
                [],
            )
        })?;
    }
    Ok(())
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 新增或覆盖一条 AI 接口配置。密文由调用方事先加密。
 */
pub fn upsert_ai_config(conn: &Connection, user_id: &str, cred: &StoredCredential) -> Result<()> {
    let now = now_rfc3339();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO ai_configs (user_id, api_name, kind, url_enc, key_enc, model_path, params_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(user_id, api_name) DO UPDATE SET
                kind=excluded.kind, url_enc=excluded.url_enc, key_enc=excluded.key_enc,
                model_path=excluded.model_path, params_json=excluded.params_json,
                updated_at=excluded.updated_at",
            params![
                user_id,
                cred.api_name,
                cred.kind.as_str(),
                cred.endpoint_ciphertext,
                cred.api_key_ciphertext,
                cred.model_path,
                cred.params_json,
                now
            ],
        )
    })?;
    Ok(())
}

/**
 * \brief 按调用者与接口名读取凭据。
 */
pub fn get_ai_config(conn: &Connection, user_id: &str, api_name: &str) -> Result<Option<StoredCredential>> {
    let row = conn
        .query_row(
            "SELECT api_name, kind, url_enc, key_enc, model_path, params_json
             FROM ai_configs WHERE user_id=?1 AND api_name=?2",
            params![user_id, api_name],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;
    let Some((api_name, kind, url_enc, key_enc, model_path, params_json)) = row else {
        return Ok(None);
    };
    let Some(kind) = ConfigKind::parse(&kind) else {
        bail!("ai config '{}' has unknown kind '{}'", api_name, kind);
    };
    Ok(Some(StoredCredential {
        api_name,
        kind,
        endpoint_ciphertext: url_enc,
        api_key_ciphertext: key_enc,
        model_path,
        params_json,
    }))
}

/**
 * \brief 列出调用者的接口配置（不含任何密文）。
 */
pub fn list_ai_configs(conn: &Connection, user_id: &str) -> Result<Vec<AiConfigSummary>> {
    let mut stmt = conn.prepare(
        "SELECT api_name, kind, url_enc IS NOT NULL, model_path, params_json, updated_at
         FROM ai_configs WHERE user_id=?1 ORDER BY api_name ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .map(|(api_name, kind, has_url, model_path, params_json, updated_at)| AiConfigSummary {
            api_name,
            kind: ConfigKind::parse(&kind).unwrap_or(ConfigKind::Cloud),
            url_redacted: has_url,
            model_path,
            params_json,
            updated_at,
        })
        .collect())
}

/**
 * \brief 新增或更新文献网站（按名称去重），返回行主键。
 */
pub fn upsert_site(
    conn: &Connection,
    user_id: &str,
    site_name: &str,
    url: &str,
    auth_enc: Option<&str>,
) -> Result<i64> {
    let now = now_rfc3339();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO literature_sites (user_id, site_name, url, auth_enc, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id, site_name) DO UPDATE SET
                url=excluded.url, auth_enc=excluded.auth_enc, updated_at=excluded.updated_at",
            params![user_id, site_name, url, auth_enc, now],
        )
    })?;
    let id = conn.query_row(
        "SELECT id FROM literature_sites WHERE user_id=?1 AND site_name=?2",
        params![user_id, site_name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn map_site(row: &rusqlite::Row<'_>) -> rusqlite::Result<LiteratureSite> {
    Ok(LiteratureSite {
        id: row.get(0)?,
        site_name: row.get(1)?,
        url: row.get(2)?,
        auth_ciphertext: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

pub fn list_sites(conn: &Connection, user_id: &str) -> Result<Vec<LiteratureSite>> {
    let mut stmt = conn.prepare(
        "SELECT id, site_name, url, auth_enc, updated_at FROM literature_sites
         WHERE user_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![user_id], map_site)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_site(conn: &Connection, user_id: &str, id: i64) -> Result<Option<LiteratureSite>> {
    conn.query_row(
        "SELECT id, site_name, url, auth_enc, updated_at FROM literature_sites
         WHERE user_id=?1 AND id=?2",
        params![user_id, id],
        map_site,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 读取用户保存的提示词模板；未保存时返回 None，由模板引擎回退到默认值。
 */
pub fn get_prompt_template(conn: &Connection, user_id: &str, kind: PromptKind) -> Result<Option<String>> {
    conn.query_row(
        "SELECT content FROM prompt_templates WHERE user_id=?1 AND kind=?2",
        params![user_id, kind.as_str()],
        |row| row.get(0),
    )
    .optional()
    .map_err(Into::into)
}

pub fn set_prompt_template(conn: &Connection, user_id: &str, kind: PromptKind, content: &str) -> Result<()> {
    let now = now_rfc3339();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO prompt_templates (user_id, kind, content, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, kind) DO UPDATE SET content=excluded.content, updated_at=excluded.updated_at",
            params![user_id, kind.as_str(), content, now],
        )
    })?;
    Ok(())
}

/**
 * \brief 保存综述并把研究方向标记为“已生成综述”。
 */
pub fn save_review(conn: &Connection, direction_id: &str, document: &str) -> Result<()> {
    let now = now_rfc3339();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO direction_reviews (direction_id, status, review, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(direction_id) DO UPDATE SET
                status=excluded.status, review=excluded.review, updated_at=excluded.updated_at",
            params![direction_id, DirectionStatus::ReviewGenerated.as_str(), document, now],
        )
    })?;
    Ok(())
}

pub fn get_review(conn: &Connection, direction_id: &str) -> Result<Option<(DirectionStatus, Option<String>)>> {
    let row = conn
        .query_row(
            "SELECT status, review FROM direction_reviews WHERE direction_id=?1",
            params![direction_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(status, review)| {
        (
            DirectionStatus::parse(&status).unwrap_or(DirectionStatus::ReviewPending),
            review,
        )
    }))
}

/**
 * \brief 基于 SQLite 文件的外部协作者：为网关提供凭据、为编排器保存综述。
 * 每次操作打开独立连接，不跨请求共享可变状态。
 */
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /**
     * \brief 打开（必要时创建）数据库并执行迁移。
     */
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let conn = open_db(&path)?;
        migrate(&conn)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn conn(&self) -> Result<Connection> {
        open_db(&self.path)
    }
}

impl CredentialSource for SqliteStore {
    fn credential(&self, caller: &str, api_name: &str) -> Result<Option<StoredCredential>> {
        let conn = self.conn()?;
        get_ai_config(&conn, caller, api_name)
    }
}

impl ReviewSink for SqliteStore {
    fn save_review(&self, direction_id: &str, document: &str) -> Result<()> {
        let conn = self.conn()?;
        save_review(&conn, direction_id, document)
    }
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行线性退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
                    && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
