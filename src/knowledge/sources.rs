//! Knowledge Source Store - rusqlite 기반 소스 레코드 저장소
//!
//! 수집 요청(URL, 텍스트, 파일) 하나가 소스 레코드 하나입니다.
//! 상태: pending → processing → {completed, failed}
//! 저장 위치: <data>/sources.db

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::chunker::ChunkRegime;

/// 텍스트 소스의 기본 제목
pub const DEFAULT_TEXT_TITLE: &str = "Text Document";

// ============================================================================
// Types
// ============================================================================

/// 소스 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Processing => "processing",
            SourceStatus::Completed => "completed",
            SourceStatus::Failed => "failed",
        }
    }

    /// 허용된 상태 전이인지
    pub fn can_transition_to(self, next: SourceStatus) -> bool {
        matches!(
            (self, next),
            (SourceStatus::Pending, SourceStatus::Processing)
                | (SourceStatus::Processing, SourceStatus::Completed)
                | (SourceStatus::Processing, SourceStatus::Failed)
        )
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SourceStatus::Pending),
            "processing" => Ok(SourceStatus::Processing),
            "completed" => Ok(SourceStatus::Completed),
            "failed" => Ok(SourceStatus::Failed),
            other => anyhow::bail!("Unknown source status: {}", other),
        }
    }
}

/// 소스 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Url,
    Text,
    File,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Url => "url",
            SourceType::Text => "text",
            SourceType::File => "file",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "url" => Ok(SourceType::Url),
            "text" => Ok(SourceType::Text),
            "file" => Ok(SourceType::File),
            other => anyhow::bail!("Unknown source type: {}", other),
        }
    }
}

/// 수집 요청 내용
#[derive(Debug, Clone)]
pub enum SourcePayload {
    Url {
        url: String,
    },
    Text {
        title: Option<String>,
        text: String,
    },
    File {
        file_name: String,
        bytes: Vec<u8>,
    },
}

impl SourcePayload {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourcePayload::Url { .. } => SourceType::Url,
            SourcePayload::Text { .. } => SourceType::Text,
            SourcePayload::File { .. } => SourceType::File,
        }
    }

    /// 검색 결과에 표시할 라벨
    pub fn label(&self) -> String {
        match self {
            SourcePayload::Url { url } => url.clone(),
            SourcePayload::File { file_name, .. } => file_name.clone(),
            SourcePayload::Text { title, .. } => title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_TEXT_TITLE)
                .to_string(),
        }
    }
}

/// 저장된 소스 레코드
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub source_id: String,
    pub tenant_id: String,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub file_name: Option<String>,
    /// 추출된 본문 (재구축 시 다시 가져오지 않고 사용)
    pub content: Option<String>,
    /// 수집 때 쓴 청킹 방식 (재구축도 같은 방식)
    pub chunk_regime: ChunkRegime,
    pub status: SourceStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceRecord {
    /// 검색 결과에 표시할 라벨
    pub fn label(&self) -> String {
        match self.source_type {
            SourceType::Url => self.source_url.clone().unwrap_or_default(),
            SourceType::File => self.file_name.clone().unwrap_or_default(),
            SourceType::Text => self
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_TEXT_TITLE.to_string()),
        }
    }
}

/// 새 소스 입력용 구조체
#[derive(Debug, Clone)]
pub struct NewSource {
    pub tenant_id: String,
    pub source_type: SourceType,
    pub title: Option<String>,
    pub source_url: Option<String>,
    pub file_name: Option<String>,
    pub chunk_regime: ChunkRegime,
}

impl NewSource {
    /// 요청 내용에서 레코드 필드 추출 (파일 바이트는 저장하지 않음)
    pub fn from_payload(tenant_id: &str, payload: &SourcePayload) -> Self {
        let (title, source_url, file_name) = match payload {
            SourcePayload::Url { url } => (None, Some(url.clone()), None),
            SourcePayload::Text { .. } => (Some(payload.label()), None, None),
            SourcePayload::File { file_name, .. } => (None, None, Some(file_name.clone())),
        };
        Self {
            tenant_id: tenant_id.to_string(),
            source_type: payload.source_type(),
            title,
            source_url,
            file_name,
            chunk_regime: ChunkRegime::default(),
        }
    }

    pub fn with_regime(mut self, regime: ChunkRegime) -> Self {
        self.chunk_regime = regime;
        self
    }
}

// ============================================================================
// SourceRepository Trait
// ============================================================================

/// 소스 레코드 저장소 인터페이스
pub trait SourceRepository: Send + Sync {
    /// pending 상태로 생성
    fn create_source(&self, source: NewSource) -> Result<SourceRecord>;

    fn get_source(&self, source_id: &str) -> Result<Option<SourceRecord>>;

    /// 현재 상태가 `from`일 때만 `to`로 변경. 변경됐으면 true
    fn update_source_status(
        &self,
        source_id: &str,
        from: SourceStatus,
        to: SourceStatus,
        error_message: Option<&str>,
    ) -> Result<bool>;

    /// 추출된 본문 저장. 추출기가 제목을 찾았으면 제목도 갱신
    fn set_source_content(
        &self,
        source_id: &str,
        content: &str,
        title: Option<&str>,
    ) -> Result<()>;

    /// 테넌트 소스 목록 (생성 순)
    fn list_sources(&self, tenant_id: &str) -> Result<Vec<SourceRecord>>;

    /// 테넌트의 completed 소스 목록 (생성 순)
    fn list_completed_sources(&self, tenant_id: &str) -> Result<Vec<SourceRecord>>;

    fn delete_source(&self, source_id: &str) -> Result<bool>;

    /// 소스 개수 (테넌트 지정 시 해당 테넌트만)
    fn count_sources(&self, tenant_id: Option<&str>) -> Result<usize>;
}

// ============================================================================
// SqliteSourceStore
// ============================================================================

const SELECT_COLUMNS: &str = "source_id, tenant_id, source_type, title, source_url, file_name,
     content, status, error_message, created_at, updated_at, chunk_regime";

/// SQLite 소스 저장소
pub struct SqliteSourceStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteSourceStore {
    /// 저장소 열기 (없으면 생성)
    ///
    /// # Arguments
    /// * `path` - DB 파일 경로 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create database directory")?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open SQLite database")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 메모리 DB (테스트/일회성 실행)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: PathBuf::from(":memory:"),
        };
        store.initialize()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_sources (
                source_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                title TEXT,
                source_url TEXT,
                file_name TEXT,
                content TEXT,
                chunk_regime TEXT NOT NULL DEFAULT 'dense',
                status TEXT NOT NULL DEFAULT 'pending',
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sources_tenant ON knowledge_sources(tenant_id);
            CREATE INDEX IF NOT EXISTS idx_sources_status ON knowledge_sources(tenant_id, status);
            "#,
        )
        .context("Failed to create knowledge_sources table")?;

        // chunk_regime 컬럼 이전에 만들어진 DB
        let has_regime = conn
            .prepare(
                "SELECT 1 FROM pragma_table_info('knowledge_sources') WHERE name = 'chunk_regime'",
            )?
            .exists([])?;
        if !has_regime {
            conn.execute_batch(
                "ALTER TABLE knowledge_sources
                 ADD COLUMN chunk_regime TEXT NOT NULL DEFAULT 'dense'",
            )
            .context("Failed to add chunk_regime column")?;
        }

        tracing::debug!("Source store initialized at {:?}", self.db_path);
        Ok(())
    }

    fn query_sources(&self, sql: &str, tenant_id: &str) -> Result<Vec<SourceRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![tenant_id], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read source rows")?;
        Ok(rows)
    }
}

impl SourceRepository for SqliteSourceStore {
    fn create_source(&self, source: NewSource) -> Result<SourceRecord> {
        let conn = self.lock()?;
        let now = Utc::now();
        let source_id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO knowledge_sources
                (source_id, tenant_id, source_type, title, source_url, file_name,
                 chunk_regime, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                source_id,
                source.tenant_id,
                source.source_type.as_str(),
                source.title,
                source.source_url,
                source.file_name,
                source.chunk_regime.as_str(),
                SourceStatus::Pending.as_str(),
                now.to_rfc3339(),
            ],
        )
        .context("Failed to insert knowledge source")?;

        tracing::debug!(
            "Created {} source {} for tenant {}",
            source.source_type,
            source_id,
            source.tenant_id
        );

        Ok(SourceRecord {
            source_id,
            tenant_id: source.tenant_id,
            source_type: source.source_type,
            title: source.title,
            source_url: source.source_url,
            file_name: source.file_name,
            content: None,
            chunk_regime: source.chunk_regime,
            status: SourceStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn get_source(&self, source_id: &str) -> Result<Option<SourceRecord>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM knowledge_sources WHERE source_id = ?1",
            SELECT_COLUMNS
        );
        conn.query_row(&sql, params![source_id], row_to_record)
            .optional()
            .context("Failed to read knowledge source")
    }

    fn update_source_status(
        &self,
        source_id: &str,
        from: SourceStatus,
        to: SourceStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE knowledge_sources
                 SET status = ?1, error_message = ?2, updated_at = ?3
                 WHERE source_id = ?4 AND status = ?5",
                params![
                    to.as_str(),
                    error_message,
                    Utc::now().to_rfc3339(),
                    source_id,
                    from.as_str(),
                ],
            )
            .context("Failed to update source status")?;
        Ok(rows > 0)
    }

    fn set_source_content(
        &self,
        source_id: &str,
        content: &str,
        title: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE knowledge_sources
             SET content = ?1, title = COALESCE(?2, title), updated_at = ?3
             WHERE source_id = ?4",
            params![content, title, Utc::now().to_rfc3339(), source_id],
        )
        .context("Failed to store source content")?;
        Ok(())
    }

    fn list_sources(&self, tenant_id: &str) -> Result<Vec<SourceRecord>> {
        let sql = format!(
            "SELECT {} FROM knowledge_sources WHERE tenant_id = ?1
             ORDER BY created_at, rowid",
            SELECT_COLUMNS
        );
        self.query_sources(&sql, tenant_id)
    }

    fn list_completed_sources(&self, tenant_id: &str) -> Result<Vec<SourceRecord>> {
        let sql = format!(
            "SELECT {} FROM knowledge_sources WHERE tenant_id = ?1 AND status = 'completed'
             ORDER BY created_at, rowid",
            SELECT_COLUMNS
        );
        self.query_sources(&sql, tenant_id)
    }

    fn delete_source(&self, source_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let rows = conn.execute(
            "DELETE FROM knowledge_sources WHERE source_id = ?1",
            params![source_id],
        )?;
        Ok(rows > 0)
    }

    fn count_sources(&self, tenant_id: Option<&str>) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = match tenant_id {
            Some(tenant) => conn.query_row(
                "SELECT COUNT(*) FROM knowledge_sources WHERE tenant_id = ?1",
                params![tenant],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM knowledge_sources", [], |row| {
                row.get(0)
            })?,
        };
        Ok(count as usize)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SourceRecord> {
    let source_type: String = row.get(2)?;
    let status: String = row.get(7)?;
    let chunk_regime: String = row.get(11)?;

    Ok(SourceRecord {
        source_id: row.get(0)?,
        tenant_id: row.get(1)?,
        source_type: source_type.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        title: row.get(3)?,
        source_url: row.get(4)?,
        file_name: row.get(5)?,
        content: row.get(6)?,
        chunk_regime: chunk_regime.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, e.into())
        })?,
        status: status.parse().map_err(|e: anyhow::Error| {
            rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, e.into())
        })?,
        error_message: row.get(8)?,
        created_at: parse_datetime(row.get::<_, String>(9)?),
        updated_at: parse_datetime(row.get::<_, String>(10)?),
    })
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteSourceStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteSourceStore::open(&dir.path().join("sources.db")).unwrap();
        (dir, store)
    }

    fn text_source(tenant: &str, title: Option<&str>) -> NewSource {
        NewSource::from_payload(
            tenant,
            &SourcePayload::Text {
                title: title.map(str::to_string),
                text: "body".to_string(),
            },
        )
    }

    #[test]
    fn test_status_transitions() {
        use SourceStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert_eq!(Completed.to_string(), "completed");
        assert_eq!("failed".parse::<SourceStatus>().unwrap(), Failed);
    }

    #[test]
    fn test_payload_labels() {
        let url = SourcePayload::Url {
            url: "https://acme.test/faq".to_string(),
        };
        let file = SourcePayload::File {
            file_name: "faq.md".to_string(),
            bytes: vec![],
        };
        let untitled = SourcePayload::Text {
            title: Some("  ".to_string()),
            text: "x".to_string(),
        };
        assert_eq!(url.label(), "https://acme.test/faq");
        assert_eq!(file.label(), "faq.md");
        assert_eq!(untitled.label(), DEFAULT_TEXT_TITLE);
        assert_eq!(url.source_type(), SourceType::Url);
    }

    #[test]
    fn test_create_and_get_source() {
        let (_dir, store) = create_test_store();

        let created = store.create_source(text_source("acme", Some("faq"))).unwrap();
        assert_eq!(created.status, SourceStatus::Pending);

        let fetched = store.get_source(&created.source_id).unwrap().unwrap();
        assert_eq!(fetched.tenant_id, "acme");
        assert_eq!(fetched.source_type, SourceType::Text);
        assert_eq!(fetched.label(), "faq");
        assert!(fetched.content.is_none());

        assert!(store.get_source("missing").unwrap().is_none());
    }

    #[test]
    fn test_conditional_status_update() {
        let (_dir, store) = create_test_store();
        let source = store.create_source(text_source("acme", None)).unwrap();
        let id = &source.source_id;

        assert!(store
            .update_source_status(id, SourceStatus::Pending, SourceStatus::Processing, None)
            .unwrap());
        // 현재 상태가 다르면 변경 안 됨
        assert!(!store
            .update_source_status(id, SourceStatus::Pending, SourceStatus::Processing, None)
            .unwrap());
        assert!(store
            .update_source_status(
                id,
                SourceStatus::Processing,
                SourceStatus::Failed,
                Some("upstream timeout"),
            )
            .unwrap());

        let failed = store.get_source(id).unwrap().unwrap();
        assert_eq!(failed.status, SourceStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("upstream timeout"));
    }

    #[test]
    fn test_list_completed_sources_per_tenant() {
        let (_dir, store) = create_test_store();

        for tenant in ["acme", "acme", "beta"] {
            let source = store.create_source(text_source(tenant, None)).unwrap();
            store
                .update_source_status(
                    &source.source_id,
                    SourceStatus::Pending,
                    SourceStatus::Processing,
                    None,
                )
                .unwrap();
            store
                .update_source_status(
                    &source.source_id,
                    SourceStatus::Processing,
                    SourceStatus::Completed,
                    None,
                )
                .unwrap();
        }
        store.create_source(text_source("acme", None)).unwrap();

        assert_eq!(store.list_sources("acme").unwrap().len(), 3);
        assert_eq!(store.list_completed_sources("acme").unwrap().len(), 2);
        assert_eq!(store.list_completed_sources("beta").unwrap().len(), 1);
        assert_eq!(store.count_sources(None).unwrap(), 4);
        assert_eq!(store.count_sources(Some("beta")).unwrap(), 1);
    }

    #[test]
    fn test_content_and_delete() {
        let store = SqliteSourceStore::open_in_memory().unwrap();
        let source = store.create_source(text_source("acme", None)).unwrap();

        store
            .set_source_content(&source.source_id, "extracted", None)
            .unwrap();
        let fetched = store.get_source(&source.source_id).unwrap().unwrap();
        assert_eq!(fetched.content.as_deref(), Some("extracted"));
        assert_eq!(fetched.label(), DEFAULT_TEXT_TITLE);

        assert!(store.delete_source(&source.source_id).unwrap());
        assert!(!store.delete_source(&source.source_id).unwrap());
        assert_eq!(store.count_sources(Some("acme")).unwrap(), 0);
    }

    #[test]
    fn test_extracted_title_is_stored() {
        let store = SqliteSourceStore::open_in_memory().unwrap();
        let url = SourcePayload::Url {
            url: "https://acme.test/faq".to_string(),
        };
        let source = store
            .create_source(NewSource::from_payload("acme", &url))
            .unwrap();
        assert!(source.title.is_none());

        store
            .set_source_content(&source.source_id, "page body", Some("Acme FAQ"))
            .unwrap();
        let fetched = store.get_source(&source.source_id).unwrap().unwrap();
        assert_eq!(fetched.title.as_deref(), Some("Acme FAQ"));
        // URL 소스의 라벨은 계속 URL
        assert_eq!(fetched.label(), "https://acme.test/faq");
    }

    #[test]
    fn test_chunk_regime_round_trips_through_store() {
        let (_dir, store) = create_test_store();

        let dense = store.create_source(text_source("acme", None)).unwrap();
        let sparse = store
            .create_source(text_source("acme", Some("long")).with_regime(ChunkRegime::Sparse))
            .unwrap();
        assert_eq!(sparse.chunk_regime, ChunkRegime::Sparse);

        let fetched = store.get_source(&sparse.source_id).unwrap().unwrap();
        assert_eq!(fetched.chunk_regime, ChunkRegime::Sparse);
        let fetched = store.get_source(&dense.source_id).unwrap().unwrap();
        assert_eq!(fetched.chunk_regime, ChunkRegime::Dense);
    }
}
