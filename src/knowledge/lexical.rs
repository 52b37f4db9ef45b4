//! Lexical Index - FTS5 BM25 키워드 검색 스냅샷
//!
//! 전체 조각 코퍼스(모든 테넌트)로 메모리 SQLite FTS5 테이블을 통째로 만들고,
//! 완성된 스냅샷을 `Arc`로 교체 설치합니다. 읽기 측은 질의마다 스냅샷 하나를
//! 복제해서 사용하므로 재구축 중에도 막히지 않습니다.
//!
//! 키워드 결과는 재구축이 설치될 때까지 최신 upsert를 반영하지 못할 수 있습니다.
//! 벡터 검색 결과는 항상 마지막 upsert 기준입니다.
//!
//! source: https://www.sqlite.org/fts5.html#the_bm25_function

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use super::vector::StoredFragment;

// ============================================================================
// Types
// ============================================================================

/// 키워드 검색 결과
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub fragment: StoredFragment,
    /// BM25 스코어 (부호 반전, 높을수록 관련)
    pub score: f64,
}

// ============================================================================
// LexicalSnapshot
// ============================================================================

/// 유휴 읽기 연결 최대 보관 수
const MAX_IDLE_READERS: usize = 4;

/// 불변 키워드 인덱스 스냅샷
///
/// FTS5 테이블은 스냅샷마다 이름이 다른 공유 캐시 메모리 DB에 있습니다.
/// `owner` 연결이 살아 있는 동안 DB가 유지되고, 검색은 같은 DB에 붙은
/// 읽기 연결 풀에서 연결을 하나씩 빌려 쓰므로 동시 질의가 서로 막지 않습니다.
pub struct LexicalSnapshot {
    version: u64,
    fragments: Vec<StoredFragment>,
    uri: String,
    readers: Mutex<Vec<Connection>>,
    _owner: Mutex<Connection>,
}

impl LexicalSnapshot {
    /// 조각 목록으로 스냅샷 생성
    pub fn build(version: u64, fragments: Vec<StoredFragment>) -> Result<Self> {
        let uri = format!(
            "file:lexical-v{}-{}?mode=memory&cache=shared",
            version,
            uuid::Uuid::new_v4().simple()
        );
        let conn = Connection::open(&uri).context("Failed to open in-memory SQLite")?;

        conn.execute(
            "CREATE VIRTUAL TABLE fragments_fts USING fts5(text, tokenize = 'unicode61')",
            [],
        )
        .context("Failed to create FTS5 table")?;

        {
            let tx = conn.unchecked_transaction()?;
            {
                let mut stmt =
                    tx.prepare("INSERT INTO fragments_fts(rowid, text) VALUES (?1, ?2)")?;
                for (i, fragment) in fragments.iter().enumerate() {
                    stmt.execute(params![i as i64, fragment.text])
                        .context("Failed to insert fragment into FTS5")?;
                }
            }
            tx.commit().context("Failed to commit FTS5 snapshot")?;
        }

        tracing::debug!(
            "Built lexical snapshot v{} with {} fragments",
            version,
            fragments.len()
        );

        Ok(Self {
            version,
            fragments,
            uri,
            readers: Mutex::new(Vec::new()),
            _owner: Mutex::new(conn),
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// BM25 키워드 검색 (필터 없음)
    ///
    /// 질의 단어는 특수 문자를 제거한 뒤 OR로 연결합니다.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let match_query = build_match_query(query);
        if match_query.is_empty() || limit == 0 || self.fragments.is_empty() {
            return Ok(vec![]);
        }

        let conn = self.checkout()?;
        let rows = query_fts(&conn, &match_query, limit);
        self.checkin(conn);

        Ok(rows?
            .into_iter()
            .filter_map(|(rowid, bm25)| {
                self.fragments.get(rowid as usize).map(|fragment| LexicalHit {
                    fragment: fragment.clone(),
                    score: -bm25,
                })
            })
            .collect())
    }

    /// 풀에서 읽기 연결 빌리기 (없으면 새로 연결)
    fn checkout(&self) -> Result<Connection> {
        let pooled = self
            .readers
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => Connection::open(&self.uri).context("Failed to open lexical reader"),
        }
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut readers) = self.readers.lock() {
            if readers.len() < MAX_IDLE_READERS {
                readers.push(conn);
            }
        }
    }
}

/// BM25 순위 질의. (rowid, bm25) 목록
fn query_fts(conn: &Connection, match_query: &str, limit: usize) -> Result<Vec<(i64, f64)>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT rowid, bm25(fragments_fts) AS score
        FROM fragments_fts
        WHERE fragments_fts MATCH ?1
        ORDER BY score
        LIMIT ?2
        "#,
    )?;

    let rows = stmt
        .query_map(params![match_query, limit as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("FTS5 query failed")?;
    Ok(rows)
}

// ============================================================================
// LexicalIndex
// ============================================================================

/// 버전 관리되는 키워드 인덱스
///
/// 재구축은 시작 시점에 버전을 받고, 설치된 스냅샷보다 새 버전일 때만
/// 설치됩니다. 늦게 끝난 오래된 재구축이 최신 스냅샷을 덮어쓰지 않습니다.
pub struct LexicalIndex {
    enabled: bool,
    current: RwLock<Option<Arc<LexicalSnapshot>>>,
    next_version: AtomicU64,
}

impl LexicalIndex {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            current: RwLock::new(None),
            next_version: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 새 재구축 버전 발급
    pub fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 전체 코퍼스로 재구축 후 설치
    ///
    /// 비활성화 상태면 아무것도 하지 않고 None
    pub fn rebuild(&self, fragments: Vec<StoredFragment>) -> Result<Option<u64>> {
        if !self.enabled {
            return Ok(None);
        }

        let version = self.next_version();
        let snapshot = LexicalSnapshot::build(version, fragments)?;
        let installed = self.install(Arc::new(snapshot))?;
        Ok(installed.then_some(version))
    }

    /// 스냅샷 설치 (설치된 것보다 새 버전일 때만)
    pub fn install(&self, snapshot: Arc<LexicalSnapshot>) -> Result<bool> {
        let mut current = self
            .current
            .write()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        if let Some(installed) = current.as_ref() {
            if installed.version() >= snapshot.version() {
                tracing::debug!(
                    "Skipping stale lexical snapshot v{} (installed v{})",
                    snapshot.version(),
                    installed.version()
                );
                return Ok(false);
            }
        }

        tracing::debug!("Installed lexical snapshot v{}", snapshot.version());
        *current = Some(snapshot);
        Ok(true)
    }

    /// 현재 스냅샷 (없으면 None)
    pub fn snapshot(&self) -> Option<Arc<LexicalSnapshot>> {
        if !self.enabled {
            return None;
        }
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// 설치된 스냅샷 버전 (없으면 0)
    pub fn version(&self) -> u64 {
        self.snapshot().map(|s| s.version()).unwrap_or(0)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// FTS5 MATCH 질의 생성
///
/// 단어마다 특수 문자를 제거하고 따옴표로 감싼 뒤 OR로 연결합니다.
/// source: https://www.sqlite.org/fts5.html#full_text_query_syntax
fn build_match_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect::<Vec<_>>()
        .join(" OR ")
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(id: &str, tenant: &str, text: &str) -> StoredFragment {
        StoredFragment {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            source_id: "s1".to_string(),
            source_label: "faq".to_string(),
            ordinal: 0,
            text: text.to_string(),
        }
    }

    fn corpus() -> Vec<StoredFragment> {
        vec![
            stored("f1", "acme", "Our refund policy allows returns within 30 days."),
            stored("f2", "acme", "Support is available Monday to Friday."),
            stored("f3", "beta", "Beta ships worldwide with express delivery."),
        ]
    }

    #[test]
    fn test_build_match_query() {
        assert_eq!(build_match_query("refund policy?"), "\"refund\" OR \"policy\"");
        assert_eq!(build_match_query("  "), "");
        assert_eq!(build_match_query("a:b \"c\""), "\"ab\" OR \"c\"");
        assert_eq!(build_match_query("e-mail"), "\"e-mail\"");
    }

    #[test]
    fn test_snapshot_search_ranks_matches() {
        let snapshot = LexicalSnapshot::build(1, corpus()).unwrap();
        let hits = snapshot.search("What is the refund policy?", 5).unwrap();

        assert!(!hits.is_empty());
        assert_eq!(hits[0].fragment.id, "f1");
        assert!(hits[0].score > 0.0);
    }

    #[test]
    fn test_snapshot_search_is_unfiltered() {
        let snapshot = LexicalSnapshot::build(1, corpus()).unwrap();
        let hits = snapshot.search("delivery", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fragment.tenant_id, "beta");
    }

    #[test]
    fn test_snapshot_empty_query_or_corpus() {
        let snapshot = LexicalSnapshot::build(1, corpus()).unwrap();
        assert!(snapshot.search("???", 5).unwrap().is_empty());

        let empty = LexicalSnapshot::build(2, vec![]).unwrap();
        assert!(empty.is_empty());
        assert!(empty.search("refund", 5).unwrap().is_empty());
    }

    #[test]
    fn test_index_installs_only_newer_versions() {
        let index = LexicalIndex::new(true);
        assert!(index.snapshot().is_none());

        let v1 = index.next_version();
        let v2 = index.next_version();
        let newer = Arc::new(LexicalSnapshot::build(v2, corpus()).unwrap());
        let older = Arc::new(LexicalSnapshot::build(v1, vec![]).unwrap());

        assert!(index.install(newer).unwrap());
        assert!(!index.install(older).unwrap());
        assert_eq!(index.version(), v2);
        assert_eq!(index.snapshot().unwrap().len(), 3);
    }

    #[test]
    fn test_index_rebuild() {
        let index = LexicalIndex::new(true);
        let first = index.rebuild(corpus()).unwrap();
        let second = index.rebuild(corpus()[..1].to_vec()).unwrap();

        assert!(second > first);
        assert_eq!(index.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_disabled_index() {
        let index = LexicalIndex::new(false);
        assert_eq!(index.rebuild(corpus()).unwrap(), None);
        assert!(index.snapshot().is_none());
        assert_eq!(index.version(), 0);
    }

    #[test]
    fn test_snapshots_do_not_share_tables() {
        let first = LexicalSnapshot::build(1, corpus()).unwrap();
        let second = LexicalSnapshot::build(
            1,
            vec![stored("g1", "gamma", "Gamma only sells gift cards.")],
        )
        .unwrap();

        assert!(first.search("gift cards", 5).unwrap().is_empty());
        assert!(second.search("refund", 5).unwrap().is_empty());
        assert_eq!(second.search("gift", 5).unwrap()[0].fragment.id, "g1");
    }

    #[test]
    fn test_concurrent_searches_share_one_snapshot() {
        let snapshot = Arc::new(LexicalSnapshot::build(1, corpus()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let snapshot = Arc::clone(&snapshot);
                std::thread::spawn(move || {
                    (0..20)
                        .map(|_| snapshot.search("refund policy", 3).unwrap()[0].fragment.id.clone())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().iter().all(|id| id == "f1"));
        }
        assert!(snapshot.readers.lock().unwrap().len() <= MAX_IDLE_READERS);
    }
}
