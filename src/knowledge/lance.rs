//! LanceDB Vector Store - 영구 벡터 저장소
//!
//! ANN (Approximate Nearest Neighbor) 검색으로 대용량 벡터에서도 빠른 검색을 지원합니다.
//! 연결과 테이블은 처음 사용할 때 열리며, `reset()` 외에는 다시 만들지 않습니다.
//!
//! ref: https://lancedb.github.io/lancedb/

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int32Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use tokio::sync::{Mutex, RwLock};

use super::vector::{FragmentFilter, NewFragment, SearchResult, StoredFragment, VectorStore};

/// 조각 테이블 이름
const TABLE_NAME: &str = "fragments";

// ============================================================================
// LanceVectorStore
// ============================================================================

/// LanceDB 벡터 저장소 구현
///
/// Apache Arrow 기반 columnar 데이터베이스에 조각을 저장합니다.
/// 테넌트/소스 필터는 `only_if` 조건으로 서버 측에서 평가한 뒤
/// 결과를 다시 `FragmentFilter::matches`로 확인합니다.
pub struct LanceVectorStore {
    path: PathBuf,
    dimension: usize,
    db: RwLock<Option<Connection>>,
    /// 테이블 생성 직렬화 (동시 첫 upsert)
    create_lock: Mutex<()>,
}

impl LanceVectorStore {
    /// LanceDB 저장소 생성 (연결은 첫 사용 시)
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `dimension` - 임베딩 차원
    pub fn new(path: &Path, dimension: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            dimension,
            db: RwLock::new(None),
            create_lock: Mutex::new(()),
        }
    }

    /// 저장소 열기 (즉시 연결)
    ///
    /// 저장 경로를 쓸 수 없으면 여기서 실패합니다.
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        let store = Self::new(path, dimension);
        store.connection().await?;
        Ok(store)
    }

    /// 연결 가져오기 (없으면 생성)
    async fn connection(&self) -> Result<Connection> {
        if let Some(db) = self.db.read().await.as_ref() {
            return Ok(db.clone());
        }

        let mut guard = self.db.write().await;
        if let Some(db) = guard.as_ref() {
            return Ok(db.clone());
        }

        // 부모 디렉토리 생성
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create LanceDB directory")?;
            }
        }

        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .context("Failed to connect to LanceDB")?;

        tracing::debug!("LanceDB connected at {:?}", self.path);
        *guard = Some(db.clone());
        Ok(db)
    }

    /// 조각 테이블 스키마
    fn create_schema(&self) -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("tenant_id", DataType::Utf8, false),
            Field::new("source_id", DataType::Utf8, false),
            Field::new("source_label", DataType::Utf8, false),
            Field::new("ordinal", DataType::Int32, false),
            Field::new("text", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                false,
            ),
        ])
    }

    /// 조각들을 Arrow RecordBatch로 변환
    fn fragments_to_batch(&self, fragments: &[NewFragment]) -> Result<RecordBatch> {
        if fragments.is_empty() {
            anyhow::bail!("Cannot create batch from empty fragments");
        }

        if let Some(bad) = fragments.iter().find(|f| f.vector.len() != self.dimension) {
            anyhow::bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                bad.vector.len()
            );
        }

        let ids: Vec<String> = fragments.iter().map(|f| f.fragment_id()).collect();
        let tenants: Vec<&str> = fragments.iter().map(|f| f.tenant_id.as_str()).collect();
        let sources: Vec<&str> = fragments.iter().map(|f| f.source_id.as_str()).collect();
        let labels: Vec<&str> = fragments.iter().map(|f| f.source_label.as_str()).collect();
        let ordinals: Vec<i32> = fragments.iter().map(|f| f.ordinal as i32).collect();
        let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();

        // 임베딩을 FixedSizeList로 변환
        let vectors_flat: Vec<f32> = fragments
            .iter()
            .flat_map(|f| f.vector.iter().copied())
            .collect();

        let values = Float32Array::from(vectors_flat);
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let vector_list = FixedSizeListArray::try_new(
            field,
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .context("Failed to create vector array")?;

        RecordBatch::try_new(
            Arc::new(self.create_schema()),
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(tenants)),
                Arc::new(StringArray::from(sources)),
                Arc::new(StringArray::from(labels)),
                Arc::new(Int32Array::from(ordinals)),
                Arc::new(StringArray::from(texts)),
                Arc::new(vector_list),
            ],
        )
        .context("Failed to create RecordBatch")
    }

    /// 테이블 열기 (없으면 None)
    async fn open_table(&self) -> Result<Option<lancedb::table::Table>> {
        let db = self.connection().await?;
        let names = db
            .table_names()
            .execute()
            .await
            .context("Failed to list LanceDB tables")?;

        if !names.iter().any(|name| name == TABLE_NAME) {
            return Ok(None);
        }

        let table = db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .context("Failed to open fragments table")?;
        Ok(Some(table))
    }
}

#[async_trait]
impl VectorStore for LanceVectorStore {
    async fn upsert(&self, fragments: &[NewFragment]) -> Result<Vec<String>> {
        if fragments.is_empty() {
            return Ok(vec![]);
        }

        let batch = self.fragments_to_batch(fragments)?;
        let schema = batch.schema();
        let ids: Vec<String> = fragments.iter().map(|f| f.fragment_id()).collect();

        let table = match self.open_table().await? {
            Some(table) => table,
            None => {
                let _guard = self.create_lock.lock().await;
                match self.open_table().await? {
                    Some(table) => table,
                    None => {
                        let db = self.connection().await?;
                        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
                        db.create_table(TABLE_NAME, batches)
                            .execute()
                            .await
                            .context("Failed to create fragments table")?;
                        tracing::info!(
                            "Created LanceDB table '{}' at {:?}",
                            TABLE_NAME,
                            self.path
                        );
                        return Ok(ids);
                    }
                }
            }
        };

        // 같은 ID는 먼저 지우고 다시 추가
        let id_list = ids
            .iter()
            .map(|id| format!("'{}'", id))
            .collect::<Vec<_>>()
            .join(", ");
        table
            .delete(&format!("id IN ({})", id_list))
            .await
            .context("Failed to replace existing fragments")?;

        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        table
            .add(batches)
            .execute()
            .await
            .context("Failed to add fragments to table")?;

        tracing::debug!("Upserted {} fragments into LanceDB", ids.len());
        Ok(ids)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &FragmentFilter,
    ) -> Result<Vec<SearchResult>> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "Query dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            );
        }

        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let mut query = table
            .vector_search(vector.to_vec())
            .context("Failed to create vector search")?
            .limit(limit);
        if let Some(sql) = filter.to_sql() {
            query = query.only_if(sql);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .context("Failed to execute vector search")?
            .try_collect()
            .await
            .context("Failed to collect search results")?;

        let mut results = Vec::new();
        for batch in &batches {
            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| anyhow::anyhow!("Missing _distance column"))?;

            for (row, fragment) in batch_to_fragments(batch)?.into_iter().enumerate() {
                if !filter.matches(&fragment) {
                    continue;
                }
                results.push(SearchResult {
                    fragment,
                    distance: distances.value(row),
                });
            }
        }

        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);
        Ok(results)
    }

    async fn delete(&self, filter: &FragmentFilter) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        let predicate = filter.to_sql().unwrap_or_else(|| "true".to_string());
        let before = table
            .count_rows(filter.to_sql())
            .await
            .context("Failed to count rows before delete")?;

        table
            .delete(&predicate)
            .await
            .context("Failed to delete fragments")?;

        Ok(before)
    }

    async fn count(&self, filter: &FragmentFilter) -> Result<usize> {
        let Some(table) = self.open_table().await? else {
            return Ok(0);
        };

        table
            .count_rows(filter.to_sql())
            .await
            .context("Failed to count rows")
    }

    async fn fragments(
        &self,
        filter: &FragmentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<StoredFragment>> {
        let Some(table) = self.open_table().await? else {
            return Ok(vec![]);
        };

        let limit = match limit {
            Some(limit) => limit,
            None => table
                .count_rows(filter.to_sql())
                .await
                .context("Failed to count rows")?,
        };
        if limit == 0 {
            return Ok(vec![]);
        }

        let mut query = table.query().limit(limit);
        if let Some(sql) = filter.to_sql() {
            query = query.only_if(sql);
        }

        let batches: Vec<RecordBatch> = query
            .execute()
            .await
            .context("Failed to scan fragments")?
            .try_collect()
            .await
            .context("Failed to collect fragments")?;

        let mut fragments = Vec::new();
        for batch in &batches {
            fragments.extend(
                batch_to_fragments(batch)?
                    .into_iter()
                    .filter(|f| filter.matches(f)),
            );
        }
        Ok(fragments)
    }

    async fn reset(&self) -> Result<()> {
        let _create = self.create_lock.lock().await;
        let mut guard = self.db.write().await;

        if let Some(db) = guard.take() {
            let names = db
                .table_names()
                .execute()
                .await
                .context("Failed to list LanceDB tables")?;
            if names.iter().any(|name| name == TABLE_NAME) {
                db.drop_table(TABLE_NAME)
                    .await
                    .context("Failed to drop fragments table")?;
            }
        }

        if self.path.exists() {
            tokio::fs::remove_dir_all(&self.path)
                .await
                .with_context(|| format!("Failed to remove {:?}", self.path))?;
        }

        tracing::info!("LanceDB store reset at {:?}", self.path);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "lancedb"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// RecordBatch 행들을 조각으로 변환
fn batch_to_fragments(batch: &RecordBatch) -> Result<Vec<StoredFragment>> {
    let string_column = |name: &str| -> Result<&StringArray> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| anyhow::anyhow!("Missing {} column", name))
    };

    let ids = string_column("id")?;
    let tenants = string_column("tenant_id")?;
    let sources = string_column("source_id")?;
    let labels = string_column("source_label")?;
    let texts = string_column("text")?;
    let ordinals = batch
        .column_by_name("ordinal")
        .and_then(|c| c.as_any().downcast_ref::<Int32Array>())
        .ok_or_else(|| anyhow::anyhow!("Missing ordinal column"))?;

    Ok((0..batch.num_rows())
        .map(|i| StoredFragment {
            id: ids.value(i).to_string(),
            tenant_id: tenants.value(i).to_string(),
            source_id: sources.value(i).to_string(),
            source_label: labels.value(i).to_string(),
            ordinal: ordinals.value(i).max(0) as u32,
            text: texts.value(i).to_string(),
        })
        .collect())
}

// ============================================================================
// Tests
// ============================================================================
