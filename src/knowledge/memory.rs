//! In-Memory Vector Store - 프로세스 내 벡터 저장소
//!
//! 디스크를 쓰지 않는 단순 구현입니다. 테스트와 일회성 실행에 사용합니다.
//! 검색은 전수 코사인 유사도 비교이며 거리는 `1 - cosine`입니다.

use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::vector::{
    cosine_similarity, FragmentFilter, NewFragment, SearchResult, StoredFragment, VectorStore,
};

/// 프로세스 내 벡터 저장소
#[derive(Default)]
pub struct InMemoryVectorStore {
    rows: RwLock<Vec<(StoredFragment, Vec<f32>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, fragments: &[NewFragment]) -> Result<Vec<String>> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut ids = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            let stored = fragment.to_stored();
            ids.push(stored.id.clone());

            match rows.iter_mut().find(|(row, _)| row.id == stored.id) {
                Some(existing) => *existing = (stored, fragment.vector.clone()),
                None => rows.push((stored, fragment.vector.clone())),
            }
        }

        Ok(ids)
    }

    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &FragmentFilter,
    ) -> Result<Vec<SearchResult>> {
        let rows = self
            .rows
            .read()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut results: Vec<SearchResult> = rows
            .iter()
            .filter(|(fragment, _)| filter.matches(fragment))
            .map(|(fragment, stored_vector)| SearchResult {
                fragment: fragment.clone(),
                distance: 1.0 - cosine_similarity(vector, stored_vector),
            })
            .collect();

        // 거리 오름차순 (동점은 저장 순서 유지)
        results.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(limit);

        Ok(results)
    }

    async fn delete(&self, filter: &FragmentFilter) -> Result<usize> {
        let mut rows = self
            .rows
            .write()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let before = rows.len();
        rows.retain(|(fragment, _)| !filter.matches(fragment));
        Ok(before - rows.len())
    }

    async fn count(&self, filter: &FragmentFilter) -> Result<usize> {
        let rows = self
            .rows
            .read()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(rows.iter().filter(|(f, _)| filter.matches(f)).count())
    }

    async fn fragments(
        &self,
        filter: &FragmentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<StoredFragment>> {
        let rows = self
            .rows
            .read()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        Ok(rows
            .iter()
            .filter(|(f, _)| filter.matches(f))
            .take(limit.unwrap_or(usize::MAX))
            .map(|(f, _)| f.clone())
            .collect())
    }

    async fn reset(&self) -> Result<()> {
        self.rows
            .write()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?
            .clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Tests
// ============================================================================
