//! 하이브리드 검색 - 벡터 + FTS5 RRF 통합
//!
//! 테넌트 필터를 건 벡터 검색과 키워드 스냅샷 검색을 가중 RRF
//! (Reciprocal Rank Fusion)로 합칩니다. 호출마다 상태가 없습니다.
//!
//! ref: https://www.elastic.co/blog/hybrid-search-rrf

use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::EmbeddingGateway;
use crate::error::{RagError, RagResult};

use super::lexical::{LexicalHit, LexicalIndex};
use super::tenant::TenantId;
use super::vector::{FragmentFilter, SearchResult, StoredFragment, VectorStore};

/// RRF 상수 (높은 순위에 더 많은 가중치)
pub const RRF_K: f32 = 60.0;

// ============================================================================
// Types
// ============================================================================

/// 검색 방법
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMethod {
    /// 벡터 검색에서만 나옴
    Vector,
    /// 키워드 검색에서만 나옴
    Lexical,
    /// 양쪽 모두에서 나옴
    Hybrid,
}

/// 통합 검색 결과
#[derive(Debug, Clone)]
pub struct RetrievedFragment {
    pub fragment: StoredFragment,
    /// RRF 스코어 (높을수록 좋음)
    pub score: f32,
    pub method: SearchMethod,
}

/// 검색 결과
#[derive(Debug, Clone)]
pub enum Retrieval {
    /// 순위순 조각 (비어있지 않음)
    Found(Vec<RetrievedFragment>),
    /// 관련 콘텐츠 없음 (언어 모델 호출 전에 중단)
    NoRelevantContent,
}

/// 검색 가중치
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub dense: f32,
    pub lexical: f32,
}

impl FusionWeights {
    /// 벡터 검색만
    pub const DENSE_ONLY: Self = Self {
        dense: 1.0,
        lexical: 0.0,
    };
    /// 벡터 + 키워드 균등
    pub const BALANCED: Self = Self {
        dense: 0.5,
        lexical: 0.5,
    };
}

// ============================================================================
// HybridRetriever
// ============================================================================

/// 하이브리드 검색기
pub struct HybridRetriever {
    vector: Arc<dyn VectorStore>,
    lexical: Arc<LexicalIndex>,
    embedder: EmbeddingGateway,
    k: usize,
}

impl HybridRetriever {
    pub fn new(
        vector: Arc<dyn VectorStore>,
        lexical: Arc<LexicalIndex>,
        embedder: EmbeddingGateway,
        k: usize,
    ) -> Self {
        Self {
            vector,
            lexical,
            embedder,
            k: k.max(1),
        }
    }

    /// 테넌트 범위 하이브리드 검색
    ///
    /// 결과는 항상 테넌트 파티션 또는 공유 파티션의 조각만 포함합니다.
    pub async fn retrieve(&self, tenant: &TenantId, question: &str) -> RagResult<Retrieval> {
        let filter = FragmentFilter::TenantWithShared(tenant.to_string());

        // 1. 벡터 검색 (서버 측 필터)
        let query_vector = self.embedder.embed_query(question).await?;
        let dense = self
            .vector
            .query(&query_vector, self.k, &filter)
            .await
            .map_err(RagError::Other)?;
        let dense = drop_foreign(dense, &filter, |r| &r.fragment, "vector");

        // 2. 키워드 검색 (필터 없이 조회 후 반드시 후처리 필터)
        let (lexical, weights) = match self.lexical.snapshot() {
            Some(snapshot) => match snapshot.search(question, self.k) {
                Ok(hits) => {
                    let total = hits.len();
                    let hits: Vec<LexicalHit> =
                        hits.into_iter().filter(|h| filter.matches(&h.fragment)).collect();
                    tracing::debug!(
                        "Lexical v{}: {}/{} hits in tenant scope",
                        snapshot.version(),
                        hits.len(),
                        total
                    );
                    (hits, FusionWeights::BALANCED)
                }
                Err(e) => {
                    tracing::warn!("Lexical search failed, using vector results only: {}", e);
                    (vec![], FusionWeights::DENSE_ONLY)
                }
            },
            None => (vec![], FusionWeights::DENSE_ONLY),
        };

        // 3. RRF 통합
        let fused = rrf_fuse(&dense, &lexical, weights, self.k);
        let fused = drop_foreign(fused, &filter, |r| &r.fragment, "fused");

        tracing::debug!(
            "Retrieved {} fragments for tenant {} (dense={}, lexical={})",
            fused.len(),
            tenant,
            dense.len(),
            lexical.len()
        );

        if fused.is_empty() {
            Ok(Retrieval::NoRelevantContent)
        } else {
            Ok(Retrieval::Found(fused))
        }
    }
}

// ============================================================================
// Fusion
// ============================================================================

/// 가중 RRF (Reciprocal Rank Fusion)
///
/// RRF Score = w / (k + rank + 1), k = 60
///
/// 같은 조각이 양쪽에 나오면 더 높은 점수 하나만 남깁니다.
/// 동점은 벡터 순위가 앞선 쪽, 그다음 키워드 순위 순서입니다.
pub fn rrf_fuse(
    dense: &[SearchResult],
    lexical: &[LexicalHit],
    weights: FusionWeights,
    limit: usize,
) -> Vec<RetrievedFragment> {
    struct Entry<'a> {
        fragment: &'a StoredFragment,
        score: f32,
        dense_rank: Option<usize>,
        lexical_rank: Option<usize>,
    }

    let mut entries: Vec<Entry> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for (rank, result) in dense.iter().enumerate() {
        if positions.contains_key(result.fragment.id.as_str()) {
            continue;
        }
        positions.insert(&result.fragment.id, entries.len());
        entries.push(Entry {
            fragment: &result.fragment,
            score: weights.dense / (RRF_K + rank as f32 + 1.0),
            dense_rank: Some(rank),
            lexical_rank: None,
        });
    }

    if weights.lexical > 0.0 {
        for (rank, hit) in lexical.iter().enumerate() {
            let score = weights.lexical / (RRF_K + rank as f32 + 1.0);
            match positions.get(hit.fragment.id.as_str()) {
                Some(&i) => {
                    let entry = &mut entries[i];
                    if entry.lexical_rank.is_none() {
                        entry.lexical_rank = Some(rank);
                        entry.score = entry.score.max(score);
                    }
                }
                None => {
                    positions.insert(&hit.fragment.id, entries.len());
                    entries.push(Entry {
                        fragment: &hit.fragment,
                        score,
                        dense_rank: None,
                        lexical_rank: Some(rank),
                    });
                }
            }
        }
    }

    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_key(a.dense_rank).cmp(&rank_key(b.dense_rank)))
            .then_with(|| rank_key(a.lexical_rank).cmp(&rank_key(b.lexical_rank)))
    });
    entries.truncate(limit);

    entries
        .into_iter()
        .map(|entry| RetrievedFragment {
            fragment: entry.fragment.clone(),
            score: entry.score,
            method: match (entry.dense_rank.is_some(), entry.lexical_rank.is_some()) {
                (true, true) => SearchMethod::Hybrid,
                (false, true) => SearchMethod::Lexical,
                _ => SearchMethod::Vector,
            },
        })
        .collect()
}

/// 순위 없음은 맨 뒤
fn rank_key(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}

/// 테넌트 조건을 통과하지 못한 결과 제거 (격리 결함으로 기록)
fn drop_foreign<T>(
    items: Vec<T>,
    filter: &FragmentFilter,
    fragment: impl Fn(&T) -> &StoredFragment,
    stage: &str,
) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| {
            let f = fragment(item);
            let ok = filter.matches(f);
            if !ok {
                tracing::error!(
                    "Isolation defect: {} result {} belongs to tenant {} (filter {:?})",
                    stage,
                    f.id,
                    f.tenant_id,
                    filter
                );
            }
            ok
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
