//! Embedding Gateway - 배치 분할 + 타임아웃
//!
//! 프로바이더 호출을 배치 단위로 나누고 각 호출에 타임아웃을 겁니다.
//! 실패한 배치는 건너뛰고 기록만 남기며, 결과는 `EmbeddingOutcome`에
//! (입력 인덱스, 벡터) 쌍과 버려진 배치 목록으로 명시됩니다.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{RagError, RagResult};

use super::EmbeddingProvider;

// ============================================================================
// Types
// ============================================================================

/// 버려진 배치 기록
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedBatch {
    /// 입력에서의 시작 인덱스
    pub start: usize,
    /// 배치 길이
    pub len: usize,
    /// 실패 사유
    pub reason: String,
}

/// 배치 임베딩 결과
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutcome {
    /// (입력 인덱스, 벡터) - 입력 순서
    pub embedded: Vec<(usize, Vec<f32>)>,
    /// 버려진 배치
    pub dropped: Vec<DroppedBatch>,
}

impl EmbeddingOutcome {
    /// 버려진 배치가 없는지
    pub fn is_complete(&self) -> bool {
        self.dropped.is_empty()
    }

    /// 버려진 입력 개수
    pub fn dropped_count(&self) -> usize {
        self.dropped.iter().map(|d| d.len).sum()
    }
}

// ============================================================================
// EmbeddingGateway
// ============================================================================

/// 임베딩 게이트웨이
#[derive(Clone)]
pub struct EmbeddingGateway {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    timeout: Duration,
}

impl EmbeddingGateway {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, timeout: Duration) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    pub fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// 텍스트 목록 임베딩 (배치 단위)
    ///
    /// 실패/타임아웃/개수 불일치 배치는 건너뜁니다.
    pub async fn embed(&self, texts: &[String]) -> EmbeddingOutcome {
        let mut outcome = EmbeddingOutcome::default();
        let dimension = self.provider.dimension();

        for (batch_index, batch) in texts.chunks(self.batch_size).enumerate() {
            let start = batch_index * self.batch_size;
            tracing::debug!(
                "Embedding batch {} ({} texts, offset {})",
                batch_index + 1,
                batch.len(),
                start
            );

            let result = tokio::time::timeout(self.timeout, self.provider.embed_batch(batch)).await;

            let reason = match result {
                Err(_) => format!("timed out after {:?}", self.timeout),
                Ok(Err(e)) => e.to_string(),
                Ok(Ok(vectors)) if vectors.len() != batch.len() => format!(
                    "expected {} vectors, got {}",
                    batch.len(),
                    vectors.len()
                ),
                Ok(Ok(vectors)) if vectors.iter().any(|v| v.len() != dimension) => {
                    format!("vector dimension differs from {}", dimension)
                }
                Ok(Ok(vectors)) => {
                    outcome
                        .embedded
                        .extend(vectors.into_iter().enumerate().map(|(i, v)| (start + i, v)));
                    continue;
                }
            };

            tracing::warn!(
                "Dropped embedding batch at offset {} ({} texts): {}",
                start,
                batch.len(),
                reason
            );
            outcome.dropped.push(DroppedBatch {
                start,
                len: batch.len(),
                reason,
            });
        }

        outcome
    }

    /// 질문 하나 임베딩
    pub async fn embed_query(&self, text: &str) -> RagResult<Vec<f32>> {
        let vector = tokio::time::timeout(self.timeout, self.provider.embed(text))
            .await
            .map_err(|_| {
                RagError::upstream("embed_query", format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| RagError::upstream("embed_query", e))?;

        if vector.len() != self.provider.dimension() {
            return Err(RagError::upstream(
                "embed_query",
                format!(
                    "expected dimension {}, got {}",
                    self.provider.dimension(),
                    vector.len()
                ),
            ));
        }
        Ok(vector)
    }
}

// ============================================================================
// Tests
// ============================================================================
