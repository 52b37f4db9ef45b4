//! KnowledgeService - 테넌트 RAG 코어 연산
//!
//! 수집: 추출 → 청킹 → 임베딩 → 벡터 저장 → 키워드 스냅샷 재구축 → 추천 질문 갱신
//! 질의: 하이브리드 검색 → 답변 합성 → (답변, 출처, 추천 질문)
//!
//! 같은 테넌트의 쓰기(벡터 쓰기 + 추천 캐시 갱신)는 테넌트별 비동기 뮤텍스로
//! 직렬화되고, 다른 테넌트끼리는 서로 기다리지 않습니다.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use serde::Serialize;

use crate::config::Settings;
use crate::embedding::{create_embedder, EmbeddingGateway, EmbeddingProvider};
use crate::error::{RagError, RagResult};
use crate::extractor::{validate_payload, ContentExtractor, DefaultExtractor};
use crate::llm::{create_completion, CompletionProvider};

use super::chunker::{ChunkRegime, Chunker, RecursiveChunker};
use super::hybrid::{HybridRetriever, Retrieval};
use super::lance::LanceVectorStore;
use super::lexical::{LexicalIndex, LexicalSnapshot};
use super::sources::{
    NewSource, SourcePayload, SourceRecord, SourceRepository, SourceStatus, SqliteSourceStore,
};
use super::suggestions::{
    fallback_suggestions, SuggestionCache, SuggestionGenerator, MAX_SAMPLE_FRAGMENTS,
};
use super::synthesizer::{AnswerSynthesizer, NO_INFORMATION_ANSWER};
use super::tenant::TenantId;
use super::vector::{FragmentFilter, NewFragment, StoredFragment, VectorStore};

// ============================================================================
// Types
// ============================================================================

/// 답변 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerKind {
    /// 검색된 컨텍스트로 답변함
    Answered,
    /// 관련 콘텐츠 없음 (모델 호출 안 함)
    NoInformation,
    /// 처리 중 에러 (답변 본문에 원인 포함)
    Error,
}

/// 질의 응답
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub tenant_id: String,
    pub answer: String,
    /// 컨텍스트에 실제로 쓰인 소스 라벨 (중복 제거, 순위 순서)
    pub sources: Vec<String>,
    pub suggestions: Vec<String>,
    pub kind: AnswerKind,
}

/// 수집 결과
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source_id: String,
    pub fragments_indexed: usize,
    /// 임베딩 실패로 빠진 조각 수
    pub fragments_dropped: usize,
}

/// 테넌트 인덱스 재구축 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub sources_processed: usize,
    pub fragments_indexed: usize,
}

/// 서비스 통계
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub fragment_count: usize,
    pub source_count: usize,
    pub lexical_enabled: bool,
    pub lexical_version: u64,
    pub vector_store: String,
    pub embedding_provider: String,
    pub embedding_dimension: usize,
}

// ============================================================================
// KnowledgeService
// ============================================================================

/// 테넌트 격리 지식 서비스
pub struct KnowledgeService {
    settings: Settings,
    vectors: Arc<dyn VectorStore>,
    sources: Arc<dyn SourceRepository>,
    extractor: Arc<dyn ContentExtractor>,
    embedder: EmbeddingGateway,
    lexical: Arc<LexicalIndex>,
    retriever: HybridRetriever,
    synthesizer: AnswerSynthesizer,
    suggester: SuggestionGenerator,
    suggestion_cache: SuggestionCache,
    tenant_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KnowledgeService {
    /// 구성 요소를 직접 받아 생성
    pub fn new(
        settings: Settings,
        vectors: Arc<dyn VectorStore>,
        sources: Arc<dyn SourceRepository>,
        extractor: Arc<dyn ContentExtractor>,
        embedding: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
    ) -> Self {
        let embedder = EmbeddingGateway::new(
            embedding,
            settings.embedding_batch_size,
            settings.embedding_timeout(),
        );
        let lexical = Arc::new(LexicalIndex::new(settings.lexical_enabled));
        let retriever = HybridRetriever::new(
            Arc::clone(&vectors),
            Arc::clone(&lexical),
            embedder.clone(),
            settings.retrieval_k,
        );
        let synthesizer = AnswerSynthesizer::new(
            Arc::clone(&completion),
            settings.temperature,
            settings.max_context_chars,
            settings.llm_timeout(),
        );
        let suggester = SuggestionGenerator::new(
            completion,
            settings.suggestion_temperature,
            settings.llm_timeout(),
        );

        Self {
            settings,
            vectors,
            sources,
            extractor,
            embedder,
            lexical,
            retriever,
            synthesizer,
            suggester,
            suggestion_cache: SuggestionCache::new(),
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 설정으로 기본 구성(LanceDB + SQLite + Gemini) 열기
    pub async fn open(settings: Settings) -> RagResult<Self> {
        settings
            .validate()
            .map_err(|e| RagError::Validation(e.to_string()))?;

        std::fs::create_dir_all(&settings.data_dir).map_err(|e| {
            RagError::IndexUnavailable(format!(
                "cannot create data directory {}: {}",
                settings.data_dir.display(),
                e
            ))
        })?;

        let sources = SqliteSourceStore::open(&settings.sources_db_path())
            .map_err(|e| RagError::IndexUnavailable(format!("{:#}", e)))?;
        let vectors = LanceVectorStore::new(&settings.lance_path(), settings.embedding_dimension);
        let embedding = create_embedder(&settings)?;
        let completion = create_completion(&settings);
        let extractor = DefaultExtractor::new(settings.llm_timeout())?;

        let service = Self::new(
            settings,
            Arc::new(vectors),
            Arc::new(sources),
            Arc::new(extractor),
            embedding,
            completion,
        );
        service.warm_up().await?;
        Ok(service)
    }

    /// 시작 시 키워드 스냅샷 구축
    ///
    /// 벡터 인덱스를 처음 여는 지점이므로 실패하면 `IndexUnavailable`
    pub async fn warm_up(&self) -> RagResult<()> {
        self.refresh_lexical()
            .await
            .map_err(|e| RagError::IndexUnavailable(format!("{:#}", e)))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------------

    /// 텍스트를 테넌트 인덱스에 직접 수집 (소스 레코드 없이)
    pub async fn ingest(
        &self,
        tenant_id: &str,
        text: &str,
        label: &str,
        regime: ChunkRegime,
    ) -> RagResult<IngestReport> {
        let tenant = parse_tenant(tenant_id)?;
        if text.trim().is_empty() {
            return Err(RagError::Validation("text must not be empty".to_string()));
        }

        let source_id = uuid::Uuid::new_v4().to_string();
        let report = {
            let lock = self.tenant_lock(&tenant);
            let _guard = lock.lock().await;
            let report = self
                .index_text(&tenant, &source_id, label, text, regime)
                .await?;
            self.refresh_suggestions(&tenant).await;
            report
        };

        self.refresh_lexical_quietly().await;
        Ok(report)
    }

    /// 소스 수집 (pending → processing → completed | failed)
    pub async fn add_source(
        &self,
        tenant_id: &str,
        payload: SourcePayload,
        regime: ChunkRegime,
    ) -> RagResult<SourceRecord> {
        let tenant = parse_tenant(tenant_id)?;
        validate_payload(&payload).map_err(RagError::Validation)?;

        let new_source = NewSource::from_payload(tenant.as_str(), &payload).with_regime(regime);
        let record = self.sources.create_source(new_source)?;
        self.transition(&record.source_id, SourceStatus::Pending, SourceStatus::Processing, None)?;

        tracing::info!(
            "Processing {} source {} for tenant {}",
            record.source_type,
            record.source_id,
            tenant
        );

        match self.process_source(&tenant, &record, &payload).await {
            Ok(report) => {
                tracing::info!(
                    "Source {} completed: {} fragments",
                    record.source_id,
                    report.fragments_indexed
                );
            }
            Err(e) => {
                tracing::warn!("Source {} failed: {}", record.source_id, e);
                self.transition(
                    &record.source_id,
                    SourceStatus::Processing,
                    SourceStatus::Failed,
                    Some(&e.to_string()),
                )?;
                return Err(e);
            }
        }

        self.refresh_lexical_quietly().await;
        self.require_source(&tenant, &record.source_id)
    }

    /// 새 내용으로 소스 교체
    ///
    /// 새 소스가 completed 된 뒤에만 이전 소스와 조각을 지웁니다.
    pub async fn replace_source(
        &self,
        tenant_id: &str,
        old_source_id: &str,
        payload: SourcePayload,
        regime: ChunkRegime,
    ) -> RagResult<SourceRecord> {
        let tenant = parse_tenant(tenant_id)?;
        self.require_source(&tenant, old_source_id)?;

        let replacement = self.add_source(tenant.as_str(), payload, regime).await?;
        self.delete_source(tenant.as_str(), old_source_id).await?;

        tracing::info!(
            "Replaced source {} with {} for tenant {}",
            old_source_id,
            replacement.source_id,
            tenant
        );
        Ok(replacement)
    }

    /// 소스와 그 조각 삭제. 지운 조각 수 반환
    pub async fn delete_source(&self, tenant_id: &str, source_id: &str) -> RagResult<usize> {
        let tenant = parse_tenant(tenant_id)?;
        self.require_source(&tenant, source_id)?;

        let removed = {
            let lock = self.tenant_lock(&tenant);
            let _guard = lock.lock().await;

            let removed = self
                .vectors
                .delete(&FragmentFilter::Source {
                    tenant_id: tenant.to_string(),
                    source_id: source_id.to_string(),
                })
                .await?;
            self.sources.delete_source(source_id)?;
            self.suggestion_cache.invalidate(tenant.as_str());
            removed
        };

        tracing::info!(
            "Deleted source {} ({} fragments) for tenant {}",
            source_id,
            removed,
            tenant
        );
        self.refresh_lexical_quietly().await;
        Ok(removed)
    }

    pub fn list_sources(&self, tenant_id: &str) -> RagResult<Vec<SourceRecord>> {
        let tenant = parse_tenant(tenant_id)?;
        Ok(self.sources.list_sources(tenant.as_str())?)
    }

    // ------------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------------

    /// 질문에 답변
    ///
    /// 검증 실패만 `Err`로 돌려주고, 이후 단계의 실패는 `AnswerKind::Error` 답변이 됩니다.
    pub async fn ask(&self, tenant_id: &str, question: &str) -> RagResult<AskResponse> {
        let tenant = parse_tenant(tenant_id)?;
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::Validation("question must not be empty".to_string()));
        }

        let (answer, sources, kind) = match self.answer(&tenant, question).await {
            Ok(Some((answer, sources))) => (answer, sources, AnswerKind::Answered),
            Ok(None) => (NO_INFORMATION_ANSWER.to_string(), vec![], AnswerKind::NoInformation),
            Err(e) => {
                tracing::error!("Question failed for tenant {}: {}", tenant, e);
                (
                    format!("Error processing question: {}", e),
                    vec![],
                    AnswerKind::Error,
                )
            }
        };

        let suggestions = match self.tenant_suggestions(&tenant).await {
            Ok(suggestions) => suggestions,
            Err(e) => {
                tracing::warn!("Suggestions unavailable for tenant {}: {}", tenant, e);
                fallback_suggestions()
            }
        };

        Ok(AskResponse {
            tenant_id: tenant.to_string(),
            answer,
            sources,
            suggestions,
            kind,
        })
    }

    /// 테넌트 추천 질문 (캐시에 없으면 생성)
    pub async fn suggestions(&self, tenant_id: &str) -> RagResult<Vec<String>> {
        let tenant = parse_tenant(tenant_id)?;
        self.tenant_suggestions(&tenant).await
    }

    /// 테넌트 파티션의 조각 수 (공유 파티션 제외)
    pub async fn document_count(&self, tenant_id: &str) -> RagResult<usize> {
        let tenant = parse_tenant(tenant_id)?;
        Ok(self
            .vectors
            .count(&FragmentFilter::Tenant(tenant.to_string()))
            .await?)
    }

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// 테넌트 조각 전체 삭제 (소스 레코드는 유지). 지운 조각 수 반환
    pub async fn clear_tenant(&self, tenant_id: &str) -> RagResult<usize> {
        let tenant = parse_tenant(tenant_id)?;

        let removed = {
            let lock = self.tenant_lock(&tenant);
            let _guard = lock.lock().await;
            let removed = self
                .vectors
                .delete(&FragmentFilter::Tenant(tenant.to_string()))
                .await?;
            self.suggestion_cache.invalidate(tenant.as_str());
            removed
        };

        tracing::info!("Cleared {} fragments for tenant {}", removed, tenant);
        self.refresh_lexical_quietly().await;
        Ok(removed)
    }

    /// 테넌트 인덱스를 completed 소스의 저장된 본문으로 다시 구축
    ///
    /// 모든 소스를 수집 때의 청킹 방식으로 다시 임베딩한 뒤에만 기존 조각을 지웁니다.
    /// 하나라도 실패하면 인덱스는 그대로 두고 에러를 돌려줍니다.
    /// completed 소스가 없으면 아무것도 지우지 않습니다.
    pub async fn rebuild_tenant_index(&self, tenant_id: &str) -> RagResult<RebuildReport> {
        let tenant = parse_tenant(tenant_id)?;

        let report = {
            let lock = self.tenant_lock(&tenant);
            let _guard = lock.lock().await;

            // 락 안에서 조회해야 진행 중인 수집이 끝난 뒤의 목록을 봄
            let completed = self.sources.list_completed_sources(tenant.as_str())?;

            let mut staged: Vec<NewFragment> = Vec::new();
            let mut sources_processed = 0;
            for source in &completed {
                let Some(content) = source.content.as_deref().filter(|c| !c.trim().is_empty())
                else {
                    tracing::warn!("Source {} has no stored content, skipping", source.source_id);
                    continue;
                };

                let prepared = self
                    .prepare_fragments(
                        &tenant,
                        &source.source_id,
                        &source.label(),
                        content,
                        source.chunk_regime,
                    )
                    .await
                    .and_then(|prepared| {
                        if prepared.dropped > 0 {
                            return Err(RagError::upstream(
                                "embed",
                                format!(
                                    "{} fragments of {} could not be embedded",
                                    prepared.dropped,
                                    source.label()
                                ),
                            ));
                        }
                        Ok(prepared)
                    })
                    .inspect_err(|e| {
                        tracing::warn!(
                            "Rebuild of tenant {} aborted at source {}, index left as is: {}",
                            tenant,
                            source.source_id,
                            e
                        );
                    })?;
                staged.extend(prepared.fragments);
                sources_processed += 1;
            }

            if sources_processed == 0 {
                tracing::info!("Tenant {} has no completed sources to rebuild from", tenant);
                return Ok(RebuildReport {
                    sources_processed: 0,
                    fragments_indexed: 0,
                });
            }

            self.vectors
                .delete(&FragmentFilter::Tenant(tenant.to_string()))
                .await?;
            let ids = self.vectors.upsert(&staged).await?;
            self.refresh_suggestions(&tenant).await;

            RebuildReport {
                sources_processed,
                fragments_indexed: ids.len(),
            }
        };

        tracing::info!(
            "Rebuilt tenant {}: {} sources, {} fragments",
            tenant,
            report.sources_processed,
            report.fragments_indexed
        );
        self.refresh_lexical_quietly().await;
        Ok(report)
    }

    /// 벡터 인덱스 전체 초기화 (디스크 구조 삭제 후 다음 사용 시 재생성)
    pub async fn reset_index(&self) -> RagResult<()> {
        self.vectors.reset().await?;
        self.suggestion_cache.clear();
        self.refresh_lexical().await?;
        tracing::info!("Vector index reset");
        Ok(())
    }

    pub async fn stats(&self) -> RagResult<ServiceStats> {
        Ok(ServiceStats {
            fragment_count: self.vectors.count(&FragmentFilter::All).await?,
            source_count: self.sources.count_sources(None)?,
            lexical_enabled: self.lexical.is_enabled(),
            lexical_version: self.lexical.version(),
            vector_store: self.vectors.name().to_string(),
            embedding_provider: self.embedder.provider_name().to_string(),
            embedding_dimension: self.embedder.dimension(),
        })
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// 검색 + 합성. 관련 콘텐츠가 없으면 None
    async fn answer(
        &self,
        tenant: &TenantId,
        question: &str,
    ) -> RagResult<Option<(String, Vec<String>)>> {
        let fragments: Vec<StoredFragment> = match self.retriever.retrieve(tenant, question).await? {
            Retrieval::NoRelevantContent => return Ok(None),
            Retrieval::Found(hits) => hits.into_iter().map(|hit| hit.fragment).collect(),
        };

        let synthesis = self.synthesizer.synthesize(question, &fragments).await?;

        let mut sources: Vec<String> = Vec::new();
        for fragment in &synthesis.used {
            if !sources.contains(&fragment.source_label) {
                sources.push(fragment.source_label.clone());
            }
        }
        Ok(Some((synthesis.answer, sources)))
    }

    /// 추출 → 본문 저장 → 인덱싱 → 추천 갱신 → completed 전이
    ///
    /// completed 전이는 테넌트 락 안에서 하므로, 재구축은 조각이 다 들어간
    /// 소스만 completed로 봅니다.
    async fn process_source(
        &self,
        tenant: &TenantId,
        record: &SourceRecord,
        payload: &SourcePayload,
    ) -> RagResult<IngestReport> {
        let extracted = self
            .extractor
            .extract(payload)
            .await
            .map_err(|e| RagError::upstream("extract", format!("{:#}", e)))?;

        if extracted.text.trim().is_empty() {
            return Err(RagError::Validation(format!(
                "no text extracted from {}",
                record.label()
            )));
        }
        self.sources.set_source_content(
            &record.source_id,
            &extracted.text,
            extracted.title.as_deref(),
        )?;

        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;
        let report = self
            .index_text(
                tenant,
                &record.source_id,
                &record.label(),
                &extracted.text,
                record.chunk_regime,
            )
            .await?;
        self.refresh_suggestions(tenant).await;
        self.transition(
            &record.source_id,
            SourceStatus::Processing,
            SourceStatus::Completed,
            None,
        )?;
        Ok(report)
    }

    /// 청킹 → 임베딩 → upsert (호출자가 테넌트 락을 잡고 있어야 함)
    async fn index_text(
        &self,
        tenant: &TenantId,
        source_id: &str,
        label: &str,
        text: &str,
        regime: ChunkRegime,
    ) -> RagResult<IngestReport> {
        let prepared = self
            .prepare_fragments(tenant, source_id, label, text, regime)
            .await?;

        let ids = self.vectors.upsert(&prepared.fragments).await?;
        tracing::info!(
            "Indexed {} fragments from {} for tenant {}",
            ids.len(),
            label,
            tenant
        );

        Ok(IngestReport {
            source_id: source_id.to_string(),
            fragments_indexed: ids.len(),
            fragments_dropped: prepared.dropped,
        })
    }

    /// 청킹 → 임베딩. 저장소는 건드리지 않음
    async fn prepare_fragments(
        &self,
        tenant: &TenantId,
        source_id: &str,
        label: &str,
        text: &str,
        regime: ChunkRegime,
    ) -> RagResult<PreparedFragments> {
        let config = match regime {
            ChunkRegime::Dense => self.settings.dense_chunking(),
            ChunkRegime::Sparse => self.settings.sparse_chunking(),
        };
        let chunks = RecursiveChunker::new(config).chunk(text);
        if chunks.is_empty() {
            return Err(RagError::Validation(format!("no content to index in {}", label)));
        }

        let outcome = self.embedder.embed(&chunks).await;
        if outcome.embedded.is_empty() {
            let reasons: Vec<String> = outcome.dropped.iter().map(|d| d.reason.clone()).collect();
            return Err(RagError::upstream(
                "embed",
                format!(
                    "all {} embedding batches failed: {}",
                    outcome.dropped.len(),
                    reasons.join("; ")
                ),
            ));
        }
        let dropped = outcome.dropped_count();
        if dropped > 0 {
            tracing::warn!(
                "{} of {} fragments from {} dropped during embedding",
                dropped,
                chunks.len(),
                label
            );
        }

        let fragments = outcome
            .embedded
            .into_iter()
            .map(|(index, vector)| NewFragment {
                tenant_id: tenant.to_string(),
                source_id: source_id.to_string(),
                source_label: label.to_string(),
                ordinal: index as u32,
                text: chunks[index].clone(),
                vector,
            })
            .collect();

        Ok(PreparedFragments { fragments, dropped })
    }

    /// 캐시 조회, 없으면 생성 후 저장 (그 사이 무효화됐으면 저장 안 함)
    async fn tenant_suggestions(&self, tenant: &TenantId) -> RagResult<Vec<String>> {
        if let Some(cached) = self.suggestion_cache.get(tenant.as_str()) {
            return Ok(cached.as_ref().clone());
        }

        // 샘플을 읽기 전의 세대. 생성 중에 새 콘텐츠가 들어오면 결과를 저장하지 않음
        let generation = self.suggestion_cache.generation(tenant.as_str());
        let sample = self
            .vectors
            .fragments(
                &FragmentFilter::Tenant(tenant.to_string()),
                Some(MAX_SAMPLE_FRAGMENTS),
            )
            .await?;
        let suggestions = self.suggester.generate(&sample).await?;
        Ok(self
            .suggestion_cache
            .put_if_current(tenant.as_str(), generation, suggestions)
            .as_ref()
            .clone())
    }

    /// 수집 후 추천 질문 갱신 (실패해도 수집은 성공)
    async fn refresh_suggestions(&self, tenant: &TenantId) {
        self.suggestion_cache.invalidate(tenant.as_str());
        if let Err(e) = self.tenant_suggestions(tenant).await {
            tracing::warn!(
                "Suggestion refresh failed for tenant {}, will retry lazily: {}",
                tenant,
                e
            );
            self.suggestion_cache.invalidate(tenant.as_str());
        }
    }

    /// 전체 코퍼스로 키워드 스냅샷 재구축
    ///
    /// 버전은 코퍼스를 읽기 전에 발급받으므로, 늦게 끝난 오래된 재구축은 설치되지 않습니다.
    async fn refresh_lexical(&self) -> anyhow::Result<()> {
        if !self.lexical.is_enabled() {
            return Ok(());
        }

        let version = self.lexical.next_version();
        let corpus = self.vectors.fragments(&FragmentFilter::All, None).await?;
        let snapshot =
            tokio::task::spawn_blocking(move || LexicalSnapshot::build(version, corpus))
                .await
                .context("Lexical rebuild task failed")??;

        self.lexical.install(Arc::new(snapshot))?;
        Ok(())
    }

    async fn refresh_lexical_quietly(&self) {
        if let Err(e) = self.refresh_lexical().await {
            tracing::warn!("Lexical index rebuild failed, keeping previous snapshot: {:#}", e);
        }
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .tenant_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(tenant.to_string()).or_default())
    }

    /// 상태 전이 (현재 상태가 `from`일 때만)
    fn transition(
        &self,
        source_id: &str,
        from: SourceStatus,
        to: SourceStatus,
        error_message: Option<&str>,
    ) -> RagResult<()> {
        if !from.can_transition_to(to) {
            return Err(RagError::InvalidTransition { from, to });
        }
        if self
            .sources
            .update_source_status(source_id, from, to, error_message)?
        {
            return Ok(());
        }

        match self.sources.get_source(source_id)? {
            Some(current) => Err(RagError::InvalidTransition {
                from: current.status,
                to,
            }),
            None => Err(RagError::NotFound(format!("source {}", source_id))),
        }
    }

    /// 테넌트 소유 소스 조회 (다른 테넌트 소스는 없는 것으로 취급)
    fn require_source(&self, tenant: &TenantId, source_id: &str) -> RagResult<SourceRecord> {
        self.sources
            .get_source(source_id)?
            .filter(|record| record.tenant_id == tenant.as_str())
            .ok_or_else(|| RagError::NotFound(format!("source {}", source_id)))
    }
}

/// 임베딩까지 끝난 저장 전 조각
struct PreparedFragments {
    fragments: Vec<NewFragment>,
    dropped: usize,
}

fn parse_tenant(raw: &str) -> RagResult<TenantId> {
    TenantId::parse(raw).map_err(RagError::Validation)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedding;
    use crate::extractor::ExtractedText;
    use crate::knowledge::memory::InMemoryVectorStore;
    use crate::knowledge::SHARED_TENANT;
    use crate::llm::testing::ScriptedCompletion;
    use crate::llm::CompletionRequest;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    const SUGGESTION_REPLY: &str = "What is the refund window?\nHow do I contact support?\nIs shipping free?";

    /// 답변 요청과 추천 질문 요청을 구분해서 응답하는 프로바이더
    struct RoutingCompletion {
        answers: ScriptedCompletion,
    }

    impl RoutingCompletion {
        fn new(answer: &str) -> Self {
            Self {
                answers: ScriptedCompletion::always(answer),
            }
        }

        fn answer_prompts(&self) -> Vec<String> {
            self.answers
                .requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.prompt.clone())
                .collect()
        }
    }

    #[async_trait]
    impl CompletionProvider for RoutingCompletion {
        async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
            if request.prompt.contains("Questions:") {
                Ok(SUGGESTION_REPLY.to_string())
            } else {
                self.answers.complete(request).await
            }
        }

        fn name(&self) -> &str {
            "routing"
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl ContentExtractor for FailingExtractor {
        async fn extract(&self, _payload: &SourcePayload) -> anyhow::Result<ExtractedText> {
            anyhow::bail!("connection refused")
        }
    }

    /// 제목을 붙여 돌려주는 추출기
    struct TitledExtractor;

    #[async_trait]
    impl ContentExtractor for TitledExtractor {
        async fn extract(&self, _payload: &SourcePayload) -> anyhow::Result<ExtractedText> {
            Ok(ExtractedText {
                text: "Acme answers questions about orders and refunds.".to_string(),
                title: Some("Acme FAQ".to_string()),
            })
        }
    }

    /// 도중에 장애를 켤 수 있는 임베딩
    struct SwitchableEmbedding {
        inner: HashEmbedding,
        failing: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for SwitchableEmbedding {
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("embedding service unavailable");
            }
            self.inner.embed_batch(texts).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn name(&self) -> &str {
            "switchable"
        }
    }

    /// 이전 콘텐츠로 만든 추천 질문은 늦게, 새 콘텐츠로 만든 것은 바로 응답
    struct SlowOldSuggestions;

    #[async_trait]
    impl CompletionProvider for SlowOldSuggestions {
        async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
            if request.prompt.contains("Newcontent") {
                return Ok("New1?\nNew2?\nNew3?".to_string());
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok("Old1?\nOld2?\nOld3?".to_string())
        }

        fn name(&self) -> &str {
            "slow-old"
        }
    }

    fn build_service(
        completion: Arc<dyn CompletionProvider>,
        extractor: Arc<dyn ContentExtractor>,
        embedding: Arc<dyn EmbeddingProvider>,
    ) -> KnowledgeService {
        let settings = Settings {
            embedding_dimension: 128,
            llm_timeout_secs: 5,
            embedding_timeout_secs: 5,
            ..Settings::default()
        };
        KnowledgeService::new(
            settings,
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(SqliteSourceStore::open_in_memory().unwrap()),
            extractor,
            embedding,
            completion,
        )
    }

    fn service_with(
        completion: Arc<dyn CompletionProvider>,
        extractor: Arc<dyn ContentExtractor>,
    ) -> KnowledgeService {
        build_service(completion, extractor, Arc::new(HashEmbedding::new(128)))
    }

    fn service(completion: Arc<dyn CompletionProvider>) -> KnowledgeService {
        service_with(
            completion,
            Arc::new(DefaultExtractor::new(Duration::from_secs(5)).unwrap()),
        )
    }

    fn text(title: &str, body: &str) -> SourcePayload {
        SourcePayload::Text {
            title: Some(title.to_string()),
            text: body.to_string(),
        }
    }

    #[tokio::test]
    async fn test_faq_isolation_between_tenants() {
        let completion = Arc::new(RoutingCompletion::new("Refunds within 30 days."));
        let svc = service(completion.clone());

        svc.add_source(
            "acme",
            text("faq", "Acme refunds are accepted within 30 days of purchase."),
            ChunkRegime::Dense,
        )
        .await
        .unwrap();
        svc.add_source(
            "beta",
            text("faq", "Beta never refunds orders once they have shipped."),
            ChunkRegime::Dense,
        )
        .await
        .unwrap();

        let response = svc.ask("acme", "What is the refund policy?").await.unwrap();
        assert_eq!(response.kind, AnswerKind::Answered);
        assert_eq!(response.sources, vec!["faq"]);

        let prompts = completion.answer_prompts();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Acme refunds"));
        assert!(!prompts[0].contains("Beta never refunds"));
    }

    #[tokio::test]
    async fn test_ingest_then_ask_returns_sources() {
        let completion = Arc::new(RoutingCompletion::new("Support is open on weekdays."));
        let svc = service(completion);

        let report = svc
            .ingest(
                "acme",
                "Support is open Monday to Friday from 9 to 5.",
                "hours.md",
                ChunkRegime::Dense,
            )
            .await
            .unwrap();
        assert_eq!(report.fragments_indexed, 1);
        assert_eq!(report.fragments_dropped, 0);

        let response = svc.ask("acme", "When is support open?").await.unwrap();
        assert_eq!(response.answer, "Support is open on weekdays.");
        assert_eq!(response.sources, vec!["hours.md"]);
        assert_eq!(response.suggestions.len(), 3);
    }

    #[tokio::test]
    async fn test_clear_tenant_leaves_no_information() {
        let completion = Arc::new(RoutingCompletion::new("unused"));
        let svc = service(completion.clone());

        svc.ingest("acme", "Shipping is free over $50.", "shipping", ChunkRegime::Dense)
            .await
            .unwrap();
        assert_eq!(svc.document_count("acme").await.unwrap(), 1);

        assert_eq!(svc.clear_tenant("acme").await.unwrap(), 1);
        assert_eq!(svc.document_count("acme").await.unwrap(), 0);

        let response = svc.ask("acme", "Is shipping free?").await.unwrap();
        assert_eq!(response.kind, AnswerKind::NoInformation);
        assert_eq!(response.answer, NO_INFORMATION_ANSWER);
        assert!(response.sources.is_empty());
        assert_eq!(response.suggestions, fallback_suggestions());
        assert!(completion.answer_prompts().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_is_repeatable() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));
        let long_text = "Returns are accepted within 30 days. ".repeat(60);

        svc.add_source("acme", text("returns", &long_text), ChunkRegime::Dense)
            .await
            .unwrap();
        svc.add_source("acme", text("hours", "Open 9 to 5."), ChunkRegime::Dense)
            .await
            .unwrap();
        let before = svc.document_count("acme").await.unwrap();

        let first = svc.rebuild_tenant_index("acme").await.unwrap();
        let after_first = svc.document_count("acme").await.unwrap();
        let second = svc.rebuild_tenant_index("acme").await.unwrap();
        let after_second = svc.document_count("acme").await.unwrap();

        assert_eq!(first.sources_processed, 2);
        assert_eq!(first, second);
        assert_eq!(before, after_first);
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn test_empty_tenant_gets_fallback_suggestions() {
        let svc = service(Arc::new(RoutingCompletion::new("unused")));
        assert_eq!(svc.suggestions("gamma").await.unwrap(), fallback_suggestions());
    }

    #[tokio::test]
    async fn test_failed_extraction_marks_source_failed() {
        let svc = service_with(
            Arc::new(RoutingCompletion::new("unused")),
            Arc::new(FailingExtractor),
        );

        let err = svc
            .add_source(
                "acme",
                SourcePayload::Url {
                    url: "https://acme.test/faq".to_string(),
                },
                ChunkRegime::Dense,
            )
            .await
            .unwrap_err();
        assert!(err.is_upstream());

        let sources = svc.list_sources("acme").unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].status, SourceStatus::Failed);
        assert!(sources[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("connection refused"));

        let rebuilt = svc.rebuild_tenant_index("acme").await.unwrap();
        assert_eq!(rebuilt.sources_processed, 0);
    }

    #[tokio::test]
    async fn test_replace_and_delete_source() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));

        let old = svc
            .add_source("acme", text("policy", "Old policy text."), ChunkRegime::Dense)
            .await
            .unwrap();
        let new = svc
            .replace_source(
                "acme",
                &old.source_id,
                text("policy", "New policy text."),
                ChunkRegime::Dense,
            )
            .await
            .unwrap();

        let sources = svc.list_sources("acme").unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source_id, new.source_id);
        assert_eq!(sources[0].status, SourceStatus::Completed);
        assert_eq!(svc.document_count("acme").await.unwrap(), 1);

        // 다른 테넌트는 지울 수 없음
        assert!(matches!(
            svc.delete_source("beta", &new.source_id).await,
            Err(RagError::NotFound(_))
        ));

        assert_eq!(svc.delete_source("acme", &new.source_id).await.unwrap(), 1);
        assert_eq!(svc.document_count("acme").await.unwrap(), 0);
        assert!(svc.list_sources("acme").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shared_partition_is_visible_but_not_counted() {
        let svc = service(Arc::new(RoutingCompletion::new("Privacy applies to all.")));

        svc.ingest(
            SHARED_TENANT,
            "The privacy policy covers every customer.",
            "privacy",
            ChunkRegime::Dense,
        )
        .await
        .unwrap();

        assert_eq!(svc.document_count("acme").await.unwrap(), 0);
        let response = svc.ask("acme", "What does the privacy policy cover?").await.unwrap();
        assert_eq!(response.sources, vec!["privacy"]);
    }

    #[tokio::test]
    async fn test_upstream_failure_becomes_error_answer() {
        let svc = service(Arc::new(ScriptedCompletion::failing("model overloaded")));

        svc.ingest("acme", "Refunds take 5 days.", "refunds", ChunkRegime::Dense)
            .await
            .unwrap();

        let response = svc.ask("acme", "How long do refunds take?").await.unwrap();
        assert_eq!(response.kind, AnswerKind::Error);
        assert!(response.answer.starts_with("Error processing question:"));
        assert_eq!(response.suggestions, fallback_suggestions());
    }

    #[tokio::test]
    async fn test_validation_rejected_before_indexing() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));

        assert!(matches!(
            svc.ask("acme", "   ").await,
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            svc.ingest("bad tenant!", "text", "label", ChunkRegime::Dense).await,
            Err(RagError::Validation(_))
        ));
        assert!(matches!(
            svc.add_source(
                "acme",
                SourcePayload::Url {
                    url: "ftp://acme.test".to_string()
                },
                ChunkRegime::Dense
            )
            .await,
            Err(RagError::Validation(_))
        ));
        assert!(svc.list_sources("acme").unwrap().is_empty());
        assert_eq!(svc.stats().await.unwrap().fragment_count, 0);
    }

    #[tokio::test]
    async fn test_reset_index_and_stats() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));
        svc.add_source("acme", text("a", "Alpha text."), ChunkRegime::Sparse)
            .await
            .unwrap();

        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.fragment_count, 1);
        assert_eq!(stats.source_count, 1);
        assert!(stats.lexical_version > 0);
        assert_eq!(stats.embedding_provider, "hash");

        svc.reset_index().await.unwrap();
        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.fragment_count, 0);
        assert_eq!(stats.source_count, 1);
    }

    #[tokio::test]
    async fn test_other_tenant_gets_no_information() {
        let completion = Arc::new(RoutingCompletion::new("unused"));
        let svc = service(completion.clone());

        svc.add_source(
            "acme",
            text("faq", "Acme refunds are accepted within 30 days of purchase."),
            ChunkRegime::Dense,
        )
        .await
        .unwrap();

        let response = svc.ask("beta", "What is the refund policy?").await.unwrap();
        assert_eq!(response.kind, AnswerKind::NoInformation);
        assert_eq!(response.answer, NO_INFORMATION_ANSWER);
        assert!(response.sources.is_empty());
        assert!(completion.answer_prompts().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_keeps_index_when_embedding_fails() {
        let embedding = Arc::new(SwitchableEmbedding {
            inner: HashEmbedding::new(128),
            failing: AtomicBool::new(false),
        });
        let svc = build_service(
            Arc::new(RoutingCompletion::new("Refunds within 30 days.")),
            Arc::new(DefaultExtractor::new(Duration::from_secs(5)).unwrap()),
            embedding.clone(),
        );

        svc.add_source("acme", text("faq", "Refunds within 30 days."), ChunkRegime::Dense)
            .await
            .unwrap();
        svc.add_source("acme", text("hours", "Open 9 to 5."), ChunkRegime::Dense)
            .await
            .unwrap();
        let before = svc.document_count("acme").await.unwrap();
        assert_eq!(before, 2);

        embedding.failing.store(true, Ordering::SeqCst);
        let err = svc.rebuild_tenant_index("acme").await.unwrap_err();
        assert!(err.is_upstream());
        assert_eq!(svc.document_count("acme").await.unwrap(), before);

        // 장애가 끝나면 같은 결과로 재구축
        embedding.failing.store(false, Ordering::SeqCst);
        let report = svc.rebuild_tenant_index("acme").await.unwrap();
        assert_eq!(report.sources_processed, 2);
        assert_eq!(svc.document_count("acme").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_rebuild_without_completed_sources_keeps_direct_ingest() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));

        svc.ingest("acme", "Shipping is free over $50.", "shipping", ChunkRegime::Dense)
            .await
            .unwrap();

        let report = svc.rebuild_tenant_index("acme").await.unwrap();
        assert_eq!(
            report,
            RebuildReport {
                sources_processed: 0,
                fragments_indexed: 0,
            }
        );
        assert_eq!(svc.document_count("acme").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rebuild_reuses_ingest_regime() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));
        let long_text = "Returns are accepted within 30 days. ".repeat(60);

        svc.add_source("acme", text("returns", &long_text), ChunkRegime::Sparse)
            .await
            .unwrap();
        let before = svc.document_count("acme").await.unwrap();
        let dense = RecursiveChunker::new(svc.settings().dense_chunking())
            .chunk(&long_text)
            .len();
        assert_ne!(before, dense);

        let report = svc.rebuild_tenant_index("acme").await.unwrap();
        assert_eq!(report.fragments_indexed, before);
        assert_eq!(svc.document_count("acme").await.unwrap(), before);

        let sources = svc.list_sources("acme").unwrap();
        assert_eq!(sources[0].chunk_regime, ChunkRegime::Sparse);
    }

    #[tokio::test]
    async fn test_rebuild_during_ingest_keeps_new_source() {
        let svc = service(Arc::new(RoutingCompletion::new("ok")));
        svc.add_source("acme", text("hours", "Open 9 to 5."), ChunkRegime::Dense)
            .await
            .unwrap();

        let (added, rebuilt) = tokio::join!(
            svc.add_source(
                "acme",
                text("shipping", "Shipping is free over $50."),
                ChunkRegime::Dense
            ),
            svc.rebuild_tenant_index("acme"),
        );
        added.unwrap();
        rebuilt.unwrap();

        assert_eq!(svc.document_count("acme").await.unwrap(), 2);
        let report = svc.rebuild_tenant_index("acme").await.unwrap();
        assert_eq!(report.sources_processed, 2);
    }

    #[tokio::test]
    async fn test_slow_suggestions_do_not_overwrite_newer_ones() {
        let svc = service(Arc::new(SlowOldSuggestions));

        svc.ingest("acme", "Old policy text.", "old", ChunkRegime::Dense)
            .await
            .unwrap();
        svc.suggestion_cache.invalidate("acme");

        let (slow, _) = tokio::join!(svc.suggestions("acme"), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            svc.ingest("acme", "Newcontent: policy updated.", "new", ChunkRegime::Dense)
                .await
                .unwrap();
        });
        assert_eq!(slow.unwrap()[0], "Old1?");

        let cached = svc.suggestion_cache.get("acme").unwrap();
        assert_eq!(cached[0], "New1?");
        assert_eq!(svc.suggestions("acme").await.unwrap()[0], "New1?");
    }

    #[tokio::test]
    async fn test_extracted_title_is_kept_on_source() {
        let svc = service_with(
            Arc::new(RoutingCompletion::new("ok")),
            Arc::new(TitledExtractor),
        );

        let record = svc
            .add_source(
                "acme",
                SourcePayload::Url {
                    url: "https://acme.test/faq".to_string(),
                },
                ChunkRegime::Dense,
            )
            .await
            .unwrap();
        assert_eq!(record.status, SourceStatus::Completed);
        assert_eq!(record.title.as_deref(), Some("Acme FAQ"));
        assert_eq!(record.label(), "https://acme.test/faq");
    }
}
