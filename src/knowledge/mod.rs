//! Knowledge 모듈 - 테넌트 격리 하이브리드 RAG
//!
//! - Chunker: 경계 인식 텍스트 분할 (dense / sparse)
//! - Vector: LanceDB 또는 메모리 벡터 저장소 + 테넌트 필터
//! - Lexical: SQLite FTS5 BM25 스냅샷
//! - Hybrid: 가중 RRF로 두 검색 결과 통합
//! - Synthesizer / Suggestions: 답변과 추천 질문 생성
//! - Sources / Service: 소스 라이프사이클과 코어 연산

mod chunker;
mod hybrid;
mod lance;
mod lexical;
pub(crate) mod memory;
mod service;
mod sources;
mod suggestions;
mod synthesizer;
mod tenant;
pub(crate) mod vector;

// Re-exports
pub use chunker::{sanitize_text, split, ChunkConfig, ChunkRegime, Chunker, RecursiveChunker};
pub use hybrid::{
    rrf_fuse, FusionWeights, HybridRetriever, Retrieval, RetrievedFragment, SearchMethod, RRF_K,
};
pub use lance::LanceVectorStore;
pub use lexical::{LexicalHit, LexicalIndex, LexicalSnapshot};
pub use memory::InMemoryVectorStore;
pub use service::{
    AnswerKind, AskResponse, IngestReport, KnowledgeService, RebuildReport, ServiceStats,
};
pub use sources::{
    NewSource, SourcePayload, SourceRecord, SourceRepository, SourceStatus, SourceType,
    SqliteSourceStore, DEFAULT_TEXT_TITLE,
};
pub use suggestions::{
    fallback_suggestions, SuggestionCache, SuggestionGenerator, FALLBACK_SUGGESTIONS,
};
pub use synthesizer::{AnswerSynthesizer, Synthesis, NO_INFORMATION_ANSWER};
pub use tenant::{TenantId, SHARED_TENANT};
pub use vector::{
    cosine_similarity, FragmentFilter, NewFragment, SearchResult, StoredFragment, VectorStore,
};
