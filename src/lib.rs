//! tenant-rag - 테넌트 격리 하이브리드 RAG 질의응답 엔진
//!
//! LanceDB 벡터 검색 + SQLite FTS5 키워드 검색을 가중 RRF로 결합하고,
//! 모든 검색을 테넌트 파티션(+ 공유 파티션 `tenant_all`)으로 제한합니다.

pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod knowledge;
pub mod llm;
pub mod scraper;

// Re-exports
pub use config::{get_data_dir, Settings};
pub use embedding::{
    EmbeddingGateway, EmbeddingProvider, GeminiEmbedding, HashEmbedding, get_api_key, has_api_key,
};
pub use error::{RagError, RagResult};
pub use extractor::{ContentExtractor, DefaultExtractor, ExtractedText};
pub use knowledge::{
    AnswerKind, AskResponse, ChunkRegime, KnowledgeService, SourcePayload, SourceRecord,
    SourceStatus, TenantId, SHARED_TENANT,
};
pub use llm::{CompletionProvider, GeminiCompletion};
pub use scraper::{ScrapedPage, WebScraper};
