//! 설정 모듈
//!
//! 기본값 위에 `TENANT_RAG_*` 환경변수를 덮어써서 런타임 설정을 만듭니다.
//! 데이터 저장 위치: ~/.tenant-rag/ (OS별 로컬 데이터 디렉토리)

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::knowledge::ChunkConfig;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.tenant-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tenant-rag")
}

// ============================================================================
// Settings
// ============================================================================

/// 임베딩 프로바이더 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Gemini 임베딩 API
    Gemini,
    /// 결정적 해시 임베딩 (오프라인)
    Hash,
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "hash" => Ok(Self::Hash),
            other => anyhow::bail!("Unknown embedding backend: {} (gemini | hash)", other),
        }
    }
}

/// 런타임 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// 데이터 디렉토리 (sources.db, fragments.lance)
    pub data_dir: PathBuf,
    /// 임베딩 백엔드
    pub embedding_backend: EmbeddingBackend,
    /// 임베딩 차원
    pub embedding_dimension: usize,
    /// 임베딩 배치 크기 (호출당 최대 텍스트 수)
    pub embedding_batch_size: usize,
    /// 채팅 모델 이름
    pub chat_model: String,
    /// 답변 생성 temperature
    pub temperature: f32,
    /// 추천 질문 생성 temperature
    pub suggestion_temperature: f32,
    /// dense 청크 크기 / 오버랩 (문자 수)
    pub dense_chunk_size: usize,
    pub dense_chunk_overlap: usize,
    /// sparse 청크 크기 / 오버랩 (문자 수)
    pub sparse_chunk_size: usize,
    pub sparse_chunk_overlap: usize,
    /// 검색 결과 개수 (k)
    pub retrieval_k: usize,
    /// 컨텍스트 최대 문자 수
    pub max_context_chars: usize,
    /// 키워드(BM25) 검색 사용 여부
    pub lexical_enabled: bool,
    /// 임베딩 호출 타임아웃 (초)
    pub embedding_timeout_secs: u64,
    /// LLM 호출 타임아웃 (초)
    pub llm_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            embedding_backend: EmbeddingBackend::Gemini,
            embedding_dimension: 768,
            embedding_batch_size: 100,
            chat_model: "gemini-2.0-flash".to_string(),
            temperature: 0.0,
            suggestion_temperature: 0.7,
            dense_chunk_size: 800,
            dense_chunk_overlap: 100,
            sparse_chunk_size: 1600,
            sparse_chunk_overlap: 200,
            retrieval_k: 4,
            max_context_chars: 6000,
            lexical_enabled: true,
            embedding_timeout_secs: 30,
            llm_timeout_secs: 60,
        }
    }
}

impl Settings {
    /// 기본값 + 환경변수
    ///
    /// 지원 환경변수:
    /// - `TENANT_RAG_DATA_DIR`
    /// - `TENANT_RAG_EMBEDDING` (gemini | hash)
    /// - `TENANT_RAG_EMBEDDING_DIMENSION`, `TENANT_RAG_EMBEDDING_BATCH_SIZE`
    /// - `TENANT_RAG_CHAT_MODEL`, `TENANT_RAG_TEMPERATURE`
    /// - `TENANT_RAG_RETRIEVAL_K`, `TENANT_RAG_MAX_CONTEXT_CHARS`
    /// - `TENANT_RAG_LEXICAL` (true | false)
    /// - `TENANT_RAG_EMBEDDING_TIMEOUT_SECS`, `TENANT_RAG_LLM_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();

        if let Some(dir) = env_var("TENANT_RAG_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = env_var("TENANT_RAG_EMBEDDING") {
            settings.embedding_backend = backend.parse()?;
        }
        if let Some(model) = env_var("TENANT_RAG_CHAT_MODEL") {
            settings.chat_model = model;
        }

        parse_env("TENANT_RAG_EMBEDDING_DIMENSION", &mut settings.embedding_dimension)?;
        parse_env("TENANT_RAG_EMBEDDING_BATCH_SIZE", &mut settings.embedding_batch_size)?;
        parse_env("TENANT_RAG_TEMPERATURE", &mut settings.temperature)?;
        parse_env("TENANT_RAG_RETRIEVAL_K", &mut settings.retrieval_k)?;
        parse_env("TENANT_RAG_MAX_CONTEXT_CHARS", &mut settings.max_context_chars)?;
        parse_env("TENANT_RAG_LEXICAL", &mut settings.lexical_enabled)?;
        parse_env("TENANT_RAG_EMBEDDING_TIMEOUT_SECS", &mut settings.embedding_timeout_secs)?;
        parse_env("TENANT_RAG_LLM_TIMEOUT_SECS", &mut settings.llm_timeout_secs)?;

        settings.validate()?;
        Ok(settings)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.retrieval_k == 0 {
            anyhow::bail!("retrieval_k must be at least 1");
        }
        if self.embedding_batch_size == 0 {
            anyhow::bail!("embedding_batch_size must be at least 1");
        }
        if self.dense_chunk_overlap >= self.dense_chunk_size
            || self.sparse_chunk_overlap >= self.sparse_chunk_size
        {
            anyhow::bail!("chunk overlap must be smaller than chunk size");
        }
        Ok(())
    }

    /// SQLite 소스 DB 경로
    pub fn sources_db_path(&self) -> PathBuf {
        self.data_dir.join("sources.db")
    }

    /// LanceDB 디렉토리 경로
    pub fn lance_path(&self) -> PathBuf {
        self.data_dir.join("fragments.lance")
    }

    /// dense 청킹 설정
    pub fn dense_chunking(&self) -> ChunkConfig {
        ChunkConfig::new(self.dense_chunk_size, self.dense_chunk_overlap)
    }

    /// sparse 청킹 설정
    pub fn sparse_chunking(&self) -> ChunkConfig {
        ChunkConfig::new(self.sparse_chunk_size, self.sparse_chunk_overlap)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 비어있지 않은 환경변수 값
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// 환경변수가 있으면 파싱해서 덮어쓰기
fn parse_env<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env_var(key) {
        *target = raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
