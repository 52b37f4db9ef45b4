//! 에러 타입
//!
//! 코어 연산(`KnowledgeService`)이 호출자에게 돌려주는 에러 분류입니다.
//! 저장소/HTTP 계층 내부는 `anyhow::Result`를 사용하고, 서비스 경계에서
//! 이 타입으로 변환합니다.

use thiserror::Error;

use crate::knowledge::SourceStatus;

/// 코어 에러 분류
#[derive(Error, Debug)]
pub enum RagError {
    /// 입력 검증 실패 (빈 질문/텍스트, 잘못된 테넌트 ID 등)
    ///
    /// 어떤 인덱스도 건드리기 전에 거부됩니다.
    #[error("Validation error: {0}")]
    Validation(String),

    /// 임베딩/LLM 업스트림 호출 실패 (타임아웃 포함)
    #[error("Upstream error during {operation}: {message}")]
    Upstream { operation: String, message: String },

    /// 인덱스 초기화 실패 (예: 저장 경로에 쓸 수 없음)
    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    /// 대상이 존재하지 않음 (소스 ID 등)
    #[error("Not found: {0}")]
    NotFound(String),

    /// 허용되지 않는 소스 상태 전이
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: SourceStatus, to: SourceStatus },

    /// 저장소 등 기타 내부 에러
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagError {
    /// 업스트림 에러 생성 헬퍼
    pub fn upstream(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        RagError::Upstream {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// 업스트림 에러 여부
    pub fn is_upstream(&self) -> bool {
        matches!(self, RagError::Upstream { .. })
    }
}

/// 코어 결과 타입
pub type RagResult<T> = Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_message_names_operation() {
        let err = RagError::upstream("embed_query", "timed out after 30s");
        assert!(err.is_upstream());
        assert_eq!(
            err.to_string(),
            "Upstream error during embed_query: timed out after 30s"
        );
    }

    #[test]
    fn test_anyhow_is_transparent() {
        let err: RagError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.to_string(), "disk full");
        assert!(!err.is_upstream());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = RagError::InvalidTransition {
            from: SourceStatus::Completed,
            to: SourceStatus::Processing,
        };
        assert_eq!(
            err.to_string(),
            "Invalid status transition: completed -> processing"
        );
    }
}
