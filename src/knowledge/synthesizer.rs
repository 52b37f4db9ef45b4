//! Answer Synthesizer - 검색된 조각으로 답변 생성
//!
//! 조각 텍스트를 순위 순서대로 빈 줄로 이어 컨텍스트를 만들고,
//! 고정 템플릿으로 언어 모델에 한 번 질의합니다. 재시도는 하지 않습니다.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{RagError, RagResult};
use crate::llm::{CompletionProvider, CompletionRequest};

use super::vector::StoredFragment;

/// 답변 프롬프트 템플릿
const ANSWER_TEMPLATE: &str = "You are a helpful AI assistant. Answer the user's question using only the provided context.
If the answer is not in the context, politely say you don't have that information.

Context:
{context}

Question: {question}

Answer:";

/// 관련 콘텐츠가 없을 때의 고정 답변
pub const NO_INFORMATION_ANSWER: &str =
    "I don't have any information to answer that question. Please add relevant content to the knowledge base.";

/// 조각 구분자
const CONTEXT_SEPARATOR: &str = "\n\n";

// ============================================================================
// Types
// ============================================================================

/// 합성 결과
#[derive(Debug, Clone)]
pub struct Synthesis {
    pub answer: String,
    /// 컨텍스트에 실제로 들어간 조각 (순위 순서)
    pub used: Vec<StoredFragment>,
}

// ============================================================================
// AnswerSynthesizer
// ============================================================================

/// 답변 합성기
pub struct AnswerSynthesizer {
    provider: Arc<dyn CompletionProvider>,
    temperature: f32,
    max_context_chars: usize,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        temperature: f32,
        max_context_chars: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            temperature,
            max_context_chars,
            timeout,
        }
    }

    /// 답변 생성
    ///
    /// 실패/타임아웃은 `RagError::Upstream`
    pub async fn synthesize(
        &self,
        question: &str,
        fragments: &[StoredFragment],
    ) -> RagResult<Synthesis> {
        let (context, used) = build_context(fragments, self.max_context_chars);
        if used < fragments.len() {
            tracing::debug!(
                "Context budget {} chars: using {}/{} fragments",
                self.max_context_chars,
                used,
                fragments.len()
            );
        }

        let request = CompletionRequest::new(build_prompt(question, &context), self.temperature);
        let answer = tokio::time::timeout(self.timeout, self.provider.complete(&request))
            .await
            .map_err(|_| {
                RagError::upstream("synthesize", format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| RagError::upstream("synthesize", e))?;

        Ok(Synthesis {
            answer: answer.trim().to_string(),
            used: fragments[..used].to_vec(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 컨텍스트 조립 (문자 수 예산)
///
/// 최상위 조각은 예산을 넘어도 잘리지 않고 통째로 들어가며,
/// 그 뒤 조각은 예산을 넘기 직전까지만 포함합니다.
/// 반환: (컨텍스트, 사용한 조각 수)
fn build_context(fragments: &[StoredFragment], max_chars: usize) -> (String, usize) {
    let mut context = String::new();
    let mut total = 0usize;
    let mut used = 0usize;

    for fragment in fragments {
        let len = fragment.text.chars().count();
        if used > 0 {
            let next = total + CONTEXT_SEPARATOR.len() + len;
            if next > max_chars {
                break;
            }
            context.push_str(CONTEXT_SEPARATOR);
            total = next;
        } else {
            total = len;
        }
        context.push_str(&fragment.text);
        used += 1;
    }

    (context, used)
}

/// 템플릿에 컨텍스트와 질문 채우기
fn build_prompt(question: &str, context: &str) -> String {
    ANSWER_TEMPLATE
        .replace("{context}", context)
        .replace("{question}", question)
}

// ============================================================================
// Tests
// ============================================================================
