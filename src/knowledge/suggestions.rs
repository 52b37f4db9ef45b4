//! Suggestion Generator - 대화 시작 추천 질문
//!
//! 테넌트 콘텐츠 샘플로 3~5개의 짧은 질문을 생성하고,
//! 테넌트별 캐시(`SuggestionCache`)에 보관합니다.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::error::{RagError, RagResult};
use crate::llm::{CompletionProvider, CompletionRequest};

use super::chunker::char_prefix;
use super::vector::StoredFragment;

/// 콘텐츠가 없을 때의 고정 추천 질문
pub const FALLBACK_SUGGESTIONS: [&str; 3] = [
    "What can you do?",
    "Tell me something interesting!",
    "How can I use this chatbot?",
];

/// 프롬프트에 넣는 최대 조각 수
pub const MAX_SAMPLE_FRAGMENTS: usize = 5;
/// 조각당 최대 문자 수
const SAMPLE_CHARS: usize = 800;
/// 추천 질문 개수 범위
const MIN_SUGGESTIONS: usize = 3;
const MAX_SUGGESTIONS: usize = 5;

const SUGGESTION_TEMPLATE: &str = "You are an assistant that helps generate engaging chatbot starter questions.
Given the following knowledge content, create 3 to 5 **short and natural** questions a user might ask.
The questions should:
- Be conversational, not robotic
- Be relevant to the content
- Cover different angles (facts, summaries, how-to, etc.)

Context:
{context}

Questions:";

/// 고정 추천 질문 목록
pub fn fallback_suggestions() -> Vec<String> {
    FALLBACK_SUGGESTIONS.iter().map(|s| s.to_string()).collect()
}

// ============================================================================
// SuggestionGenerator
// ============================================================================

/// 추천 질문 생성기
pub struct SuggestionGenerator {
    provider: Arc<dyn CompletionProvider>,
    temperature: f32,
    timeout: Duration,
}

impl SuggestionGenerator {
    pub fn new(provider: Arc<dyn CompletionProvider>, temperature: f32, timeout: Duration) -> Self {
        Self {
            provider,
            temperature,
            timeout,
        }
    }

    /// 조각 샘플로 추천 질문 생성
    ///
    /// 조각이 없으면 모델을 부르지 않고 고정 목록을 반환합니다.
    /// 3개 미만이면 한 번 더 생성하고, 그래도 부족하면 생성된 만큼 반환합니다.
    pub async fn generate(&self, fragments: &[StoredFragment]) -> RagResult<Vec<String>> {
        if fragments.is_empty() {
            return Ok(fallback_suggestions());
        }

        let request = CompletionRequest::new(build_prompt(fragments), self.temperature);

        let first = self.request_once(&request).await?;
        if first.len() >= MIN_SUGGESTIONS {
            return Ok(first);
        }

        tracing::debug!(
            "Only {} suggestions generated, regenerating once",
            first.len()
        );
        let second = match self.request_once(&request).await {
            Ok(second) => second,
            Err(e) => {
                tracing::warn!("Suggestion regeneration failed: {}", e);
                return Ok(first);
            }
        };

        Ok(if second.len() >= first.len() {
            second
        } else {
            first
        })
    }

    async fn request_once(&self, request: &CompletionRequest) -> RagResult<Vec<String>> {
        let raw = tokio::time::timeout(self.timeout, self.provider.complete(request))
            .await
            .map_err(|_| {
                RagError::upstream("suggestions", format!("timed out after {:?}", self.timeout))
            })?
            .map_err(|e| RagError::upstream("suggestions", e))?;

        Ok(parse_suggestions(&raw))
    }
}

// ============================================================================
// SuggestionCache
// ============================================================================

/// 테넌트별 추천 질문 캐시
///
/// 재시작 시 사라지며, 없는 항목은 조회 시점에 다시 생성합니다.
/// 무효화될 때마다 테넌트 세대(generation)가 올라가고, 생성 전에 읽은 세대가
/// 그대로일 때만 결과를 저장합니다. 느린 생성이 더 새로운 결과를 덮어쓰지 못합니다.
#[derive(Default)]
pub struct SuggestionCache {
    state: RwLock<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Arc<Vec<String>>>,
    generations: HashMap<String, u64>,
}

impl SuggestionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<Vec<String>>> {
        self.read().entries.get(tenant_id).cloned()
    }

    /// 현재 세대. 생성을 시작하기 전에 읽어 둡니다
    pub fn generation(&self, tenant_id: &str) -> u64 {
        if let Some(generation) = self.read().generations.get(tenant_id) {
            return *generation;
        }
        *self
            .write()
            .generations
            .entry(tenant_id.to_string())
            .or_insert(0)
    }

    /// 세대가 그대로면 저장. 저장 여부와 관계없이 생성된 값을 돌려줌
    pub fn put_if_current(
        &self,
        tenant_id: &str,
        generation: u64,
        suggestions: Vec<String>,
    ) -> Arc<Vec<String>> {
        let value = Arc::new(suggestions);
        let mut state = self.write();
        if state.generations.get(tenant_id).copied().unwrap_or(0) == generation {
            state.entries.insert(tenant_id.to_string(), value.clone());
        } else {
            tracing::debug!("Discarding stale suggestions for tenant {}", tenant_id);
        }
        value
    }

    pub fn invalidate(&self, tenant_id: &str) {
        let mut state = self.write();
        state.entries.remove(tenant_id);
        *state.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.entries.clear();
        for generation in state.generations.values_mut() {
            *generation += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn build_prompt(fragments: &[StoredFragment]) -> String {
    let context = fragments
        .iter()
        .take(MAX_SAMPLE_FRAGMENTS)
        .map(|f| char_prefix(&f.text, SAMPLE_CHARS))
        .collect::<Vec<_>>()
        .join("\n\n");

    SUGGESTION_TEMPLATE.replace("{context}", &context)
}

/// 모델 출력에서 질문 목록 추출
///
/// 줄 앞의 목록 기호/번호를 제거하고 빈 줄은 버립니다. 최대 5개.
fn parse_suggestions(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| {
                    c.is_ascii_digit() || matches!(c, '-' | '•' | '*' | '.' | ')' | ' ')
                })
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(MAX_SUGGESTIONS)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
