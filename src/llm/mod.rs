//! LLM 모듈 - 프롬프트 → 텍스트 생성
//!
//! 답변 합성과 추천 질문 생성이 사용하는 언어 모델 인터페이스입니다.
//! 기본 구현은 Gemini `generateContent` API입니다.
//!
//! source: https://ai.google.dev/api/generate-content

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::embedding::{get_api_key, GeminiError};

// ============================================================================
// CompletionProvider Trait
// ============================================================================

/// 생성 요청
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            prompt: prompt.into(),
            temperature,
        }
    }
}

/// 언어 모델 프로바이더 트레이트
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// 프롬프트로 텍스트 생성
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;

    /// 모델 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Gemini generateContent
// ============================================================================

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Gemini 텍스트 생성 구현체
#[derive(Debug)]
pub struct GeminiCompletion {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiCompletion {
    pub fn new(api_key: String, model: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            api_key,
            model: model.into(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", GEMINI_API_BASE, self.model)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    /// 첫 후보의 텍스트 파트를 이어붙임
    fn text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content.parts.into_iter().map(|p| p.text).collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

#[async_trait]
impl CompletionProvider for GeminiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
            },
        };

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send generateContent request")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<GeminiError>(&text) {
                anyhow::bail!(
                    "Gemini API error ({}): {}",
                    error.error.status,
                    error.error.message
                );
            }
            anyhow::bail!("Gemini API error ({}): {}", status, text);
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&text).context("Failed to parse generateContent response")?;
        parsed
            .text()
            .ok_or_else(|| anyhow::anyhow!("Gemini returned no text candidates"))
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Unconfigured
// ============================================================================

/// API 키가 없을 때 쓰는 프로바이더 (항상 실패)
///
/// 서비스는 생성 실패를 에러 답변/기본 추천 질문으로 처리하므로
/// 키 없이도 수집과 조회 명령은 동작합니다.
#[derive(Debug)]
pub struct UnconfiguredCompletion {
    reason: String,
}

#[async_trait]
impl CompletionProvider for UnconfiguredCompletion {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        anyhow::bail!("{}", self.reason)
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 생성 프로바이더
pub fn create_completion(settings: &Settings) -> Arc<dyn CompletionProvider> {
    match get_api_key()
        .and_then(|key| GeminiCompletion::new(key, &settings.chat_model, settings.llm_timeout()))
    {
        Ok(provider) => {
            tracing::info!("Using Gemini chat model: {}", settings.chat_model);
            Arc::new(provider)
        }
        Err(e) => {
            tracing::warn!("Language model unavailable: {}", e);
            Arc::new(UnconfiguredCompletion {
                reason: e.to_string(),
            })
        }
    }
}

// ============================================================================
// Test Support
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// 미리 정한 응답을 순서대로 돌려주는 프로바이더
    ///
    /// 응답이 떨어지면 마지막 응답을 반복합니다. 받은 요청은 기록됩니다.
    pub(crate) struct ScriptedCompletion {
        replies: Mutex<VecDeque<Result<String, String>>>,
        last: Mutex<Option<Result<String, String>>>,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedCompletion {
        pub(crate) fn new(replies: Vec<Result<&str, &str>>) -> Self {
            Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                last: Mutex::new(None),
                requests: Mutex::new(Vec::new()),
                delay: None,
            }
        }

        pub(crate) fn always(reply: &str) -> Self {
            Self::new(vec![Ok(reply)])
        }

        pub(crate) fn failing(message: &str) -> Self {
            Self::new(vec![Err(message)])
        }

        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub(crate) fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedCompletion {
        async fn complete(&self, request: &CompletionRequest) -> Result<String> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let reply = {
                let mut replies = self.replies.lock().unwrap();
                let mut last = self.last.lock().unwrap();
                if let Some(next) = replies.pop_front() {
                    *last = Some(next.clone());
                    next
                } else {
                    last.clone().unwrap_or_else(|| Err("no scripted reply".to_string()))
                }
            };
            reply.map_err(|e| anyhow::anyhow!(e))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
