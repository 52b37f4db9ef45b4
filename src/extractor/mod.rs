//! 콘텐츠 추출 모듈
//!
//! 수집 요청(`SourcePayload`)을 평문 텍스트로 바꿉니다.
//! - URL: 웹 스크래퍼
//! - 텍스트: 그대로
//! - 파일: .txt/.md/.csv는 UTF-8로 읽고, .pdf는 pdf-extract

pub mod pdf;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::knowledge::SourcePayload;
use crate::scraper::{validate_url, WebScraper};

/// 허용 파일 확장자
pub const ALLOWED_EXTENSIONS: &[&str] = &["txt", "md", "csv", "pdf"];

// ============================================================================
// Types
// ============================================================================

/// 추출된 텍스트
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedText {
    pub text: String,
    /// 페이지 제목 등 (있으면)
    pub title: Option<String>,
}

/// 파일 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    PlainText,
    Pdf,
}

impl FileKind {
    /// 파일명 확장자로 판별 (허용되지 않으면 None)
    pub fn from_name(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())?
            .to_lowercase();
        match ext.as_str() {
            "txt" | "md" | "csv" => Some(FileKind::PlainText),
            "pdf" => Some(FileKind::Pdf),
            _ => None,
        }
    }
}

/// 인덱스를 건드리기 전에 요청 내용 검증
pub fn validate_payload(payload: &SourcePayload) -> std::result::Result<(), String> {
    match payload {
        SourcePayload::Url { url } => validate_url(url).map(|_| ()).map_err(|e| e.to_string()),
        SourcePayload::Text { text, .. } => {
            if text.trim().is_empty() {
                Err("text content must not be empty".to_string())
            } else {
                Ok(())
            }
        }
        SourcePayload::File { file_name, bytes } => {
            if FileKind::from_name(file_name).is_none() {
                return Err(format!(
                    "unsupported file type: {} (allowed: {})",
                    file_name,
                    ALLOWED_EXTENSIONS.join(", ")
                ));
            }
            if bytes.is_empty() {
                return Err(format!("file is empty: {}", file_name));
            }
            Ok(())
        }
    }
}

// ============================================================================
// ContentExtractor Trait
// ============================================================================

/// 콘텐츠 추출기 인터페이스
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, payload: &SourcePayload) -> Result<ExtractedText>;
}

/// 기본 추출기
pub struct DefaultExtractor {
    scraper: WebScraper,
}

impl DefaultExtractor {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            scraper: WebScraper::new(timeout)?,
        })
    }
}

#[async_trait]
impl ContentExtractor for DefaultExtractor {
    async fn extract(&self, payload: &SourcePayload) -> Result<ExtractedText> {
        match payload {
            SourcePayload::Url { url } => {
                let page = self.scraper.scrape(url).await?;
                Ok(ExtractedText {
                    text: page.content,
                    title: page.title,
                })
            }
            SourcePayload::Text { title, text } => Ok(ExtractedText {
                text: text.clone(),
                title: title.clone(),
            }),
            SourcePayload::File { file_name, bytes } => {
                let text = extract_file(file_name, bytes).await?;
                Ok(ExtractedText { text, title: None })
            }
        }
    }
}

/// 파일 바이트에서 텍스트 추출
async fn extract_file(file_name: &str, bytes: &[u8]) -> Result<String> {
    match FileKind::from_name(file_name) {
        Some(FileKind::PlainText) => Ok(String::from_utf8_lossy(bytes).into_owned()),
        Some(FileKind::Pdf) => {
            // PDF 추출은 CPU 바운드이므로 spawn_blocking 사용
            let bytes = bytes.to_vec();
            tokio::task::spawn_blocking(move || pdf::extract_text_from_pdf(&bytes))
                .await
                .context("PDF extraction task failed")?
                .with_context(|| format!("Failed to read {}", file_name))
        }
        None => anyhow::bail!("Unsupported file type: {}", file_name),
    }
}

// ============================================================================
// Tests
// ============================================================================
