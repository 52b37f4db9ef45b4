//! 웹 스크래퍼 모듈 - URL 콘텐츠 추출
//!
//! HTML을 받아 제목과 본문 텍스트만 남깁니다.
//! script/style/noscript 안의 텍스트는 버립니다.

use std::time::Duration;

use anyhow::{Context, Result};
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// 스크랩된 페이지
#[derive(Debug, Clone)]
pub struct ScrapedPage {
    /// 페이지 제목
    pub title: Option<String>,
    /// 본문 텍스트 (HTML 태그 제거됨)
    pub content: String,
    /// 원본 URL
    pub url: String,
}

/// URL 검증 (http/https + 호스트 필수)
pub fn validate_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).with_context(|| format!("Invalid URL: {}", raw))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("Unsupported URL scheme: {}", url.scheme());
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        anyhow::bail!("URL has no host: {}", raw);
    }
    Ok(url)
}

/// 웹 스크래퍼
pub struct WebScraper {
    client: reqwest::Client,
}

impl WebScraper {
    /// 새 스크래퍼 생성
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tenant-rag/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// URL에서 콘텐츠 추출
    pub async fn scrape(&self, url: &str) -> Result<ScrapedPage> {
        let url = validate_url(url)?;
        tracing::info!("Scraping: {}", url);

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context("HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("HTTP {} from {}", status, url);
        }

        let html = response.text().await.context("Failed to read response body")?;
        Ok(parse_html(url.as_str(), &html))
    }
}

/// HTML에서 제목/본문 추출
pub fn parse_html(url: &str, html: &str) -> ScrapedPage {
    let document = Html::parse_document(html);
    ScrapedPage {
        title: extract_title(&document),
        content: extract_content(&document),
        url: url.to_string(),
    }
}

/// 제목 추출 (<title> → <h1>)
fn extract_title(document: &Html) -> Option<String> {
    ["title", "h1"].iter().find_map(|tag| {
        let selector = Selector::parse(tag).ok()?;
        let element = document.select(&selector).next()?;
        let title = element.text().collect::<String>().trim().to_string();
        (!title.is_empty()).then_some(title)
    })
}

/// 본문 추출
///
/// 우선순위: article > main > body. 짧은 후보(100자 이하)는 건너뜁니다.
fn extract_content(document: &Html) -> String {
    let selectors = ["article", "main", "[role=main]", ".content", "#content", "body"];

    for selector_str in selectors {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                let text = visible_text(&element);
                if text.len() > 100 {
                    return text;
                }
            }
        }
    }

    Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next().map(|e| visible_text(&e)))
        .unwrap_or_default()
}

/// 요소의 보이는 텍스트 (script/style 제외, 공백 정리)
fn visible_text(element: &ElementRef) -> String {
    let mut parts: Vec<&str> = Vec::new();

    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element().map(|e| e.name()))
            .map(|name| matches!(name, "script" | "style" | "noscript"))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }

    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
