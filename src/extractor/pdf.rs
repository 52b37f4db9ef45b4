//! PDF 텍스트 추출 모듈
//!
//! pdf-extract 크레이트를 사용하여 PDF에서 텍스트를 추출합니다.

use anyhow::{Context, Result};
use regex::Regex;

/// PDF 바이트에서 텍스트 추출
///
/// 페이지 구분(폼피드 또는 "--- Page N ---" 줄)을 빈 줄로 바꿔 하나의 텍스트로 반환합니다.
pub fn extract_text_from_pdf(bytes: &[u8]) -> Result<String> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).context("Failed to extract text from PDF")?;

    if text.trim().is_empty() {
        tracing::warn!("No text extracted from PDF. It might be a scanned document.");
        return Ok(String::new());
    }

    Ok(split_pdf_pages(&text).join("\n\n"))
}

/// PDF 텍스트를 페이지별로 분리
fn split_pdf_pages(text: &str) -> Vec<String> {
    let pages: Vec<String> = text
        .split('\x0c')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if pages.len() > 1 {
        return pages;
    }

    // 페이지 구분자 줄 (예: "--- Page 1 ---")
    if let Ok(marker) = Regex::new(r"(?m)^[\s]*[-=]+[\s]*(?:Page[\s]*)?(\d+)[\s]*[-=]+[\s]*$") {
        let pages: Vec<String> = marker
            .split(text)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if pages.len() > 1 {
            return pages;
        }
    }

    vec![text.trim().to_string()]
}

// ============================================================================
// Tests
// ============================================================================
