//! Text Chunking Module
//!
//! 원문 텍스트를 겹치는 조각(fragment)으로 분할합니다.
//! 경계 우선순위: 문장 끝 > 문단 > 줄바꿈 > 공백 > 문자 (강제 절단)
//!
//! ref: https://python.langchain.com/docs/how_to/recursive_text_splitter/

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 분할 경계 (우선순위 순서)
///
/// 마지막 빈 문자열은 문자 단위 강제 절단을 의미합니다.
const SEPARATORS: &[&str] = &[". ", "\n\n", "\n", " ", ""];

// ============================================================================
// Chunk Configuration
// ============================================================================

/// 청킹 설정 (문자 수 기준)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkConfig {
    /// 최대 청크 크기
    pub chunk_size: usize,
    /// 인접 청크 간 오버랩
    pub overlap: usize,
}

impl ChunkConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            overlap,
        }
    }

    /// 짧고 촘촘한 조각 (벡터 검색용)
    pub fn dense() -> Self {
        Self::new(800, 100)
    }

    /// 길고 성긴 조각 (긴 문서용)
    pub fn sparse() -> Self {
        Self::new(1600, 200)
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self::dense()
    }
}

/// 청킹 방식 (소스 레코드에 저장되어 재구축 때 그대로 쓰임)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkRegime {
    #[default]
    Dense,
    Sparse,
}

impl ChunkRegime {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkRegime::Dense => "dense",
            ChunkRegime::Sparse => "sparse",
        }
    }

    /// 기본 설정
    pub fn config(self) -> ChunkConfig {
        match self {
            ChunkRegime::Dense => ChunkConfig::dense(),
            ChunkRegime::Sparse => ChunkConfig::sparse(),
        }
    }
}

impl fmt::Display for ChunkRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkRegime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "dense" => Ok(ChunkRegime::Dense),
            "sparse" => Ok(ChunkRegime::Sparse),
            other => anyhow::bail!("Unknown chunk regime: {}", other),
        }
    }
}

// ============================================================================
// Chunker Trait
// ============================================================================

/// 텍스트 청킹 전략 트레이트
pub trait Chunker: Send + Sync {
    /// 텍스트를 청크로 분할
    fn chunk(&self, text: &str) -> Vec<String>;

    /// 청커 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// RecursiveChunker
// ============================================================================

/// 경계 인식 재귀 청커
///
/// 가장 우선순위가 높은 경계로 먼저 자르고, 그래도 너무 긴 조각만
/// 다음 경계로 다시 자릅니다. 잘린 조각들은 `chunk_size`를 넘지 않는
/// 범위에서 다시 합쳐지며, 직전 청크의 끝부분 `overlap` 만큼을 이어받습니다.
pub struct RecursiveChunker {
    config: ChunkConfig,
}

impl RecursiveChunker {
    /// 설정으로 생성
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// 청킹 방식의 기본 설정으로 생성
    pub fn for_regime(regime: ChunkRegime) -> Self {
        Self::new(regime.config())
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (index, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len(), ""));
        let remaining = separators.get(index + 1..).unwrap_or(&[]);

        // 경계 문자열은 앞 조각 끝에 붙여서 보존
        let pieces: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split_inclusive(separator).collect()
        };

        let mut chunks = Vec::new();
        let mut pending: Vec<&str> = Vec::new();

        for piece in pieces {
            if char_len(piece) <= self.config.chunk_size {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge_pieces(&pending));
                pending.clear();
            }

            if remaining.is_empty() {
                // 문자 단위까지 내려왔는데도 긴 경우는 없음 (chunk_size >= 1)
                chunks.push(piece.trim().to_string());
            } else {
                chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge_pieces(&pending));
        }

        chunks
    }

    /// 작은 조각들을 chunk_size 이하로 합치고 오버랩 적용
    fn merge_pieces(&self, pieces: &[&str]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = char_len(piece);

            if total + len > self.config.chunk_size && !window.is_empty() {
                push_window(&mut chunks, &window);

                // 오버랩 크기만큼만 남기고 앞에서부터 제거
                while total > self.config.overlap
                    || (total + len > self.config.chunk_size && total > 0)
                {
                    match window.pop_front() {
                        Some((_, removed)) => total -= removed,
                        None => break,
                    }
                }
            }

            window.push_back((piece, len));
            total += len;
        }

        if !window.is_empty() {
            push_window(&mut chunks, &window);
        }

        chunks
    }
}

impl Chunker for RecursiveChunker {
    fn chunk(&self, text: &str) -> Vec<String> {
        let text = sanitize_text(text);
        if text.trim().is_empty() {
            return vec![];
        }

        // 한 청크에 들어가면 그대로 반환
        if char_len(&text) <= self.config.chunk_size {
            return vec![text];
        }

        let mut chunks = self.split_recursive(&text, SEPARATORS);
        chunks.retain(|c| !c.trim().is_empty());
        chunks
    }

    fn name(&self) -> &'static str {
        "RecursiveChunker"
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 저장소를 깨뜨리는 제어 문자 제거
///
/// NUL 및 제어 문자를 제거하되 줄바꿈/탭은 유지합니다.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|&c| matches!(c, '\n' | '\r' | '\t') || !c.is_control())
        .collect()
}

/// 텍스트 분할 (기본 설정)
pub fn split(text: &str, regime: ChunkRegime) -> Vec<String> {
    RecursiveChunker::for_regime(regime).chunk(text)
}

/// UTF-8 경계 조정 (인덱스 이하로)
#[inline]
pub(crate) fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        s.len()
    } else {
        let mut i = index;
        while i > 0 && !s.is_char_boundary(i) {
            i -= 1;
        }
        i
    }
}

/// 문자 수 기준 접두어 (UTF-8 안전)
pub(crate) fn char_prefix(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &s[..floor_char_boundary(s, byte_index)],
        None => s,
    }
}

#[inline]
fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_window(chunks: &mut Vec<String>, window: &VecDeque<(&str, usize)>) {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sentences(count: usize) -> String {
        (1..=count)
            .map(|i| format!("Sentence number {} is here. ", i))
            .collect()
    }

    #[test]
    fn test_chunker_empty() {
        assert!(split("", ChunkRegime::Dense).is_empty());
        assert!(split("   \n\t  ", ChunkRegime::Sparse).is_empty());
        assert!(split("\0\0", ChunkRegime::Dense).is_empty());
    }

    #[test]
    fn test_short_text_round_trip() {
        let text = "Our support hours are 9 to 5 Monday to Friday.";
        let chunks = split(text, ChunkRegime::Dense);
        assert_eq!(chunks, vec![text.to_string()]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_short_text_round_trip_after_sanitize() {
        let text = "line one\0\nline\u{7}two\ttabbed";
        let chunks = split(text, ChunkRegime::Dense);
        assert_eq!(chunks.concat(), "line one\nlinetwo\ttabbed");
    }

    #[test]
    fn test_chunks_respect_size() {
        let chunker = RecursiveChunker::new(ChunkConfig::new(100, 30));
        let chunks = chunker.chunk(&sentences(40));
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100, "too long: {}", chunk);
        }
    }

    #[test]
    fn test_overlap_carries_last_sentence() {
        let chunker = RecursiveChunker::new(ChunkConfig::new(100, 30));
        let chunks = chunker.chunk(&sentences(20));

        assert_eq!(
            chunks[0],
            "Sentence number 1 is here. Sentence number 2 is here. Sentence number 3 is here."
        );
        let last_sentence = chunks[0].rsplit(". ").next().unwrap();
        assert!(chunks[1].starts_with(last_sentence));
    }

    #[test]
    fn test_no_overlap() {
        let chunker = RecursiveChunker::new(ChunkConfig::new(100, 0));
        let chunks = chunker.chunk(&sentences(20));
        assert!(chunks[1].starts_with("Sentence number 4 is here."));
    }

    #[test]
    fn test_sentence_then_paragraph_boundaries() {
        let chunker = RecursiveChunker::new(ChunkConfig::new(40, 0));
        let text = "First sentence is short. Second sentence follows here.\n\nA paragraph";
        let chunks = chunker.chunk(text);
        assert_eq!(
            chunks,
            vec![
                "First sentence is short.".to_string(),
                "Second sentence follows here.".to_string(),
                "A paragraph".to_string(),
            ]
        );
    }

    #[test]
    fn test_hard_cut_without_boundaries() {
        let chunker = RecursiveChunker::new(ChunkConfig::new(100, 10));
        let chunks = chunker.chunk(&"a".repeat(250));
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 100));
        assert!(chunks.iter().all(|c| c.chars().all(|ch| ch == 'a')));
    }

    #[test]
    fn test_unicode_text_is_split_safely() {
        let chunker = RecursiveChunker::new(ChunkConfig::new(10, 2));
        let chunks = chunker.chunk(&"안녕하세요세계".repeat(5));
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(ChunkRegime::Dense.config(), ChunkConfig::new(800, 100));
        assert_eq!(ChunkRegime::Sparse.config(), ChunkConfig::new(1600, 200));
        assert_eq!(ChunkConfig::default(), ChunkConfig::dense());
    }

    #[test]
    fn test_sparse_produces_fewer_chunks() {
        let text = sentences(200);
        let dense = split(&text, ChunkRegime::Dense);
        let sparse = split(&text, ChunkRegime::Sparse);
        assert!(sparse.len() < dense.len());
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "Hello, 세계!";
        assert_eq!(floor_char_boundary(s, 5), 5);
        assert_eq!(floor_char_boundary(s, 100), s.len());
        assert_eq!(floor_char_boundary(s, 8), 7);
        assert_eq!(floor_char_boundary("", 0), 0);
    }

    #[test]
    fn test_char_prefix() {
        assert_eq!(char_prefix("hello", 10), "hello");
        assert_eq!(char_prefix("hello", 2), "he");
        assert_eq!(char_prefix("세계여행", 2), "세계");
    }
}
