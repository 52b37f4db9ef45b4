//! CLI 모듈
//!
//! tenant-rag CLI 명령어 정의 및 구현. 모든 명령은 `KnowledgeService`를 통해 실행됩니다.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Settings;
use crate::embedding::has_api_key;
use crate::knowledge::{
    AnswerKind, ChunkRegime, KnowledgeService, SourcePayload, SourceRecord, SourceStatus,
    SourceType,
};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "tenant-rag")]
#[command(version, about = "테넌트 격리 하이브리드 RAG 질의응답", long_about = None)]
pub struct Cli {
    /// 테넌트 ID
    #[arg(long, global = true)]
    pub tenant: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// URL, 텍스트, 또는 파일을 테넌트 지식베이스에 추가
    Ingest {
        /// 수집할 URL
        #[arg(short, long)]
        url: Option<String>,

        /// 직접 입력할 텍스트
        #[arg(short, long)]
        text: Option<String>,

        /// 수집할 파일 경로 (.txt, .md, .csv, .pdf)
        #[arg(long)]
        file: Option<PathBuf>,

        /// 텍스트 제목
        #[arg(long)]
        title: Option<String>,

        /// 큰 청크(1600자)로 분할
        #[arg(long)]
        sparse: bool,

        /// 교체할 기존 소스 ID
        #[arg(long)]
        replace: Option<String>,
    },

    /// 질문하기
    Ask {
        /// 질문
        question: String,
    },

    /// 추천 질문 보기
    Suggest,

    /// 소스 목록
    Sources,

    /// 소스와 그 조각 삭제
    DeleteSource {
        /// 삭제할 소스 ID
        source_id: String,
    },

    /// 테넌트 조각 전체 삭제 (소스 기록은 유지)
    Clear,

    /// 테넌트 조각 수
    Count,

    /// completed 소스로 테넌트 인덱스 재구축
    Rebuild,

    /// 벡터 인덱스 전체 초기화
    Reset,

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let tenant = cli.tenant;

    match cli.command {
        Commands::Ingest {
            url,
            text,
            file,
            title,
            sparse,
            replace,
        } => {
            let tenant = require_tenant(tenant)?;
            let payload = build_payload(url, text, file, title).await?;
            let regime = if sparse {
                ChunkRegime::Sparse
            } else {
                ChunkRegime::Dense
            };
            cmd_ingest(&tenant, payload, regime, replace).await
        }
        Commands::Ask { question } => cmd_ask(&require_tenant(tenant)?, &question).await,
        Commands::Suggest => cmd_suggest(&require_tenant(tenant)?).await,
        Commands::Sources => cmd_sources(&require_tenant(tenant)?).await,
        Commands::DeleteSource { source_id } => {
            cmd_delete_source(&require_tenant(tenant)?, &source_id).await
        }
        Commands::Clear => cmd_clear(&require_tenant(tenant)?).await,
        Commands::Count => cmd_count(&require_tenant(tenant)?).await,
        Commands::Rebuild => cmd_rebuild(&require_tenant(tenant)?).await,
        Commands::Reset => cmd_reset().await,
        Commands::Status => cmd_status(tenant.as_deref()).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 수집 명령어 (ingest)
async fn cmd_ingest(
    tenant: &str,
    payload: SourcePayload,
    regime: ChunkRegime,
    replace: Option<String>,
) -> Result<()> {
    let service = open_service().await?;

    println!("[*] 수집 중: {} ({})", payload.label(), payload.source_type());

    let record = match replace {
        Some(old_id) => service
            .replace_source(tenant, &old_id, payload, regime)
            .await
            .with_context(|| format!("소스 {} 교체 실패", old_id))?,
        None => service
            .add_source(tenant, payload, regime)
            .await
            .context("소스 수집 실패")?,
    };

    let count = service.document_count(tenant).await?;
    println!("[OK] 소스가 추가되었습니다 (ID: {})", record.source_id);
    println!("     테넌트 {} 조각 수: {}", tenant, count);

    Ok(())
}

/// 질문 명령어 (ask)
async fn cmd_ask(tenant: &str, question: &str) -> Result<()> {
    let service = open_service().await?;

    println!("[*] 질문: \"{}\"", question);
    let response = service.ask(tenant, question).await?;

    match response.kind {
        AnswerKind::Answered => println!("\n[OK] 답변:\n"),
        AnswerKind::NoInformation => println!("\n[!] 관련 콘텐츠가 없습니다:\n"),
        AnswerKind::Error => println!("\n[!] 처리 실패:\n"),
    }
    println!("{}", response.answer);

    if !response.sources.is_empty() {
        println!("\n출처:");
        for source in &response.sources {
            println!("  - {}", source);
        }
    }

    print_suggestions(&response.suggestions);
    Ok(())
}

/// 추천 질문 명령어 (suggest)
async fn cmd_suggest(tenant: &str) -> Result<()> {
    let service = open_service().await?;
    let suggestions = service
        .suggestions(tenant)
        .await
        .context("추천 질문 생성 실패")?;
    print_suggestions(&suggestions);
    Ok(())
}

/// 소스 목록 명령어 (sources)
async fn cmd_sources(tenant: &str) -> Result<()> {
    let service = open_service().await?;
    let sources = service.list_sources(tenant)?;

    if sources.is_empty() {
        println!("[!] 테넌트 {}에 등록된 소스가 없습니다.", tenant);
        return Ok(());
    }

    println!("[OK] 소스 ({} 건):\n", sources.len());
    for source in &sources {
        print_source(source);
    }

    Ok(())
}

/// 소스 삭제 명령어 (delete-source)
async fn cmd_delete_source(tenant: &str, source_id: &str) -> Result<()> {
    let service = open_service().await?;
    let removed = service
        .delete_source(tenant, source_id)
        .await
        .context("소스 삭제 실패")?;

    println!("[OK] 소스 {} 삭제됨 (조각 {} 개)", source_id, removed);
    Ok(())
}

/// 테넌트 초기화 명령어 (clear)
async fn cmd_clear(tenant: &str) -> Result<()> {
    let service = open_service().await?;
    let removed = service.clear_tenant(tenant).await?;
    println!("[OK] 테넌트 {} 조각 {} 개 삭제됨", tenant, removed);
    Ok(())
}

/// 조각 수 명령어 (count)
async fn cmd_count(tenant: &str) -> Result<()> {
    let service = open_service().await?;
    let count = service.document_count(tenant).await?;
    println!("{}", count);
    Ok(())
}

/// 재구축 명령어 (rebuild)
async fn cmd_rebuild(tenant: &str) -> Result<()> {
    let service = open_service().await?;

    println!("[*] 테넌트 {} 인덱스 재구축 중...", tenant);
    let report = service.rebuild_tenant_index(tenant).await?;

    println!(
        "[OK] 완료: 소스 {} 개, 조각 {} 개",
        report.sources_processed, report.fragments_indexed
    );
    Ok(())
}

/// 전체 초기화 명령어 (reset)
async fn cmd_reset() -> Result<()> {
    let service = open_service().await?;
    service.reset_index().await?;
    println!("[OK] 벡터 인덱스가 초기화되었습니다");
    println!("     (소스 기록은 유지됩니다. 테넌트별로 rebuild 하세요)");
    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(tenant: Option<&str>) -> Result<()> {
    println!("tenant-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let settings = Settings::from_env()?;
    println!("[*] 데이터 디렉토리: {}", settings.data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[!] API 키: 미설정");
        println!("    설정: export GEMINI_API_KEY=your-key");
    }

    let service = match KnowledgeService::open(settings).await {
        Ok(service) => service,
        Err(e) => {
            println!("[!] 서비스 열기 실패: {}", e);
            return Ok(());
        }
    };

    match service.stats().await {
        Ok(stats) => {
            println!(
                "[OK] 벡터 인덱스: {} 조각 ({})",
                stats.fragment_count, stats.vector_store
            );
            println!("[OK] 소스: {} 건", stats.source_count);
            println!(
                "     임베딩: {} ({}차원)",
                stats.embedding_provider, stats.embedding_dimension
            );
            if stats.lexical_enabled {
                println!("     키워드 인덱스: v{}", stats.lexical_version);
            } else {
                println!("     키워드 인덱스: 비활성화");
            }
        }
        Err(e) => println!("[!] 통계 조회 실패: {}", e),
    }

    if let Some(tenant) = tenant {
        match service.document_count(tenant).await {
            Ok(count) => println!("[OK] 테넌트 {}: {} 조각", tenant, count),
            Err(e) => println!("[!] 테넌트 조회 실패: {}", e),
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn open_service() -> Result<KnowledgeService> {
    let settings = Settings::from_env().context("설정 로드 실패")?;
    KnowledgeService::open(settings)
        .await
        .context("KnowledgeService 초기화 실패")
}

fn require_tenant(tenant: Option<String>) -> Result<String> {
    match tenant {
        Some(tenant) if !tenant.trim().is_empty() => Ok(tenant),
        _ => bail!("--tenant를 지정해야 합니다"),
    }
}

/// 옵션 조합으로 수집 요청 생성
async fn build_payload(
    url: Option<String>,
    text: Option<String>,
    file: Option<PathBuf>,
    title: Option<String>,
) -> Result<SourcePayload> {
    match (url, text, file) {
        (Some(url), None, None) => Ok(SourcePayload::Url { url }),
        (None, Some(text), None) => Ok(SourcePayload::Text { title, text }),
        (None, None, Some(path)) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("파일 읽기 실패: {}", path.display()))?;
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("잘못된 파일 경로: {}", path.display()))?;
            println!("[*] 파일: {} ({})", file_name, format_bytes(bytes.len()));
            Ok(SourcePayload::File { file_name, bytes })
        }
        (None, None, None) => bail!("--url, --text, --file 중 하나를 지정해야 합니다"),
        _ => bail!("--url, --text, --file 중 하나만 지정할 수 있습니다"),
    }
}

fn print_source(source: &SourceRecord) {
    let status = match source.status {
        SourceStatus::Completed => "OK",
        SourceStatus::Failed => "FAIL",
        SourceStatus::Pending | SourceStatus::Processing => "...",
    };

    println!(
        "  [{:<4}] {} [{}] {}",
        status,
        source.source_id,
        source.source_type,
        truncate_text(&source.label(), 60)
    );
    if source.source_type != SourceType::Text {
        if let Some(ref title) = source.title {
            println!("         제목: {}", truncate_text(title, 60));
        }
    }
    println!(
        "         {} | {} | {}",
        source.created_at.format("%Y-%m-%d %H:%M"),
        source.chunk_regime,
        source
            .content
            .as_ref()
            .map(|c| format!("{} chars", c.chars().count()))
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(ref error) = source.error_message {
        println!("         에러: {}", truncate_text(error, 100));
    }
    println!();
}

fn print_suggestions(suggestions: &[String]) {
    if suggestions.is_empty() {
        return;
    }
    println!("\n추천 질문:");
    for (i, suggestion) in suggestions.iter().enumerate() {
        println!("  {}. {}", i + 1, suggestion);
    }
}

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("hello", 10), "hello");
        assert_eq!(truncate_text("hello world", 5), "hello...");
        assert_eq!(truncate_text("안녕하세요 세계", 5), "안녕하세요...");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_parse_ingest_with_tenant() {
        let cli = Cli::try_parse_from([
            "tenant-rag",
            "ingest",
            "--tenant",
            "acme",
            "--text",
            "hello",
            "--title",
            "faq",
            "--sparse",
        ])
        .unwrap();

        assert_eq!(cli.tenant.as_deref(), Some("acme"));
        match cli.command {
            Commands::Ingest {
                text,
                title,
                sparse,
                replace,
                ..
            } => {
                assert_eq!(text.as_deref(), Some("hello"));
                assert_eq!(title.as_deref(), Some("faq"));
                assert!(sparse);
                assert!(replace.is_none());
            }
            _ => panic!("expected ingest"),
        }
    }

    #[test]
    fn test_parse_delete_source() {
        let cli =
            Cli::try_parse_from(["tenant-rag", "--tenant", "beta", "delete-source", "abc"]).unwrap();
        assert_eq!(cli.tenant.as_deref(), Some("beta"));
        assert!(matches!(cli.command, Commands::DeleteSource { ref source_id } if source_id == "abc"));
    }

    #[test]
    fn test_require_tenant() {
        assert!(require_tenant(None).is_err());
        assert!(require_tenant(Some("  ".to_string())).is_err());
        assert_eq!(require_tenant(Some("acme".to_string())).unwrap(), "acme");
    }

    #[tokio::test]
    async fn test_build_payload_requires_exactly_one_input() {
        assert!(build_payload(None, None, None, None).await.is_err());
        assert!(build_payload(
            Some("https://acme.test".to_string()),
            Some("text".to_string()),
            None,
            None
        )
        .await
        .is_err());

        let payload = build_payload(None, Some("hi".to_string()), None, Some("t".to_string()))
            .await
            .unwrap();
        assert_eq!(payload.label(), "t");
    }

    #[tokio::test]
    async fn test_build_payload_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes").unwrap();

        match build_payload(None, None, Some(path), None).await.unwrap() {
            SourcePayload::File { file_name, bytes } => {
                assert_eq!(file_name, "notes.md");
                assert_eq!(bytes, b"# Notes");
            }
            _ => panic!("expected file payload"),
        }
    }
}
