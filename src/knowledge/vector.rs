//! Vector Store - 벡터 검색 트레이트 및 유틸리티
//!
//! 조각(fragment)을 (벡터, 텍스트, 테넌트 태그, 소스 태그)로 저장하고
//! 필터 조건과 함께 유사도 검색합니다.
//!
//! 필터는 저장소가 지원하면 서버 측에서 평가하지만, 결과는 항상
//! 클라이언트 측에서 한 번 더 걸러냅니다 (`FragmentFilter::matches`).

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::tenant::SHARED_TENANT;

// ============================================================================
// Types
// ============================================================================

/// 저장 전 조각 (임베딩 포함)
#[derive(Debug, Clone)]
pub struct NewFragment {
    /// 테넌트 ID
    pub tenant_id: String,
    /// 소스 ID (캐스케이드 삭제 태그)
    pub source_id: String,
    /// 소스 라벨 (URL, 파일명, 제목)
    pub source_label: String,
    /// 소스 내 순번 (0-based)
    pub ordinal: u32,
    /// 조각 텍스트
    pub text: String,
    /// 임베딩 벡터
    pub vector: Vec<f32>,
}

impl NewFragment {
    /// 결정적 조각 ID
    ///
    /// 같은 조각을 다시 upsert해도 중복 저장되지 않도록
    /// (테넌트, 소스, 순번, 텍스트)의 SHA-256 해시를 사용합니다.
    pub fn fragment_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.tenant_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.source_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.ordinal.to_le_bytes());
        hasher.update(self.text.as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
    }

    /// 저장된 형태로 변환 (벡터 제외)
    pub fn to_stored(&self) -> StoredFragment {
        StoredFragment {
            id: self.fragment_id(),
            tenant_id: self.tenant_id.clone(),
            source_id: self.source_id.clone(),
            source_label: self.source_label.clone(),
            ordinal: self.ordinal,
            text: self.text.clone(),
        }
    }
}

/// 저장된 조각 (검색 결과용, 벡터 제외)
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFragment {
    pub id: String,
    pub tenant_id: String,
    pub source_id: String,
    pub source_label: String,
    pub ordinal: u32,
    pub text: String,
}

/// 검색 결과
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub fragment: StoredFragment,
    /// 거리 (작을수록 유사)
    pub distance: f32,
}

// ============================================================================
// Filter
// ============================================================================

/// 조각 필터 조건
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentFilter {
    /// 전체
    All,
    /// 특정 테넌트 파티션만 (공유 파티션 제외)
    Tenant(String),
    /// 테넌트 파티션 + 공유 파티션 (`tenant_all`)
    TenantWithShared(String),
    /// 특정 테넌트의 특정 소스
    Source { tenant_id: String, source_id: String },
}

impl FragmentFilter {
    /// 클라이언트 측 평가
    pub fn matches(&self, fragment: &StoredFragment) -> bool {
        match self {
            FragmentFilter::All => true,
            FragmentFilter::Tenant(tenant) => fragment.tenant_id == *tenant,
            FragmentFilter::TenantWithShared(tenant) => {
                fragment.tenant_id == *tenant || fragment.tenant_id == SHARED_TENANT
            }
            FragmentFilter::Source {
                tenant_id,
                source_id,
            } => fragment.tenant_id == *tenant_id && fragment.source_id == *source_id,
        }
    }

    /// SQL 조건절 (LanceDB `only_if` / `delete` 용)
    ///
    /// `All`이면 None
    pub fn to_sql(&self) -> Option<String> {
        match self {
            FragmentFilter::All => None,
            FragmentFilter::Tenant(tenant) => {
                Some(format!("tenant_id = '{}'", escape_sql(tenant)))
            }
            FragmentFilter::TenantWithShared(tenant) => Some(format!(
                "(tenant_id = '{}' OR tenant_id = '{}')",
                escape_sql(tenant),
                SHARED_TENANT
            )),
            FragmentFilter::Source {
                tenant_id,
                source_id,
            } => Some(format!(
                "tenant_id = '{}' AND source_id = '{}'",
                escape_sql(tenant_id),
                escape_sql(source_id)
            )),
        }
    }
}

/// SQL 문자열 리터럴 이스케이프
fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// VectorStore 트레이트 (async)
///
/// 벡터 저장소의 공통 인터페이스입니다.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// 조각 upsert (같은 ID는 교체). 저장된 조각 ID 목록 반환
    async fn upsert(&self, fragments: &[NewFragment]) -> Result<Vec<String>>;

    /// 벡터 검색 (거리 오름차순)
    async fn query(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &FragmentFilter,
    ) -> Result<Vec<SearchResult>>;

    /// 필터에 맞는 조각 삭제. 삭제된 개수 반환
    async fn delete(&self, filter: &FragmentFilter) -> Result<usize>;

    /// 필터에 맞는 조각 개수
    async fn count(&self, filter: &FragmentFilter) -> Result<usize>;

    /// 필터에 맞는 조각 목록 (저장 순서)
    async fn fragments(
        &self,
        filter: &FragmentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<StoredFragment>>;

    /// 저장 구조 전체 삭제 (다음 사용 시 새로 생성)
    async fn reset(&self) -> Result<()>;

    /// 저장소 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
