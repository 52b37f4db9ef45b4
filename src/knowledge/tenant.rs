//! 테넌트 식별자

use std::fmt;

/// 모든 테넌트가 공유하는 예약 파티션
pub const SHARED_TENANT: &str = "tenant_all";

/// 테넌트 ID 최대 길이
const MAX_TENANT_LEN: usize = 64;

/// 검증된 테넌트 ID
///
/// 1~64자, `[A-Za-z0-9_.-]`만 허용합니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(String);

impl TenantId {
    /// 검증 후 생성
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("tenant id must not be empty".to_string());
        }
        if trimmed.chars().count() > MAX_TENANT_LEN {
            return Err(format!(
                "tenant id must be at most {} characters",
                MAX_TENANT_LEN
            ));
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
        {
            return Err(format!("tenant id contains invalid character {:?}", bad));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 공유 파티션 여부
    pub fn is_shared(&self) -> bool {
        self.0 == SHARED_TENANT
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
