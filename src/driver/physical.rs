//! Physical connections
//!
//! 물리 연결 인터페이스
//!
//! 호스트 하나에 대한 세션은 와이어 프로토콜 계층이 제공합니다.
//! 멀티 호스트 계층은 [`Connector`]와 [`PhysicalConnection`]만 사용합니다.

use std::fmt;
use std::time::Duration;

use super::driver::{AuthToken, ServerAddress};
use super::error::DriverResult;

// ============================================================================
// Operation - 작업
// ============================================================================

/// 작업 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// 읽기
    Read,
    /// 쓰기 (데이터/스키마 변경)
    Write,
}

impl OperationKind {
    /// 첫 키워드로 구문 분류
    pub fn classify(sql: &str) -> Self {
        let keyword = sql
            .trim_start_matches(|c: char| c.is_whitespace() || c == '(')
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match keyword.as_str() {
            "SELECT" | "SHOW" | "DESCRIBE" | "DESC" | "EXPLAIN" | "VALUES" | "TABLE" => Self::Read,
            _ => Self::Write,
        }
    }

    /// 쓰기 작업
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write)
    }
}

/// 물리 연결로 전달되는 작업
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    sql: String,
    kind: OperationKind,
}

impl Operation {
    /// 구문 텍스트로 분류된 작업 생성
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let kind = OperationKind::classify(&sql);
        Self { sql, kind }
    }

    /// 읽기 작업
    pub fn read(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: OperationKind::Read,
        }
    }

    /// 쓰기 작업
    pub fn write(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            kind: OperationKind::Write,
        }
    }

    /// 구문 텍스트
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// 작업 종류
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl From<&str> for Operation {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Operation {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// 작업 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// 처리한 호스트
    pub host: ServerAddress,
    /// 영향받은/반환된 행 수
    pub rows: u64,
}

impl Outcome {
    /// 새 결과 생성
    pub fn new(host: ServerAddress, rows: u64) -> Self {
        Self { host, rows }
    }
}

// ============================================================================
// Connector / PhysicalConnection - 물리 연결
// ============================================================================

/// [`Connector::open`] 파라미터
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    /// 인증 정보
    pub auth: AuthToken,
    /// 기본 데이터베이스
    pub database: Option<String>,
    /// 연결 타임아웃 (0이면 무제한)
    pub connect_timeout: Duration,
}

/// 호스트 하나에 대한 물리 연결
///
/// [`DriverError::is_retryable`](super::DriverError::is_retryable)로 분류된 에러는
/// 일시적 네트워크 장애로 처리되고, 나머지는 재시도 없이 반환됩니다.
pub trait PhysicalConnection: Send {
    /// 연결된 호스트
    fn host(&self) -> &ServerAddress;

    /// 작업 실행
    fn execute(&mut self, op: &Operation) -> DriverResult<Outcome>;

    /// 핑
    fn ping(&mut self) -> DriverResult<()>;

    /// 세션 유효 여부
    fn is_valid(&self) -> bool;

    /// 자동 커밋 설정
    fn set_auto_commit(&mut self, auto_commit: bool) -> DriverResult<()>;

    /// 읽기 전용 설정
    fn set_read_only(&mut self, read_only: bool) -> DriverResult<()>;

    /// 커밋
    fn commit(&mut self) -> DriverResult<()>;

    /// 롤백
    fn rollback(&mut self) -> DriverResult<()>;

    /// 세션 닫기
    fn close(&mut self);
}

impl fmt::Debug for dyn PhysicalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("host", self.host())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// 물리 연결 생성기
pub trait Connector: Send + Sync {
    /// `host`에 연결 및 인증
    fn open(&self, host: &ServerAddress, ctx: &ConnectContext)
        -> DriverResult<Box<dyn PhysicalConnection>>;
}
