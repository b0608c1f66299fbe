//! Driver Error Types
//!
//! 드라이버 에러 정의
//! (디스패처, 복제 컨트롤러, 그룹 관리에서 공통 사용)

use std::io;
use thiserror::Error;

// ============================================================================
// DriverError - 드라이버 에러
// ============================================================================

/// 드라이버 에러
#[derive(Error, Debug)]
pub enum DriverError {
    /// 연결 에러 (연결 거부/리셋, 끊어진 세션)
    #[error("Connection error: {0}")]
    Connection(String),

    /// 타임아웃 에러
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 인증 에러
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// 프로토콜 에러
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 쿼리 에러 (서버 보고)
    #[error("Query error: {code} - {message}")]
    Query { code: String, message: String },

    /// 설정 에러
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 사용 가능한 호스트 없음
    #[error("No usable host: {0}")]
    NoUsableHost(String),

    /// 그룹 불일치 (소스/레플리카 모두 비어 있음)
    #[error("Host group '{group}' is inconsistent: it has neither source nor replica hosts")]
    InconsistentGroup { group: String },

    /// 읽기 전용 연결에서 쓰기 시도
    #[error("Illegal in read-only mode: {0}")]
    ReadOnly(String),

    /// 트랜잭션 도중 물리 연결 유실
    #[error("Transaction lost: {0}")]
    TransactionLost(String),

    /// 트랜잭션 에러
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// 닫힌 연결
    #[error("Connection is closed")]
    Closed,

    /// 알 수 없는 그룹
    #[error("Unknown host group: {0}")]
    UnknownGroup(String),

    /// I/O 에러
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DriverError {
    /// 연결 에러 생성
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// 타임아웃 에러 생성
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// 인증 에러 생성
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// 프로토콜 에러 생성
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 쿼리 에러 생성
    pub fn query(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query {
            code: code.into(),
            message: message.into(),
        }
    }

    /// 설정 에러 생성
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// 호스트 없음 에러 생성
    pub fn no_usable_host(msg: impl Into<String>) -> Self {
        Self::NoUsableHost(msg.into())
    }

    /// 그룹 불일치 에러 생성
    pub fn inconsistent_group(group: impl Into<String>) -> Self {
        Self::InconsistentGroup {
            group: group.into(),
        }
    }

    /// 읽기 전용 위반 에러 생성
    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::ReadOnly(msg.into())
    }

    /// 트랜잭션 유실 에러 생성
    pub fn transaction_lost(msg: impl Into<String>) -> Self {
        Self::TransactionLost(msg.into())
    }

    /// 트랜잭션 에러 생성
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// 일시적 네트워크 장애 여부 (다른 호스트로 재시도, 블록리스트 등록)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Io(_) => true,
            Self::Query { code, .. } => is_retryable_code(code),
            _ => false,
        }
    }

    /// 클라이언트 에러 여부
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::Configuration(_)
                | Self::Query { .. }
                | Self::ReadOnly(_)
                | Self::Transaction(_)
        )
    }

    /// SQLSTATE 형식 에러 코드
    pub fn code(&self) -> &str {
        match self {
            Self::Connection(_) | Self::Timeout(_) | Self::Io(_) => "08S01",
            Self::Authentication(_) => "28000",
            Self::Protocol(_) => "08P01",
            Self::Query { code, .. } => code,
            Self::Configuration(_) => "HY024",
            Self::NoUsableHost(_) => "08001",
            Self::InconsistentGroup { .. } => "MH001",
            Self::ReadOnly(_) => "25006",
            Self::TransactionLost(_) => "08007",
            Self::Transaction(_) => "25000",
            Self::Closed => "08003",
            Self::UnknownGroup(_) => "MH002",
        }
    }
}

/// SQLSTATE 클래스 08 = 연결 예외
fn is_retryable_code(code: &str) -> bool {
    code.starts_with("08")
}

// ============================================================================
// Result Type - 결과 타입
// ============================================================================

/// 드라이버 결과 타입
pub type DriverResult<T> = Result<T, DriverError>;

// ============================================================================
// Tests
// ============================================================================
