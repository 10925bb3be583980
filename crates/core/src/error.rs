//! 에러 타입 — 도메인별 에러 정의
//!
//! 인증 실패(시크릿 불일치, 시퀀스 단절, 시간 초과)는 에러가 아닙니다.
//! 매칭 엔진은 이를 "매칭 없음"으로 처리하며 여기에는 정의하지 않습니다.

/// pknock 최상위 에러 타입
#[derive(Debug, thiserror::Error)]
pub enum PknockError {
    /// 설정 관련 에러
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// 매칭 엔진 에러
    #[error("engine error: {0}")]
    Engine(String),

    /// 파이프라인 라이프사이클 에러
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 설정 관련 에러
///
/// 룰 적재 시점에 관리자에게 그대로 보고되며, 자동으로 보정되지 않습니다.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// 설정 파일을 찾을 수 없음
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// 설정 파싱 실패
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// 유효하지 않은 설정 값
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// 유효하지 않은 노킹 룰
    #[error("invalid rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },
}

/// 파이프라인 라이프사이클 에러
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 이미 실행 중
    #[error("pipeline is already running")]
    AlreadyRunning,

    /// 실행 중이 아님
    #[error("pipeline is not running")]
    NotRunning,

    /// 초기화 실패
    #[error("pipeline init failed: {0}")]
    InitFailed(String),
}
