//! pknock 공통 크레이트
//!
//! 포트 노킹 매칭 엔진과 운영 도구가 공유하는 타입, 에러, 설정, 메트릭 상수를 정의합니다.
//!
//! # 모듈 구성
//! - [`config`]: `pknock.toml` 파싱, 환경변수 오버라이드, 유효성 검증
//! - [`error`]: 도메인별 에러 타입
//! - [`metrics`]: 메트릭 이름 상수 및 설명 등록
//! - [`pipeline`]: 서비스 라이프사이클 trait
//! - [`types`]: 패킷/프로토콜 등 공통 도메인 타입

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod types;

// --- 주요 타입 re-export ---

// 에러
pub use error::{ConfigError, PipelineError, PknockError};

// 설정
pub use config::{EngineSettings, GeneralConfig, PknockConfig, RuleConfig};

// 파이프라인 trait
pub use pipeline::{HealthStatus, Pipeline};

// 도메인 타입
pub use types::{KnockPacket, Protocol};
