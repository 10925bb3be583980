//! pknock 포트 노킹 매칭 엔진
//!
//! 원격 호스트가 미리 약속한 포트 시퀀스를 제한 시간 안에 두드려야만
//! 보호된 서비스로의 접근을 허용하는 매칭 엔진입니다. 출발지 IP별로 진행을
//! 추적하고, 순서와 간격을 강제하며, 선택적인 open/close 시크릿을 검증합니다.
//!
//! # 모듈 구성
//! - [`rule`]: 룰 정의와 설정 레코드 검증
//! - [`state`]: 출발지별 상태 저장소 (DashMap + 출발지별 락)
//! - [`tracker`]: 시퀀스 추적기 (순서/간격/strict 처리)
//! - [`secret`]: 상수 시간 시크릿 검증
//! - [`engine`]: 룰 이름 하나에 대한 패킷 평가
//! - [`registry`]: 룰 설치/교체/삭제와 이름 공유
//! - [`stats`]: 룰별 카운터와 진단 스냅샷
//! - [`service`]: 레지스트리 구성과 백그라운드 회수 태스크
//! - [`clock`]: 단조 시계 추상화
//!
//! # 사용 예
//! ```
//! use std::net::{IpAddr, Ipv4Addr};
//! use pknock_core::{KnockPacket, Protocol, RuleConfig};
//! use pknock_engine::RuleRegistry;
//!
//! let registry = RuleRegistry::new();
//! let ssh = registry
//!     .install_config(&RuleConfig {
//!         name: "ssh".to_owned(),
//!         ports: vec![1000, 2000],
//!         protocol: Some(Protocol::Udp),
//!         time: Some(10),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! let src = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
//! assert!(!registry.evaluate(&ssh, &KnockPacket::new(src, 1000, Protocol::Udp)));
//! assert!(registry.evaluate(&ssh, &KnockPacket::new(src, 2000, Protocol::Udp)));
//! ```

pub mod clock;
pub mod engine;
pub mod error;
pub mod registry;
pub mod rule;
pub mod secret;
pub mod service;
pub mod state;
pub mod stats;
pub mod tracker;

// --- 주요 타입 re-export ---

// 레지스트리 / 서비스
pub use registry::{RuleId, RuleKind, RuleRegistry};
pub use service::{KnockService, KnockServiceBuilder};

// 룰
pub use rule::{KnockSequence, Rule, RuleMode, RuleName};

// 상태 / 통계
pub use state::{SourcePhase, SourceView};
pub use stats::{RuleSnapshot, SnapshotKind, StatsSnapshot};

// 시계
pub use clock::{Clock, ManualClock, MonotonicClock};

// 에러
pub use error::EngineError;
