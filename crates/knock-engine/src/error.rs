//! 매칭 엔진 에러 타입
//!
//! [`EngineError`]는 룰 적재/교체/삭제 시점의 에러를 표현합니다.
//! 패킷 평가 경로에서는 에러를 호출자에게 전파하지 않습니다.
//! 인증 실패는 결과값으로, 내부 불변식 위반은 로그 후 거부로 처리됩니다.

use std::net::IpAddr;

use pknock_core::error::{ConfigError, PknockError};

/// 매칭 엔진 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// 룰 설정 오류
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// 같은 이름의 노킹 룰이 이미 존재
    #[error("knock rule '{0}' already exists")]
    RuleAlreadyExists(String),

    /// 룰을 찾을 수 없음
    #[error("rule '{0}' not found")]
    RuleNotFound(String),

    /// 출발지 상태가 룰과 맞지 않음 (내부 불변식 위반)
    #[error("corrupt state for {source_ip} in rule '{rule}': {reason}")]
    CorruptState {
        /// 룰 이름
        rule: String,
        /// 출발지 IP
        source_ip: IpAddr,
        /// 위반 내용
        reason: String,
    },
}

impl From<EngineError> for PknockError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Config(e) => PknockError::Config(e),
            other => PknockError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn config_error_stays_config_error() {
        let err = EngineError::Config(ConfigError::InvalidRule {
            rule: "ssh".to_owned(),
            reason: "too many ports".to_owned(),
        });
        let top: PknockError = err.into();
        assert!(matches!(
            top,
            PknockError::Config(ConfigError::InvalidRule { .. })
        ));
    }

    #[test]
    fn other_errors_convert_to_engine_error() {
        let top: PknockError = EngineError::RuleAlreadyExists("ssh".to_owned()).into();
        assert!(matches!(top, PknockError::Engine(_)));
        assert!(top.to_string().contains("ssh"));
    }

    #[test]
    fn corrupt_state_display() {
        let err = EngineError::CorruptState {
            rule: "ssh".to_owned(),
            source_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            reason: "matched_count 4 exceeds sequence length 3".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1"));
        assert!(msg.contains("exceeds"));
    }
}
