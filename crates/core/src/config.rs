//! 설정 관리 — pknock.toml 파싱 및 런타임 설정
//!
//! [`PknockConfig`]는 로깅, 엔진, 노킹 룰 설정을 담는 최상위 구조체입니다.
//!
//! # 설정 로딩 우선순위
//! 1. 환경변수 (`PKNOCK_ENGINE_SWEEP_INTERVAL_SECS=10` 형식)
//! 2. 설정 파일 (`pknock.toml`)
//! 3. 기본값 (`Default` 구현)
//!
//! 룰 단위 불변식(포트 수, 시크릿 쌍 등)은 여기서 검사하지 않습니다.
//! 매칭 엔진이 [`RuleConfig`]로부터 룰을 생성할 때 전체를 한 번에 검증합니다.
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), pknock_core::error::PknockError> {
//! use pknock_core::config::PknockConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = PknockConfig::load("pknock.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = PknockConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, PknockError};
use crate::types::Protocol;

/// GC 스윕 주기 상한 (초)
const MAX_SWEEP_INTERVAL_SECS: u64 = 3600;

/// pknock 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PknockConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 매칭 엔진 설정
    #[serde(default)]
    pub engine: EngineSettings,
    /// 노킹 룰 목록
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl PknockConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, PknockError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드, 검증 없음).
    ///
    /// 검증은 오버라이드까지 적용한 뒤 [`load`](Self::load)에서 한 번만 수행합니다.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, PknockError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PknockError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                PknockError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, PknockError> {
        toml::from_str(toml_str).map_err(|e| {
            PknockError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `PKNOCK_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.general.log_level, "PKNOCK_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "PKNOCK_GENERAL_LOG_FORMAT");

        override_u64(
            &mut self.engine.sweep_interval_secs,
            "PKNOCK_ENGINE_SWEEP_INTERVAL_SECS",
        );
        override_usize(
            &mut self.engine.max_sources_per_rule,
            "PKNOCK_ENGINE_MAX_SOURCES_PER_RULE",
        );
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), PknockError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            }
            .into());
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            }
            .into());
        }

        // 0은 스위퍼 비활성화
        if self.engine.sweep_interval_secs > MAX_SWEEP_INTERVAL_SECS {
            return Err(ConfigError::InvalidValue {
                field: "engine.sweep_interval_secs".to_owned(),
                reason: format!("must be at most {MAX_SWEEP_INTERVAL_SECS}"),
            }
            .into());
        }

        if self.engine.max_sources_per_rule == 0 {
            return Err(ConfigError::InvalidValue {
                field: "engine.max_sources_per_rule".to_owned(),
                reason: "must be at least 1".to_owned(),
            }
            .into());
        }

        Ok(())
    }
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 매칭 엔진 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 유휴 출발지 상태 GC 주기 (초, 0이면 지연 회수만 수행)
    pub sweep_interval_secs: u64,
    /// 룰당 추적할 수 있는 최대 출발지 수
    pub max_sources_per_rule: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            max_sources_per_rule: 65_536,
        }
    }
}

/// 노킹 룰 원본 레코드
///
/// TOML `[[rules]]` 항목을 그대로 담습니다. 검증되지 않은 값이므로
/// 매칭 엔진에서 `Rule`로 변환해야 사용할 수 있습니다.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// 룰 이름 (같은 이름의 check_ip 룰이 이 룰의 인가 상태를 조회)
    pub name: String,
    /// 노크 포트 시퀀스
    pub ports: Vec<u16>,
    /// 노크 프로토콜
    pub protocol: Option<Protocol>,
    /// 연속 노크 사이 허용 간격 (초)
    pub time: Option<u64>,
    /// 시퀀스가 정확히 일치해야 하는지 여부
    pub strict: bool,
    /// 이미 인가된 출발지만 매칭하는 모드
    pub check_ip: bool,
    /// 접근 허용 시크릿
    pub open_secret: Option<String>,
    /// 접근 해제 시크릿
    pub close_secret: Option<String>,
    /// 인가 유지 시간 (초)
    pub autoclose: Option<u64>,
}

impl fmt::Debug for RuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleConfig")
            .field("name", &self.name)
            .field("ports", &self.ports)
            .field("protocol", &self.protocol)
            .field("time", &self.time)
            .field("strict", &self.strict)
            .field("check_ip", &self.check_ip)
            .field("open_secret", &self.open_secret.as_ref().map(|_| "<redacted>"))
            .field("close_secret", &self.close_secret.as_ref().map(|_| "<redacted>"))
            .field("autoclose", &self.autoclose)
            .finish()
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = PknockConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.engine.sweep_interval_secs, 30);
        assert_eq!(config.engine.max_sources_per_rule, 65_536);
        assert!(config.rules.is_empty());
    }

    #[test]
    fn default_config_passes_validation() {
        PknockConfig::default().validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = PknockConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert!(config.rules.is_empty());
    }

    #[test]
    fn from_str_rules_are_parsed() {
        let toml = r#"
[[rules]]
name = "ssh"
protocol = "udp"
ports = [1000, 2000, 3000]
time = 10
strict = true
open_secret = "open"
close_secret = "close"

[[rules]]
name = "ssh"
check_ip = true
"#;
        let config = PknockConfig::parse(toml).unwrap();
        assert_eq!(config.rules.len(), 2);

        let knock = &config.rules[0];
        assert_eq!(knock.ports, vec![1000, 2000, 3000]);
        assert_eq!(knock.protocol, Some(Protocol::Udp));
        assert_eq!(knock.time, Some(10));
        assert!(knock.strict);
        assert!(!knock.check_ip);

        let check = &config.rules[1];
        assert!(check.check_ip);
        assert!(check.ports.is_empty());
        assert_eq!(check.protocol, None);
    }

    #[test]
    fn from_str_unknown_protocol_fails_to_parse() {
        let toml = r#"
[[rules]]
name = "ssh"
protocol = "icmp"
"#;
        let err = PknockConfig::parse(toml).unwrap_err();
        assert!(matches!(
            err,
            PknockError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let err = PknockConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(
            err,
            PknockError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = PknockConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_invalid_log_format() {
        let mut config = PknockConfig::default();
        config.general.log_format = "xml".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn validate_rejects_excessive_sweep_interval() {
        let mut config = PknockConfig::default();
        config.engine.sweep_interval_secs = MAX_SWEEP_INTERVAL_SECS + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("sweep_interval_secs"));
    }

    #[test]
    fn validate_accepts_zero_sweep_interval() {
        let mut config = PknockConfig::default();
        config.engine.sweep_interval_secs = 0;
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut config = PknockConfig::default();
        config.engine.max_sources_per_rule = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_sources_per_rule"));
    }

    #[test]
    fn rule_config_debug_redacts_secrets() {
        let rule = RuleConfig {
            name: "ssh".to_owned(),
            open_secret: Some("open-sesame".to_owned()),
            close_secret: Some("close-sesame".to_owned()),
            ..Default::default()
        };
        let debug = format!("{rule:?}");
        assert!(!debug.contains("sesame"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    #[serial]
    fn env_override_u64() {
        let mut config = PknockConfig::default();
        // SAFETY: serial 테스트이므로 환경변수 조작이 다른 테스트와 겹치지 않습니다.
        unsafe { std::env::set_var("PKNOCK_ENGINE_SWEEP_INTERVAL_SECS", "5") };
        config.apply_env_overrides();
        assert_eq!(config.engine.sweep_interval_secs, 5);
        unsafe { std::env::remove_var("PKNOCK_ENGINE_SWEEP_INTERVAL_SECS") };
    }

    #[test]
    #[serial]
    fn env_override_invalid_keeps_original() {
        let mut config = PknockConfig::default();
        // SAFETY: serial 테스트이므로 환경변수 조작이 다른 테스트와 겹치지 않습니다.
        unsafe { std::env::set_var("PKNOCK_ENGINE_MAX_SOURCES_PER_RULE", "lots") };
        config.apply_env_overrides();
        assert_eq!(config.engine.max_sources_per_rule, 65_536);
        unsafe { std::env::remove_var("PKNOCK_ENGINE_MAX_SOURCES_PER_RULE") };
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "TEST_PKNOCK_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let mut config = PknockConfig::default();
        config.rules.push(RuleConfig {
            name: "web".to_owned(),
            ports: vec![7000, 8000],
            protocol: Some(Protocol::Tcp),
            time: Some(5),
            ..Default::default()
        });
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = PknockConfig::parse(&toml_str).unwrap();
        assert_eq!(parsed.rules, config.rules);
        assert_eq!(
            parsed.engine.max_sources_per_rule,
            config.engine.max_sources_per_rule
        );
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = PknockConfig::from_file("/nonexistent/path/pknock.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PknockError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
