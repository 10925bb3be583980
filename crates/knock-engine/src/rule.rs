//! 노킹 룰 — 검증된 불변 룰 정의
//!
//! [`Rule`]은 설정 레코드([`RuleConfig`])를 한 번에 검증하여 생성되며,
//! 이후에는 읽기 전용입니다. 용량 상한은 원래 넷필터 모듈의 고정 버퍼
//! 크기를 그대로 따르며, 초과 값은 잘라내지 않고 거부합니다.
//!
//! # 룰 종류
//! - **Knock**: 포트 시퀀스, 프로토콜, 노크 간격, strict 여부, 선택적 시크릿 쌍
//! - **CheckAuthorized**: 같은 이름의 Knock 룰에서 이미 인가된 출발지만 매칭

use std::borrow::Borrow;
use std::fmt;
use std::time::Duration;

use subtle::ConstantTimeEq;

use pknock_core::config::RuleConfig;
use pknock_core::error::ConfigError;
use pknock_core::types::Protocol;

/// 노크 시퀀스 최대 길이
pub const MAX_PORTS: usize = 15;
/// 룰 이름 최대 길이 (바이트)
pub const MAX_RULE_NAME_LEN: usize = 31;
/// 시크릿 최대 길이 (바이트)
pub const MAX_SECRET_LEN: usize = 31;

/// 검증된 룰 이름
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleName(String);

impl RuleName {
    /// 이름을 검증하여 생성합니다.
    ///
    /// ASCII 영숫자와 `-`, `_`, `.`만 허용합니다.
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        if name.is_empty() {
            return Err(invalid(&name, "name is required"));
        }
        if name.len() > MAX_RULE_NAME_LEN {
            return Err(invalid(
                &name,
                format!("name is longer than {MAX_RULE_NAME_LEN} bytes"),
            ));
        }
        if !name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(invalid(
                &name,
                "name may only contain ASCII letters, digits, '-', '_' and '.'",
            ));
        }
        Ok(Self(name))
    }

    /// 문자열 참조를 반환합니다.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RuleName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 공유 시크릿
///
/// 자격 증명이므로 `Debug`에서 값을 노출하지 않고, 비교는
/// 상수 시간으로만 수행합니다.
#[derive(Clone)]
pub struct Secret(Box<[u8]>);

impl Secret {
    fn new(rule: &str, field: &str, value: &str) -> Result<Self, ConfigError> {
        if value.is_empty() {
            return Err(invalid(rule, format!("{field} must not be empty")));
        }
        if value.len() > MAX_SECRET_LEN {
            return Err(invalid(
                rule,
                format!("{field} is longer than {MAX_SECRET_LEN} bytes"),
            ));
        }
        Ok(Self(value.as_bytes().into()))
    }

    /// 시크릿 바이트를 반환합니다.
    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// 접근 허용/해제 시크릿 쌍
///
/// 둘 다 있거나 둘 다 없어야 하므로 하나의 타입으로 묶습니다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretPair {
    /// 접근 허용 시크릿
    pub open: Secret,
    /// 접근 해제 시크릿
    pub close: Secret,
}

/// 노크 시퀀스 정의
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnockSequence {
    ports: Vec<u16>,
    protocol: Protocol,
    max_interval: Duration,
    strict: bool,
    secrets: Option<SecretPair>,
    autoclose: Option<Duration>,
}

impl KnockSequence {
    /// 요구 포트 시퀀스
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// 노크 프로토콜
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// 연속 노크 사이 허용 간격
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// strict 모드 여부
    pub fn strict(&self) -> bool {
        self.strict
    }

    /// 시크릿 쌍
    pub fn secrets(&self) -> Option<&SecretPair> {
        self.secrets.as_ref()
    }

    /// 접근 허용 시크릿
    pub fn open_secret(&self) -> Option<&Secret> {
        self.secrets.as_ref().map(|s| &s.open)
    }

    /// 접근 해제 시크릿
    pub fn close_secret(&self) -> Option<&Secret> {
        self.secrets.as_ref().map(|s| &s.close)
    }

    /// 인가 유지 시간
    pub fn autoclose(&self) -> Option<Duration> {
        self.autoclose
    }
}

/// 룰 동작 모드
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMode {
    /// 노크 시퀀스를 추적하여 인가 상태를 전환
    Knock(KnockSequence),
    /// 이미 인가된 출발지만 매칭 (상태 변경 없음)
    CheckAuthorized,
}

/// 검증된 노킹 룰
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    name: RuleName,
    mode: RuleMode,
}

impl Rule {
    /// 설정 레코드를 전체 검증하여 룰을 생성합니다.
    ///
    /// 첫 번째 위반 사항을 `ConfigError::InvalidRule`로 반환합니다.
    pub fn from_config(config: &RuleConfig) -> Result<Self, ConfigError> {
        let name = RuleName::new(config.name.clone())?;
        let rule = name.as_str();

        if config.check_ip {
            if !config.ports.is_empty() {
                return Err(invalid(rule, "cannot specify ports with check_ip"));
            }
            if config.open_secret.is_some() || config.close_secret.is_some() {
                return Err(invalid(
                    rule,
                    "cannot specify open_secret and close_secret with check_ip",
                ));
            }
            if config.time.is_some() {
                return Err(invalid(rule, "cannot specify time with check_ip"));
            }
            if config.autoclose.is_some() {
                return Err(invalid(rule, "cannot specify autoclose with check_ip"));
            }
            return Ok(Self {
                name,
                mode: RuleMode::CheckAuthorized,
            });
        }

        if config.ports.is_empty() {
            return Err(invalid(rule, "ports are required unless check_ip is set"));
        }
        if config.ports.len() > MAX_PORTS {
            return Err(invalid(
                rule,
                format!(
                    "too many ports specified ({} > {MAX_PORTS})",
                    config.ports.len()
                ),
            ));
        }
        if config.ports.contains(&0) {
            return Err(invalid(rule, "port 0 is not a valid knock port"));
        }

        let Some(protocol) = config.protocol else {
            return Err(invalid(rule, "protocol is required (tcp or udp)"));
        };

        let max_interval = match config.time {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                return Err(invalid(
                    rule,
                    "time must be a positive number of seconds",
                ));
            }
        };

        let secrets = match (&config.open_secret, &config.close_secret) {
            (None, None) => None,
            (Some(_), None) => {
                return Err(invalid(rule, "open_secret must go with close_secret"));
            }
            (None, Some(_)) => {
                return Err(invalid(rule, "close_secret must go with open_secret"));
            }
            (Some(open), Some(close)) => Some(SecretPair {
                open: Secret::new(rule, "open_secret", open)?,
                close: Secret::new(rule, "close_secret", close)?,
            }),
        };

        let autoclose = match config.autoclose {
            None => None,
            Some(0) => {
                return Err(invalid(rule, "autoclose must be a positive number of seconds"));
            }
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            name,
            mode: RuleMode::Knock(KnockSequence {
                ports: config.ports.clone(),
                protocol,
                max_interval,
                strict: config.strict,
                secrets,
                autoclose,
            }),
        })
    }

    /// 룰 이름
    pub fn name(&self) -> &RuleName {
        &self.name
    }

    /// 룰 모드
    pub fn mode(&self) -> &RuleMode {
        &self.mode
    }

    /// Knock 룰이면 시퀀스 정의를 반환합니다.
    pub fn sequence(&self) -> Option<&KnockSequence> {
        match &self.mode {
            RuleMode::Knock(seq) => Some(seq),
            RuleMode::CheckAuthorized => None,
        }
    }

    /// CheckAuthorized 룰인지 확인합니다.
    pub fn is_check(&self) -> bool {
        matches!(self.mode, RuleMode::CheckAuthorized)
    }
}

impl TryFrom<&RuleConfig> for Rule {
    type Error = ConfigError;

    fn try_from(config: &RuleConfig) -> Result<Self, Self::Error> {
        Self::from_config(config)
    }
}

fn invalid(rule: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidRule {
        rule: rule.to_owned(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn knock_config(ports: &[u16]) -> RuleConfig {
        RuleConfig {
            name: "ssh".to_owned(),
            ports: ports.to_vec(),
            protocol: Some(Protocol::Udp),
            time: Some(10),
            ..Default::default()
        }
    }

    fn reason(err: ConfigError) -> String {
        match err {
            ConfigError::InvalidRule { reason, .. } => reason,
            other => panic!("expected InvalidRule, got {other:?}"),
        }
    }

    #[test]
    fn valid_knock_rule() {
        let rule = Rule::from_config(&knock_config(&[1000, 2000, 3000])).unwrap();
        assert_eq!(rule.name().as_str(), "ssh");
        let seq = rule.sequence().unwrap();
        assert_eq!(seq.ports(), &[1000, 2000, 3000]);
        assert_eq!(seq.protocol(), Protocol::Udp);
        assert_eq!(seq.max_interval(), Duration::from_secs(10));
        assert!(!seq.strict());
        assert!(seq.secrets().is_none());
    }

    #[test]
    fn valid_check_rule() {
        let config = RuleConfig {
            name: "ssh".to_owned(),
            check_ip: true,
            ..Default::default()
        };
        let rule = Rule::from_config(&config).unwrap();
        assert!(rule.is_check());
        assert!(rule.sequence().is_none());
    }

    #[test]
    fn name_is_required() {
        let mut config = knock_config(&[1000]);
        config.name = String::new();
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("name is required"));
    }

    #[test]
    fn name_length_is_bounded_not_truncated() {
        let mut config = knock_config(&[1000]);
        config.name = "a".repeat(MAX_RULE_NAME_LEN);
        assert!(Rule::from_config(&config).is_ok());

        config.name = "a".repeat(MAX_RULE_NAME_LEN + 1);
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("longer than"));
    }

    #[test]
    fn name_rejects_whitespace() {
        let mut config = knock_config(&[1000]);
        config.name = "my rule".to_owned();
        assert!(Rule::from_config(&config).is_err());
    }

    #[test]
    fn knock_rule_requires_ports() {
        let err = Rule::from_config(&knock_config(&[])).unwrap_err();
        assert!(reason(err).contains("ports are required"));
    }

    #[test]
    fn port_count_is_bounded() {
        let ports: Vec<u16> = (1..=MAX_PORTS as u16).collect();
        assert!(Rule::from_config(&knock_config(&ports)).is_ok());

        let ports: Vec<u16> = (1..=MAX_PORTS as u16 + 1).collect();
        let err = Rule::from_config(&knock_config(&ports)).unwrap_err();
        assert!(reason(err).contains("too many ports"));
    }

    #[test]
    fn port_zero_is_rejected() {
        let err = Rule::from_config(&knock_config(&[1000, 0])).unwrap_err();
        assert!(reason(err).contains("port 0"));
    }

    #[test]
    fn knock_rule_requires_protocol() {
        let mut config = knock_config(&[1000]);
        config.protocol = None;
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("protocol"));
    }

    #[test]
    fn knock_rule_requires_positive_time() {
        let mut config = knock_config(&[1000]);
        config.time = None;
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("time"));

        config.time = Some(0);
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("time"));
    }

    #[test]
    fn secrets_must_come_in_pairs() {
        let mut config = knock_config(&[1000]);
        config.open_secret = Some("open".to_owned());
        let err = Rule::from_config(&config).unwrap_err();
        assert!(reason(err).contains("open_secret must go with close_secret"));

        let mut config = knock_config(&[1000]);
        config.close_secret = Some("close".to_owned());
        let err = Rule::from_config(&config).unwrap_err();
        assert!(reason(err).contains("close_secret must go with open_secret"));
    }

    #[test]
    fn secret_pair_is_accepted() {
        let mut config = knock_config(&[1000]);
        config.open_secret = Some("open".to_owned());
        config.close_secret = Some("close".to_owned());
        let rule = Rule::from_config(&config).unwrap();
        let seq = rule.sequence().unwrap();
        assert_eq!(seq.open_secret().unwrap().expose(), b"open");
        assert_eq!(seq.close_secret().unwrap().expose(), b"close");
    }

    #[test]
    fn secret_length_is_bounded() {
        let mut config = knock_config(&[1000]);
        config.open_secret = Some("x".repeat(MAX_SECRET_LEN + 1));
        config.close_secret = Some("close".to_owned());
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("open_secret"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        let mut config = knock_config(&[1000]);
        config.open_secret = Some(String::new());
        config.close_secret = Some("close".to_owned());
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("must not be empty"));
    }

    #[test]
    fn check_rule_excludes_knock_fields() {
        let base = RuleConfig {
            name: "ssh".to_owned(),
            check_ip: true,
            ..Default::default()
        };

        let with_ports = RuleConfig {
            ports: vec![1000],
            ..base.clone()
        };
        assert!(reason(Rule::from_config(&with_ports).unwrap_err()).contains("ports"));

        let with_secret = RuleConfig {
            open_secret: Some("a".to_owned()),
            close_secret: Some("b".to_owned()),
            ..base.clone()
        };
        assert!(reason(Rule::from_config(&with_secret).unwrap_err()).contains("secret"));

        let with_time = RuleConfig {
            time: Some(5),
            ..base.clone()
        };
        assert!(reason(Rule::from_config(&with_time).unwrap_err()).contains("time"));

        let with_autoclose = RuleConfig {
            autoclose: Some(60),
            ..base
        };
        assert!(reason(Rule::from_config(&with_autoclose).unwrap_err()).contains("autoclose"));
    }

    #[test]
    fn autoclose_zero_is_rejected() {
        let mut config = knock_config(&[1000]);
        config.autoclose = Some(0);
        assert!(reason(Rule::from_config(&config).unwrap_err()).contains("autoclose"));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let mut config = knock_config(&[1000]);
        config.open_secret = Some("open-sesame".to_owned());
        config.close_secret = Some("close-sesame".to_owned());
        let rule = Rule::from_config(&config).unwrap();
        let debug = format!("{rule:?}");
        assert!(!debug.contains("sesame"));
    }

    #[test]
    fn rule_name_borrows_as_str() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(RuleName::new("ssh").unwrap(), 1);
        assert_eq!(map.get("ssh"), Some(&1));
    }
}
