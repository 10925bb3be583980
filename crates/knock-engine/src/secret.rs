//! 시크릿 검증기
//!
//! 패킷에 실린 토큰을 룰의 open/close 시크릿과 비교합니다.
//! 시크릿은 인증 자격 증명이므로 비교는 길이와 내용 모두에 대해
//! 상수 시간으로 수행합니다. 양쪽 값을 고정 크기 버퍼에 복사한 뒤
//! `subtle`로 비교하고, 길이 일치 여부도 같은 방식으로 합칩니다.

use subtle::ConstantTimeEq;

use crate::rule::{MAX_SECRET_LEN, Secret};

/// 시크릿 검증 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretCheck {
    /// 일치하거나, 룰에 시크릿이 설정되지 않음
    Valid,
    /// 토큰이 있지만 일치하지 않음
    Invalid,
    /// 시크릿이 필요한데 토큰이 없음
    Absent,
}

impl SecretCheck {
    /// 검증 통과 여부
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    /// 메트릭/로그용 사유 문자열
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Absent => "absent",
        }
    }
}

/// 시크릿 검증기
#[derive(Debug, Default, Clone, Copy)]
pub struct SecretValidator;

impl SecretValidator {
    /// 설정된 시크릿과 패킷 토큰을 비교합니다.
    ///
    /// 시크릿이 설정되지 않은 룰은 토큰과 무관하게 항상 `Valid`입니다.
    pub fn validate(configured: Option<&Secret>, token: Option<&[u8]>) -> SecretCheck {
        let Some(secret) = configured else {
            return SecretCheck::Valid;
        };
        let Some(token) = token else {
            return SecretCheck::Absent;
        };
        if constant_time_matches(secret.expose(), token) {
            SecretCheck::Valid
        } else {
            SecretCheck::Invalid
        }
    }
}

fn constant_time_matches(secret: &[u8], token: &[u8]) -> bool {
    let mut expected = [0u8; MAX_SECRET_LEN];
    let mut given = [0u8; MAX_SECRET_LEN];

    let secret_len = secret.len().min(MAX_SECRET_LEN);
    expected[..secret_len].copy_from_slice(&secret[..secret_len]);
    let token_len = token.len().min(MAX_SECRET_LEN);
    given[..token_len].copy_from_slice(&token[..token_len]);

    let same_len = (secret.len() as u64).ct_eq(&(token.len() as u64));
    let same_bytes = expected[..].ct_eq(&given[..]);
    (same_len & same_bytes).into()
}
