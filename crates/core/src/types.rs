//! 도메인 타입 — 매칭 엔진과 도구가 공유하는 공통 타입

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// IP 프로토콜 번호: TCP
pub const PROTO_TCP: u8 = 6;
/// IP 프로토콜 번호: UDP
pub const PROTO_UDP: u8 = 17;

/// 노킹에 사용할 수 있는 전송 계층 프로토콜
///
/// 원래 넷필터 모듈과 동일하게 TCP와 UDP만 지원합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP (SYN 노크)
    Tcp,
    /// UDP (데이터그램 노크)
    Udp,
}

impl Protocol {
    /// IP 프로토콜 번호에서 변환합니다.
    pub fn from_number(proto: u8) -> Option<Self> {
        match proto {
            PROTO_TCP => Some(Self::Tcp),
            PROTO_UDP => Some(Self::Udp),
            _ => None,
        }
    }

    /// IP 프로토콜 번호를 반환합니다.
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => PROTO_TCP,
            Self::Udp => PROTO_UDP,
        }
    }

    /// 소문자 이름을 반환합니다.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    /// 대소문자를 구분하지 않습니다.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(format!("unsupported protocol '{other}', expected tcp or udp")),
        }
    }
}

/// 매칭 엔진으로 전달되는 패킷 메타데이터
///
/// 패킷 디스패치 계층이 경계에서 검증을 마친 값만 담습니다.
/// `token`은 패킷에 실려 온 시크릿(SPA 페이로드 등)이며 없을 수 있습니다.
#[derive(Clone, PartialEq, Eq)]
pub struct KnockPacket {
    /// 출발지 IP
    pub src_ip: IpAddr,
    /// 목적지 포트
    pub dst_port: u16,
    /// 프로토콜
    pub protocol: Protocol,
    /// 패킷에 실린 토큰
    pub token: Option<Vec<u8>>,
}

impl KnockPacket {
    /// 토큰 없는 패킷을 생성합니다.
    pub fn new(src_ip: IpAddr, dst_port: u16, protocol: Protocol) -> Self {
        Self {
            src_ip,
            dst_port,
            protocol,
            token: None,
        }
    }

    /// 토큰을 붙입니다.
    pub fn with_token(mut self, token: impl Into<Vec<u8>>) -> Self {
        self.token = Some(token.into());
        self
    }
}

// 토큰은 자격 증명이므로 Debug 출력에서 길이만 노출합니다.
impl fmt::Debug for KnockPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnockPacket")
            .field("src_ip", &self.src_ip)
            .field("dst_port", &self.dst_port)
            .field("protocol", &self.protocol)
            .field("token_len", &self.token.as_ref().map(Vec::len))
            .finish()
    }
}

impl fmt::Display for KnockPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> :{} proto={}", self.src_ip, self.dst_port, self.protocol)
    }
}
