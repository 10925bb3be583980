//! 파이프라인 trait — 장기 실행 서비스의 라이프사이클 정의

use std::future::Future;

use crate::error::PknockError;

/// 서비스 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// 정상
    Healthy,
    /// 동작하지만 일부 기능 저하
    Degraded(String),
    /// 비정상
    Unhealthy(String),
}

impl HealthStatus {
    /// 정상 상태인지 확인합니다.
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// 시작/정지 가능한 서비스 trait
pub trait Pipeline: Send {
    /// 서비스를 시작합니다.
    fn start(&mut self) -> impl Future<Output = Result<(), PknockError>> + Send;

    /// 서비스를 정지합니다.
    fn stop(&mut self) -> impl Future<Output = Result<(), PknockError>> + Send;

    /// 현재 상태를 확인합니다.
    fn health_check(&self) -> impl Future<Output = HealthStatus> + Send;
}
