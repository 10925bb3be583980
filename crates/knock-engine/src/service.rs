//! 노킹 서비스 — 레지스트리 구성과 백그라운드 회수 태스크
//!
//! [`KnockService`]는 설정으로부터 [`RuleRegistry`]를 구성하고 [`Pipeline`]
//! trait을 구현합니다. `start()`는 주기적으로 유휴 출발지를 회수하는 낮은
//! 우선순위 태스크를 스폰하고, `stop()`은 태스크를 취소한 뒤 종료를 기다립니다.
//!
//! 패킷 평가는 서비스 상태와 무관하게 [`KnockService::registry`]로 언제든
//! 수행할 수 있습니다. 회수 태스크가 없어도 평가 경로의 지연 만료로 정확성은
//! 유지되며, 회수는 메모리 사용량만 제한합니다.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pknock_core::config::{EngineSettings, PknockConfig, RuleConfig};
use pknock_core::error::{PipelineError, PknockError};
use pknock_core::pipeline::{HealthStatus, Pipeline};

use crate::clock::{Clock, MonotonicClock};
use crate::registry::RuleRegistry;

/// 서비스 실행 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    /// 생성됨, 아직 시작하지 않음
    Initialized,
    /// 실행 중
    Running,
    /// 정지됨
    Stopped,
}

/// 노킹 서비스
pub struct KnockService {
    registry: Arc<RuleRegistry>,
    sweep_interval: Option<Duration>,
    state: ServiceState,
    cancel: Option<CancellationToken>,
    sweeper: Option<JoinHandle<()>>,
}

/// 노킹 서비스 빌더
pub struct KnockServiceBuilder {
    settings: EngineSettings,
    rules: Vec<RuleConfig>,
    clock: Option<Arc<dyn Clock>>,
}

impl KnockServiceBuilder {
    fn new() -> Self {
        Self {
            settings: EngineSettings::default(),
            rules: Vec::new(),
            clock: None,
        }
    }

    /// 엔진 설정을 지정합니다.
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// 설치할 룰을 추가합니다.
    pub fn rule(mut self, rule: RuleConfig) -> Self {
        self.rules.push(rule);
        self
    }

    /// 설치할 룰들을 추가합니다.
    pub fn rules(mut self, rules: impl IntoIterator<Item = RuleConfig>) -> Self {
        self.rules.extend(rules);
        self
    }

    /// 시계를 지정합니다 (기본: [`MonotonicClock`]).
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 레지스트리를 구성하고 모든 룰을 설치합니다.
    ///
    /// # 에러
    /// - `ConfigError::InvalidRule`: 처음 만난 잘못된 룰
    /// - `PknockError::Engine`: 같은 이름의 노킹 룰이 둘 이상인 경우
    pub fn build(self) -> Result<KnockService, PknockError> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock));
        let registry = RuleRegistry::with_clock(clock, self.settings.max_sources_per_rule);

        for rule in &self.rules {
            registry.install_config(rule)?;
        }

        info!(
            rules = self.rules.len(),
            names = registry.len(),
            max_sources_per_rule = self.settings.max_sources_per_rule,
            "knock service configured"
        );

        let sweep_interval = (self.settings.sweep_interval_secs > 0)
            .then(|| Duration::from_secs(self.settings.sweep_interval_secs));

        Ok(KnockService {
            registry: Arc::new(registry),
            sweep_interval,
            state: ServiceState::Initialized,
            cancel: None,
            sweeper: None,
        })
    }
}

impl KnockService {
    /// 빌더를 반환합니다.
    pub fn builder() -> KnockServiceBuilder {
        KnockServiceBuilder::new()
    }

    /// 설정 파일 내용으로 서비스를 구성합니다.
    pub fn from_config(config: &PknockConfig) -> Result<Self, PknockError> {
        config.validate()?;
        Self::builder()
            .settings(config.engine.clone())
            .rules(config.rules.iter().cloned())
            .build()
    }

    /// 공유 레지스트리
    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    /// 회수 주기 (비활성화된 경우 `None`)
    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval
    }

    /// 실행 중인지 확인합니다.
    pub fn is_running(&self) -> bool {
        self.state == ServiceState::Running
    }

    fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 첫 tick은 즉시 완료되므로 건너뜀
            interval.tick().await;
            debug!(interval_secs = period.as_secs(), "sweeper started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let reclaimed = registry.sweep();
                        if reclaimed > 0 {
                            debug!(reclaimed, "sweep completed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("sweeper received shutdown signal");
                        break;
                    }
                }
            }
        })
    }
}

impl Pipeline for KnockService {
    /// 회수 태스크를 시작합니다.
    async fn start(&mut self) -> Result<(), PknockError> {
        if self.state == ServiceState::Running {
            return Err(PipelineError::AlreadyRunning.into());
        }

        info!(rules = self.registry.len(), "starting knock service");

        if let Some(period) = self.sweep_interval {
            let cancel = CancellationToken::new();
            self.sweeper = Some(self.spawn_sweeper(period, cancel.clone()));
            self.cancel = Some(cancel);
        } else {
            warn!("sweep interval is 0, idle sources are reclaimed only on demand");
        }

        self.state = ServiceState::Running;
        Ok(())
    }

    /// 회수 태스크를 취소하고 종료를 기다립니다.
    async fn stop(&mut self) -> Result<(), PknockError> {
        if self.state != ServiceState::Running {
            return Err(PipelineError::NotRunning.into());
        }

        info!("stopping knock service");

        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(handle) = self.sweeper.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "sweeper task ended abnormally");
            }
        }

        self.state = ServiceState::Stopped;
        Ok(())
    }

    async fn health_check(&self) -> HealthStatus {
        match self.state {
            ServiceState::Running => match &self.sweeper {
                Some(handle) if handle.is_finished() => {
                    HealthStatus::Degraded("sweeper task exited".to_owned())
                }
                _ => HealthStatus::Healthy,
            },
            ServiceState::Initialized => HealthStatus::Unhealthy("not started".to_owned()),
            ServiceState::Stopped => HealthStatus::Unhealthy("stopped".to_owned()),
        }
    }
}

impl std::fmt::Debug for KnockService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnockService")
            .field("registry", &self.registry)
            .field("sweep_interval", &self.sweep_interval)
            .field("state", &self.state)
            .finish()
    }
}
