//! 룰 레지스트리 — 이름 공유와 룰 수명 관리
//!
//! check_ip 룰은 같은 이름의 노킹 룰이 가진 인가 상태를 읽습니다.
//! 따라서 레지스트리는 룰 이름마다 [`MatchEngine`] 하나를 두고, 노킹 룰 한 개와
//! 임의 개수의 check_ip 참조가 그 엔진을 공유합니다.
//!
//! 이름 맵은 `ArcSwap`으로 교체되므로 룰 설치/삭제가 패킷 평가를 막지 않습니다.
//! 설치/교체/삭제끼리는 쓰기 락으로 직렬화합니다.
//!
//! 설치마다 레지스트리 전체에서 유일한 일련번호를 발급하여 [`RuleId`]에 담습니다.
//! 제거된 설치의 핸들은 같은 이름으로 다시 설치된 룰을 평가하거나 제거하지 못합니다.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use metrics::gauge;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use pknock_core::config::RuleConfig;
use pknock_core::error::ConfigError;
use pknock_core::metrics as m;
use pknock_core::types::KnockPacket;

use crate::clock::{Clock, MonotonicClock};
use crate::engine::MatchEngine;
use crate::error::EngineError;
use crate::rule::{Rule, RuleName};
use crate::state::SourceView;
use crate::stats::RuleSnapshot;

/// 룰 이름당 기본 최대 출발지 수
pub const DEFAULT_MAX_SOURCES: usize = 65_536;

type EngineMap = HashMap<RuleName, Arc<MatchEngine>>;

/// 설치된 룰의 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// 노킹 시퀀스 룰
    Knock,
    /// 인가 여부만 확인하는 check_ip 룰
    Check,
}

impl RuleKind {
    /// 문자열 표현
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Knock => "knock",
            Self::Check => "check",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 설치된 룰 핸들
///
/// [`RuleRegistry::install`]이나 [`RuleRegistry::lookup`]으로만 얻을 수 있습니다.
/// 노킹 룰 핸들은 교체 후에도 유효하고, 제거되면 무효가 됩니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleId {
    name: RuleName,
    kind: RuleKind,
    installation: u64,
}

impl RuleId {
    pub(crate) fn new(name: RuleName, kind: RuleKind, installation: u64) -> Self {
        Self {
            name,
            kind,
            installation,
        }
    }

    /// 룰 이름
    pub fn name(&self) -> &RuleName {
        &self.name
    }

    /// 룰 종류
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// 설치 일련번호
    pub fn installation(&self) -> u64 {
        self.installation
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.kind)
    }
}

/// 룰 레지스트리
pub struct RuleRegistry {
    engines: ArcSwap<EngineMap>,
    write_lock: Mutex<()>,
    /// 마지막으로 발급한 설치 일련번호
    serial: AtomicU64,
    clock: Arc<dyn Clock>,
    max_sources: usize,
}

impl RuleRegistry {
    /// 단조 시계와 기본 용량으로 빈 레지스트리를 생성합니다.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock), DEFAULT_MAX_SOURCES)
    }

    /// 시계와 룰 이름당 최대 출발지 수를 지정하여 생성합니다.
    pub fn with_clock(clock: Arc<dyn Clock>, max_sources: usize) -> Self {
        Self {
            engines: ArcSwap::from_pointee(EngineMap::new()),
            write_lock: Mutex::new(()),
            serial: AtomicU64::new(0),
            clock,
            max_sources: max_sources.max(1),
        }
    }

    /// 룰을 설치합니다.
    ///
    /// # 에러
    /// - `RuleAlreadyExists`: 같은 이름의 노킹 룰이 이미 설치된 경우
    pub fn install(&self, rule: Rule) -> Result<RuleId, EngineError> {
        let _guard = self.write_lock.lock();
        let current = self.engines.load_full();
        let name = rule.name().clone();

        let (engine, is_new) = match current.get(&name) {
            Some(engine) => (Arc::clone(engine), false),
            None => (
                Arc::new(MatchEngine::new(
                    name.clone(),
                    self.max_sources,
                    Arc::clone(&self.clock),
                )),
                true,
            ),
        };

        let installation = self.next_serial();
        let kind = if rule.is_check() {
            engine.add_check(installation);
            RuleKind::Check
        } else {
            engine.install_rule(Arc::new(rule), installation)?;
            RuleKind::Knock
        };

        if is_new {
            let mut next = EngineMap::clone(&current);
            next.insert(name.clone(), engine);
            self.publish(next);
        } else {
            self.update_gauge(&current);
        }

        info!(rule = %name, kind = kind.as_str(), installation, "rule installed");
        Ok(RuleId::new(name, kind, installation))
    }

    /// 설정 레코드를 검증하여 설치합니다.
    pub fn install_config(&self, config: &RuleConfig) -> Result<RuleId, EngineError> {
        self.install(Rule::from_config(config)?)
    }

    /// 기존 노킹 룰의 정의를 교체합니다.
    ///
    /// 평가 중인 패킷은 새 정의로 다시 평가됩니다.
    /// 모든 출발지의 진행은 초기화되고 인가 상태는 유지됩니다.
    /// 반환되는 핸들은 설치 때 받은 핸들과 같습니다.
    pub fn replace(&self, rule: Rule) -> Result<RuleId, EngineError> {
        let name = rule.name().clone();
        if rule.is_check() {
            return Err(ConfigError::InvalidRule {
                rule: name.to_string(),
                reason: "only knock rules can be replaced".to_owned(),
            }
            .into());
        }

        let _guard = self.write_lock.lock();
        let engine = self
            .engines
            .load()
            .get(&name)
            .cloned()
            .ok_or_else(|| EngineError::RuleNotFound(name.to_string()))?;
        let generation = self.next_serial();
        let installation = engine.replace_rule(Arc::new(rule), generation)?;

        info!(rule = %name, installation, generation, "rule replaced");
        Ok(RuleId::new(name, RuleKind::Knock, installation))
    }

    /// 룰을 제거합니다. 제거할 룰이 없거나 핸들이 무효하면 `false`를 반환합니다.
    ///
    /// 노킹 룰을 제거하면 해당 이름의 출발지 상태가 모두 폐기됩니다.
    /// 노킹 룰과 check_ip 참조가 모두 사라지면 이름 자체를 정리합니다.
    pub fn remove(&self, id: &RuleId) -> bool {
        let _guard = self.write_lock.lock();
        let current = self.engines.load_full();
        let Some(engine) = current.get(id.name()) else {
            return false;
        };

        let removed = match id.kind() {
            RuleKind::Knock => engine.remove_rule(id.installation),
            RuleKind::Check => engine.release_check(id.installation),
        };
        if !removed {
            return false;
        }

        if engine.is_unused() {
            let mut next = EngineMap::clone(&current);
            next.remove(id.name());
            self.publish(next);
        } else {
            self.update_gauge(&current);
        }

        info!(rule = %id.name(), kind = id.kind().as_str(), "rule removed");
        true
    }

    /// 패킷을 룰로 평가합니다.
    ///
    /// 알 수 없는 룰이나 제거된 설치의 핸들은 매칭되지 않습니다.
    pub fn evaluate(&self, id: &RuleId, packet: &KnockPacket) -> bool {
        let engines = self.engines.load();
        let Some(engine) = engines.get(id.name()) else {
            warn!(rule = %id, "evaluate called for unknown rule");
            return false;
        };
        match id.kind() {
            RuleKind::Knock => engine.evaluate_as(Some(id.installation), packet),
            RuleKind::Check if engine.has_check(id.installation) => {
                engine.is_authorized(packet.src_ip)
            }
            RuleKind::Check => {
                debug!(rule = %id, "evaluate called with a removed check rule");
                false
            }
        }
    }

    /// 이름과 종류로 현재 설치된 룰의 핸들을 찾습니다.
    ///
    /// check_ip 룰이 여러 개면 가장 먼저 설치된 것의 핸들을 반환합니다.
    pub fn lookup(&self, name: &str, kind: RuleKind) -> Option<RuleId> {
        let engines = self.engines.load();
        let engine = engines.get(name)?;
        let installation = match kind {
            RuleKind::Knock => engine.installation()?,
            RuleKind::Check => engine.first_check()?,
        };
        Some(RuleId::new(engine.name().clone(), kind, installation))
    }

    /// 이름으로 룰 진단 스냅샷을 조회합니다.
    pub fn snapshot(&self, name: &str) -> Option<RuleSnapshot> {
        self.engines.load().get(name).map(|engine| engine.snapshot())
    }

    /// 모든 룰의 진단 스냅샷 (이름순)
    pub fn snapshots(&self) -> Vec<RuleSnapshot> {
        let mut snapshots: Vec<_> = self
            .engines
            .load()
            .values()
            .map(|engine| engine.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// 출발지 하나의 상태를 조회합니다.
    pub fn source_state(&self, name: &str, src: IpAddr) -> Option<SourceView> {
        self.engines.load().get(name)?.source(src)
    }

    /// 모든 룰의 유휴 출발지를 회수하고 회수한 총 수를 반환합니다.
    pub fn sweep(&self) -> usize {
        self.engines
            .load()
            .values()
            .map(|engine| engine.sweep())
            .sum()
    }

    /// 등록된 룰 이름 수
    pub fn len(&self) -> usize {
        self.engines.load().len()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.engines.load().is_empty()
    }

    /// 이름이 등록되어 있는지 확인합니다.
    pub fn contains(&self, name: &str) -> bool {
        self.engines.load().contains_key(name)
    }

    /// 룰 평가에 사용하는 시계
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publish(&self, next: EngineMap) {
        self.update_gauge(&next);
        self.engines.store(Arc::new(next));
    }

    fn update_gauge(&self, map: &EngineMap) {
        let installed: usize = map
            .values()
            .map(|engine| usize::from(engine.has_knock_rule()) + engine.check_refs())
            .sum();
        gauge!(m::KNOCK_RULES_INSTALLED).set(installed as f64);
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleRegistry")
            .field("rules", &self.len())
            .field("max_sources", &self.max_sources)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pknock_core::types::Protocol;
    use std::net::Ipv4Addr;

    const SRC: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));

    fn knock_config(name: &str) -> RuleConfig {
        RuleConfig {
            name: name.to_owned(),
            ports: vec![7000, 8000],
            protocol: Some(Protocol::Tcp),
            time: Some(5),
            ..Default::default()
        }
    }

    fn check_config(name: &str) -> RuleConfig {
        RuleConfig {
            name: name.to_owned(),
            check_ip: true,
            ..Default::default()
        }
    }

    fn registry() -> RuleRegistry {
        RuleRegistry::with_clock(Arc::new(ManualClock::new()), 128)
    }

    fn tcp(port: u16) -> KnockPacket {
        KnockPacket::new(SRC, port, Protocol::Tcp)
    }

    #[test]
    fn check_rule_reads_knock_rule_with_same_name() {
        let registry = registry();
        let knock = registry.install_config(&knock_config("ssh")).unwrap();
        let check = registry.install_config(&check_config("ssh")).unwrap();
        assert_eq!(registry.len(), 1);

        assert!(!registry.evaluate(&check, &tcp(22)));
        registry.evaluate(&knock, &tcp(7000));
        registry.evaluate(&knock, &tcp(8000));
        assert!(registry.evaluate(&check, &tcp(22)));
    }

    #[test]
    fn check_rule_may_precede_knock_rule() {
        let registry = registry();
        let check = registry.install_config(&check_config("web")).unwrap();
        assert!(!registry.evaluate(&check, &tcp(443)));

        let knock = registry.install_config(&knock_config("web")).unwrap();
        registry.evaluate(&knock, &tcp(7000));
        registry.evaluate(&knock, &tcp(8000));
        assert!(registry.evaluate(&check, &tcp(443)));
    }

    #[test]
    fn duplicate_knock_rule_is_rejected() {
        let registry = registry();
        registry.install_config(&knock_config("ssh")).unwrap();
        let err = registry.install_config(&knock_config("ssh")).unwrap_err();
        assert!(matches!(err, EngineError::RuleAlreadyExists(name) if name == "ssh"));
    }

    #[test]
    fn check_rules_are_reference_counted() {
        let registry = registry();
        let a = registry.install_config(&check_config("ssh")).unwrap();
        let b = registry.install_config(&check_config("ssh")).unwrap();
        assert_eq!(registry.snapshot("ssh").unwrap().check_refs, 2);

        assert!(registry.remove(&a));
        assert!(registry.contains("ssh"));
        assert!(registry.remove(&b));
        assert!(!registry.contains("ssh"));
        assert!(!registry.remove(&b));
    }

    #[test]
    fn removing_knock_rule_destroys_authorizations() {
        let registry = registry();
        let knock = registry.install_config(&knock_config("ssh")).unwrap();
        let check = registry.install_config(&check_config("ssh")).unwrap();
        registry.evaluate(&knock, &tcp(7000));
        registry.evaluate(&knock, &tcp(8000));

        assert!(registry.remove(&knock));
        assert!(registry.contains("ssh"));
        assert!(!registry.evaluate(&check, &tcp(22)));

        // 같은 이름으로 다시 설치하면 깨끗한 상태에서 시작
        registry.install_config(&knock_config("ssh")).unwrap();
        assert!(!registry.evaluate(&check, &tcp(22)));
        assert!(registry.source_state("ssh", SRC).is_none());
    }

    #[test]
    fn unknown_rule_fails_closed() {
        let registry = registry();
        let id = RuleId::new(RuleName::new("ghost").unwrap(), RuleKind::Knock, 1);
        assert!(!registry.evaluate(&id, &tcp(7000)));
        assert!(!registry.remove(&id));
        assert!(registry.lookup("ghost", RuleKind::Knock).is_none());
    }

    #[test]
    fn stale_knock_handle_cannot_touch_reinstalled_rule() {
        let registry = registry();
        let _check = registry.install_config(&check_config("ssh")).unwrap();
        let old = registry.install_config(&knock_config("ssh")).unwrap();
        assert!(registry.remove(&old));

        let new = registry.install_config(&knock_config("ssh")).unwrap();
        assert_ne!(old, new);

        // 이전 핸들로는 평가도 제거도 되지 않음
        assert!(!registry.evaluate(&old, &tcp(7000)));
        assert!(registry.source_state("ssh", SRC).is_none());
        assert!(!registry.remove(&old));
        assert_eq!(registry.snapshot("ssh").unwrap().ports, vec![7000, 8000]);

        registry.evaluate(&new, &tcp(7000));
        assert!(registry.evaluate(&new, &tcp(8000)));
    }

    #[test]
    fn removed_check_handle_stops_matching() {
        let registry = registry();
        let knock = registry.install_config(&knock_config("ssh")).unwrap();
        let first = registry.install_config(&check_config("ssh")).unwrap();
        let second = registry.install_config(&check_config("ssh")).unwrap();
        registry.evaluate(&knock, &tcp(7000));
        registry.evaluate(&knock, &tcp(8000));

        assert!(registry.remove(&first));
        assert!(!registry.evaluate(&first, &tcp(22)));
        assert!(registry.evaluate(&second, &tcp(22)));
        assert!(!registry.remove(&first));
    }

    #[test]
    fn replace_keeps_the_installed_handle() {
        let registry = registry();
        let knock = registry.install_config(&knock_config("ssh")).unwrap();
        let replaced = registry
            .replace(
                Rule::from_config(&RuleConfig {
                    ports: vec![9000],
                    ..knock_config("ssh")
                })
                .unwrap(),
            )
            .unwrap();
        assert_eq!(replaced, knock);
        assert_eq!(registry.lookup("ssh", RuleKind::Knock), Some(knock));
    }

    #[test]
    fn lookup_finds_installed_handles() {
        let registry = registry();
        let check = registry.install_config(&check_config("ssh")).unwrap();
        assert_eq!(registry.lookup("ssh", RuleKind::Check), Some(check));
        assert!(registry.lookup("ssh", RuleKind::Knock).is_none());
    }

    #[test]
    fn invalid_config_is_reported_as_config_error() {
        let registry = registry();
        let err = registry
            .install_config(&RuleConfig {
                ports: vec![],
                ..knock_config("ssh")
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(ConfigError::InvalidRule { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn replace_requires_existing_knock_rule() {
        let registry = registry();
        let rule = Rule::from_config(&knock_config("ssh")).unwrap();
        assert!(matches!(
            registry.replace(rule),
            Err(EngineError::RuleNotFound(_))
        ));

        let check = Rule::from_config(&check_config("ssh")).unwrap();
        assert!(matches!(registry.replace(check), Err(EngineError::Config(_))));
    }

    #[test]
    fn replace_swaps_definition() {
        let registry = registry();
        let knock = registry.install_config(&knock_config("ssh")).unwrap();
        registry.evaluate(&knock, &tcp(7000));

        let rule = Rule::from_config(&RuleConfig {
            ports: vec![9000],
            ..knock_config("ssh")
        })
        .unwrap();
        registry.replace(rule).unwrap();

        assert!(!registry.evaluate(&knock, &tcp(8000)));
        assert!(registry.evaluate(&knock, &tcp(9000)));
        assert_eq!(registry.snapshot("ssh").unwrap().ports, vec![9000]);
    }

    #[test]
    fn snapshots_are_sorted_by_name() {
        let registry = registry();
        for name in ["zeta", "alpha", "mid"] {
            registry.install_config(&knock_config(name)).unwrap();
        }
        let names: Vec<_> = registry.snapshots().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn rule_id_display() {
        let registry = registry();
        let id = registry.install_config(&check_config("ssh")).unwrap();
        assert_eq!(id.to_string(), "ssh[check]");
    }
}
