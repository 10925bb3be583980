//! 매칭 엔진 — 룰 이름 하나에 대한 패킷 평가
//!
//! [`MatchEngine`]은 같은 이름을 공유하는 노킹 룰과 check_ip 룰의 공통
//! 상태(출발지 저장소, 통계)를 소유하고, 패킷마다 시퀀스 추적기와 시크릿
//! 검증기를 조합하여 매칭 여부를 결정합니다.
//!
//! # 출발지 상태 전이
//! ```text
//!             노크 전진                 시퀀스 완료 + open 시크릿
//! UNAUTHORIZED ───────▶ KNOCKING ─────────────────────────────▶ AUTHORIZED
//!      ▲   ◀── 단절/시간 초과 ──┘                                    │
//!      └──────────── 시퀀스 완료 + close 시크릿 / autoclose ─────────┘
//! ```
//!
//! # 룰 교체와 평가
//! 노킹 룰은 정의 버전(`generation`)과 함께 통째로 교체됩니다. 평가는 출발지
//! 락을 잡은 뒤 버전을 다시 확인하고, 그 사이 룰이 바뀌었으면 새 정의로
//! 처음부터 다시 평가합니다. 룰이 제거되었으면 아무것도 기록하지 않고 거부합니다.
//!
//! # 실패 처리
//! 시크릿 불일치, 시퀀스 단절, 시간 초과는 정상적인 결과이며 "매칭 없음"으로
//! 끝납니다. 출발지 상태가 룰과 모순되면 해당 출발지만 초기화하고 거부합니다.
//! 어느 경우에도 다른 출발지의 평가에는 영향을 주지 않습니다.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{debug, error, info, warn};

use pknock_core::types::KnockPacket;

use crate::clock::Clock;
use crate::error::EngineError;
use crate::rule::{KnockSequence, Rule, RuleName};
use crate::secret::SecretValidator;
use crate::state::{SourceState, SourceView, StateStore};
use crate::stats::{RuleSnapshot, RuleStats};
use crate::tracker::{KnockStep, SequenceTracker};

/// 용량 초과 시 즉석 회수 사이의 최소 간격 (ms)
const PRESSURE_SWEEP_INTERVAL_MS: u64 = 1_000;

/// 설치된 노킹 룰
#[derive(Debug)]
struct ActiveRule {
    /// 설치 식별자 (교체해도 유지, 재설치하면 바뀜)
    installation: u64,
    /// 정의 버전 (설치/교체마다 바뀜)
    generation: u64,
    rule: Arc<Rule>,
}

/// 한 번의 평가 시도 결과
enum Pass {
    Decided(bool),
    /// 락을 잡는 사이 룰 정의가 바뀜
    RuleChanged,
    /// 락을 잡는 사이 룰이 제거됨
    RuleRemoved,
}

/// 룰 이름 하나에 대한 매칭 엔진
#[derive(Debug)]
pub struct MatchEngine {
    name: RuleName,
    active: ArcSwapOption<ActiveRule>,
    /// 이 이름을 참조하는 check_ip 룰의 설치 식별자
    checks: ArcSwap<Vec<u64>>,
    store: StateStore,
    stats: RuleStats,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    /// 마지막 즉석 회수 시각 (epoch 기준 ms + 1, 0이면 아직 없음)
    last_pressure_sweep: AtomicU64,
    pressure_sweeps: AtomicU64,
}

impl MatchEngine {
    /// 노킹 룰 없이 빈 엔진을 생성합니다.
    pub fn new(name: RuleName, max_sources: usize, clock: Arc<dyn Clock>) -> Self {
        let stats = RuleStats::new(name.as_str());
        let store = StateStore::with_gauge(max_sources, stats.active_sources_gauge());
        Self {
            name,
            active: ArcSwapOption::empty(),
            checks: ArcSwap::from_pointee(Vec::new()),
            store,
            stats,
            epoch: clock.now(),
            clock,
            last_pressure_sweep: AtomicU64::new(0),
            pressure_sweeps: AtomicU64::new(0),
        }
    }

    /// 룰 이름
    pub fn name(&self) -> &RuleName {
        &self.name
    }

    /// 현재 노킹 룰
    pub fn rule(&self) -> Option<Arc<Rule>> {
        self.active.load_full().map(|a| Arc::clone(&a.rule))
    }

    /// 노킹 룰이 설치되어 있는지 확인합니다.
    pub fn has_knock_rule(&self) -> bool {
        self.active.load().is_some()
    }

    /// 현재 노킹 룰의 설치 식별자
    pub fn installation(&self) -> Option<u64> {
        self.active.load_full().map(|a| a.installation)
    }

    /// 현재 노킹 룰의 정의 버전
    pub fn generation(&self) -> Option<u64> {
        self.active.load_full().map(|a| a.generation)
    }

    /// check_ip 참조 수
    pub fn check_refs(&self) -> usize {
        self.checks.load().len()
    }

    /// check_ip 설치 식별자가 살아 있는지 확인합니다.
    pub fn has_check(&self, installation: u64) -> bool {
        self.checks.load().contains(&installation)
    }

    pub(crate) fn first_check(&self) -> Option<u64> {
        self.checks.load().first().copied()
    }

    /// 노킹 룰도 check_ip 참조도 없는지 확인합니다.
    pub fn is_unused(&self) -> bool {
        !self.has_knock_rule() && self.check_refs() == 0
    }

    /// 노킹 룰을 설치합니다. 이미 있으면 `RuleAlreadyExists`를 반환합니다.
    ///
    /// `installation`은 레지스트리 전체에서 유일해야 합니다.
    pub(crate) fn install_rule(&self, rule: Arc<Rule>, installation: u64) -> Result<(), EngineError> {
        if self.has_knock_rule() {
            return Err(EngineError::RuleAlreadyExists(self.name.to_string()));
        }
        self.active.store(Some(Arc::new(ActiveRule {
            installation,
            generation: installation,
            rule,
        })));
        Ok(())
    }

    /// 노킹 룰의 정의를 `generation` 버전으로 교체하고 설치 식별자를 반환합니다.
    ///
    /// 모든 출발지의 진행은 초기화되고 인가 상태는 유지됩니다.
    pub(crate) fn replace_rule(&self, rule: Arc<Rule>, generation: u64) -> Result<u64, EngineError> {
        let Some(current) = self.active.load_full() else {
            return Err(EngineError::RuleNotFound(self.name.to_string()));
        };
        self.active.store(Some(Arc::new(ActiveRule {
            installation: current.installation,
            generation,
            rule,
        })));

        // 교체 직후 새 정의로 이미 진행한 항목은 건드리지 않음
        let now = self.clock.now();
        self.store.for_each_mut(|state| {
            if state.generation != generation {
                state.restart(now, generation);
            }
        });
        Ok(current.installation)
    }

    /// `installation`으로 설치된 노킹 룰을 제거하고 모든 출발지 상태를 폐기합니다.
    pub(crate) fn remove_rule(&self, installation: u64) -> bool {
        if self.installation() != Some(installation) {
            return false;
        }
        self.active.store(None);
        self.store.clear();
        true
    }

    pub(crate) fn add_check(&self, installation: u64) {
        self.checks.rcu(|ids| {
            let mut next = Vec::clone(ids);
            next.push(installation);
            next
        });
    }

    pub(crate) fn release_check(&self, installation: u64) -> bool {
        if !self.has_check(installation) {
            return false;
        }
        self.checks.rcu(|ids| {
            ids.iter()
                .copied()
                .filter(|&id| id != installation)
                .collect::<Vec<_>>()
        });
        true
    }

    /// 노킹 룰로 패킷을 평가합니다.
    ///
    /// 이 패킷으로 인한 상태 변경 이후의 인가 여부를 반환합니다.
    /// 여는 시퀀스를 완성한 패킷은 같은 평가에서 바로 허용됩니다.
    pub fn evaluate(&self, packet: &KnockPacket) -> bool {
        self.evaluate_as(None, packet)
    }

    /// `installation`이 주어지면 그 설치가 아직 유효할 때만 평가합니다.
    pub(crate) fn evaluate_as(&self, installation: Option<u64>, packet: &KnockPacket) -> bool {
        let mut counted = false;
        loop {
            let Some(active) = self.active.load_full() else {
                return false;
            };
            if installation.is_some_and(|id| id != active.installation) {
                return false;
            }
            let Some(seq) = active.rule.sequence() else {
                return false;
            };

            if !counted {
                self.stats.record_packet();
                counted = true;
            }
            if packet.protocol != seq.protocol() {
                return false;
            }

            match self.attempt(&active, seq, packet) {
                Pass::Decided(authorized) => return authorized,
                Pass::RuleChanged => continue,
                Pass::RuleRemoved => {
                    self.store.discard_untouched(packet.src_ip);
                    return false;
                }
            }
        }
    }

    fn attempt(&self, active: &ActiveRule, seq: &KnockSequence, packet: &KnockPacket) -> Pass {
        let now = self.clock.now();
        // 진행이 없는 출발지가 첫 포트가 아닌 포트를 두드리면 상태가 바뀌지 않으므로
        // 항목을 만들지 않습니다.
        let create = seq.ports().first() == Some(&packet.dst_port);

        let mut apply = |state: &mut SourceState| {
            let current = self.active.load();
            let generation = Option::as_ref(&*current).map(|a| a.generation);
            drop(current);
            match generation {
                None => return Pass::RuleRemoved,
                Some(generation) if generation != active.generation => {
                    return Pass::RuleChanged;
                }
                Some(_) => {}
            }
            if state.generation != active.generation {
                state.restart(now, active.generation);
            }
            match self.step(seq, state, packet, now) {
                Ok(authorized) => Pass::Decided(authorized),
                Err(err) => {
                    error!(rule = %self.name, error = %err, "invariant violation, resetting source");
                    state.reset(now);
                    Pass::Decided(false)
                }
            }
        };

        match self.store.with_source(packet.src_ip, now, create, &mut apply) {
            Ok(Some(pass)) => pass,
            Ok(None) => Pass::Decided(false),
            Err(_) => {
                // 가득 찬 경우 유휴 항목을 회수한 뒤 한 번 더 시도 (회수는 간격 제한)
                if self.try_pressure_sweep(now) {
                    if let Ok(result) = self.store.with_source(packet.src_ip, now, create, &mut apply) {
                        return result.unwrap_or(Pass::Decided(false));
                    }
                }
                self.stats.record_source_rejected();
                warn!(
                    rule = %self.name,
                    src_ip = %packet.src_ip,
                    capacity = self.store.capacity(),
                    "source table full, denying untracked source"
                );
                Pass::Decided(false)
            }
        }
    }

    /// 즉석 회수를 시도합니다. 간격 안에 이미 회수했거나 회수한 항목이 없으면 `false`입니다.
    fn try_pressure_sweep(&self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.epoch).as_millis();
        let stamp = u64::try_from(elapsed).unwrap_or(u64::MAX).saturating_add(1);
        let last = self.last_pressure_sweep.load(Ordering::Acquire);
        if last != 0 && stamp.saturating_sub(last) < PRESSURE_SWEEP_INTERVAL_MS {
            return false;
        }
        if self
            .last_pressure_sweep
            .compare_exchange(last, stamp, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.pressure_sweeps.fetch_add(1, Ordering::Relaxed);
        self.sweep() > 0
    }

    /// 출발지가 현재 인가 상태인지 확인합니다 (check_ip 룰).
    ///
    /// 상태를 변경하지 않습니다. autoclose가 지난 인가는 인가로 보지 않습니다.
    pub fn is_authorized(&self, src: IpAddr) -> bool {
        let Some(rule) = self.rule() else {
            return false;
        };
        let Some(seq) = rule.sequence() else {
            return false;
        };
        self.stats.record_packet();
        let now = self.clock.now();
        self.store
            .peek(src, |state| {
                state.authorized && !autoclose_elapsed(seq, state, now)
            })
            .unwrap_or(false)
    }

    /// 출발지 상태 스냅샷
    pub fn source(&self, src: IpAddr) -> Option<SourceView> {
        self.store.peek(src, SourceState::view)
    }

    /// 유휴 출발지 상태를 회수하고 회수한 수를 반환합니다.
    pub fn sweep(&self) -> usize {
        let Some(rule) = self.rule() else {
            return 0;
        };
        let Some(seq) = rule.sequence() else {
            return 0;
        };
        let now = self.clock.now();
        let reclaimed = self.store.reclaim(|state| is_idle(seq, state, now));
        self.stats.record_reclaimed(reclaimed);
        if reclaimed > 0 {
            debug!(rule = %self.name, reclaimed, "reclaimed idle sources");
        }
        reclaimed
    }

    /// 진단 스냅샷
    pub fn snapshot(&self) -> RuleSnapshot {
        let rule = self.rule();
        RuleSnapshot::build(
            self.name.as_str(),
            rule.as_deref(),
            self.check_refs(),
            self.store.len(),
            self.store.count(|state| state.authorized),
            self.stats.snapshot(),
        )
    }

    fn step(
        &self,
        seq: &KnockSequence,
        state: &mut SourceState,
        packet: &KnockPacket,
        now: Instant,
    ) -> Result<bool, EngineError> {
        let src = packet.src_ip;

        if state.authorized && autoclose_elapsed(seq, state, now) {
            state.authorized = false;
            state.matched_count = 0;
            state.last_transition_time = now;
            self.stats.record_close();
            info!(rule = %self.name, src_ip = %src, "authorization expired (autoclose)");
        }

        let outcome = SequenceTracker::observe(seq, state, packet.dst_port, now).map_err(|e| {
            EngineError::CorruptState {
                rule: self.name.to_string(),
                source_ip: src,
                reason: format!(
                    "matched_count {} exceeds sequence length {}",
                    e.matched_count, e.len
                ),
            }
        })?;

        if outcome.expired {
            self.stats.record_timeout();
            debug!(rule = %self.name, src_ip = %src, "knock interval elapsed, progress reset");
        }
        match outcome.step {
            KnockStep::Advanced => self.stats.record_knock_accepted(),
            KnockStep::ResetThenAdvanced => {
                self.stats.record_sequence_reset();
                self.stats.record_knock_accepted();
            }
            KnockStep::Reset => self.stats.record_sequence_reset(),
            KnockStep::NoChange => {}
        }
        if matches!(outcome.step, KnockStep::Reset | KnockStep::ResetThenAdvanced) {
            debug!(
                rule = %self.name,
                src_ip = %src,
                port = packet.dst_port,
                "strict sequence broken"
            );
        }

        if SequenceTracker::is_complete(seq, state) {
            state.matched_count = 0;
            let token = packet.token.as_deref();

            if state.authorized {
                let check = SecretValidator::validate(seq.close_secret(), token);
                if check.is_valid() {
                    state.authorized = false;
                    state.last_transition_time = now;
                    self.stats.record_close();
                    info!(rule = %self.name, src_ip = %src, "access closed");
                } else {
                    self.stats.record_secret_failure(check);
                    debug!(
                        rule = %self.name,
                        src_ip = %src,
                        reason = check.as_str(),
                        "close sequence rejected by secret check"
                    );
                }
            } else {
                let check = SecretValidator::validate(seq.open_secret(), token);
                if check.is_valid() {
                    state.authorized = true;
                    state.last_transition_time = now;
                    self.stats.record_authorization();
                    info!(rule = %self.name, src_ip = %src, "access opened");
                } else {
                    self.stats.record_secret_failure(check);
                    debug!(
                        rule = %self.name,
                        src_ip = %src,
                        reason = check.as_str(),
                        "open sequence rejected by secret check"
                    );
                }
            }
        }

        Ok(state.authorized)
    }
}

fn autoclose_elapsed(seq: &KnockSequence, state: &SourceState, now: Instant) -> bool {
    seq.autoclose()
        .is_some_and(|ttl| now.saturating_duration_since(state.last_transition_time) > ttl)
}

/// 회수 대상 판정
///
/// 미인가 출발지는 마지막 노크 이후 `max_interval`이 지나면 유휴입니다.
/// 인가된 출발지는 autoclose가 설정되어 있고 지났을 때만 회수합니다.
fn is_idle(seq: &KnockSequence, state: &SourceState, now: Instant) -> bool {
    if state.authorized {
        autoclose_elapsed(seq, state, now)
    } else {
        now.saturating_duration_since(state.last_knock_time) > seq.max_interval()
    }
}
