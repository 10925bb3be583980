//! 룰별 통계 및 진단 스냅샷
//!
//! [`RuleStats`]는 패킷 평가 경로에서 락 없이 증가하는 원자 카운터이며,
//! 같은 값을 `metrics` 파사드로도 내보냅니다. [`RuleSnapshot`]은 룰
//! 정의와 카운터를 읽기 전용으로 노출하되 시크릿 값은 포함하지 않습니다.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{Counter, Gauge, counter, gauge};
use serde::Serialize;

use pknock_core::metrics as m;
use pknock_core::types::Protocol;

use crate::rule::Rule;
use crate::secret::SecretCheck;

/// 룰 레이블이 붙은 메트릭 핸들 (생성 시 한 번 등록)
struct Handles {
    packets: Counter,
    knocks_accepted: Counter,
    sequence_resets: Counter,
    timeouts: Counter,
    authorizations: Counter,
    closes: Counter,
    secret_invalid: Counter,
    secret_absent: Counter,
    sources_rejected: Counter,
    sources_reclaimed: Counter,
    active_sources: Gauge,
}

impl Handles {
    fn register(rule: &str) -> Self {
        let rule_counter = |name: &'static str| counter!(name, m::LABEL_RULE => rule.to_owned());
        let secret_counter = |check: SecretCheck| {
            counter!(
                m::KNOCK_SECRET_FAILURES_TOTAL,
                m::LABEL_RULE => rule.to_owned(),
                m::LABEL_REASON => check.as_str()
            )
        };
        Self {
            packets: rule_counter(m::KNOCK_PACKETS_TOTAL),
            knocks_accepted: rule_counter(m::KNOCK_ACCEPTED_TOTAL),
            sequence_resets: rule_counter(m::KNOCK_SEQUENCE_RESETS_TOTAL),
            timeouts: rule_counter(m::KNOCK_TIMEOUTS_TOTAL),
            authorizations: rule_counter(m::KNOCK_AUTHORIZATIONS_TOTAL),
            closes: rule_counter(m::KNOCK_CLOSES_TOTAL),
            secret_invalid: secret_counter(SecretCheck::Invalid),
            secret_absent: secret_counter(SecretCheck::Absent),
            sources_rejected: rule_counter(m::KNOCK_SOURCES_REJECTED_TOTAL),
            sources_reclaimed: rule_counter(m::KNOCK_SOURCES_RECLAIMED_TOTAL),
            active_sources: gauge!(m::KNOCK_ACTIVE_SOURCES, m::LABEL_RULE => rule.to_owned()),
        }
    }
}

/// 룰별 누적 카운터
///
/// 메트릭 핸들은 생성 시점의 전역 레코더에 등록됩니다. 레코더는 서비스를
/// 만들기 전에 설치해야 합니다.
pub struct RuleStats {
    rule: String,
    packets: AtomicU64,
    knocks_accepted: AtomicU64,
    sequence_resets: AtomicU64,
    timeouts: AtomicU64,
    authorizations: AtomicU64,
    closes: AtomicU64,
    secret_failures: AtomicU64,
    sources_rejected: AtomicU64,
    sources_reclaimed: AtomicU64,
    handles: Handles,
}

impl RuleStats {
    /// 룰 이름을 레이블로 쓰는 카운터 집합을 생성합니다.
    pub fn new(rule: impl Into<String>) -> Self {
        let rule = rule.into();
        Self {
            handles: Handles::register(&rule),
            rule,
            packets: AtomicU64::new(0),
            knocks_accepted: AtomicU64::new(0),
            sequence_resets: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            authorizations: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            secret_failures: AtomicU64::new(0),
            sources_rejected: AtomicU64::new(0),
            sources_reclaimed: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.handles.packets.increment(1);
    }

    pub(crate) fn record_knock_accepted(&self) {
        self.knocks_accepted.fetch_add(1, Ordering::Relaxed);
        self.handles.knocks_accepted.increment(1);
    }

    pub(crate) fn record_sequence_reset(&self) {
        self.sequence_resets.fetch_add(1, Ordering::Relaxed);
        self.handles.sequence_resets.increment(1);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.handles.timeouts.increment(1);
    }

    pub(crate) fn record_authorization(&self) {
        self.authorizations.fetch_add(1, Ordering::Relaxed);
        self.handles.authorizations.increment(1);
    }

    pub(crate) fn record_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.handles.closes.increment(1);
    }

    pub(crate) fn record_secret_failure(&self, check: SecretCheck) {
        self.secret_failures.fetch_add(1, Ordering::Relaxed);
        match check {
            SecretCheck::Absent => self.handles.secret_absent.increment(1),
            _ => self.handles.secret_invalid.increment(1),
        }
    }

    pub(crate) fn record_source_rejected(&self) {
        self.sources_rejected.fetch_add(1, Ordering::Relaxed);
        self.handles.sources_rejected.increment(1);
    }

    pub(crate) fn record_reclaimed(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.sources_reclaimed
            .fetch_add(count as u64, Ordering::Relaxed);
        self.handles.sources_reclaimed.increment(count as u64);
    }

    /// 추적 중인 출발지 수 게이지 (저장소가 삽입/회수 시 갱신)
    pub(crate) fn active_sources_gauge(&self) -> Gauge {
        self.handles.active_sources.clone()
    }

    /// 현재 카운터 값을 복사합니다.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            knocks_accepted: self.knocks_accepted.load(Ordering::Relaxed),
            sequence_resets: self.sequence_resets.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            authorizations: self.authorizations.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            secret_failures: self.secret_failures.load(Ordering::Relaxed),
            sources_rejected: self.sources_rejected.load(Ordering::Relaxed),
            sources_reclaimed: self.sources_reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for RuleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleStats")
            .field("rule", &self.rule)
            .field("counters", &self.snapshot())
            .finish()
    }
}

/// 카운터 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// 평가된 패킷 수
    pub packets: u64,
    /// 시퀀스를 전진시킨 노크 수
    pub knocks_accepted: u64,
    /// strict 시퀀스 단절 수
    pub sequence_resets: u64,
    /// 노크 간격 초과 수
    pub timeouts: u64,
    /// 인가 전환 수
    pub authorizations: u64,
    /// 해제 전환 수
    pub closes: u64,
    /// 시크릿 검증 실패 수
    pub secret_failures: u64,
    /// 용량 초과로 거부된 출발지 수
    pub sources_rejected: u64,
    /// 회수된 출발지 수
    pub sources_reclaimed: u64,
}

/// 룰 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// 노킹 룰이 설치됨
    Knock,
    /// check_ip 참조만 있고 노킹 룰은 없음
    CheckOnly,
}

/// 룰 진단 스냅샷 (시크릿 제외)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleSnapshot {
    /// 룰 이름
    pub name: String,
    /// 종류
    pub kind: SnapshotKind,
    /// 노크 포트 시퀀스
    pub ports: Vec<u16>,
    /// 노크 프로토콜
    pub protocol: Option<Protocol>,
    /// 노크 간격 (초)
    pub max_interval_secs: Option<u64>,
    /// strict 여부
    pub strict: bool,
    /// 시크릿 설정 여부
    pub has_secrets: bool,
    /// 인가 유지 시간 (초)
    pub autoclose_secs: Option<u64>,
    /// 이 이름을 참조하는 check_ip 룰 수
    pub check_refs: usize,
    /// 추적 중인 출발지 수
    pub active_sources: usize,
    /// 인가된 출발지 수
    pub authorized_sources: usize,
    /// 카운터
    pub counters: StatsSnapshot,
}

impl RuleSnapshot {
    pub(crate) fn build(
        name: &str,
        rule: Option<&Rule>,
        check_refs: usize,
        active_sources: usize,
        authorized_sources: usize,
        counters: StatsSnapshot,
    ) -> Self {
        let seq = rule.and_then(Rule::sequence);
        Self {
            name: name.to_owned(),
            kind: if seq.is_some() {
                SnapshotKind::Knock
            } else {
                SnapshotKind::CheckOnly
            },
            ports: seq.map(|s| s.ports().to_vec()).unwrap_or_default(),
            protocol: seq.map(|s| s.protocol()),
            max_interval_secs: seq.map(|s| s.max_interval().as_secs()),
            strict: seq.is_some_and(|s| s.strict()),
            has_secrets: seq.is_some_and(|s| s.secrets().is_some()),
            autoclose_secs: seq.and_then(|s| s.autoclose()).map(|d| d.as_secs()),
            check_refs,
            active_sources,
            authorized_sources,
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
    use pknock_core::config::RuleConfig;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// 등록 횟수를 세고 모든 카운터를 하나의 값에 누적하는 레코더
    #[derive(Default)]
    struct CountingRecorder {
        registrations: AtomicUsize,
        total: Arc<AtomicU64>,
    }

    impl Recorder for CountingRecorder {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, _: &Key, _: &Metadata<'_>) -> Counter {
            self.registrations.fetch_add(1, Ordering::Relaxed);
            Counter::from_arc(Arc::clone(&self.total))
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            self.registrations.fetch_add(1, Ordering::Relaxed);
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    #[test]
    fn metric_handles_are_registered_once_per_rule() {
        let recorder = CountingRecorder::default();
        metrics::with_local_recorder(&recorder, || {
            let stats = RuleStats::new("ssh");
            let registered = recorder.registrations.load(Ordering::Relaxed);
            assert_eq!(registered, 11);

            for _ in 0..100 {
                stats.record_packet();
                stats.record_knock_accepted();
            }
            stats.record_secret_failure(SecretCheck::Absent);

            assert_eq!(recorder.registrations.load(Ordering::Relaxed), registered);
            assert_eq!(recorder.total.load(Ordering::Relaxed), 201);
        });
    }

    #[test]
    fn counters_accumulate() {
        let stats = RuleStats::new("ssh");
        stats.record_packet();
        stats.record_packet();
        stats.record_knock_accepted();
        stats.record_secret_failure(SecretCheck::Invalid);
        stats.record_reclaimed(3);
        stats.record_reclaimed(0);

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.knocks_accepted, 1);
        assert_eq!(snap.secret_failures, 1);
        assert_eq!(snap.sources_reclaimed, 3);
        assert_eq!(snap.authorizations, 0);
    }

    #[test]
    fn snapshot_never_contains_secret_material() {
        let rule = Rule::from_config(&RuleConfig {
            name: "ssh".to_owned(),
            ports: vec![1000, 2000],
            protocol: Some(Protocol::Udp),
            time: Some(10),
            open_secret: Some("open-sesame".to_owned()),
            close_secret: Some("close-sesame".to_owned()),
            ..Default::default()
        })
        .unwrap();

        let snap = RuleSnapshot::build("ssh", Some(&rule), 1, 0, 0, StatsSnapshot::default());
        assert!(snap.has_secrets);
        assert_eq!(snap.kind, SnapshotKind::Knock);
        assert_eq!(snap.max_interval_secs, Some(10));

        let json = serde_json::to_string(&snap).unwrap();
        assert!(!json.contains("sesame"));
    }

    #[test]
    fn check_only_snapshot() {
        let snap = RuleSnapshot::build("ssh", None, 2, 0, 0, StatsSnapshot::default());
        assert_eq!(snap.kind, SnapshotKind::CheckOnly);
        assert!(snap.ports.is_empty());
        assert_eq!(snap.protocol, None);
        assert_eq!(snap.check_refs, 2);
    }
}
