//! 메트릭 상수 및 설명 등록
//!
//! 모든 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 엔진은 이 상수를 사용하여 `metrics::counter!()`, `metrics::gauge!()` 매크로를 호출합니다.
//! 레코더가 설치되지 않았으면 호출은 아무 효과가 없습니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `pknock_`
//! - 접미어: `_total` (counter), 없음 (gauge)
//! - 모든 메트릭은 `rule` 레이블을 가집니다.
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(pknock_core::metrics::KNOCK_PACKETS_TOTAL, "rule" => "ssh").increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 룰 이름 레이블 키
pub const LABEL_RULE: &str = "rule";

/// 실패 사유 레이블 키 (invalid, absent)
pub const LABEL_REASON: &str = "reason";

// ─── 매칭 엔진 메트릭 ──────────────────────────────────────────────

/// 평가된 전체 패킷 수 (counter)
pub const KNOCK_PACKETS_TOTAL: &str = "pknock_packets_total";

/// 시퀀스를 한 단계 전진시킨 노크 수 (counter)
pub const KNOCK_ACCEPTED_TOTAL: &str = "pknock_knocks_accepted_total";

/// strict 룰에서 시퀀스가 끊어진 횟수 (counter)
pub const KNOCK_SEQUENCE_RESETS_TOTAL: &str = "pknock_sequence_resets_total";

/// 노크 간격 초과로 진행이 초기화된 횟수 (counter)
pub const KNOCK_TIMEOUTS_TOTAL: &str = "pknock_timeouts_total";

/// 접근 허용 전환 수 (counter)
pub const KNOCK_AUTHORIZATIONS_TOTAL: &str = "pknock_authorizations_total";

/// 접근 해제 전환 수 (counter)
pub const KNOCK_CLOSES_TOTAL: &str = "pknock_closes_total";

/// 시크릿 검증 실패 수 (counter, label: reason)
pub const KNOCK_SECRET_FAILURES_TOTAL: &str = "pknock_secret_failures_total";

/// 용량 초과로 추적하지 못한 출발지 수 (counter)
pub const KNOCK_SOURCES_REJECTED_TOTAL: &str = "pknock_sources_rejected_total";

/// GC로 회수된 출발지 상태 수 (counter)
pub const KNOCK_SOURCES_RECLAIMED_TOTAL: &str = "pknock_sources_reclaimed_total";

/// 현재 추적 중인 출발지 수 (gauge)
pub const KNOCK_ACTIVE_SOURCES: &str = "pknock_active_sources";

/// 설치된 룰 수 (gauge)
pub const KNOCK_RULES_INSTALLED: &str = "pknock_rules_installed";

// ─── 설명 등록 함수 ─────────────────────────────────────────────────

/// 모든 메트릭의 설명(description)을 등록합니다.
///
/// 전역 레코더 설치 후 한 번만 호출해야 합니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(
        KNOCK_PACKETS_TOTAL,
        "Total number of packets evaluated by the knock matcher"
    );
    describe_counter!(
        KNOCK_ACCEPTED_TOTAL,
        "Knocks that advanced a source's sequence progress"
    );
    describe_counter!(
        KNOCK_SEQUENCE_RESETS_TOTAL,
        "Sequence breaks on strict rules"
    );
    describe_counter!(
        KNOCK_TIMEOUTS_TOTAL,
        "Knock progress discarded because the inter-knock interval elapsed"
    );
    describe_counter!(
        KNOCK_AUTHORIZATIONS_TOTAL,
        "Sources transitioned to authorized"
    );
    describe_counter!(
        KNOCK_CLOSES_TOTAL,
        "Sources transitioned back to unauthorized (close sequence or autoclose)"
    );
    describe_counter!(
        KNOCK_SECRET_FAILURES_TOTAL,
        "Completed sequences rejected by secret validation"
    );
    describe_counter!(
        KNOCK_SOURCES_REJECTED_TOTAL,
        "New sources denied because the per-rule state table was full"
    );
    describe_counter!(
        KNOCK_SOURCES_RECLAIMED_TOTAL,
        "Idle source entries reclaimed by garbage collection"
    );
    describe_gauge!(
        KNOCK_ACTIVE_SOURCES,
        "Number of source entries currently tracked per rule"
    );
    describe_gauge!(KNOCK_RULES_INSTALLED, "Number of rule names installed");
}
