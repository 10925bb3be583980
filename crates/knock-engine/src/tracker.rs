//! 시퀀스 추적기
//!
//! 관측된 목적지 포트 하나로 출발지의 시퀀스 진행을 전진시키거나 초기화합니다.
//!
//! # 규칙
//! 1. 진행 중(`matched_count > 0`)이고 마지막 노크 이후 `max_interval`이
//!    지났으면 먼저 진행을 0으로 초기화합니다 (시간 초과).
//! 2. 포트가 다음 기대 포트와 같으면 전진합니다.
//! 3. 다르면 strict 룰은 진행을 0으로 초기화한 뒤 같은 포트를 첫 포트와
//!    다시 비교합니다. 한 번의 노크가 새 시퀀스의 시작일 수 있습니다.
//! 4. non-strict 룰은 일치하지 않는 포트를 무시합니다.
//!
//! 완료(`matched_count == ports.len()`) 판정과 그 이후 처리는 엔진이 담당합니다.

use std::time::Instant;

use crate::rule::KnockSequence;
use crate::state::SourceState;

/// 노크 하나가 진행에 미친 영향
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnockStep {
    /// 다음 기대 포트와 일치하여 전진
    Advanced,
    /// strict 룰에서 시퀀스가 끊어진 뒤 같은 노크로 새 시퀀스 시작
    ResetThenAdvanced,
    /// strict 룰에서 시퀀스가 끊어짐 (새 시퀀스도 시작하지 않음)
    Reset,
    /// 변화 없음
    NoChange,
}

/// 추적 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOutcome {
    /// 진행 변화
    pub step: KnockStep,
    /// 비교 전에 시간 초과로 진행이 초기화되었는지 여부
    pub expired: bool,
}

/// 다음 기대 포트가 시퀀스 범위를 벗어남 (내부 불변식 위반)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressOutOfRange {
    /// 상태의 진행 인덱스
    pub matched_count: usize,
    /// 시퀀스 길이
    pub len: usize,
}

/// 시퀀스 추적기
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceTracker;

impl SequenceTracker {
    /// 포트 하나를 관측하고 출발지 진행을 갱신합니다.
    pub fn observe(
        seq: &KnockSequence,
        state: &mut SourceState,
        port: u16,
        now: Instant,
    ) -> Result<TrackOutcome, ProgressOutOfRange> {
        let ports = seq.ports();

        let expired = state.matched_count > 0
            && now.saturating_duration_since(state.last_knock_time) > seq.max_interval();
        if expired {
            state.matched_count = 0;
        }

        let Some(&expected) = ports.get(state.matched_count) else {
            return Err(ProgressOutOfRange {
                matched_count: state.matched_count,
                len: ports.len(),
            });
        };

        let step = if port == expected {
            Self::advance(state, now);
            KnockStep::Advanced
        } else if seq.strict() && state.matched_count > 0 {
            state.matched_count = 0;
            if ports.first() == Some(&port) {
                Self::advance(state, now);
                KnockStep::ResetThenAdvanced
            } else {
                KnockStep::Reset
            }
        } else {
            KnockStep::NoChange
        };

        Ok(TrackOutcome { step, expired })
    }

    /// 시퀀스가 완료되었는지 확인합니다.
    pub fn is_complete(seq: &KnockSequence, state: &SourceState) -> bool {
        state.matched_count == seq.ports().len()
    }

    fn advance(state: &mut SourceState, now: Instant) {
        state.matched_count += 1;
        state.last_knock_time = now;
    }
}
