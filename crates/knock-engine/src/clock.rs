//! 단조 시계 추상화
//!
//! 노크 간격과 인가 유지 시간은 벽시계 조정의 영향을 받지 않도록
//! 항상 [`Instant`]로 계산합니다.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 현재 시각 공급자
pub trait Clock: Send + Sync + fmt::Debug {
    /// 현재 단조 시각을 반환합니다.
    fn now(&self) -> Instant;
}

/// 운영 환경용 시계 (`Instant::now()`)
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 수동으로 전진시키는 시계
///
/// 테스트와 트레이스 재생에서 실제로 기다리지 않고 시간 경과를 재현합니다.
/// 시각은 뒤로 가지 않습니다.
pub struct ManualClock {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl ManualClock {
    /// 현재 시각을 기준점으로 하는 시계를 생성합니다.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    /// 시계를 `by`만큼 전진시킵니다.
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        // fetch_update 클로저는 항상 Some을 반환하므로 실패하지 않습니다.
        let _ = self
            .offset_nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_add(nanos))
            });
    }

    /// 기준점으로부터 `elapsed` 지점으로 이동합니다. 과거로는 이동하지 않습니다.
    pub fn advance_to(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_max(nanos, Ordering::AcqRel);
    }

    /// 기준점으로부터 경과한 시간을 반환합니다.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_nanos.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.elapsed()
    }
}
