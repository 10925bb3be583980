//! 출발지별 상태 저장소
//!
//! [`StateStore`]는 한 룰에 대한 출발지 IP별 노킹 진행 상태를 소유합니다.
//!
//! # 동시성
//! ```text
//! DashMap<IpAddr, Arc<Mutex<SourceState>>>
//!    │  샤드 락: 조회/삽입 동안만 보유
//!    └─▶ 출발지별 Mutex: 평가 동안 보유 (같은 출발지만 직렬화)
//! ```
//! 서로 다른 출발지는 출발지별 락을 공유하지 않으므로 평가가 서로를
//! 기다리지 않습니다. 같은 출발지의 패킷은 출발지 락으로 직렬화됩니다.
//!
//! # 회수
//! 회수는 출발지 락을 `try_lock`으로만 잡으므로 평가 중인 항목은 건너뜁니다.
//! 회수된 항목은 `retired`로 표시되며, 회수와 경합한 평가는 맵을 다시
//! 조회하여 새 항목에서 평가합니다.
//!
//! # 룰 버전
//! 각 항목은 마지막으로 자신을 갱신한 룰 정의의 `generation`을 기록합니다.
//! 엔진은 출발지 락을 잡은 뒤 이 값을 현재 룰과 비교하여, 다른 정의에서 쌓인
//! 진행을 새 정의에 적용하지 않습니다.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use std::fmt;

use dashmap::DashMap;
use metrics::Gauge;
use parking_lot::Mutex;
use serde::Serialize;

/// 출발지 인가 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    /// 미인가, 진행 없음
    Unauthorized,
    /// 미인가, 시퀀스 진행 중
    Knocking,
    /// 인가됨
    Authorized,
}

/// 출발지 하나의 노킹 진행 상태
///
/// 엔진만 출발지 락을 잡은 상태에서 변경합니다.
#[derive(Debug, Clone)]
pub struct SourceState {
    /// 다음에 기대하는 포트의 인덱스
    pub(crate) matched_count: usize,
    /// 마지막으로 시퀀스를 전진시킨 노크 시각
    pub(crate) last_knock_time: Instant,
    /// 인가 여부
    pub(crate) authorized: bool,
    /// 마지막 인가/해제 전환 시각
    pub(crate) last_transition_time: Instant,
    /// 진행을 기록한 룰 정의 버전 (0이면 아직 없음)
    pub(crate) generation: u64,
    retired: bool,
}

impl SourceState {
    /// 초기 상태(미인가, 진행 없음)를 생성합니다.
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            matched_count: 0,
            last_knock_time: now,
            authorized: false,
            last_transition_time: now,
            generation: 0,
            retired: false,
        }
    }

    /// 다른 룰 정의에서 쌓인 진행을 버리고 `generation`에 맞춥니다.
    /// 인가 상태는 유지합니다.
    pub(crate) fn restart(&mut self, now: Instant, generation: u64) {
        self.matched_count = 0;
        self.last_knock_time = now;
        self.generation = generation;
    }

    /// 진행과 인가를 모두 초기화합니다.
    pub(crate) fn reset(&mut self, now: Instant) {
        self.matched_count = 0;
        self.last_knock_time = now;
        self.authorized = false;
        self.last_transition_time = now;
    }

    /// 현재 단계
    pub fn phase(&self) -> SourcePhase {
        if self.authorized {
            SourcePhase::Authorized
        } else if self.matched_count > 0 {
            SourcePhase::Knocking
        } else {
            SourcePhase::Unauthorized
        }
    }

    /// 읽기 전용 스냅샷을 생성합니다.
    pub(crate) fn view(&self) -> SourceView {
        SourceView {
            matched_count: self.matched_count,
            authorized: self.authorized,
            phase: self.phase(),
        }
    }
}

/// 진단용 출발지 상태 스냅샷
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceView {
    /// 일치한 포트 수
    pub matched_count: usize,
    /// 인가 여부
    pub authorized: bool,
    /// 단계
    pub phase: SourcePhase,
}

/// 저장소가 가득 차서 새 출발지를 추적할 수 없음
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreFull;

type Slot = Arc<Mutex<SourceState>>;

/// 한 룰의 출발지별 상태 저장소
pub struct StateStore {
    entries: DashMap<IpAddr, Slot>,
    capacity: usize,
    /// 추적 중인 출발지 수 (삽입/회수/삭제 시 갱신)
    active: Gauge,
}

impl StateStore {
    /// 최대 `capacity`개의 출발지를 추적하는 저장소를 생성합니다.
    pub fn new(capacity: usize) -> Self {
        Self::with_gauge(capacity, Gauge::noop())
    }

    /// 항목 수를 `active` 게이지로 내보내는 저장소를 생성합니다.
    pub fn with_gauge(capacity: usize, active: Gauge) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            active,
        }
    }

    /// 추적 중인 출발지 수
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 비어 있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 최대 출발지 수
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 출발지 상태를 잠근 채 `f`를 실행합니다.
    ///
    /// 항목이 없으면 `create`가 참일 때만 초기 상태로 생성합니다.
    /// 생성하지 않으면 `Ok(None)`을 반환합니다.
    pub(crate) fn with_source<R>(
        &self,
        src: IpAddr,
        now: Instant,
        create: bool,
        mut f: impl FnMut(&mut SourceState) -> R,
    ) -> Result<Option<R>, StoreFull> {
        loop {
            // 샤드 락은 이 문장이 끝나면 해제됩니다.
            let existing = self.entries.get(&src).map(|e| Arc::clone(e.value()));
            let slot = match existing {
                Some(slot) => slot,
                None if !create => return Ok(None),
                None => {
                    if self.entries.len() >= self.capacity {
                        return Err(StoreFull);
                    }
                    let mut inserted = false;
                    let slot = Arc::clone(
                        self.entries
                            .entry(src)
                            .or_insert_with(|| {
                                inserted = true;
                                Arc::new(Mutex::new(SourceState::new(now)))
                            })
                            .value(),
                    );
                    if inserted {
                        self.active.increment(1.0);
                    }
                    slot
                }
            };

            let mut state = slot.lock();
            if state.retired {
                // 회수와 경합: 새 항목으로 다시 시도
                continue;
            }
            return Ok(Some(f(&mut state)));
        }
    }

    /// 출발지 상태를 읽기 전용으로 조회합니다.
    pub(crate) fn peek<R>(&self, src: IpAddr, f: impl FnOnce(&SourceState) -> R) -> Option<R> {
        let slot = self.entries.get(&src).map(|e| Arc::clone(e.value()))?;
        let state = slot.lock();
        if state.retired {
            return None;
        }
        Some(f(&state))
    }

    /// `is_idle`이 참인 항목을 회수하고 회수한 수를 반환합니다.
    ///
    /// 평가 중(락 보유 중)인 항목은 건너뜁니다.
    pub(crate) fn reclaim(&self, is_idle: impl Fn(&SourceState) -> bool) -> usize {
        let mut reclaimed = 0;
        self.entries.retain(|_, slot| match slot.try_lock() {
            Some(mut state) if is_idle(&state) => {
                state.retired = true;
                reclaimed += 1;
                false
            }
            _ => true,
        });
        if reclaimed > 0 {
            self.active.decrement(reclaimed as f64);
        }
        reclaimed
    }

    /// 진행도 인가도 없는 항목을 제거합니다. 제거했으면 `true`를 반환합니다.
    ///
    /// 룰이 제거된 뒤 늦게 도착한 평가가 만든 빈 항목을 치울 때 사용합니다.
    pub(crate) fn discard_untouched(&self, src: IpAddr) -> bool {
        let removed = self
            .entries
            .remove_if(&src, |_, slot| match slot.try_lock() {
                Some(mut state) if state.matched_count == 0 && !state.authorized => {
                    state.retired = true;
                    true
                }
                _ => false,
            })
            .is_some();
        if removed {
            self.active.decrement(1.0);
        }
        removed
    }

    /// 모든 항목의 상태를 변경합니다. 룰 교체처럼 핫 패스 밖에서만 사용합니다.
    pub(crate) fn for_each_mut(&self, mut f: impl FnMut(&mut SourceState)) {
        for entry in self.entries.iter() {
            let mut state = entry.value().lock();
            f(&mut state);
        }
    }

    /// 조건을 만족하는 항목 수를 셉니다.
    pub(crate) fn count(&self, pred: impl Fn(&SourceState) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| pred(&entry.value().lock()))
            .count()
    }

    /// 모든 항목을 제거합니다.
    pub(crate) fn clear(&self) {
        self.entries.retain(|_, slot| {
            slot.lock().retired = true;
            false
        });
        self.active.set(self.entries.len() as f64);
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("entries", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
