//! Balance Strategies
//!
//! 부하 분산 전략
//!
//! 후보 목록에서 다음 호스트를 선택합니다. 내부 상태(순차 커서)는 동기화되어 있어 하나의 인스턴스를 동시에 사용할 수 있습니다.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use super::super::driver::ServerAddress;

/// 최소 응답 시간 전략의 샘플 크기
const RESPONSE_TIME_SAMPLE: usize = 3;

/// 선택 입력
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    /// 후보 호스트 (순서 유지)
    pub candidates: &'a [ServerAddress],
    /// 제외 호스트
    pub excluded: &'a HashSet<ServerAddress>,
    /// 물리 연결이 열린 호스트
    pub live: &'a HashSet<ServerAddress>,
    /// 호스트별 최근 응답 시간
    pub response_times: &'a HashMap<ServerAddress, Duration>,
}

impl<'a> SelectionContext<'a> {
    /// 제외되지 않은 후보
    pub fn eligible(&self) -> Vec<&'a ServerAddress> {
        self.candidates
            .iter()
            .filter(|h| !self.excluded.contains(*h))
            .collect()
    }
}

/// 호스트 선택 알고리즘
pub trait BalanceStrategy: Send + Sync + fmt::Debug {
    /// 호스트 선택 (모두 제외되면 `None`)
    fn pick(&self, ctx: &SelectionContext<'_>) -> Option<ServerAddress>;

    /// 설정 이름
    fn name(&self) -> &'static str;
}

// ============================================================================
// BalancePolicy - 부하 분산 정책
// ============================================================================

/// 내장 전략
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BalancePolicy {
    /// 무작위 (기본값)
    #[default]
    Random,
    /// 순차 순환
    Sequential,
    /// 최소 응답 시간
    BestResponseTime,
    /// 선호 순서
    ServerAffinity,
}

impl BalancePolicy {
    /// 설정 이름 파싱
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "random" => Some(Self::Random),
            "sequential" | "roundrobin" | "round_robin" => Some(Self::Sequential),
            "bestresponsetime" | "best_response_time" => Some(Self::BestResponseTime),
            "serveraffinity" | "server_affinity" => Some(Self::ServerAffinity),
            _ => None,
        }
    }

    /// 전략 인스턴스 생성
    ///
    /// `affinity`는 [`BalancePolicy::ServerAffinity`]에서만 사용됩니다.
    pub fn create(&self, affinity: &[ServerAddress]) -> Box<dyn BalanceStrategy> {
        match self {
            Self::Random => Box::new(RandomStrategy),
            Self::Sequential => Box::new(SequentialStrategy::new()),
            Self::BestResponseTime => Box::new(BestResponseTimeStrategy),
            Self::ServerAffinity => Box::new(ServerAffinityStrategy::new(affinity.to_vec())),
        }
    }
}

// ============================================================================
// Strategies - 전략 구현
// ============================================================================

/// 무작위 선택 전략
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategy;

impl BalanceStrategy for RandomStrategy {
    fn pick(&self, ctx: &SelectionContext<'_>) -> Option<ServerAddress> {
        ctx.eligible().choose(&mut rand::thread_rng()).map(|h| (*h).clone())
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// 순차 선택 전략
///
/// 직전 선택 호스트 다음부터 시작해 목록 끝에서 처음으로 돌아가며,
/// 제외 호스트는 건너뜁니다. 커서는 주소로 유지되므로
/// 선택 사이의 목록 변경에도 안전합니다.
#[derive(Debug, Default)]
pub struct SequentialStrategy {
    last: Mutex<Option<ServerAddress>>,
}

impl SequentialStrategy {
    /// 새 전략 생성 (첫 선택은 목록 처음부터)
    pub fn new() -> Self {
        Self::default()
    }

    /// 커서 초기화
    pub fn reset(&self) {
        *self.last.lock() = None;
    }
}

impl BalanceStrategy for SequentialStrategy {
    fn pick(&self, ctx: &SelectionContext<'_>) -> Option<ServerAddress> {
        let len = ctx.candidates.len();
        if len == 0 {
            return None;
        }

        let mut last = self.last.lock();
        let start = last
            .as_ref()
            .and_then(|prev| ctx.candidates.iter().position(|h| h == prev))
            .map_or(0, |i| i + 1);

        let picked = (0..len)
            .map(|offset| &ctx.candidates[(start + offset) % len])
            .find(|h| !ctx.excluded.contains(*h))
            .cloned();

        if picked.is_some() {
            *last = picked.clone();
        }
        picked
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

/// 최소 응답 시간 전략
///
/// 응답 시간 데이터가 있는 활성 호스트 중 무작위 샘플에서 최소값을 선택합니다.
/// 데이터가 없으면 [`RandomStrategy`]로 대체합니다.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestResponseTimeStrategy;

impl BalanceStrategy for BestResponseTimeStrategy {
    fn pick(&self, ctx: &SelectionContext<'_>) -> Option<ServerAddress> {
        let timed: Vec<(&ServerAddress, Duration)> = ctx
            .eligible()
            .into_iter()
            .filter(|h| ctx.live.contains(*h))
            .filter_map(|h| ctx.response_times.get(h).map(|t| (h, *t)))
            .collect();

        if timed.is_empty() {
            return RandomStrategy.pick(ctx);
        }

        let mut rng = rand::thread_rng();
        timed
            .choose_multiple(&mut rng, RESPONSE_TIME_SAMPLE)
            .min_by_key(|(_, time)| *time)
            .map(|(host, _)| (*host).clone())
    }

    fn name(&self) -> &'static str {
        "bestResponseTime"
    }
}

/// 서버 선호 전략 (선호 순서 우선, 없으면 무작위)
#[derive(Debug, Default, Clone)]
pub struct ServerAffinityStrategy {
    order: Vec<ServerAddress>,
}

impl ServerAffinityStrategy {
    /// 새 전략 생성
    pub fn new(order: Vec<ServerAddress>) -> Self {
        Self { order }
    }
}

impl BalanceStrategy for ServerAffinityStrategy {
    fn pick(&self, ctx: &SelectionContext<'_>) -> Option<ServerAddress> {
        let preferred = self
            .order
            .iter()
            .find(|h| ctx.candidates.contains(*h) && !ctx.excluded.contains(*h));

        match preferred {
            Some(host) => Some(host.clone()),
            None => {
                let eligible = ctx.eligible();
                if eligible.is_empty() {
                    return None;
                }
                let index = rand::thread_rng().gen_range(0..eligible.len());
                Some(eligible[index].clone())
            }
        }
    }

    fn name(&self) -> &'static str {
        "serverAffinity"
    }
}
