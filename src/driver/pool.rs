//! Physical Connection Pool
//!
//! 물리 연결 캐시
//!
//! 논리 연결마다 호스트당 최대 하나의 물리 연결을 유지합니다. 카운터만 호스트 그룹과 공유합니다.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use super::driver::ServerAddress;
use super::physical::PhysicalConnection;

// ============================================================================
// PhysicalCounters - 물리 연결 카운터
// ============================================================================

/// 논리 연결의 물리 연결/트랜잭션 카운터
#[derive(Debug, Default)]
pub struct PhysicalCounters {
    active: AtomicUsize,
    opened: AtomicU64,
    transactions: AtomicU64,
}

impl PhysicalCounters {
    pub(crate) fn on_open(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_close(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn on_transaction(&self) {
        self.transactions.fetch_add(1, Ordering::Relaxed);
    }

    /// 열린 물리 연결 수
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// 누적 물리 연결 수
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    /// 완료된 트랜잭션 수
    pub fn transactions(&self) -> u64 {
        self.transactions.load(Ordering::Relaxed)
    }
}

// ============================================================================
// ConnectionState - 연결 상태
// ============================================================================

/// 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// 활성
    Active,
    /// 유휴
    Idle,
    /// 닫힘
    Closed,
    /// 실패
    Failed,
}

// ============================================================================
// PooledConnection - 캐시된 연결
// ============================================================================

/// 캐시된 물리 연결
pub struct PooledConnection {
    id: u64,
    address: ServerAddress,
    created_at: Instant,
    last_used: Instant,
    state: ConnectionState,
    conn: Box<dyn PhysicalConnection>,
}

impl PooledConnection {
    pub(crate) fn new(id: u64, conn: Box<dyn PhysicalConnection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            address: conn.host().clone(),
            created_at: now,
            last_used: now,
            state: ConnectionState::Idle,
            conn,
        }
    }

    /// 연결 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 서버 주소
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// 생성 시각
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// 마지막 사용 시각
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// 연결 상태
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// 유효성 확인
    pub fn is_valid(&self) -> bool {
        matches!(self.state, ConnectionState::Active | ConnectionState::Idle) && self.conn.is_valid()
    }

    pub(crate) fn mark_active(&mut self) {
        self.state = ConnectionState::Active;
        self.last_used = Instant::now();
    }

    pub(crate) fn mark_idle(&mut self) {
        if self.state == ConnectionState::Active {
            self.state = ConnectionState::Idle;
        }
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
    }

    pub(crate) fn connection_mut(&mut self) -> &mut dyn PhysicalConnection {
        self.last_used = Instant::now();
        self.conn.as_mut()
    }

    fn close(&mut self) {
        if self.state != ConnectionState::Closed {
            self.conn.close();
            self.state = ConnectionState::Closed;
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state)
            .field("age", &self.created_at.elapsed())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// PoolMetrics - 풀 메트릭
// ============================================================================

/// 논리 연결의 물리 연결 메트릭
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// 캐시된 연결 수
    pub size: usize,
    /// 누적 물리 연결 수
    pub total_created: u64,
    /// 닫히거나 제거된 연결 수
    pub total_closed: u64,
    /// 완료된 트랜잭션 수
    pub total_transactions: u64,
}

// ============================================================================
// PhysicalPool - 호스트별 연결 캐시
// ============================================================================

/// 호스트별 물리 연결 캐시
#[derive(Debug)]
pub(crate) struct PhysicalPool {
    connections: HashMap<ServerAddress, PooledConnection>,
    response_times: HashMap<ServerAddress, Duration>,
    counters: Arc<PhysicalCounters>,
    next_id: u64,
    total_closed: u64,
}

impl PhysicalPool {
    pub(crate) fn new(counters: Arc<PhysicalCounters>) -> Self {
        Self {
            connections: HashMap::new(),
            response_times: HashMap::new(),
            counters,
            next_id: 1,
            total_closed: 0,
        }
    }

    pub(crate) fn counters(&self) -> &Arc<PhysicalCounters> {
        &self.counters
    }

    pub(crate) fn get_mut(&mut self, host: &ServerAddress) -> Option<&mut PooledConnection> {
        self.connections.get_mut(host)
    }

    pub(crate) fn contains(&self, host: &ServerAddress) -> bool {
        self.connections.contains_key(host)
    }

    /// 새 연결 추가 (같은 호스트의 기존 연결은 교체)
    pub(crate) fn insert(&mut self, conn: Box<dyn PhysicalConnection>) -> &mut PooledConnection {
        let host = conn.host().clone();
        self.evict(&host);

        let id = self.next_id;
        self.next_id += 1;
        self.counters.on_open();
        debug!(%host, id, "physical connection opened");

        self.connections
            .entry(host)
            .or_insert_with(|| PooledConnection::new(id, conn))
    }

    /// `host` 연결 제거
    pub(crate) fn evict(&mut self, host: &ServerAddress) -> bool {
        match self.connections.remove(host) {
            Some(mut conn) => {
                conn.close();
                self.counters.on_close();
                self.total_closed += 1;
                debug!(%host, id = conn.id(), "physical connection closed");
                true
            }
            None => false,
        }
    }

    /// 모든 연결 닫기
    pub(crate) fn close_all(&mut self) {
        let hosts: Vec<ServerAddress> = self.connections.keys().cloned().collect();
        for host in hosts {
            self.evict(&host);
        }
    }

    /// 유효한 연결이 있는 호스트
    pub(crate) fn live_hosts(&self) -> HashSet<ServerAddress> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.is_valid())
            .map(|(host, _)| host.clone())
            .collect()
    }

    pub(crate) fn hosts(&self) -> Vec<ServerAddress> {
        let mut hosts: Vec<ServerAddress> = self.connections.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub(crate) fn record_response_time(&mut self, host: &ServerAddress, elapsed: Duration) {
        self.response_times.insert(host.clone(), elapsed);
    }

    pub(crate) fn response_times(&self) -> &HashMap<ServerAddress, Duration> {
        &self.response_times
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            size: self.connections.len(),
            total_created: self.counters.opened(),
            total_closed: self.total_closed,
            total_transactions: self.counters.transactions(),
        }
    }
}

impl Drop for PhysicalPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

// ============================================================================
// Tests
// ============================================================================
