//! Host Groups
//!
//! 호스트 그룹
//!
//! [`HostGroup`]은 바인딩된 모든 논리 연결이 공유하는 이름 있는 호스트 레지스트리입니다.
//! 변경은 그룹 락 아래에서 적용되고 멤버별 메일박스로 [`GroupEvent`]가 전달됩니다.
//! 그룹은 연결의 락을 잡지 않으며, 연결은 다음 작업 시작 시 메일박스를 비웁니다.
//!
//! 락 순서: 연결 락, 그룹 락, 멤버 메일박스.
//! 메일박스 락은 최하위입니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

use super::super::driver::ServerAddress;
use super::super::error::{DriverError, DriverResult};
use super::super::pool::PhysicalCounters;
use super::table::{HostRole, HostSets};

// ============================================================================
// GroupEvent / GroupMember - 그룹 이벤트 / 멤버
// ============================================================================

/// 바인딩된 연결로 전달되는 변경
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    /// 호스트 선택 가능
    HostAdded { host: ServerAddress, role: HostRole },
    /// 호스트 제거 (`immediate`면 활성 연결 무효화)
    HostRemoved { host: ServerAddress, immediate: bool },
    /// 역할 변경
    RoleChanged { host: ServerAddress, role: HostRole },
}

/// 바인딩된 연결의 그룹 멤버십
#[derive(Debug)]
pub(crate) struct GroupMember {
    id: u64,
    counted: bool,
    events: Mutex<Vec<GroupEvent>>,
    counters: Arc<PhysicalCounters>,
}

impl GroupMember {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// 대기 이벤트 수신 (전달 순서)
    pub(crate) fn take_events(&self) -> Vec<GroupEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: GroupEvent) {
        self.events.lock().push(event);
    }
}

/// 승격 기록
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionRecord {
    /// 승격된 호스트
    pub host: ServerAddress,
    /// 승격 시각
    pub promoted_at: DateTime<Utc>,
}

// ============================================================================
// HostGroup - 호스트 그룹
// ============================================================================

#[derive(Debug, Default)]
struct GroupState {
    hosts: HostSets,
    seeded: bool,
    inconsistent: bool,
    members: HashMap<u64, Arc<GroupMember>>,
    promotions: Vec<PromotionRecord>,
    retired_physical_total: u64,
    retired_transactions: u64,
}

impl GroupState {
    fn broadcast(&self, event: &GroupEvent) {
        for member in self.members.values() {
            member.push(event.clone());
        }
    }
}

/// 논리 연결 간 공유되는 호스트 그룹
#[derive(Debug)]
pub struct HostGroup {
    name: String,
    state: Mutex<GroupState>,
    next_member_id: AtomicU64,
    total_connections: AtomicU64,
    promotion_count: AtomicU64,
}

impl HostGroup {
    /// 새 그룹 생성
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(GroupState::default()),
            next_member_id: AtomicU64::new(1),
            total_connections: AtomicU64::new(0),
            promotion_count: AtomicU64::new(0),
        }
    }

    /// 그룹 이름
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 연결 바인딩
    ///
    /// 첫 등록은 `initial`로 그룹을 초기화하고, 이후 등록은 그룹의 호스트를 따릅니다.
    ///
    /// 스냅샷과 등록은 하나의 락 아래에서 수행되어 이벤트가 누락되지 않습니다.
    pub(crate) fn register(
        &self,
        initial: &HostSets,
        counted: bool,
        counters: Arc<PhysicalCounters>,
    ) -> (Arc<GroupMember>, HostSets) {
        let mut state = self.state.lock();

        if !state.seeded {
            for host in initial.sources() {
                if !state.hosts.contains(host) {
                    state.hosts.insert(host.clone(), HostRole::Source);
                }
            }
            for host in initial.replicas() {
                if !state.hosts.contains(host) {
                    state.hosts.insert(host.clone(), HostRole::Replica);
                }
            }
            state.seeded = true;
            if !state.hosts.is_empty() {
                state.inconsistent = false;
            }
        }

        let member = Arc::new(GroupMember {
            id: self.next_member_id.fetch_add(1, Ordering::Relaxed),
            counted,
            events: Mutex::new(Vec::new()),
            counters,
        });
        state.members.insert(member.id, member.clone());
        if counted {
            self.total_connections.fetch_add(1, Ordering::Relaxed);
        }

        (member, state.hosts.clone())
    }

    /// 연결 바인딩 해제
    pub(crate) fn unregister(&self, id: u64) {
        let mut state = self.state.lock();
        if let Some(member) = state.members.remove(&id) {
            state.retired_physical_total += member.counters.opened();
            state.retired_transactions += member.counters.transactions();
        }
    }

    /// `role`로 `host` 추가
    ///
    /// `affect_existing`이면 기존 연결도 다음 선택부터 호스트를 고려하고,
    /// 아니면 이후 바인딩된 연결만 봅니다.
    /// 기존 호스트의 역할 변경은 항상 전달됩니다.
    pub fn add_host(
        &self,
        host: ServerAddress,
        role: HostRole,
        affect_existing: bool,
    ) -> DriverResult<bool> {
        if role == HostRole::Unassigned {
            return Err(DriverError::configuration(
                "A host must be added as SOURCE or REPLICA",
            ));
        }

        let mut state = self.state.lock();
        let previous = state.hosts.role_of(&host);
        if !state.hosts.insert(host.clone(), role) {
            return Ok(false);
        }
        state.seeded = true;
        if state.inconsistent {
            info!(group = %self.name, "host group is consistent again");
            state.inconsistent = false;
        }

        info!(group = %self.name, %host, role = role.as_str(), affect_existing, "host added");
        if previous != HostRole::Unassigned {
            state.broadcast(&GroupEvent::RoleChanged { host, role });
        } else if affect_existing {
            state.broadcast(&GroupEvent::HostAdded { host, role });
        }
        Ok(true)
    }

    /// 양쪽 역할에서 `host` 제거 (알 수 없는 호스트는 무시)
    ///
    /// 마지막 호스트를 제거하면 호스트가 다시 추가될 때까지
    /// 그룹은 불일치 상태가 됩니다.
    pub fn remove_host(&self, host: &ServerAddress, affect_existing: bool) -> bool {
        let mut state = self.state.lock();
        if !state.hosts.remove(host) {
            return false;
        }

        info!(group = %self.name, %host, affect_existing, "host removed");
        if state.hosts.is_empty() {
            warn!(group = %self.name, "host group has no source or replica hosts left");
            state.inconsistent = true;
        }

        state.broadcast(&GroupEvent::HostRemoved {
            host: host.clone(),
            immediate: affect_existing,
        });
        true
    }

    /// `host`를 소스로 승격
    ///
    /// 연결은 현재 물리 연결을 유지하며, 역할 조회에는
    /// 즉시 반영됩니다.
    pub fn promote(&self, host: &ServerAddress) -> bool {
        let mut state = self.state.lock();
        if !state.hosts.insert(host.clone(), HostRole::Source) {
            return false;
        }
        state.inconsistent = false;
        self.promotion_count.fetch_add(1, Ordering::Relaxed);
        state.promotions.push(PromotionRecord {
            host: host.clone(),
            promoted_at: Utc::now(),
        });

        info!(group = %self.name, %host, "host promoted to source");
        state.broadcast(&GroupEvent::RoleChanged {
            host: host.clone(),
            role: HostRole::Source,
        });
        true
    }

    /// `host`를 레플리카로 강등
    pub fn demote(&self, host: &ServerAddress) -> bool {
        let mut state = self.state.lock();
        if !state.hosts.insert(host.clone(), HostRole::Replica) {
            return false;
        }
        state.inconsistent = false;

        info!(group = %self.name, %host, "host demoted to replica");
        state.broadcast(&GroupEvent::RoleChanged {
            host: host.clone(),
            role: HostRole::Replica,
        });
        true
    }

    /// 역할 스냅샷
    pub fn snapshot(&self) -> HostSets {
        self.state.lock().hosts.clone()
    }

    /// 소스 호스트
    pub fn sources(&self) -> Vec<ServerAddress> {
        self.state.lock().hosts.sources().to_vec()
    }

    /// 레플리카 호스트
    pub fn replicas(&self) -> Vec<ServerAddress> {
        self.state.lock().hosts.replicas().to_vec()
    }

    /// 소스 호스트 수
    pub fn source_count(&self) -> usize {
        self.state.lock().hosts.sources().len()
    }

    /// 레플리카 호스트 수
    pub fn replica_count(&self) -> usize {
        self.state.lock().hosts.replicas().len()
    }

    /// `host` 역할
    pub fn role_of(&self, host: &ServerAddress) -> HostRole {
        self.state.lock().hosts.role_of(host)
    }

    /// 불일치 상태 여부
    pub fn is_inconsistent(&self) -> bool {
        self.state.lock().inconsistent
    }

    /// 활성 논리 연결 수
    pub fn active_connection_count(&self) -> usize {
        self.state.lock().members.values().filter(|m| m.counted).count()
    }

    /// 누적 논리 연결 수
    pub fn total_connection_count(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// 승격 횟수
    pub fn promotion_count(&self) -> u64 {
        self.promotion_count.load(Ordering::Relaxed)
    }

    /// 승격 이력
    pub fn promotions(&self) -> Vec<PromotionRecord> {
        self.state.lock().promotions.clone()
    }

    /// 활성 물리 연결 수
    pub fn active_physical_connection_count(&self) -> usize {
        self.state
            .lock()
            .members
            .values()
            .map(|m| m.counters.active())
            .sum()
    }

    /// 누적 물리 연결 수
    pub fn total_physical_connection_count(&self) -> u64 {
        let state = self.state.lock();
        state.retired_physical_total
            + state.members.values().map(|m| m.counters.opened()).sum::<u64>()
    }

    /// 완료된 트랜잭션 수
    pub fn transaction_count(&self) -> u64 {
        let state = self.state.lock();
        state.retired_transactions
            + state.members.values().map(|m| m.counters.transactions()).sum::<u64>()
    }
}

// ============================================================================
// GroupRegistry - 그룹 레지스트리
// ============================================================================

/// 그룹 레지스트리
///
/// 애플리케이션(또는 테스트)이 생성하여
/// 그룹을 사용하는 모든 드라이버에 전달합니다.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: RwLock<HashMap<String, Arc<HostGroup>>>,
}

impl GroupRegistry {
    /// 새 레지스트리 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` 그룹 조회 (없으면 생성)
    pub fn group(&self, name: &str) -> Arc<HostGroup> {
        {
            let groups = self.groups.read();
            if let Some(group) = groups.get(name) {
                return group.clone();
            }
        }

        let mut groups = self.groups.write();

        // 쓰기 락에서 재확인
        if let Some(group) = groups.get(name) {
            return group.clone();
        }

        let group = Arc::new(HostGroup::new(name));
        groups.insert(name.to_string(), group.clone());
        group
    }

    /// 그룹 조회
    pub fn get(&self, name: &str) -> Option<Arc<HostGroup>> {
        self.groups.read().get(name).cloned()
    }

    /// 전체 그룹 (이름 순)
    pub fn groups(&self) -> Vec<Arc<HostGroup>> {
        let mut groups: Vec<Arc<HostGroup>> = self.groups.read().values().cloned().collect();
        groups.sort_by(|a, b| a.name().cmp(b.name()));
        groups
    }

    /// 그룹 이름 목록
    pub fn names(&self) -> Vec<String> {
        self.groups().iter().map(|g| g.name().to_string()).collect()
    }

    /// 그룹 제거 (바인딩된 연결은 참조 유지)
    pub fn remove(&self, name: &str) -> Option<Arc<HostGroup>> {
        self.groups.write().remove(name)
    }

    /// 전체 그룹 제거
    pub fn reset(&self) {
        self.groups.write().clear();
    }

    /// 그룹 수
    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    /// 비어 있음 여부
    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}
