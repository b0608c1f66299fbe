//! Group Management
//!
//! 그룹 관리 API ([`GroupRegistry`] 운영자용 인터페이스)
//!
//! 모든 호출은 그룹 이름을 선택적으로 받으며, `None`이면 전체 그룹에 이름 순서로 적용됩니다.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use super::driver::ServerAddress;
use super::error::{DriverError, DriverResult};
use super::routing::{Blocklist, BlocklistEntry, GroupRegistry, HostGroup, HostRole, PromotionRecord};

/// 그룹 스냅샷
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    /// 그룹 이름
    pub name: String,
    /// 소스 호스트
    pub sources: Vec<ServerAddress>,
    /// 레플리카 호스트
    pub replicas: Vec<ServerAddress>,
    /// 불일치 상태 (소스/레플리카 모두 비어 있음)
    pub inconsistent: bool,
    /// 활성 논리 연결 수
    pub active_logical_connections: usize,
    /// 누적 논리 연결 수
    pub total_logical_connections: u64,
    /// 활성 물리 연결 수
    pub active_physical_connections: usize,
    /// 누적 물리 연결 수
    pub total_physical_connections: u64,
    /// 완료된 트랜잭션 수
    pub transactions: u64,
    /// 승격 횟수
    pub promotion_count: u64,
    /// 승격 이력
    pub promotions: Vec<PromotionRecord>,
}

impl GroupStats {
    fn of(group: &HostGroup) -> Self {
        let hosts = group.snapshot();
        Self {
            name: group.name().to_string(),
            sources: hosts.sources().to_vec(),
            replicas: hosts.replicas().to_vec(),
            inconsistent: group.is_inconsistent(),
            active_logical_connections: group.active_connection_count(),
            total_logical_connections: group.total_connection_count(),
            active_physical_connections: group.active_physical_connection_count(),
            total_physical_connections: group.total_physical_connection_count(),
            transactions: group.transaction_count(),
            promotion_count: group.promotion_count(),
            promotions: group.promotions(),
        }
    }
}

/// 그룹 관리자
#[derive(Debug, Clone)]
pub struct GroupManager {
    registry: Arc<GroupRegistry>,
    blocklist: Option<Arc<Blocklist>>,
}

impl GroupManager {
    /// 새 관리자 생성
    pub fn new(registry: Arc<GroupRegistry>) -> Self {
        Self {
            registry,
            blocklist: None,
        }
    }

    /// 전역 블록리스트 설정
    pub fn with_global_blocklist(mut self, blocklist: Arc<Blocklist>) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    fn select(&self, group: Option<&str>) -> DriverResult<Vec<Arc<HostGroup>>> {
        match group {
            Some(name) => self
                .registry
                .get(name)
                .map(|g| vec![g])
                .ok_or_else(|| DriverError::UnknownGroup(name.to_string())),
            None => Ok(self.registry.groups()),
        }
    }

    /// 그룹 이름 목록
    pub fn group_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// 소스 호스트 목록 (중복 제거)
    pub fn list_source_hosts(&self, group: Option<&str>) -> DriverResult<Vec<ServerAddress>> {
        Ok(dedup(self.select(group)?.iter().flat_map(|g| g.sources())))
    }

    /// 레플리카 호스트 목록 (중복 제거)
    pub fn list_replica_hosts(&self, group: Option<&str>) -> DriverResult<Vec<ServerAddress>> {
        Ok(dedup(self.select(group)?.iter().flat_map(|g| g.replicas())))
    }

    /// 소스 호스트 수
    pub fn source_host_count(&self, group: Option<&str>) -> DriverResult<usize> {
        Ok(self.select(group)?.iter().map(|g| g.source_count()).sum())
    }

    /// 레플리카 호스트 수
    pub fn replica_host_count(&self, group: Option<&str>) -> DriverResult<usize> {
        Ok(self.select(group)?.iter().map(|g| g.replica_count()).sum())
    }

    /// 활성 논리 연결 수
    pub fn active_logical_connection_count(&self, group: Option<&str>) -> DriverResult<usize> {
        Ok(self.select(group)?.iter().map(|g| g.active_connection_count()).sum())
    }

    /// 누적 논리 연결 수
    pub fn total_logical_connection_count(&self, group: Option<&str>) -> DriverResult<u64> {
        Ok(self.select(group)?.iter().map(|g| g.total_connection_count()).sum())
    }

    /// 활성 물리 연결 수
    pub fn active_physical_connection_count(&self, group: Option<&str>) -> DriverResult<usize> {
        Ok(self
            .select(group)?
            .iter()
            .map(|g| g.active_physical_connection_count())
            .sum())
    }

    /// 누적 물리 연결 수
    pub fn total_physical_connection_count(&self, group: Option<&str>) -> DriverResult<u64> {
        Ok(self
            .select(group)?
            .iter()
            .map(|g| g.total_physical_connection_count())
            .sum())
    }

    /// 완료된 트랜잭션 수
    pub fn transaction_count(&self, group: Option<&str>) -> DriverResult<u64> {
        Ok(self.select(group)?.iter().map(|g| g.transaction_count()).sum())
    }

    /// 승격 횟수
    pub fn promotion_count(&self, group: Option<&str>) -> DriverResult<u64> {
        Ok(self.select(group)?.iter().map(|g| g.promotion_count()).sum())
    }

    /// 승격 이력 (오래된 순)
    pub fn promotions(&self, group: Option<&str>) -> DriverResult<Vec<PromotionRecord>> {
        let mut records: Vec<PromotionRecord> = self
            .select(group)?
            .iter()
            .flat_map(|g| g.promotions())
            .collect();
        records.sort_by_key(|r| r.promoted_at);
        Ok(records)
    }

    /// 호스트 추가 (변경된 그룹 수 반환)
    pub fn add_host(
        &self,
        group: Option<&str>,
        host: &str,
        role: HostRole,
        affect_existing: bool,
    ) -> DriverResult<usize> {
        let host = ServerAddress::parse(host)?;
        let mut changed = 0;
        for g in self.select(group)? {
            if g.add_host(host.clone(), role, affect_existing)? {
                changed += 1;
            }
        }
        info!(?group, %host, role = role.as_str(), changed, "add host requested");
        Ok(changed)
    }

    /// 호스트 제거 (변경된 그룹 수 반환)
    pub fn remove_host(
        &self,
        group: Option<&str>,
        host: &str,
        affect_existing: bool,
    ) -> DriverResult<usize> {
        let host = ServerAddress::parse(host)?;
        let changed = self
            .select(group)?
            .iter()
            .filter(|g| g.remove_host(&host, affect_existing))
            .count();
        info!(?group, %host, changed, "remove host requested");
        Ok(changed)
    }

    /// 소스로 승격 (변경된 그룹 수 반환)
    pub fn promote_to_source(&self, group: Option<&str>, host: &str) -> DriverResult<usize> {
        let host = ServerAddress::parse(host)?;
        Ok(self.select(group)?.iter().filter(|g| g.promote(&host)).count())
    }

    /// 레플리카로 강등 (변경된 그룹 수 반환)
    pub fn demote_to_replica(&self, group: Option<&str>, host: &str) -> DriverResult<usize> {
        let host = ServerAddress::parse(host)?;
        Ok(self.select(group)?.iter().filter(|g| g.demote(&host)).count())
    }

    /// 그룹 스냅샷 목록
    pub fn stats(&self, group: Option<&str>) -> DriverResult<Vec<GroupStats>> {
        Ok(self.select(group)?.iter().map(|g| GroupStats::of(g)).collect())
    }

    /// 전역 블록리스트 항목
    pub fn blocklisted_hosts(&self) -> Vec<BlocklistEntry> {
        self.blocklist
            .as_ref()
            .map(|b| b.entries())
            .unwrap_or_default()
    }

    /// 블록리스트에서 `host` 제거
    pub fn clear_blocklisted(&self, host: &str) -> DriverResult<bool> {
        let host = ServerAddress::parse(host)?;
        Ok(self.blocklist.as_ref().map_or(false, |b| b.clear(&host)))
    }
}

fn dedup(hosts: impl Iterator<Item = ServerAddress>) -> Vec<ServerAddress> {
    let mut out: Vec<ServerAddress> = Vec::new();
    for host in hosts {
        if !out.contains(&host) {
            out.push(host);
        }
    }
    out
}
