//! Host Role Table
//!
//! 소스/레플리카 호스트 목록 (한 호스트는 최대 하나의 역할만 가짐)

use serde::Serialize;

use super::super::driver::ServerAddress;

/// 호스트 복제 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HostRole {
    /// 소스 (쓰기 가능)
    Source,
    /// 레플리카 (읽기 전용)
    Replica,
    /// 미지정
    Unassigned,
}

impl HostRole {
    /// 역할 이름 파싱
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "SOURCE" => Some(Self::Source),
            "REPLICA" => Some(Self::Replica),
            "UNASSIGNED" => Some(Self::Unassigned),
            _ => None,
        }
    }

    /// 역할 이름
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "SOURCE",
            Self::Replica => "REPLICA",
            Self::Unassigned => "UNASSIGNED",
        }
    }
}

/// 소스/레플리카 호스트 목록
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSets {
    sources: Vec<ServerAddress>,
    replicas: Vec<ServerAddress>,
}

impl HostSets {
    /// 두 목록으로 생성 (양쪽에 있으면 소스)
    pub fn new(sources: Vec<ServerAddress>, replicas: Vec<ServerAddress>) -> Self {
        let mut sets = Self::default();
        for host in sources {
            sets.insert(host, HostRole::Source);
        }
        for host in replicas {
            if !sets.contains(&host) {
                sets.insert(host, HostRole::Replica);
            }
        }
        sets
    }

    /// 소스 호스트 (삽입 순서)
    pub fn sources(&self) -> &[ServerAddress] {
        &self.sources
    }

    /// 레플리카 호스트 (삽입 순서)
    pub fn replicas(&self) -> &[ServerAddress] {
        &self.replicas
    }

    /// 소스 + 레플리카
    pub fn all(&self) -> Vec<ServerAddress> {
        self.sources.iter().chain(self.replicas.iter()).cloned().collect()
    }

    /// `role`로 `host` 추가 (다른 목록에서는 제거)
    ///
    /// 이미 같은 역할이면 `false`를 반환합니다.
    /// `Unassigned`는 호스트를 제거합니다.
    pub fn insert(&mut self, host: ServerAddress, role: HostRole) -> bool {
        match role {
            HostRole::Source => {
                if self.sources.contains(&host) {
                    return false;
                }
                self.replicas.retain(|h| h != &host);
                self.sources.push(host);
                true
            }
            HostRole::Replica => {
                if self.replicas.contains(&host) {
                    return false;
                }
                self.sources.retain(|h| h != &host);
                self.replicas.push(host);
                true
            }
            HostRole::Unassigned => self.remove(&host),
        }
    }

    /// 양쪽 목록에서 제거
    pub fn remove(&mut self, host: &ServerAddress) -> bool {
        let before = self.len();
        self.sources.retain(|h| h != host);
        self.replicas.retain(|h| h != host);
        before != self.len()
    }

    /// `host` 역할
    pub fn role_of(&self, host: &ServerAddress) -> HostRole {
        if self.sources.contains(host) {
            HostRole::Source
        } else if self.replicas.contains(host) {
            HostRole::Replica
        } else {
            HostRole::Unassigned
        }
    }

    /// `host` 포함 여부
    pub fn contains(&self, host: &ServerAddress) -> bool {
        self.role_of(host) != HostRole::Unassigned
    }

    /// 전체 호스트 수
    pub fn len(&self) -> usize {
        self.sources.len() + self.replicas.len()
    }

    /// 비어 있음 여부
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.replicas.is_empty()
    }

    /// 소스 존재 여부
    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// 레플리카 존재 여부
    pub fn has_replicas(&self) -> bool {
        !self.replicas.is_empty()
    }

    /// 전체 제거
    pub fn clear(&mut self) {
        self.sources.clear();
        self.replicas.clear();
    }
}
