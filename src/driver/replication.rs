//! Replication Connection
//!
//! 복제 연결
//!
//! 소스용/레플리카용 [`ConnectionProxy`] 두 개를 두고, 읽기 전용 여부로 사용할 쪽을 결정합니다.
//!
//! | 현재 연결 | `set_read_only(true)` | `set_read_only(false)` |
//! |-----------|-----------------------|------------------------|
//! | 소스 | 레플리카로 전환; 없으면 `read_from_source_when_no_replicas`일 때 소스 유지, 아니면 실패 | 변화 없음 |
//! | 레플리카 | 변화 없음 | 소스로 전환; 없으면 `allow_source_down_connections`일 때 레플리카에서 읽기 전용 유지, 아니면 실패 |

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::driver::ServerAddress;
use super::error::{DriverError, DriverResult};
use super::physical::{Operation, Outcome};
use super::proxy::{ConnectionProxy, HostScope, ProxyEnv};
use super::routing::{HostGroup, HostRole, HostSets};

#[derive(Debug)]
struct ReplicationState {
    current: HostRole,
    read_only: bool,
    closed: bool,
}

/// 소스/레플리카 복제 연결
pub struct ReplicationConnection {
    env: ProxyEnv,
    state: Mutex<ReplicationState>,
    source: ConnectionProxy,
    replicas: ConnectionProxy,
    group: Option<Arc<HostGroup>>,
}

impl ReplicationConnection {
    /// 소스에 즉시 연결하고, 레플리카가 있으면 레플리카에도 연결
    ///
    /// 소스에 연결할 수 없으면 `allow_source_down_connections`일 때
    /// 레플리카에서 읽기 전용으로 시작합니다. 레플리카 장애는
    /// `allow_replica_down_connections`일 때 허용됩니다.
    pub fn new(env: ProxyEnv, initial: &HostSets, group: Option<Arc<HostGroup>>) -> DriverResult<Self> {
        let config = env.config.clone();
        let source = ConnectionProxy::new(env.clone(), initial, HostScope::Sources, group.clone(), true)?;
        let replicas = ConnectionProxy::new(env.clone(), initial, HostScope::Replicas, group.clone(), false)?;
        replicas.set_read_only(true)?;

        let mut current = HostRole::Source;
        let mut read_only = false;

        let source_error = if source.has_candidates() {
            source.ensure_connected().err()
        } else {
            Some(DriverError::no_usable_host("No source hosts configured"))
        };
        if let Some(e) = source_error {
            if !config.allow_source_down_connections {
                return Err(e);
            }
            warn!(error = %e, "no source reachable; starting read-only on a replica");
            current = HostRole::Replica;
            read_only = true;
        }

        if replicas.has_candidates() {
            if let Err(e) = replicas.ensure_connected() {
                if current == HostRole::Replica || !config.allow_replica_down_connections {
                    return Err(e);
                }
                warn!(error = %e, "no replica reachable");
            }
        } else if current == HostRole::Replica {
            return Err(DriverError::no_usable_host(
                "Neither a source nor a replica host is available",
            ));
        }

        debug!(
            role = current.as_str(),
            group = ?group.as_ref().map(|g| g.name().to_string()),
            "replication connection opened"
        );

        Ok(Self {
            env,
            state: Mutex::new(ReplicationState {
                current,
                read_only,
                closed: false,
            }),
            source,
            replicas,
            group,
        })
    }

    fn proxy(&self, role: HostRole) -> &ConnectionProxy {
        match role {
            HostRole::Replica => &self.replicas,
            _ => &self.source,
        }
    }

    /// 현재 쪽에서 작업 실행
    ///
    /// 읽기 전용이면 쓰기는 로컬에서 거부합니다.
    pub fn execute(&self, op: &Operation) -> DriverResult<Outcome> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::Closed);
        }
        if state.read_only && op.kind().is_write() {
            return Err(DriverError::read_only(format!(
                "Connection is read-only; refusing '{}'",
                op.sql()
            )));
        }

        match self.proxy(state.current).execute(op) {
            Err(DriverError::NoUsableHost(reason))
                if state.current == HostRole::Replica
                    && self.env.config.read_from_source_when_no_replicas
                    && self.source.has_candidates() =>
            {
                debug!(%reason, "no replica usable; reading from a source");
                self.source.set_read_only(true)?;
                state.current = HostRole::Source;
                self.source.execute(op)
            }
            result => result,
        }
    }

    /// 소스/레플리카 전환
    pub fn set_read_only(&self, read_only: bool) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(DriverError::Closed);
        }

        if read_only {
            self.switch_to_replicas(&mut state)
        } else {
            self.switch_to_source(&mut state)
        }
    }

    fn switch_to_replicas(&self, state: &mut ReplicationState) -> DriverResult<()> {
        if state.current == HostRole::Replica {
            state.read_only = true;
            return Ok(());
        }
        if self.source.in_transaction() {
            return Err(DriverError::transaction(
                "Cannot switch to read-only while a transaction is open",
            ));
        }

        let replica_error = if self.replicas.has_candidates() {
            match self.replicas.ensure_connected() {
                Ok(host) => {
                    debug!(%host, "switched to replica");
                    state.current = HostRole::Replica;
                    state.read_only = true;
                    return Ok(());
                }
                Err(e) => e,
            }
        } else {
            DriverError::no_usable_host("No replica hosts available for read-only mode")
        };

        if !self.env.config.read_from_source_when_no_replicas {
            return Err(replica_error);
        }
        debug!(error = %replica_error, "staying on the source in read-only mode");
        self.source.set_read_only(true)?;
        state.read_only = true;
        Ok(())
    }

    fn switch_to_source(&self, state: &mut ReplicationState) -> DriverResult<()> {
        if state.current == HostRole::Source {
            if state.read_only {
                self.source.set_read_only(false)?;
            }
            state.read_only = false;
            return Ok(());
        }
        if self.replicas.in_transaction() {
            return Err(DriverError::transaction(
                "Cannot leave read-only mode while a transaction is open",
            ));
        }

        let source_error = if self.source.has_candidates() {
            match self.source.ensure_connected() {
                Ok(host) => {
                    self.source.set_read_only(false)?;
                    debug!(%host, "switched to source");
                    state.current = HostRole::Source;
                    state.read_only = false;
                    return Ok(());
                }
                Err(e) => e,
            }
        } else {
            DriverError::no_usable_host("No source hosts available")
        };

        if !self.env.config.allow_source_down_connections {
            return Err(source_error);
        }
        warn!(error = %source_error, "no source reachable; staying read-only on the replica");
        Ok(())
    }

    /// 양쪽 자동 커밋 설정 (양쪽 모두 재분배 경계)
    ///
    /// 승격 등 그룹 변경은 재연결 없이 양쪽에 반영됩니다.
    pub fn set_auto_commit(&self, auto_commit: bool) -> DriverResult<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(DriverError::Closed);
        }

        self.proxy(state.current).set_auto_commit(auto_commit)?;
        let other = self.proxy(other_role(state.current));
        if let Err(e) = other.set_auto_commit(auto_commit) {
            debug!(error = %e, "autocommit not applied to the inactive side");
        }
        Ok(())
    }

    /// 현재 쪽 커밋
    pub fn commit(&self) -> DriverResult<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(DriverError::Closed);
        }
        self.proxy(state.current).commit()?;
        self.proxy(other_role(state.current)).refresh_hosts();
        Ok(())
    }

    /// 현재 쪽 롤백
    pub fn rollback(&self) -> DriverResult<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(DriverError::Closed);
        }
        self.proxy(state.current).rollback()?;
        self.proxy(other_role(state.current)).refresh_hosts();
        Ok(())
    }

    /// 양쪽 모든 연결에 핑
    ///
    /// 현재 쪽 실패만 에러로 반환합니다.
    pub fn ping(&self) -> DriverResult<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(DriverError::Closed);
        }

        let other = self.proxy(other_role(state.current));
        if other.live_connection_count() > 0 {
            if let Err(e) = other.ping() {
                debug!(error = %e, "ping of the inactive side failed");
            }
        }
        self.proxy(state.current).ping()
    }

    /// 활성 호스트가 소스인지 여부
    ///
    /// 그룹을 통한 역할 변경이 즉시 반영됩니다.
    pub fn is_source_connection(&self) -> bool {
        match self.current_host() {
            Some(host) => self.is_host_source(&host),
            None => false,
        }
    }

    /// `host`가 소스인지 여부
    pub fn is_host_source(&self, host: &ServerAddress) -> bool {
        match &self.group {
            Some(group) => group.role_of(host) == HostRole::Source,
            None => self.source.hosts().contains(host),
        }
    }

    /// `host`가 레플리카인지 여부
    pub fn is_host_replica(&self, host: &ServerAddress) -> bool {
        match &self.group {
            Some(group) => group.role_of(host) == HostRole::Replica,
            None => self.replicas.hosts().contains(host),
        }
    }

    /// 현재 활성 호스트
    pub fn current_host(&self) -> Option<ServerAddress> {
        let state = self.state.lock();
        self.proxy(state.current).current_host()
    }

    /// 현재 역할
    pub fn current_role(&self) -> HostRole {
        self.state.lock().current
    }

    /// 읽기 전용 여부
    pub fn is_read_only(&self) -> bool {
        self.state.lock().read_only
    }

    /// 소스 후보
    pub fn source_hosts(&self) -> Vec<ServerAddress> {
        self.source.hosts()
    }

    /// 레플리카 후보
    pub fn replica_hosts(&self) -> Vec<ServerAddress> {
        self.replicas.hosts()
    }

    /// 바인딩된 그룹
    pub fn group(&self) -> Option<&Arc<HostGroup>> {
        self.group.as_ref()
    }

    /// 양쪽 연결 닫기
    pub fn close(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let source = self.source.close();
        let replicas = self.replicas.close();
        source.and(replicas)
    }

    /// 롤백 없이 양쪽 연결 중단
    pub fn abort(&self) {
        self.state.lock().closed = true;
        self.source.abort();
        self.replicas.abort();
    }

    /// 닫힘 여부
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn other_role(role: HostRole) -> HostRole {
    match role {
        HostRole::Replica => HostRole::Source,
        _ => HostRole::Replica,
    }
}

impl fmt::Debug for ReplicationConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReplicationConnection")
            .field("current", &state.current)
            .field("read_only", &state.read_only)
            .field("closed", &state.closed)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
