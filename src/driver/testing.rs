//! 테스트용 인메모리 클러스터

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::driver::{AuthToken, DriverConfig, DriverConfigBuilder, ServerAddress};
use super::error::{DriverError, DriverResult};
use super::physical::{ConnectContext, Connector, Operation, Outcome, PhysicalConnection};

/// 테스트 호스트 주소 (포트 생략 시 기본 포트)
pub(crate) fn addr(name: &str) -> ServerAddress {
    ServerAddress::parse(name).unwrap()
}

/// 빠른 페일오버 설정 빌더
pub(crate) fn fast_config(url: &str) -> DriverConfigBuilder {
    DriverConfig::builder(url, AuthToken::none())
        .unwrap()
        .with_retries_all_down(2)
        .with_retry_backoff(Duration::ZERO)
}

#[derive(Debug, Default, Clone)]
struct HostState {
    up: bool,
    auth_fails: bool,
    latency: Duration,
    open_delay: Duration,
    epoch: u64,
    open_attempts: usize,
    opens: usize,
    executes: usize,
    pings: usize,
    commits: usize,
    rollbacks: usize,
}

type Hosts = Arc<Mutex<HashMap<ServerAddress, HostState>>>;

/// 가상 호스트 기반 커넥터
///
/// 호스트를 내리면 기존 연결이 모두 끊어집니다.
#[derive(Debug, Default)]
pub(crate) struct MockCluster {
    hosts: Hosts,
}

impl MockCluster {
    pub(crate) fn new(hosts: &[&str]) -> Arc<Self> {
        let cluster = Self::default();
        for host in hosts {
            cluster.add_host(host);
        }
        Arc::new(cluster)
    }

    pub(crate) fn add_host(&self, name: &str) {
        self.hosts.lock().insert(
            addr(name),
            HostState {
                up: true,
                ..HostState::default()
            },
        );
    }

    pub(crate) fn set_up(&self, name: &str, up: bool) {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(addr(name)).or_default();
        if state.up && !up {
            state.epoch += 1;
        }
        state.up = up;
    }

    pub(crate) fn set_auth_fails(&self, name: &str, fails: bool) {
        self.hosts.lock().entry(addr(name)).or_default().auth_fails = fails;
    }

    pub(crate) fn set_latency(&self, name: &str, latency: Duration) {
        self.hosts.lock().entry(addr(name)).or_default().latency = latency;
    }

    /// `name` 연결 시도마다 `delay` 지연 (성공/실패 무관)
    pub(crate) fn set_open_delay(&self, name: &str, delay: Duration) {
        self.hosts.lock().entry(addr(name)).or_default().open_delay = delay;
    }

    fn stat(&self, name: &str, f: impl Fn(&HostState) -> usize) -> usize {
        self.hosts.lock().get(&addr(name)).map(f).unwrap_or(0)
    }

    pub(crate) fn opens(&self, name: &str) -> usize {
        self.stat(name, |s| s.opens)
    }

    pub(crate) fn executes(&self, name: &str) -> usize {
        self.stat(name, |s| s.executes)
    }

    pub(crate) fn pings(&self, name: &str) -> usize {
        self.stat(name, |s| s.pings)
    }

    pub(crate) fn commits(&self, name: &str) -> usize {
        self.stat(name, |s| s.commits)
    }

    pub(crate) fn rollbacks(&self, name: &str) -> usize {
        self.stat(name, |s| s.rollbacks)
    }

    pub(crate) fn total_opens(&self) -> usize {
        self.hosts.lock().values().map(|s| s.opens).sum()
    }

    pub(crate) fn total_open_attempts(&self) -> usize {
        self.hosts.lock().values().map(|s| s.open_attempts).sum()
    }
}

impl Connector for MockCluster {
    fn open(
        &self,
        host: &ServerAddress,
        _ctx: &ConnectContext,
    ) -> DriverResult<Box<dyn PhysicalConnection>> {
        let delay = {
            let mut hosts = self.hosts.lock();
            match hosts.get_mut(host) {
                Some(state) => {
                    state.open_attempts += 1;
                    state.open_delay
                }
                None => Duration::ZERO,
            }
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut hosts = self.hosts.lock();
        let state = match hosts.get_mut(host) {
            Some(state) if state.up => state,
            _ => return Err(DriverError::connection(format!("Connection refused: {}", host))),
        };
        if state.auth_fails {
            return Err(DriverError::authentication(format!("Access denied on {}", host)));
        }
        state.opens += 1;

        Ok(Box::new(MockConnection {
            host: host.clone(),
            epoch: state.epoch,
            hosts: self.hosts.clone(),
            closed: false,
            read_only: false,
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    host: ServerAddress,
    epoch: u64,
    hosts: Hosts,
    closed: bool,
    read_only: bool,
}

impl MockConnection {
    /// 연결이 살아 있으면 호스트 상태에 `f` 적용
    fn with_state<T>(&self, f: impl FnOnce(&mut HostState) -> T) -> DriverResult<T> {
        if self.closed {
            return Err(DriverError::Closed);
        }
        let mut hosts = self.hosts.lock();
        match hosts.get_mut(&self.host) {
            Some(state) if state.up && state.epoch == self.epoch => Ok(f(state)),
            _ => Err(DriverError::connection(format!(
                "Communications link failure: {}",
                self.host
            ))),
        }
    }
}

impl PhysicalConnection for MockConnection {
    fn host(&self) -> &ServerAddress {
        &self.host
    }

    fn execute(&mut self, op: &Operation) -> DriverResult<Outcome> {
        let latency = self.with_state(|s| s.latency)?;
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        if self.read_only && op.kind().is_write() {
            return Err(DriverError::query(
                "25006",
                "Cannot execute statement in a READ ONLY transaction",
            ));
        }
        self.with_state(|s| s.executes += 1)?;
        Ok(Outcome::new(self.host.clone(), 1))
    }

    fn ping(&mut self) -> DriverResult<()> {
        self.with_state(|s| s.pings += 1)
    }

    fn is_valid(&self) -> bool {
        self.with_state(|_| ()).is_ok()
    }

    fn set_auto_commit(&mut self, _auto_commit: bool) -> DriverResult<()> {
        self.with_state(|_| ())
    }

    fn set_read_only(&mut self, read_only: bool) -> DriverResult<()> {
        self.with_state(|_| ())?;
        self.read_only = read_only;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.with_state(|s| s.commits += 1)
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.with_state(|s| s.rollbacks += 1)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
