//! Connection Proxy
//!
//! 로드밸런스 논리 연결
//!
//! 모든 작업을 활성 물리 연결로 전달하고, 호스트 전환은 안전한 경계에서만
//! 수행합니다 (첫 작업 전, 재분배가 필요한 커밋/롤백 후, 활성 연결 장애 시).
//!
//! 상태 전이: `Unbound -> Active(host) -> {Active(host'), Closed, Failed}`
//!
//! 락 순서: 프록시 락 -> 그룹 락. 그룹 변경은 멤버 메일박스로 전달되고
//! 다음 작업 시작 시 프록시 락 안에서 적용됩니다.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::driver::{DriverConfig, ServerAddress};
use super::error::{DriverError, DriverResult};
use super::physical::{ConnectContext, Connector, Operation, Outcome};
use super::pool::{PhysicalCounters, PhysicalPool, PoolMetrics};
use super::routing::{
    BalanceStrategy, Blocklist, BlocklistView, GroupEvent, GroupMember, HostGroup, HostRole,
    HostSets, SelectionContext,
};

static NEXT_PROXY_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// ProxyEnv / HostScope / ProxyState - 프록시 환경/상태
// ============================================================================

/// 드라이버 공유 자원 (설정, 커넥터, 전역 블록리스트)
#[derive(Clone)]
pub struct ProxyEnv {
    pub(crate) config: Arc<DriverConfig>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) global_blocklist: Option<Arc<Blocklist>>,
}

impl ProxyEnv {
    /// 새 환경 생성 (전역 블록리스트 없음)
    pub fn new(config: Arc<DriverConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            global_blocklist: None,
        }
    }

    /// 전역 블록리스트 설정
    pub fn with_global_blocklist(mut self, blocklist: Arc<Blocklist>) -> Self {
        self.global_blocklist = Some(blocklist);
        self
    }
}

impl fmt::Debug for ProxyEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEnv")
            .field("mode", &self.config.mode)
            .field("global_blocklist", &self.global_blocklist.is_some())
            .finish()
    }
}

/// 선택 대상 역할
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostScope {
    /// 소스 + 레플리카
    All,
    /// 소스만
    Sources,
    /// 레플리카만
    Replicas,
}

impl HostScope {
    /// `role` 호스트가 후보인지 여부
    pub fn admits(&self, role: HostRole) -> bool {
        match self {
            HostScope::All => role != HostRole::Unassigned,
            HostScope::Sources => role == HostRole::Source,
            HostScope::Replicas => role == HostRole::Replica,
        }
    }

    /// `sets`에서 후보 목록 추출
    pub fn candidates(&self, sets: &HostSets) -> Vec<ServerAddress> {
        match self {
            HostScope::All => sets.all(),
            HostScope::Sources => sets.sources().to_vec(),
            HostScope::Replicas => sets.replicas().to_vec(),
        }
    }
}

/// 논리 연결 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyState {
    /// 활성 호스트 없음
    Unbound,
    /// 활성 호스트
    Active(ServerAddress),
    /// 닫힘
    Closed,
    /// 모든 후보 실패
    Failed(String),
}

// ============================================================================
// ConnectionProxy - 논리 연결
// ============================================================================

struct ProxyInner {
    state: ProxyState,
    hosts: Vec<ServerAddress>,
    pool: PhysicalPool,
    blocklist: Blocklist,
    strategy: Box<dyn BalanceStrategy>,
    auto_commit: bool,
    in_transaction: bool,
    read_only: bool,
    rebalance_due: bool,
    statements_since_swap: usize,
    pending_removals: HashMap<ServerAddress, Instant>,
    lost_transaction: Option<String>,
}

impl ProxyInner {
    fn active_host(&self) -> Option<&ServerAddress> {
        match &self.state {
            ProxyState::Active(host) => Some(host),
            _ => None,
        }
    }

    fn is_active(&self, host: &ServerAddress) -> bool {
        self.active_host() == Some(host)
    }
}

/// 로드밸런스 논리 연결
pub struct ConnectionProxy {
    id: u64,
    env: ProxyEnv,
    scope: HostScope,
    connect_context: ConnectContext,
    group: Option<Arc<HostGroup>>,
    member: Option<Arc<GroupMember>>,
    unregistered: AtomicBool,
    inner: Mutex<ProxyInner>,
}

impl ConnectionProxy {
    /// 새 프록시 생성
    ///
    /// 그룹이 있으면 후보는 그룹에서 가져오고 그룹 변경을 따릅니다.
    /// (첫 등록 시 `initial`로 초기화). `counted`는 그룹의 논리 연결
    /// 카운트 포함 여부입니다.
    pub fn new(
        env: ProxyEnv,
        initial: &HostSets,
        scope: HostScope,
        group: Option<Arc<HostGroup>>,
        counted: bool,
    ) -> DriverResult<Self> {
        let counters = Arc::new(PhysicalCounters::default());

        let (member, hosts) = match &group {
            Some(group) => {
                let (member, snapshot) = group.register(initial, counted, counters.clone());
                if group.is_inconsistent() {
                    group.unregister(member.id());
                    return Err(DriverError::inconsistent_group(group.name()));
                }
                (Some(member), scope.candidates(&snapshot))
            }
            None => (None, scope.candidates(initial)),
        };

        let strategy = env
            .config
            .balance_policy
            .create(&env.config.server_affinity_order);
        let connect_context = env.config.connect_context();

        Ok(Self {
            id: NEXT_PROXY_ID.fetch_add(1, Ordering::Relaxed),
            env,
            scope,
            connect_context,
            group,
            member,
            unregistered: AtomicBool::new(false),
            inner: Mutex::new(ProxyInner {
                state: ProxyState::Unbound,
                hosts,
                pool: PhysicalPool::new(counters),
                blocklist: Blocklist::new(),
                strategy,
                auto_commit: true,
                in_transaction: false,
                read_only: false,
                rebalance_due: false,
                statements_since_swap: 0,
                pending_removals: HashMap::new(),
                lost_transaction: None,
            }),
        })
    }

    /// 프록시 ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 바인딩된 그룹
    pub fn group(&self) -> Option<&Arc<HostGroup>> {
        self.group.as_ref()
    }

    /// 활성 호스트에서 작업 실행
    ///
    /// 일시적 장애는 호스트를 블록리스트에 넣고 다른 호스트로 재시도합니다.
    /// 트랜잭션 중이면 [`DriverError::TransactionLost`]를 반환합니다.
    pub fn execute(&self, op: &Operation) -> DriverResult<Outcome> {
        let mut inner = self.inner.lock();
        self.ensure_usable(&mut inner)?;

        if inner.read_only && op.kind().is_write() {
            return Err(DriverError::read_only(format!(
                "Connection is read-only; refusing '{}'",
                op.sql()
            )));
        }

        let mut attempts = 0;
        loop {
            let host = self.ensure_active(&mut inner)?;
            let started = Instant::now();
            let result = match inner.pool.get_mut(&host) {
                Some(conn) => conn.connection_mut().execute(op),
                None => Err(DriverError::connection(format!("No connection to {}", host))),
            };

            match result {
                Ok(outcome) => {
                    inner.pool.record_response_time(&host, started.elapsed());
                    self.after_statement(&mut inner, op);
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() => {
                    let in_transaction = inner.in_transaction;
                    self.invalidate(&mut inner, &host, true);
                    if in_transaction {
                        inner.in_transaction = false;
                        warn!(proxy = self.id, %host, error = %e, "transaction lost");
                        return Err(DriverError::transaction_lost(format!(
                            "Connection to {} failed during a transaction: {}",
                            host, e
                        )));
                    }

                    attempts += 1;
                    if attempts > inner.hosts.len() {
                        return Err(e);
                    }
                    debug!(proxy = self.id, %host, attempts, "retrying statement on another host");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 커밋 (재분배 경계)
    pub fn commit(&self) -> DriverResult<()> {
        self.end_transaction(true)
    }

    /// 롤백 (재분배 경계)
    pub fn rollback(&self) -> DriverResult<()> {
        self.end_transaction(false)
    }

    /// 자동 커밋 설정 (재분배 경계)
    ///
    /// 자동 커밋을 켜면 진행 중인 트랜잭션을 커밋합니다.
    pub fn set_auto_commit(&self, auto_commit: bool) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_usable(&mut inner)?;

        if auto_commit && !inner.auto_commit && inner.in_transaction {
            drop(inner);
            self.commit()?;
            inner = self.inner.lock();
        }

        inner.auto_commit = auto_commit;
        if auto_commit {
            inner.rebalance_due = true;
        }

        if let Some(host) = inner.active_host().cloned() {
            let result = match inner.pool.get_mut(&host) {
                Some(conn) => conn.connection_mut().set_auto_commit(auto_commit),
                None => Ok(()),
            };
            if let Err(e) = result {
                if !e.is_retryable() {
                    return Err(e);
                }
                self.invalidate(&mut inner, &host, true);
            }
        }
        Ok(())
    }

    /// 읽기 전용 설정 (쓰기는 로컬에서 거부)
    pub fn set_read_only(&self, read_only: bool) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_usable(&mut inner)?;
        inner.read_only = read_only;

        if let Some(host) = inner.active_host().cloned() {
            let result = match inner.pool.get_mut(&host) {
                Some(conn) => conn.connection_mut().set_read_only(read_only),
                None => Ok(()),
            };
            if let Err(e) = result {
                if !e.is_retryable() {
                    return Err(e);
                }
                self.invalidate(&mut inner, &host, true);
            }
        }
        Ok(())
    }

    /// 모든 물리 연결에 핑
    ///
    /// 끊어진 연결은 제거되고 블록리스트에 등록됩니다.
    /// 활성 연결 실패만 에러로 반환합니다.
    pub fn ping(&self) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_usable(&mut inner)?;
        if inner.pool.len() == 0 {
            self.ensure_active(&mut inner)?;
        }

        let active = inner.active_host().cloned();
        let mut active_error = None;

        for host in inner.pool.hosts() {
            let result = match inner.pool.get_mut(&host) {
                Some(conn) => conn.connection_mut().ping(),
                None => continue,
            };
            if let Err(e) = result {
                warn!(proxy = self.id, %host, error = %e, "ping failed");
                self.invalidate(&mut inner, &host, e.is_retryable());
                if active.as_ref() == Some(&host) {
                    active_error = Some(e);
                }
            }
        }

        match active_error {
            Some(e) if inner.in_transaction => {
                inner.in_transaction = false;
                Err(DriverError::transaction_lost(format!(
                    "Active connection failed during a transaction: {}",
                    e
                )))
            }
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// 즉시 호스트 연결
    ///
    /// 실패 상태의 프록시도 다시 시도합니다.
    pub fn ensure_connected(&self) -> DriverResult<ServerAddress> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, ProxyState::Failed(_)) {
            inner.state = ProxyState::Unbound;
        }
        self.ensure_usable(&mut inner)?;
        self.ensure_active(&mut inner)
    }

    /// 연결 닫기 (진행 중인 트랜잭션은 롤백)
    pub fn close(&self) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == ProxyState::Closed {
            return Ok(());
        }

        if inner.in_transaction {
            if let Some(host) = inner.active_host().cloned() {
                if let Some(conn) = inner.pool.get_mut(&host) {
                    if let Err(e) = conn.connection_mut().rollback() {
                        debug!(proxy = self.id, %host, error = %e, "rollback on close failed");
                    }
                }
            }
            inner.in_transaction = false;
        }

        inner.pool.close_all();
        inner.state = ProxyState::Closed;
        drop(inner);

        self.unregister();
        debug!(proxy = self.id, "connection closed");
        Ok(())
    }

    /// 롤백 없이 연결 중단
    pub fn abort(&self) {
        let mut inner = self.inner.lock();
        inner.pool.close_all();
        inner.in_transaction = false;
        inner.state = ProxyState::Closed;
        drop(inner);

        self.unregister();
        info!(proxy = self.id, "connection aborted");
    }

    /// 현재 활성 호스트
    pub fn current_host(&self) -> Option<ServerAddress> {
        self.inner.lock().active_host().cloned()
    }

    /// 후보 호스트 (그룹 변경 반영)
    pub fn hosts(&self) -> Vec<ServerAddress> {
        let mut inner = self.inner.lock();
        self.apply_group_events(&mut inner);
        inner.hosts.clone()
    }

    /// 후보 존재 여부
    pub fn has_candidates(&self) -> bool {
        !self.hosts().is_empty()
    }

    /// 그룹 변경 반영
    pub(crate) fn refresh_hosts(&self) {
        let mut inner = self.inner.lock();
        self.apply_group_events(&mut inner);
    }

    /// 연결 상태
    pub fn state(&self) -> ProxyState {
        self.inner.lock().state.clone()
    }

    /// 닫힘 여부
    pub fn is_closed(&self) -> bool {
        self.inner.lock().state == ProxyState::Closed
    }

    /// 읽기 전용 여부
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().read_only
    }

    /// 자동 커밋 여부
    pub fn auto_commit(&self) -> bool {
        self.inner.lock().auto_commit
    }

    /// 트랜잭션 진행 여부
    pub fn in_transaction(&self) -> bool {
        self.inner.lock().in_transaction
    }

    /// 로컬 블록리스트 호스트
    pub fn blocklisted_hosts(&self) -> Vec<ServerAddress> {
        self.inner.lock().blocklist.hosts()
    }

    /// 캐시된 물리 연결 수
    pub fn live_connection_count(&self) -> usize {
        self.inner.lock().pool.len()
    }

    /// 물리 연결 메트릭
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.lock().pool.metrics()
    }

    // ------------------------------------------------------------------------
    // 내부
    // ------------------------------------------------------------------------

    fn view<'a>(&'a self, inner: &'a ProxyInner) -> BlocklistView<'a> {
        BlocklistView::new(&inner.blocklist, self.env.global_blocklist.as_deref())
    }

    fn ensure_usable(&self, inner: &mut ProxyInner) -> DriverResult<()> {
        match &inner.state {
            ProxyState::Closed => return Err(DriverError::Closed),
            ProxyState::Failed(reason) => return Err(DriverError::no_usable_host(reason.clone())),
            _ => {}
        }

        self.apply_group_events(inner);
        self.expire_pending_removals(inner);

        if let Some(reason) = inner.lost_transaction.take() {
            return Err(DriverError::transaction_lost(reason));
        }
        if let Some(group) = &self.group {
            if group.is_inconsistent() {
                return Err(DriverError::inconsistent_group(group.name()));
            }
        }
        Ok(())
    }

    /// 활성 호스트 반환 (필요 시 먼저 전환)
    fn ensure_active(&self, inner: &mut ProxyInner) -> DriverResult<ServerAddress> {
        if let Some(host) = inner.active_host().cloned() {
            let usable = inner.pool.get_mut(&host).map_or(false, |c| c.is_valid());

            if !usable {
                self.invalidate(inner, &host, true);
                if inner.in_transaction {
                    inner.in_transaction = false;
                    warn!(proxy = self.id, %host, "transaction lost on broken connection");
                    return Err(DriverError::transaction_lost(format!(
                        "Connection to {} broke during a transaction",
                        host
                    )));
                }
            } else if inner.in_transaction {
                return Ok(host);
            } else {
                let stale = !inner.hosts.contains(&host);
                let excluded = self.view(inner).is_excluded(&host);
                if !(inner.rebalance_due || stale || excluded) {
                    return Ok(host);
                }
            }
        }

        self.pick_new_connection(inner)
    }

    /// 호스트 선택 및 활성화 (전체 장애 라운드 재시도)
    fn pick_new_connection(&self, inner: &mut ProxyInner) -> DriverResult<ServerAddress> {
        if inner.hosts.is_empty() {
            return Err(DriverError::no_usable_host("No candidate hosts"));
        }

        let previous = inner.active_host().cloned();
        if let Some(host) = &previous {
            if let Some(conn) = inner.pool.get_mut(host) {
                conn.mark_idle();
            }
        }

        let config = self.env.config.clone();
        let rounds = config.retries_all_down.max(1);

        for round in 0..rounds {
            // 라운드당 호스트별 최대 1회 시도 (블록리스트 TTL과 무관)
            let mut tried: HashSet<ServerAddress> = HashSet::new();
            loop {
                let candidates = inner.hosts.clone();
                let picked = {
                    let view = self.view(inner);
                    let mut excluded = view.excluded(&candidates);
                    excluded.extend(tried.iter().cloned());
                    let live = inner.pool.live_hosts();
                    let ctx = SelectionContext {
                        candidates: &candidates,
                        excluded: &excluded,
                        live: &live,
                        response_times: inner.pool.response_times(),
                    };
                    inner.strategy.pick(&ctx)
                };

                let host = match picked {
                    Some(host) => host,
                    None => break,
                };

                match self.activate(inner, &host) {
                    Ok(()) => {
                        self.view(inner).clear(&host);
                        inner.state = ProxyState::Active(host.clone());
                        inner.rebalance_due = false;
                        inner.statements_since_swap = 0;
                        debug!(
                            proxy = self.id,
                            from = ?previous,
                            to = %host,
                            strategy = inner.strategy.name(),
                            "active host selected"
                        );
                        return Ok(host);
                    }
                    Err(e) if e.is_retryable() => {
                        self.invalidate(inner, &host, true);
                        tried.insert(host);
                    }
                    Err(e) => {
                        if e.is_client_error() {
                            debug!(proxy = self.id, %host, error = %e, "connection rejected; not blocklisting");
                        } else {
                            warn!(proxy = self.id, %host, error = %e, "non-transient failure; not blocklisting");
                        }
                        inner.pool.evict(&host);
                        if inner.is_active(&host) {
                            inner.state = ProxyState::Unbound;
                        }
                        return Err(e);
                    }
                }
            }

            if round + 1 < rounds {
                debug!(proxy = self.id, round, "all candidates excluded; starting a new round");
                if !config.retry_backoff.is_zero() {
                    thread::sleep(config.retry_backoff);
                }
                inner.blocklist.clear_all();
            }
        }

        let reason = format!(
            "All {} candidate hosts failed after {} attempts",
            inner.hosts.len(),
            rounds
        );
        warn!(proxy = self.id, "{}", reason);
        inner.state = ProxyState::Failed(reason.clone());
        Err(DriverError::no_usable_host(reason))
    }

    /// `host` 연결 활성화 (캐시된 연결 재사용)
    fn activate(&self, inner: &mut ProxyInner, host: &ServerAddress) -> DriverResult<()> {
        let validate = self.env.config.validate_connection_on_swap;

        let cached = match inner.pool.get_mut(host) {
            Some(conn) if conn.is_valid() => {
                if validate {
                    match conn.connection_mut().ping() {
                        Ok(()) => true,
                        Err(e) => {
                            debug!(proxy = self.id, %host, error = %e, "cached connection failed validation");
                            return Err(if e.is_retryable() {
                                e
                            } else {
                                DriverError::connection(format!("Validation of {} failed: {}", host, e))
                            });
                        }
                    }
                } else {
                    true
                }
            }
            _ => false,
        };

        if !cached {
            inner.pool.evict(host);
            let conn = self.env.connector.open(host, &self.connect_context)?;
            inner.pool.insert(conn);
        }

        let (auto_commit, read_only) = (inner.auto_commit, inner.read_only);
        let pooled = inner
            .pool
            .get_mut(host)
            .ok_or_else(|| DriverError::connection(format!("No connection to {}", host)))?;

        let conn = pooled.connection_mut();
        conn.set_auto_commit(auto_commit)?;
        conn.set_read_only(read_only)?;
        pooled.mark_active();
        Ok(())
    }

    /// `host` 연결 제거 (선택적으로 블록리스트 등록)
    fn invalidate(&self, inner: &mut ProxyInner, host: &ServerAddress, blocklist: bool) {
        if blocklist {
            warn!(proxy = self.id, %host, "blocklisting host");
            self.view(inner).add(host, self.env.config.blocklist_timeout);
        }
        if let Some(conn) = inner.pool.get_mut(host) {
            conn.mark_failed();
        }
        inner.pool.evict(host);
        if inner.is_active(host) {
            inner.state = ProxyState::Unbound;
        }
    }

    fn after_statement(&self, inner: &mut ProxyInner, op: &Operation) {
        if !inner.auto_commit {
            inner.in_transaction = true;
            return;
        }

        let threshold = self.env.config.auto_commit_statement_threshold;
        if threshold == 0 {
            return;
        }
        let counts = self
            .env
            .config
            .auto_commit_statement_regex
            .as_ref()
            .map_or(true, |re| re.is_match(op.sql()));
        if counts {
            inner.statements_since_swap += 1;
            if inner.statements_since_swap >= threshold {
                inner.statements_since_swap = 0;
                inner.rebalance_due = true;
            }
        }
    }

    fn end_transaction(&self, commit: bool) -> DriverResult<()> {
        let mut inner = self.inner.lock();
        self.ensure_usable(&mut inner)?;

        let was_open = inner.in_transaction;
        inner.in_transaction = false;
        inner.rebalance_due = true;
        inner.pending_removals.clear();

        let host = match inner.active_host().cloned() {
            Some(host) => host,
            None => return Ok(()),
        };
        let result = match inner.pool.get_mut(&host) {
            Some(conn) if commit => conn.connection_mut().commit(),
            Some(conn) => conn.connection_mut().rollback(),
            None => Err(DriverError::connection(format!("No connection to {}", host))),
        };

        match result {
            Ok(()) => {
                if was_open {
                    inner.pool.counters().on_transaction();
                }
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                self.invalidate(&mut inner, &host, true);
                if was_open {
                    warn!(proxy = self.id, %host, error = %e, "transaction lost");
                    Err(DriverError::transaction_lost(format!(
                        "Connection to {} failed while ending the transaction: {}",
                        host, e
                    )))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------------
    // 그룹 변경
    // ------------------------------------------------------------------------

    fn apply_group_events(&self, inner: &mut ProxyInner) {
        let member = match &self.member {
            Some(member) => member,
            None => return,
        };

        for event in member.take_events() {
            match event {
                GroupEvent::HostAdded { host, role } => {
                    if self.scope.admits(role) {
                        self.add_candidate(inner, host);
                    }
                }
                GroupEvent::RoleChanged { host, role } => {
                    if self.scope.admits(role) {
                        self.add_candidate(inner, host);
                    } else {
                        self.retire(inner, &host, false);
                    }
                }
                GroupEvent::HostRemoved { host, immediate } => {
                    self.retire(inner, &host, immediate);
                }
            }
        }
    }

    fn add_candidate(&self, inner: &mut ProxyInner, host: ServerAddress) {
        inner.pending_removals.remove(&host);
        if !inner.hosts.contains(&host) {
            debug!(proxy = self.id, %host, "candidate added");
            inner.hosts.push(host);
        }
        if matches!(inner.state, ProxyState::Failed(_)) {
            inner.state = ProxyState::Unbound;
        }
    }

    fn retire(&self, inner: &mut ProxyInner, host: &ServerAddress, immediate: bool) {
        inner.hosts.retain(|h| h != host);

        if !inner.is_active(host) {
            inner.pool.evict(host);
            return;
        }

        if immediate {
            if inner.in_transaction {
                inner.in_transaction = false;
                warn!(proxy = self.id, %host, "active host removed during a transaction");
                inner.lost_transaction = Some(format!(
                    "Host {} was removed from the group during a transaction",
                    host
                ));
            }
            debug!(proxy = self.id, %host, "active host removed; connection invalidated");
            self.invalidate(inner, host, false);
        } else if inner.in_transaction {
            let deadline = Instant::now() + self.env.config.host_removal_grace_period;
            inner.pending_removals.insert(host.clone(), deadline);
        }
    }

    fn expire_pending_removals(&self, inner: &mut ProxyInner) {
        if inner.pending_removals.is_empty() {
            return;
        }

        let now = Instant::now();
        let expired: Vec<ServerAddress> = inner
            .pending_removals
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(host, _)| host.clone())
            .collect();

        for host in expired {
            inner.pending_removals.remove(&host);
            if inner.is_active(&host) {
                if inner.in_transaction {
                    inner.in_transaction = false;
                    warn!(proxy = self.id, %host, "grace period of removed host elapsed during a transaction");
                    inner.lost_transaction = Some(format!(
                        "Grace period for removed host {} elapsed during a transaction",
                        host
                    ));
                }
                self.invalidate(inner, &host, false);
            }
        }
    }

    fn unregister(&self) {
        if self.unregistered.swap(true, Ordering::AcqRel) {
            return;
        }
        if let (Some(group), Some(member)) = (&self.group, &self.member) {
            group.unregister(member.id());
        }
    }
}

impl Drop for ConnectionProxy {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl fmt::Debug for ConnectionProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProxy")
            .field("id", &self.id)
            .field("scope", &self.scope)
            .field("group", &self.group.as_ref().map(|g| g.name().to_string()))
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::driver::{Driver, DriverConfigBuilder};
    use crate::driver::routing::{BalancePolicy, GroupRegistry};
    use crate::driver::testing::{addr, fast_config, MockCluster};
    use regex::Regex;
    use std::sync::mpsc;
    use std::time::Duration;

    fn driver(cluster: &Arc<MockCluster>, builder: DriverConfigBuilder) -> Driver {
        Driver::with_config(builder.build(), cluster.clone(), Arc::new(GroupRegistry::new())).unwrap()
    }

    fn grouped_driver(
        cluster: &Arc<MockCluster>,
        builder: DriverConfigBuilder,
        registry: &Arc<GroupRegistry>,
    ) -> Driver {
        Driver::with_config(builder.build(), cluster.clone(), registry.clone()).unwrap()
    }

    fn sequential(url: &str) -> DriverConfigBuilder {
        fast_config(url).with_balance_policy(BalancePolicy::Sequential)
    }

    fn select() -> Operation {
        Operation::new("SELECT 1")
    }

    fn insert() -> Operation {
        Operation::new("INSERT INTO t VALUES (1)")
    }

    fn assert_active_not_blocklisted(proxy: &ConnectionProxy) {
        if let Some(host) = proxy.current_host() {
            assert!(!proxy.blocklisted_hosts().contains(&host));
        }
    }

    #[test]
    fn test_lazy_connect() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, fast_config("loadbalance://a,b"));

        let proxy = driver.connect().unwrap();
        assert_eq!(proxy.state(), ProxyState::Unbound);
        assert_eq!(cluster.total_opens(), 0);

        let outcome = proxy.execute(&select()).unwrap();
        assert_eq!(proxy.current_host(), Some(outcome.host));
        assert_eq!(cluster.total_opens(), 1);
    }

    #[test]
    fn test_failover_skips_down_host() {
        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_up("a", false);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        let outcome = proxy.execute(&select()).unwrap();
        assert_eq!(outcome.host, addr("b"));
        assert_eq!(proxy.blocklisted_hosts(), vec![addr("a")]);
        assert_active_not_blocklisted(&proxy);
    }

    #[test]
    fn test_sequential_failover_wraps_back() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));

        cluster.set_up("a", false);
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));

        cluster.set_up("b", false);
        cluster.set_up("a", true);
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));
        assert_active_not_blocklisted(&proxy);
    }

    #[test]
    fn test_exhausted_candidates_fail_fast() {
        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_up("a", false);
        cluster.set_up("b", false);
        let driver = driver(&cluster, fast_config("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        let err = proxy.execute(&select()).unwrap_err();
        assert!(matches!(err, DriverError::NoUsableHost(_)));
        assert!(matches!(proxy.state(), ProxyState::Failed(_)));

        cluster.set_up("a", true);
        let err = proxy.execute(&select()).unwrap_err();
        assert_eq!(err.code(), "08001");
        assert_eq!(cluster.total_opens(), 0);
    }

    #[test]
    fn test_auth_error_is_not_blocklisted() {
        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_auth_fails("a", true);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        let err = proxy.execute(&select()).unwrap_err();
        assert!(matches!(err, DriverError::Authentication(_)));
        assert!(proxy.blocklisted_hosts().is_empty());
        assert_eq!(proxy.state(), ProxyState::Unbound);
    }

    #[test]
    fn test_sticky_within_transaction() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        proxy.set_auto_commit(false).unwrap();
        for _ in 0..5 {
            assert_eq!(proxy.execute(&insert()).unwrap().host, addr("a"));
        }
        assert!(proxy.in_transaction());

        proxy.commit().unwrap();
        assert!(!proxy.in_transaction());
        assert_eq!(cluster.commits("a"), 1);

        // 커밋은 재분배 경계
        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("b"));
        assert_eq!(proxy.metrics().total_transactions, 1);
    }

    #[test]
    fn test_failure_inside_transaction_is_reported() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        proxy.set_auto_commit(false).unwrap();
        proxy.execute(&insert()).unwrap();
        cluster.set_up("a", false);

        let err = proxy.execute(&insert()).unwrap_err();
        assert!(matches!(err, DriverError::TransactionLost(_)));
        assert!(!proxy.in_transaction());

        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("b"));
        assert_active_not_blocklisted(&proxy);
    }

    #[test]
    fn test_autocommit_failure_retries_elsewhere() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        proxy.execute(&select()).unwrap();
        cluster.set_up("a", false);

        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));
    }

    #[test]
    fn test_statement_threshold_rebalances() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b").with_auto_commit_statement_threshold(2),
        );
        let proxy = driver.connect().unwrap();

        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));
    }

    #[test]
    fn test_statement_regex_limits_counting() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b")
                .with_auto_commit_statement_threshold(1)
                .with_auto_commit_statement_regex(Regex::new("^INSERT").unwrap()),
        );
        let proxy = driver.connect().unwrap();

        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));
        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("a"));
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));
    }

    #[test]
    fn test_read_only_rejects_writes_locally() {
        let cluster = MockCluster::new(&["a"]);
        let driver = driver(&cluster, fast_config("loadbalance://a"));
        let proxy = driver.connect().unwrap();

        proxy.set_read_only(true).unwrap();
        let err = proxy.execute(&insert()).unwrap_err();
        assert_eq!(err.code(), "25006");
        assert_eq!(cluster.total_opens(), 0);

        proxy.execute(&select()).unwrap();
        assert!(proxy.is_read_only());
    }

    #[test]
    fn test_read_only_is_sticky_across_swaps() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        proxy.set_read_only(true).unwrap();
        proxy.execute(&select()).unwrap();
        cluster.set_up("a", false);
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));

        assert!(proxy.is_read_only());
        assert!(matches!(proxy.execute(&insert()), Err(DriverError::ReadOnly(_))));
    }

    #[test]
    fn test_ping_reaches_every_live_connection() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        proxy.execute(&select()).unwrap();
        proxy.commit().unwrap();
        proxy.execute(&select()).unwrap();
        assert_eq!(proxy.live_connection_count(), 2);

        proxy.ping().unwrap();
        assert_eq!(cluster.pings("a"), 1);
        assert_eq!(cluster.pings("b"), 1);
    }

    #[test]
    fn test_ping_evicts_broken_idle_connection() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(&cluster, sequential("loadbalance://a,b"));
        let proxy = driver.connect().unwrap();

        proxy.execute(&select()).unwrap();
        proxy.commit().unwrap();
        proxy.execute(&select()).unwrap();
        cluster.set_up("a", false);

        // 유휴 연결만 끊어짐
        proxy.ping().unwrap();
        assert_eq!(proxy.live_connection_count(), 1);
        assert_eq!(proxy.blocklisted_hosts(), vec![addr("a")]);
    }

    #[test]
    fn test_validate_on_swap_skips_broken_cached_connection() {
        let cluster = MockCluster::new(&["a", "b"]);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b").with_validate_connection_on_swap(true),
        );
        let proxy = driver.connect().unwrap();

        proxy.execute(&select()).unwrap();
        proxy.commit().unwrap();
        proxy.execute(&select()).unwrap();
        proxy.commit().unwrap();

        // a의 캐시된 연결은 재사용 전 핑
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("a"));
        assert_eq!(cluster.pings("a"), 1);
        assert_eq!(cluster.opens("a"), 1);
    }

    #[test]
    fn test_close_and_abort() {
        let cluster = MockCluster::new(&["a"]);
        let driver = driver(&cluster, fast_config("loadbalance://a"));

        let proxy = driver.connect().unwrap();
        proxy.set_auto_commit(false).unwrap();
        proxy.execute(&insert()).unwrap();
        proxy.close().unwrap();
        assert_eq!(cluster.rollbacks("a"), 1);
        assert!(proxy.is_closed());
        assert!(matches!(proxy.execute(&select()), Err(DriverError::Closed)));
        assert!(proxy.close().is_ok());

        let proxy = driver.connect().unwrap();
        proxy.set_auto_commit(false).unwrap();
        proxy.execute(&insert()).unwrap();
        proxy.abort();
        assert_eq!(cluster.rollbacks("a"), 1);
        assert_eq!(proxy.live_connection_count(), 0);
        assert!(matches!(proxy.commit(), Err(DriverError::Closed)));
    }

    #[test]
    fn test_global_blocklist_is_shared() {
        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_up("a", false);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b")
                .with_global_blocklist(true)
                .with_blocklist_timeout(Duration::from_secs(60)),
        );

        let first = driver.connect().unwrap();
        first.execute(&select()).unwrap();
        assert!(driver.global_blocklist().contains(&addr("a")));

        cluster.set_up("a", true);
        let second = driver.connect().unwrap();
        assert_eq!(second.execute(&select()).unwrap().host, addr("b"));
        assert_eq!(cluster.opens("a"), 0);
    }

    #[test]
    fn test_all_down_terminates_with_short_blocklist_timeout() {
        let cluster = MockCluster::new(&["a", "b"]);
        for host in ["a", "b"] {
            cluster.set_up(host, false);
            cluster.set_open_delay(host, Duration::from_millis(30));
        }
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b").with_blocklist_timeout(Duration::from_millis(10)),
        );
        let proxy = driver.connect().unwrap();

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(proxy.execute(&select()));
        });

        let result = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("execute did not give up");
        assert!(matches!(result, Err(DriverError::NoUsableHost(_))));
        // 2 라운드, 라운드당 호스트별 1회
        assert_eq!(cluster.total_open_attempts(), 4);
    }

    #[test]
    fn test_global_blocklist_needs_timeout() {
        assert!(!sequential("loadbalance://a")
            .with_global_blocklist(true)
            .build()
            .global_blocklist_enabled());
        assert!(sequential("loadbalance://a")
            .with_global_blocklist(true)
            .with_blocklist_timeout(Duration::from_millis(5))
            .build()
            .global_blocklist_enabled());

        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_up("a", false);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b").with_global_blocklist(true),
        );
        let proxy = driver.connect().unwrap();

        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));
        assert_eq!(proxy.blocklisted_hosts(), vec![addr("a")]);
        assert!(driver.global_blocklist().is_empty());
    }

    #[test]
    fn test_global_blocklist_readmits_after_outage() {
        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_up("a", false);
        cluster.set_up("b", false);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b")
                .with_global_blocklist(true)
                .with_blocklist_timeout(Duration::from_millis(200)),
        );

        let first = driver.connect().unwrap();
        assert!(matches!(
            first.execute(&select()),
            Err(DriverError::NoUsableHost(_))
        ));
        assert_eq!(driver.global_blocklist().len(), 2);

        cluster.set_up("a", true);
        cluster.set_up("b", true);
        thread::sleep(Duration::from_millis(300));

        let second = driver.connect().unwrap();
        assert_eq!(second.execute(&select()).unwrap().host, addr("a"));
        assert!(driver.global_blocklist().is_empty());
    }

    #[test]
    fn test_blocklist_timeout_readmits_host() {
        let cluster = MockCluster::new(&["a", "b"]);
        cluster.set_up("a", false);
        let driver = driver(
            &cluster,
            sequential("loadbalance://a,b").with_blocklist_timeout(Duration::from_millis(20)),
        );
        let proxy = driver.connect().unwrap();

        proxy.execute(&select()).unwrap();
        assert_eq!(proxy.blocklisted_hosts(), vec![addr("a")]);

        thread::sleep(Duration::from_millis(40));
        assert!(proxy.blocklisted_hosts().is_empty());
    }

    #[test]
    fn test_group_remove_active_host_immediately() {
        let cluster = MockCluster::new(&["a", "b"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            sequential("loadbalance://a,b").with_load_balance_group("g"),
            &registry,
        );
        let proxy = driver.connect().unwrap();
        let group = registry.get("g").unwrap();

        proxy.set_auto_commit(false).unwrap();
        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("a"));

        group.remove_host(&addr("a"), true);
        let err = proxy.execute(&insert()).unwrap_err();
        assert!(matches!(err, DriverError::TransactionLost(_)));

        let executes_on_a = cluster.executes("a");
        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("b"));
        assert_eq!(cluster.executes("a"), executes_on_a);
        assert_eq!(proxy.hosts(), vec![addr("b")]);
    }

    #[test]
    fn test_group_remove_active_host_gracefully() {
        let cluster = MockCluster::new(&["a", "b"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            sequential("loadbalance://a,b").with_load_balance_group("g"),
            &registry,
        );
        let proxy = driver.connect().unwrap();
        let group = registry.get("g").unwrap();

        proxy.set_auto_commit(false).unwrap();
        proxy.execute(&insert()).unwrap();

        group.remove_host(&addr("a"), false);
        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("a"));
        proxy.commit().unwrap();

        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("b"));
    }

    #[test]
    fn test_group_grace_period_elapses() {
        let cluster = MockCluster::new(&["a", "b"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            sequential("loadbalance://a,b")
                .with_load_balance_group("g")
                .with_host_removal_grace_period(Duration::from_millis(20)),
            &registry,
        );
        let proxy = driver.connect().unwrap();

        proxy.set_auto_commit(false).unwrap();
        proxy.execute(&insert()).unwrap();
        registry.get("g").unwrap().remove_host(&addr("a"), false);
        proxy.execute(&insert()).unwrap();

        thread::sleep(Duration::from_millis(40));
        assert!(matches!(proxy.execute(&insert()), Err(DriverError::TransactionLost(_))));
        assert_eq!(proxy.execute(&insert()).unwrap().host, addr("b"));
    }

    #[test]
    fn test_group_added_host_affects_existing_proxies() {
        let cluster = MockCluster::new(&["a", "b", "c"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            sequential("loadbalance://a").with_load_balance_group("g"),
            &registry,
        );
        let proxy = driver.connect().unwrap();
        let group = registry.get("g").unwrap();

        group.add_host(addr("b"), HostRole::Source, false).unwrap();
        assert_eq!(proxy.hosts(), vec![addr("a")]);

        group.add_host(addr("c"), HostRole::Source, true).unwrap();
        assert_eq!(proxy.hosts(), vec![addr("a"), addr("c")]);

        // 이후 생성된 프록시는 모두 보임
        let later = driver.connect().unwrap();
        assert_eq!(later.hosts(), vec![addr("a"), addr("b"), addr("c")]);
    }

    #[test]
    fn test_inconsistent_group_fails_closed() {
        let cluster = MockCluster::new(&["a", "b"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            fast_config("loadbalance://a").with_load_balance_group("g"),
            &registry,
        );
        let proxy = driver.connect().unwrap();
        proxy.execute(&select()).unwrap();

        let group = registry.get("g").unwrap();
        group.remove_host(&addr("a"), true);
        let err = proxy.execute(&select()).unwrap_err();
        assert!(matches!(err, DriverError::InconsistentGroup { .. }));
        assert_eq!(err.code(), "MH001");
        assert!(matches!(driver.connect(), Err(DriverError::InconsistentGroup { .. })));

        group.add_host(addr("b"), HostRole::Source, true).unwrap();
        assert_eq!(proxy.execute(&select()).unwrap().host, addr("b"));
    }

    #[test]
    fn test_group_counts_follow_proxy_lifetime() {
        let cluster = MockCluster::new(&["a"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            fast_config("loadbalance://a").with_load_balance_group("g"),
            &registry,
        );

        let first = driver.connect().unwrap();
        let second = driver.connect().unwrap();
        first.execute(&select()).unwrap();
        let group = registry.get("g").unwrap();
        assert_eq!(group.active_connection_count(), 2);
        assert_eq!(group.active_physical_connection_count(), 1);

        first.close().unwrap();
        drop(second);
        assert_eq!(group.active_connection_count(), 0);
        assert_eq!(group.total_connection_count(), 2);
        assert_eq!(group.total_physical_connection_count(), 1);
    }

    #[test]
    fn test_concurrent_group_changes_do_not_deadlock() {
        let cluster = MockCluster::new(&["a", "b", "c"]);
        let registry = Arc::new(GroupRegistry::new());
        let driver = grouped_driver(
            &cluster,
            fast_config("loadbalance://a,b,c").with_load_balance_group("g"),
            &registry,
        );
        let proxy = Arc::new(driver.connect().unwrap());
        let group = registry.get("g").unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);

        let (tx, rx) = mpsc::channel();

        let worker_tx = tx.clone();
        let worker_proxy = proxy.clone();
        thread::spawn(move || {
            let mut ok = 0usize;
            while Instant::now() < deadline {
                match worker_proxy.execute(&Operation::new("SELECT 1")) {
                    Ok(_) => ok += 1,
                    Err(DriverError::NoUsableHost(_)) | Err(DriverError::InconsistentGroup { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                }
                assert_active_not_blocklisted(&worker_proxy);
            }
            let _ = worker_tx.send(("worker", ok));
        });

        let admin_group = group.clone();
        thread::spawn(move || {
            let mut changes = 0usize;
            while Instant::now() < deadline {
                admin_group.remove_host(&addr("c"), changes % 2 == 0);
                admin_group
                    .add_host(addr("c"), HostRole::Source, true)
                    .unwrap();
                admin_group.remove_host(&addr("b"), true);
                admin_group
                    .add_host(addr("b"), HostRole::Source, changes % 3 == 0)
                    .unwrap();
                changes += 1;
            }
            let _ = tx.send(("admin", changes));
        });

        let mut finished = Vec::new();
        for _ in 0..2 {
            let (who, count) = rx
                .recv_timeout(Duration::from_secs(10))
                .expect("thread did not finish in time");
            assert!(count > 0, "{} made no progress", who);
            finished.push(who);
        }
        assert_eq!(finished.len(), 2);
        assert_eq!(group.source_count(), 3);
    }
}
