//! Driver
//!
//! 호스트 주소, 드라이버 설정, 논리 연결 팩토리

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::error::{DriverError, DriverResult};
use super::health::HostProber;
use super::management::GroupManager;
use super::physical::{ConnectContext, Connector};
use super::proxy::{ConnectionProxy, HostScope, ProxyEnv};
use super::replication::ReplicationConnection;
use super::routing::{BalancePolicy, Blocklist, GroupRegistry, HostSets};

/// 기본 서버 포트
pub const DEFAULT_PORT: u16 = 3306;

// ============================================================================
// AuthToken - 인증 토큰
// ============================================================================

/// 커넥터에 전달되는 인증 토큰
#[derive(Clone, Default)]
pub enum AuthToken {
    /// 인증 없음
    #[default]
    None,
    /// 사용자 이름/비밀번호
    Basic { username: String, password: String },
}

impl AuthToken {
    /// 기본 인증
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// 인증 없음
    pub fn none() -> Self {
        Self::None
    }

    /// 인증 스킴
    pub fn scheme(&self) -> &str {
        match self {
            Self::None => "none",
            Self::Basic { .. } => "basic",
        }
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"***")
                .finish(),
        }
    }
}

// ============================================================================
// ServerAddress - 서버 주소
// ============================================================================

/// 호스트 식별자 `(hostname, port)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ServerAddress {
    /// 호스트 이름
    pub host: String,
    /// 포트
    pub port: u16,
}

impl ServerAddress {
    /// 새 서버 주소 생성
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host[:port]` 파싱
    pub fn parse(addr: &str) -> DriverResult<Self> {
        let addr = addr.trim();
        let parts: Vec<&str> = addr.split(':').collect();
        match parts.as_slice() {
            [host] if !host.is_empty() => Ok(Self::new(*host, DEFAULT_PORT)),
            [host, port] if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| DriverError::configuration(format!("Invalid port in '{}'", addr)))?;
                Ok(Self::new(*host, port))
            }
            _ => Err(DriverError::configuration(format!(
                "Invalid server address '{}'",
                addr
            ))),
        }
    }

    /// 소켓 주소 문자열
    pub fn to_socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_PORT)
    }
}

/// 쉼표로 구분된 호스트 목록 파싱
pub fn parse_host_list(list: &str) -> DriverResult<Vec<ServerAddress>> {
    let mut hosts = Vec::new();
    for part in list.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        let addr = ServerAddress::parse(part)?;
        if !hosts.contains(&addr) {
            hosts.push(addr);
        }
    }
    Ok(hosts)
}

// ============================================================================
// DriverConfig - 드라이버 설정
// ============================================================================

/// URL 스킴에 따른 연결 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// `loadbalance://` - 모든 호스트가 소스
    #[default]
    LoadBalance,
    /// `replication://` - 첫 호스트가 소스, 나머지는 레플리카
    Replication,
}

/// 드라이버 설정
///
/// | 속성 | 필드 | 기본값 |
/// |------|------|--------|
/// | `retriesAllDown` | `retries_all_down` | 120 |
/// | `loadBalanceBlocklistTimeout` (ms) | `blocklist_timeout` | 0 (해제 전까지 유지) |
/// | `loadBalanceHostRemovalGracePeriod` (ms) | `host_removal_grace_period` | 15000 |
/// | `allowSourceDownConnections` | `allow_source_down_connections` | false |
/// | `allowReplicaDownConnections` | `allow_replica_down_connections` | false |
/// | `readFromSourceWhenNoReplicas` | `read_from_source_when_no_replicas` | false |
/// | `loadBalanceAutoCommitStatementThreshold` | `auto_commit_statement_threshold` | 0 (비활성) |
/// | `loadBalanceAutoCommitStatementRegex` | `auto_commit_statement_regex` | 없음 |
/// | `loadBalanceStrategy` | `balance_policy` | random |
/// | `serverAffinityOrder` | `server_affinity_order` | 없음 |
/// | `loadBalanceConnectionGroup` | `load_balance_group` | 없음 |
/// | `replicationConnectionGroup` | `replication_group` | 없음 |
/// | `loadBalanceValidateConnectionOnSwapServer` | `validate_connection_on_swap` | false |
/// | `loadBalanceUseGlobalBlocklist` | `use_global_blocklist` | false |
/// | `connectTimeout` (ms) | `connect_timeout` | 0 |
/// | `retryBackoff` (ms) | `retry_backoff` | 250 |
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// 연결 모드
    pub mode: ConnectionMode,
    /// 소스 호스트
    pub sources: Vec<ServerAddress>,
    /// 레플리카 호스트
    pub replicas: Vec<ServerAddress>,
    /// 기본 데이터베이스
    pub database: Option<String>,
    /// 인증 정보
    pub auth: AuthToken,
    /// 연결 타임아웃
    pub connect_timeout: Duration,
    /// 전체 장애 시 재시도 라운드 수
    pub retries_all_down: usize,
    /// 블록리스트 TTL (0이면 해제 전까지 유지)
    pub blocklist_timeout: Duration,
    /// 제거된 호스트가 진행 중인 트랜잭션을 계속 처리할 수 있는 유예 시간
    pub host_removal_grace_period: Duration,
    /// 소스 장애 시에도 연결 허용
    pub allow_source_down_connections: bool,
    /// 레플리카 장애 시에도 연결 허용
    pub allow_replica_down_connections: bool,
    /// 레플리카가 없으면 소스에서 읽기
    pub read_from_source_when_no_replicas: bool,
    /// 자동 커밋 구문 N개마다 재분배 (0이면 비활성)
    pub auto_commit_statement_threshold: usize,
    /// 임계값에 포함할 구문 패턴
    pub auto_commit_statement_regex: Option<Regex>,
    /// 부하 분산 전략
    pub balance_policy: BalancePolicy,
    /// 서버 선호도 순서
    pub server_affinity_order: Vec<ServerAddress>,
    /// 로드밸런스 그룹 이름
    pub load_balance_group: Option<String>,
    /// 복제 그룹 이름
    pub replication_group: Option<String>,
    /// 전환 전 캐시된 연결 검증
    pub validate_connection_on_swap: bool,
    /// 드라이버 전체 연결이 블록리스트 공유
    /// (`blocklist_timeout`이 0이 아니어야 함)
    pub use_global_blocklist: bool,
    /// 전체 장애 라운드 사이 대기 시간
    pub retry_backoff: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            mode: ConnectionMode::LoadBalance,
            sources: Vec::new(),
            replicas: Vec::new(),
            database: None,
            auth: AuthToken::default(),
            connect_timeout: Duration::ZERO,
            retries_all_down: 120,
            blocklist_timeout: Duration::ZERO,
            host_removal_grace_period: Duration::from_millis(15_000),
            allow_source_down_connections: false,
            allow_replica_down_connections: false,
            read_from_source_when_no_replicas: false,
            auto_commit_statement_threshold: 0,
            auto_commit_statement_regex: None,
            balance_policy: BalancePolicy::default(),
            server_affinity_order: Vec::new(),
            load_balance_group: None,
            replication_group: None,
            validate_connection_on_swap: false,
            use_global_blocklist: false,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

impl DriverConfig {
    /// 전역 블록리스트 사용 여부
    ///
    /// `blocklist_timeout`이 0이면 비활성. 만료되지 않는 항목이 공유되면
    /// 한 번의 장애 후 복구된 호스트도 이후 모든 연결에서 제외됩니다.
    pub fn global_blocklist_enabled(&self) -> bool {
        self.use_global_blocklist && !self.blocklist_timeout.is_zero()
    }

    /// `loadbalance://` 또는 `replication://` URL 파싱
    ///
    /// 형식: `scheme://host[:port][,host[:port]...][/database][?key=value&...]`
    pub fn new(url: &str, auth: AuthToken) -> DriverResult<Self> {
        let (mode, rest) = if let Some(rest) = url.strip_prefix("loadbalance://") {
            (ConnectionMode::LoadBalance, rest)
        } else if let Some(rest) = url.strip_prefix("replication://") {
            (ConnectionMode::Replication, rest)
        } else {
            return Err(DriverError::configuration(format!(
                "Unsupported URL scheme in '{}'",
                url
            )));
        };

        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (host_part, database) = match rest.split_once('/') {
            Some((hosts, db)) if !db.is_empty() => (hosts, Some(db.to_string())),
            Some((hosts, _)) => (hosts, None),
            None => (rest, None),
        };

        let hosts = parse_host_list(host_part)?;
        if hosts.is_empty() {
            return Err(DriverError::configuration("No hosts specified"));
        }

        let (sources, replicas) = match mode {
            ConnectionMode::LoadBalance => (hosts, Vec::new()),
            ConnectionMode::Replication => {
                let mut hosts = hosts.into_iter();
                (hosts.next().into_iter().collect(), hosts.collect())
            }
        };

        let mut config = Self {
            mode,
            sources,
            replicas,
            database,
            auth,
            ..Self::default()
        };

        if let Some(query) = query {
            let props: HashMap<String, String> = query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), "true".to_string()),
                })
                .collect();
            config.apply_properties(&props)?;
        }

        Ok(config)
    }

    /// URL로 빌더 생성
    pub fn builder(url: &str, auth: AuthToken) -> DriverResult<DriverConfigBuilder> {
        let config = Self::new(url, auth)?;
        Ok(DriverConfigBuilder { config })
    }

    /// 호스트 목록과 속성 맵으로 설정 생성
    pub fn from_properties(
        mode: ConnectionMode,
        sources: Vec<ServerAddress>,
        replicas: Vec<ServerAddress>,
        props: &HashMap<String, String>,
    ) -> DriverResult<Self> {
        let mut config = Self {
            mode,
            sources,
            replicas,
            ..Self::default()
        };
        config.apply_properties(props)?;
        Ok(config)
    }

    /// 속성 적용 (알 수 없는 키는 무시)
    pub fn apply_properties(&mut self, props: &HashMap<String, String>) -> DriverResult<()> {
        for (key, value) in props {
            match key.as_str() {
                "retriesAllDown" => self.retries_all_down = parse_number(key, value)?,
                "loadBalanceBlocklistTimeout" => self.blocklist_timeout = parse_millis(key, value)?,
                "loadBalanceHostRemovalGracePeriod" => {
                    self.host_removal_grace_period = parse_millis(key, value)?
                }
                "allowSourceDownConnections" => {
                    self.allow_source_down_connections = parse_bool(key, value)?
                }
                "allowReplicaDownConnections" => {
                    self.allow_replica_down_connections = parse_bool(key, value)?
                }
                "readFromSourceWhenNoReplicas" => {
                    self.read_from_source_when_no_replicas = parse_bool(key, value)?
                }
                "loadBalanceAutoCommitStatementThreshold" => {
                    self.auto_commit_statement_threshold = parse_number(key, value)?
                }
                "loadBalanceAutoCommitStatementRegex" => {
                    self.auto_commit_statement_regex = if value.is_empty() {
                        None
                    } else {
                        Some(Regex::new(value).map_err(|e| {
                            DriverError::configuration(format!("Invalid {}: {}", key, e))
                        })?)
                    };
                }
                "loadBalanceStrategy" => {
                    self.balance_policy = BalancePolicy::from_str(value).ok_or_else(|| {
                        DriverError::configuration(format!("Unknown balance strategy '{}'", value))
                    })?
                }
                "serverAffinityOrder" => self.server_affinity_order = parse_host_list(value)?,
                "loadBalanceConnectionGroup" => self.load_balance_group = non_empty(value),
                "replicationConnectionGroup" => self.replication_group = non_empty(value),
                "loadBalanceValidateConnectionOnSwapServer" => {
                    self.validate_connection_on_swap = parse_bool(key, value)?
                }
                "loadBalanceUseGlobalBlocklist" => self.use_global_blocklist = parse_bool(key, value)?,
                "connectTimeout" => self.connect_timeout = parse_millis(key, value)?,
                "retryBackoff" => self.retry_backoff = parse_millis(key, value)?,
                "user" => {
                    let password = match &self.auth {
                        AuthToken::Basic { password, .. } => password.clone(),
                        AuthToken::None => String::new(),
                    };
                    self.auth = AuthToken::basic(value.clone(), password);
                }
                "password" => {
                    let username = match &self.auth {
                        AuthToken::Basic { username, .. } => username.clone(),
                        AuthToken::None => String::new(),
                    };
                    self.auth = AuthToken::basic(username, value.clone());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 초기 호스트 집합
    pub fn host_sets(&self) -> HostSets {
        HostSets::new(self.sources.clone(), self.replicas.clone())
    }

    /// 커넥터 파라미터
    pub fn connect_context(&self) -> ConnectContext {
        ConnectContext {
            auth: self.auth.clone(),
            database: self.database.clone(),
            connect_timeout: self.connect_timeout,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(key: &str, value: &str) -> DriverResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(DriverError::configuration(format!(
            "Invalid boolean for {}: '{}'",
            key, value
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> DriverResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| DriverError::configuration(format!("Invalid number for {}: '{}'", key, value)))
}

fn parse_millis(key: &str, value: &str) -> DriverResult<Duration> {
    parse_number(key, value).map(|ms| Duration::from_millis(ms as u64))
}

// ============================================================================
// DriverConfigBuilder - 설정 빌더
// ============================================================================

/// 드라이버 설정 빌더
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// 전체 장애 재시도 횟수 설정
    pub fn with_retries_all_down(mut self, retries: usize) -> Self {
        self.config.retries_all_down = retries;
        self
    }

    /// 블록리스트 TTL 설정
    pub fn with_blocklist_timeout(mut self, timeout: Duration) -> Self {
        self.config.blocklist_timeout = timeout;
        self
    }

    /// 호스트 제거 유예 시간 설정
    pub fn with_host_removal_grace_period(mut self, period: Duration) -> Self {
        self.config.host_removal_grace_period = period;
        self
    }

    /// 소스 장애 허용
    pub fn with_allow_source_down_connections(mut self, allow: bool) -> Self {
        self.config.allow_source_down_connections = allow;
        self
    }

    /// 레플리카 장애 허용
    pub fn with_allow_replica_down_connections(mut self, allow: bool) -> Self {
        self.config.allow_replica_down_connections = allow;
        self
    }

    /// 레플리카 없을 때 소스 읽기 허용
    pub fn with_read_from_source_when_no_replicas(mut self, allow: bool) -> Self {
        self.config.read_from_source_when_no_replicas = allow;
        self
    }

    /// 자동 커밋 재분배 임계값 설정
    pub fn with_auto_commit_statement_threshold(mut self, threshold: usize) -> Self {
        self.config.auto_commit_statement_threshold = threshold;
        self
    }

    /// 임계값 구문 패턴 설정
    pub fn with_auto_commit_statement_regex(mut self, regex: Regex) -> Self {
        self.config.auto_commit_statement_regex = Some(regex);
        self
    }

    /// 부하 분산 전략 설정
    pub fn with_balance_policy(mut self, policy: BalancePolicy) -> Self {
        self.config.balance_policy = policy;
        self
    }

    /// 서버 선호도 순서 설정
    pub fn with_server_affinity_order(mut self, order: Vec<ServerAddress>) -> Self {
        self.config.server_affinity_order = order;
        self
    }

    /// 로드밸런스 그룹 설정
    pub fn with_load_balance_group(mut self, group: impl Into<String>) -> Self {
        self.config.load_balance_group = Some(group.into());
        self
    }

    /// 복제 그룹 설정
    pub fn with_replication_group(mut self, group: impl Into<String>) -> Self {
        self.config.replication_group = Some(group.into());
        self
    }

    /// 전환 시 연결 검증 설정
    pub fn with_validate_connection_on_swap(mut self, validate: bool) -> Self {
        self.config.validate_connection_on_swap = validate;
        self
    }

    /// 전역 블록리스트 설정
    pub fn with_global_blocklist(mut self, enabled: bool) -> Self {
        self.config.use_global_blocklist = enabled;
        self
    }

    /// 연결 타임아웃 설정
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// 라운드 간 대기 시간 설정
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    /// 설정 빌드
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// ============================================================================
// Driver - 드라이버
// ============================================================================

/// 논리 연결 팩토리
///
/// 같은 드라이버로 생성한 연결은 전역 블록리스트(활성화 시)와
/// 주입된 [`GroupRegistry`]를 공유합니다.
pub struct Driver {
    config: Arc<DriverConfig>,
    connector: Arc<dyn Connector>,
    registry: Arc<GroupRegistry>,
    global_blocklist: Arc<Blocklist>,
    open: RwLock<bool>,
}

impl Driver {
    /// URL로 드라이버 생성
    pub fn new(
        url: &str,
        auth: AuthToken,
        connector: Arc<dyn Connector>,
        registry: Arc<GroupRegistry>,
    ) -> DriverResult<Self> {
        let config = DriverConfig::new(url, auth)?;
        Self::with_config(config, connector, registry)
    }

    /// 설정으로 드라이버 생성
    pub fn with_config(
        config: DriverConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<GroupRegistry>,
    ) -> DriverResult<Self> {
        if config.sources.is_empty() && config.replicas.is_empty() {
            return Err(DriverError::configuration("At least one host is required"));
        }

        Ok(Self {
            config: Arc::new(config),
            connector,
            registry,
            global_blocklist: Arc::new(Blocklist::new()),
            open: RwLock::new(true),
        })
    }

    /// 로드밸런스 연결 생성
    ///
    /// 첫 작업 전까지 물리 연결을 만들지 않습니다.
    pub fn connect(&self) -> DriverResult<ConnectionProxy> {
        self.ensure_open()?;
        let group = self
            .config
            .load_balance_group
            .as_deref()
            .map(|name| self.registry.group(name));

        debug!(group = ?self.config.load_balance_group, "opening load-balanced connection");
        ConnectionProxy::new(self.env(), &self.config.host_sets(), HostScope::All, group, true)
    }

    /// 복제 연결 생성
    pub fn connect_replication(&self) -> DriverResult<ReplicationConnection> {
        self.ensure_open()?;
        let group = self
            .config
            .replication_group
            .as_deref()
            .map(|name| self.registry.group(name));

        debug!(group = ?self.config.replication_group, "opening replication connection");
        ReplicationConnection::new(self.env(), &self.config.host_sets(), group)
    }

    /// 전역 블록리스트 백그라운드 검사 시작
    pub fn start_prober(&self, interval: Duration) -> HostProber {
        HostProber::start(
            self.global_blocklist.clone(),
            self.connector.clone(),
            self.config.connect_context(),
            interval,
        )
    }

    /// 드라이버 설정
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// 그룹 레지스트리
    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    /// 전역 블록리스트
    pub fn global_blocklist(&self) -> &Arc<Blocklist> {
        &self.global_blocklist
    }

    /// 그룹 관리 뷰
    pub fn manager(&self) -> GroupManager {
        GroupManager::new(self.registry.clone()).with_global_blocklist(self.global_blocklist.clone())
    }

    /// 드라이버 닫기 (기존 연결은 유지)
    pub fn close(&self) {
        *self.open.write() = false;
    }

    /// 열림 여부
    pub fn is_open(&self) -> bool {
        *self.open.read()
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }

    fn env(&self) -> ProxyEnv {
        ProxyEnv {
            config: self.config.clone(),
            connector: self.connector.clone(),
            global_blocklist: self
                .config
                .global_blocklist_enabled()
                .then(|| self.global_blocklist.clone()),
        }
    }
}

impl fmt::Debug for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("mode", &self.config.mode)
            .field("sources", &self.config.sources)
            .field("replicas", &self.config.replicas)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
