//! Driver Module
//!
//! 다중 호스트 연결 계층 (논리 연결 하나가 여러 호스트의 물리 연결을 관리)
//!
//! # Components
//!
//! - [`Driver`], [`DriverConfig`], [`AuthToken`]: URL 파싱 및 연결 생성
//! - [`ConnectionProxy`]: 부하 분산 논리 연결 (장애 조치 포함)
//! - [`ReplicationConnection`]: 읽기 전용 모드에 따른 소스/레플리카 라우팅
//! - [`routing`]: 호스트 역할, 블록리스트, 부하 분산 전략, 호스트 그룹
//! - [`GroupManager`]: 호스트 그룹 관리
//! - [`HostProber`]: 블록리스트 호스트 백그라운드 복구
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use multihost_driver::driver::{AuthToken, Driver, Operation};
//! use multihost_driver::driver::routing::GroupRegistry;
//!
//! let driver = Driver::new(
//!     "loadbalance://db1:3306,db2:3306?loadBalanceConnectionGroup=orders",
//!     AuthToken::basic("app", "secret"),
//!     connector,
//!     Arc::new(GroupRegistry::new()),
//! )?;
//!
//! let conn = driver.connect()?;
//! conn.set_auto_commit(false)?;
//! conn.execute(&Operation::new("UPDATE stock SET qty = qty - 1 WHERE id = 7"))?;
//! conn.commit()?;
//!
//! // 그룹의 모든 연결에서 db2 제외
//! driver.manager().remove_host(Some("orders"), "db2:3306", true)?;
//! ```
//!
//! # Replication Example
//!
//! ```ignore
//! let driver = Driver::new(
//!     "replication://source:3306,replica1:3306,replica2:3306?allowReplicaDownConnections=true",
//!     AuthToken::basic("app", "secret"),
//!     connector,
//!     registry,
//! )?;
//!
//! let conn = driver.connect_replication()?;
//! conn.set_read_only(true)?;
//! let outcome = conn.execute(&Operation::read("SELECT * FROM orders"))?;
//! assert!(conn.is_host_replica(&outcome.host));
//! ```

pub mod routing;
mod driver;
mod error;
mod health;
mod management;
mod physical;
mod pool;
mod proxy;
mod replication;
#[cfg(test)]
mod testing;

// Re-exports
pub use driver::{
    parse_host_list, AuthToken, ConnectionMode, Driver, DriverConfig, DriverConfigBuilder,
    ServerAddress, DEFAULT_PORT,
};
pub use error::{DriverError, DriverResult};
pub use health::{probe_once, HostProber};
pub use management::{GroupManager, GroupStats};
pub use physical::{ConnectContext, Connector, Operation, OperationKind, Outcome, PhysicalConnection};
pub use pool::{ConnectionState, PhysicalCounters, PoolMetrics, PooledConnection};
pub use proxy::{ConnectionProxy, HostScope, ProxyEnv, ProxyState};
pub use replication::ReplicationConnection;
