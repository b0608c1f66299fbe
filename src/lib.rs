//! # Multi-host Driver
//!
//! Client-side resiliency layer for a database driver. Application code holds
//! one logical connection while the driver manages physical connections to
//! several hosts, routes each operation to the active one, and survives host
//! failures and topology changes.
//!
//! ## Features
//!
//! - **Load balancing** - Random, sequential, best-response-time and server-affinity strategies
//! - **Failover** - Time-boxed blocklists with bounded retries
//! - **Safe swaps** - The active host only changes at transaction boundaries
//! - **Replication** - Source/replica routing driven by read-only mode
//! - **Host groups** - Named registries shared by connections and operators
//!
//! The wire protocol is not part of this crate. A [`Connector`] supplied by
//! the caller opens [`PhysicalConnection`]s to individual hosts.
//!
//! ## Basic Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use multihost_driver::{AuthToken, Driver, GroupRegistry, Operation};
//!
//! let driver = Driver::new(
//!     "loadbalance://db1:3306,db2:3306?loadBalanceStrategy=sequential",
//!     AuthToken::basic("app", "secret"),
//!     connector,
//!     Arc::new(GroupRegistry::new()),
//! )?;
//!
//! let conn = driver.connect()?;
//! let outcome = conn.execute(&Operation::new("SELECT 1"))?;
//! println!("served by {}", outcome.host);
//! conn.close()?;
//! ```
//!
//! ## Group Management
//!
//! ```rust,ignore
//! let manager = driver.manager();
//! manager.add_host(Some("orders"), "db3:3306", HostRole::Replica, true)?;
//! manager.promote_to_source(Some("orders"), "db3:3306")?;
//! for stats in manager.stats(None)? {
//!     println!("{}: {} promotions", stats.name, stats.promotion_count);
//! }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`DriverResult`]. [`DriverError::code`] gives a
//! SQLSTATE-style code for every error.
//!
//! ```rust,ignore
//! match conn.execute(&Operation::write("UPDATE t SET x = 1")) {
//!     Ok(_) => {}
//!     Err(DriverError::TransactionLost(msg)) => eprintln!("retry the transaction: {}", msg),
//!     Err(e) => eprintln!("{} ({})", e, e.code()),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`driver`] - Driver, logical connections, group management
//! - [`driver::routing`] - Host roles, blocklists, strategies and groups

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod driver;

// Re-exports for convenience
pub use driver::{
    AuthToken, ConnectContext, ConnectionMode, ConnectionProxy, Connector, Driver, DriverConfig,
    DriverConfigBuilder, DriverError, DriverResult, GroupManager, GroupStats, HostProber,
    Operation, OperationKind, Outcome, PhysicalConnection, ReplicationConnection, ServerAddress,
};

pub use driver::routing::{BalancePolicy, Blocklist, GroupRegistry, HostGroup, HostRole, HostSets};

/// Config alias for convenience
pub type Config = DriverConfig;
