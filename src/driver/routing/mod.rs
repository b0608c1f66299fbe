//! Routing Module
//!
//! 호스트 역할, 블록리스트, 부하 분산 전략, 공유 호스트 그룹
//!
//! # Example
//!
//! ```ignore
//! use multihost_driver::driver::routing::{GroupRegistry, HostRole};
//! use multihost_driver::driver::ServerAddress;
//!
//! let registry = GroupRegistry::new();
//! let group = registry.group("orders");
//!
//! group.add_host(ServerAddress::new("db3", 3306), HostRole::Replica, true)?;
//! group.promote(&ServerAddress::new("db3", 3306));
//! assert_eq!(group.promotion_count(), 1);
//! ```

mod blocklist;
mod group;
mod policy;
mod table;

pub use blocklist::{Blocklist, BlocklistEntry, BlocklistView};
pub(crate) use group::GroupMember;
pub use group::{GroupEvent, GroupRegistry, HostGroup, PromotionRecord};
pub use policy::{
    BalancePolicy, BalanceStrategy, BestResponseTimeStrategy, RandomStrategy, SelectionContext,
    SequentialStrategy, ServerAffinityStrategy,
};
pub use table::{HostRole, HostSets};
