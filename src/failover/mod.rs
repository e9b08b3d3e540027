//! Failover Orchestration
//!
//! The façade intercepts every operation, the listener owns the handles and
//! the election state, and the search loop re-elects hosts after a
//! connection-class error. Failed hosts are remembered in a blacklist shared
//! by all connections of a driver.

mod blacklist;
mod filter;
mod listener;
mod proxy;
mod search;

pub use blacklist::{Blacklist, BlacklistEntry};
pub use filter::SearchFilter;
pub use listener::{HandleErrorResult, Listener, ListenerState, ListenerStatus};
pub use proxy::{FailoverConnection, Operation, Reply};
pub use search::{search, Outcome, SearchContext};
