//! Backend connections
//!
//! One shared connection for basic commands, dedicated connections for
//! subscriptions and blocking commands.

mod manager;

pub use manager::{ConnectionKind, ConnectionManager, StoreConnection, TlsPolicy};
