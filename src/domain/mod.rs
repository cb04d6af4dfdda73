//! Domain Layer
//!
//! Value objects and port traits shared by the collector and its adapters.
//!
//! # Usage
//!
//! ```ignore
//! use bull_exporter::domain::ports::{GaugeSink, QueueHandle};
//!
//! async fn refresh(sink: &dyn GaugeSink, queue: &dyn QueueHandle) -> Result<()> {
//!     sink.update_stats(queue.prefix(), queue.name(), queue).await?;
//!     Ok(())
//! }
//! ```

pub mod ports;

pub use ports::{
    // Value objects
    CompletionListener,
    CompletionStats,
    JobCounts,
    JobRecord,
    KeyScan,
    SubscriptionToken,
    // Port traits
    GaugeSink,
    KeyspaceClient,
    QueueFactory,
    QueueHandle,
};
