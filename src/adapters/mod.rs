//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  KeyspaceClient │ QueueHandle │ QueueFactory │ GaugeSink   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ BullQueue │ BullQueueFactory          (Redis)              │ │
//! │  │ InMemoryKeyspace │ InMemoryQueue │ InMemoryQueueFactory    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `StoreConnection` in [`crate::connection`] implements `KeyspaceClient`
//! against Redis; `QueueGauges` in [`crate::metrics`] implements `GaugeSink`.

mod bull;
mod memory;

pub use bull::{completed_job_id, parse_job_hash, BullQueue, BullQueueFactory};
pub use memory::{InMemoryKeyspace, InMemoryQueue, InMemoryQueueFactory};
