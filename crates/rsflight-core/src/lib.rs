//! rsflight-core: In-process deduplication of concurrent keyed work
//!
//! This crate contains the coordination primitives:
//! - Batching leader-election lock
//! - Call coalescing with forget and shared-result reporting
//! - Call coalescing built on the batching lock
//! - Shared resource sessions (create once, handle per caller, dispose once)
//! - Configuration management
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │               rsflight-core                  │
//! ├─────────────────────────────────────────────┤
//! │  batch_lock.rs - Leader election per batch  │
//! │  group/        - CallGroup, Shared          │
//! │  batched.rs    - CallGroup over BatchLock   │
//! │  session.rs    - ResourceSession            │
//! │  config.rs     - Configuration management   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Every group is an ordinary value; independent groups never share state.
//!
//! # Abnormal termination
//!
//! Work that panics is re-raised in every caller waiting on it, with a
//! [`PanicError`] payload. Work whose driving future is dropped before it
//! finishes completes silently: waiters get `Ok(None)`.

pub mod batch_lock;
pub mod batched;
pub mod config;
pub mod error;
pub mod group;
pub mod session;

mod outcome;
mod wait;

// Re-exports for convenience
pub use batch_lock::{BatchLock, Leader, Role};
pub use batched::BatchedCallGroup;
pub use config::{CoalesceConfig, ConfigLoadError, GroupConfig, LoggingSettings};
pub use error::PanicError;
pub use group::{CallGroup, Pending, Response, Shared};
pub use session::ResourceSession;
