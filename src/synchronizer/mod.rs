//! Buffering synchronizer.
//!
//! # Data Flow
//! ```text
//! producer → sync(gateway, stage, config) → active StageBuffer
//! flush interval / admin trigger
//!     → swap active slot (writers move to the other buffer)
//!     → drain retired buffer → store.alter(changed, retry callback)
//!     → store.alter(virtual stage)
//! failed stage → retry callback → resync → active buffer, unless newer state is pending
//! ```
//!
//! # Design Decisions
//! - Two buffers behind one small index lock; the store write sits behind a separate flush lock
//! - Flushes are serialized against each other, never against `sync`
//! - Stale-stage removal takes the flush lock so it cannot race a flush

mod buffer;
mod engine;
mod virtual_stage;

pub use buffer::{DoubleBuffer, StageBuffer};
pub use engine::ApisixConfigSynchronizer;
pub use virtual_stage::VirtualStage;
