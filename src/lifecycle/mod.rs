//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → cache watch loops, flush loop, desired-state feed, admin server
//!     → final flush → exit
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; every long-running task holds a receiver
//! - Pending desired state is flushed once more before exit

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
