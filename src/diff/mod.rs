//! Structural differ.
//!
//! # Data Flow
//! ```text
//! (old = cached stage state, new = desired stage state)
//!     → per resource kind: index old by ID, walk new
//!     → put set (new or changed), delete set (unseen old entries)
//! ```
//!
//! # Design Decisions
//! - Description, labels and timestamps are operational metadata, not compared
//! - Stage affiliation is compared even though the label map is not
//! - Comparison runs on the JSON form of a resource, so container and number
//!   representation differences between decoders never produce a put

mod differ;

pub use differ::{diff, resources_equivalent, ConfigDiff};
