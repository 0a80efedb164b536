//! xtool Core - table model and the chunk algorithms
//!
//! This crate holds everything about running an external tool that does not
//! touch a process or a file: the keyed table model, the chunk planner,
//! schema unification across chunk outputs, concatenation and the
//! order-preserving input/output join.

pub mod concat;
pub mod error;
pub mod join;
pub mod planner;
pub mod schema;
pub mod table;

pub use concat::concat_tables;
pub use error::CoreError;
pub use join::{join_spec, join_tables, JoinOptions};
pub use planner::{ChunkPlan, ChunkPolicy};
pub use schema::{common_supertype, unify_schemas};
pub use table::{RowIdUnifier, Table};

// Re-export for downstream consumers
pub use arrow;
