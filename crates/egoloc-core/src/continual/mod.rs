//! Continual-learning bookkeeping that does not touch tensors.
//!
//! - [`tasks`]: the class-group manifest, task order and the check that a
//!   batch only references classes introduced so far
//! - [`replay`]: the exemplar buffer mixed into later tasks' batches
//!
//! The importance-weighted penalty itself lives in `egoloc-model`.

pub mod replay;
pub mod tasks;

pub use replay::{Exemplar, ReplayMemory};
pub use tasks::{ContinualTask, TaskManifest, TaskSchedule};
