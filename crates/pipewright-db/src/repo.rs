//! Repository traits and implementations.

pub mod job;
pub mod step;
pub mod yml;

pub use job::{JobRepo, MemJobRepo};
pub use step::{MemStepRepo, StepRepo};
pub use yml::{MemYmlRepo, YmlRepo};
