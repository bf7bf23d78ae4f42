pub mod common;
pub mod delete;
pub mod put;
pub mod queue;
pub mod sync;
