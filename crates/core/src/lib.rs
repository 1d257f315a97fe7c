//! Domain layer shared by the storage and HTTP crates.
//!
//! Holds the job/application aggregates, the authorization guard and the
//! application lifecycle rules. Nothing in here performs I/O.
pub mod guard;
pub mod lifecycle;
pub mod types;
