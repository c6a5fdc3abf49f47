//! CPU backend for aotflow.
//!
//! Wraps the graph interpreter as a `Backend`. Always available; the
//! baseline every other backend is compared against.

#![forbid(unsafe_code)]

mod executor;

pub use executor::{CpuBackend, CpuExecutable};
