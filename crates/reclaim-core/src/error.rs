//! Error taxonomy for the engine's few fallible operations: a small
//! `thiserror` derive, one variant per recoverable condition. Fatal
//! conditions (a broken host: mutex poisoning, thread-spawn failure, a
//! rejected affinity call) are deliberately not variants here — they log at
//! `error!` and call `std::process::abort`, since there is no sensible
//! recovery from within a reclamation engine.
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The requested CPU index is out of the array's configured range.
    #[error("cpu index out of range")]
    Invalid,
    /// The per-CPU array could not be grown to cover the requested index.
    ///
    /// Kept for parity with the original's error taxonomy; Rust's global
    /// allocator aborts the process on allocation failure rather than
    /// returning an error, so in practice this variant is unreachable on a
    /// healthy host.
    #[error("per-cpu array unavailable")]
    NoMemory,
    /// The per-CPU slot already has a worker assigned.
    #[error("cpu slot already assigned")]
    Exists,
}
