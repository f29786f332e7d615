//! Shared test utilities.
//!
//! [`MockRuntime`] is a deterministic, instrumented stand-in for the model
//! runtime: it models KV memory as per-sequence position maps, samples
//! tokens as a pure function of the decoded batch row, and records every
//! call so tests can assert on decode/encode counts and KV traffic.

mod mock_runtime;

pub use mock_runtime::MockRuntime;
