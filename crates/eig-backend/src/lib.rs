//! Accelerator backend abstraction for the edge inference gateway.
//!
//! The gateway never talks to a device API directly. Everything it needs
//! from an accelerator runtime — engine deserialization, execution
//! contexts, command queues, device memory, async copies — goes through
//! the [`backend::AcceleratorBackend`] trait, and every acquired resource
//! is held by an RAII guard so teardown order is enforced on all exit
//! paths, panics included.
//!
//! [`runner::Runner`] bundles one loaded engine with its shared device
//! buffers and a bounded pool of execution contexts, and exposes the
//! blocking `infer` entry point the connection layer calls.

pub mod backend;
pub mod error;
pub mod runner;
pub mod stub;

pub use backend::{AcceleratorBackend, ContextHandle, DeviceBuffer, EngineHandle, QueueHandle};
pub use error::{BackendError, InferError, LoadError};
pub use runner::Runner;
pub use stub::{StubBackend, StubEngineSpec};
