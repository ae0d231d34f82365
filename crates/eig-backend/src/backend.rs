//! The accelerator runtime contract and scoped resource guards.
//!
//! # Handle model
//!
//! Runtimes hand out opaque `u64`-backed handles for engines, execution
//! contexts, command queues, and device buffers. Handles are plain
//! copyable ids; ownership lives in the guards below, which release the
//! underlying resource exactly once on drop. Release entry points take
//! no `Result` — a runtime that fails to free logs and moves on, the
//! same way device `free` calls are treated everywhere else.

use std::sync::Arc;

use eig_core::types::BindingDesc;

use crate::error::BackendError;

macro_rules! opaque_handle {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u64);
    };
}

opaque_handle!(
    /// A deserialized engine resident on the accelerator.
    EngineHandle
);
opaque_handle!(
    /// One execution context created against an engine.
    ContextHandle
);
opaque_handle!(
    /// An ordered asynchronous command queue.
    QueueHandle
);
opaque_handle!(
    /// A device memory allocation.
    DeviceBuffer
);

/// Capability set the gateway requires from an accelerator runtime.
///
/// Implementations must be safe to call from many threads at once; the
/// gateway serializes per-queue work through the runner's context pool
/// but issues calls for different queues concurrently.
pub trait AcceleratorBackend: Send + Sync + 'static {
    /// Short runtime name for logs.
    fn name(&self) -> &'static str;

    fn load_engine(&self, image: &[u8]) -> Result<EngineHandle, BackendError>;

    /// Declared input/output slots, in the engine's native binding order.
    fn engine_bindings(&self, engine: EngineHandle) -> Result<Vec<BindingDesc>, BackendError>;

    fn create_context(&self, engine: EngineHandle) -> Result<ContextHandle, BackendError>;

    fn create_queue(&self) -> Result<QueueHandle, BackendError>;

    fn alloc_device(&self, bytes: usize) -> Result<DeviceBuffer, BackendError>;

    /// Queue-ordered host-to-device copy of `src.len()` bytes.
    fn copy_host_to_device(
        &self,
        src: &[u8],
        dst: DeviceBuffer,
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    /// Queue-ordered device-to-host copy of `dst.len()` bytes.
    fn copy_device_to_host(
        &self,
        src: DeviceBuffer,
        dst: &mut [u8],
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    /// Submits one execution against `bindings`, which must follow the
    /// engine's native binding order.
    fn enqueue(
        &self,
        ctx: ContextHandle,
        bindings: &[DeviceBuffer],
        queue: QueueHandle,
    ) -> Result<(), BackendError>;

    /// Blocks until all work submitted to `queue` has drained.
    fn synchronize(&self, queue: QueueHandle) -> Result<(), BackendError>;

    fn free_device(&self, buffer: DeviceBuffer);

    fn destroy_context(&self, ctx: ContextHandle);

    fn destroy_queue(&self, queue: QueueHandle);

    fn release_engine(&self, engine: EngineHandle);
}

// ─── Scoped resource guards ──────────────────────────────────────────────────

/// Owns a loaded engine; released on drop.
pub struct EngineGuard {
    backend: Arc<dyn AcceleratorBackend>,
    handle: EngineHandle,
}

impl EngineGuard {
    pub fn load(backend: Arc<dyn AcceleratorBackend>, image: &[u8]) -> Result<Self, BackendError> {
        let handle = backend.load_engine(image)?;
        Ok(Self { backend, handle })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        self.backend.release_engine(self.handle);
    }
}

/// Owns one execution context; destroyed on drop.
pub struct ContextGuard {
    backend: Arc<dyn AcceleratorBackend>,
    handle: ContextHandle,
}

impl ContextGuard {
    pub fn create(
        backend: Arc<dyn AcceleratorBackend>,
        engine: EngineHandle,
    ) -> Result<Self, BackendError> {
        let handle = backend.create_context(engine)?;
        Ok(Self { backend, handle })
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.backend.destroy_context(self.handle);
    }
}

/// Owns one command queue; destroyed on drop.
pub struct QueueGuard {
    backend: Arc<dyn AcceleratorBackend>,
    handle: QueueHandle,
}

impl QueueGuard {
    pub fn create(backend: Arc<dyn AcceleratorBackend>) -> Result<Self, BackendError> {
        let handle = backend.create_queue()?;
        Ok(Self { backend, handle })
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        self.backend.destroy_queue(self.handle);
    }
}

/// Owns one device allocation; freed on drop.
pub struct DeviceAllocation {
    backend: Arc<dyn AcceleratorBackend>,
    handle: DeviceBuffer,
    bytes: usize,
}

impl DeviceAllocation {
    pub fn new(backend: Arc<dyn AcceleratorBackend>, bytes: usize) -> Result<Self, BackendError> {
        let handle = backend.alloc_device(bytes)?;
        Ok(Self {
            backend,
            handle,
            bytes,
        })
    }

    pub fn handle(&self) -> DeviceBuffer {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        self.backend.free_device(self.handle);
    }
}
