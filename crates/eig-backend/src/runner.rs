//! Per-model execution runner.
//!
//! A [`Runner`] owns everything one loaded model needs: the engine, one
//! device buffer per declared binding (shared by every pooled context),
//! and `concurrency` execution contexts, each paired with its own
//! command queue.
//!
//! # Checkout discipline
//!
//! A free-index stack guarded by a mutex + condvar bounds concurrent
//! executions to the pool size. `checkin` wakes exactly one waiter per
//! released slot, so a blocked caller always makes progress once slots
//! turn over. A caller that has not obtained a slot holds nothing.
//!
//! # Teardown order
//!
//! Field declaration order encodes the release sequence: contexts (each
//! before its queue), then device buffers, then the engine. The runtime
//! itself goes away with the last `Arc` reference.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use tracing::{debug, info};

use eig_core::types::{BindingDesc, Direction};

use crate::backend::{
    AcceleratorBackend, ContextGuard, DeviceAllocation, DeviceBuffer, EngineGuard, QueueGuard,
};
use crate::error::{InferError, LoadError};

/// A declared engine slot bound to its shared device buffer.
pub struct Binding {
    pub desc: BindingDesc,
    buffer: DeviceAllocation,
    bytes: usize,
}

impl Binding {
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    fn device(&self) -> DeviceBuffer {
        self.buffer.handle()
    }
}

/// One pooled execution slot. The context must drop before its queue.
struct PooledContext {
    ctx: ContextGuard,
    queue: QueueGuard,
}

struct ContextPool {
    slots: Vec<PooledContext>,
    free: Mutex<Vec<usize>>,
    available: Condvar,
}

impl ContextPool {
    fn new(slots: Vec<PooledContext>) -> Self {
        let free = (0..slots.len()).collect();
        Self {
            slots,
            free: Mutex::new(free),
            available: Condvar::new(),
        }
    }

    /// Blocks until a slot is free and claims it.
    fn checkout(&self) -> PoolSlot<'_> {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(index) = free.pop() {
                return PoolSlot { pool: self, index };
            }
            free = self
                .available
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn checkin(&self, index: usize) {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(index);
        // One release wakes one waiter; nobody can starve.
        self.available.notify_one();
    }
}

/// Claimed slot; returned to the pool on drop, on every exit path.
struct PoolSlot<'a> {
    pool: &'a ContextPool,
    index: usize,
}

impl PoolSlot<'_> {
    fn slot(&self) -> &PooledContext {
        &self.pool.slots[self.index]
    }
}

impl Drop for PoolSlot<'_> {
    fn drop(&mut self) {
        self.pool.checkin(self.index);
    }
}

/// Runtime handle for one loaded model.
pub struct Runner {
    // Drop order: pool (contexts, queues) → buffers → engine → runtime Arc.
    pool: ContextPool,
    inputs: Vec<Binding>,
    outputs: Vec<Binding>,
    /// Engine-native interleave of inputs and outputs, as indexes into
    /// the two vectors above.
    binding_order: Vec<(Direction, usize)>,
    engine: EngineGuard,
    backend: Arc<dyn AcceleratorBackend>,
    id: String,
    concurrency: usize,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("id", &self.id)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Reads the engine artifact and brings the model fully up:
    /// engine, one device buffer per binding, `concurrency` contexts
    /// with fresh queues. Any failure unwinds every resource acquired
    /// so far in reverse order.
    pub fn load(
        backend: Arc<dyn AcceleratorBackend>,
        id: &str,
        engine_path: &Path,
        concurrency: usize,
    ) -> Result<Self, LoadError> {
        let image = std::fs::read(engine_path).map_err(|source| LoadError::EngineFile {
            path: engine_path.to_path_buf(),
            source,
        })?;
        let engine = EngineGuard::load(backend.clone(), &image)?;
        let descs = backend.engine_bindings(engine.handle())?;

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut binding_order = Vec::with_capacity(descs.len());
        for desc in descs {
            let bytes = desc.byte_len().ok_or_else(|| LoadError::BindingSize {
                name: desc.name.clone(),
            })?;
            let buffer = DeviceAllocation::new(backend.clone(), bytes)?;
            let binding = Binding {
                desc,
                buffer,
                bytes,
            };
            match binding.desc.direction {
                Direction::Input => {
                    binding_order.push((Direction::Input, inputs.len()));
                    inputs.push(binding);
                }
                Direction::Output => {
                    binding_order.push((Direction::Output, outputs.len()));
                    outputs.push(binding);
                }
            }
        }

        let mut slots = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let ctx = ContextGuard::create(backend.clone(), engine.handle())?;
            let queue = QueueGuard::create(backend.clone())?;
            slots.push(PooledContext { ctx, queue });
        }

        info!(
            model = id,
            backend = backend.name(),
            inputs = inputs.len(),
            outputs = outputs.len(),
            concurrency,
            "model loaded"
        );

        Ok(Self {
            pool: ContextPool::new(slots),
            inputs,
            outputs,
            binding_order,
            engine,
            backend,
            id: id.to_string(),
            concurrency,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn inputs(&self) -> &[Binding] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Binding] {
        &self.outputs
    }

    /// Runs one inference. Blocking; safe to call from many threads.
    ///
    /// `host_inputs[i]` must hold at least `inputs()[i].byte_len()`
    /// bytes; `host_outputs[j]` must hold at least
    /// `outputs()[j].byte_len()`. Only the binding-declared byte counts
    /// are copied either way.
    pub fn infer(
        &self,
        host_inputs: &[&[u8]],
        host_outputs: &mut [Vec<u8>],
    ) -> Result<(), InferError> {
        self.validate_host_io(host_inputs, host_outputs)?;

        let claimed = self.pool.checkout();
        let queue = claimed.slot().queue.handle();
        let ctx = claimed.slot().ctx.handle();

        for (binding, host) in self.inputs.iter().zip(host_inputs) {
            self.backend
                .copy_host_to_device(&host[..binding.bytes], binding.device(), queue)?;
        }

        let ordered: Vec<DeviceBuffer> = self
            .binding_order
            .iter()
            .map(|&(direction, index)| match direction {
                Direction::Input => self.inputs[index].device(),
                Direction::Output => self.outputs[index].device(),
            })
            .collect();

        // Slot is released by the claimed guard on the error path.
        self.backend
            .enqueue(ctx, &ordered, queue)
            .map_err(InferError::EnqueueFailed)?;

        for (binding, host) in self.outputs.iter().zip(host_outputs) {
            self.backend
                .copy_device_to_host(binding.device(), &mut host[..binding.bytes], queue)?;
        }
        self.backend.synchronize(queue)?;

        debug!(model = %self.id, "inference complete");
        Ok(())
    }

    fn validate_host_io(
        &self,
        host_inputs: &[&[u8]],
        host_outputs: &[Vec<u8>],
    ) -> Result<(), InferError> {
        if host_inputs.len() != self.inputs.len() {
            return Err(InferError::IoShapeMismatch(format!(
                "got {} inputs, engine declares {}",
                host_inputs.len(),
                self.inputs.len()
            )));
        }
        if host_outputs.len() != self.outputs.len() {
            return Err(InferError::IoShapeMismatch(format!(
                "got {} outputs, engine declares {}",
                host_outputs.len(),
                self.outputs.len()
            )));
        }
        for (binding, host) in self.inputs.iter().zip(host_inputs) {
            if host.len() < binding.bytes {
                return Err(InferError::IoShapeMismatch(format!(
                    "input '{}' needs {} bytes, got {}",
                    binding.desc.name,
                    binding.bytes,
                    host.len()
                )));
            }
        }
        for (binding, host) in self.outputs.iter().zip(host_outputs) {
            if host.len() < binding.bytes {
                return Err(InferError::IoShapeMismatch(format!(
                    "output '{}' needs {} bytes, got {}",
                    binding.desc.name,
                    binding.bytes,
                    host.len()
                )));
            }
        }
        Ok(())
    }
}
