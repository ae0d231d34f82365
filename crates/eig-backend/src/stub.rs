//! In-process stub accelerator.
//!
//! Stands in for a hardware runtime wherever none is linked: the test
//! suite runs entirely against it, and the shipped binary uses it until
//! a device runtime implementing [`AcceleratorBackend`] is wired in.
//!
//! # Determinism
//!
//! Execution folds every input byte into a single accumulator and fills
//! each output buffer with the result, so any test can predict output
//! contents from input contents alone (see [`StubBackend::fill_byte`]).
//!
//! # Instrumentation
//!
//! The stub journals every resource acquisition and release and tracks
//! the peak number of concurrent executions, which makes lifetime-order
//! and pool-exclusion assertions cheap to write. `fail_enqueue` and
//! `enqueue_delay` inject the failure and latency behaviors the server
//! tests need.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use eig_core::types::{BindingDesc, DType, Direction};

use crate::backend::{
    AcceleratorBackend, ContextHandle, DeviceBuffer, EngineHandle, QueueHandle,
};
use crate::error::BackendError;

const SPEC_MAGIC: &[u8; 8] = b"EIGSTUB1";

/// Serializable engine description consumed by [`StubBackend::load_engine`].
///
/// Fixture engine files on disk are just `to_bytes()` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubEngineSpec {
    pub bindings: Vec<BindingDesc>,
}

impl StubEngineSpec {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(SPEC_MAGIC);
        out.extend_from_slice(&(self.bindings.len() as u32).to_le_bytes());
        for binding in &self.bindings {
            out.extend_from_slice(&(binding.name.len() as u16).to_le_bytes());
            out.extend_from_slice(binding.name.as_bytes());
            out.push(match binding.direction {
                Direction::Input => 0,
                Direction::Output => 1,
            });
            out.push(binding.dtype as u8);
            out.push(binding.shape.len() as u8);
            for &dim in &binding.shape {
                out.extend_from_slice(&dim.to_le_bytes());
            }
        }
        out
    }

    pub fn from_bytes(image: &[u8]) -> Result<Self, BackendError> {
        let mut cursor = SpecCursor { image, pos: 0 };

        if cursor.take(8)? != SPEC_MAGIC {
            return Err(BackendError::BadEngine("not a stub engine image".into()));
        }
        let count = {
            let b = cursor.take(4)?;
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };

        let mut bindings = Vec::new();
        for _ in 0..count {
            let name_len = {
                let b = cursor.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as usize
            };
            let name = String::from_utf8(cursor.take(name_len)?.to_vec())
                .map_err(|_| BackendError::BadEngine("binding name is not utf-8".into()))?;
            let direction = match cursor.take(1)?[0] {
                0 => Direction::Input,
                1 => Direction::Output,
                other => {
                    return Err(BackendError::BadEngine(format!(
                        "bad direction byte {other}"
                    )));
                }
            };
            let dtype = DType::try_from(cursor.take(1)?[0])
                .map_err(|b| BackendError::BadEngine(format!("bad dtype byte {b}")))?;
            let ndims = cursor.take(1)?[0] as usize;
            let mut shape = Vec::with_capacity(ndims);
            for _ in 0..ndims {
                let b = cursor.take(8)?;
                shape.push(i64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]));
            }
            bindings.push(BindingDesc {
                name,
                direction,
                dtype,
                shape,
            });
        }
        Ok(Self { bindings })
    }
}

struct SpecCursor<'a> {
    image: &'a [u8],
    pos: usize,
}

impl<'a> SpecCursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], BackendError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.image.len())
            .ok_or_else(|| BackendError::BadEngine("short engine image".into()))?;
        let slice = &self.image[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

/// One journaled resource event, in call order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubEvent {
    EngineLoaded(u64),
    EngineReleased(u64),
    ContextCreated(u64),
    ContextDestroyed(u64),
    QueueCreated(u64),
    QueueDestroyed(u64),
    DeviceAllocated { id: u64, bytes: usize },
    DeviceFreed(u64),
}

#[derive(Default)]
struct StubState {
    engines: HashMap<u64, Vec<BindingDesc>>,
    contexts: HashMap<u64, u64>,
    queues: HashMap<u64, ()>,
    buffers: HashMap<u64, Vec<u8>>,
}

/// The stub runtime. Cheap to construct; share via `Arc`.
pub struct StubBackend {
    state: Mutex<StubState>,
    journal: Mutex<Vec<StubEvent>>,
    next_id: AtomicU64,
    engine_loads: AtomicU64,
    fail_enqueue: AtomicBool,
    enqueue_delay: Option<Duration>,
    active_enqueues: AtomicUsize,
    peak_enqueues: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_enqueue_delay(None)
    }

    /// A stub whose executions sleep for `delay`, for timing tests.
    pub fn with_enqueue_delay(delay: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            journal: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            engine_loads: AtomicU64::new(0),
            fail_enqueue: AtomicBool::new(false),
            enqueue_delay: delay,
            active_enqueues: AtomicUsize::new(0),
            peak_enqueues: AtomicUsize::new(0),
        }
    }

    /// Deterministic execution result: every output byte the engine
    /// produces for the given input payloads.
    pub fn fill_byte(inputs: &[&[u8]]) -> u8 {
        let mut acc: u8 = 0;
        for input in inputs {
            for &byte in *input {
                acc = acc.wrapping_add(byte);
            }
        }
        acc
    }

    /// When set, the next enqueue calls fail with `EnqueueRejected`.
    pub fn set_fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    /// Number of `load_engine` calls served so far.
    pub fn engine_loads(&self) -> u64 {
        self.engine_loads.load(Ordering::SeqCst)
    }

    /// Live device memory, summed over all allocations.
    pub fn device_bytes_in_use(&self) -> usize {
        self.lock_state().buffers.values().map(Vec::len).sum()
    }

    /// Highest number of executions observed in flight at once.
    pub fn peak_concurrent_enqueues(&self) -> usize {
        self.peak_enqueues.load(Ordering::SeqCst)
    }

    /// Copy of the resource event journal.
    pub fn journal(&self) -> Vec<StubEvent> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: StubEvent) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AcceleratorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load_engine(&self, image: &[u8]) -> Result<EngineHandle, BackendError> {
        let spec = StubEngineSpec::from_bytes(image)?;
        self.engine_loads.fetch_add(1, Ordering::SeqCst);
        let id = self.fresh_id();
        self.lock_state().engines.insert(id, spec.bindings);
        self.record(StubEvent::EngineLoaded(id));
        Ok(EngineHandle(id))
    }

    fn engine_bindings(&self, engine: EngineHandle) -> Result<Vec<BindingDesc>, BackendError> {
        self.lock_state()
            .engines
            .get(&engine.0)
            .cloned()
            .ok_or_else(|| BackendError::Device(format!("unknown engine {:#x}", engine.0)))
    }

    fn create_context(&self, engine: EngineHandle) -> Result<ContextHandle, BackendError> {
        let id = self.fresh_id();
        let mut state = self.lock_state();
        if !state.engines.contains_key(&engine.0) {
            return Err(BackendError::Device(format!(
                "unknown engine {:#x}",
                engine.0
            )));
        }
        state.contexts.insert(id, engine.0);
        drop(state);
        self.record(StubEvent::ContextCreated(id));
        Ok(ContextHandle(id))
    }

    fn create_queue(&self) -> Result<QueueHandle, BackendError> {
        let id = self.fresh_id();
        self.lock_state().queues.insert(id, ());
        self.record(StubEvent::QueueCreated(id));
        Ok(QueueHandle(id))
    }

    fn alloc_device(&self, bytes: usize) -> Result<DeviceBuffer, BackendError> {
        if bytes == 0 {
            return Err(BackendError::AllocFailed { bytes });
        }
        let id = self.fresh_id();
        self.lock_state().buffers.insert(id, vec![0u8; bytes]);
        self.record(StubEvent::DeviceAllocated { id, bytes });
        Ok(DeviceBuffer(id))
    }

    fn copy_host_to_device(
        &self,
        src: &[u8],
        dst: DeviceBuffer,
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let mut state = self.lock_state();
        if !state.queues.contains_key(&queue.0) {
            return Err(BackendError::Device(format!("unknown queue {:#x}", queue.0)));
        }
        let buffer = state
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| BackendError::Device(format!("unknown buffer {:#x}", dst.0)))?;
        if src.len() > buffer.len() {
            return Err(BackendError::Device(format!(
                "h2d copy of {} bytes into {}-byte buffer",
                src.len(),
                buffer.len()
            )));
        }
        buffer[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_device_to_host(
        &self,
        src: DeviceBuffer,
        dst: &mut [u8],
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let state = self.lock_state();
        if !state.queues.contains_key(&queue.0) {
            return Err(BackendError::Device(format!("unknown queue {:#x}", queue.0)));
        }
        let buffer = state
            .buffers
            .get(&src.0)
            .ok_or_else(|| BackendError::Device(format!("unknown buffer {:#x}", src.0)))?;
        if dst.len() > buffer.len() {
            return Err(BackendError::Device(format!(
                "d2h copy of {} bytes from {}-byte buffer",
                dst.len(),
                buffer.len()
            )));
        }
        dst.copy_from_slice(&buffer[..dst.len()]);
        Ok(())
    }

    fn enqueue(
        &self,
        ctx: ContextHandle,
        bindings: &[DeviceBuffer],
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(BackendError::EnqueueRejected);
        }

        let active = self.active_enqueues.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_enqueues.fetch_max(active, Ordering::SeqCst);

        // Model compute latency without serializing callers on the
        // state lock.
        if let Some(delay) = self.enqueue_delay {
            std::thread::sleep(delay);
        }

        let result = self.execute(ctx, bindings, queue);
        self.active_enqueues.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn synchronize(&self, queue: QueueHandle) -> Result<(), BackendError> {
        // Stub work completes inside enqueue; the fence only validates
        // the handle.
        if self.lock_state().queues.contains_key(&queue.0) {
            Ok(())
        } else {
            Err(BackendError::Device(format!("unknown queue {:#x}", queue.0)))
        }
    }

    fn free_device(&self, buffer: DeviceBuffer) {
        if self.lock_state().buffers.remove(&buffer.0).is_some() {
            self.record(StubEvent::DeviceFreed(buffer.0));
        }
    }

    fn destroy_context(&self, ctx: ContextHandle) {
        if self.lock_state().contexts.remove(&ctx.0).is_some() {
            self.record(StubEvent::ContextDestroyed(ctx.0));
        }
    }

    fn destroy_queue(&self, queue: QueueHandle) {
        if self.lock_state().queues.remove(&queue.0).is_some() {
            self.record(StubEvent::QueueDestroyed(queue.0));
        }
    }

    fn release_engine(&self, engine: EngineHandle) {
        if self.lock_state().engines.remove(&engine.0).is_some() {
            self.record(StubEvent::EngineReleased(engine.0));
        }
    }
}

impl StubBackend {
    fn execute(
        &self,
        ctx: ContextHandle,
        bindings: &[DeviceBuffer],
        queue: QueueHandle,
    ) -> Result<(), BackendError> {
        let mut state = self.lock_state();
        if !state.queues.contains_key(&queue.0) {
            return Err(BackendError::Device(format!("unknown queue {:#x}", queue.0)));
        }
        let engine_id = *state
            .contexts
            .get(&ctx.0)
            .ok_or_else(|| BackendError::Device(format!("unknown context {:#x}", ctx.0)))?;
        let declared = state
            .engines
            .get(&engine_id)
            .ok_or_else(|| BackendError::Device(format!("unknown engine {:#x}", engine_id)))?
            .clone();
        if declared.len() != bindings.len() {
            return Err(BackendError::Device(format!(
                "bindings array has {} entries, engine declares {}",
                bindings.len(),
                declared.len()
            )));
        }

        let mut acc: u8 = 0;
        for (desc, buffer) in declared.iter().zip(bindings) {
            if desc.direction == Direction::Input {
                let data = state
                    .buffers
                    .get(&buffer.0)
                    .ok_or_else(|| BackendError::Device(format!("unknown buffer {:#x}", buffer.0)))?;
                for &byte in data {
                    acc = acc.wrapping_add(byte);
                }
            }
        }
        for (desc, buffer) in declared.iter().zip(bindings) {
            if desc.direction == Direction::Output {
                let data = state
                    .buffers
                    .get_mut(&buffer.0)
                    .ok_or_else(|| BackendError::Device(format!("unknown buffer {:#x}", buffer.0)))?;
                data.fill(acc);
            }
        }
        Ok(())
    }
}
