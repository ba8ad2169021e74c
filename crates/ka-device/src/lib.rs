#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ka_core::{Buffer, TargetType, Tensor, TensorData, TensorError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    #[error("no device registered for target {0}")]
    UnsupportedTarget(TargetType),
    #[error("device mismatch: expected {expected}, got {actual}")]
    Mismatch {
        expected: TargetType,
        actual: TargetType,
    },
    #[error("{direction:?} copy expects source on {expected}, found {actual}")]
    WrongResidency {
        direction: IoDirection,
        expected: TargetType,
        actual: TargetType,
    },
    #[error("copy of {requested} bytes exceeds source buffer of {available} bytes")]
    CopyOutOfRange { requested: usize, available: usize },
    #[error("copy size {size} is not a multiple of the {width}-byte element width")]
    UnalignedCopy { size: usize, width: usize },
    #[error("copy source holds no data")]
    EmptySource,
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// An in-order execution queue on one device.
pub trait ExecStream: fmt::Debug + Send {
    fn target(&self) -> TargetType;

    fn id(&self) -> u64;

    /// Marks one unit of asynchronous work as enqueued on the stream.
    fn record_launch(&mut self) {}

    /// Blocks until all enqueued work is observable.
    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

/// Synchronous copy between host memory and one device target.
pub trait HostTransfer: fmt::Debug + Send + Sync {
    fn copy_sync(
        &self,
        dst: &mut Buffer,
        src: &Buffer,
        size: usize,
        direction: IoDirection,
    ) -> Result<(), DeviceError>;
}

pub trait TargetDevice: fmt::Debug + Send + Sync {
    fn target(&self) -> TargetType;

    fn new_stream(&self) -> Box<dyn ExecStream>;

    /// Device<->host copy engine. `None` means results on this target cannot
    /// be inspected from the host.
    fn host_transfer(&self) -> Option<Arc<dyn HostTransfer>> {
        None
    }
}

/// Execution handle owned by exactly one instruction.
#[derive(Debug)]
pub struct KernelContext {
    target: TargetType,
    stream: Box<dyn ExecStream>,
}

impl KernelContext {
    #[must_use]
    pub fn target(&self) -> TargetType {
        self.target
    }

    #[must_use]
    pub fn stream(&self) -> &dyn ExecStream {
        self.stream.as_ref()
    }

    pub fn stream_mut(&mut self) -> &mut dyn ExecStream {
        self.stream.as_mut()
    }

    pub fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.stream.synchronize()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceGuard {
    target: TargetType,
}

impl DeviceGuard {
    #[must_use]
    pub fn new(target: TargetType) -> Self {
        Self { target }
    }

    #[must_use]
    pub fn target(&self) -> TargetType {
        self.target
    }

    /// Host-family targets share memory, so any host-readable tensor passes a
    /// host-family guard.
    pub fn ensure_resident(&self, tensor: &Tensor) -> Result<(), DeviceError> {
        let actual = tensor.target();
        if !self.target.can_read(actual) {
            return Err(DeviceError::Mismatch {
                expected: self.target,
                actual,
            });
        }
        Ok(())
    }
}

/// Registry of device targets that can hand out execution contexts. Built once
/// at start-up, then shared read-only.
#[derive(Debug, Default)]
pub struct ContextScheduler {
    devices: BTreeMap<TargetType, Arc<dyn TargetDevice>>,
}

impl ContextScheduler {
    /// A scheduler with the host family (`Host`, `X86`, `Arm`) registered.
    #[must_use]
    pub fn new() -> Self {
        let mut scheduler = Self::empty();
        for target in [TargetType::Host, TargetType::X86, TargetType::Arm] {
            scheduler.register_device(Arc::new(HostDevice::new(target)));
        }
        scheduler
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }

    /// Registers `device` for its target, returning the device it replaced.
    pub fn register_device(
        &mut self,
        device: Arc<dyn TargetDevice>,
    ) -> Option<Arc<dyn TargetDevice>> {
        let target = device.target();
        debug!(device = %target, "registered device");
        self.devices.insert(target, device)
    }

    #[must_use]
    pub fn with_device(mut self, device: Arc<dyn TargetDevice>) -> Self {
        self.register_device(device);
        self
    }

    #[must_use]
    pub fn supports(&self, target: TargetType) -> bool {
        self.devices.contains_key(&target)
    }

    #[must_use]
    pub fn targets(&self) -> Vec<TargetType> {
        self.devices.keys().copied().collect()
    }

    pub fn new_context(&self, target: TargetType) -> Result<KernelContext, DeviceError> {
        let device = self
            .devices
            .get(&target)
            .ok_or(DeviceError::UnsupportedTarget(target))?;
        let stream = device.new_stream();
        debug!(device = %target, stream = stream.id(), "acquired kernel context");
        Ok(KernelContext { target, stream })
    }

    #[must_use]
    pub fn host_transfer(&self, target: TargetType) -> Option<Arc<dyn HostTransfer>> {
        self.devices.get(&target)?.host_transfer()
    }
}

/// Copies a whole tensor (dims, LoD and data) across the host/device boundary.
pub fn copy_tensor_sync(
    transfer: &dyn HostTransfer,
    dst: &mut Tensor,
    src: &Tensor,
    direction: IoDirection,
) -> Result<(), DeviceError> {
    let precision = src.precision().ok_or(DeviceError::EmptySource)?;
    let width = precision.byte_width().unwrap_or(0);
    let size = src.numel() * width;
    dst.copy_meta_from(src);
    transfer.copy_sync(dst.buffer_mut(), src.buffer(), size, direction)
}

#[derive(Debug)]
struct HostDevice {
    target: TargetType,
    next_stream: AtomicU64,
}

impl HostDevice {
    fn new(target: TargetType) -> Self {
        Self {
            target,
            next_stream: AtomicU64::new(0),
        }
    }
}

impl TargetDevice for HostDevice {
    fn target(&self) -> TargetType {
        self.target
    }

    fn new_stream(&self) -> Box<dyn ExecStream> {
        Box::new(HostStream {
            target: self.target,
            id: self.next_stream.fetch_add(1, Ordering::Relaxed),
        })
    }
}

#[derive(Debug)]
struct HostStream {
    target: TargetType,
    id: u64,
}

impl ExecStream for HostStream {
    fn target(&self) -> TargetType {
        self.target
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Counters shared by a loopback device, its streams and its copy engine.
#[derive(Debug, Default)]
struct LoopbackCounters {
    streams: AtomicU64,
    launches: AtomicU64,
    synchronizations: AtomicU64,
    h2d_bytes: AtomicU64,
    d2h_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub streams: u64,
    pub launches: u64,
    pub synchronizations: u64,
    pub h2d_bytes: u64,
    pub d2h_bytes: u64,
}

/// Software device: memory lives in the process but is tagged with a non-host
/// target, so the host cannot read it without an explicit copy.
#[derive(Debug, Clone)]
pub struct LoopbackDevice {
    target: TargetType,
    counters: Arc<LoopbackCounters>,
    transfer: Option<Arc<LoopbackTransfer>>,
}

impl LoopbackDevice {
    #[must_use]
    pub fn new(target: TargetType) -> Self {
        let counters = Arc::new(LoopbackCounters::default());
        let transfer = Arc::new(LoopbackTransfer {
            target,
            counters: Arc::clone(&counters),
        });
        Self {
            target,
            counters,
            transfer: Some(transfer),
        }
    }

    #[must_use]
    pub fn without_transfer(target: TargetType) -> Self {
        Self {
            target,
            counters: Arc::new(LoopbackCounters::default()),
            transfer: None,
        }
    }

    #[must_use]
    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            streams: self.counters.streams.load(Ordering::Relaxed),
            launches: self.counters.launches.load(Ordering::Relaxed),
            synchronizations: self.counters.synchronizations.load(Ordering::Relaxed),
            h2d_bytes: self.counters.h2d_bytes.load(Ordering::Relaxed),
            d2h_bytes: self.counters.d2h_bytes.load(Ordering::Relaxed),
        }
    }
}

impl TargetDevice for LoopbackDevice {
    fn target(&self) -> TargetType {
        self.target
    }

    fn new_stream(&self) -> Box<dyn ExecStream> {
        let id = self.counters.streams.fetch_add(1, Ordering::Relaxed);
        Box::new(LoopbackStream {
            target: self.target,
            id,
            pending: 0,
            counters: Arc::clone(&self.counters),
        })
    }

    fn host_transfer(&self) -> Option<Arc<dyn HostTransfer>> {
        self.transfer
            .as_ref()
            .map(|transfer| Arc::clone(transfer) as Arc<dyn HostTransfer>)
    }
}

#[derive(Debug)]
struct LoopbackStream {
    target: TargetType,
    id: u64,
    pending: u64,
    counters: Arc<LoopbackCounters>,
}

impl ExecStream for LoopbackStream {
    fn target(&self) -> TargetType {
        self.target
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn record_launch(&mut self) {
        self.pending += 1;
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        if self.pending > 0 {
            debug!(
                device = %self.target,
                stream = self.id,
                pending = self.pending,
                "stream drained"
            );
        }
        self.pending = 0;
        self.counters
            .synchronizations
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[derive(Debug)]
struct LoopbackTransfer {
    target: TargetType,
    counters: Arc<LoopbackCounters>,
}

impl HostTransfer for LoopbackTransfer {
    fn copy_sync(
        &self,
        dst: &mut Buffer,
        src: &Buffer,
        size: usize,
        direction: IoDirection,
    ) -> Result<(), DeviceError> {
        let (source_ok, expected_source, dst_target, counter) = match direction {
            IoDirection::HostToDevice => (
                src.target().is_host_readable(),
                TargetType::Host,
                self.target,
                &self.counters.h2d_bytes,
            ),
            IoDirection::DeviceToHost => (
                src.target() == self.target,
                self.target,
                TargetType::Host,
                &self.counters.d2h_bytes,
            ),
        };
        if !source_ok {
            return Err(DeviceError::WrongResidency {
                direction,
                expected: expected_source,
                actual: src.target(),
            });
        }

        let data = src.data().ok_or(DeviceError::EmptySource)?;
        let width = data.precision().byte_width().unwrap_or(1);
        if size % width != 0 {
            return Err(DeviceError::UnalignedCopy { size, width });
        }
        if size > data.byte_len() {
            return Err(DeviceError::CopyOutOfRange {
                requested: size,
                available: data.byte_len(),
            });
        }

        let mut copied = TensorData::U8(Vec::new());
        copied.copy_prefix_from(data, size / width)?;
        dst.set(dst_target, copied);
        counter.fetch_add(size as u64, Ordering::Relaxed);
        debug!(?direction, device = %self.target, bytes = size, "copy_sync complete");
        Ok(())
    }
}
