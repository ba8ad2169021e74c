#![forbid(unsafe_code)]

use std::fmt;
use std::ops::Index;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetType {
    Unk,
    Host,
    X86,
    Cuda,
    Arm,
    OpenCL,
    Fpga,
    Npu,
    Xpu,
    Any,
}

impl TargetType {
    /// Targets whose buffers live in host memory and can be read without a copy.
    #[must_use]
    pub const fn is_host_readable(self) -> bool {
        matches!(self, Self::Host | Self::X86 | Self::Arm)
    }

    /// Whether code declared for `self` can read memory resident on `actual`
    /// in place. `Any` reads everything; the host family shares memory.
    #[must_use]
    pub fn can_read(self, actual: TargetType) -> bool {
        self == Self::Any
            || self == actual
            || (self.is_host_readable() && actual.is_host_readable())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unk => "Unk",
            Self::Host => "Host",
            Self::X86 => "X86",
            Self::Cuda => "Cuda",
            Self::Arm => "Arm",
            Self::OpenCL => "OpenCL",
            Self::Fpga => "Fpga",
            Self::Npu => "Npu",
            Self::Xpu => "Xpu",
            Self::Any => "Any",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PrecisionType {
    Unk,
    Float,
    Int8,
    Int32,
    Any,
    Fp16,
    Bool,
    Int64,
    Int16,
    UInt8,
    Fp64,
}

impl PrecisionType {
    #[must_use]
    pub const fn byte_width(self) -> Option<usize> {
        match self {
            Self::Int8 | Self::UInt8 | Self::Bool => Some(1),
            Self::Fp16 | Self::Int16 => Some(2),
            Self::Float | Self::Int32 => Some(4),
            Self::Int64 | Self::Fp64 => Some(8),
            Self::Unk | Self::Any => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unk => "Unk",
            Self::Float => "Float",
            Self::Int8 => "Int8",
            Self::Int32 => "Int32",
            Self::Any => "Any",
            Self::Fp16 => "Fp16",
            Self::Bool => "Bool",
            Self::Int64 => "Int64",
            Self::Int16 => "Int16",
            Self::UInt8 => "UInt8",
            Self::Fp64 => "Fp64",
        }
    }
}

impl fmt::Display for PrecisionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataLayoutType {
    Unk,
    Nchw,
    Nhwc,
    Any,
}

impl DataLayoutType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unk => "Unk",
            Self::Nchw => "Nchw",
            Self::Nhwc => "Nhwc",
            Self::Any => "Any",
        }
    }
}

impl fmt::Display for DataLayoutType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution variant of an operator: device target, numeric precision and
/// data layout, plus the device ordinal on multi-device targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Place {
    pub target: TargetType,
    pub precision: PrecisionType,
    pub layout: DataLayoutType,
    pub device_id: u32,
}

impl Place {
    #[must_use]
    pub const fn new(target: TargetType, precision: PrecisionType, layout: DataLayoutType) -> Self {
        Self {
            target,
            precision,
            layout,
            device_id: 0,
        }
    }

    #[must_use]
    pub const fn host() -> Self {
        Self::new(TargetType::Host, PrecisionType::Float, DataLayoutType::Nchw)
    }

    #[must_use]
    pub const fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = device_id;
        self
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Place{{{},{},{},{}}}",
            self.target, self.precision, self.layout, self.device_id
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DDim(Vec<usize>);

impl DDim {
    #[must_use]
    pub fn new(dims: Vec<usize>) -> Self {
        Self(dims)
    }

    /// Element count. A rank-0 dim is a scalar and counts as one element.
    #[must_use]
    pub fn production(&self) -> usize {
        self.0.iter().copied().product()
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        contiguous_strides(&self.0)
    }
}

impl Index<usize> for DDim {
    type Output = usize;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}

impl From<Vec<usize>> for DDim {
    fn from(value: Vec<usize>) -> Self {
        Self(value)
    }
}

impl From<&[usize]> for DDim {
    fn from(value: &[usize]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for DDim {
    fn from(value: [usize; N]) -> Self {
        Self(value.to_vec())
    }
}

impl fmt::Display for DDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Level-of-detail: nested sequence offsets over a tensor's outer dimension.
pub type LoD = Vec<Vec<u64>>;

#[must_use]
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    if shape.is_empty() {
        return Vec::new();
    }

    let mut strides = vec![1; shape.len()];
    let mut running = 1usize;
    for idx in (0..shape.len()).rev() {
        strides[idx] = running;
        running = running.saturating_mul(shape[idx]);
    }
    strides
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I8(Vec<i8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

impl TensorData {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F32(values) => values.len(),
            Self::I8(values) => values.len(),
            Self::I32(values) => values.len(),
            Self::I64(values) => values.len(),
            Self::U8(values) => values.len(),
            Self::Bool(values) => values.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn precision(&self) -> PrecisionType {
        match self {
            Self::F32(_) => PrecisionType::Float,
            Self::I8(_) => PrecisionType::Int8,
            Self::I32(_) => PrecisionType::Int32,
            Self::I64(_) => PrecisionType::Int64,
            Self::U8(_) => PrecisionType::UInt8,
            Self::Bool(_) => PrecisionType::Bool,
        }
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.len() * self.precision().byte_width().unwrap_or(0)
    }

    /// Copies the first `count` elements of `src` into `self`, replacing its
    /// element type if the two differ.
    pub fn copy_prefix_from(&mut self, src: &TensorData, count: usize) -> Result<(), TensorError> {
        if count > src.len() {
            return Err(TensorError::LengthMismatch {
                expected: count,
                actual: src.len(),
            });
        }
        *self = match src {
            Self::F32(values) => Self::F32(values[..count].to_vec()),
            Self::I8(values) => Self::I8(values[..count].to_vec()),
            Self::I32(values) => Self::I32(values[..count].to_vec()),
            Self::I64(values) => Self::I64(values[..count].to_vec()),
            Self::U8(values) => Self::U8(values[..count].to_vec()),
            Self::Bool(values) => Self::Bool(values[..count].to_vec()),
        };
        Ok(())
    }
}

/// Rust element type stored in a [`TensorData`] variant.
pub trait Element: Copy + PartialEq + fmt::Debug + Default + Send + Sync + 'static {
    const PRECISION: PrecisionType;

    fn slice(data: &TensorData) -> Option<&[Self]>;

    fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]>;

    fn wrap(values: Vec<Self>) -> TensorData;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, $precision:expr) => {
        impl Element for $ty {
            const PRECISION: PrecisionType = $precision;

            fn slice(data: &TensorData) -> Option<&[Self]> {
                match data {
                    TensorData::$variant(values) => Some(values.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(data: &mut TensorData) -> Option<&mut [Self]> {
                match data {
                    TensorData::$variant(values) => Some(values.as_mut_slice()),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> TensorData {
                TensorData::$variant(values)
            }
        }
    };
}

impl_element!(f32, F32, PrecisionType::Float);
impl_element!(i8, I8, PrecisionType::Int8);
impl_element!(i32, I32, PrecisionType::Int32);
impl_element!(i64, I64, PrecisionType::Int64);
impl_element!(u8, U8, PrecisionType::UInt8);
impl_element!(bool, Bool, PrecisionType::Bool);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorError {
    #[error("tensor buffer lives on {target} and is not host readable")]
    NotHostReadable { target: TargetType },
    #[error("tensor holds no data")]
    Uninitialized,
    #[error("element type mismatch: requested {expected}, buffer holds {actual}")]
    ElementMismatch {
        expected: PrecisionType,
        actual: PrecisionType,
    },
    #[error("buffer length mismatch: expected {expected} elements, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Raw storage of a tensor, tagged with the target whose memory holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    target: TargetType,
    data: Option<TensorData>,
}

impl Buffer {
    #[must_use]
    pub fn empty(target: TargetType) -> Self {
        Self { target, data: None }
    }

    #[must_use]
    pub fn target(&self) -> TargetType {
        self.target
    }

    #[must_use]
    pub fn data(&self) -> Option<&TensorData> {
        self.data.as_ref()
    }

    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.as_ref().map_or(0, TensorData::byte_len)
    }

    pub fn set(&mut self, target: TargetType, data: TensorData) {
        self.target = target;
        self.data = Some(data);
    }

    pub fn data_mut(&mut self) -> Option<&mut TensorData> {
        self.data.as_mut()
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::empty(TargetType::Host)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tensor {
    dims: DDim,
    lod: LoD,
    buffer: Buffer,
}

impl Tensor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_host<T: Element>(
        dims: impl Into<DDim>,
        values: Vec<T>,
    ) -> Result<Self, TensorError> {
        let dims = dims.into();
        if values.len() != dims.production() {
            return Err(TensorError::LengthMismatch {
                expected: dims.production(),
                actual: values.len(),
            });
        }
        let mut buffer = Buffer::empty(TargetType::Host);
        buffer.set(TargetType::Host, T::wrap(values));
        Ok(Self {
            dims,
            lod: LoD::new(),
            buffer,
        })
    }

    pub fn resize(&mut self, dims: impl Into<DDim>) {
        self.dims = dims.into();
    }

    #[must_use]
    pub fn dims(&self) -> &DDim {
        &self.dims
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.dims.production()
    }

    #[must_use]
    pub fn lod(&self) -> &LoD {
        &self.lod
    }

    pub fn set_lod(&mut self, lod: LoD) {
        self.lod = lod;
    }

    #[must_use]
    pub fn target(&self) -> TargetType {
        self.buffer.target()
    }

    #[must_use]
    pub fn precision(&self) -> Option<PrecisionType> {
        self.buffer.data().map(TensorData::precision)
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.buffer.data().is_some()
    }

    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Host view of the first `numel()` elements.
    pub fn data<T: Element>(&self) -> Result<&[T], TensorError> {
        if !self.target().is_host_readable() {
            return Err(TensorError::NotHostReadable {
                target: self.target(),
            });
        }
        self.raw_data()
    }

    /// Element view regardless of residency. Only copy engines and kernels
    /// running on the owning target should call this.
    pub fn raw_data<T: Element>(&self) -> Result<&[T], TensorError> {
        let data = self.buffer.data().ok_or(TensorError::Uninitialized)?;
        let values = T::slice(data).ok_or(TensorError::ElementMismatch {
            expected: T::PRECISION,
            actual: data.precision(),
        })?;
        let numel = self.numel();
        if values.len() < numel {
            return Err(TensorError::LengthMismatch {
                expected: numel,
                actual: values.len(),
            });
        }
        Ok(&values[..numel])
    }

    /// Allocates `numel()` elements of `T` on `target`, reusing the existing
    /// allocation when type, target and length already agree.
    pub fn mutable_data<T: Element>(&mut self, target: TargetType) -> &mut [T] {
        let numel = self.numel();
        let reusable = self.buffer.target() == target
            && self
                .buffer
                .data()
                .and_then(T::slice)
                .is_some_and(|values| values.len() == numel);
        if !reusable {
            self.buffer.set(target, T::wrap(vec![T::default(); numel]));
        }
        match self.buffer.data_mut().and_then(T::slice_mut) {
            Some(values) => values,
            None => unreachable!("buffer was just allocated with the requested element type"),
        }
    }

    /// Replaces dims, LoD and data with a host copy of `values`.
    pub fn assign<T: Element>(
        &mut self,
        values: &[T],
        dims: impl Into<DDim>,
    ) -> Result<(), TensorError> {
        let dims = dims.into();
        if values.len() != dims.production() {
            return Err(TensorError::LengthMismatch {
                expected: dims.production(),
                actual: values.len(),
            });
        }
        self.dims = dims;
        self.buffer.set(TargetType::Host, T::wrap(values.to_vec()));
        Ok(())
    }

    pub fn copy_meta_from(&mut self, other: &Tensor) {
        self.dims = other.dims.clone();
        self.lod = other.lod.clone();
    }
}
