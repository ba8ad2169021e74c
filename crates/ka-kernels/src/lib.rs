#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::ops::Add;

use ka_core::{DDim, DataLayoutType, Element, Place, PrecisionType, TargetType, Tensor};
use ka_device::{DeviceGuard, KernelContext};
use ka_kernel::{
    Kernel, KernelArgs, KernelError, KernelKey, KernelRegistry, KernelSignature, ParamType,
};
use ka_opdesc::OpDesc;
use tracing::debug;

/// Alias of the device kernel that reads its input from host memory without
/// a staging copy.
pub const HOST_MAPPED_ALIAS: &str = "host_mapped";

/// Registers every kernel in this crate. Host variants come first so an
/// unaliased host request resolves to them.
pub fn register_all(registry: &mut KernelRegistry) {
    registry.register(|| Box::new(NearestInterpKernel::new(TargetType::Host)));
    registry.register(|| Box::new(NearestInterpKernel::new(TargetType::Cuda)));
    registry.register(|| Box::new(NearestInterpKernel::host_mapped(TargetType::Cuda)));
    registry.register(|| Box::new(ElementwiseAddKernel::<f32>::new(TargetType::Host)));
    registry.register(|| Box::new(ElementwiseAddKernel::<i32>::new(TargetType::Host)));
    registry.register(|| Box::new(ElementwiseAddKernel::<i8>::new(TargetType::Host)));
    registry.register(|| Box::new(ElementwiseAddKernel::<f32>::new(TargetType::Arm)));
    registry.register(|| Box::new(LessThanKernel::new(TargetType::Host)));
    registry.register(|| Box::new(ArgMaxKernel::new(TargetType::Host)));
    debug!(kernels = registry.len(), "registered builtin kernels");
}

fn param(target: TargetType, precision: PrecisionType) -> ParamType {
    ParamType::new(target, precision, DataLayoutType::Nchw)
}

fn place(target: TargetType, precision: PrecisionType) -> Place {
    Place::new(target, precision, DataLayoutType::Nchw)
}

fn read_resident<'t, T: Element>(
    target: TargetType,
    tensor: &'t Tensor,
) -> Result<&'t [T], KernelError> {
    DeviceGuard::new(target).ensure_resident(tensor)?;
    Ok(tensor.raw_data::<T>()?)
}

/// Source index for output position `out_idx` along one axis.
///
/// Without corner alignment the source index is `floor(out_idx * in / out)`.
/// With it, corners map to corners: `floor(out_idx * (in - 1) / (out - 1) + 0.5)`.
#[must_use]
pub fn nearest_index(out_idx: usize, in_len: usize, out_len: usize, align_corners: bool) -> usize {
    let idx = if align_corners {
        let ratio = if out_len > 1 {
            (in_len as f32 - 1.0) / (out_len as f32 - 1.0)
        } else {
            0.0
        };
        (ratio * out_idx as f32 + 0.5) as usize
    } else {
        let ratio = in_len as f32 / out_len as f32;
        (ratio * out_idx as f32) as usize
    };
    idx.min(in_len.saturating_sub(1))
}

/// Nearest-neighbour resize of every `(n, c)` plane of an NCHW buffer.
pub fn nearest_interp_nchw<T: Copy>(
    src: &[T],
    in_dims: [usize; 4],
    out_h: usize,
    out_w: usize,
    align_corners: bool,
) -> Result<Vec<T>, KernelError> {
    let [n, c, in_h, in_w] = in_dims;
    let planes = n * c;
    if planes > 0 && (in_h == 0 || in_w == 0) {
        return Err(KernelError::InvalidArgument {
            reason: format!("cannot interpolate from empty plane {in_h}x{in_w}"),
        });
    }
    if src.len() < planes * in_h * in_w {
        return Err(KernelError::InvalidArgument {
            reason: format!(
                "input holds {} elements, dims {in_dims:?} need {}",
                src.len(),
                planes * in_h * in_w
            ),
        });
    }

    let rows: Vec<usize> = (0..out_h)
        .map(|y| nearest_index(y, in_h, out_h, align_corners))
        .collect();
    let cols: Vec<usize> = (0..out_w)
        .map(|x| nearest_index(x, in_w, out_w, align_corners))
        .collect();

    let mut out = Vec::with_capacity(planes * out_h * out_w);
    for plane in 0..planes {
        let base = plane * in_h * in_w;
        for &iy in &rows {
            let row = base + iy * in_w;
            out.extend(cols.iter().map(|&ix| src[row + ix]));
        }
    }
    Ok(out)
}

fn positive_extent(value: i64, name: &str) -> Result<usize, KernelError> {
    usize::try_from(value)
        .ok()
        .filter(|extent| *extent > 0)
        .ok_or_else(|| KernelError::InvalidArgument {
            reason: format!("{name} must be positive, got {value}"),
        })
}

/// Output height and width. `OutSize` wins over a positive `scale`, which wins
/// over the `out_h`/`out_w` attributes.
fn interp_out_size(
    op: &OpDesc,
    args: &KernelArgs<'_>,
    in_h: usize,
    in_w: usize,
) -> Result<(usize, usize), KernelError> {
    if args.has_input("OutSize") {
        let size = args.input("OutSize")?.data::<i32>()?;
        let [h, w] = size else {
            return Err(KernelError::InvalidArgument {
                reason: format!("OutSize must hold 2 values, got {}", size.len()),
            });
        };
        return Ok((
            positive_extent(i64::from(*h), "OutSize[0]")?,
            positive_extent(i64::from(*w), "OutSize[1]")?,
        ));
    }

    let scale = op.attr_or("scale", 0.0f32)?;
    if scale > 0.0 {
        let h = (in_h as f32 * scale) as i64;
        let w = (in_w as f32 * scale) as i64;
        return Ok((positive_extent(h, "out_h")?, positive_extent(w, "out_w")?));
    }

    Ok((
        positive_extent(i64::from(op.attr::<i32>("out_h")?), "out_h")?,
        positive_extent(i64::from(op.attr::<i32>("out_w")?), "out_w")?,
    ))
}

/// `nearest_interp` over float NCHW tensors on one target.
#[derive(Debug)]
pub struct NearestInterpKernel {
    key: KernelKey,
    signature: KernelSignature,
}

impl NearestInterpKernel {
    /// Kernel whose input `X` must be resident on `target`.
    #[must_use]
    pub fn new(target: TargetType) -> Self {
        Self::build(target, target, "")
    }

    /// Kernel on `target` that reads `X` straight from host memory.
    #[must_use]
    pub fn host_mapped(target: TargetType) -> Self {
        Self::build(target, TargetType::Host, HOST_MAPPED_ALIAS)
    }

    fn build(target: TargetType, input_target: TargetType, alias: &str) -> Self {
        Self {
            key: KernelKey::new("nearest_interp", place(target, PrecisionType::Float), alias),
            signature: KernelSignature::new()
                .input("X", param(input_target, PrecisionType::Float))
                .input("OutSize", param(TargetType::Host, PrecisionType::Int32))
                .output("Out", param(target, PrecisionType::Float)),
        }
    }
}

impl Kernel for NearestInterpKernel {
    fn key(&self) -> &KernelKey {
        &self.key
    }

    fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    fn run(
        &self,
        ctx: &mut KernelContext,
        op: &OpDesc,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), KernelError> {
        let x = args.input("X")?;
        let in_dims: [usize; 4] =
            x.dims()
                .as_slice()
                .try_into()
                .map_err(|_| KernelError::InvalidArgument {
                    reason: format!("nearest_interp expects NCHW input, got dims {}", x.dims()),
                })?;
        let input_target = self
            .input_decl_type("X")
            .map_or(ctx.target(), |decl| decl.target);
        let src = read_resident::<f32>(input_target, x)?;
        let align_corners = op.attr_or("align_corners", false)?;
        let (out_h, out_w) = interp_out_size(op, args, in_dims[2], in_dims[3])?;
        let values = nearest_interp_nchw(src, in_dims, out_h, out_w, align_corners)?;

        let lod = x.lod().clone();
        let out = args.output_mut("Out")?;
        out.resize([in_dims[0], in_dims[1], out_h, out_w]);
        out.set_lod(lod);
        out.mutable_data::<f32>(ctx.target()).copy_from_slice(&values);
        Ok(())
    }
}

/// `elementwise_add` over same-shaped tensors. The output inherits the LoD of
/// `X`.
#[derive(Debug)]
pub struct ElementwiseAddKernel<T> {
    key: KernelKey,
    signature: KernelSignature,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> ElementwiseAddKernel<T> {
    #[must_use]
    pub fn new(target: TargetType) -> Self {
        let ty = param(target, T::PRECISION);
        Self {
            key: KernelKey::new("elementwise_add", place(target, T::PRECISION), ""),
            signature: KernelSignature::new()
                .input("X", ty)
                .input("Y", ty)
                .output("Out", ty),
            _element: PhantomData,
        }
    }
}

impl<T> Kernel for ElementwiseAddKernel<T>
where
    T: Element + Add<Output = T>,
{
    fn key(&self) -> &KernelKey {
        &self.key
    }

    fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    fn run(
        &self,
        ctx: &mut KernelContext,
        _op: &OpDesc,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), KernelError> {
        let x = args.input("X")?;
        let y = args.input("Y")?;
        ensure_same_dims(x.dims(), y.dims())?;
        let lhs = read_resident::<T>(ctx.target(), x)?;
        let rhs = read_resident::<T>(ctx.target(), y)?;

        let out = args.output_mut("Out")?;
        out.copy_meta_from(x);
        for ((dst, &a), &b) in out
            .mutable_data::<T>(ctx.target())
            .iter_mut()
            .zip(lhs)
            .zip(rhs)
        {
            *dst = a + b;
        }
        Ok(())
    }
}

/// `less_than` over float tensors, producing a bool mask.
#[derive(Debug)]
pub struct LessThanKernel {
    key: KernelKey,
    signature: KernelSignature,
}

impl LessThanKernel {
    #[must_use]
    pub fn new(target: TargetType) -> Self {
        let ty = param(target, PrecisionType::Float);
        Self {
            key: KernelKey::new("less_than", place(target, PrecisionType::Float), ""),
            signature: KernelSignature::new()
                .input("X", ty)
                .input("Y", ty)
                .output("Out", param(target, PrecisionType::Bool)),
        }
    }
}

impl Kernel for LessThanKernel {
    fn key(&self) -> &KernelKey {
        &self.key
    }

    fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    fn run(
        &self,
        ctx: &mut KernelContext,
        _op: &OpDesc,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), KernelError> {
        let x = args.input("X")?;
        let y = args.input("Y")?;
        ensure_same_dims(x.dims(), y.dims())?;
        let lhs = read_resident::<f32>(ctx.target(), x)?;
        let rhs = read_resident::<f32>(ctx.target(), y)?;

        let out = args.output_mut("Out")?;
        out.copy_meta_from(x);
        for ((dst, a), b) in out
            .mutable_data::<bool>(ctx.target())
            .iter_mut()
            .zip(lhs)
            .zip(rhs)
        {
            *dst = a < b;
        }
        Ok(())
    }
}

/// Index of the maximum along `axis` (default last). Emits `Int64` indices
/// with the reduced axis removed.
#[derive(Debug)]
pub struct ArgMaxKernel {
    key: KernelKey,
    signature: KernelSignature,
}

impl ArgMaxKernel {
    #[must_use]
    pub fn new(target: TargetType) -> Self {
        Self {
            key: KernelKey::new("arg_max", place(target, PrecisionType::Float), ""),
            signature: KernelSignature::new()
                .input("X", param(target, PrecisionType::Float))
                .output("Out", param(target, PrecisionType::Int64)),
        }
    }
}

/// First index of the maximum of every lane along `axis`.
pub fn arg_max(src: &[f32], dims: &[usize], axis: usize) -> Result<Vec<i64>, KernelError> {
    let Some(&axis_len) = dims.get(axis) else {
        return Err(KernelError::InvalidArgument {
            reason: format!("axis {axis} out of range for rank {}", dims.len()),
        });
    };
    if axis_len == 0 {
        return Err(KernelError::InvalidArgument {
            reason: "arg_max over an empty axis".to_owned(),
        });
    }
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();

    let mut out = Vec::with_capacity(outer * inner);
    for o in 0..outer {
        for i in 0..inner {
            let at = |k: usize| src[(o * axis_len + k) * inner + i];
            let mut best = 0usize;
            for k in 1..axis_len {
                if at(k) > at(best) {
                    best = k;
                }
            }
            out.push(best as i64);
        }
    }
    Ok(out)
}

impl Kernel for ArgMaxKernel {
    fn key(&self) -> &KernelKey {
        &self.key
    }

    fn signature(&self) -> &KernelSignature {
        &self.signature
    }

    fn run(
        &self,
        ctx: &mut KernelContext,
        op: &OpDesc,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), KernelError> {
        let x = args.input("X")?;
        let dims = x.dims().as_slice();
        let rank = dims.len() as i64;
        let axis = i64::from(op.attr_or("axis", -1i32)?);
        let normalized = if axis < 0 { axis + rank } else { axis };
        let axis = usize::try_from(normalized)
            .ok()
            .filter(|axis| *axis < dims.len())
            .ok_or_else(|| KernelError::InvalidArgument {
                reason: format!("axis {axis} out of range for rank {rank}"),
            })?;
        let values = arg_max(read_resident::<f32>(ctx.target(), x)?, dims, axis)?;

        let mut out_dims = dims.to_vec();
        out_dims.remove(axis);
        let out = args.output_mut("Out")?;
        out.resize(out_dims);
        out.mutable_data::<i64>(ctx.target()).copy_from_slice(&values);
        Ok(())
    }
}

fn ensure_same_dims(lhs: &DDim, rhs: &DDim) -> Result<(), KernelError> {
    if lhs != rhs {
        return Err(KernelError::ShapeMismatch {
            lhs: lhs.as_slice().to_vec(),
            rhs: rhs.as_slice().to_vec(),
        });
    }
    Ok(())
}
