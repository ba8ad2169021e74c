#![allow(dead_code)]

use std::ops::Add;
use std::sync::Arc;

use ka_arena::{HarnessEnv, HarnessError, OpScenario};
use ka_core::{Element, LoD, TargetType, Tensor};
use ka_device::{ContextScheduler, HostTransfer, IoDirection, TargetDevice, copy_tensor_sync};
use ka_kernel::KernelRegistry;
use ka_kernels::register_all;
use ka_opdesc::OpDesc;
use ka_scope::ScopeMut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn harness<F>(devices: Vec<Arc<dyn TargetDevice>>, extra_kernels: F) -> HarnessEnv
where
    F: FnOnce(&mut KernelRegistry),
{
    let mut registry = KernelRegistry::new();
    register_all(&mut registry);
    extra_kernels(&mut registry);

    let mut scheduler = ContextScheduler::new();
    for device in devices {
        scheduler.register_device(device);
    }
    HarnessEnv::new(Arc::new(registry), Arc::new(scheduler))
}

pub fn seeded_values(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn case_log_path(tag: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("ka-arena-{}-{tag}.jsonl", std::process::id()))
}

fn reference_nearest(
    src: &[f32],
    [n, c, in_h, in_w]: [usize; 4],
    out_h: usize,
    out_w: usize,
    align_corners: bool,
) -> Vec<f32> {
    let ratio = |in_len: usize, out_len: usize| -> f32 {
        if align_corners {
            if out_len > 1 {
                (in_len - 1) as f32 / (out_len - 1) as f32
            } else {
                0.0
            }
        } else {
            in_len as f32 / out_len as f32
        }
    };
    let source = |ratio: f32, idx: usize, in_len: usize| -> usize {
        let offset = if align_corners { 0.5 } else { 0.0 };
        ((ratio * idx as f32 + offset) as usize).min(in_len - 1)
    };
    let (ratio_h, ratio_w) = (ratio(in_h, out_h), ratio(in_w, out_w));

    let mut out = vec![0.0f32; n * c * out_h * out_w];
    for plane in 0..n * c {
        for y in 0..out_h {
            let iy = source(ratio_h, y, in_h);
            for x in 0..out_w {
                let ix = source(ratio_w, x, in_w);
                out[(plane * out_h + y) * out_w + x] = src[(plane * in_h + iy) * in_w + ix];
            }
        }
    }
    out
}

/// `nearest_interp` over a seeded NCHW input.
pub struct NearestInterpScenario {
    name: String,
    in_dims: [usize; 4],
    out_hw: (usize, usize),
    baseline_hw: Option<(usize, usize)>,
    align_corners: bool,
    seed: u64,
    perturb: Option<(usize, f32)>,
}

impl NearestInterpScenario {
    pub fn new(name: &str, in_dims: [usize; 4], out_hw: (usize, usize)) -> Self {
        Self {
            name: name.to_string(),
            in_dims,
            out_hw,
            baseline_hw: None,
            align_corners: false,
            seed: 0x5eed,
            perturb: None,
        }
    }

    pub fn align_corners(mut self, align_corners: bool) -> Self {
        self.align_corners = align_corners;
        self
    }

    /// Makes the reference compute a different output size.
    pub fn baseline_hw(mut self, hw: (usize, usize)) -> Self {
        self.baseline_hw = Some(hw);
        self
    }

    /// Adds `delta` to one reference element.
    pub fn perturb(mut self, index: usize, delta: f32) -> Self {
        self.perturb = Some((index, delta));
        self
    }

    pub fn boxed(self) -> Box<dyn OpScenario> {
        Box::new(self)
    }
}

impl OpScenario for NearestInterpScenario {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_data(&mut self, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        let len = self.in_dims.iter().product();
        let values = seeded_values(self.seed, len);
        scope.set_common_tensor("x", self.in_dims, &values, LoD::new())?;
        Ok(())
    }

    fn prepare_op_desc(&self, op: &mut OpDesc) -> Result<(), HarnessError> {
        op.set_type("nearest_interp");
        op.set_input("X", ["x"]);
        op.set_output("Out", ["out"]);
        op.set_attr("out_h", self.out_hw.0 as i32);
        op.set_attr("out_w", self.out_hw.1 as i32);
        op.set_attr("align_corners", self.align_corners);
        op.set_attr("interp_method", "nearest".to_string());
        Ok(())
    }

    fn run_baseline(&mut self, op: &OpDesc, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        let x = scope.require_tensor(op.single_input("X")?)?;
        let src = x.data::<f32>()?.to_vec();
        let (out_h, out_w) = self.baseline_hw.unwrap_or(self.out_hw);
        let align_corners = op.attr::<bool>("align_corners")?;
        let mut values = reference_nearest(&src, self.in_dims, out_h, out_w, align_corners);
        if let Some((index, delta)) = self.perturb {
            values[index] += delta;
        }

        let [n, c, _, _] = self.in_dims;
        let out = op.single_output("Out")?.to_owned();
        scope.set_common_tensor(&out, [n, c, out_h, out_w], &values, LoD::new())?;
        Ok(())
    }
}

/// `elementwise_add` with explicit operands.
pub struct ElementwiseAddScenario<T> {
    name: String,
    dims: Vec<usize>,
    x: Vec<T>,
    y: Vec<T>,
    x_lod: LoD,
    baseline_lod: Option<LoD>,
    baseline_target: TargetType,
    baseline_override: Option<(usize, T)>,
    baseline_budget: Option<usize>,
}

impl<T: Element> ElementwiseAddScenario<T> {
    pub fn new(name: &str, dims: Vec<usize>, x: Vec<T>, y: Vec<T>) -> Self {
        Self {
            name: name.to_string(),
            dims,
            x,
            y,
            x_lod: LoD::new(),
            baseline_lod: None,
            baseline_target: TargetType::Host,
            baseline_override: None,
            baseline_budget: None,
        }
    }

    pub fn x_lod(mut self, lod: LoD) -> Self {
        self.x_lod = lod;
        self
    }

    /// Reference output LoD; defaults to the LoD of `X`.
    pub fn baseline_lod(mut self, lod: LoD) -> Self {
        self.baseline_lod = Some(lod);
        self
    }

    pub fn baseline_target(mut self, target: TargetType) -> Self {
        self.baseline_target = target;
        self
    }

    /// Replaces one reference element.
    pub fn baseline_override(mut self, index: usize, value: T) -> Self {
        self.baseline_override = Some((index, value));
        self
    }

    /// The reference succeeds `runs` times, then reports `y` as missing.
    pub fn baseline_budget(mut self, runs: usize) -> Self {
        self.baseline_budget = Some(runs);
        self
    }
}

impl<T> OpScenario for ElementwiseAddScenario<T>
where
    T: Element + Add<Output = T>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_data(&mut self, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        scope.set_common_tensor("x", self.dims.clone(), &self.x, self.x_lod.clone())?;
        scope.set_common_tensor("y", self.dims.clone(), &self.y, LoD::new())?;
        Ok(())
    }

    fn prepare_op_desc(&self, op: &mut OpDesc) -> Result<(), HarnessError> {
        op.set_type("elementwise_add");
        op.set_input("X", ["x"]);
        op.set_input("Y", ["y"]);
        op.set_output("Out", ["out"]);
        op.set_attr("axis", -1i32);
        Ok(())
    }

    fn run_baseline(&mut self, _op: &OpDesc, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        if let Some(remaining) = self.baseline_budget.as_mut() {
            if *remaining == 0 {
                return Err(HarnessError::MissingVariable {
                    scope: "baseline",
                    name: "y".to_string(),
                });
            }
            *remaining -= 1;
        }
        let x = scope.require_tensor("x")?.data::<T>()?.to_vec();
        let y = scope.require_tensor("y")?.data::<T>()?.to_vec();
        let mut sum: Vec<T> = x.into_iter().zip(y).map(|(a, b)| a + b).collect();
        if let Some((index, value)) = self.baseline_override {
            sum[index] = value;
        }
        let lod = self.baseline_lod.clone().unwrap_or_else(|| self.x_lod.clone());

        let out = scope.require_local_tensor_mut("out")?;
        out.resize(self.dims.clone());
        out.set_lod(lod);
        out.mutable_data::<T>(self.baseline_target)
            .copy_from_slice(&sum);
        Ok(())
    }
}

/// `elementwise_add` whose `x` is uploaded to a device before the case starts.
pub struct DeviceInputAddScenario {
    upload: Arc<dyn HostTransfer>,
    x: Vec<f32>,
    y: Vec<f32>,
}

impl DeviceInputAddScenario {
    pub fn new(upload: Arc<dyn HostTransfer>) -> Self {
        Self {
            upload,
            x: seeded_values(11, 6),
            y: seeded_values(12, 6),
        }
    }

    pub fn boxed(self) -> Box<dyn OpScenario> {
        Box::new(self)
    }
}

impl OpScenario for DeviceInputAddScenario {
    fn name(&self) -> &str {
        "add_device_input"
    }

    fn prepare_data(&mut self, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        let host = Tensor::from_host([2, 3], self.x.clone())?;
        let x = scope.new_tensor("x")?;
        copy_tensor_sync(self.upload.as_ref(), x, &host, IoDirection::HostToDevice)?;
        scope.set_common_tensor("y", [2, 3], &self.y, LoD::new())?;
        Ok(())
    }

    fn prepare_op_desc(&self, op: &mut OpDesc) -> Result<(), HarnessError> {
        op.set_type("elementwise_add");
        op.set_input("X", ["x"]);
        op.set_input("Y", ["y"]);
        op.set_output("Out", ["out"]);
        Ok(())
    }

    fn run_baseline(&mut self, _op: &OpDesc, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        let sum: Vec<f32> = self.x.iter().zip(&self.y).map(|(a, b)| a + b).collect();
        scope.set_common_tensor("out", [2, 3], &sum, LoD::new())?;
        Ok(())
    }
}

/// `less_than` producing a bool mask.
pub struct LessThanScenario {
    dims: Vec<usize>,
    seed: u64,
    flip: Option<usize>,
}

impl LessThanScenario {
    pub fn new(dims: Vec<usize>, seed: u64) -> Self {
        Self {
            dims,
            seed,
            flip: None,
        }
    }

    /// Inverts one reference element.
    pub fn flip(mut self, index: usize) -> Self {
        self.flip = Some(index);
        self
    }
}

impl OpScenario for LessThanScenario {
    fn name(&self) -> &str {
        "less_than"
    }

    fn prepare_data(&mut self, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        let len = self.dims.iter().product();
        let x = seeded_values(self.seed, len);
        let y = seeded_values(self.seed + 1, len);
        scope.set_common_tensor("x", self.dims.clone(), &x, LoD::new())?;
        scope.set_common_tensor("y", self.dims.clone(), &y, LoD::new())?;
        Ok(())
    }

    fn prepare_op_desc(&self, op: &mut OpDesc) -> Result<(), HarnessError> {
        op.set_type("less_than");
        op.set_input("X", ["x"]);
        op.set_input("Y", ["y"]);
        op.set_output("Out", ["mask"]);
        Ok(())
    }

    fn run_baseline(&mut self, _op: &OpDesc, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        let x = scope.require_tensor("x")?.data::<f32>()?.to_vec();
        let y = scope.require_tensor("y")?.data::<f32>()?.to_vec();
        let mut mask: Vec<bool> = x.iter().zip(&y).map(|(a, b)| a < b).collect();
        if let Some(index) = self.flip {
            mask[index] = !mask[index];
        }
        scope.set_common_tensor("mask", self.dims.clone(), &mask, LoD::new())?;
        Ok(())
    }
}

/// `arg_max` along the last axis; its `Int64` output has no comparison path.
pub struct ArgMaxScenario;

impl OpScenario for ArgMaxScenario {
    fn name(&self) -> &str {
        "arg_max"
    }

    fn prepare_data(&mut self, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        scope.set_common_tensor("x", [2, 3], &[0.1f32, 0.7, 0.2, 0.9, 0.3, 0.4], LoD::new())?;
        Ok(())
    }

    fn prepare_op_desc(&self, op: &mut OpDesc) -> Result<(), HarnessError> {
        op.set_type("arg_max");
        op.set_input("X", ["x"]);
        op.set_output("Out", ["idx"]);
        op.set_attr("axis", -1i32);
        Ok(())
    }

    fn run_baseline(&mut self, _op: &OpDesc, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError> {
        scope.set_common_tensor("idx", [2], &[1i64, 0], LoD::new())?;
        Ok(())
    }
}
