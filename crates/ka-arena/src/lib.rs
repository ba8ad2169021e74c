#![forbid(unsafe_code)]

//! Differential verification of device kernels against host reference
//! computations.
//!
//! A [`TestCase`] owns a scope tree with two sibling scopes under a shared
//! root: the instruction scope, where the resolved kernel writes, and the
//! baseline scope, where the scenario's reference computation writes. An
//! [`Arena`] drives both and compares every declared output by name.

pub mod logging;

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use ka_core::{Element, LoD, Place, PrecisionType, TargetType, Tensor, TensorError};
use ka_device::{
    ContextScheduler, DeviceError, HostTransfer, IoDirection, KernelContext, copy_tensor_sync,
};
use ka_kernel::{Instruction, Kernel, KernelError, KernelRegistry};
use ka_opdesc::{OpDesc, OpDescError};
use ka_scope::{ScopeError, ScopeId, ScopeMut, ScopeRef, ScopeTree};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use logging::{CaseOutcome, StructuredCaseLog};

pub const DEFAULT_ABS_ERROR: f32 = 1e-5;
pub const DEFAULT_PERF_ITERATIONS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("test case is already prepared")]
    AlreadyPrepared,
    #[error("test case has not been prepared")]
    NotPrepared,
    #[error("variable '{name}' is missing from the {scope} scope")]
    MissingVariable { scope: &'static str, name: String },
    #[error("input slot '{slot}' has no declared type in kernel {kernel}")]
    UndeclaredInput { slot: String, kernel: String },
    #[error("output slot '{slot}' has no declared type in kernel {kernel}")]
    UndeclaredOutput { slot: String, kernel: String },
    #[error("output slot '{slot}' declares unsupported precision {precision}")]
    UnsupportedPrecision {
        slot: String,
        precision: PrecisionType,
    },
    #[error(
        "baseline tensor '{name}' lives on {target}; reference results must be host readable"
    )]
    BaselineNotOnHost { name: String, target: TargetType },
    #[error("no host transfer path registered for {target} (tensor '{name}')")]
    NoTransferPath { target: TargetType, name: String },
    #[error("kernel {kernel} does not match its declaration: {}", .violations.join("; "))]
    KernelDefinition {
        kernel: String,
        violations: Vec<String>,
    },
    #[error("no evaluated case to log")]
    NoCaseRecord,
    #[error("failed to write case log {}: {reason}", .path.display())]
    CaseLog { path: PathBuf, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    OpDesc(#[from] OpDescError),
}

impl HarnessError {
    /// Stable identifier used in structured case logs.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::AlreadyPrepared => "already_prepared",
            Self::NotPrepared => "not_prepared",
            Self::MissingVariable { .. } => "missing_variable",
            Self::UndeclaredInput { .. } => "undeclared_input",
            Self::UndeclaredOutput { .. } => "undeclared_output",
            Self::UnsupportedPrecision { .. } => "unsupported_precision",
            Self::BaselineNotOnHost { .. } => "baseline_not_on_host",
            Self::NoTransferPath { .. } => "no_transfer_path",
            Self::KernelDefinition { .. } => "kernel_definition",
            Self::NoCaseRecord => "no_case_record",
            Self::CaseLog { .. } => "case_log_io",
            Self::Config(_) => "config",
            Self::Device(_) => "device",
            Self::Kernel(KernelError::NoKernel { .. }) => "no_kernel",
            Self::Kernel(_) => "kernel",
            Self::Scope(_) => "scope",
            Self::Tensor(_) => "tensor",
            Self::OpDesc(_) => "op_desc",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid arena config json: {0}")]
    Json(String),
}

pub const ENV_ABS_ERROR: &str = "KA_ARENA_ABS_ERROR";
pub const ENV_PERF_ITERS: &str = "KA_ARENA_PERF_ITERS";
pub const ENV_CASE_LOG: &str = "KA_ARENA_CASE_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub abs_error: f32,
    pub perf_iterations: usize,
    pub case_log_path: Option<PathBuf>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            abs_error: DEFAULT_ABS_ERROR,
            perf_iterations: DEFAULT_PERF_ITERATIONS,
            case_log_path: None,
        }
    }
}

impl ArenaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or
    /// blank variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |var: &str| lookup(var).filter(|raw| !raw.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = read(ENV_ABS_ERROR) {
            config.abs_error = raw.trim().parse().map_err(|error: std::num::ParseFloatError| {
                ConfigError::InvalidValue {
                    var: ENV_ABS_ERROR,
                    value: raw.clone(),
                    reason: error.to_string(),
                }
            })?;
        }
        if let Some(raw) = read(ENV_PERF_ITERS) {
            config.perf_iterations = raw.trim().parse().map_err(|error: std::num::ParseIntError| {
                ConfigError::InvalidValue {
                    var: ENV_PERF_ITERS,
                    value: raw.clone(),
                    reason: error.to_string(),
                }
            })?;
        }
        if let Some(raw) = read(ENV_CASE_LOG) {
            config.case_log_path = Some(PathBuf::from(raw.trim()));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|error| ConfigError::Json(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.abs_error.is_finite() || self.abs_error < 0.0 {
            return Err(ConfigError::InvalidValue {
                var: ENV_ABS_ERROR,
                value: self.abs_error.to_string(),
                reason: "tolerance must be finite and non-negative".to_string(),
            });
        }
        Ok(())
    }
}

/// Shared registries a test case resolves kernels and contexts from.
#[derive(Debug, Clone)]
pub struct HarnessEnv {
    pub kernels: Arc<KernelRegistry>,
    pub scheduler: Arc<ContextScheduler>,
}

impl HarnessEnv {
    #[must_use]
    pub fn new(kernels: Arc<KernelRegistry>, scheduler: Arc<ContextScheduler>) -> Self {
        Self { kernels, scheduler }
    }
}

/// Operator-specific hooks a [`TestCase`] calls while preparing and running.
pub trait OpScenario: Send {
    /// Identifier for logs and case records.
    fn name(&self) -> &str;

    /// Populates input tensors in the root scope.
    fn prepare_data(&mut self, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError>;

    /// Fills the operator type, slot bindings and attributes.
    fn prepare_op_desc(&self, op: &mut OpDesc) -> Result<(), HarnessError>;

    /// Writes reference outputs into the baseline scope. Inputs resolve
    /// through the root scope.
    fn run_baseline(&mut self, op: &OpDesc, scope: &mut ScopeMut<'_>) -> Result<(), HarnessError>;
}

pub struct TestCase {
    place: Place,
    alias: String,
    scenario: Box<dyn OpScenario>,
    env: HarnessEnv,
    tree: ScopeTree,
    inst_scope: Option<ScopeId>,
    base_scope: Option<ScopeId>,
    op_desc: OpDesc,
    ctx: Option<KernelContext>,
    instruction: Option<Instruction>,
    prepared: bool,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("scenario", &self.scenario.name())
            .field("place", &self.place)
            .field("alias", &self.alias)
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

impl TestCase {
    /// Binds `place` and acquires the kernel context the instruction will own.
    pub fn new(
        place: Place,
        alias: impl Into<String>,
        scenario: Box<dyn OpScenario>,
        env: HarnessEnv,
    ) -> Result<Self, HarnessError> {
        let ctx = env.scheduler.new_context(place.target)?;
        Ok(Self {
            place,
            alias: alias.into(),
            scenario,
            env,
            tree: ScopeTree::new(),
            inst_scope: None,
            base_scope: None,
            op_desc: OpDesc::default(),
            ctx: Some(ctx),
            instruction: None,
            prepared: false,
        })
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.alias
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.scenario.name()
    }

    #[must_use]
    pub fn op_desc(&self) -> &OpDesc {
        &self.op_desc
    }

    #[must_use]
    pub fn instruction(&self) -> Option<&Instruction> {
        self.instruction.as_ref()
    }

    /// The kernel context, held by the test case until `prepare` moves it into
    /// the instruction.
    #[must_use]
    pub fn context(&self) -> Option<&KernelContext> {
        self.instruction
            .as_ref()
            .map(Instruction::context)
            .or(self.ctx.as_ref())
    }

    #[must_use]
    pub fn scope_tree(&self) -> &ScopeTree {
        &self.tree
    }

    /// The root scope holding shared inputs.
    pub fn scope(&self) -> Result<ScopeRef<'_>, HarnessError> {
        Ok(self.tree.scope(self.tree.root())?)
    }

    pub fn inst_scope(&self) -> Result<ScopeRef<'_>, HarnessError> {
        let id = self.inst_scope.ok_or(HarnessError::NotPrepared)?;
        Ok(self.tree.scope(id)?)
    }

    pub fn baseline_scope(&self) -> Result<ScopeRef<'_>, HarnessError> {
        let id = self.base_scope.ok_or(HarnessError::NotPrepared)?;
        Ok(self.tree.scope(id)?)
    }

    /// Builds scopes, inputs, the operator description and the instruction.
    /// Runs at most once.
    pub fn prepare(&mut self) -> Result<(), HarnessError> {
        if self.prepared {
            return Err(HarnessError::AlreadyPrepared);
        }
        self.prepared = true;

        let root = self.tree.root();
        let inst = self.tree.new_scope(root)?;
        let base = self.tree.new_scope(root)?;
        self.inst_scope = Some(inst);
        self.base_scope = Some(base);

        self.scenario.prepare_data(&mut self.tree.scope_mut(root)?)?;

        let mut op = OpDesc::default();
        self.scenario.prepare_op_desc(&mut op)?;

        for var in op.output_vars() {
            self.tree.new_tensor(inst, var)?;
            self.tree.new_tensor(base, var)?;
        }

        let kernel = self
            .env
            .kernels
            .require(op.op_type(), &self.place, &self.alias)?;
        let ctx = self.ctx.take().ok_or(HarnessError::AlreadyPrepared)?;
        debug!(
            case = self.scenario.name(),
            kernel = %kernel.key(),
            "resolved kernel"
        );

        stage_inputs(&mut self.tree, &self.env.scheduler, &op, kernel.as_ref(), inst)?;

        self.instruction = Some(Instruction::new(op.clone(), kernel, ctx));
        self.op_desc = op;
        Ok(())
    }

    /// Runs the instruction once; its stream is drained before returning.
    pub fn run_instruction(&mut self) -> Result<(), HarnessError> {
        let inst = self.inst_scope.ok_or(HarnessError::NotPrepared)?;
        let instruction = self.instruction.as_mut().ok_or(HarnessError::NotPrepared)?;
        instruction.run(&mut self.tree, inst)?;
        Ok(())
    }

    pub fn run_baseline(&mut self) -> Result<(), HarnessError> {
        let base = self.base_scope.ok_or(HarnessError::NotPrepared)?;
        let mut scope = self.tree.scope_mut(base)?;
        self.scenario.run_baseline(&self.op_desc, &mut scope)
    }

    /// Lists every way the instruction's outputs disagree with the resolved
    /// kernel's declared output types.
    pub fn check_kernel_consist_with_definition(&self) -> Result<Vec<String>, HarnessError> {
        let inst = self.inst_scope.ok_or(HarnessError::NotPrepared)?;
        let instruction = self.instruction.as_ref().ok_or(HarnessError::NotPrepared)?;
        let kernel = instruction.kernel();

        let mut violations = Vec::new();
        for slot in self.op_desc.output_argument_names() {
            let Some(decl) = kernel.output_decl_type(slot) else {
                violations.push(format!("output slot '{slot}' has no declared type"));
                continue;
            };
            for var in self.op_desc.output(slot) {
                let Some(tensor) = self.tree.find_local_tensor(inst, var) else {
                    violations.push(format!(
                        "output '{var}' is missing from the instruction scope"
                    ));
                    continue;
                };
                let Some(precision) = tensor.precision() else {
                    violations.push(format!("output '{var}' was never written"));
                    continue;
                };
                if decl.precision != PrecisionType::Any && precision != decl.precision {
                    violations.push(format!(
                        "output '{var}' holds {precision}, slot '{slot}' declares {}",
                        decl.precision
                    ));
                }
                let target = tensor.target();
                if needs_transfer(decl.target, target) {
                    violations.push(format!(
                        "output '{var}' lives on {target}, slot '{slot}' declares {}",
                        decl.target
                    ));
                }
            }
        }
        Ok(violations)
    }

    fn local_tensor(
        &self,
        scope: Option<ScopeId>,
        label: &'static str,
        name: &str,
    ) -> Result<&Tensor, HarnessError> {
        let id = scope.ok_or(HarnessError::NotPrepared)?;
        self.tree
            .find_local_tensor(id, name)
            .ok_or_else(|| HarnessError::MissingVariable {
                scope: label,
                name: name.to_owned(),
            })
    }
}

/// Whether data on `current` must move before a kernel declaring `declared`
/// can read it.
fn needs_transfer(declared: TargetType, current: TargetType) -> bool {
    !declared.can_read(current)
}

fn transfer_for(
    scheduler: &ContextScheduler,
    target: TargetType,
    name: &str,
) -> Result<Arc<dyn HostTransfer>, HarnessError> {
    scheduler
        .host_transfer(target)
        .ok_or_else(|| HarnessError::NoTransferPath {
            target,
            name: name.to_owned(),
        })
}

/// Makes every input readable on the target its slot declares. Moved copies
/// shadow the original in the instruction scope; the root scope is never
/// written.
fn stage_inputs(
    tree: &mut ScopeTree,
    scheduler: &ContextScheduler,
    op: &OpDesc,
    kernel: &dyn Kernel,
    inst: ScopeId,
) -> Result<(), HarnessError> {
    for slot in op.input_argument_names() {
        let decl = kernel
            .input_decl_type(slot)
            .ok_or_else(|| HarnessError::UndeclaredInput {
                slot: slot.to_owned(),
                kernel: kernel.key().to_string(),
            })?;
        for var in op.input(slot) {
            let source = tree
                .find_tensor(inst, var)
                .ok_or_else(|| HarnessError::MissingVariable {
                    scope: "instruction",
                    name: var.clone(),
                })?;
            let current = source.target();
            if !needs_transfer(decl.target, current) {
                continue;
            }

            let mut staged = Tensor::new();
            if current.is_host_readable() {
                let transfer = transfer_for(scheduler, decl.target, var)?;
                copy_tensor_sync(
                    transfer.as_ref(),
                    &mut staged,
                    source,
                    IoDirection::HostToDevice,
                )?;
            } else {
                let download = transfer_for(scheduler, current, var)?;
                copy_tensor_sync(
                    download.as_ref(),
                    &mut staged,
                    source,
                    IoDirection::DeviceToHost,
                )?;
                if !decl.target.is_host_readable() {
                    let upload = transfer_for(scheduler, decl.target, var)?;
                    let host = std::mem::take(&mut staged);
                    copy_tensor_sync(
                        upload.as_ref(),
                        &mut staged,
                        &host,
                        IoDirection::HostToDevice,
                    )?;
                }
            }
            debug!(var = var.as_str(), from = %current, to = %staged.target(), "staged input");
            *tree.new_tensor(inst, var)? = staged;
        }
    }
    Ok(())
}

/// Output precisions the comparison understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparePrecision {
    Float,
    Int8,
    Int32,
    Bool,
}

impl ComparePrecision {
    #[must_use]
    pub fn from_precision(precision: PrecisionType) -> Option<Self> {
        match precision {
            PrecisionType::Float => Some(Self::Float),
            PrecisionType::Int8 => Some(Self::Int8),
            PrecisionType::Int32 => Some(Self::Int32),
            PrecisionType::Bool => Some(Self::Bool),
            _ => None,
        }
    }
}

/// Element types that can be compared under an absolute tolerance.
pub trait CompareElement: Element {
    const COMPARE: ComparePrecision;

    fn to_f64(self) -> f64;
}

impl CompareElement for f32 {
    const COMPARE: ComparePrecision = ComparePrecision::Float;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl CompareElement for i8 {
    const COMPARE: ComparePrecision = ComparePrecision::Int8;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl CompareElement for i32 {
    const COMPARE: ComparePrecision = ComparePrecision::Int32;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }
}

impl CompareElement for bool {
    const COMPARE: ComparePrecision = ComparePrecision::Bool;

    fn to_f64(self) -> f64 {
        f64::from(u8::from(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementMismatch {
    pub index: usize,
    pub instruction: f64,
    pub baseline: f64,
}

/// Row-major elementwise comparison. NaN on either side is always a mismatch.
#[must_use]
pub fn compare_values<T: CompareElement>(
    instruction: &[T],
    baseline: &[T],
    abs_error: f32,
) -> Vec<ElementMismatch> {
    let tolerance = f64::from(abs_error);
    instruction
        .iter()
        .zip(baseline)
        .enumerate()
        .filter_map(|(index, (&a, &b))| {
            let (a, b) = (a.to_f64(), b.to_f64());
            let within = (a - b).abs() <= tolerance;
            (!within).then_some(ElementMismatch {
                index,
                instruction: a,
                baseline: b,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ComparisonOutcome {
    Passed,
    ShapeMismatch {
        instruction: Vec<usize>,
        baseline: Vec<usize>,
    },
    LodMismatch { instruction: LoD, baseline: LoD },
    ValueMismatch { count: usize },
}

/// Result of comparing one output variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TensorComparison {
    pub slot: String,
    pub var: String,
    pub precision: ComparePrecision,
    pub elements: usize,
    pub outcome: ComparisonOutcome,
    pub mismatches: Vec<ElementMismatch>,
}

impl TensorComparison {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == ComparisonOutcome::Passed
    }

    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self.outcome {
            ComparisonOutcome::Passed => "ok",
            ComparisonOutcome::ShapeMismatch { .. } => "shape_mismatch",
            ComparisonOutcome::LodMismatch { .. } => "lod_mismatch",
            ComparisonOutcome::ValueMismatch { .. } => "value_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrecisionReport {
    pub case_id: String,
    pub op_type: String,
    pub place: Place,
    pub abs_error: f32,
    pub comparisons: Vec<TensorComparison>,
}

impl PrecisionReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.comparisons.iter().all(TensorComparison::passed)
    }

    #[must_use]
    pub fn mismatch_count(&self) -> usize {
        self.comparisons
            .iter()
            .map(|comparison| match comparison.outcome {
                ComparisonOutcome::Passed => 0,
                ComparisonOutcome::ValueMismatch { count } => count,
                _ => 1,
            })
            .sum()
    }

    /// Reason code of the first failing output, or `ok`.
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        self.comparisons
            .iter()
            .find(|comparison| !comparison.passed())
            .map_or("ok", TensorComparison::reason_code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerfReport {
    pub iterations: usize,
    pub total_ns: u128,
    pub mean_ns: u128,
    pub p50_ns: u128,
    pub p95_ns: u128,
    pub p99_ns: u128,
}

fn percentile(samples: &[u128], p: usize) -> u128 {
    if samples.is_empty() {
        return 0;
    }
    let clamped = p.min(100);
    let idx = ((samples.len() - 1) * clamped) / 100;
    samples[idx]
}

/// Drives one prepared [`TestCase`] and compares its outputs.
#[derive(Debug)]
pub struct Arena {
    test_case: TestCase,
    place: Place,
    abs_error: f32,
    perf_iterations: usize,
    case_log_path: Option<PathBuf>,
    report: Option<PrecisionReport>,
    last_case: Option<StructuredCaseLog>,
}

impl Arena {
    /// Takes ownership of `test_case` and prepares it. `abs_error` must be
    /// finite and non-negative.
    pub fn new(test_case: TestCase, place: Place, abs_error: f32) -> Result<Self, HarnessError> {
        let config = ArenaConfig {
            abs_error,
            ..ArenaConfig::default()
        };
        Self::build(test_case, place, &config)
    }

    pub fn with_config(test_case: TestCase, config: &ArenaConfig) -> Result<Self, HarnessError> {
        let place = test_case.place();
        Self::build(test_case, place, config)
    }

    fn build(
        mut test_case: TestCase,
        place: Place,
        config: &ArenaConfig,
    ) -> Result<Self, HarnessError> {
        config.validate()?;
        test_case.prepare()?;
        Ok(Self {
            test_case,
            place,
            abs_error: config.abs_error,
            perf_iterations: config.perf_iterations,
            case_log_path: config.case_log_path.clone(),
            report: None,
            last_case: None,
        })
    }

    #[must_use]
    pub fn test_case(&self) -> &TestCase {
        &self.test_case
    }

    #[must_use]
    pub fn place(&self) -> Place {
        self.place
    }

    #[must_use]
    pub fn abs_error(&self) -> f32 {
        self.abs_error
    }

    #[must_use]
    pub fn perf_iterations(&self) -> usize {
        self.perf_iterations
    }

    /// Report behind the most recent `test_precision`; `None` when that run
    /// errored.
    #[must_use]
    pub fn precision_report(&self) -> Option<&PrecisionReport> {
        self.report.as_ref()
    }

    #[must_use]
    pub fn last_case_log(&self) -> Option<&StructuredCaseLog> {
        self.last_case.as_ref()
    }

    /// Runs the baseline and the instruction, then compares every declared
    /// output. A mismatch is `Ok(false)`; configuration problems are errors.
    /// A case log that cannot be written is reported but never changes the
    /// verdict.
    pub fn test_precision(&mut self) -> Result<bool, HarnessError> {
        self.report = None;
        let started = Instant::now();
        let evaluated = self.evaluate();
        let duration_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        let case = match &evaluated {
            Ok(report) => {
                let outcome = if report.passed() {
                    CaseOutcome::Pass
                } else {
                    CaseOutcome::Fail
                };
                self.case_log(outcome, report.reason_code())
                    .with_counts(report.comparisons.len(), report.mismatch_count())
            }
            Err(error) => self.case_log(CaseOutcome::Error, error.reason_code()),
        }
        .with_duration_us(duration_us);
        self.last_case = Some(case);
        if let Some(path) = self.case_log_path.clone() {
            if let Err(error) = self.emit_case_log(&path) {
                warn!(path = %path.display(), %error, "case log not written");
            }
        }

        let report = evaluated?;
        let passed = report.passed();
        if passed {
            info!(
                case = self.test_case.name(),
                place = %self.place,
                outputs = report.comparisons.len(),
                "precision check passed"
            );
        } else {
            warn!(
                case = self.test_case.name(),
                place = %self.place,
                reason = report.reason_code(),
                mismatches = report.mismatch_count(),
                "precision check failed"
            );
        }
        self.report = Some(report);
        Ok(passed)
    }

    fn evaluate(&mut self) -> Result<PrecisionReport, HarnessError> {
        self.test_case.run_baseline()?;
        self.test_case.run_instruction()?;

        let violations = self.test_case.check_kernel_consist_with_definition()?;
        if !violations.is_empty() {
            let kernel = self
                .test_case
                .instruction()
                .map(|instruction| instruction.kernel().key().to_string())
                .unwrap_or_default();
            return Err(HarnessError::KernelDefinition { kernel, violations });
        }

        let op = self.test_case.op_desc();
        let mut comparisons = Vec::new();
        for slot in op.output_argument_names() {
            for var in op.output(slot) {
                comparisons.push(self.compare_tensor(slot, var)?);
            }
        }
        Ok(PrecisionReport {
            case_id: self.test_case.name().to_owned(),
            op_type: op.op_type().to_owned(),
            place: self.place,
            abs_error: self.abs_error,
            comparisons,
        })
    }

    /// Compares `var_name` using the precision the kernel declares for
    /// `arg_name`.
    pub fn compare_tensor(
        &self,
        arg_name: &str,
        var_name: &str,
    ) -> Result<TensorComparison, HarnessError> {
        let instruction = self
            .test_case
            .instruction()
            .ok_or(HarnessError::NotPrepared)?;
        let kernel = instruction.kernel();
        let decl = kernel
            .output_decl_type(arg_name)
            .ok_or_else(|| HarnessError::UndeclaredOutput {
                slot: arg_name.to_owned(),
                kernel: kernel.key().to_string(),
            })?;
        let precision = ComparePrecision::from_precision(decl.precision).ok_or_else(|| {
            HarnessError::UnsupportedPrecision {
                slot: arg_name.to_owned(),
                precision: decl.precision,
            }
        })?;

        let mut comparison = match precision {
            ComparePrecision::Float => self.check_precision::<f32>(var_name, self.abs_error),
            ComparePrecision::Int8 => self.check_precision::<i8>(var_name, self.abs_error),
            ComparePrecision::Int32 => self.check_precision::<i32>(var_name, self.abs_error),
            ComparePrecision::Bool => self.check_precision::<bool>(var_name, self.abs_error),
        }?;
        comparison.slot = arg_name.to_owned();
        Ok(comparison)
    }

    /// Compares the instruction and baseline tensors named `var_name` as `T`.
    /// Shape and LoD are checked before any value is read.
    pub fn check_precision<T: CompareElement>(
        &self,
        var_name: &str,
        abs_error: f32,
    ) -> Result<TensorComparison, HarnessError> {
        let case = &self.test_case;
        let inst = case.local_tensor(case.inst_scope, "instruction", var_name)?;
        let base = case.local_tensor(case.base_scope, "baseline", var_name)?;

        let mut comparison = TensorComparison {
            slot: String::new(),
            var: var_name.to_owned(),
            precision: T::COMPARE,
            elements: inst.numel(),
            outcome: ComparisonOutcome::Passed,
            mismatches: Vec::new(),
        };

        if inst.dims() != base.dims() {
            warn!(
                var = var_name,
                instruction = %inst.dims(),
                baseline = %base.dims(),
                "shape mismatch"
            );
            comparison.outcome = ComparisonOutcome::ShapeMismatch {
                instruction: inst.dims().as_slice().to_vec(),
                baseline: base.dims().as_slice().to_vec(),
            };
            return Ok(comparison);
        }
        if inst.lod() != base.lod() {
            warn!(
                var = var_name,
                instruction = ?inst.lod(),
                baseline = ?base.lod(),
                "lod mismatch"
            );
            comparison.outcome = ComparisonOutcome::LodMismatch {
                instruction: inst.lod().clone(),
                baseline: base.lod().clone(),
            };
            return Ok(comparison);
        }
        if !base.target().is_host_readable() {
            return Err(HarnessError::BaselineNotOnHost {
                name: var_name.to_owned(),
                target: base.target(),
            });
        }

        let downloaded;
        let host_view = if inst.target().is_host_readable() {
            inst
        } else {
            let transfer = transfer_for(&case.env.scheduler, inst.target(), var_name)?;
            let mut host = Tensor::new();
            copy_tensor_sync(transfer.as_ref(), &mut host, inst, IoDirection::DeviceToHost)?;
            downloaded = host;
            &downloaded
        };

        let mismatches = compare_values(host_view.data::<T>()?, base.data::<T>()?, abs_error);
        for mismatch in &mismatches {
            warn!(
                var = var_name,
                index = mismatch.index,
                instruction = mismatch.instruction,
                baseline = mismatch.baseline,
                abs_error,
                "value mismatch"
            );
        }
        if !mismatches.is_empty() {
            comparison.outcome = ComparisonOutcome::ValueMismatch {
                count: mismatches.len(),
            };
        }
        comparison.mismatches = mismatches;
        Ok(comparison)
    }

    /// Runs the instruction `times` times back to back and reports the timing.
    pub fn test_performance(&mut self, times: usize) -> Result<PerfReport, HarnessError> {
        let mut samples = Vec::with_capacity(times);
        let started = Instant::now();
        for _ in 0..times {
            let iteration = Instant::now();
            self.test_case.run_instruction()?;
            samples.push(iteration.elapsed().as_nanos());
        }
        let total_ns = started.elapsed().as_nanos();

        samples.sort_unstable();
        let mean_ns = if times == 0 {
            0
        } else {
            total_ns / times as u128
        };
        let report = PerfReport {
            iterations: times,
            total_ns,
            mean_ns,
            p50_ns: percentile(&samples, 50),
            p95_ns: percentile(&samples, 95),
            p99_ns: percentile(&samples, 99),
        };
        info!(
            case = self.test_case.name(),
            op = self.test_case.op_desc().op_type(),
            place = %self.place,
            iterations = times,
            avg_ms = mean_ns as f64 / 1e6,
            "performance"
        );
        Ok(report)
    }

    /// Appends the record of the last evaluated case to `path` as one JSON line.
    pub fn emit_case_log(&self, path: &Path) -> Result<(), HarnessError> {
        let case = self.last_case.as_ref().ok_or(HarnessError::NoCaseRecord)?;
        let io_error = |reason: String| HarnessError::CaseLog {
            path: path.to_path_buf(),
            reason,
        };
        let line = case.to_json_line().map_err(|error| io_error(error.to_string()))?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|error| io_error(error.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|error| io_error(error.to_string()))?;
        writeln!(file, "{line}").map_err(|error| io_error(error.to_string()))
    }

    fn case_log(&self, outcome: CaseOutcome, reason_code: &str) -> StructuredCaseLog {
        StructuredCaseLog::new(
            self.test_case.name(),
            self.test_case.op_desc().op_type(),
            self.place.to_string(),
            self.test_case.alias(),
            outcome,
            reason_code,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ka_core::{PrecisionType, TargetType};
    use proptest::prelude::*;

    use super::{
        ArenaConfig, ComparePrecision, ComparisonOutcome, ConfigError, ENV_ABS_ERROR,
        ENV_CASE_LOG, ENV_PERF_ITERS, HarnessError, PrecisionReport, TensorComparison,
        compare_values, needs_transfer, percentile,
    };

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn config_defaults_when_unset() {
        let config = ArenaConfig::from_lookup(lookup(&[])).expect("defaults");
        assert_eq!(config, ArenaConfig::default());
        assert_eq!(config.abs_error, 1e-5);
        assert_eq!(config.perf_iterations, 100);
        assert!(config.case_log_path.is_none());
    }

    #[test]
    fn config_reads_overrides() {
        let config = ArenaConfig::from_lookup(lookup(&[
            (ENV_ABS_ERROR, "0.001"),
            (ENV_PERF_ITERS, " 7 "),
            (ENV_CASE_LOG, "target/cases.jsonl"),
        ]))
        .expect("overrides");
        assert_eq!(config.abs_error, 0.001);
        assert_eq!(config.perf_iterations, 7);
        assert_eq!(
            config.case_log_path.as_deref(),
            Some(std::path::Path::new("target/cases.jsonl"))
        );
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = ArenaConfig::from_lookup(lookup(&[(ENV_PERF_ITERS, "many")]))
            .expect_err("non-numeric iterations");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: ENV_PERF_ITERS,
                ..
            }
        ));
        assert!(ArenaConfig::from_lookup(lookup(&[(ENV_ABS_ERROR, "-1")])).is_err());
        assert!(ArenaConfig::from_lookup(lookup(&[(ENV_ABS_ERROR, "NaN")])).is_err());
    }

    #[test]
    fn config_from_json_fills_defaults() {
        let config = ArenaConfig::from_json_str(r#"{"abs_error": 0.01}"#).expect("json");
        assert_eq!(config.abs_error, 0.01);
        assert_eq!(config.perf_iterations, 100);
        assert!(matches!(
            ArenaConfig::from_json_str("{"),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn compare_precision_is_closed() {
        assert_eq!(
            ComparePrecision::from_precision(PrecisionType::Float),
            Some(ComparePrecision::Float)
        );
        assert_eq!(
            ComparePrecision::from_precision(PrecisionType::Bool),
            Some(ComparePrecision::Bool)
        );
        for unsupported in [
            PrecisionType::Int64,
            PrecisionType::Fp16,
            PrecisionType::UInt8,
            PrecisionType::Any,
        ] {
            assert_eq!(ComparePrecision::from_precision(unsupported), None);
        }
    }

    #[test]
    fn nan_never_passes() {
        let mismatches = compare_values(&[f32::NAN, 1.0], &[f32::NAN, 1.0], 1e-5);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].index, 0);
        assert_eq!(compare_values(&[f32::NAN], &[0.0f32], 1e3).len(), 1);
    }

    #[test]
    fn bool_compares_as_zero_one() {
        let mismatches = compare_values(&[true, false, true], &[true, true, true], 0.5);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].instruction, 0.0);
        assert_eq!(mismatches[0].baseline, 1.0);
        assert!(compare_values(&[true], &[false], 1.0).is_empty());
    }

    #[test]
    fn empty_slices_pass() {
        assert!(compare_values::<i32>(&[], &[], 0.0).is_empty());
    }

    #[test]
    fn transfer_rule_skips_host_family_and_any() {
        assert!(!needs_transfer(TargetType::Any, TargetType::Host));
        assert!(!needs_transfer(TargetType::X86, TargetType::Host));
        assert!(!needs_transfer(TargetType::Cuda, TargetType::Cuda));
        assert!(needs_transfer(TargetType::Cuda, TargetType::Host));
        assert!(needs_transfer(TargetType::Host, TargetType::Cuda));
        assert!(needs_transfer(TargetType::OpenCL, TargetType::Cuda));
    }

    #[test]
    fn percentile_indexes_sorted_samples() {
        let samples = [10u128, 20, 30, 40, 50];
        assert_eq!(percentile(&samples, 0), 10);
        assert_eq!(percentile(&samples, 50), 30);
        assert_eq!(percentile(&samples, 99), 40);
        assert_eq!(percentile(&samples, 100), 50);
        assert_eq!(percentile(&[], 50), 0);
    }

    #[test]
    fn report_counts_every_failing_output() {
        let comparison = |outcome| TensorComparison {
            slot: "Out".to_string(),
            var: "out".to_string(),
            precision: ComparePrecision::Float,
            elements: 4,
            outcome,
            mismatches: Vec::new(),
        };
        let report = PrecisionReport {
            case_id: "case".to_string(),
            op_type: "op".to_string(),
            place: ka_core::Place::host(),
            abs_error: 1e-5,
            comparisons: vec![
                comparison(ComparisonOutcome::Passed),
                comparison(ComparisonOutcome::ValueMismatch { count: 3 }),
                comparison(ComparisonOutcome::ShapeMismatch {
                    instruction: vec![2],
                    baseline: vec![3],
                }),
            ],
        };
        assert!(!report.passed());
        assert_eq!(report.mismatch_count(), 4);
        assert_eq!(report.reason_code(), "value_mismatch");
    }

    #[test]
    fn error_reason_codes_are_stable() {
        assert_eq!(HarnessError::NotPrepared.reason_code(), "not_prepared");
        let err = HarnessError::NoTransferPath {
            target: TargetType::Npu,
            name: "out".to_string(),
        };
        assert_eq!(err.reason_code(), "no_transfer_path");
        assert!(err.to_string().contains("Npu"));
    }

    proptest! {
        #[test]
        fn prop_within_tolerance_passes(
            values in prop::collection::vec(-100.0f32..100.0, 0..64),
            delta in 0.0f32..0.0025,
        ) {
            let shifted: Vec<f32> = values.iter().map(|v| v + delta).collect();
            prop_assert!(compare_values(&shifted, &values, 1e-2).is_empty());
        }

        #[test]
        fn prop_beyond_tolerance_fails_everywhere(
            values in prop::collection::vec(-100.0f32..100.0, 1..64),
            delta in 0.02f32..1.0,
        ) {
            let shifted: Vec<f32> = values.iter().map(|v| v + delta).collect();
            let mismatches = compare_values(&shifted, &values, 1e-2);
            prop_assert_eq!(mismatches.len(), values.len());
        }

        #[test]
        fn prop_integer_tolerance_is_exact_below_one(
            values in prop::collection::vec(any::<i32>(), 0..32),
        ) {
            prop_assert!(compare_values(&values, &values, 0.0).is_empty());
        }
    }
}
