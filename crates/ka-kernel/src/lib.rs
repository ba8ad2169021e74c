#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use ka_core::{DataLayoutType, Place, PrecisionType, TargetType, Tensor, TensorError};
use ka_device::{DeviceError, KernelContext};
use ka_opdesc::{OpDesc, OpDescError};
use ka_scope::{ScopeError, ScopeId, ScopeTree};
use tracing::debug;

/// Declared residency and element type of one kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamType {
    pub target: TargetType,
    pub precision: PrecisionType,
    pub layout: DataLayoutType,
}

impl ParamType {
    #[must_use]
    pub const fn new(target: TargetType, precision: PrecisionType, layout: DataLayoutType) -> Self {
        Self {
            target,
            precision,
            layout,
        }
    }

    #[must_use]
    pub const fn host(precision: PrecisionType) -> Self {
        Self::new(TargetType::Host, precision, DataLayoutType::Nchw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub op_type: String,
    pub place: Place,
    pub alias: String,
}

impl KernelKey {
    #[must_use]
    pub fn new(op_type: impl Into<String>, place: Place, alias: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            place,
            alias: alias.into(),
        }
    }

    /// Whether this kernel can serve a request for `(op_type, place, alias)`.
    /// An empty requested alias accepts any kernel alias.
    #[must_use]
    pub fn matches(&self, op_type: &str, place: &Place, alias: &str) -> bool {
        let precision_ok =
            self.place.precision == place.precision || self.place.precision == PrecisionType::Any;
        let layout_ok =
            self.place.layout == place.layout || self.place.layout == DataLayoutType::Any;
        self.op_type == op_type
            && self.place.target == place.target
            && precision_ok
            && layout_ok
            && (alias.is_empty() || self.alias == alias)
    }
}

impl fmt::Display for KernelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.op_type, self.place)?;
        if !self.alias.is_empty() {
            write!(f, "/{}", self.alias)?;
        }
        Ok(())
    }
}

/// Per-slot declared types of a kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelSignature {
    inputs: BTreeMap<String, ParamType>,
    outputs: BTreeMap<String, ParamType>,
}

impl KernelSignature {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn input(mut self, slot: impl Into<String>, ty: ParamType) -> Self {
        self.inputs.insert(slot.into(), ty);
        self
    }

    #[must_use]
    pub fn output(mut self, slot: impl Into<String>, ty: ParamType) -> Self {
        self.outputs.insert(slot.into(), ty);
        self
    }

    #[must_use]
    pub fn input_type(&self, slot: &str) -> Option<ParamType> {
        self.inputs.get(slot).copied()
    }

    #[must_use]
    pub fn output_type(&self, slot: &str) -> Option<ParamType> {
        self.outputs.get(slot).copied()
    }

    #[must_use]
    pub fn output_slots(&self) -> Vec<&str> {
        self.outputs.keys().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    #[error("no kernel registered for '{op_type}' on {place} (alias '{alias}')")]
    NoKernel {
        op_type: String,
        place: Place,
        alias: String,
    },
    #[error("kernel argument {direction} slot '{slot}' is not bound")]
    MissingArgument {
        direction: &'static str,
        slot: String,
    },
    #[error("shape mismatch: lhs={lhs:?}, rhs={rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    #[error("invalid kernel argument: {reason}")]
    InvalidArgument { reason: String },
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    OpDesc(#[from] OpDescError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}

/// Tensors bound to a kernel invocation: shared borrows of inputs, owned
/// outputs that the instruction moves back into its scope afterwards.
#[derive(Debug)]
pub struct KernelArgs<'a> {
    inputs: BTreeMap<String, Vec<&'a Tensor>>,
    outputs: &'a mut BTreeMap<String, Vec<Tensor>>,
}

impl<'a> KernelArgs<'a> {
    #[must_use]
    pub fn new(
        inputs: BTreeMap<String, Vec<&'a Tensor>>,
        outputs: &'a mut BTreeMap<String, Vec<Tensor>>,
    ) -> Self {
        Self { inputs, outputs }
    }

    #[must_use]
    pub fn has_input(&self, slot: &str) -> bool {
        self.inputs.get(slot).is_some_and(|bound| !bound.is_empty())
    }

    pub fn input(&self, slot: &str) -> Result<&'a Tensor, KernelError> {
        self.inputs
            .get(slot)
            .and_then(|bound| bound.first().copied())
            .ok_or_else(|| KernelError::MissingArgument {
                direction: "input",
                slot: slot.to_owned(),
            })
    }

    #[must_use]
    pub fn inputs(&self, slot: &str) -> &[&'a Tensor] {
        self.inputs.get(slot).map_or(&[], Vec::as_slice)
    }

    pub fn output_mut(&mut self, slot: &str) -> Result<&mut Tensor, KernelError> {
        self.outputs
            .get_mut(slot)
            .and_then(|bound| bound.first_mut())
            .ok_or_else(|| KernelError::MissingArgument {
                direction: "output",
                slot: slot.to_owned(),
            })
    }
}

pub trait Kernel: fmt::Debug + Send {
    fn key(&self) -> &KernelKey;

    fn signature(&self) -> &KernelSignature;

    fn input_decl_type(&self, slot: &str) -> Option<ParamType> {
        self.signature().input_type(slot)
    }

    fn output_decl_type(&self, slot: &str) -> Option<ParamType> {
        self.signature().output_type(slot)
    }

    fn run(
        &self,
        ctx: &mut KernelContext,
        op: &OpDesc,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), KernelError>;
}

type KernelFactory = Box<dyn Fn() -> Box<dyn Kernel> + Send + Sync>;

struct RegistryEntry {
    key: KernelKey,
    factory: KernelFactory,
}

/// Kernel implementations by `(op_type, place, alias)`. Resolution returns the
/// first registered match.
#[derive(Default)]
pub struct KernelRegistry {
    entries: Vec<RegistryEntry>,
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("kernels", &self.entries.iter().map(|entry| &entry.key).collect::<Vec<_>>())
            .finish()
    }
}

impl KernelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        let key = factory().key().clone();
        debug!(kernel = %key, "registered kernel");
        self.entries.push(RegistryEntry {
            key,
            factory: Box::new(factory),
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn resolve(&self, op_type: &str, place: &Place, alias: &str) -> Option<Box<dyn Kernel>> {
        self.entries
            .iter()
            .find(|entry| entry.key.matches(op_type, place, alias))
            .map(|entry| (entry.factory)())
    }

    pub fn require(
        &self,
        op_type: &str,
        place: &Place,
        alias: &str,
    ) -> Result<Box<dyn Kernel>, KernelError> {
        self.resolve(op_type, place, alias)
            .ok_or_else(|| KernelError::NoKernel {
                op_type: op_type.to_owned(),
                place: *place,
                alias: alias.to_owned(),
            })
    }

    #[must_use]
    pub fn kernel_keys(&self, op_type: &str) -> Vec<&KernelKey> {
        self.entries
            .iter()
            .filter(|entry| entry.key.op_type == op_type)
            .map(|entry| &entry.key)
            .collect()
    }
}

/// A resolved kernel bound to its operator description and execution context.
#[derive(Debug)]
pub struct Instruction {
    op: OpDesc,
    kernel: Box<dyn Kernel>,
    ctx: KernelContext,
    runs: u64,
}

impl Instruction {
    #[must_use]
    pub fn new(op: OpDesc, kernel: Box<dyn Kernel>, ctx: KernelContext) -> Self {
        Self {
            op,
            kernel,
            ctx,
            runs: 0,
        }
    }

    #[must_use]
    pub fn op(&self) -> &OpDesc {
        &self.op
    }

    #[must_use]
    pub fn kernel(&self) -> &dyn Kernel {
        self.kernel.as_ref()
    }

    #[must_use]
    pub fn context(&self) -> &KernelContext {
        &self.ctx
    }

    #[must_use]
    pub fn run_count(&self) -> u64 {
        self.runs
    }

    /// Runs the kernel once against `scope` and waits for the stream to drain.
    ///
    /// Inputs resolve with ancestor fallback. Outputs must already exist as
    /// locals of `scope`; they are written in place and never created here.
    pub fn run(&mut self, tree: &mut ScopeTree, scope: ScopeId) -> Result<(), KernelError> {
        let mut outputs = self.take_outputs(tree, scope)?;
        let launched = self.launch(tree, scope, &mut outputs);
        self.restore_outputs(tree, scope, outputs)?;
        launched?;
        self.ctx.synchronize()?;
        self.runs += 1;
        debug!(
            kernel = %self.kernel.key(),
            stream = self.ctx.stream().id(),
            run = self.runs,
            "instruction complete"
        );
        Ok(())
    }

    fn launch(
        &mut self,
        tree: &ScopeTree,
        scope: ScopeId,
        outputs: &mut BTreeMap<String, Vec<Tensor>>,
    ) -> Result<(), KernelError> {
        let mut inputs = BTreeMap::new();
        for slot in self.op.input_argument_names() {
            let mut bound = Vec::new();
            for var in self.op.input(slot) {
                let tensor = tree.find_tensor(scope, var).ok_or_else(|| {
                    ScopeError::VariableNotFound {
                        scope,
                        name: var.clone(),
                    }
                })?;
                bound.push(tensor);
            }
            inputs.insert(slot.to_owned(), bound);
        }
        let mut args = KernelArgs::new(inputs, outputs);
        self.ctx.stream_mut().record_launch();
        self.kernel.run(&mut self.ctx, &self.op, &mut args)
    }

    fn take_outputs(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
    ) -> Result<BTreeMap<String, Vec<Tensor>>, KernelError> {
        let mut taken = BTreeMap::new();
        for slot in self.op.output_argument_names() {
            let mut bound = Vec::new();
            for var in self.op.output(slot) {
                match tree.take_local(scope, var) {
                    Ok(tensor) => bound.push(tensor),
                    Err(error) => {
                        taken.insert(slot.to_owned(), bound);
                        self.restore_outputs(tree, scope, taken)?;
                        return Err(error.into());
                    }
                }
            }
            taken.insert(slot.to_owned(), bound);
        }
        Ok(taken)
    }

    fn restore_outputs(
        &self,
        tree: &mut ScopeTree,
        scope: ScopeId,
        outputs: BTreeMap<String, Vec<Tensor>>,
    ) -> Result<(), KernelError> {
        for (slot, tensors) in outputs {
            for (var, tensor) in self.op.output(&slot).iter().zip(tensors) {
                tree.restore_local(scope, var, tensor)?;
            }
        }
        Ok(())
    }
}
