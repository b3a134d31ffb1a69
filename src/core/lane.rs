//! Lanes: one execution instance of a kernel's per-index body.
//!
//! A kernel declares [`Binding`]s (which registry name, at which index) and an
//! injected computation. For every index the lane gathers the bound values
//! into a private row, runs the computation, and scatters back only the slots
//! it wrote. Because a lane never holds a reference into the registry, the
//! same body runs unchanged on one thread or across a rayon pool.

use std::cell::RefCell;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::ConfigError;
use crate::prng::Prng;
use crate::registry::{ElementType, EntitySetId, Entry, StateBuffers, Value};

/// Injected per-lane computation.
pub type Statements = Arc<dyn Fn(&mut Lane<'_>) + Send + Sync>;

pub(crate) fn noop() -> Statements {
    Arc::new(|_: &mut Lane<'_>| {})
}

/// Which index a bound name is read at inside a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexRole {
    /// The kernel's own iterated entity (neuron for neuron kernels, synapse for synaptic kernels).
    Own,
    /// The presynaptic neuron of the current synapse or pair.
    Pre,
    /// The postsynaptic neuron of the current synapse or pair.
    Post,
    /// A scalar parameter, read-only.
    Scalar,
}

impl IndexRole {
    fn label(self) -> &'static str {
        match self {
            IndexRole::Own => "own-indexed",
            IndexRole::Pre => "pre-indexed",
            IndexRole::Post => "post-indexed",
            IndexRole::Scalar => "scalar",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    name: String,
    variable: String,
    ty: ElementType,
    role: IndexRole,
}

impl Binding {
    pub fn new(name: &str, ty: ElementType, role: IndexRole) -> Self {
        Self {
            name: name.to_string(),
            variable: name.to_string(),
            ty,
            role,
        }
    }

    pub fn own(name: &str, ty: ElementType) -> Self {
        Self::new(name, ty, IndexRole::Own)
    }

    pub fn pre(name: &str, ty: ElementType) -> Self {
        Self::new(name, ty, IndexRole::Pre)
    }

    pub fn post(name: &str, ty: ElementType) -> Self {
        Self::new(name, ty, IndexRole::Post)
    }

    pub fn scalar(name: &str, ty: ElementType) -> Self {
        Self::new(name, ty, IndexRole::Scalar)
    }

    /// Read the registry array `variable` under this binding's lane name,
    /// e.g. `Binding::post("v_post", F32).of("v")`.
    pub fn of(mut self, variable: &str) -> Self {
        self.variable = variable.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    pub fn role(&self) -> IndexRole {
        self.role
    }
}

/// Bindings plus the injected computation of one kernel.
#[derive(Clone)]
pub struct Code {
    pub(crate) bindings: Vec<Binding>,
    pub(crate) statements: Statements,
}

impl Default for Code {
    fn default() -> Self {
        Self {
            bindings: Vec::new(),
            statements: noop(),
        }
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Code")
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// Builder methods shared by every kernel that carries injected code.
pub trait Injected: Sized {
    fn code_mut(&mut self) -> &mut Code;

    fn binding(mut self, binding: Binding) -> Self {
        self.code_mut().bindings.push(binding);
        self
    }

    fn bindings(mut self, bindings: impl IntoIterator<Item = Binding>) -> Self {
        self.code_mut().bindings.extend(bindings);
        self
    }

    fn code<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut Lane<'_>) + Send + Sync + 'static,
    {
        self.code_mut().statements = Arc::new(f);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Slot {
    name: String,
    role: IndexRole,
    ty: ElementType,
    entry: Entry,
}

impl Slot {
    pub(crate) fn entry(&self) -> Entry {
        self.entry
    }

    #[cfg(feature = "gpu")]
    pub(crate) fn ty(&self) -> ElementType {
        self.ty
    }

    #[cfg(feature = "gpu")]
    pub(crate) fn role(&self) -> IndexRole {
        self.role
    }

    #[cfg(feature = "gpu")]
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Entity set each index role refers to; `None` forbids the role.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RoleTargets {
    pub own: Option<EntitySetId>,
    pub pre: Option<EntitySetId>,
    pub post: Option<EntitySetId>,
}

impl RoleTargets {
    pub(crate) fn own(id: EntitySetId) -> Self {
        Self {
            own: Some(id),
            ..Default::default()
        }
    }

    fn for_role(&self, role: IndexRole) -> Option<EntitySetId> {
        match role {
            IndexRole::Own => self.own,
            IndexRole::Pre => self.pre,
            IndexRole::Post => self.post,
            IndexRole::Scalar => None,
        }
    }
}

/// Resolved slots of one kernel.
#[derive(Debug, Clone, Default)]
pub(crate) struct Layout {
    slots: Vec<Slot>,
}

impl Layout {
    /// Resolve bindings against the registry, failing on the first absent
    /// name, type mismatch, forbidden role or length mismatch.
    pub(crate) fn resolve(
        reg: &StateBuffers,
        bindings: &[Binding],
        targets: &RoleTargets,
    ) -> Result<Self, ConfigError> {
        let mut slots: Vec<Slot> = Vec::with_capacity(bindings.len());
        for b in bindings {
            if slots.iter().any(|s| s.name == b.name) {
                return Err(ConfigError::Duplicate {
                    name: b.name.clone(),
                });
            }
            let entry = reg
                .lookup(&b.variable)
                .ok_or_else(|| ConfigError::UnknownVariable {
                    name: b.variable.clone(),
                })?;
            let found = reg.entry_type(entry);
            if found != b.ty {
                return Err(ConfigError::TypeMismatch {
                    name: b.variable.clone(),
                    expected: b.ty,
                    found,
                });
            }
            match (b.role, entry) {
                (IndexRole::Scalar, Entry::Scalar(_)) => {}
                (IndexRole::Scalar, Entry::Variable(_)) | (_, Entry::Scalar(_)) => {
                    return Err(ConfigError::RoleNotAllowed {
                        name: b.variable.clone(),
                        role: b.role.label(),
                    });
                }
                (role, Entry::Variable(_)) => {
                    let entity = targets.for_role(role).ok_or_else(|| {
                        ConfigError::RoleNotAllowed {
                            name: b.variable.clone(),
                            role: role.label(),
                        }
                    })?;
                    let expected = reg.count(entity);
                    let len = reg.entry_len(entry);
                    if len != expected {
                        return Err(ConfigError::LengthMismatch {
                            name: b.variable.clone(),
                            expected,
                            found: len,
                        });
                    }
                }
            }
            slots.push(Slot {
                name: b.name.clone(),
                role: b.role,
                ty: b.ty,
                entry,
            });
        }
        Ok(Self { slots })
    }

    pub(crate) fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub(crate) fn width(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn gather(&self, reg: &StateBuffers, at: LaneIndex, row: &mut [Value]) {
        for (slot, value) in self.slots.iter().zip(row.iter_mut()) {
            *value = reg.read(slot.entry, at.of(slot.role));
        }
    }

    pub(crate) fn scatter(&self, reg: &mut StateBuffers, at: LaneIndex, row: &[Value], dirty: &[bool]) {
        for ((slot, value), written) in self.slots.iter().zip(row).zip(dirty) {
            if *written {
                reg.write(slot.entry, at.of(slot.role), *value);
            }
        }
    }
}

/// Indices visible to one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct LaneIndex {
    pub idx: usize,
    pub pre: usize,
    pub post: usize,
    /// Random stream position of this lane.
    pub lane: u64,
}

impl LaneIndex {
    pub(crate) fn neuron(idx: usize) -> Self {
        Self {
            idx,
            pre: idx,
            post: idx,
            lane: idx as u64,
        }
    }

    #[inline]
    fn of(&self, role: IndexRole) -> usize {
        match role {
            IndexRole::Own => self.idx,
            IndexRole::Pre => self.pre,
            IndexRole::Post => self.post,
            IndexRole::Scalar => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum LaneFault {
    Unbound(String),
    WrongType {
        name: String,
        expected: ElementType,
        found: ElementType,
    },
    ScalarWrite(String),
}

impl From<LaneFault> for ConfigError {
    fn from(fault: LaneFault) -> Self {
        match fault {
            LaneFault::Unbound(name) => ConfigError::UnknownVariable { name },
            LaneFault::WrongType {
                name,
                expected,
                found,
            } => ConfigError::TypeMismatch {
                name,
                expected,
                found,
            },
            LaneFault::ScalarWrite(name) => ConfigError::ScalarWrite { name },
        }
    }
}

/// The view an injected computation gets of one index.
pub struct Lane<'a> {
    at: LaneIndex,
    t: f32,
    dt: f32,
    slots: &'a [Slot],
    row: &'a mut [Value],
    dirty: &'a mut [bool],
    cond: bool,
    probability: f32,
    repetitions: usize,
    contribution: f32,
    seed: u64,
    stream: u64,
    rng: RefCell<Option<Prng>>,
    fault: RefCell<Option<LaneFault>>,
}

impl<'a> Lane<'a> {
    /// Index of the iterated entity (`_vectorisation_idx`).
    pub fn idx(&self) -> usize {
        self.at.idx
    }

    /// Presynaptic neuron of the current synapse or candidate pair.
    pub fn pre(&self) -> usize {
        self.at.pre
    }

    /// Postsynaptic neuron of the current synapse or candidate pair.
    pub fn post(&self) -> usize {
        self.at.post
    }

    pub fn t(&self) -> f32 {
        self.t
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    /// Uniform draw in `[0, 1)` from this lane's own stream.
    pub fn rand(&self) -> f32 {
        let mut rng = self.rng.borrow_mut();
        rng.get_or_insert_with(|| Prng::for_lane(self.seed, self.stream, self.at.lane))
            .next_f32_01()
    }

    pub fn f32(&self, name: &str) -> f32 {
        match self.read(name, ElementType::F32) {
            Some(Value::F32(v)) => v,
            _ => 0.0,
        }
    }

    pub fn i32(&self, name: &str) -> i32 {
        match self.read(name, ElementType::I32) {
            Some(Value::I32(v)) => v,
            _ => 0,
        }
    }

    pub fn bool(&self, name: &str) -> bool {
        match self.read(name, ElementType::Bool) {
            Some(Value::Bool(v)) => v,
            _ => false,
        }
    }

    pub fn set_f32(&mut self, name: &str, value: f32) {
        self.write(name, Value::F32(value));
    }

    pub fn set_i32(&mut self, name: &str, value: i32) {
        self.write(name, Value::I32(value));
    }

    pub fn set_bool(&mut self, name: &str, value: bool) {
        self.write(name, Value::Bool(value));
    }

    /// Set `_cond` for threshold, filter and synapse-creation kernels.
    pub fn set_cond(&mut self, cond: bool) {
        self.cond = cond;
    }

    /// Override `_p` for the current candidate pair.
    pub fn set_probability(&mut self, p: f32) {
        self.probability = p;
    }

    /// Override `_n` for the current candidate pair.
    pub fn set_repetitions(&mut self, n: usize) {
        self.repetitions = n;
    }

    /// Set this synapse's contribution to a lumped variable.
    pub fn contribute(&mut self, value: f32) {
        self.contribution = value;
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.name == name)
    }

    fn fail(&self, fault: LaneFault) {
        let mut slot = self.fault.borrow_mut();
        if slot.is_none() {
            *slot = Some(fault);
        }
    }

    fn read(&self, name: &str, ty: ElementType) -> Option<Value> {
        let Some(pos) = self.position(name) else {
            self.fail(LaneFault::Unbound(name.to_string()));
            return None;
        };
        let slot = &self.slots[pos];
        if slot.ty != ty {
            self.fail(LaneFault::WrongType {
                name: name.to_string(),
                expected: ty,
                found: slot.ty,
            });
            return None;
        }
        Some(self.row[pos])
    }

    fn write(&mut self, name: &str, value: Value) {
        let Some(pos) = self.position(name) else {
            self.fail(LaneFault::Unbound(name.to_string()));
            return;
        };
        let slot = &self.slots[pos];
        if slot.role == IndexRole::Scalar {
            self.fail(LaneFault::ScalarWrite(name.to_string()));
            return;
        }
        if slot.ty != value.element_type() {
            self.fail(LaneFault::WrongType {
                name: name.to_string(),
                expected: value.element_type(),
                found: slot.ty,
            });
            return;
        }
        self.row[pos] = value;
        self.dirty[pos] = true;
    }
}

/// Control values a lane hands back to its kernel skeleton.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LaneOutcome {
    pub cond: bool,
    pub probability: f32,
    pub repetitions: usize,
    pub contribution: f32,
}

/// Everything needed to run lanes of one dispatch.
pub(crate) struct LaneEnv<'a> {
    pub kernel: &'a str,
    pub layout: &'a Layout,
    pub statements: &'a Statements,
    pub t: f32,
    pub dt: f32,
    pub seed: u64,
    pub stream: u64,
    /// `_cond` before the injected code runs.
    pub cond: bool,
    pub probability: f32,
    pub repetitions: usize,
}

/// Reusable row storage for in-place lanes.
#[derive(Debug, Default)]
pub(crate) struct Scratch {
    row: Vec<Value>,
    dirty: Vec<bool>,
}

/// Rows and outcomes of lanes that ran against a registry snapshot.
#[derive(Debug)]
pub(crate) struct Batch {
    stride: usize,
    width: usize,
    rows: Vec<Value>,
    dirty: Vec<bool>,
    pub outcomes: Vec<LaneOutcome>,
}

impl Batch {
    /// Write every lane's dirty slots back, in lane order.
    pub(crate) fn scatter(&self, layout: &Layout, reg: &mut StateBuffers, ats: &[LaneIndex]) {
        if self.width == 0 {
            return;
        }
        for (k, at) in ats.iter().enumerate() {
            let base = k * self.stride;
            layout.scatter(
                reg,
                *at,
                &self.rows[base..base + self.width],
                &self.dirty[base..base + self.width],
            );
        }
    }
}

impl<'a> LaneEnv<'a> {
    fn execute(
        &self,
        at: LaneIndex,
        row: &mut [Value],
        dirty: &mut [bool],
    ) -> Result<LaneOutcome, ConfigError> {
        let mut lane = Lane {
            at,
            t: self.t,
            dt: self.dt,
            slots: self.layout.slots(),
            row,
            dirty,
            cond: self.cond,
            probability: self.probability,
            repetitions: self.repetitions,
            contribution: 0.0,
            seed: self.seed,
            stream: self.stream,
            rng: RefCell::new(None),
            fault: RefCell::new(None),
        };
        (self.statements)(&mut lane);
        if let Some(fault) = lane.fault.into_inner() {
            return Err(ConfigError::from(fault).in_kernel(self.kernel));
        }
        Ok(LaneOutcome {
            cond: lane.cond,
            probability: lane.probability,
            repetitions: lane.repetitions,
            contribution: lane.contribution,
        })
    }

    /// Gather, execute and scatter one lane directly against the registry.
    pub(crate) fn run_in_place(
        &self,
        reg: &mut StateBuffers,
        at: LaneIndex,
        scratch: &mut Scratch,
    ) -> Result<LaneOutcome, ConfigError> {
        let width = self.layout.width();
        scratch.row.clear();
        scratch.row.resize(width, Value::F32(0.0));
        scratch.dirty.clear();
        scratch.dirty.resize(width, false);
        self.layout.gather(reg, at, &mut scratch.row);
        let outcome = self.execute(at, &mut scratch.row, &mut scratch.dirty)?;
        self.layout.scatter(reg, at, &scratch.row, &scratch.dirty);
        Ok(outcome)
    }

    /// Run every lane in `ats` against the current registry contents without
    /// writing back. Lanes run concurrently when `parallel` is set and the
    /// crate is built with the `parallel` feature.
    pub(crate) fn run_detached(
        &self,
        reg: &StateBuffers,
        ats: &[LaneIndex],
        parallel: bool,
    ) -> Result<Batch, ConfigError> {
        let width = self.layout.width();
        let stride = width.max(1);
        let mut rows = vec![Value::F32(0.0); ats.len() * stride];
        let mut dirty = vec![false; ats.len() * stride];

        let run = |row: &mut [Value], dirty: &mut [bool], at: &LaneIndex| {
            self.layout.gather(reg, *at, &mut row[..width]);
            self.execute(*at, &mut row[..width], &mut dirty[..width])
        };

        #[cfg(feature = "parallel")]
        let results: Vec<Result<LaneOutcome, ConfigError>> = if parallel {
            rows.par_chunks_mut(stride)
                .zip(dirty.par_chunks_mut(stride))
                .zip(ats.par_iter())
                .map(|((row, dirty), at)| run(row, dirty, at))
                .collect()
        } else {
            rows.chunks_mut(stride)
                .zip(dirty.chunks_mut(stride))
                .zip(ats.iter())
                .map(|((row, dirty), at)| run(row, dirty, at))
                .collect()
        };

        #[cfg(not(feature = "parallel"))]
        let results: Vec<Result<LaneOutcome, ConfigError>> = {
            let _ = parallel;
            rows.chunks_mut(stride)
                .zip(dirty.chunks_mut(stride))
                .zip(ats.iter())
                .map(|((row, dirty), at)| run(row, dirty, at))
                .collect()
        };

        let outcomes = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(Batch {
            stride,
            width,
            rows,
            dirty,
            outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (StateBuffers, Layout) {
        let mut reg = StateBuffers::new();
        let g = reg.declare_neurons("g", 3).unwrap();
        reg.declare("v", g, ElementType::F32).unwrap();
        reg.declare("n", g, ElementType::I32).unwrap();
        reg.declare_scalar("gain", Value::F32(2.0)).unwrap();
        let layout = Layout::resolve(
            &reg,
            &[
                Binding::own("v", ElementType::F32),
                Binding::own("n", ElementType::I32),
                Binding::scalar("gain", ElementType::F32),
            ],
            &RoleTargets::own(g),
        )
        .unwrap();
        (reg, layout)
    }

    fn env<'a>(layout: &'a Layout, statements: &'a Statements) -> LaneEnv<'a> {
        LaneEnv {
            kernel: "test",
            layout,
            statements,
            t: 0.5,
            dt: 0.1,
            seed: 1,
            stream: 2,
            cond: false,
            probability: 1.0,
            repetitions: 1,
        }
    }

    #[test]
    fn in_place_lane_writes_only_its_index() {
        let (mut reg, layout) = setup();
        let statements: Statements = Arc::new(|lane: &mut Lane<'_>| {
            let v = lane.f32("v") + lane.f32("gain") * lane.t();
            lane.set_f32("v", v);
            lane.set_i32("n", lane.idx() as i32 * 10);
        });
        let env = env(&layout, &statements);
        let mut scratch = Scratch::default();
        env.run_in_place(&mut reg, LaneIndex::neuron(1), &mut scratch)
            .unwrap();
        assert_eq!(reg.f32s("v").unwrap(), &[0.0, 1.0, 0.0]);
        assert_eq!(reg.i32s("n").unwrap(), &[0, 10, 0]);
    }

    #[test]
    fn undeclared_name_is_a_kernel_config_error() {
        let (mut reg, layout) = setup();
        let statements: Statements = Arc::new(|lane: &mut Lane<'_>| {
            let _ = lane.f32("missing");
        });
        let env = env(&layout, &statements);
        let err = env
            .run_in_place(&mut reg, LaneIndex::neuron(0), &mut Scratch::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "kernel `test`: unknown variable `missing`");
    }

    #[test]
    fn scalar_writes_and_type_confusion_fault() {
        let (mut reg, layout) = setup();
        let write_scalar: Statements = Arc::new(|lane: &mut Lane<'_>| lane.set_f32("gain", 1.0));
        let err = env(&layout, &write_scalar)
            .run_in_place(&mut reg, LaneIndex::neuron(0), &mut Scratch::default())
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));

        let wrong_type: Statements = Arc::new(|lane: &mut Lane<'_>| {
            let _ = lane.i32("v");
        });
        let err = env(&layout, &wrong_type)
            .run_in_place(&mut reg, LaneIndex::neuron(0), &mut Scratch::default())
            .unwrap_err();
        assert!(err.to_string().contains("has type"));
        assert_eq!(reg.f32s("v").unwrap(), &[0.0; 3]);
    }

    #[test]
    fn detached_lanes_see_pre_dispatch_values() {
        let (mut reg, layout) = setup();
        reg.f32s_mut("v").unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        let statements: Statements = Arc::new(|lane: &mut Lane<'_>| {
            let v = lane.f32("v");
            lane.set_cond(v > 1.5);
            lane.set_f32("v", v * 2.0);
        });
        let env = env(&layout, &statements);
        let ats: Vec<LaneIndex> = (0..3).map(LaneIndex::neuron).collect();
        let batch = env.run_detached(&reg, &ats, true).unwrap();
        let conds: Vec<bool> = batch.outcomes.iter().map(|o| o.cond).collect();
        assert_eq!(conds, vec![false, true, true]);
        // Nothing is written until the batch is scattered.
        assert_eq!(reg.f32s("v").unwrap(), &[1.0, 2.0, 3.0]);
        batch.scatter(&layout, &mut reg, &ats);
        assert_eq!(reg.f32s("v").unwrap(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn rand_is_identical_across_runs() {
        let (mut reg, layout) = setup();
        let statements: Statements = Arc::new(|lane: &mut Lane<'_>| {
            let r = lane.rand();
            lane.set_f32("v", r);
        });
        let env = env(&layout, &statements);
        let ats: Vec<LaneIndex> = (0..3).map(LaneIndex::neuron).collect();
        let first = env.run_detached(&reg, &ats, false).unwrap();
        first.scatter(&layout, &mut reg, &ats);
        let a = reg.f32s("v").unwrap().to_vec();
        let second = env.run_detached(&reg, &ats, true).unwrap();
        second.scatter(&layout, &mut reg, &ats);
        assert_eq!(a, reg.f32s("v").unwrap());
        assert_ne!(a[0], a[1]);
    }

    #[test]
    fn resolve_rejects_bad_bindings() {
        let (reg, _) = setup();
        let g = reg.entity_set("g").unwrap();
        let targets = RoleTargets::own(g);
        assert!(matches!(
            Layout::resolve(&reg, &[Binding::own("w", ElementType::F32)], &targets),
            Err(ConfigError::UnknownVariable { .. })
        ));
        assert!(matches!(
            Layout::resolve(&reg, &[Binding::own("v", ElementType::I32)], &targets),
            Err(ConfigError::TypeMismatch { .. })
        ));
        assert!(matches!(
            Layout::resolve(&reg, &[Binding::pre("v", ElementType::F32)], &targets),
            Err(ConfigError::RoleNotAllowed { .. })
        ));
        assert!(matches!(
            Layout::resolve(&reg, &[Binding::own("gain", ElementType::F32)], &targets),
            Err(ConfigError::RoleNotAllowed { .. })
        ));
    }
}
