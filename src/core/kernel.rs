//! Kernel variants: a fixed index-iteration skeleton around injected lane code.
//!
//! Every variant is bound once against the registry during setup, then
//! dispatched in its phase of every step (or once, for one-shot kernels).

use hashbrown::HashMap;

use crate::config::ExecutionTier;
use crate::error::{ConfigError, Result};
use crate::lane::{
    Binding, Code, Injected, LaneEnv, LaneIndex, Layout, RoleTargets, Scratch,
};
use crate::monitor::{MonitorSink, SpikeMonitor, StateMonitor};
use crate::prng::stream_id;
use crate::registry::{ElementType, EntitySetId, Entry, StateBuffers, Value};
use crate::synapse_builder::SynapseCreate;

/// Position of a kernel within one step. Scheduled kernels run sorted by phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Update,
    Threshold,
    Reset,
    Synapses,
    Monitors,
    /// Setup-only kernels; never scheduled per step.
    Once,
}

/// Which side's spikes trigger a propagation kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pathway {
    /// Synapses whose presynaptic neuron spiked (`on_pre`).
    #[default]
    Pre,
    /// Synapses whose postsynaptic neuron spiked (`on_post`).
    Post,
}

/// The Spike Index Set of every neuron group for the current step.
#[derive(Debug, Default)]
pub struct SpikeSets {
    sets: HashMap<EntitySetId, Vec<u32>>,
}

impl SpikeSets {
    /// Ascending indices of `group` that crossed threshold this step.
    pub fn get(&self, group: EntitySetId) -> &[u32] {
        self.sets.get(&group).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn slot(&mut self, group: EntitySetId) -> &mut Vec<u32> {
        self.sets.entry(group).or_default()
    }

    pub(crate) fn clear(&mut self) {
        for set in self.sets.values_mut() {
            set.clear();
        }
    }
}

/// Mutable world of one dispatch.
pub(crate) struct StepContext<'a> {
    pub registry: &'a mut StateBuffers,
    pub spikes: &'a mut SpikeSets,
    pub monitors: &'a mut MonitorSink,
    pub t: f32,
    pub dt: f32,
    pub step: u64,
    pub seed: u64,
    /// Effective tier.
    pub tier: ExecutionTier,
    pub staging_capacity: usize,
}

impl StepContext<'_> {
    pub(crate) fn parallel(&self) -> bool {
        self.tier.cpu() == ExecutionTier::Parallel
    }
}

/// Random stream of a kernel at a given step.
pub(crate) fn lane_stream(kernel: &str, step: u64) -> u64 {
    stream_id(kernel) ^ step.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

pub(crate) fn env<'a>(
    name: &'a str,
    code: &'a Code,
    layout: &'a Layout,
    t: f32,
    dt: f32,
    step: u64,
    seed: u64,
) -> LaneEnv<'a> {
    LaneEnv {
        kernel: name,
        layout,
        statements: &code.statements,
        t,
        dt,
        seed,
        stream: lane_stream(name, step),
        cond: false,
        probability: 1.0,
        repetitions: 1,
    }
}

/// Resolve one extra array a skeleton touches outside the injected code.
pub(crate) fn resolve_one(
    reg: &StateBuffers,
    binding: Binding,
    targets: &RoleTargets,
) -> Result<Entry, ConfigError> {
    let layout = Layout::resolve(reg, std::slice::from_ref(&binding), targets)?;
    Ok(layout.slots()[0].entry())
}

fn unbound(name: &str) -> ConfigError {
    ConfigError::NotSetUp.in_kernel(name)
}

// =============================================================================
// StateUpdate
// =============================================================================

/// Integrates neuron (or synapse) state over `0..N-1`.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    name: String,
    group: String,
    code: Code,
    #[cfg(feature = "gpu")]
    wgsl: Option<Vec<String>>,
    bound: Option<(EntitySetId, Layout)>,
}

impl StateUpdate {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            code: Code::default(),
            #[cfg(feature = "gpu")]
            wgsl: None,
            bound: None,
        }
    }

    /// WGSL statement lines used instead of the closure on the GPU tier.
    ///
    /// Lines see every bound name as a local `f32` and may assign to
    /// own-indexed ones; `t`, `dt` and `_idx` are in scope.
    #[cfg(feature = "gpu")]
    pub fn with_wgsl<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.wgsl = Some(lines.into_iter().map(Into::into).collect());
        self
    }

    fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        let group = reg.entity_set(&self.group)?;
        let layout = Layout::resolve(reg, &self.code.bindings, &RoleTargets::own(group))?;
        self.bound = Some((group, layout));
        Ok(())
    }

    fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let (group, layout) = self.bound.as_ref().ok_or_else(|| unbound(&self.name))?;
        let count = ctx.registry.count(*group);

        #[cfg(feature = "gpu")]
        if ctx.tier == ExecutionTier::Gpu {
            if let Some(lines) = &self.wgsl {
                match crate::gpu::run_state_update(
                    &self.name,
                    lines,
                    layout,
                    ctx.registry,
                    count,
                    ctx.t,
                    ctx.dt,
                ) {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::warn!(kernel = %self.name, "GPU dispatch failed, falling back to CPU: {e}")
                    }
                }
            }
        }

        let env = env(&self.name, &self.code, layout, ctx.t, ctx.dt, ctx.step, ctx.seed);
        if ctx.parallel() {
            let ats: Vec<LaneIndex> = (0..count).map(LaneIndex::neuron).collect();
            let batch = env.run_detached(ctx.registry, &ats, true)?;
            batch.scatter(layout, ctx.registry, &ats);
        } else {
            let mut scratch = Scratch::default();
            for idx in 0..count {
                env.run_in_place(ctx.registry, LaneIndex::neuron(idx), &mut scratch)?;
            }
        }
        Ok(())
    }
}

impl Injected for StateUpdate {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

// =============================================================================
// Threshold
// =============================================================================

/// Scans `0..N-1` for `_cond` and produces the group's Spike Index Set.
///
/// Spiking neurons get `not_refractory = false` and `lastspike = t`. Either
/// array may be switched off for models without refractoriness.
#[derive(Debug, Clone)]
pub struct Threshold {
    name: String,
    group: String,
    code: Code,
    not_refractory: Option<String>,
    lastspike: Option<String>,
    bound: Option<ThresholdBinding>,
}

#[derive(Debug, Clone)]
struct ThresholdBinding {
    group: EntitySetId,
    layout: Layout,
    not_refractory: Option<Entry>,
    lastspike: Option<Entry>,
}

impl Threshold {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            code: Code::default(),
            not_refractory: Some("not_refractory".to_string()),
            lastspike: Some("lastspike".to_string()),
            bound: None,
        }
    }

    pub fn with_not_refractory(mut self, name: Option<&str>) -> Self {
        self.not_refractory = name.map(str::to_string);
        self
    }

    pub fn with_lastspike(mut self, name: Option<&str>) -> Self {
        self.lastspike = name.map(str::to_string);
        self
    }

    fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        let group = reg.entity_set(&self.group)?;
        let targets = RoleTargets::own(group);
        let layout = Layout::resolve(reg, &self.code.bindings, &targets)?;
        let not_refractory = self
            .not_refractory
            .as_deref()
            .map(|n| resolve_one(reg, Binding::own(n, ElementType::Bool), &targets))
            .transpose()?;
        let lastspike = self
            .lastspike
            .as_deref()
            .map(|n| resolve_one(reg, Binding::own(n, ElementType::F32), &targets))
            .transpose()?;
        self.bound = Some(ThresholdBinding {
            group,
            layout,
            not_refractory,
            lastspike,
        });
        Ok(())
    }

    /// Returns the number of spikes.
    fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<usize> {
        let bound = self.bound.as_ref().ok_or_else(|| unbound(&self.name))?;
        let count = ctx.registry.count(bound.group);
        let env = env(&self.name, &self.code, &bound.layout, ctx.t, ctx.dt, ctx.step, ctx.seed);
        let ats: Vec<LaneIndex> = (0..count).map(LaneIndex::neuron).collect();
        let batch = env.run_detached(ctx.registry, &ats, ctx.parallel())?;
        batch.scatter(&bound.layout, ctx.registry, &ats);

        let spikes = ctx.spikes.slot(bound.group);
        spikes.clear();
        spikes.extend(
            batch
                .outcomes
                .iter()
                .enumerate()
                .filter(|(_, o)| o.cond)
                .map(|(idx, _)| idx as u32),
        );
        for &idx in spikes.iter() {
            let idx = idx as usize;
            if let Some(entry) = bound.not_refractory {
                ctx.registry.write(entry, idx, Value::Bool(false));
            }
            if let Some(entry) = bound.lastspike {
                ctx.registry.write(entry, idx, Value::F32(ctx.t));
            }
        }
        Ok(spikes.len())
    }
}

impl Injected for Threshold {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

// =============================================================================
// Reset
// =============================================================================

/// Runs reset statements for exactly the indices that spiked this step.
#[derive(Debug, Clone)]
pub struct Reset {
    name: String,
    group: String,
    code: Code,
    bound: Option<(EntitySetId, Layout)>,
}

impl Reset {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            code: Code::default(),
            bound: None,
        }
    }

    fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        let group = reg.entity_set(&self.group)?;
        let layout = Layout::resolve(reg, &self.code.bindings, &RoleTargets::own(group))?;
        self.bound = Some((group, layout));
        Ok(())
    }

    fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let (group, layout) = self.bound.as_ref().ok_or_else(|| unbound(&self.name))?;
        let env = env(&self.name, &self.code, layout, ctx.t, ctx.dt, ctx.step, ctx.seed);
        let mut scratch = Scratch::default();
        for &idx in ctx.spikes.get(*group) {
            env.run_in_place(ctx.registry, LaneIndex::neuron(idx as usize), &mut scratch)?;
        }
        Ok(())
    }
}

impl Injected for Reset {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

// =============================================================================
// Synaptic kernels
// =============================================================================

#[derive(Debug, Clone)]
struct SynapseBinding {
    synapses: EntitySetId,
    source: EntitySetId,
    target: EntitySetId,
    layout: Layout,
}

fn bind_synaptic(
    reg: &StateBuffers,
    synapses: &str,
    bindings: &[Binding],
) -> Result<SynapseBinding, ConfigError> {
    let id = reg.entity_set(synapses)?;
    let (source, target) = reg.endpoints(id)?;
    reg.connectivity(id)?
        .check(synapses, reg.count(source), reg.count(target))?;
    let targets = RoleTargets {
        own: Some(id),
        pre: Some(source),
        post: Some(target),
    };
    let layout = Layout::resolve(reg, bindings, &targets)?;
    Ok(SynapseBinding {
        synapses: id,
        source,
        target,
        layout,
    })
}

fn synapse_lane(pre: &[u32], post: &[u32], k: usize) -> LaneIndex {
    LaneIndex {
        idx: k,
        pre: pre[k] as usize,
        post: post[k] as usize,
        lane: k as u64,
    }
}

/// Event-driven propagation over synapses touched by this step's spikes.
#[derive(Debug, Clone)]
pub struct SynapsePropagate {
    name: String,
    synapses: String,
    pathway: Pathway,
    code: Code,
    bound: Option<SynapseBinding>,
}

impl SynapsePropagate {
    pub fn new(name: &str, synapses: &str) -> Self {
        Self {
            name: name.to_string(),
            synapses: synapses.to_string(),
            pathway: Pathway::Pre,
            code: Code::default(),
            bound: None,
        }
    }

    pub fn with_pathway(mut self, pathway: Pathway) -> Self {
        self.pathway = pathway;
        self
    }

    pub fn pathway(&self) -> Pathway {
        self.pathway
    }

    fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        self.bound = Some(bind_synaptic(reg, &self.synapses, &self.code.bindings)?);
        Ok(())
    }

    fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let bound = self.bound.as_ref().ok_or_else(|| unbound(&self.name))?;
        let trigger = match self.pathway {
            Pathway::Pre => bound.source,
            Pathway::Post => bound.target,
        };
        let conn = ctx.registry.connectivity(bound.synapses)?;
        let mut ats = Vec::new();
        for &neuron in ctx.spikes.get(trigger) {
            let list = match self.pathway {
                Pathway::Pre => conn.synapses_from(neuron as usize),
                Pathway::Post => conn.synapses_to(neuron as usize),
            };
            ats.extend(
                list.iter()
                    .map(|&k| synapse_lane(conn.pre(), conn.post(), k as usize)),
            );
        }

        let env = env(&self.name, &self.code, &bound.layout, ctx.t, ctx.dt, ctx.step, ctx.seed);
        let mut scratch = Scratch::default();
        for at in ats {
            env.run_in_place(ctx.registry, at, &mut scratch)?;
        }
        Ok(())
    }
}

impl Injected for SynapsePropagate {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

/// Scatter-add of per-synapse contributions onto a target-neuron array.
#[derive(Debug, Clone)]
pub struct LumpedVariable {
    name: String,
    synapses: String,
    target_var: String,
    code: Code,
    bound: Option<(SynapseBinding, Entry)>,
}

impl LumpedVariable {
    pub fn new(name: &str, synapses: &str, target_var: &str) -> Self {
        Self {
            name: name.to_string(),
            synapses: synapses.to_string(),
            target_var: target_var.to_string(),
            code: Code::default(),
            bound: None,
        }
    }

    fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        let bound = bind_synaptic(reg, &self.synapses, &self.code.bindings)?;
        let target = resolve_one(
            reg,
            Binding::post(&self.target_var, ElementType::F32),
            &RoleTargets {
                post: Some(bound.target),
                ..Default::default()
            },
        )?;
        self.bound = Some((bound, target));
        Ok(())
    }

    fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let (bound, target) = self.bound.as_ref().ok_or_else(|| unbound(&self.name))?;
        for j in 0..ctx.registry.count(bound.target) {
            ctx.registry.write(*target, j, Value::F32(0.0));
        }

        let conn = ctx.registry.connectivity(bound.synapses)?;
        let ats: Vec<LaneIndex> = (0..conn.len())
            .map(|k| synapse_lane(conn.pre(), conn.post(), k))
            .collect();
        let env = env(&self.name, &self.code, &bound.layout, ctx.t, ctx.dt, ctx.step, ctx.seed);
        let batch = env.run_detached(ctx.registry, &ats, ctx.parallel())?;
        batch.scatter(&bound.layout, ctx.registry, &ats);

        for (at, outcome) in ats.iter().zip(&batch.outcomes) {
            let sum = ctx.registry.read(*target, at.post).to_f32() + outcome.contribution;
            ctx.registry.write(*target, at.post, Value::F32(sum));
        }
        Ok(())
    }
}

impl Injected for LumpedVariable {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

// =============================================================================
// IndexFilter
// =============================================================================

/// Side-effect-free scan returning the ascending indices where `_cond` holds.
#[derive(Debug, Clone)]
pub struct IndexFilter {
    name: String,
    group: String,
    code: Code,
    bound: Option<(EntitySetId, Layout)>,
    matches: Vec<u32>,
}

impl IndexFilter {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            code: Code::default(),
            bound: None,
            matches: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Indices found by the most recent evaluation.
    pub fn matches(&self) -> &[u32] {
        &self.matches
    }

    pub(crate) fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        let group = reg.entity_set(&self.group)?;
        let layout = Layout::resolve(reg, &self.code.bindings, &RoleTargets::own(group))?;
        self.bound = Some((group, layout));
        Ok(())
    }

    /// Lane writes are discarded.
    pub(crate) fn evaluate(
        &mut self,
        reg: &StateBuffers,
        t: f32,
        dt: f32,
        step: u64,
        seed: u64,
        parallel: bool,
    ) -> Result<&[u32], ConfigError> {
        let (group, layout) = self.bound.as_ref().ok_or_else(|| unbound(&self.name))?;
        let env = env(&self.name, &self.code, layout, t, dt, step, seed);
        let ats: Vec<LaneIndex> = (0..reg.count(*group)).map(LaneIndex::neuron).collect();
        let batch = env.run_detached(reg, &ats, parallel)?;
        self.matches = batch
            .outcomes
            .iter()
            .enumerate()
            .filter(|(_, o)| o.cond)
            .map(|(idx, _)| idx as u32)
            .collect();
        Ok(&self.matches)
    }
}

impl Injected for IndexFilter {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

// =============================================================================
// Kernel
// =============================================================================

#[derive(Debug, Clone)]
pub enum Kernel {
    StateUpdate(StateUpdate),
    Threshold(Threshold),
    Reset(Reset),
    SynapsePropagate(SynapsePropagate),
    LumpedVariable(LumpedVariable),
    SynapseCreate(SynapseCreate),
    SpikeMonitor(SpikeMonitor),
    StateMonitor(StateMonitor),
}

impl Kernel {
    pub fn name(&self) -> &str {
        match self {
            Kernel::StateUpdate(k) => &k.name,
            Kernel::Threshold(k) => &k.name,
            Kernel::Reset(k) => &k.name,
            Kernel::SynapsePropagate(k) => &k.name,
            Kernel::LumpedVariable(k) => &k.name,
            Kernel::SynapseCreate(k) => k.name(),
            Kernel::SpikeMonitor(k) => k.name(),
            Kernel::StateMonitor(k) => k.name(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Kernel::StateUpdate(_) => Phase::Update,
            Kernel::Threshold(_) => Phase::Threshold,
            Kernel::Reset(_) => Phase::Reset,
            Kernel::SynapsePropagate(_) | Kernel::LumpedVariable(_) => Phase::Synapses,
            Kernel::SpikeMonitor(_) | Kernel::StateMonitor(_) => Phase::Monitors,
            Kernel::SynapseCreate(_) => Phase::Once,
        }
    }

    /// Resolve every binding against the registry. Monitors also register
    /// their logs with the sink.
    pub(crate) fn bind(
        &mut self,
        reg: &StateBuffers,
        monitors: &mut MonitorSink,
    ) -> Result<(), ConfigError> {
        let name = self.name().to_string();
        let result = match self {
            Kernel::StateUpdate(k) => k.bind(reg),
            Kernel::Threshold(k) => k.bind(reg),
            Kernel::Reset(k) => k.bind(reg),
            Kernel::SynapsePropagate(k) => k.bind(reg),
            Kernel::LumpedVariable(k) => k.bind(reg),
            Kernel::SynapseCreate(k) => k.bind(reg),
            Kernel::SpikeMonitor(k) => k.bind(reg, monitors),
            Kernel::StateMonitor(k) => k.bind(reg, monitors),
        };
        tracing::debug!(kernel = %name, ok = result.is_ok(), "bind");
        result.map_err(|e| match e {
            ConfigError::Kernel { .. } => e,
            other => other.in_kernel(&name),
        })
    }

    pub(crate) fn dispatch(&mut self, ctx: &mut StepContext<'_>) -> Result<()> {
        match self {
            Kernel::StateUpdate(k) => k.dispatch(ctx),
            Kernel::Threshold(k) => k.dispatch(ctx).map(|_| ()),
            Kernel::Reset(k) => k.dispatch(ctx),
            Kernel::SynapsePropagate(k) => k.dispatch(ctx),
            Kernel::LumpedVariable(k) => k.dispatch(ctx),
            Kernel::SynapseCreate(k) => k.dispatch(ctx),
            Kernel::SpikeMonitor(k) => k.dispatch(ctx),
            Kernel::StateMonitor(k) => k.dispatch(ctx),
        }
    }
}

macro_rules! kernel_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Kernel {
                fn from(k: $variant) -> Self {
                    Kernel::$variant(k)
                }
            }
        )*
    };
}

kernel_from!(
    StateUpdate,
    Threshold,
    Reset,
    SynapsePropagate,
    LumpedVariable,
    SynapseCreate,
    SpikeMonitor,
    StateMonitor,
);

#[cfg(test)]
mod tests {
    use super::*;

    struct World {
        reg: StateBuffers,
        spikes: SpikeSets,
        monitors: MonitorSink,
    }

    impl World {
        fn new() -> Self {
            Self {
                reg: StateBuffers::new(),
                spikes: SpikeSets::default(),
                monitors: MonitorSink::default(),
            }
        }

        fn ctx(&mut self, tier: ExecutionTier) -> StepContext<'_> {
            StepContext {
                registry: &mut self.reg,
                spikes: &mut self.spikes,
                monitors: &mut self.monitors,
                t: 0.25,
                dt: 0.1,
                step: 0,
                seed: 7,
                tier,
                staging_capacity: 4,
            }
        }

        fn run(&mut self, kernel: impl Into<Kernel>, tier: ExecutionTier) -> Result<()> {
            let mut kernel = kernel.into();
            kernel.bind(&self.reg, &mut self.monitors)?;
            let mut ctx = self.ctx(tier.effective());
            kernel.dispatch(&mut ctx)
        }
    }

    fn neurons(n: usize, v: &[f32]) -> World {
        let mut w = World::new();
        let g = w.reg.declare_neurons("g", n).unwrap();
        w.reg.declare("v", g, ElementType::F32).unwrap();
        w.reg.declare("not_refractory", g, ElementType::Bool).unwrap();
        w.reg.declare("lastspike", g, ElementType::F32).unwrap();
        w.reg.f32s_mut("v").unwrap().copy_from_slice(v);
        w.reg.bools_mut("not_refractory").unwrap().fill(true);
        w
    }

    fn threshold() -> Threshold {
        Threshold::new("thr", "g")
            .binding(Binding::own("v", ElementType::F32))
            .code(|lane| {
                let v = lane.f32("v");
                lane.set_cond(v > 1.0);
            })
    }

    #[test]
    fn threshold_builds_ascending_spike_set_and_marks_refractory() {
        let mut w = neurons(5, &[2.0, 0.0, 1.5, 1.0, 3.0]);
        w.run(threshold(), ExecutionTier::Scalar).unwrap();
        let g = w.reg.entity_set("g").unwrap();
        assert_eq!(w.spikes.get(g), &[0, 2, 4]);
        assert_eq!(
            w.reg.bools("not_refractory").unwrap(),
            &[false, true, false, true, false]
        );
        assert_eq!(w.reg.f32s("lastspike").unwrap(), &[0.25, 0.0, 0.25, 0.0, 0.25]);
    }

    #[test]
    fn threshold_replaces_previous_spike_set() {
        let mut w = neurons(3, &[2.0, 2.0, 2.0]);
        w.run(threshold(), ExecutionTier::Scalar).unwrap();
        w.reg.f32s_mut("v").unwrap().copy_from_slice(&[0.0, 0.0, 5.0]);
        w.run(threshold(), ExecutionTier::Scalar).unwrap();
        let g = w.reg.entity_set("g").unwrap();
        assert_eq!(w.spikes.get(g), &[2]);
    }

    #[test]
    fn threshold_without_refractory_arrays() {
        let mut w = World::new();
        let g = w.reg.declare_neurons("g", 2).unwrap();
        w.reg.declare("v", g, ElementType::F32).unwrap();
        w.reg.f32s_mut("v").unwrap()[1] = 4.0;
        let thr = threshold()
            .with_not_refractory(None)
            .with_lastspike(None);
        w.run(thr, ExecutionTier::Scalar).unwrap();
        assert_eq!(w.spikes.get(g), &[1]);
    }

    #[test]
    fn reset_only_touches_spiking_indices() {
        let mut w = neurons(4, &[2.0, 0.5, 3.0, 0.7]);
        w.run(threshold(), ExecutionTier::Scalar).unwrap();
        let reset = Reset::new("reset", "g")
            .binding(Binding::own("v", ElementType::F32))
            .code(|lane| lane.set_f32("v", -1.0));
        w.run(reset, ExecutionTier::Scalar).unwrap();
        assert_eq!(w.reg.f32s("v").unwrap(), &[-1.0, 0.5, -1.0, 0.7]);
    }

    #[test]
    fn state_update_sees_clock_and_scalars() {
        let mut w = neurons(3, &[1.0, 2.0, 3.0]);
        w.reg.declare_scalar("tau", Value::F32(0.5)).unwrap();
        let update = StateUpdate::new("upd", "g")
            .binding(Binding::own("v", ElementType::F32))
            .binding(Binding::scalar("tau", ElementType::F32))
            .code(|lane| {
                let v = lane.f32("v");
                let tau = lane.f32("tau");
                lane.set_f32("v", v - lane.dt() * v / tau);
            });
        w.run(update, ExecutionTier::Scalar).unwrap();
        let v = w.reg.f32s("v").unwrap();
        assert!((v[0] - 0.8).abs() < 1e-6);
        assert!((v[2] - 2.4).abs() < 1e-6);
    }

    #[test]
    fn bind_rejects_wrong_length_binding() {
        let mut w = neurons(3, &[0.0; 3]);
        let other = w.reg.declare_neurons("h", 5).unwrap();
        w.reg.declare("u", other, ElementType::F32).unwrap();
        let update = StateUpdate::new("upd", "g").binding(Binding::own("u", ElementType::F32));
        let err = w.run(update, ExecutionTier::Scalar).unwrap_err();
        assert_eq!(
            err.to_string(),
            "kernel `upd`: `u` has length 5, expected 3"
        );
    }

    fn wired(pre: &[u32], post: &[u32]) -> World {
        let mut w = World::new();
        let src = w.reg.declare_neurons("src", 3).unwrap();
        let dst = w.reg.declare_neurons("dst", 2).unwrap();
        w.reg.declare("ge", dst, ElementType::F32).unwrap();
        w.reg.declare("gsum", dst, ElementType::F32).unwrap();
        w.reg.declare("count", src, ElementType::I32).unwrap();
        let syn = w.reg.declare_synapses("syn", "src", "dst").unwrap();
        w.reg.declare("w", syn, ElementType::F32).unwrap();
        {
            let conn = w.reg.connectivity_mut(syn).unwrap();
            for (k, (&i, &j)) in pre.iter().zip(post).enumerate() {
                conn.pre.push(i);
                conn.post.push(j);
                conn.pre_synapses[i as usize].push(k as u32);
                conn.post_synapses[j as usize].push(k as u32);
            }
        }
        w.reg.sync_entity_set(syn).unwrap();
        w
    }

    #[test]
    fn propagation_follows_spiking_pre_neurons() {
        let mut w = wired(&[0, 0, 1, 2], &[0, 1, 1, 0]);
        w.reg.f32s_mut("w").unwrap().copy_from_slice(&[1.0, 2.0, 4.0, 8.0]);
        let src = w.reg.entity_set("src").unwrap();
        w.spikes.slot(src).extend([0, 2]);
        let on_pre = SynapsePropagate::new("on_pre", "syn")
            .binding(Binding::own("w", ElementType::F32))
            .binding(Binding::post("ge", ElementType::F32))
            .code(|lane| {
                let ge = lane.f32("ge") + lane.f32("w");
                lane.set_f32("ge", ge);
            });
        w.run(on_pre, ExecutionTier::Scalar).unwrap();
        // Synapses 0, 1 (pre 0) and 3 (pre 2) fire; synapse 2 does not.
        assert_eq!(w.reg.f32s("ge").unwrap(), &[9.0, 2.0]);
    }

    #[test]
    fn post_pathway_uses_post_back_references() {
        let mut w = wired(&[0, 1, 2], &[1, 1, 0]);
        let dst = w.reg.entity_set("dst").unwrap();
        w.spikes.slot(dst).push(1);
        let on_post = SynapsePropagate::new("on_post", "syn")
            .with_pathway(Pathway::Post)
            .binding(Binding::pre("count", ElementType::I32))
            .code(|lane| {
                let c = lane.i32("count") + 1;
                lane.set_i32("count", c);
            });
        w.run(on_post, ExecutionTier::Scalar).unwrap();
        assert_eq!(w.reg.i32s("count").unwrap(), &[1, 1, 0]);
    }

    #[test]
    fn lumped_variable_sums_per_target() {
        for tier in [ExecutionTier::Scalar, ExecutionTier::Parallel] {
            let mut w = wired(&[0, 1, 2, 2], &[0, 0, 1, 0]);
            w.reg.f32s_mut("w").unwrap().copy_from_slice(&[0.5, 1.5, 2.0, 4.0]);
            w.reg.f32s_mut("gsum").unwrap().copy_from_slice(&[100.0, 100.0]);
            let lumped = LumpedVariable::new("gsum_post", "syn", "gsum")
                .binding(Binding::own("w", ElementType::F32))
                .code(|lane| {
                    let w = lane.f32("w");
                    lane.contribute(w);
                });
            w.run(lumped, tier).unwrap();
            assert_eq!(w.reg.f32s("gsum").unwrap(), &[6.0, 2.0]);
        }
    }

    #[test]
    fn synaptic_bind_checks_connectivity_range() {
        let mut w = wired(&[0], &[1]);
        let syn = w.reg.entity_set("syn").unwrap();
        w.reg.connectivity_mut(syn).unwrap().post[0] = 7;
        let k = SynapsePropagate::new("on_pre", "syn");
        let err = w.run(k, ExecutionTier::Scalar).unwrap_err();
        assert!(err.to_string().contains("outside 0..2"));
    }

    #[test]
    fn index_filter_has_no_side_effects() {
        let w = neurons(4, &[0.0, 5.0, 5.0, 0.0]);
        let mut filter = IndexFilter::new("hot", "g")
            .binding(Binding::own("v", ElementType::F32))
            .code(|lane| {
                let v = lane.f32("v");
                lane.set_cond(v > 1.0);
                lane.set_f32("v", 0.0);
            });
        filter.bind(&w.reg).unwrap();
        let found = filter.evaluate(&w.reg, 0.0, 0.1, 0, 1, false).unwrap().to_vec();
        assert_eq!(found, vec![1, 2]);
        assert_eq!(w.reg.f32s("v").unwrap(), &[0.0, 5.0, 5.0, 0.0]);
        assert!(w.spikes.get(w.reg.entity_set("g").unwrap()).is_empty());
    }

    #[test]
    fn phases_order_the_step() {
        assert!(Phase::Update < Phase::Threshold);
        assert!(Phase::Threshold < Phase::Reset);
        assert!(Phase::Reset < Phase::Synapses);
        assert!(Phase::Synapses < Phase::Monitors);
        let k: Kernel = Reset::new("r", "g").into();
        assert_eq!(k.phase(), Phase::Reset);
        assert_eq!(k.name(), "r");
    }
}
