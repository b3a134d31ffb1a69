//! Synapse Builder: buffered construction of connectivity over the
//! source×target cross product.
//!
//! Pairs are scanned with the source index outer and the target index inner;
//! synapse indices are assigned in that order. Accepted copies go through a
//! staging buffer into `pre`/`post`, while the per-neuron back-references are
//! appended through size-1 buffers so they are current after every pair.

use crate::error::{ConfigError, ResourceError, Result};
use crate::kernel::{lane_stream, StepContext};
use crate::lane::{Code, Injected, LaneEnv, LaneIndex, Layout, RoleTargets, Scratch};
use crate::prng::Prng;
use crate::registry::{EntitySetId, StateBuffers};
use crate::staging::{append, StagingBuffer};

/// One-shot kernel that grows a synapse group.
///
/// Lanes see the candidate pair through `pre()`/`post()` and `Pre`/`Post`
/// bindings. Every pair is a candidate unless the lane calls
/// `set_cond(false)`; lanes may also override the acceptance probability and
/// repetition count per pair.
#[derive(Debug, Clone)]
pub struct SynapseCreate {
    name: String,
    synapses: String,
    probability: f32,
    repetitions: usize,
    code: Code,
    bound: Option<Bound>,
}

#[derive(Debug, Clone)]
struct Bound {
    synapses: EntitySetId,
    source: EntitySetId,
    target: EntitySetId,
    layout: Layout,
}

/// What one builder run added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub created: usize,
    pub flushes: usize,
}

impl SynapseCreate {
    pub fn new(name: &str, synapses: &str) -> Self {
        Self {
            name: name.to_string(),
            synapses: synapses.to_string(),
            probability: 1.0,
            repetitions: 1,
            code: Code::default(),
            bound: None,
        }
    }

    /// Default `_p`.
    pub fn with_probability(mut self, p: f32) -> Self {
        self.probability = p;
        self
    }

    /// Default `_n`.
    pub fn with_repetitions(mut self, n: usize) -> Self {
        self.repetitions = n;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind(&mut self, reg: &StateBuffers) -> Result<(), ConfigError> {
        let synapses = reg.entity_set(&self.synapses)?;
        let (source, target) = reg.endpoints(synapses)?;
        let targets = RoleTargets {
            own: None,
            pre: Some(source),
            post: Some(target),
        };
        let layout = Layout::resolve(reg, &self.code.bindings, &targets)?;
        self.bound = Some(Bound {
            synapses,
            source,
            target,
            layout,
        });
        Ok(())
    }

    pub(crate) fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        self.build(ctx).map(|_| ())
    }

    pub(crate) fn build(&self, ctx: &mut StepContext<'_>) -> Result<BuildSummary> {
        let bound = self
            .bound
            .as_ref()
            .ok_or_else(|| ConfigError::NotSetUp.in_kernel(&self.name))?;
        let sources = ctx.registry.count(bound.source);
        let targets = ctx.registry.count(bound.target);
        let base = ctx.registry.connectivity(bound.synapses)?.len();

        let stream = lane_stream(&self.name, ctx.step);
        let env = LaneEnv {
            kernel: &self.name,
            layout: &bound.layout,
            statements: &self.code.statements,
            t: ctx.t,
            dt: ctx.dt,
            seed: ctx.seed,
            stream,
            cond: true,
            probability: self.probability,
            repetitions: self.repetitions,
        };
        let mut thinning = Prng::for_lane(ctx.seed, stream, u64::MAX);
        let mut scratch = Scratch::default();

        let mut pairs: StagingBuffer<(u32, u32)> = StagingBuffer::new(ctx.staging_capacity);
        let mut pre_refs: StagingBuffer<u32> = StagingBuffer::new(1);
        let mut post_refs: StagingBuffer<u32> = StagingBuffer::new(1);
        let mut created = 0usize;

        for i in 0..sources {
            for j in 0..targets {
                let at = LaneIndex {
                    idx: j,
                    pre: i,
                    post: j,
                    lane: (i * targets + j) as u64,
                };
                let outcome = env.run_in_place(ctx.registry, at, &mut scratch)?;
                if !outcome.cond {
                    continue;
                }
                if outcome.probability != 1.0 && thinning.next_f32_01() >= outcome.probability {
                    continue;
                }
                for _ in 0..outcome.repetitions {
                    let k = (base + created) as u32;
                    if pairs.push((i as u32, j as u32)) {
                        self.flush_pairs(ctx.registry, bound.synapses, &mut pairs)?;
                    }
                    pre_refs.push(k);
                    post_refs.push(k);
                    let conn = ctx.registry.connectivity_mut(bound.synapses)?;
                    pre_refs.flush(|ks| append(&mut conn.pre_synapses[i], ks))
                        .map_err(|_| self.alloc_error("pre_synapses", conn.pre_synapses[i].len() + 1))?;
                    post_refs.flush(|ks| append(&mut conn.post_synapses[j], ks))
                        .map_err(|_| self.alloc_error("post_synapses", conn.post_synapses[j].len() + 1))?;
                    created += 1;
                }
            }
        }
        self.flush_pairs(ctx.registry, bound.synapses, &mut pairs)?;
        ctx.registry.sync_entity_set(bound.synapses)?;

        let summary = BuildSummary {
            created,
            flushes: pairs.flushes(),
        };
        tracing::debug!(
            kernel = %self.name,
            created = summary.created,
            flushes = summary.flushes,
            total = base + created,
            "synapses created"
        );
        Ok(summary)
    }

    fn flush_pairs(
        &self,
        reg: &mut StateBuffers,
        synapses: EntitySetId,
        pairs: &mut StagingBuffer<(u32, u32)>,
    ) -> Result<()> {
        let conn = reg.connectivity_mut(synapses)?;
        let requested = conn.pre.len() + pairs.len();
        pairs
            .flush(|items| {
                conn.pre.try_reserve(items.len())?;
                conn.post.try_reserve(items.len())?;
                conn.pre.extend(items.iter().map(|&(i, _)| i));
                conn.post.extend(items.iter().map(|&(_, j)| j));
                Ok::<(), std::collections::TryReserveError>(())
            })
            .map_err(|_| self.alloc_error("pre/post", requested))?;
        Ok(())
    }

    fn alloc_error(&self, what: &str, requested: usize) -> ResourceError {
        ResourceError::Allocation {
            name: format!("{}.{}", self.synapses, what),
            requested,
        }
    }
}

impl Injected for SynapseCreate {
    fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionTier;
    use crate::kernel::SpikeSets;
    use crate::lane::Binding;
    use crate::monitor::MonitorSink;
    use crate::registry::ElementType;

    fn registry(sources: usize, targets: usize) -> StateBuffers {
        let mut reg = StateBuffers::new();
        let src = reg.declare_neurons("src", sources).unwrap();
        let dst = reg.declare_neurons("dst", targets).unwrap();
        reg.declare("x", src, ElementType::I32).unwrap();
        reg.declare("y", dst, ElementType::I32).unwrap();
        let syn = reg.declare_synapses("syn", "src", "dst").unwrap();
        reg.declare("w", syn, ElementType::F32).unwrap();
        reg
    }

    fn build(reg: &mut StateBuffers, builder: SynapseCreate, capacity: usize) -> BuildSummary {
        let mut builder = builder;
        builder.bind(reg).unwrap();
        let mut spikes = SpikeSets::default();
        let mut monitors = MonitorSink::default();
        let mut ctx = StepContext {
            registry: reg,
            spikes: &mut spikes,
            monitors: &mut monitors,
            t: 0.0,
            dt: 0.1,
            step: 0,
            seed: 11,
            tier: ExecutionTier::Scalar,
            staging_capacity: capacity,
        };
        builder.build(&mut ctx).unwrap()
    }

    fn all_pairs() -> SynapseCreate {
        SynapseCreate::new("connect", "syn").code(|lane| lane.set_cond(true))
    }

    fn pairs(reg: &StateBuffers) -> (Vec<u32>, Vec<u32>) {
        let syn = reg.entity_set("syn").unwrap();
        let conn = reg.connectivity(syn).unwrap();
        (conn.pre().to_vec(), conn.post().to_vec())
    }

    #[test]
    fn full_cross_product_in_scan_order() {
        let mut reg = registry(3, 2);
        let summary = build(&mut reg, all_pairs(), 1024);
        assert_eq!(summary.created, 6);
        let (pre, post) = pairs(&reg);
        assert_eq!(pre, vec![0, 0, 1, 1, 2, 2]);
        assert_eq!(post, vec![0, 1, 0, 1, 0, 1]);
        let syn = reg.entity_set("syn").unwrap();
        assert_eq!(reg.count(syn), 6);
        assert_eq!(reg.f32s("w").unwrap().len(), 6);
        let conn = reg.connectivity(syn).unwrap();
        assert_eq!(conn.synapses_from(1), &[2, 3]);
        assert_eq!(conn.synapses_to(1), &[1, 3, 5]);
    }

    #[test]
    fn repetitions_create_consecutive_copies() {
        let mut reg = registry(2, 2);
        let builder = SynapseCreate::new("connect", "syn")
            .with_repetitions(3)
            .code(|lane| {
                let accept = lane.pre() == 1 && lane.post() == 0;
                lane.set_cond(accept);
            });
        build(&mut reg, builder, 1024);
        let (pre, post) = pairs(&reg);
        assert_eq!(pre, vec![1, 1, 1]);
        assert_eq!(post, vec![0, 0, 0]);
        let syn = reg.entity_set("syn").unwrap();
        assert_eq!(reg.connectivity(syn).unwrap().synapses_from(1), &[0, 1, 2]);
    }

    #[test]
    fn small_staging_capacity_preserves_order() {
        let mut reg = registry(5, 1);
        let summary = build(&mut reg, all_pairs(), 2);
        assert_eq!(summary.created, 5);
        assert_eq!(summary.flushes, 3);
        let (pre, post) = pairs(&reg);
        assert_eq!(pre, vec![0, 1, 2, 3, 4]);
        assert_eq!(post, vec![0; 5]);
    }

    #[test]
    fn zero_probability_creates_nothing() {
        let mut reg = registry(4, 4);
        let summary = build(&mut reg, all_pairs().with_probability(0.0), 8);
        assert_eq!(summary.created, 0);
        let syn = reg.entity_set("syn").unwrap();
        assert_eq!(reg.count(syn), 0);
    }

    #[test]
    fn thinning_is_deterministic_per_seed() {
        let mut a = registry(20, 20);
        let mut b = registry(20, 20);
        build(&mut a, all_pairs().with_probability(0.3), 16);
        build(&mut b, all_pairs().with_probability(0.3), 1024);
        let (pre_a, post_a) = pairs(&a);
        assert_eq!((pre_a.clone(), post_a), pairs(&b));
        assert!(!pre_a.is_empty() && pre_a.len() < 400);
    }

    #[test]
    fn builder_without_code_connects_thinned_pairs() {
        let mut reg = registry(3, 2);
        let summary = build(&mut reg, SynapseCreate::new("connect", "syn"), 1024);
        assert_eq!(summary.created, 6);

        let mut reg = registry(20, 20);
        let summary = build(
            &mut reg,
            SynapseCreate::new("connect", "syn").with_probability(0.3),
            1024,
        );
        assert!(summary.created > 0 && summary.created < 400);
        let syn = reg.entity_set("syn").unwrap();
        assert_eq!(reg.count(syn), summary.created);
    }

    #[test]
    fn condition_reads_pre_and_post_bindings() {
        let mut reg = registry(3, 3);
        reg.fill_arange("x", 0).unwrap();
        reg.fill_arange("y", 0).unwrap();
        let builder = SynapseCreate::new("one_to_one", "syn")
            .binding(Binding::pre("x", ElementType::I32))
            .binding(Binding::post("y", ElementType::I32))
            .code(|lane| {
                let same = lane.i32("x") == lane.i32("y");
                lane.set_cond(same);
            });
        build(&mut reg, builder, 1024);
        let (pre, post) = pairs(&reg);
        assert_eq!(pre, vec![0, 1, 2]);
        assert_eq!(post, vec![0, 1, 2]);
    }

    #[test]
    fn second_builder_appends() {
        let mut reg = registry(1, 2);
        build(&mut reg, all_pairs(), 4);
        reg.f32s_mut("w").unwrap().fill(0.5);
        build(&mut reg, all_pairs(), 4);
        let (pre, _) = pairs(&reg);
        assert_eq!(pre.len(), 4);
        assert_eq!(reg.f32s("w").unwrap(), &[0.5, 0.5, 0.0, 0.0]);
        let syn = reg.entity_set("syn").unwrap();
        assert_eq!(reg.connectivity(syn).unwrap().synapses_from(0), &[0, 1, 2, 3]);
    }

    #[test]
    fn own_bindings_are_rejected() {
        let reg = registry(1, 1);
        let mut builder = all_pairs().binding(Binding::own("w", ElementType::F32));
        assert!(matches!(
            builder.bind(&reg),
            Err(ConfigError::RoleNotAllowed { .. })
        ));
    }
}
