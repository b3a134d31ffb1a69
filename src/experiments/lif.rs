//! Two groups of leaky integrate-and-fire neurons relaxing towards a rest
//! potential just above threshold, so every neuron fires periodically.
//! Group `gp1` projects onto `gp2` through random excitatory synapses.
//!
//! Variables live in the shared registry namespace, so each group prefixes
//! its arrays (`gp1_v`, `gp1_lastspike`) and kernels alias them back to
//! `V` and `lastspike` through [`Binding::of`].

use crate::config::SimulationConfig;
use crate::error::ConfigError;
use crate::kernel::{Reset, StateUpdate, SynapsePropagate, Threshold};
use crate::lane::{Binding, Injected};
use crate::monitor::{SpikeMonitor, StateMonitor};
use crate::registry::ElementType;
use crate::simulation::Simulation;
use crate::synapse_builder::SynapseCreate;

const F32: ElementType = ElementType::F32;

/// Volts and seconds throughout.
#[derive(Debug, Clone)]
pub struct LifParams {
    pub n_a: usize,
    pub n_b: usize,
    pub tau_a: f32,
    pub tau_b: f32,
    pub v_rest: f32,
    pub v_threshold: f32,
    pub v_reset: f32,
    pub refractory: f32,
    /// Connection probability from `gp1` to `gp2`.
    pub p_connect: f32,
    /// Voltage jump per presynaptic spike.
    pub weight: f32,
    /// Number of `gp2` neurons traced by the state monitor.
    pub recorded: usize,
}

impl Default for LifParams {
    fn default() -> Self {
        Self {
            n_a: 1000,
            n_b: 10,
            tau_a: 10e-3,
            tau_b: 20e-3,
            v_rest: -49e-3,
            v_threshold: -50e-3,
            v_reset: -60e-3,
            refractory: 5e-3,
            p_connect: 0.02,
            weight: 0.5e-3,
            recorded: 3,
        }
    }
}

/// Integration statements for the GPU tier; mirrors the closure below.
#[cfg(feature = "gpu")]
const UPDATE_WGSL: [&str; 3] = [
    "if (t - lastspike >= refractory) {",
    "    V = V0 + (V - V0) * exp(-dt / tau);",
    "}",
];

/// Build the demo network. Call `setup()` before running it.
pub fn lif_network(config: SimulationConfig, params: &LifParams) -> Result<Simulation, ConfigError> {
    let mut sim = Simulation::new(config)?;

    sim.declare_scalar("V0", params.v_rest)?;
    sim.declare_scalar("v_threshold", params.v_threshold)?;
    sim.declare_scalar("v_reset", params.v_reset)?;
    sim.declare_scalar("refractory", params.refractory)?;
    sim.declare_scalar("w", params.weight)?;

    add_group(&mut sim, "gp1", params.n_a, params.tau_a)?;
    add_group(&mut sim, "gp2", params.n_b, params.tau_b)?;

    sim.add_synapses("syn", "gp1", "gp2")?;
    sim.add_setup_kernel(SynapseCreate::new("syn_create", "syn").with_probability(params.p_connect))?;
    sim.add_kernel(
        SynapsePropagate::new("syn_pre", "syn")
            .binding(Binding::post("V_post", F32).of("gp2_v"))
            .binding(Binding::scalar("w", F32))
            .code(|lane| {
                let v = lane.f32("V_post") + lane.f32("w");
                lane.set_f32("V_post", v);
            }),
    )?;

    sim.add_kernel(SpikeMonitor::new("gp1_spikes", "gp1"))?;
    sim.add_kernel(SpikeMonitor::new("gp2_spikes", "gp2"))?;
    sim.add_kernel(
        StateMonitor::new("gp2_trace", "gp2", &["gp2_v"]).with_indices(0..params.recorded.min(params.n_b)),
    )?;
    Ok(sim)
}

fn add_group(sim: &mut Simulation, group: &str, n: usize, tau: f32) -> Result<(), ConfigError> {
    let v = format!("{group}_v");
    let lastspike = format!("{group}_lastspike");
    let tau_name = format!("{group}_tau");

    sim.add_neurons(group, n)?;
    sim.declare(&v, group, F32)?;
    sim.declare(&lastspike, group, F32)?;
    sim.declare_scalar(&tau_name, tau)?;
    sim.init_fill(&lastspike, -1e4f32);

    // Start somewhere between reset and threshold so groups do not fire in lockstep.
    sim.add_setup_kernel(
        StateUpdate::new(&format!("{group}_init"), group)
            .binding(Binding::own("V", F32).of(&v))
            .binding(Binding::scalar("v_reset", F32))
            .binding(Binding::scalar("v_threshold", F32))
            .code(|lane| {
                let lo = lane.f32("v_reset");
                let hi = lane.f32("v_threshold");
                let v = lo + lane.rand() * (hi - lo);
                lane.set_f32("V", v);
            }),
    )?;

    let update = StateUpdate::new(&format!("{group}_stateupdater"), group)
        .binding(Binding::own("V", F32).of(&v))
        .binding(Binding::own("lastspike", F32).of(&lastspike))
        .binding(Binding::scalar("tau", F32).of(&tau_name))
        .binding(Binding::scalar("V0", F32))
        .binding(Binding::scalar("refractory", F32))
        .code(|lane| {
            if lane.t() - lane.f32("lastspike") < lane.f32("refractory") {
                return;
            }
            let v0 = lane.f32("V0");
            let decay = (-lane.dt() / lane.f32("tau")).exp();
            let v = v0 + (lane.f32("V") - v0) * decay;
            lane.set_f32("V", v);
        });
    #[cfg(feature = "gpu")]
    let update = update.with_wgsl(UPDATE_WGSL);
    sim.add_kernel(update)?;

    sim.add_kernel(
        Threshold::new(&format!("{group}_thresholder"), group)
            .with_not_refractory(None)
            .with_lastspike(Some(&lastspike))
            .binding(Binding::own("V", F32).of(&v))
            .binding(Binding::own("lastspike", F32).of(&lastspike))
            .binding(Binding::scalar("v_threshold", F32))
            .binding(Binding::scalar("refractory", F32))
            .code(|lane| {
                let ready = lane.t() - lane.f32("lastspike") >= lane.f32("refractory");
                lane.set_cond(ready && lane.f32("V") > lane.f32("v_threshold"));
            }),
    )?;
    sim.add_kernel(
        Reset::new(&format!("{group}_resetter"), group)
            .binding(Binding::own("V", F32).of(&v))
            .binding(Binding::scalar("v_reset", F32))
            .code(|lane| {
                let v = lane.f32("v_reset");
                lane.set_f32("V", v);
            }),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionTier;

    fn small() -> LifParams {
        LifParams {
            n_a: 40,
            n_b: 4,
            p_connect: 0.5,
            ..LifParams::default()
        }
    }

    fn run(tier: ExecutionTier) -> Simulation {
        let config = SimulationConfig::new(1e-4, 0.1).with_seed(7).with_tier(tier);
        let mut sim = lif_network(config, &small()).unwrap();
        sim.setup().unwrap();
        sim.run().unwrap();
        sim
    }

    #[test]
    fn every_neuron_fires_and_respects_refractoriness() {
        let sim = run(ExecutionTier::Scalar);
        let log = sim.monitors().spike_log("gp1_spikes").unwrap();
        assert!(log.count.iter().all(|&c| c >= 2), "{:?}", log.count);
        for train in log.spike_trains() {
            for pair in train.windows(2) {
                assert!(pair[1] - pair[0] >= 5e-3 - 1e-6);
            }
        }
        let v = sim.registry().f32s("gp1_v").unwrap();
        assert!(v.iter().all(|&v| (-60.001e-3..=-48.999e-3).contains(&v)));
    }

    #[test]
    fn synapses_connect_gp1_to_gp2() {
        let sim = run(ExecutionTier::Scalar);
        let conn = sim.registry().connectivity(sim.registry().entity_set("syn").unwrap()).unwrap();
        assert!(!conn.is_empty());
        assert!(conn.pre().iter().all(|&i| i < 40));
        assert!(conn.post().iter().all(|&j| j < 4));

        let trace = sim.monitors().state_log("gp2_trace").unwrap();
        assert_eq!(trace.indices, vec![0, 1, 2]);
        assert_eq!(trace.t.len() as u64, sim.steps_executed());
    }

    #[test]
    fn tiers_agree() {
        let scalar = run(ExecutionTier::Scalar);
        let parallel = run(ExecutionTier::Parallel);
        assert_eq!(
            scalar.registry().f32s("gp2_v").unwrap(),
            parallel.registry().f32s("gp2_v").unwrap()
        );
        assert_eq!(scalar.monitors().snapshot(), parallel.monitors().snapshot());
    }
}
