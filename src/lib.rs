//! # spikegen
//!
//! Kernel skeletons and a deterministic stepping loop for discrete-time
//! spiking network simulation.
//!
//! A model front end declares entity sets and their state arrays, then hands
//! the loop a list of kernels: each carries named bindings into the registry
//! plus an injected per-lane computation. The loop owns the clock, runs the
//! kernels in a fixed phase order every step, and publishes progress.
//!
//! ## Quick Start
//!
//! ```
//! use spikegen::prelude::*;
//!
//! let mut sim = Simulation::new(SimulationConfig::new(1e-3, 0.05).with_seed(42)).unwrap();
//! sim.add_neurons("g", 8).unwrap();
//! sim.declare("v", "g", ElementType::F32).unwrap();
//! sim.declare("not_refractory", "g", ElementType::Bool).unwrap();
//! sim.declare("lastspike", "g", ElementType::F32).unwrap();
//!
//! sim.add_kernel(
//!     StateUpdate::new("update", "g")
//!         .binding(Binding::own("v", ElementType::F32))
//!         .code(|lane| {
//!             let v = lane.f32("v") + 50.0 * lane.dt();
//!             lane.set_f32("v", v);
//!         }),
//! )
//! .unwrap();
//! sim.add_kernel(
//!     Threshold::new("threshold", "g")
//!         .binding(Binding::own("v", ElementType::F32))
//!         .code(|lane| {
//!             let v = lane.f32("v");
//!             lane.set_cond(v > 1.0);
//!         }),
//! )
//! .unwrap();
//! sim.add_kernel(
//!     Reset::new("reset", "g")
//!         .binding(Binding::own("v", ElementType::F32))
//!         .code(|lane| lane.set_f32("v", 0.0)),
//! )
//! .unwrap();
//! sim.add_kernel(SpikeMonitor::new("spikes", "g")).unwrap();
//!
//! sim.setup().unwrap();
//! sim.run().unwrap();
//! assert!(sim.monitors().spike_log("spikes").unwrap().num_spikes() > 0);
//! ```
//!
//! ## Feature Flags
//!
//! - `serde` (default): Serde derives on config and monitor snapshots, JSON export
//! - `parallel`: Run data-parallel kernels across threads via rayon
//! - `gpu`: Run state updates supplied as WGSL lines via wgpu
//!
//! ## Modules
//!
//! - [`registry`]: Named state arrays, scalars and connectivity
//! - [`kernel`]: Kernel variants and their dispatch
//! - [`synapse_builder`]: Synapse creation through staging buffers
//! - [`simulation`]: Setup queue, clock and the stepping loop
//! - [`monitor`]: Spike and state recording plus exporters
//! - [`observer`]: Read-only progress handle for other threads

#[path = "core/config.rs"]
pub mod config;

#[path = "core/error.rs"]
pub mod error;

#[path = "core/prng.rs"]
pub mod prng;

#[path = "core/registry.rs"]
pub mod registry;

#[path = "core/lane.rs"]
pub mod lane;

#[path = "core/kernel.rs"]
pub mod kernel;

#[path = "core/staging.rs"]
pub mod staging;

#[path = "core/synapse_builder.rs"]
pub mod synapse_builder;

#[path = "core/monitor.rs"]
pub mod monitor;

#[path = "core/simulation.rs"]
pub mod simulation;

#[cfg(feature = "gpu")]
#[path = "core/gpu.rs"]
pub mod gpu;

pub mod observer;

pub mod experiments;

/// Prelude module for convenient imports.
///
/// ```
/// use spikegen::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ExecutionTier, SimulationConfig};
    pub use crate::error::{ConfigError, ExportError, ResourceError, SimError};
    pub use crate::kernel::{
        IndexFilter, Kernel, LumpedVariable, Pathway, Phase, Reset, StateUpdate, SynapsePropagate,
        Threshold,
    };
    pub use crate::lane::{Binding, IndexRole, Injected, Lane};
    #[cfg(feature = "serde")]
    pub use crate::monitor::JsonExporter;
    pub use crate::monitor::{
        MonitorExporter, MonitorSnapshot, SpikeLog, SpikeMonitor, StateLog, StateMonitor,
        TextExporter,
    };
    pub use crate::observer::{Progress, ProgressObserver, SimState};
    pub use crate::registry::{Column, ElementType, StateBuffers, Value};
    pub use crate::simulation::Simulation;
    pub use crate::synapse_builder::SynapseCreate;
}
