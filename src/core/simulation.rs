//! Simulation Loop: setup queue, clock, fixed kernel order, progress.
//!
//! ```
//! use spikegen::prelude::*;
//!
//! let config = SimulationConfig::new(0.1, 1.0);
//! let mut sim = Simulation::new(config).unwrap();
//! sim.add_neurons("g", 4).unwrap();
//! sim.declare("v", "g", ElementType::F32).unwrap();
//! sim.add_kernel(
//!     StateUpdate::new("update", "g")
//!         .binding(Binding::own("v", ElementType::F32))
//!         .code(|lane| {
//!             let v = lane.f32("v") + lane.dt();
//!             lane.set_f32("v", v);
//!         }),
//! )
//! .unwrap();
//!
//! sim.setup().unwrap();
//! sim.run().unwrap();
//! assert_eq!(sim.state(), SimState::Completed);
//! assert_eq!(sim.steps_executed(), 10);
//! ```

use std::time::{Duration, Instant};

use crate::config::{ExecutionTier, SimulationConfig};
use crate::error::{ConfigError, ExportError, Result};
use crate::kernel::{IndexFilter, Kernel, Phase, SpikeSets, StepContext};
use crate::monitor::{MonitorExporter, MonitorSink};
use crate::observer::{Progress, ProgressObserver, SimState};
use crate::registry::{Column, ElementType, EntitySetId, StateBuffers, Value};

type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

/// Initializers replayed, in order, by every `setup()`.
#[derive(Debug, Clone)]
enum SetupOp {
    Arange { name: String, start: i32 },
    Values { name: String, values: Column },
    At { name: String, indices: Vec<usize>, values: Column },
    Fill { name: String, value: Value },
    Scalar { name: String, value: Value },
    Kernel(Box<Kernel>),
}

pub struct Simulation {
    config: SimulationConfig,
    registry: StateBuffers,
    setup_queue: Vec<SetupOp>,
    schedule: Vec<Kernel>,
    spikes: SpikeSets,
    monitors: MonitorSink,
    observer: ProgressObserver,
    on_progress: Option<ProgressCallback>,
    tier: ExecutionTier,
    state: SimState,
    ready: bool,
    step: u64,
    total_steps: u64,
    started: Option<Instant>,
    runtime: Duration,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let observer = ProgressObserver::default();
        let total_steps = config.total_steps();
        observer.reset(config.duration, total_steps, &config.description);
        Ok(Self {
            tier: config.tier,
            config,
            registry: StateBuffers::new(),
            setup_queue: Vec::new(),
            schedule: Vec::new(),
            spikes: SpikeSets::default(),
            monitors: MonitorSink::default(),
            observer,
            on_progress: None,
            state: SimState::NotStarted,
            ready: false,
            step: 0,
            total_steps,
            started: None,
            runtime: Duration::ZERO,
        })
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn registry(&self) -> &StateBuffers {
        &self.registry
    }

    /// Direct registry access. Changes are lost on the next `setup()`;
    /// use the `init_*` methods for initial values.
    pub fn registry_mut(&mut self) -> &mut StateBuffers {
        &mut self.registry
    }

    // =========================================================================
    // Model declaration
    // =========================================================================

    pub fn add_neurons(&mut self, name: &str, count: usize) -> Result<EntitySetId, ConfigError> {
        self.invalidate();
        self.registry.declare_neurons(name, count)
    }

    pub fn add_synapses(
        &mut self,
        name: &str,
        source: &str,
        target: &str,
    ) -> Result<EntitySetId, ConfigError> {
        self.invalidate();
        self.registry.declare_synapses(name, source, target)
    }

    pub fn declare(&mut self, name: &str, group: &str, ty: ElementType) -> Result<(), ConfigError> {
        self.invalidate();
        let group = self.registry.entity_set(group)?;
        self.registry.declare(name, group, ty)?;
        Ok(())
    }

    pub fn declare_scalar(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ConfigError> {
        self.invalidate();
        self.registry.declare_scalar(name, value.into())
    }

    /// Fill `name` with `start, start + 1, ...` during setup.
    pub fn init_arange(&mut self, name: &str, start: i32) {
        self.push_setup(SetupOp::Arange {
            name: name.to_string(),
            start,
        });
    }

    /// Copy `values` into `name` during setup.
    pub fn init_values(&mut self, name: &str, values: Column) {
        self.push_setup(SetupOp::Values {
            name: name.to_string(),
            values,
        });
    }

    /// Write `values[k]` to element `indices[k]` of `name` during setup.
    pub fn init_at(&mut self, name: &str, indices: &[usize], values: Column) {
        self.push_setup(SetupOp::At {
            name: name.to_string(),
            indices: indices.to_vec(),
            values,
        });
    }

    pub fn init_fill(&mut self, name: &str, value: impl Into<Value>) {
        self.push_setup(SetupOp::Fill {
            name: name.to_string(),
            value: value.into(),
        });
    }

    pub fn init_scalar(&mut self, name: &str, value: impl Into<Value>) {
        self.push_setup(SetupOp::Scalar {
            name: name.to_string(),
            value: value.into(),
        });
    }

    /// Queue a one-shot kernel (synapse creation or an initializing state
    /// update) to run during setup, after the initializers queued before it.
    pub fn add_setup_kernel(&mut self, kernel: impl Into<Kernel>) -> Result<(), ConfigError> {
        let kernel = kernel.into();
        if !matches!(kernel, Kernel::SynapseCreate(_) | Kernel::StateUpdate(_)) {
            return Err(ConfigError::NotOneShot {
                name: kernel.name().to_string(),
            });
        }
        self.check_unique(kernel.name())?;
        self.push_setup(SetupOp::Kernel(Box::new(kernel)));
        Ok(())
    }

    /// Schedule a kernel for every step. The schedule is kept stably sorted
    /// by phase, so registration order only matters within a phase.
    pub fn add_kernel(&mut self, kernel: impl Into<Kernel>) -> Result<(), ConfigError> {
        let kernel = kernel.into();
        if kernel.phase() == Phase::Once {
            return Err(ConfigError::NotSchedulable {
                name: kernel.name().to_string(),
            });
        }
        self.check_unique(kernel.name())?;
        self.invalidate();
        self.schedule.push(kernel);
        self.schedule.sort_by_key(Kernel::phase);
        Ok(())
    }

    /// Called after every step with the freshly published progress.
    pub fn on_progress<F>(&mut self, f: F)
    where
        F: FnMut(&Progress) + Send + 'static,
    {
        self.on_progress = Some(Box::new(f));
    }

    fn check_unique(&self, name: &str) -> Result<(), ConfigError> {
        let setup_names = self.setup_queue.iter().filter_map(|op| match op {
            SetupOp::Kernel(k) => Some(k.name()),
            _ => None,
        });
        let taken = self
            .schedule
            .iter()
            .map(Kernel::name)
            .chain(setup_names)
            .any(|n| n == name);
        if taken {
            return Err(ConfigError::Duplicate {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn push_setup(&mut self, op: SetupOp) {
        self.invalidate();
        self.setup_queue.push(op);
    }

    fn invalidate(&mut self) {
        self.ready = false;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Zero every array, replay the setup queue and bind every scheduled
    /// kernel. May be called again from any state except mid-run; a failure
    /// leaves the simulation `NotStarted` and unable to run.
    pub fn setup(&mut self) -> Result<()> {
        self.ready = false;
        self.state = SimState::NotStarted;
        self.step = 0;
        self.started = None;
        self.runtime = Duration::ZERO;
        self.total_steps = self.config.total_steps();
        self.observer.reset(
            self.config.duration,
            self.total_steps,
            &self.config.description,
        );

        self.tier = self.config.tier.effective();
        if self.tier != self.config.tier {
            tracing::warn!(
                "Requested {:?} tier is unavailable, using {:?}",
                self.config.tier,
                self.tier
            );
        }

        self.registry.zero_all();
        self.spikes.clear();
        self.monitors.clear();

        for op in &mut self.setup_queue {
            apply_setup_op(
                op,
                &mut self.registry,
                &mut self.spikes,
                &mut self.monitors,
                &self.config,
                self.tier,
            )?;
        }
        for kernel in &mut self.schedule {
            kernel.bind(&self.registry, &mut self.monitors)?;
        }

        self.ready = true;
        tracing::info!(
            kernels = self.schedule.len(),
            steps = self.total_steps,
            tier = ?self.tier,
            "Simulation set up"
        );
        Ok(())
    }

    /// Run to completion, blocking. Requires `setup()`.
    pub fn run(&mut self) -> Result<()> {
        if self.state == SimState::Completed {
            return Err(ConfigError::AlreadyCompleted.into());
        }
        tracing::info!(
            "Running simulation: {} steps of {}s",
            self.total_steps - self.step,
            self.config.dt
        );
        while self.state != SimState::Completed {
            self.step()?;
        }
        Ok(())
    }

    /// Execute exactly one step, or complete the run if the horizon is reached.
    pub fn step(&mut self) -> Result<()> {
        if !self.ready {
            return Err(ConfigError::NotSetUp.into());
        }
        match self.state {
            SimState::Completed => return Err(ConfigError::AlreadyCompleted.into()),
            SimState::Aborted => return Err(ConfigError::NotSetUp.into()),
            SimState::NotStarted => self.begin(),
            SimState::Running => {}
        }
        if self.step >= self.total_steps {
            self.finish();
            return Ok(());
        }

        let t = self.time_at(self.step);
        self.spikes.clear();
        let mut ctx = StepContext {
            registry: &mut self.registry,
            spikes: &mut self.spikes,
            monitors: &mut self.monitors,
            t,
            dt: self.config.dt,
            step: self.step,
            seed: self.config.seed,
            tier: self.tier,
            staging_capacity: self.config.staging_capacity,
        };
        let mut failure = None;
        for kernel in &mut self.schedule {
            if let Err(e) = kernel.dispatch(&mut ctx) {
                failure = Some(e);
                break;
            }
        }
        if let Some(e) = failure {
            self.abort(&e);
            return Err(e);
        }

        self.step += 1;
        tracing::trace!(step = self.step, t, "step");
        self.observer.publish_step(
            self.step,
            self.time(),
            format!("Running simulation: {}/{}", t, self.config.duration),
        );
        if let Some(callback) = self.on_progress.as_mut() {
            callback(&self.observer.progress());
        }
        if self.step >= self.total_steps {
            self.finish();
        }
        Ok(())
    }

    fn begin(&mut self) {
        self.state = SimState::Running;
        self.observer.set_state(SimState::Running);
        self.started = Some(Instant::now());
    }

    fn finish(&mut self) {
        self.runtime = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.state = SimState::Completed;
        self.observer.set_runtime(self.runtime);
        self.observer.set_status("Simulation complete");
        self.observer.set_state(SimState::Completed);
        tracing::info!(
            steps = self.step,
            runtime_ms = self.runtime.as_secs_f64() * 1e3,
            "Simulation complete"
        );
    }

    fn abort(&mut self, error: &crate::error::SimError) {
        self.runtime = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.state = SimState::Aborted;
        self.ready = false;
        self.observer.set_runtime(self.runtime);
        self.observer.set_status(format!("Simulation aborted: {error}"));
        self.observer.set_state(SimState::Aborted);
        tracing::error!(step = self.step, "Simulation aborted: {error}");
    }

    fn time_at(&self, step: u64) -> f32 {
        self.config.time_at(step)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Current time: `steps_executed() * dt`.
    pub fn time(&self) -> f32 {
        self.time_at(self.step)
    }

    pub fn duration(&self) -> f32 {
        self.config.duration
    }

    pub fn steps_executed(&self) -> u64 {
        self.step
    }

    pub fn total_steps(&self) -> u64 {
        self.total_steps
    }

    pub fn progress(&self) -> Progress {
        self.observer.progress()
    }

    pub fn status_text(&self) -> String {
        self.observer.status_text()
    }

    /// Wall-clock time of the last completed (or aborted) run.
    pub fn runtime(&self) -> Duration {
        self.runtime
    }

    pub fn state(&self) -> SimState {
        self.state
    }

    pub fn description(&self) -> &str {
        &self.config.description
    }

    /// Tier resolved by the last `setup()`.
    pub fn effective_tier(&self) -> ExecutionTier {
        self.tier
    }

    /// A handle that reads the same progress from any thread.
    pub fn observer(&self) -> ProgressObserver {
        self.observer.clone()
    }

    pub fn monitors(&self) -> &MonitorSink {
        &self.monitors
    }

    pub fn export_monitors(&self, exporter: &mut impl MonitorExporter) -> Result<(), ExportError> {
        exporter.export(&self.monitors.snapshot())
    }

    /// Spike Index Set of `group` from the most recent step.
    pub fn spikes(&self, group: &str) -> Result<&[u32], ConfigError> {
        Ok(self.spikes.get(self.registry.entity_set(group)?))
    }

    /// Evaluate a filter against the current state without modifying it.
    pub fn filter_indices(&self, filter: &mut IndexFilter) -> Result<Vec<u32>> {
        let name = filter.name().to_string();
        filter
            .bind(&self.registry)
            .map_err(|e| e.in_kernel(&name))?;
        let matches = filter.evaluate(
            &self.registry,
            self.time(),
            self.config.dt,
            self.step,
            self.config.seed,
            self.tier.cpu() == ExecutionTier::Parallel,
        )?;
        Ok(matches.to_vec())
    }
}

fn apply_setup_op(
    op: &mut SetupOp,
    registry: &mut StateBuffers,
    spikes: &mut SpikeSets,
    monitors: &mut MonitorSink,
    config: &SimulationConfig,
    tier: ExecutionTier,
) -> Result<()> {
    match op {
        SetupOp::Arange { name, start } => registry.fill_arange(name, *start)?,
        SetupOp::Values { name, values } => registry.set_values(name, values)?,
        SetupOp::At {
            name,
            indices,
            values,
        } => registry.set_at(name, indices, values)?,
        SetupOp::Fill { name, value } => registry.fill(name, *value)?,
        SetupOp::Scalar { name, value } => registry.set_scalar(name, *value)?,
        SetupOp::Kernel(kernel) => {
            kernel.bind(registry, monitors)?;
            let mut ctx = StepContext {
                registry,
                spikes,
                monitors,
                t: 0.0,
                dt: config.dt,
                step: 0,
                seed: config.seed,
                tier,
                staging_capacity: config.staging_capacity,
            };
            kernel.dispatch(&mut ctx)?;
        }
    }
    Ok(())
}
