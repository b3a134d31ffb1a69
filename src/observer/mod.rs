use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SimState {
    #[default]
    NotStarted,
    Running,
    Completed,
    /// A fatal error stopped the run; `setup()` starts over.
    Aborted,
}

impl SimState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SimState::Running,
            2 => SimState::Completed,
            3 => SimState::Aborted,
            _ => SimState::NotStarted,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SimState::NotStarted => 0,
            SimState::Running => 1,
            SimState::Completed => 2,
            SimState::Aborted => 3,
        }
    }
}

/// A read-only snapshot of where a run is.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Progress {
    pub state: SimState,
    pub t: f32,
    pub duration: f32,
    pub step: u64,
    pub total_steps: u64,
    pub runtime: Duration,
    pub status_text: String,
}

impl Progress {
    /// Completed fraction in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        if self.total_steps == 0 {
            if self.state == SimState::Completed {
                1.0
            } else {
                0.0
            }
        } else {
            (self.step as f32 / self.total_steps as f32).min(1.0)
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    t_bits: AtomicU32,
    duration_bits: AtomicU32,
    step: AtomicU64,
    total_steps: AtomicU64,
    runtime_nanos: AtomicU64,
    status: RwLock<String>,
    description: RwLock<String>,
}

/// Cloneable handle for polling a run from another thread.
///
/// Only the simulation publishes; observers cannot steer it.
#[derive(Debug, Clone, Default)]
pub struct ProgressObserver {
    shared: Arc<Shared>,
}

impl ProgressObserver {
    pub fn state(&self) -> SimState {
        SimState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn time(&self) -> f32 {
        f32::from_bits(self.shared.t_bits.load(Ordering::Acquire))
    }

    pub fn duration(&self) -> f32 {
        f32::from_bits(self.shared.duration_bits.load(Ordering::Acquire))
    }

    pub fn step(&self) -> u64 {
        self.shared.step.load(Ordering::Acquire)
    }

    pub fn runtime(&self) -> Duration {
        Duration::from_nanos(self.shared.runtime_nanos.load(Ordering::Acquire))
    }

    pub fn status_text(&self) -> String {
        read_string(&self.shared.status)
    }

    pub fn description(&self) -> String {
        read_string(&self.shared.description)
    }

    pub fn progress(&self) -> Progress {
        Progress {
            state: self.state(),
            t: self.time(),
            duration: self.duration(),
            step: self.step(),
            total_steps: self.shared.total_steps.load(Ordering::Acquire),
            runtime: self.runtime(),
            status_text: self.status_text(),
        }
    }

    // Publishing side, used by the simulation loop.

    pub(crate) fn reset(&self, duration: f32, total_steps: u64, description: &str) {
        self.shared.step.store(0, Ordering::Release);
        self.shared.t_bits.store(0f32.to_bits(), Ordering::Release);
        self.shared
            .duration_bits
            .store(duration.to_bits(), Ordering::Release);
        self.shared.total_steps.store(total_steps, Ordering::Release);
        self.shared.runtime_nanos.store(0, Ordering::Release);
        write_string(&self.shared.status, "");
        write_string(&self.shared.description, description);
        self.set_state(SimState::NotStarted);
    }

    pub(crate) fn set_state(&self, state: SimState) {
        self.shared.state.store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn publish_step(&self, step: u64, t: f32, status: String) {
        self.shared.step.store(step, Ordering::Release);
        self.shared.t_bits.store(t.to_bits(), Ordering::Release);
        write_string(&self.shared.status, status);
    }

    pub(crate) fn set_status(&self, status: impl Into<String>) {
        write_string(&self.shared.status, status);
    }

    pub(crate) fn set_runtime(&self, runtime: Duration) {
        let nanos = u64::try_from(runtime.as_nanos()).unwrap_or(u64::MAX);
        self.shared.runtime_nanos.store(nanos, Ordering::Release);
    }
}

// Poisoned locks still hold a valid String.
fn read_string(lock: &RwLock<String>) -> String {
    match lock.read() {
        Ok(s) => s.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write_string(lock: &RwLock<String>, value: impl Into<String>) {
    let value = value.into();
    match lock.write() {
        Ok(mut s) => *s = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn published_values_are_visible_from_clones() {
        let observer = ProgressObserver::default();
        let handle = observer.clone();
        observer.reset(1.0, 10, "demo");
        observer.set_state(SimState::Running);
        observer.publish_step(3, 0.3, "Running simulation: 0.3/1".to_string());

        let p = handle.progress();
        assert_eq!(p.state, SimState::Running);
        assert_eq!(p.step, 3);
        assert!((p.t - 0.3).abs() < 1e-6);
        assert!((p.fraction() - 0.3).abs() < 1e-6);
        assert_eq!(p.status_text, "Running simulation: 0.3/1");
        assert_eq!(handle.description(), "demo");
    }

    #[test]
    fn polling_from_another_thread() {
        let observer = ProgressObserver::default();
        observer.reset(2.0, 4, "");
        let handle = observer.clone();
        let reader = std::thread::spawn(move || handle.duration());
        assert_eq!(reader.join().unwrap(), 2.0);
    }

    #[test]
    fn empty_run_fraction() {
        let mut p = ProgressObserver::default().progress();
        assert_eq!(p.fraction(), 0.0);
        p.state = SimState::Completed;
        assert_eq!(p.fraction(), 1.0);
    }
}
