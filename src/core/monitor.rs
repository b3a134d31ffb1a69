//! Monitor Sink: append-only spike and state logs plus their export.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ExportError, Result};
use crate::kernel::{resolve_one, StepContext};
use crate::lane::{Binding, RoleTargets};
use crate::registry::{EntitySetId, Entry, StateBuffers};

/// Every spike of one neuron group, in step order.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpikeLog {
    pub name: String,
    /// Spike times, parallel to `i`.
    pub t: Vec<f32>,
    /// Spiking neuron indices, parallel to `t`.
    pub i: Vec<u32>,
    /// Spikes per neuron.
    pub count: Vec<u32>,
}

impl SpikeLog {
    fn new(name: &str, neurons: usize) -> Self {
        Self {
            name: name.to_string(),
            t: Vec::new(),
            i: Vec::new(),
            count: vec![0; neurons],
        }
    }

    fn record(&mut self, t: f32, spikes: &[u32]) {
        for &idx in spikes {
            self.t.push(t);
            self.i.push(idx);
            self.count[idx as usize] += 1;
        }
    }

    pub fn num_spikes(&self) -> usize {
        self.i.len()
    }

    /// Spike times grouped per neuron.
    pub fn spike_trains(&self) -> Vec<Vec<f32>> {
        let mut trains = vec![Vec::new(); self.count.len()];
        for (&t, &i) in self.t.iter().zip(&self.i) {
            trains[i as usize].push(t);
        }
        trains
    }
}

/// Per-step samples of some variables at some indices of one group.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StateLog {
    pub name: String,
    pub variables: Vec<String>,
    pub indices: Vec<usize>,
    pub t: Vec<f32>,
    /// `values[v][k]` is the trace of `variables[v]` at `indices[k]`.
    pub values: Vec<Vec<Vec<f32>>>,
}

impl StateLog {
    pub fn trace(&self, variable: &str, index: usize) -> Option<&[f32]> {
        let v = self.variables.iter().position(|n| n == variable)?;
        let k = self.indices.iter().position(|&i| i == index)?;
        Some(&self.values[v][k])
    }
}

/// Owned copy of every log, handed to hosts.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MonitorSnapshot {
    pub spikes: Vec<SpikeLog>,
    pub states: Vec<StateLog>,
}

#[derive(Debug, Default)]
pub struct MonitorSink {
    spikes: Vec<SpikeLog>,
    states: Vec<StateLog>,
}

impl MonitorSink {
    pub(crate) fn clear(&mut self) {
        self.spikes.clear();
        self.states.clear();
    }

    fn register_spikes(&mut self, name: &str, neurons: usize) -> usize {
        self.spikes.push(SpikeLog::new(name, neurons));
        self.spikes.len() - 1
    }

    fn register_state(&mut self, log: StateLog) -> usize {
        self.states.push(log);
        self.states.len() - 1
    }

    pub fn spike_log(&self, name: &str) -> Option<&SpikeLog> {
        self.spikes.iter().find(|l| l.name == name)
    }

    pub fn state_log(&self, name: &str) -> Option<&StateLog> {
        self.states.iter().find(|l| l.name == name)
    }

    pub fn spike_logs(&self) -> &[SpikeLog] {
        &self.spikes
    }

    pub fn state_logs(&self) -> &[StateLog] {
        &self.states
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            spikes: self.spikes.clone(),
            states: self.states.clone(),
        }
    }
}

// =============================================================================
// Recording kernels
// =============================================================================

/// Appends `(t, i)` for every spike of its group and counts spikes per neuron.
#[derive(Debug, Clone)]
pub struct SpikeMonitor {
    name: String,
    group: String,
    bound: Option<(EntitySetId, usize)>,
}

impl SpikeMonitor {
    pub fn new(name: &str, group: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            bound: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind(
        &mut self,
        reg: &StateBuffers,
        sink: &mut MonitorSink,
    ) -> Result<(), ConfigError> {
        let group = reg.entity_set(&self.group)?;
        let log = sink.register_spikes(&self.name, reg.count(group));
        self.bound = Some((group, log));
        Ok(())
    }

    pub(crate) fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let (group, log) = self
            .bound
            .ok_or_else(|| ConfigError::NotSetUp.in_kernel(&self.name))?;
        ctx.monitors.spikes[log].record(ctx.t, ctx.spikes.get(group));
        Ok(())
    }
}

/// Samples variables of one group every step.
#[derive(Debug, Clone)]
pub struct StateMonitor {
    name: String,
    group: String,
    variables: Vec<String>,
    indices: Option<Vec<usize>>,
    bound: Option<(Vec<Entry>, Vec<usize>, usize)>,
}

impl StateMonitor {
    /// Records every index of `group` unless narrowed with [`Self::with_indices`].
    pub fn new(name: &str, group: &str, variables: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            variables: variables.iter().map(|v| v.to_string()).collect(),
            indices: None,
            bound: None,
        }
    }

    pub fn with_indices(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.indices = Some(indices.into_iter().collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind(
        &mut self,
        reg: &StateBuffers,
        sink: &mut MonitorSink,
    ) -> Result<(), ConfigError> {
        let group = reg.entity_set(&self.group)?;
        let count = reg.count(group);
        let targets = RoleTargets::own(group);
        let mut entries = Vec::with_capacity(self.variables.len());
        for var in &self.variables {
            let entry = reg.lookup(var).ok_or_else(|| ConfigError::UnknownVariable {
                name: var.clone(),
            })?;
            let ty = reg.entry_type(entry);
            entries.push(resolve_one(reg, Binding::own(var, ty), &targets)?);
        }
        let indices = match &self.indices {
            Some(indices) => {
                if let Some(&bad) = indices.iter().find(|&&i| i >= count) {
                    return Err(ConfigError::IndexOutOfRange {
                        name: self.group.clone(),
                        index: bad,
                        count,
                    });
                }
                indices.clone()
            }
            None => (0..count).collect(),
        };
        let log = sink.register_state(StateLog {
            name: self.name.clone(),
            variables: self.variables.clone(),
            indices: indices.clone(),
            t: Vec::new(),
            values: vec![vec![Vec::new(); indices.len()]; self.variables.len()],
        });
        self.bound = Some((entries, indices, log));
        Ok(())
    }

    pub(crate) fn dispatch(&self, ctx: &mut StepContext<'_>) -> Result<()> {
        let (entries, indices, log) = self
            .bound
            .as_ref()
            .ok_or_else(|| ConfigError::NotSetUp.in_kernel(&self.name))?;
        let log = &mut ctx.monitors.states[*log];
        log.t.push(ctx.t);
        for (entry, traces) in entries.iter().zip(log.values.iter_mut()) {
            for (&i, trace) in indices.iter().zip(traces.iter_mut()) {
                trace.push(ctx.registry.read(*entry, i).to_f32());
            }
        }
        Ok(())
    }
}

// =============================================================================
// Export
// =============================================================================

/// Receives a snapshot of every log at the end of a run.
pub trait MonitorExporter {
    fn export(&mut self, snapshot: &MonitorSnapshot) -> Result<(), ExportError>;
}

/// Write one line per row, every value followed by a space.
pub fn write_rows<W: Write>(w: &mut W, rows: &[Vec<f32>]) -> std::io::Result<()> {
    for row in rows {
        for value in row {
            write!(w, "{value} ")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

/// Plain-text files in one directory.
///
/// A spike log `name` becomes `name.txt` with one line of spike times per
/// neuron. A state log becomes `name_var.txt` per variable with one line per
/// recorded index.
#[derive(Debug, Clone)]
pub struct TextExporter {
    dir: PathBuf,
}

impl TextExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_file(&self, file_name: &str, rows: &[Vec<f32>]) -> Result<(), ExportError> {
        let path = self.dir.join(file_name);
        tracing::debug!("Writing monitor file {}", path.display());
        let mut w = BufWriter::new(File::create(path)?);
        write_rows(&mut w, rows)?;
        w.flush()?;
        Ok(())
    }
}

impl MonitorExporter for TextExporter {
    fn export(&mut self, snapshot: &MonitorSnapshot) -> Result<(), ExportError> {
        fs::create_dir_all(&self.dir)?;
        for log in &snapshot.spikes {
            self.write_file(&format!("{}.txt", log.name), &log.spike_trains())?;
        }
        for log in &snapshot.states {
            for (var, traces) in log.variables.iter().zip(&log.values) {
                self.write_file(&format!("{}_{}.txt", log.name, var), traces)?;
            }
        }
        Ok(())
    }
}

/// The whole snapshot as one JSON document.
#[cfg(feature = "serde")]
#[derive(Debug)]
pub struct JsonExporter<W: Write> {
    writer: W,
    pretty: bool,
}

#[cfg(feature = "serde")]
impl<W: Write> JsonExporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            pretty: false,
        }
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(feature = "serde")]
impl<W: Write> MonitorExporter for JsonExporter<W> {
    fn export(&mut self, snapshot: &MonitorSnapshot) -> Result<(), ExportError> {
        if self.pretty {
            serde_json::to_writer_pretty(&mut self.writer, snapshot)?;
        } else {
            serde_json::to_writer(&mut self.writer, snapshot)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> MonitorSnapshot {
        let mut spikes = SpikeLog::new("sm", 3);
        spikes.record(0.0, &[1]);
        spikes.record(0.5, &[0, 1]);
        MonitorSnapshot {
            spikes: vec![spikes],
            states: vec![StateLog {
                name: "vm".to_string(),
                variables: vec!["v".to_string()],
                indices: vec![0, 2],
                t: vec![0.0, 0.5],
                values: vec![vec![vec![1.0, 2.0], vec![-1.5, 0.25]]],
            }],
        }
    }

    #[test]
    fn spike_log_counts_and_trains() {
        let snap = snapshot();
        let log = &snap.spikes[0];
        assert_eq!(log.num_spikes(), 3);
        assert_eq!(log.count, vec![1, 2, 0]);
        assert_eq!(
            log.spike_trains(),
            vec![vec![0.5], vec![0.0, 0.5], Vec::<f32>::new()]
        );
    }

    #[test]
    fn state_log_trace_lookup() {
        let snap = snapshot();
        assert_eq!(snap.states[0].trace("v", 2), Some(&[-1.5, 0.25][..]));
        assert_eq!(snap.states[0].trace("v", 1), None);
        assert_eq!(snap.states[0].trace("w", 0), None);
    }

    #[test]
    fn rows_are_space_terminated() {
        let mut out = Vec::new();
        write_rows(&mut out, &[vec![1.0, 2.5], vec![], vec![0.125]]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1 2.5 \n\n0.125 \n");
    }

    #[test]
    fn text_exporter_writes_one_file_per_log_variable() {
        let dir = std::env::temp_dir().join(format!("spikegen-export-{}", std::process::id()));
        let mut exporter = TextExporter::new(&dir);
        exporter.export(&snapshot()).unwrap();
        let spikes = fs::read_to_string(dir.join("sm.txt")).unwrap();
        assert_eq!(spikes, "0.5 \n0 0.5 \n\n");
        let v = fs::read_to_string(dir.join("vm_v.txt")).unwrap();
        assert_eq!(v, "1 2 \n-1.5 0.25 \n");
        fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_exporter_round_trips_snapshot() {
        let snap = snapshot();
        let mut exporter = JsonExporter::new(Vec::new());
        exporter.export(&snap).unwrap();
        let bytes = exporter.into_inner();
        let back: MonitorSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, snap);
    }
}
