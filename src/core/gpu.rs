//! GPU compute backend using wgpu for state-update kernels.
//!
//! A StateUpdate kernel that carries WGSL statement lines can run as one
//! compute invocation per neuron. The skeleton loads every own-indexed `f32`
//! binding into a local, splices the lines in verbatim, and stores the locals
//! back. Scalars are read from a small uniform-like storage array.
//!
//! Enable with the `gpu` feature flag.

use std::borrow::Cow;
use std::cell::RefCell;
use std::fmt::Write as _;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use thiserror::Error;
use wgpu::util::DeviceExt;

use crate::lane::{IndexRole, Layout};
use crate::registry::{ElementType, StateBuffers, Value};

/// Largest entity count the shared context accepts.
pub const DEFAULT_MAX_ELEMENTS: usize = 1 << 22;

/// Storage buffers available per shader stage under default limits.
const MAX_STORAGE_BUFFERS: usize = 8;

const WORKGROUP_SIZE: usize = 64;

thread_local! {
    static GPU_CTX: std::cell::OnceCell<Option<GpuContext>> = const { std::cell::OnceCell::new() };
}

/// Access the shared GPU context (lazily initialized).
///
/// The context is cached per-thread for simplicity.
pub fn with_gpu_context<T>(max_elements: usize, f: impl FnOnce(Option<&GpuContext>) -> T) -> T {
    GPU_CTX.with(|cell| {
        let ctx = cell.get_or_init(|| GpuContext::new(max_elements));
        f(ctx.as_ref())
    })
}

/// Returns true if a GPU context can be created.
///
/// Note: this may initialize the GPU context and can be expensive.
pub fn gpu_available(max_elements: usize) -> bool {
    with_gpu_context(max_elements, |ctx| ctx.is_some())
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct GpuParams {
    pub n: u32,
    pub t: f32,
    pub dt: f32,
    pub _pad: u32,
}

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("no GPU adapter/device available")]
    NoDevice,

    #[error("failed to receive GPU result")]
    ReceiveError,

    #[error("GPU buffer mapping failed: {0:?}")]
    MapError(wgpu::BufferAsyncError),

    #[error("requested {requested} elements exceeds max {max}")]
    SizeExceeded { requested: usize, max: usize },

    #[error("kernel `{kernel}` cannot run on the GPU: {reason}")]
    Unsupported { kernel: String, reason: String },

    #[error("kernel `{kernel}` failed shader validation: {message}")]
    Shader { kernel: String, message: String },
}

struct CachedPipeline {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
}

/// GPU compute context shared by every state-update kernel on this thread.
pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_elements: usize,
    pipelines: RefCell<HashMap<String, CachedPipeline>>,
}

impl GpuContext {
    /// Create a new GPU context. Blocks until GPU is ready.
    pub fn new(max_elements: usize) -> Option<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("spikegen GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .ok()?;

        tracing::info!(adapter = ?adapter.get_info().name, "GPU context ready");
        Some(Self {
            device,
            queue,
            max_elements,
            pipelines: RefCell::new(HashMap::new()),
        })
    }

    /// Compile (or reuse) the pipeline for `source` with `storage` read-write arrays.
    fn pipeline(
        &self,
        kernel: &str,
        source: &str,
        storage: usize,
    ) -> Result<std::cell::Ref<'_, CachedPipeline>, GpuError> {
        if !self.pipelines.borrow().contains_key(source) {
            let compiled = self.compile(kernel, source, storage)?;
            self.pipelines
                .borrow_mut()
                .insert(source.to_string(), compiled);
        }
        let pipelines = self.pipelines.borrow();
        std::cell::Ref::filter_map(pipelines, |p| p.get(source)).map_err(|_| GpuError::Shader {
            kernel: kernel.to_string(),
            message: "pipeline cache miss".to_string(),
        })
    }

    fn compile(&self, kernel: &str, source: &str, storage: usize) -> Result<CachedPipeline, GpuError> {
        let buffer_entry = |binding: u32, ty: wgpu::BufferBindingType| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let mut entries = vec![
            // Params uniform
            buffer_entry(0, wgpu::BufferBindingType::Uniform),
            // Scalars (read-only)
            buffer_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
        ];
        for k in 0..storage {
            entries.push(buffer_entry(
                2 + k as u32,
                wgpu::BufferBindingType::Storage { read_only: false },
            ));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(kernel),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("State Update Bind Group Layout"),
                entries: &entries,
            });
        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("State Update Pipeline Layout"),
                bind_group_layouts: &[&layout],
                push_constant_ranges: &[],
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(kernel),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("main"),
                compilation_options: Default::default(),
                cache: None,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(GpuError::Shader {
                kernel: kernel.to_string(),
                message: err.to_string(),
            });
        }
        tracing::debug!(kernel, "compiled GPU state update");
        Ok(CachedPipeline { pipeline, layout })
    }

    /// Run one state-update dispatch over `columns` (one per own-indexed
    /// variable, all of length `params.n`) and read the results back.
    pub fn run_state_update(
        &self,
        kernel: &str,
        source: &str,
        params: GpuParams,
        scalars: &[f32],
        columns: &mut [Vec<f32>],
    ) -> Result<(), GpuError> {
        let n = params.n as usize;
        if n == 0 {
            return Ok(());
        }
        if n > self.max_elements {
            return Err(GpuError::SizeExceeded {
                requested: n,
                max: self.max_elements,
            });
        }
        let cached = self.pipeline(kernel, source, columns.len())?;

        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params Buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        // Zero-sized storage bindings are invalid.
        let scalar_data: Vec<f32> = if scalars.is_empty() {
            vec![0.0]
        } else {
            scalars.to_vec()
        };
        let scalars_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Scalars Buffer"),
                contents: bytemuck::cast_slice(&scalar_data),
                usage: wgpu::BufferUsages::STORAGE,
            });
        let column_buffers: Vec<wgpu::Buffer> = columns
            .iter()
            .map(|col| {
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("State Buffer"),
                        contents: bytemuck::cast_slice(col),
                        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                    })
            })
            .collect();
        let bytes = (n * std::mem::size_of::<f32>()) as u64;
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: bytes * columns.len() as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: scalars_buffer.as_entire_binding(),
            },
        ];
        for (k, buffer) in column_buffers.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: 2 + k as u32,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("State Update Bind Group"),
            layout: &cached.layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("State Update Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("State Update Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&cached.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(n.div_ceil(WORKGROUP_SIZE) as u32, 1, 1);
        }
        for (k, buffer) in column_buffers.iter().enumerate() {
            encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, bytes * k as u64, bytes);
        }
        self.queue.submit(std::iter::once(encoder.finish()));

        // Read back results
        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        let map_result = rx.recv().map_err(|_| GpuError::ReceiveError)?;
        map_result.map_err(GpuError::MapError)?;

        {
            let data = buffer_slice.get_mapped_range();
            let result: &[f32] = bytemuck::cast_slice(&data);
            for (col, chunk) in columns.iter_mut().zip(result.chunks_exact(n)) {
                col.copy_from_slice(chunk);
            }
        }
        staging_buffer.unmap();
        Ok(())
    }
}

/// Generate the compute shader for one state update.
pub fn state_update_shader(lines: &[String], own: &[&str], scalars: &[&str]) -> String {
    let mut src = String::new();
    src.push_str(
        "struct Params {\n    n: u32,\n    t: f32,\n    dt: f32,\n    _pad: u32,\n}\n\n\
         @group(0) @binding(0) var<uniform> params: Params;\n\
         @group(0) @binding(1) var<storage, read> scalars: array<f32>;\n",
    );
    for (k, name) in own.iter().enumerate() {
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read_write> _array_{name}: array<f32>;",
            k + 2
        );
    }
    let _ = writeln!(src, "\n@compute @workgroup_size({WORKGROUP_SIZE})");
    src.push_str("fn main(@builtin(global_invocation_id) gid: vec3<u32>) {\n");
    src.push_str("    let _idx = gid.x;\n    if _idx >= params.n {\n        return;\n    }\n");
    src.push_str("    let t = params.t;\n    let dt = params.dt;\n");
    for (k, name) in scalars.iter().enumerate() {
        let _ = writeln!(src, "    let {name} = scalars[{k}];");
    }
    for name in own {
        let _ = writeln!(src, "    var {name} = _array_{name}[_idx];");
    }
    for line in lines {
        let _ = writeln!(src, "    {line}");
    }
    for name in own {
        let _ = writeln!(src, "    _array_{name}[_idx] = {name};");
    }
    src.push_str("}\n");
    src
}

/// Dispatch a StateUpdate kernel on the shared context.
///
/// Only `f32` bindings with `Own` or `Scalar` roles are supported; anything
/// else returns [`GpuError::Unsupported`] so the caller can fall back.
pub(crate) fn run_state_update(
    kernel: &str,
    lines: &[String],
    layout: &Layout,
    reg: &mut StateBuffers,
    count: usize,
    t: f32,
    dt: f32,
) -> Result<(), GpuError> {
    let unsupported = |reason: String| GpuError::Unsupported {
        kernel: kernel.to_string(),
        reason,
    };
    let mut own = Vec::new();
    let mut scalars = Vec::new();
    for slot in layout.slots() {
        if slot.ty() != ElementType::F32 {
            return Err(unsupported(format!("`{}` is {}", slot.name(), slot.ty())));
        }
        match slot.role() {
            IndexRole::Own => own.push(slot),
            IndexRole::Scalar => scalars.push(slot),
            IndexRole::Pre | IndexRole::Post => {
                return Err(unsupported(format!("`{}` is not own-indexed", slot.name())))
            }
        }
    }
    if own.is_empty() {
        return Err(unsupported("no own-indexed arrays bound".to_string()));
    }
    if own.len() + 1 > MAX_STORAGE_BUFFERS {
        return Err(unsupported(format!("{} arrays bound", own.len())));
    }
    let n = u32::try_from(count).map_err(|_| GpuError::SizeExceeded {
        requested: count,
        max: u32::MAX as usize,
    })?;

    let own_names: Vec<&str> = own.iter().map(|s| s.name()).collect();
    let scalar_names: Vec<&str> = scalars.iter().map(|s| s.name()).collect();
    let source = state_update_shader(lines, &own_names, &scalar_names);
    let scalar_values: Vec<f32> = scalars.iter().map(|s| reg.read(s.entry(), 0).to_f32()).collect();
    let mut columns: Vec<Vec<f32>> = own
        .iter()
        .map(|s| (0..count).map(|i| reg.read(s.entry(), i).to_f32()).collect())
        .collect();

    let params = GpuParams { n, t, dt, _pad: 0 };
    with_gpu_context(DEFAULT_MAX_ELEMENTS, |ctx| {
        let ctx = ctx.ok_or(GpuError::NoDevice)?;
        ctx.run_state_update(kernel, &source, params, &scalar_values, &mut columns)
    })?;

    for (slot, column) in own.iter().zip(&columns) {
        for (i, &v) in column.iter().enumerate() {
            reg.write(slot.entry(), i, Value::F32(v));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::{Binding, RoleTargets};

    #[test]
    fn shader_splices_lines_between_loads_and_stores() {
        let src = state_update_shader(
            &["v = v + dt * (-v / tau);".to_string()],
            &["v"],
            &["tau"],
        );
        let load = src.find("var v = _array_v[_idx];").unwrap();
        let line = src.find("v = v + dt * (-v / tau);").unwrap();
        let store = src.find("_array_v[_idx] = v;").unwrap();
        assert!(load < line && line < store);
        assert!(src.contains("let tau = scalars[0];"));
        assert!(src.contains("@binding(2) var<storage, read_write> _array_v"));
    }

    #[test]
    fn non_f32_bindings_are_unsupported() {
        let mut reg = StateBuffers::new();
        let g = reg.declare_neurons("g", 4).unwrap();
        reg.declare("n", g, ElementType::I32).unwrap();
        let layout = Layout::resolve(
            &reg,
            &[Binding::own("n", ElementType::I32)],
            &RoleTargets::own(g),
        )
        .unwrap();
        let err = run_state_update("k", &[], &layout, &mut reg, 4, 0.0, 0.1).unwrap_err();
        assert!(matches!(err, GpuError::Unsupported { .. }));
    }

    #[test]
    fn scalar_only_bindings_are_unsupported() {
        let mut reg = StateBuffers::new();
        reg.declare_neurons("g", 4).unwrap();
        reg.declare_scalar("tau", Value::F32(0.01)).unwrap();
        let g = reg.entity_set("g").unwrap();
        let layout = Layout::resolve(
            &reg,
            &[Binding::scalar("tau", ElementType::F32)],
            &RoleTargets::own(g),
        )
        .unwrap();
        let err = run_state_update("k", &[], &layout, &mut reg, 4, 0.0, 0.1).unwrap_err();
        match err {
            GpuError::Unsupported { kernel, reason } => {
                assert_eq!(kernel, "k");
                assert!(reason.contains("no own-indexed"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gpu_context_creation() {
        // This test may fail on systems without GPU support
        let ctx = GpuContext::new(1024);
        if ctx.is_some() {
            println!("GPU context created successfully");
        } else {
            println!("No GPU available (expected in some CI environments)");
        }
    }
}
