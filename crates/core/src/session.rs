//! Inference sessions: one loaded model, one tile forward pass at a time.
//!
//! The tiler only sees [`TileInference`] and [`SessionFactory`]. The ONNX
//! Runtime implementation probes execution providers once when the session
//! is built (TensorRT, then CUDA, with CPU always last) and handles FP16
//! models by converting at the session boundary.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProvider, ExecutionProviderDispatch,
        TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor as OrtTensor,
};
use tracing::{debug, info, warn};

use crate::tensor::Tensor;

/// Execution provider a session may run on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ExecutionBackend {
    Tensorrt,
    #[default]
    Cuda,
    Cpu,
}

impl ExecutionBackend {
    /// Parse from string (case-insensitive). Returns `Cpu` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cuda" | "gpu" => Self::Cuda,
            _ => Self::Cpu,
        }
    }
}

impl std::fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cuda => write!(f, "cuda"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Filters `preference` down to the backends `probe` reports as usable,
/// dropping duplicates and always ending with `Cpu`.
pub fn select_backends(
    preference: &[ExecutionBackend],
    probe: impl Fn(ExecutionBackend) -> bool,
) -> Vec<ExecutionBackend> {
    let mut selected = Vec::with_capacity(preference.len() + 1);
    let mut seen = Vec::with_capacity(preference.len());
    for backend in preference {
        if *backend == ExecutionBackend::Cpu || seen.contains(backend) {
            continue;
        }
        seen.push(*backend);
        if probe(*backend) {
            selected.push(*backend);
        } else {
            debug!(%backend, "Execution provider unavailable, skipping");
        }
    }
    selected.push(ExecutionBackend::Cpu);
    selected
}

/// A loaded model that upscales one tile per call.
pub trait TileInference: Send {
    /// Runs one forward pass on a `(1, 3, H, W)` tile in `[0, 1]`.
    fn run(&mut self, tile: &Tensor) -> Result<Tensor>;

    /// Primary backend the session was built for.
    fn backend(&self) -> ExecutionBackend;
}

/// Builds sessions from raw model bytes.
pub trait SessionFactory: Send + Sync {
    fn create(&self, model: &[u8]) -> Result<Box<dyn TileInference>>;
}

#[derive(Debug, Clone)]
pub struct OrtSessionConfig {
    /// Preferred execution providers, highest priority first.
    pub backends: Vec<ExecutionBackend>,
    pub trt_cache_dir: Option<PathBuf>,
    /// 0 lets ONNX Runtime decide.
    pub intra_threads: usize,
    /// Multiplier applied to model input (and divided out of its output).
    /// 255 for models trained on `[0, 255]` pixel values.
    pub value_scale: f32,
}

impl Default for OrtSessionConfig {
    fn default() -> Self {
        Self {
            backends: vec![ExecutionBackend::Cuda, ExecutionBackend::Cpu],
            trt_cache_dir: None,
            intra_threads: 0,
            value_scale: 1.0,
        }
    }
}

pub struct OrtSessionFactory {
    config: OrtSessionConfig,
}

impl OrtSessionFactory {
    pub fn new(config: OrtSessionConfig) -> Self {
        Self { config }
    }

    fn provider(&self, backend: ExecutionBackend) -> Option<ExecutionProviderDispatch> {
        match backend {
            ExecutionBackend::Tensorrt => {
                let cache_dir = self
                    .config
                    .trt_cache_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("trt_cache"));
                if let Err(e) = std::fs::create_dir_all(&cache_dir) {
                    warn!(
                        dir = %cache_dir.display(),
                        error = %e,
                        "Failed to create TRT cache directory"
                    );
                }
                let cache_path = cache_dir.to_string_lossy().to_string();
                Some(
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(true)
                        .with_device_id(0)
                        .build(),
                )
            }
            ExecutionBackend::Cuda => Some(CUDAExecutionProvider::default().build()),
            ExecutionBackend::Cpu => None,
        }
    }
}

fn probe_backend(backend: ExecutionBackend) -> bool {
    match backend {
        ExecutionBackend::Tensorrt => TensorRTExecutionProvider::default()
            .is_available()
            .unwrap_or(false),
        ExecutionBackend::Cuda => CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false),
        ExecutionBackend::Cpu => true,
    }
}

impl SessionFactory for OrtSessionFactory {
    fn create(&self, model: &[u8]) -> Result<Box<dyn TileInference>> {
        let backends = select_backends(&self.config.backends, probe_backend);
        let primary = backends[0];
        let started = Instant::now();

        debug!(
            backends = ?backends,
            model_bytes = model.len(),
            "Building ONNX session"
        );

        let mut builder =
            Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        if self.config.intra_threads > 0 {
            builder = builder.with_intra_threads(self.config.intra_threads)?;
        }

        let providers: Vec<ExecutionProviderDispatch> = backends
            .iter()
            .filter_map(|backend| self.provider(*backend))
            .collect();

        let session = builder
            .with_execution_providers(providers)?
            .commit_from_memory(model)
            .context("Failed to load ONNX model")?;

        let input = session.inputs().first().context("model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();
        let is_fp16 = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };

        info!(
            backend = %primary,
            %input_name,
            %output_name,
            is_fp16,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "ONNX session ready"
        );

        Ok(Box::new(OrtTileSession {
            session,
            backend: primary,
            input_name,
            output_name,
            is_fp16,
            value_scale: self.config.value_scale,
        }))
    }
}

pub struct OrtTileSession {
    session: Session,
    backend: ExecutionBackend,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    value_scale: f32,
}

impl OrtTileSession {
    fn run_f32(&mut self, input: Tensor) -> Result<Tensor> {
        let input_tensor = OrtTensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output_view.to_owned())
    }

    fn run_f16(&mut self, input: Tensor) -> Result<Tensor> {
        let contiguous = input.as_standard_layout();
        let f32_slice = contiguous
            .as_slice()
            .context("tile tensor is not contiguous")?;
        let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
        fp16_data.convert_from_f32_slice(f32_slice);

        let fp16_array = ndarray::ArrayD::from_shape_vec(input.shape().to_vec(), fp16_data)?;
        let input_tensor = OrtTensor::from_array(fp16_array)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &input_tensor])?;
        let output_view = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;

        let fp16_out = output_view.as_standard_layout();
        let fp16_slice = fp16_out
            .as_slice()
            .context("model output is not contiguous")?;
        let mut f32_data = vec![0.0f32; fp16_slice.len()];
        fp16_slice.convert_to_f32_slice(&mut f32_data);

        Ok(ndarray::ArrayD::from_shape_vec(
            output_view.shape().to_vec(),
            f32_data,
        )?)
    }
}

impl TileInference for OrtTileSession {
    fn run(&mut self, tile: &Tensor) -> Result<Tensor> {
        let scale = self.value_scale;
        let input = if scale == 1.0 {
            tile.clone()
        } else {
            tile.mapv(|v| v * scale)
        };

        let mut output = if self.is_fp16 {
            self.run_f16(input)?
        } else {
            self.run_f32(input)?
        };

        if scale != 1.0 {
            output.mapv_inplace(|v| v / scale);
        }
        Ok(output)
    }

    fn backend(&self) -> ExecutionBackend {
        self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_str_lossy() {
        assert_eq!(
            ExecutionBackend::from_str_lossy("TensorRT"),
            ExecutionBackend::Tensorrt
        );
        assert_eq!(
            ExecutionBackend::from_str_lossy("trt"),
            ExecutionBackend::Tensorrt
        );
        assert_eq!(
            ExecutionBackend::from_str_lossy("CUDA"),
            ExecutionBackend::Cuda
        );
        assert_eq!(
            ExecutionBackend::from_str_lossy(" cpu "),
            ExecutionBackend::Cpu
        );
        assert_eq!(
            ExecutionBackend::from_str_lossy("webgpu"),
            ExecutionBackend::Cpu
        );
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(ExecutionBackend::Tensorrt.to_string(), "tensorrt");
        assert_eq!(ExecutionBackend::Cuda.to_string(), "cuda");
        assert_eq!(ExecutionBackend::Cpu.to_string(), "cpu");
    }

    #[test]
    fn test_select_backends_appends_cpu() {
        let selected = select_backends(
            &[ExecutionBackend::Tensorrt, ExecutionBackend::Cuda],
            |_| true,
        );
        assert_eq!(
            selected,
            vec![
                ExecutionBackend::Tensorrt,
                ExecutionBackend::Cuda,
                ExecutionBackend::Cpu
            ]
        );
    }

    #[test]
    fn test_select_backends_skips_unavailable() {
        let selected = select_backends(
            &[ExecutionBackend::Tensorrt, ExecutionBackend::Cuda],
            |backend| backend == ExecutionBackend::Cuda,
        );
        assert_eq!(
            selected,
            vec![ExecutionBackend::Cuda, ExecutionBackend::Cpu]
        );
    }

    #[test]
    fn test_select_backends_cpu_only_and_dedup() {
        assert_eq!(select_backends(&[], |_| true), vec![ExecutionBackend::Cpu]);
        let selected = select_backends(
            &[
                ExecutionBackend::Cpu,
                ExecutionBackend::Cuda,
                ExecutionBackend::Cuda,
            ],
            |_| true,
        );
        assert_eq!(
            selected,
            vec![ExecutionBackend::Cuda, ExecutionBackend::Cpu]
        );
    }

    #[test]
    fn test_select_backends_probes_each_once() {
        let calls = std::cell::Cell::new(0);
        select_backends(
            &[
                ExecutionBackend::Tensorrt,
                ExecutionBackend::Cuda,
                ExecutionBackend::Tensorrt,
            ],
            |_| {
                calls.set(calls.get() + 1);
                false
            },
        );
        assert_eq!(calls.get(), 2);
    }

    /// Requires a model file. Run: `cargo test -p tessera-core -- --ignored`
    #[test]
    #[ignore]
    fn test_ort_session_on_cpu() {
        let model = std::fs::read("models/noise0_scale2x.onnx").expect("model file");
        let factory = OrtSessionFactory::new(OrtSessionConfig {
            backends: vec![ExecutionBackend::Cpu],
            ..Default::default()
        });
        let mut session = factory.create(&model).expect("session");
        assert_eq!(session.backend(), ExecutionBackend::Cpu);

        let tile = Tensor::from_elem(ndarray::IxDyn(&[1, 3, 64, 64]), 0.5);
        let output = session.run(&tile).expect("inference");
        assert_eq!(output.shape()[1], 3);
        assert_eq!(output.shape()[2], 128);
    }
}
