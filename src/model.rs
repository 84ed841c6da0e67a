use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayView4};
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session, ValueType};
use tracing::instrument;

use crate::{
    error::{ModelKind, OcrError, Result},
    tensor::TensorLayout,
    ExecutionProvider,
};

/// A loaded inference graph: takes one batched, normalized image tensor and
/// returns its outputs in declaration order.
pub trait InferenceModel: Send + Sync {
    fn layout(&self) -> TensorLayout;

    fn run(&self, input: ArrayView4<f32>) -> Result<Vec<ArrayD<f32>>>;
}

/// Shapes a model must declare to be usable by a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContract {
    pub model: ModelKind,
    pub min_outputs: usize,
    /// Accepted ranks for output 0, 1, ...; outputs past the list are unchecked.
    pub output_ranks: Vec<Vec<usize>>,
}

impl ModelContract {
    /// Checks the declared input shape and returns the layout it implies,
    /// or `fallback` when the channel axis is dynamic.
    pub fn check_input(&self, dims: &[i64], fallback: TensorLayout) -> Result<TensorLayout> {
        if dims.len() != 4 {
            return Err(OcrError::Contract {
                model: self.model,
                reason: format!("expected a rank 4 image input, got shape {dims:?}"),
            });
        }
        Ok(TensorLayout::infer(dims).unwrap_or_else(|| {
            log::debug!("{} input {dims:?} has no fixed channel axis, using {fallback:?}", self.model);
            fallback
        }))
    }

    pub fn check_outputs(&self, outputs: &[Vec<i64>]) -> Result<()> {
        if outputs.len() < self.min_outputs {
            return Err(OcrError::Contract {
                model: self.model,
                reason: format!(
                    "expected at least {} outputs, got {}",
                    self.min_outputs,
                    outputs.len()
                ),
            });
        }
        for (index, (dims, ranks)) in outputs.iter().zip(&self.output_ranks).enumerate() {
            if !ranks.contains(&dims.len()) {
                return Err(OcrError::Contract {
                    model: self.model,
                    reason: format!("output {index} has shape {dims:?}, expected rank in {ranks:?}"),
                });
            }
        }
        Ok(())
    }
}

pub struct OrtModel {
    kind: ModelKind,
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    layout: TensorLayout,
}

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(cache_path: PathBuf) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    TensorRTExecutionProvider::default()
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

fn build_session(
    path: &Path,
    num_threads: usize,
    execution_providers: &[ExecutionProvider],
    cache_path: Option<PathBuf>,
) -> ort::Result<Session> {
    #[cfg(feature = "directml")]
    let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
    #[cfg(not(feature = "directml"))]
    let parallel = true;

    #[cfg(not(feature = "tensorrt"))]
    let _ = &cache_path;

    let execution_providers = execution_providers.iter().filter_map(
        |provider| -> Option<ExecutionProviderDispatch> {
            match provider {
                ExecutionProvider::Default => None,
                #[cfg(feature = "tensorrt")]
                ExecutionProvider::TensorRT => Some(setup_tensorrt(
                    cache_path
                        .clone()
                        .or_else(|| path.parent().map(|parent| parent.join(".cache")))
                        .unwrap_or_else(|| PathBuf::from(".cache")),
                )),
                #[cfg(feature = "coreml")]
                ExecutionProvider::CoreML => Some(setup_coreml()),
                #[cfg(feature = "cuda")]
                ExecutionProvider::Cuda => Some(setup_cuda()),
                #[cfg(feature = "directml")]
                ExecutionProvider::DirectML => Some(setup_directml()),
            }
        },
    );

    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_memory_pattern(parallel)?
        .with_parallel_execution(parallel)?
        .with_inter_threads(num_threads)?
        .with_intra_threads(num_threads)?
        .with_execution_providers(execution_providers)?
        .commit_from_file(path)
}

fn tensor_dims(value_type: &ValueType) -> Vec<i64> {
    match value_type {
        ValueType::Tensor { dimensions, .. } => dimensions.clone(),
        _ => Vec::new(),
    }
}

impl OrtModel {
    #[instrument(level = "debug", skip(execution_providers, contract))]
    pub fn load(
        path: PathBuf,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
        contract: &ModelContract,
        fallback_layout: TensorLayout,
    ) -> Result<Self> {
        let kind = contract.model;
        if !path.exists() {
            return Err(OcrError::Load {
                model: kind,
                path: path.clone(),
                source: ort::Error::FileDoesNotExist { filename: path },
            });
        }
        let session =build_session(&path, num_threads, execution_providers, cache_path)
            .map_err(|source| OcrError::Load {
                model: kind,
                path: path.clone(),
                source,
            })?;

        log::debug!("{kind} inputs: {:?}", session.inputs);
        log::debug!("{kind} outputs: {:?}", session.outputs);

        let input = session.inputs.first().ok_or_else(|| OcrError::Contract {
            model: kind,
            reason: "graph declares no inputs".to_string(),
        })?;
        let layout = contract.check_input(&tensor_dims(&input.input_type), fallback_layout)?;
        let output_dims = session
            .outputs
            .iter()
            .map(|output| tensor_dims(&output.output_type))
            .collect::<Vec<_>>();
        contract.check_outputs(&output_dims)?;

        let input_name = input.name.clone();
        let output_names = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        tracing::info!(model = %kind, path = %path.display(), ?layout, "model loaded");

        Ok(Self {
            kind,
            session,
            input_name,
            output_names,
            layout,
        })
    }

    fn extract(&self, value: &ort::DynValue) -> Result<ArrayD<f32>> {
        if let Ok(tensor) = value.try_extract_tensor::<f32>() {
            return Ok(tensor.to_owned());
        }
        // Recognizers that end in an argmax hand back integer class ids.
        let tensor = value
            .try_extract_tensor::<i64>()
            .map_err(|source| OcrError::inference(self.kind, source))?;
        Ok(tensor.mapv(|id| id as f32))
    }
}

impl InferenceModel for OrtModel {
    fn layout(&self) -> TensorLayout {
        self.layout
    }

    #[instrument(level = "trace", skip(self, input), fields(model = %self.kind))]
    fn run(&self, input: ArrayView4<f32>) -> Result<Vec<ArrayD<f32>>> {
        let inputs = inputs![self.input_name.as_str() => input.to_owned()]
            .map_err(|source| OcrError::inference(self.kind, source))?;
        let outputs = self
            .session
            .run(inputs)
            .map_err(|source| OcrError::inference(self.kind, source))?;

        self.output_names
            .iter()
            .map(|name| {
                let value = outputs.get(name.as_str()).ok_or_else(|| {
                    OcrError::malformed(self.kind, format!("missing output {name}"))
                })?;
                self.extract(value)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector_contract() -> ModelContract {
        ModelContract {
            model: ModelKind::Detector,
            min_outputs: 1,
            output_ranks: vec![vec![2, 3], vec![1, 2]],
        }
    }

    #[test]
    fn input_must_be_rank_four() {
        let err = detector_contract()
            .check_input(&[1, 3, 32], TensorLayout::Nhwc)
            .unwrap_err();
        assert!(matches!(err, OcrError::Contract { .. }));
    }

    #[test]
    fn dynamic_channel_axis_falls_back() {
        let layout = detector_contract()
            .check_input(&[-1, -1, -1, -1], TensorLayout::Nchw)
            .unwrap();
        assert_eq!(layout, TensorLayout::Nchw);
    }

    #[test]
    fn output_ranks_are_checked() {
        let contract = detector_contract();
        assert!(contract.check_outputs(&[vec![-1, 4]]).is_ok());
        assert!(contract.check_outputs(&[vec![1, -1, 4], vec![1, -1]]).is_ok());
        assert!(contract.check_outputs(&[]).is_err());
        assert!(contract.check_outputs(&[vec![1, 1, -1, 4]]).is_err());
        assert!(contract.check_outputs(&[vec![-1, 4], vec![1, 2, 3]]).is_err());
    }
}
