use std::{path::PathBuf, sync::Arc};

use tracing::instrument;

pub mod detector;
mod error;
pub mod model;
mod pipeline;
pub mod present;
pub mod recognizer;
mod result;
pub mod surface;
pub mod tensor;
mod util;

pub use detector::{DetectionOptions, DetectorOutput, DetectorStage};
pub use error::{ModelKind, OcrError, Result};
pub use model::{InferenceModel, ModelContract, OrtModel};
pub use pipeline::{Models, OcrApp, UploadOutcome};
pub use recognizer::{Charset, RecognizerStage};
pub use result::*;
pub use surface::{Surface, Upload};
pub use tensor::{TensorLayout, TensorLedger};

pub use ort as runtime;

pub const DEFAULT_DETECTOR_PATH: &str = "web_model/detector_model/model.onnx";
pub const DEFAULT_RECOGNIZER_PATH: &str = "web_model/recognizer_model/model.onnx";
pub const DEFAULT_KEYS_PATH: &str = "web_model/recognizer_model/keys.txt";

pub struct OcrAppBuilder {
    threads: usize,
    detector_path: Option<PathBuf>,
    recognizer_path: Option<PathBuf>,
    keys_path: Option<PathBuf>,
    detector_output: DetectorOutput,
    recognizer_height: Option<u32>,
    fallback_layout: TensorLayout,
    options: DetectionOptions,
    cache_path: Option<PathBuf>,
    execution_providers: Vec<ExecutionProvider>,
}

impl OcrAppBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn detector_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.detector_path = Some(path.into());
        self
    }

    pub fn detector_output(mut self, output: DetectorOutput) -> Self {
        self.detector_output = output;
        self
    }

    pub fn recognizer_model(
        mut self,
        model_path: impl Into<PathBuf>,
        keys_path: impl Into<PathBuf>,
    ) -> Self {
        self.recognizer_path = Some(model_path.into());
        self.keys_path = Some(keys_path.into());
        self
    }

    /// Resize each crop to this height before recognition. Crops are fed at
    /// their native size otherwise.
    pub fn recognizer_height(mut self, height: Option<u32>) -> Self {
        self.recognizer_height = height;
        self
    }

    /// Layout assumed when a graph's input leaves the channel axis dynamic.
    pub fn fallback_layout(mut self, layout: TensorLayout) -> Self {
        self.fallback_layout = layout;
        self
    }

    pub fn detection_options(mut self, options: DetectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_engine_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    #[instrument(skip(self), level = "debug")]
    fn init_models(&mut self) -> Result<Models> {
        let detector_path = self
            .detector_path
            .take()
            .unwrap_or_else(|| DEFAULT_DETECTOR_PATH.into());
        let recognizer_path = self
            .recognizer_path
            .take()
            .unwrap_or_else(|| DEFAULT_RECOGNIZER_PATH.into());
        let keys_path = self
            .keys_path
            .take()
            .unwrap_or_else(|| DEFAULT_KEYS_PATH.into());

        let detector = OrtModel::load(
            detector_path,
            self.threads,
            &self.execution_providers,
            self.cache_path.clone(),
            &self.detector_output.contract(),
            self.fallback_layout,
        )?;
        let recognizer = OrtModel::load(
            recognizer_path,
            self.threads,
            &self.execution_providers,
            self.cache_path.clone(),
            &RecognizerStage::contract(),
            self.fallback_layout,
        )?;
        let charset = Charset::from_file(keys_path)?;

        Ok(Models {
            detector: DetectorStage::new(Arc::new(detector), self.detector_output),
            recognizer: RecognizerStage::new(Arc::new(recognizer), charset, self.recognizer_height),
        })
    }

    /// Loads both models. A failed load is logged and yields an inert app
    /// that still ingests uploads but never runs inference.
    #[instrument(skip(self))]
    pub fn build(mut self) -> OcrApp {
        let models = match self.init_models() {
            Ok(models) => Some(models),
            Err(err) => {
                tracing::error!("Error loading models: {err}");
                None
            }
        };
        OcrApp::new(models, self.options)
    }

    #[instrument(skip(self))]
    pub fn try_build(mut self) -> Result<OcrApp> {
        let models = self.init_models()?;
        Ok(OcrApp::new(Some(models), self.options))
    }
}

impl Default for OcrAppBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            detector_path: None,
            recognizer_path: None,
            keys_path: None,
            detector_output: DetectorOutput::default(),
            recognizer_height: None,
            fallback_layout: TensorLayout::default(),
            options: DetectionOptions::default(),
            cache_path: None,
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];
