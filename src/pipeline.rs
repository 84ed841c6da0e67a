//! Upload handling and the single-flight run policy.
//!
//! Every accepted upload starts a run with its own generation number and
//! cancellation token. Starting a run cancels whichever run was active
//! before it, and only the run holding the latest generation may write the
//! shared surface or prediction list. A superseded run finishes with
//! [`OcrError::Superseded`] and leaves no trace in the shared state, so the
//! list always holds one complete run's output.

use std::sync::Arc;

use image::DynamicImage;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    detector::{DetectionOptions, DetectorStage},
    error::{OcrError, Result},
    recognizer::RecognizerStage,
    surface::{Surface, Upload},
    tensor::TensorLedger,
    Prediction,
};

/// Both loaded stages. Absent when loading failed.
pub struct Models {
    pub detector: DetectorStage,
    pub recognizer: RecognizerStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The run finished and its predictions replaced the shared list.
    Completed(Vec<Prediction>),
    /// The image was ingested but no models are loaded.
    Inert,
}

#[derive(Default)]
struct AppState {
    surface: Arc<Surface>,
    predictions: Vec<Prediction>,
    generation: u64,
    active: Option<CancellationToken>,
}

struct RunContext {
    generation: u64,
    cancel: CancellationToken,
}

pub struct OcrApp {
    models: Option<Models>,
    options: DetectionOptions,
    ledger: TensorLedger,
    state: Mutex<AppState>,
}

impl OcrApp {
    pub fn new(models: Option<Models>, options: DetectionOptions) -> Self {
        Self {
            models,
            options,
            ledger: TensorLedger::new(),
            state: Mutex::new(AppState::default()),
        }
    }

    pub fn is_inert(&self) -> bool {
        self.models.is_none()
    }

    pub fn options(&self) -> &DetectionOptions {
        &self.options
    }

    pub fn ledger(&self) -> &TensorLedger {
        &self.ledger
    }

    pub fn predictions(&self) -> Vec<Prediction> {
        self.state.lock().predictions.clone()
    }

    pub fn surface(&self) -> Arc<Surface> {
        self.state.lock().surface.clone()
    }

    /// Validates, ingests and runs one upload through detection and
    /// recognition. Rejected uploads leave all state untouched.
    #[instrument(skip_all, fields(name = %upload.name))]
    pub fn handle_upload(&self, upload: &Upload) -> Result<UploadOutcome> {
        let bitmap = match upload.validate().and_then(|_| upload.decode()) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                tracing::warn!("{err}");
                return Err(err);
            }
        };

        let run = self.begin_run();
        let result = self.run(&run, &bitmap);
        self.end_run(&run);
        if let Err(err) = &result {
            match err {
                OcrError::Superseded => tracing::debug!(generation = run.generation, "{err}"),
                _ => tracing::error!(generation = run.generation, "{err}"),
            }
        }
        result
    }

    fn run(&self, run: &RunContext, bitmap: &DynamicImage) -> Result<UploadOutcome> {
        let surface = Arc::new(Surface::from_bitmap(bitmap));
        self.commit(run, |state| state.surface = surface.clone())?;

        let Some(models) = &self.models else {
            log::debug!("No models loaded, skipping inference");
            return Ok(UploadOutcome::Inert);
        };

        let boxes = models
            .detector
            .get_text_boxes(&surface, &self.ledger, &self.options)?;
        let predictions = models
            .recognizer
            .get_text_lines(&surface, &boxes, &self.ledger, &run.cancel)?
            .into_iter()
            .map(Prediction::from)
            .collect::<Vec<_>>();

        self.commit(run, |state| state.predictions = predictions.clone())?;
        Ok(UploadOutcome::Completed(predictions))
    }

    fn begin_run(&self) -> RunContext {
        let mut state = self.state.lock();
        if let Some(previous) = state.active.take() {
            previous.cancel();
        }
        state.generation += 1;
        let cancel = CancellationToken::new();
        state.active = Some(cancel.clone());
        log::debug!("Starting run {}", state.generation);
        RunContext {
            generation: state.generation,
            cancel,
        }
    }

    fn end_run(&self, run: &RunContext) {
        let mut state = self.state.lock();
        if state.generation == run.generation {
            state.active = None;
        }
    }

    /// Applies `update` only while `run` is still the latest one.
    fn commit(&self, run: &RunContext, update: impl FnOnce(&mut AppState)) -> Result<()> {
        let mut state = self.state.lock();
        if run.cancel.is_cancelled() || state.generation != run.generation {
            return Err(OcrError::Superseded);
        }
        update(&mut state);
        Ok(())
    }
}
