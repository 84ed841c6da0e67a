use std::{io, path::PathBuf, time::Instant};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use ocrdemo::{
    present::{self, Format},
    DetectionOptions, DetectorOutput, OcrAppBuilder, Upload, UploadOutcome,
};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Detect and recognize text in images with a pair of ONNX models.
#[derive(Parser, Debug)]
#[command(name = "ocrdemo")]
struct Args {
    /// Images to read, processed in order
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Detector graph
    #[arg(long, default_value = ocrdemo::DEFAULT_DETECTOR_PATH)]
    detector: PathBuf,

    /// Recognizer graph
    #[arg(long, default_value = ocrdemo::DEFAULT_RECOGNIZER_PATH)]
    recognizer: PathBuf,

    /// Recognizer character table, one symbol per line
    #[arg(long, default_value = ocrdemo::DEFAULT_KEYS_PATH)]
    keys: PathBuf,

    /// What the detector graph outputs
    #[arg(long, value_enum, default_value_t = DetectorKind::Boxes)]
    detector_output: DetectorKind,

    /// Resize crops to this height before recognition
    #[arg(long)]
    recognizer_height: Option<u32>,

    #[arg(long, default_value_t = 0.5)]
    score_threshold: f32,

    #[arg(long, default_value_t = 0.5)]
    iou_threshold: f32,

    /// Downscale detector input so its longer side fits
    #[arg(long)]
    max_side_len: Option<u32>,

    #[arg(long, default_value_t = 4)]
    threads: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DetectorKind {
    Boxes,
    ProbabilityMap,
}

impl From<DetectorKind> for DetectorOutput {
    fn from(kind: DetectorKind) -> Self {
        match kind {
            DetectorKind::Boxes => DetectorOutput::Boxes,
            DetectorKind::ProbabilityMap => DetectorOutput::ProbabilityMap,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl From<OutputFormat> for Format {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Text => Format::Text,
            OutputFormat::Json => Format::Json,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let app = OcrAppBuilder::new()
        .threads(args.threads)
        .detector_model(&args.detector)
        .detector_output(args.detector_output.into())
        .recognizer_model(&args.recognizer, &args.keys)
        .recognizer_height(args.recognizer_height)
        .detection_options(DetectionOptions {
            score_threshold: args.score_threshold,
            iou_threshold: args.iou_threshold,
            max_side_len: args.max_side_len,
            ..Default::default()
        })
        .build();
    if app.is_inert() {
        eprintln!("models failed to load; images will be read but not recognized");
    }

    let stdout = io::stdout();
    for path in &args.images {
        let upload = match Upload::from_path(path) {
            Ok(upload) => upload,
            Err(err) => {
                tracing::error!("Failed to read {}: {err}", path.display());
                eprintln!("{}: {err}", path.display());
                continue;
            }
        };

        let start = Instant::now();
        match app.handle_upload(&upload) {
            Ok(UploadOutcome::Completed(predictions)) => {
                tracing::debug!("{} took {:?}", path.display(), start.elapsed());
                present::render(&predictions, args.format.into(), stdout.lock())?;
            }
            Ok(UploadOutcome::Inert) => {
                let (width, height) = app.surface().dimensions();
                tracing::info!("Ingested {} ({width}x{height}) without models", path.display());
            }
            Err(err) => eprintln!("{}: {err}", path.display()),
        }
    }

    Ok(())
}
