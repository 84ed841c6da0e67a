use std::{path::PathBuf, time::Instant};

use ocrdemo::{DetectionOptions, DetectorOutput, OcrAppBuilder, Upload, UploadOutcome};

// Needs real graphs under tests/data/models and an ONNX Runtime dylib
// reachable through ORT_DYLIB_PATH.
#[test]
#[ignore = "requires ONNX models under tests/data/models"]
fn recognizes_text_with_real_models() {
    let _ = env_logger::builder().is_test(true).try_init();

    let cache = PathBuf::from(std::env!("CARGO_TARGET_TMPDIR")).join(".engine_cache");
    std::fs::create_dir_all(&cache).expect("Failed to create temp dir");
    let app = OcrAppBuilder::new()
        .detector_model("tests/data/models/det.onnx")
        .detector_output(DetectorOutput::ProbabilityMap)
        .recognizer_model(
            "tests/data/models/rec.onnx",
            "tests/data/models/ppocr_keys_v1.txt",
        )
        .recognizer_height(Some(48))
        .detection_options(DetectionOptions {
            max_side_len: Some(2048),
            ..Default::default()
        })
        .with_engine_cache_path(cache)
        .try_build()
        .expect("Failed to build engine");

    let upload = Upload::from_path("tests/data/test_image.png").expect("Failed to load test image");
    let start = Instant::now();
    let outcome = app.handle_upload(&upload).expect("Failed recognition.");
    log::debug!("{:?}", start.elapsed());

    let UploadOutcome::Completed(predictions) = outcome else {
        panic!("models were loaded but the run did not complete");
    };
    assert!(predictions.len() > 1);
    assert_eq!(app.ledger().live(), 0);
}
