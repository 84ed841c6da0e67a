use std::{cmp::Ordering, sync::Arc};

use geo::MinimumRotatedRect;
use imageproc::{
    contours::find_contours,
    contrast::{threshold_mut, ThresholdType},
    distance_transform::Norm,
    morphology::dilate_mut,
};
use ndarray::{ArrayView2, ArrayViewD, Axis, Ix2};
use tracing::instrument;

use crate::{
    error::{ModelKind, OcrError, Result},
    model::{InferenceModel, ModelContract},
    surface::Surface,
    tensor::{from_pixels, normalize, TensorLedger},
    util::{box_score_fast, max_side, polygon_bounds, to_geo_poly, to_luma_image, unclip},
    BoundingBox, TextBox,
};

const MAX_CANDIDATES: usize = 1000;
const LONG_SIDE_THRESHOLD: f32 = 3.0;

/// Shape of the detector graph's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectorOutput {
    /// Output 0 is `[N, 4]` or `[1, N, 4]` rows of normalized
    /// `[y1, x1, y2, x2]`; optional output 1 holds `[N]` or `[1, N]` scores.
    #[default]
    Boxes,
    /// Output 0 is a `[1, 1, h, w]` or `[1, h, w]` text probability map.
    ProbabilityMap,
}

impl DetectorOutput {
    pub fn contract(self) -> ModelContract {
        let output_ranks = match self {
            DetectorOutput::Boxes => vec![vec![2, 3], vec![1, 2]],
            DetectorOutput::ProbabilityMap => vec![vec![3, 4]],
        };
        ModelContract {
            model: ModelKind::Detector,
            min_outputs: 1,
            output_ranks,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionOptions {
    /// Detections scoring below this are dropped.
    pub score_threshold: f32,
    /// Overlap above which the lower-scored of two boxes is suppressed.
    pub iou_threshold: f32,
    /// Boxes with a side shorter than this many pixels are dropped.
    pub min_box_size: f32,
    pub max_detections: usize,
    /// Downscale the detector input so its longer side fits.
    pub max_side_len: Option<u32>,
    /// Probability map binarization threshold.
    pub map_threshold: f32,
    pub unclip_ratio: f32,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            iou_threshold: 0.5,
            min_box_size: 1.0,
            max_detections: 100,
            max_side_len: None,
            map_threshold: 0.3,
            unclip_ratio: 1.6,
        }
    }
}

pub struct DetectorStage {
    model: Arc<dyn InferenceModel>,
    output: DetectorOutput,
}

impl DetectorStage {
    pub fn new(model: Arc<dyn InferenceModel>, output: DetectorOutput) -> Self {
        Self { model, output }
    }

    #[instrument(skip_all, fields(width = surface.width(), height = surface.height()), level = "debug")]
    pub fn get_text_boxes(
        &self,
        surface: &Surface,
        ledger: &TensorLedger,
        options: &DetectionOptions,
    ) -> Result<Vec<TextBox>> {
        let pixels = match options.max_side_len {
            Some(max_side_len) => {
                ledger.track(from_pixels(&surface.fit_to(max_side_len), self.model.layout()))
            }
            None => ledger.track(from_pixels(surface.image(), self.model.layout())),
        };
        let normalized = ledger.track(normalize(&pixels));
        let outputs = self
            .model
            .run(normalized.view())?
            .into_iter()
            .map(|output| ledger.track(output))
            .collect::<Vec<_>>();

        let width = surface.width() as f32;
        let height = surface.height() as f32;
        let candidates = match self.output {
            DetectorOutput::Boxes => {
                let boxes = outputs
                    .first()
                    .ok_or_else(|| OcrError::malformed(ModelKind::Detector, "no outputs"))?;
                let scores = outputs.get(1).map(|scores| scores.view());
                decode_boxes(boxes.view(), scores, width, height, options)?
            }
            DetectorOutput::ProbabilityMap => {
                let map = outputs
                    .first()
                    .ok_or_else(|| OcrError::malformed(ModelKind::Detector, "no outputs"))?;
                decode_probability_map(map.view(), width, height, options)?
            }
        };

        let boxes = finish(candidates, width, height, options);
        log::debug!("Detected {} text boxes", boxes.len());
        Ok(boxes)
    }
}

/// Decodes normalized `[y1, x1, y2, x2]` rows into surface coordinates.
pub fn decode_boxes(
    boxes: ArrayViewD<f32>,
    scores: Option<ArrayViewD<f32>>,
    width: f32,
    height: f32,
    options: &DetectionOptions,
) -> Result<Vec<TextBox>> {
    let shape = boxes.shape().to_vec();
    let boxes = squeeze_batch(boxes, 2)
        .ok_or_else(|| {
            OcrError::malformed(
                ModelKind::Detector,
                format!("box output has shape {shape:?}, expected [N, 4]"),
            )
        })?
        .into_dimensionality::<Ix2>()
        .map_err(|err| OcrError::malformed(ModelKind::Detector, err.to_string()))?;
    if boxes.ncols() != 4 {
        return Err(OcrError::malformed(
            ModelKind::Detector,
            format!("box rows have {} values, expected 4", boxes.ncols()),
        ));
    }

    let scores: Vec<f32> = match scores {
        Some(scores) => {
            let shape = scores.shape().to_vec();
            let scores = squeeze_batch(scores, 1)
                .filter(|scores| scores.len() == boxes.nrows())
                .ok_or_else(|| {
                    OcrError::malformed(
                        ModelKind::Detector,
                        format!("score output has shape {shape:?} for {} boxes", boxes.nrows()),
                    )
                })?;
            scores.iter().copied().collect()
        }
        None => vec![1.0; boxes.nrows()],
    };

    Ok(boxes
        .outer_iter()
        .zip(scores)
        .filter(|(row, score)| {
            row.iter().all(|value| value.is_finite()) && *score >= options.score_threshold
        })
        .map(|(row, score)| {
            let (y1, x1, y2, x2) = (
                row[0].clamp(0.0, 1.0),
                row[1].clamp(0.0, 1.0),
                row[2].clamp(0.0, 1.0),
                row[3].clamp(0.0, 1.0),
            );
            let (left, right) = (x1.min(x2), x1.max(x2));
            let (top, bottom) = (y1.min(y2), y1.max(y2));
            TextBox {
                score,
                rect: BoundingBox::from_edges(
                    left * width,
                    top * height,
                    right * width,
                    bottom * height,
                ),
            }
        })
        .collect())
}

/// DB-style decoding: binarize the probability map, trace regions, score and
/// grow them, then scale from map to surface coordinates.
#[instrument(skip(map, options), level = "trace")]
pub fn decode_probability_map(
    map: ArrayViewD<f32>,
    width: f32,
    height: f32,
    options: &DetectionOptions,
) -> Result<Vec<TextBox>> {
    let map = match map.ndim() {
        4 if map.len_of(Axis(0)) == 1 && map.len_of(Axis(1)) == 1 => {
            map.index_axis_move(Axis(0), 0).index_axis_move(Axis(0), 0)
        }
        3 if map.len_of(Axis(0)) == 1 => map.index_axis_move(Axis(0), 0),
        _ => {
            return Err(OcrError::malformed(
                ModelKind::Detector,
                format!("probability map has shape {:?}", map.shape()),
            ))
        }
    };
    let map = map
        .into_dimensionality::<Ix2>()
        .map_err(|err| OcrError::malformed(ModelKind::Detector, err.to_string()))?;
    let (map_height, map_width) = map.dim();
    if map_height == 0 || map_width == 0 {
        return Ok(Vec::new());
    }
    let factor_x = width / map_width as f32;
    let factor_y = height / map_height as f32;

    let mut image = to_luma_image(map);
    let threshold = (options.map_threshold * 255.0) as u8;
    threshold_mut(&mut image, threshold, ThresholdType::Binary);
    dilate_mut(&mut image, Norm::L1, 1);

    Ok(trace_regions(map, &image, options)
        .into_iter()
        .map(|(rect, score)| TextBox {
            score,
            rect: BoundingBox {
                x: rect.x * factor_x,
                y: rect.y * factor_y,
                width: rect.width * factor_x,
                height: rect.height * factor_y,
            },
        })
        .collect())
}

fn trace_regions(
    map: ArrayView2<f32>,
    binary: &image::GrayImage,
    options: &DetectionOptions,
) -> Vec<(BoundingBox, f32)> {
    find_contours::<i32>(binary)
        .into_iter()
        .take(MAX_CANDIDATES)
        .filter(|contour| contour.points.len() > 2)
        .filter_map(|contour| to_geo_poly(&contour.points).minimum_rotated_rect())
        .filter(|rect| max_side(rect) >= LONG_SIDE_THRESHOLD)
        .map(|rect| {
            let score = box_score_fast(&rect, map);
            (rect, score)
        })
        .filter(|(_, score)| *score >= options.score_threshold)
        .filter_map(|(rect, score)| Some((unclip(rect, options.unclip_ratio)?, score)))
        .filter(|(grown, _)| max_side(grown) >= LONG_SIDE_THRESHOLD + 2.0)
        .filter_map(|(grown, score)| Some((polygon_bounds(&grown)?, score)))
        .collect()
}

/// Drops a leading batch axis of size 1 so the view has `rank` dimensions.
fn squeeze_batch(view: ArrayViewD<f32>, rank: usize) -> Option<ArrayViewD<f32>> {
    if view.ndim() == rank {
        Some(view)
    } else if view.ndim() == rank + 1 && view.len_of(Axis(0)) == 1 {
        Some(view.index_axis_move(Axis(0), 0))
    } else {
        None
    }
}

fn finish(
    candidates: Vec<TextBox>,
    width: f32,
    height: f32,
    options: &DetectionOptions,
) -> Vec<TextBox> {
    let candidates = candidates
        .into_iter()
        .map(|text_box| TextBox {
            rect: text_box.rect.clamp_to(width, height),
            ..text_box
        })
        .filter(|text_box| {
            text_box.rect.width >= options.min_box_size
                && text_box.rect.height >= options.min_box_size
        })
        .collect();

    let mut boxes = non_max_suppression(candidates, options.iou_threshold, options.max_detections);
    boxes.sort_by(|a, b| reading_order(&a.rect, &b.rect));
    boxes
}

/// Greedy suppression: keeps the best-scored box, drops everything
/// overlapping it by more than `iou_threshold`, repeats.
pub fn non_max_suppression(
    mut boxes: Vec<TextBox>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<TextBox> {
    boxes.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<TextBox> = Vec::new();
    for candidate in boxes {
        if kept.len() >= max_detections {
            break;
        }
        if kept
            .iter()
            .all(|k| k.rect.intersection_over_union(&candidate.rect) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

fn reading_order(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    a.y.partial_cmp(&b.y)
        .unwrap_or(Ordering::Equal)
        .then(a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use ndarray::{array, s, Array2, Array4};

    use super::*;

    fn scored(score: f32, left: f32, top: f32, right: f32, bottom: f32) -> TextBox {
        TextBox {
            score,
            rect: BoundingBox::from_edges(left, top, right, bottom),
        }
    }

    #[test]
    fn normalized_rows_are_denormalized_against_surface() {
        let boxes = array![[[0.1f32, 0.2, 0.6, 0.8]]].into_dyn();
        let decoded = decode_boxes(boxes.view(), None, 100.0, 50.0, &Default::default()).unwrap();
        assert_eq!(decoded.len(), 1);
        let rect = decoded[0].rect;
        assert!((rect.x - 20.0).abs() < 1e-4);
        assert!((rect.y - 5.0).abs() < 1e-4);
        assert!((rect.width - 60.0).abs() < 1e-4);
        assert!((rect.height - 25.0).abs() < 1e-4);
    }

    #[test]
    fn out_of_range_and_swapped_edges_stay_on_surface() {
        let boxes = array![[1.4f32, -0.3, -0.2, 0.5], [0.5, 0.5, f32::NAN, 0.9]].into_dyn();
        let decoded = decode_boxes(boxes.view(), None, 80.0, 40.0, &Default::default()).unwrap();
        assert_eq!(decoded.len(), 1);
        let rect = decoded[0].rect;
        assert_eq!(rect, BoundingBox::from_edges(0.0, 0.0, 40.0, 40.0));
    }

    #[test]
    fn scores_below_threshold_are_dropped() {
        let boxes = array![[0.0f32, 0.0, 0.5, 0.5], [0.5, 0.5, 1.0, 1.0]].into_dyn();
        let scores = array![[0.9f32, 0.2]].into_dyn();
        let decoded = decode_boxes(
            boxes.view(),
            Some(scores.view()),
            10.0,
            10.0,
            &Default::default(),
        )
        .unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].score, 0.9);
    }

    #[test]
    fn malformed_box_output_is_an_error() {
        let boxes = array![[0.1f32, 0.2, 0.3]].into_dyn();
        let err = decode_boxes(boxes.view(), None, 10.0, 10.0, &Default::default()).unwrap_err();
        assert!(matches!(err, OcrError::MalformedOutput { .. }));

        let boxes = array![[0.1f32, 0.2, 0.3, 0.4]].into_dyn();
        let scores = array![0.5f32, 0.7].into_dyn();
        let err = decode_boxes(boxes.view(), Some(scores.view()), 10.0, 10.0, &Default::default())
            .unwrap_err();
        assert!(matches!(err, OcrError::MalformedOutput { .. }));
    }

    #[test]
    fn nms_suppresses_overlapping_lower_scores() {
        let boxes = vec![
            scored(0.6, 1.0, 1.0, 11.0, 11.0),
            scored(0.9, 0.0, 0.0, 10.0, 10.0),
            scored(0.7, 50.0, 50.0, 60.0, 60.0),
        ];
        let kept = non_max_suppression(boxes, 0.5, 10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.7);
    }

    #[test]
    fn nms_respects_max_detections() {
        let boxes = (0..5)
            .map(|i| scored(0.5 + i as f32 * 0.1, i as f32 * 20.0, 0.0, i as f32 * 20.0 + 10.0, 10.0))
            .collect();
        assert_eq!(non_max_suppression(boxes, 0.5, 3).len(), 3);
    }

    #[test]
    fn finished_boxes_are_clamped_and_in_reading_order() {
        let boxes = vec![
            scored(0.9, 50.0, 30.0, 80.0, 45.0),
            scored(0.8, 10.0, 2.0, 130.0, 12.0),
            scored(0.7, 5.0, 30.0, 20.0, 45.0),
            scored(0.99, 40.0, 40.0, 40.5, 49.0),
        ];
        let finished = finish(boxes, 100.0, 50.0, &Default::default());
        assert_eq!(finished.len(), 3);
        assert_eq!(finished[0].rect, BoundingBox::from_edges(10.0, 2.0, 100.0, 12.0));
        assert_eq!(finished[1].rect.x, 5.0);
        assert_eq!(finished[2].rect.x, 50.0);
        for text_box in &finished {
            assert!(text_box.rect.x >= 0.0 && text_box.rect.right() <= 100.0);
            assert!(text_box.rect.y >= 0.0 && text_box.rect.bottom() <= 50.0);
        }
    }

    #[test]
    fn probability_map_region_becomes_a_box() {
        let mut map = Array2::<f32>::zeros((40, 80));
        map.slice_mut(s![10..20, 10..50]).fill(0.9);
        let map = map.insert_axis(Axis(0)).insert_axis(Axis(0)).into_dyn();

        let decoded =
            decode_probability_map(map.view(), 160.0, 80.0, &Default::default()).unwrap();
        assert_eq!(decoded.len(), 1);
        let rect = decoded[0].rect;
        assert!(decoded[0].score > 0.8);
        // Scaled by 2 and grown past the raw region on every side.
        assert!(rect.x < 20.0 && rect.right() > 98.0);
        assert!(rect.y < 20.0 && rect.bottom() > 38.0);
    }

    #[test]
    fn empty_probability_map_yields_nothing() {
        let map = Array4::<f32>::zeros((1, 1, 32, 32)).into_dyn();
        let decoded = decode_probability_map(map.view(), 32.0, 32.0, &Default::default()).unwrap();
        assert!(decoded.is_empty());
    }
}
