use std::{path::Path, sync::Arc};

use image::{imageops::FilterType, RgbImage};
use ndarray::{ArrayView1, ArrayView2, ArrayViewD, Axis, Ix1, Ix2};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    error::{ModelKind, OcrError, Result},
    model::{InferenceModel, ModelContract},
    surface::Surface,
    tensor::{from_pixels, normalize, TensorLedger},
    util::argmax,
    TextBox, TextLine,
};

pub const BLANK_INDEX: usize = 0;

/// Symbol table for the recognizer's output classes. Index 0 is the CTC
/// blank; the keys file supplies the rest, and a space closes the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charset {
    keys: Vec<String>,
}

impl Charset {
    pub fn from_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = ["#".to_string()]
            .into_iter()
            .chain(keys.into_iter().map(Into::into))
            .chain([" ".to_string()])
            .collect();
        Self { keys }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let keys = std::fs::read_to_string(path).map_err(|source| OcrError::Keys {
            path: path.to_path_buf(),
            source,
        })?;
        let charset = Self::from_keys(keys.lines());
        log::debug!("Loaded {} recognizer classes from {}", charset.len(), path.display());
        Ok(charset)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Symbol for a class index; `None` for the blank and out-of-table ids.
    pub fn symbol(&self, index: usize) -> Option<&str> {
        if index == BLANK_INDEX {
            None
        } else {
            self.keys.get(index).map(String::as_str)
        }
    }
}

pub struct RecognizerStage {
    model: Arc<dyn InferenceModel>,
    charset: Charset,
    input_height: Option<u32>,
}

impl RecognizerStage {
    pub fn new(model: Arc<dyn InferenceModel>, charset: Charset, input_height: Option<u32>) -> Self {
        Self {
            model,
            charset,
            input_height,
        }
    }

    pub fn contract() -> ModelContract {
        ModelContract {
            model: ModelKind::Recognizer,
            min_outputs: 1,
            output_ranks: vec![vec![2, 3]],
        }
    }

    pub fn charset(&self) -> &Charset {
        &self.charset
    }

    /// One text line per box, in box order, one inference at a time.
    #[instrument(level = "debug", skip_all, fields(boxes = boxes.len()))]
    pub fn get_text_lines(
        &self,
        surface: &Surface,
        boxes: &[TextBox],
        ledger: &TensorLedger,
        cancel: &CancellationToken,
    ) -> Result<Vec<TextLine>> {
        boxes
            .iter()
            .map(|text_box| {
                if cancel.is_cancelled() {
                    return Err(OcrError::Superseded);
                }
                self.get_text_line(&surface.crop(&text_box.rect), ledger)
            })
            .collect()
    }

    #[instrument(level = "trace", skip_all, fields(width = crop.width(), height = crop.height()))]
    fn get_text_line(&self, crop: &RgbImage, ledger: &TensorLedger) -> Result<TextLine> {
        if crop.width() == 0 || crop.height() == 0 {
            return Ok(TextLine {
                text: String::new(),
                character_scores: Vec::new(),
            });
        }
        let resized;
        let crop = match self.input_height {
            Some(dest_height) if dest_height != crop.height() => {
                let scale = dest_height as f32 / crop.height() as f32;
                let dest_width = ((crop.width() as f32 * scale) as u32).clamp(1, u16::MAX as u32);
                resized = image::imageops::resize(crop, dest_width, dest_height, FilterType::Nearest);
                &resized
            }
            _ => crop,
        };

        let pixels = ledger.track(from_pixels(crop, self.model.layout()));
        let normalized = ledger.track(normalize(&pixels));
        let outputs = self
            .model
            .run(normalized.view())?
            .into_iter()
            .map(|output| ledger.track(output))
            .collect::<Vec<_>>();
        let output = outputs
            .first()
            .ok_or_else(|| OcrError::malformed(ModelKind::Recognizer, "no outputs"))?;

        log::trace!("Recognizer output shape: {:?}", output.shape());
        decode_output(output.view(), &self.charset)
    }
}

fn decode_output(output: ArrayViewD<f32>, charset: &Charset) -> Result<TextLine> {
    let malformed = |shape: &[usize]| {
        OcrError::malformed(
            ModelKind::Recognizer,
            format!("output has shape {shape:?}, expected [1, T, C] or [1, T]"),
        )
    };
    let shape = output.shape().to_vec();
    if output.ndim() < 2 || output.len_of(Axis(0)) != 1 {
        return Err(malformed(&shape));
    }
    let output = output.index_axis_move(Axis(0), 0);
    match output.ndim() {
        2 => {
            let scores = output
                .into_dimensionality::<Ix2>()
                .map_err(|_| malformed(&shape))?;
            Ok(ctc_greedy_decode(scores, charset))
        }
        1 => {
            let indices = output
                .into_dimensionality::<Ix1>()
                .map_err(|_| malformed(&shape))?;
            Ok(decode_indices(indices, charset))
        }
        _ => Err(malformed(&shape)),
    }
}

/// Greedy CTC over `[T, C]` class scores: best class per step, repeats
/// collapsed, blanks dropped.
pub fn ctc_greedy_decode(scores: ArrayView2<f32>, charset: &Charset) -> TextLine {
    collapse(
        scores.outer_iter().map(|step| argmax(step).unwrap_or((BLANK_INDEX, 0.0))),
        charset,
    )
}

/// Same collapse rules over class ids the graph already picked.
pub fn decode_indices(indices: ArrayView1<f32>, charset: &Charset) -> TextLine {
    collapse(
        indices.iter().map(|id| {
            let index = if id.is_finite() && *id >= 0.0 {
                id.round() as usize
            } else {
                BLANK_INDEX
            };
            (index, 1.0)
        }),
        charset,
    )
}

fn collapse(steps: impl Iterator<Item = (usize, f32)>, charset: &Charset) -> TextLine {
    let mut text = String::new();
    let mut character_scores = Vec::new();
    let mut previous = None;
    for (index, score) in steps {
        if previous != Some(index) {
            if let Some(symbol) = charset.symbol(index) {
                text.push_str(symbol);
                character_scores.push(score);
            }
        }
        previous = Some(index);
    }
    TextLine {
        text,
        character_scores,
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn abc() -> Charset {
        Charset::from_keys(["a", "b", "c"])
    }

    #[test]
    fn charset_brackets_keys_with_blank_and_space() {
        let charset = abc();
        assert_eq!(charset.len(), 5);
        assert_eq!(charset.symbol(0), None);
        assert_eq!(charset.symbol(1), Some("a"));
        assert_eq!(charset.symbol(4), Some(" "));
        assert_eq!(charset.symbol(5), None);
    }

    #[test]
    fn charset_reads_one_symbol_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.txt");
        std::fs::write(&path, "x\ny\nz\n").unwrap();
        let charset = Charset::from_file(&path).unwrap();
        assert_eq!(charset, Charset::from_keys(["x", "y", "z"]));

        let missing = Charset::from_file(dir.path().join("nope.txt")).unwrap_err();
        assert!(matches!(missing, OcrError::Keys { .. }));
    }

    #[test]
    fn ctc_collapses_repeats_and_blanks() {
        #[rustfmt::skip]
        let scores = array![
            [0.9, 0.05, 0.03, 0.01, 0.01], // blank
            [0.1, 0.8, 0.05, 0.03, 0.02],  // a
            [0.1, 0.7, 0.1, 0.05, 0.05],   // a, repeated
            [0.1, 0.1, 0.7, 0.05, 0.05],   // b
            [0.8, 0.1, 0.05, 0.03, 0.02],  // blank
            [0.1, 0.1, 0.7, 0.05, 0.05],   // b again after a blank
        ];
        let line = ctc_greedy_decode(scores.view(), &abc());
        assert_eq!(line.text, "abb");
        assert_eq!(line.character_scores, vec![0.8, 0.7, 0.7]);
    }

    #[test]
    fn index_output_uses_the_same_rules() {
        let ids = array![3.0f32, 3.0, 0.0, 4.0, 1.0, 1.0, 9.0, 2.0];
        let line = decode_indices(ids.view(), &abc());
        assert_eq!(line.text, "c ab");
    }

    #[test]
    fn output_rank_selects_decoder() {
        let scores = array![[[0.1f32, 0.9, 0.0, 0.0, 0.0]]].into_dyn();
        assert_eq!(decode_output(scores.view(), &abc()).unwrap().text, "a");

        let ids = array![[2.0f32, 3.0]].into_dyn();
        assert_eq!(decode_output(ids.view(), &abc()).unwrap().text, "bc");

        let unbatched = array![1.0f32, 2.0].into_dyn();
        assert!(matches!(
            decode_output(unbatched.view(), &abc()),
            Err(OcrError::MalformedOutput { .. })
        ));
    }
}
