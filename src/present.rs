use std::io::{self, Write};

use crate::Prediction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// One recognized string per line.
    #[default]
    Text,
    /// `[{"text": ...}, ...]`
    Json,
}

pub fn render(predictions: &[Prediction], format: Format, mut out: impl Write) -> io::Result<()> {
    match format {
        Format::Text => {
            for prediction in predictions {
                writeln!(out, "{}", prediction.text)?;
            }
        }
        Format::Json => {
            serde_json::to_writer(&mut out, predictions)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
