//! Tensor construction and accounting.
//!
//! Every array handed to or received from a model is wrapped in a
//! [`ScopedTensor`], which reports its release to the owning
//! [`TensorLedger`] when dropped. A balanced ledger after a run means nothing
//! was kept alive past its stage, whichever way the stage exited.

use std::{
    ops::Deref,
    sync::atomic::{AtomicUsize, Ordering},
};

use image::RgbImage;
use ndarray::{Array, Array3, Array4, Axis, Dimension};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorLayout {
    /// `[batch, height, width, channels]`
    #[default]
    Nhwc,
    /// `[batch, channels, height, width]`
    Nchw,
}

impl TensorLayout {
    /// Infers the layout from a declared rank-4 input shape by locating the
    /// 3-channel axis. Dynamic dimensions are reported as negative values.
    pub fn infer(dims: &[i64]) -> Option<Self> {
        match dims {
            [_, 3, _, _] => Some(TensorLayout::Nchw),
            [_, _, _, 3] => Some(TensorLayout::Nhwc),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TensorLedger {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl TensorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track<D: Dimension>(&self, array: Array<f32, D>) -> ScopedTensor<'_, D> {
        self.allocated.fetch_add(1, Ordering::SeqCst);
        ScopedTensor {
            array,
            ledger: self,
        }
    }

    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

pub struct ScopedTensor<'a, D: Dimension> {
    array: Array<f32, D>,
    ledger: &'a TensorLedger,
}

impl<D: Dimension> Deref for ScopedTensor<'_, D> {
    type Target = Array<f32, D>;

    fn deref(&self) -> &Self::Target {
        &self.array
    }
}

impl<D: Dimension> Drop for ScopedTensor<'_, D> {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reads the raw 0..=255 channel values of `image` into a batched tensor.
#[instrument(level = "trace", skip(image))]
pub fn from_pixels(image: &RgbImage, layout: TensorLayout) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let pixels = match layout {
        TensorLayout::Nhwc => Array3::<f32>::from_shape_fn((height, width, 3), |(y, x, ch)| {
            image.get_pixel(x as u32, y as u32)[ch] as f32
        }),
        TensorLayout::Nchw => Array3::<f32>::from_shape_fn((3, height, width), |(ch, y, x)| {
            image.get_pixel(x as u32, y as u32)[ch] as f32
        }),
    };
    pixels.insert_axis(Axis(0))
}

pub fn normalize(pixels: &Array4<f32>) -> Array4<f32> {
    pixels.mapv(|value| value / 255.0)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn layout_is_inferred_from_channel_axis() {
        assert_eq!(TensorLayout::infer(&[1, 3, -1, -1]), Some(TensorLayout::Nchw));
        assert_eq!(TensorLayout::infer(&[-1, -1, -1, 3]), Some(TensorLayout::Nhwc));
        assert_eq!(TensorLayout::infer(&[-1, -1, -1, -1]), None);
        assert_eq!(TensorLayout::infer(&[1, 3, 32]), None);
    }

    #[test]
    fn pixels_land_in_requested_layout() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(1, 0, Rgb([10, 20, 255]));

        let nhwc = from_pixels(&image, TensorLayout::Nhwc);
        assert_eq!(nhwc.shape(), &[1, 1, 2, 3]);
        assert_eq!(nhwc[[0, 0, 1, 2]], 255.0);

        let nchw = from_pixels(&image, TensorLayout::Nchw);
        assert_eq!(nchw.shape(), &[1, 3, 1, 2]);
        assert_eq!(nchw[[0, 1, 0, 1]], 20.0);

        let normalized = normalize(&nchw);
        assert_eq!(normalized[[0, 2, 0, 1]], 1.0);
        assert!(normalized.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn ledger_balances_when_tensors_drop() {
        let ledger = TensorLedger::new();
        {
            let a = ledger.track(Array4::<f32>::zeros((1, 1, 1, 1)));
            let _b = ledger.track(normalize(&a));
            assert_eq!(ledger.live(), 2);
        }
        assert_eq!(ledger.allocated(), 2);
        assert_eq!(ledger.released(), 2);
    }
}
