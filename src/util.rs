use float_ord::FloatOrd;
use geo::{
    point, Area, BoundingRect, Contains, Coord, EuclideanLength, HasDimensions, LineString,
    MinimumRotatedRect, Polygon, Translate,
};
use geo_clipper::{Clipper, EndType, JoinType};
use image::{GrayImage, Luma};
use imageproc::point::Point;
use ndarray::{s, ArrayView1, ArrayView2, Axis};

use crate::BoundingBox;

/// Index and value of the largest entry, ignoring NaNs.
pub(crate) fn argmax(values: ArrayView1<f32>) -> Option<(usize, f32)> {
    values
        .indexed_iter()
        .filter(|(_, value)| !value.is_nan())
        .max_by_key(|(_, value)| FloatOrd(**value))
        .map(|(index, value)| (index, *value))
}

pub(crate) fn to_luma_image(data: ArrayView2<f32>) -> GrayImage {
    let height = data.len_of(Axis(0));
    let width = data.len_of(Axis(1));
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([(data[[y as usize, x as usize]] * 255.0).clamp(0.0, 255.0) as u8])
    })
}

pub(crate) fn to_geo_poly(points: &[Point<i32>]) -> Polygon<f32> {
    let points = points
        .iter()
        .map(|point| Coord {
            x: point.x as f32,
            y: point.y as f32,
        })
        .collect();
    Polygon::new(LineString::new(points), vec![])
}

pub(crate) fn max_side(rect: &Polygon<f32>) -> f32 {
    rect.exterior()
        .lines()
        .map(|it| it.euclidean_length())
        .max_by_key(|length| FloatOrd(*length))
        .unwrap_or(0.0)
}

/// Mean probability of the map cells covered by `rect`.
pub(crate) fn box_score_fast(rect: &Polygon<f32>, pred_data: ArrayView2<f32>) -> f32 {
    let Some(bounds) = rect.bounding_rect() else {
        return 0.0;
    };
    let (height, width) = pred_data.dim();
    let min = bounds.min();
    let max = bounds.max();
    let (x0, y0) = (
        (min.x.max(0.0) as usize).min(width),
        (min.y.max(0.0) as usize).min(height),
    );
    let (x1, y1) = (
        (max.x.ceil().max(0.0) as usize).clamp(x0, width),
        (max.y.ceil().max(0.0) as usize).clamp(y0, height),
    );

    let sliced = pred_data.slice(s![y0..y1, x0..x1]);
    let local_rect = rect.translate(-(x0 as f32), -(y0 as f32));

    let (sum, count) = sliced
        .indexed_iter()
        .filter(|((y, x), _)| local_rect.contains(&point![x: *x as f32, y: *y as f32]))
        .fold((0.0, 0usize), |(sum, count), (_, value)| (sum + value, count + 1));

    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}

/// Grows a detected region outward; DB maps shrink text regions during
/// training, so raw contours hug the glyph centres.
pub(crate) fn unclip(rect: Polygon<f32>, unclip_ratio: f32) -> Option<Polygon<f32>> {
    let perimeter = rect.exterior().euclidean_length();
    if perimeter <= 0.0 {
        return None;
    }
    let distance = rect.unsigned_area() * unclip_ratio / perimeter;

    let grown = rect.offset(distance, JoinType::Round(0.25), EndType::ClosedPolygon, 1.0);

    if grown.is_empty() {
        None
    } else {
        grown.minimum_rotated_rect()
    }
}

pub(crate) fn polygon_bounds(poly: &Polygon<f32>) -> Option<BoundingBox> {
    let rect = poly.bounding_rect()?;
    Some(BoundingBox::from_edges(
        rect.min().x,
        rect.min().y,
        rect.max().x,
        rect.max().y,
    ))
}
