use serde::Serialize;

/// Axis-aligned rectangle in surface pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_edges(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            x: left,
            y: top,
            width: right - left,
            height: bottom - top,
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Clips the box to `[0, width] x [0, height]`.
    pub fn clamp_to(&self, width: f32, height: f32) -> Self {
        let left = self.x.clamp(0.0, width);
        let top = self.y.clamp(0.0, height);
        let right = self.right().clamp(left, width);
        let bottom = self.bottom().clamp(top, height);
        Self::from_edges(left, top, right, bottom)
    }

    pub fn intersection_over_union(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0.0;
        }
        let intersection = (right - left) * (bottom - top);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBox {
    pub score: f32,
    pub rect: BoundingBox,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextLine {
    pub text: String,
    pub character_scores: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prediction {
    pub text: String,
}

impl From<TextLine> for Prediction {
    fn from(line: TextLine) -> Self {
        Self { text: line.text }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundingBox::from_edges(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_edges(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.intersection_over_union(&b), 0.0);
    }

    #[test]
    fn iou_of_half_overlap() {
        let a = BoundingBox::from_edges(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::from_edges(5.0, 0.0, 15.0, 10.0);
        let iou = a.intersection_over_union(&b);
        assert!((iou - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn clamp_keeps_box_inside_surface() {
        let rect = BoundingBox::from_edges(-5.0, 10.0, 120.0, 70.0).clamp_to(100.0, 50.0);
        assert_eq!(rect, BoundingBox::from_edges(0.0, 10.0, 100.0, 50.0));
    }
}
