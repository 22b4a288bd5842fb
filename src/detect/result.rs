use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Axis-aligned box in pixel coordinates.
///
/// `x_min <= x_max` and `y_min <= y_max` once a box has passed through
/// [`BoundingBox::normalized`] or [`BoundingBox::rescale_clamped`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    /// Build from a center point and size, the layout YOLO heads emit.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    /// Same box with corners swapped where needed so min <= max.
    pub fn normalized(self) -> Self {
        Self {
            x_min: self.x_min.min(self.x_max),
            y_min: self.y_min.min(self.y_max),
            x_max: self.x_min.max(self.x_max),
            y_max: self.y_min.max(self.y_max),
        }
    }

    pub fn width(&self) -> f32 {
        (self.x_max - self.x_min).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y_max - self.y_min).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Intersection over union; 0 when either box is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix = (self.x_max.min(other.x_max) - self.x_min.max(other.x_min)).max(0.0);
        let iy = (self.y_max.min(other.y_max) - self.y_min.max(other.y_min)).max(0.0);
        let inter = ix * iy;
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Map from a `from`-sized coordinate frame into a `to`-sized one and
    /// clamp into `[0, to.w - 1] x [0, to.h - 1]`.
    ///
    /// Non-finite coordinates collapse to 0.
    pub fn rescale_clamped(self, from: (u32, u32), to: (u32, u32)) -> Self {
        let sx = to.0 as f32 / from.0.max(1) as f32;
        let sy = to.1 as f32 / from.1.max(1) as f32;
        let max_x = to.0.saturating_sub(1) as f32;
        let max_y = to.1.saturating_sub(1) as f32;
        let clamp = |v: f32, hi: f32| if v.is_finite() { v.clamp(0.0, hi) } else { 0.0 };
        let b = self.normalized();
        Self {
            x_min: clamp(b.x_min * sx, max_x),
            y_min: clamp(b.y_min * sy, max_y),
            x_max: clamp(b.x_max * sx, max_x),
            y_max: clamp(b.y_max * sy, max_y),
        }
    }
}

/// Adapter output in model-input coordinates, before labelling and rescale.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// One labelled detection in source-resolution pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// All detections produced for one frame, in adapter order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionBatch {
    pub sequence: u64,
    #[serde(with = "duration_millis")]
    pub timestamp: Duration,
    pub frame_width: u32,
    pub frame_height: u32,
    pub detections: Vec<Detection>,
}

impl DetectionBatch {
    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_maps_model_space_to_source_space() {
        let b = BoundingBox::new(64.0, 128.0, 320.0, 480.0);
        let r = b.rescale_clamped((640, 640), (1280, 720));
        assert_eq!(r, BoundingBox::new(128.0, 144.0, 640.0, 540.0));
    }

    #[test]
    fn rescale_clamps_and_orders_corners() {
        let cases = [
            BoundingBox::new(-50.0, -10.0, 700.0, 900.0),
            BoundingBox::new(600.0, 500.0, 20.0, 10.0),
            BoundingBox::new(f32::NAN, 3.0, f32::INFINITY, -0.0),
            BoundingBox::new(639.9, 639.9, 640.0, 640.0),
        ];
        for (w, h) in [(640, 480), (1920, 1080), (1, 1), (33, 7)] {
            for b in cases {
                let r = b.rescale_clamped((640, 640), (w, h));
                assert!(r.x_min <= r.x_max && r.y_min <= r.y_max, "{:?}", r);
                assert!(r.x_min >= 0.0 && r.y_min >= 0.0, "{:?}", r);
                assert!(r.x_max < w as f32 && r.y_max < h as f32, "{:?} in {}x{}", r, w, h);
            }
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&b), 0.0);
        let half = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        assert!((a.iou(&half) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn batch_serializes_timestamp_as_millis() {
        let batch = DetectionBatch {
            sequence: 3,
            timestamp: Duration::from_millis(100),
            frame_width: 640,
            frame_height: 480,
            detections: vec![],
        };
        let json = serde_json::to_value(&batch).expect("serialize");
        assert_eq!(json["timestamp"], 100);
        assert_eq!(json["sequence"], 3);
    }
}
