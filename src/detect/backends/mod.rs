pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::StubAdapter;

#[cfg(feature = "backend-tract")]
pub use tract::TractAdapter;

use crate::detect::result::RawDetection;

/// IoU above which a lower-scoring box of the same class is suppressed.
pub const NMS_IOU_THRESHOLD: f32 = 0.7;

/// Greedy per-class non-maximum suppression.
///
/// Returns survivors in confidence-descending order.
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;

    fn det(class_id: u32, confidence: f32, x: f32) -> RawDetection {
        RawDetection {
            class_id,
            confidence,
            bbox: BoundingBox::new(x, 0.0, x + 10.0, 10.0),
        }
    }

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let out = non_max_suppression(
            vec![det(0, 0.6, 0.0), det(0, 0.9, 0.5), det(1, 0.7, 0.0), det(0, 0.8, 50.0)],
            NMS_IOU_THRESHOLD,
        );
        let scores: Vec<f32> = out.iter().map(|d| d.confidence).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.7]);
    }
}
