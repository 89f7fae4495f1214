// THEORY:
// Overlapping windows often fire on the same object. Non-maximum suppression
// keeps the most confident box of every overlapping cluster: boxes are visited
// best first, and a box survives only if its intersection-over-union with every
// survivor so far is at most `overlap`.

use crate::core_modules::geometry::intersection_over_union;
use crate::core_modules::model::PredictionBox;

/// `overlap` is a fraction in 0..=1. The result is ordered by descending top confidence.
pub fn non_max_suppression(mut boxes: Vec<PredictionBox>, overlap: f64) -> Vec<PredictionBox> {
    boxes.sort_by(|a, b| b.top_confidence().total_cmp(&a.top_confidence()));
    let mut kept: Vec<PredictionBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept
            .iter()
            .any(|k| intersection_over_union(&k.window, &candidate.window) > overlap);
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::PixelRect;
    use crate::core_modules::model::Prediction;

    fn window(x: i32, y: i32, confidence: f32) -> PredictionBox {
        PredictionBox::new(
            PixelRect::new(x, y, 10, 10),
            vec![Prediction::new("car", confidence)],
        )
    }

    #[test]
    fn keeps_best_of_overlapping_cluster() {
        let boxes = vec![window(0, 0, 0.6), window(2, 0, 0.9), window(50, 50, 0.7)];
        let kept = non_max_suppression(boxes, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].window, PixelRect::new(2, 0, 10, 10));
        assert_eq!(kept[1].window, PixelRect::new(50, 50, 10, 10));
    }

    #[test]
    fn threshold_is_exclusive() {
        // IoU of two 10x10 boxes offset by 5 is 50 / 150.
        let boxes = vec![window(0, 0, 0.9), window(5, 0, 0.8)];
        assert_eq!(non_max_suppression(boxes.clone(), 0.34).len(), 2);
        assert_eq!(non_max_suppression(boxes, 0.33).len(), 1);
    }

    #[test]
    fn zero_overlap_only_keeps_disjoint_boxes() {
        let boxes = vec![window(0, 0, 0.9), window(9, 9, 0.8), window(10, 0, 0.7)];
        assert_eq!(non_max_suppression(boxes, 0.0).len(), 2);
    }
}
