// THEORY:
// Label filtering narrows detections to the classes a user cares about. It runs
// on prediction boxes after classification: predictions whose label is (or is
// not) in the list are removed, and a box with nothing left is dropped entirely.
// The remaining predictions keep their order, so the top prediction of a kept
// box is the best matching label.

use crate::core_modules::model::PredictionBox;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelFilterType {
    /// Keep only the listed labels.
    Include,
    /// Drop the listed labels.
    Exclude,
}

pub fn filter_labels(
    boxes: Vec<PredictionBox>,
    filter_type: LabelFilterType,
    labels: &[String],
) -> Vec<PredictionBox> {
    let labels: HashSet<&str> = labels.iter().map(String::as_str).collect();
    boxes
        .into_iter()
        .filter_map(|mut prediction_box| {
            prediction_box.predictions.retain(|p| {
                let listed = labels.contains(p.label.as_str());
                match filter_type {
                    LabelFilterType::Include => listed,
                    LabelFilterType::Exclude => !listed,
                }
            });
            (!prediction_box.predictions.is_empty()).then_some(prediction_box)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::PixelRect;
    use crate::core_modules::model::Prediction;

    fn boxes() -> Vec<PredictionBox> {
        vec![
            PredictionBox::new(
                PixelRect::new(0, 0, 10, 10),
                vec![Prediction::new("car", 0.7), Prediction::new("truck", 0.2)],
            ),
            PredictionBox::new(PixelRect::new(10, 0, 10, 10), vec![Prediction::new("tree", 0.9)]),
        ]
    }

    #[test]
    fn include_keeps_matching_predictions() {
        let kept = filter_labels(boxes(), LabelFilterType::Include, &["truck".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].predictions, vec![Prediction::new("truck", 0.2)]);
    }

    #[test]
    fn exclude_drops_emptied_boxes() {
        let kept = filter_labels(boxes(), LabelFilterType::Exclude, &["tree".to_string()]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].top().unwrap().label, "car");
    }
}
