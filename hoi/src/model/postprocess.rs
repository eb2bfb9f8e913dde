use std::{cmp::Ordering, collections::BTreeMap};

use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use super::{box_ops::BoxXyxy, HoiPrediction, PredictionArrays};
use crate::config::HoiConfig;

/// Triplets kept per image before evaluation.
pub const MAX_DETECTIONS: usize = 100;

/// One scored subject-verb-object detection in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoiTriplet {
    pub sub_box: [f32; 4],
    pub obj_box: [f32; 4],
    pub sub_label: usize,
    pub obj_label: usize,
    pub verb: usize,
    pub score: f32,
}

impl HoiTriplet {
    pub fn sub(&self) -> BoxXyxy {
        let [x0, y0, x1, y1] = self.sub_box;
        BoxXyxy::new(x0, y0, x1, y1)
    }

    pub fn obj(&self) -> BoxXyxy {
        let [x0, y0, x1, y1] = self.obj_box;
        BoxXyxy::new(x0, y0, x1, y1)
    }
}

fn by_score_desc(a: &HoiTriplet, b: &HoiTriplet) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Turns raw predictions into ranked triplets per image.
#[derive(Debug, Clone, PartialEq)]
pub struct PostProcessHoi {
    pub subject_category_id: usize,
    pub use_matching: bool,
    pub use_nms_filter: bool,
    pub thres_nms: f64,
    pub nms_alpha: f64,
    pub nms_beta: f64,
    pub max_detections: usize,
}

impl PostProcessHoi {
    pub fn from_config(config: &HoiConfig) -> Self {
        Self {
            subject_category_id: config.subject_category_id,
            use_matching: config.use_matching,
            use_nms_filter: config.use_nms_filter,
            thres_nms: config.thres_nms,
            nms_alpha: config.nms_alpha,
            nms_beta: config.nms_beta,
            max_detections: MAX_DETECTIONS,
        }
    }

    /// `orig_sizes` holds `[height, width]` per image.
    pub fn forward<B: Backend>(&self, pred: &HoiPrediction<B>, orig_sizes: &[[usize; 2]]) -> Vec<Vec<HoiTriplet>> {
        let arrays = PredictionArrays::from_prediction(pred);
        orig_sizes
            .iter()
            .enumerate()
            .take(arrays.images)
            .map(|(image, &size)| {
                let mut triplets = self.image_triplets(&arrays, image, size);
                triplets.sort_by(by_score_desc);
                triplets.truncate(self.max_detections);
                if self.use_nms_filter {
                    triplets = self.triplet_nms(triplets);
                }
                triplets
            })
            .collect()
    }

    fn image_triplets(&self, arrays: &PredictionArrays, image: usize, [height, width]: [usize; 2]) -> Vec<HoiTriplet> {
        let mut triplets = Vec::with_capacity(arrays.queries * arrays.verb_classes);
        for query in 0..arrays.queries {
            let obj_prob = arrays.obj_prob(image, query);
            // the last class is "no object"
            let foreground = &obj_prob[..obj_prob.len().saturating_sub(1)];
            let Some((obj_label, &obj_score)) = foreground
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(Ordering::Equal))
            else {
                continue;
            };
            let matching = match (self.use_matching, arrays.matching_prob(image, query)) {
                (true, Some(prob)) => prob[1],
                _ => 1.0,
            };

            let to_pixels = |b: &[f32]| {
                BoxXyxy::from_cxcywh([b[0], b[1], b[2], b[3]])
                    .scale(width as f32, height as f32)
                    .to_array()
            };
            let sub_box = to_pixels(arrays.sub_box(image, query));
            let obj_box = to_pixels(arrays.obj_box(image, query));

            for (verb, &verb_prob) in arrays.verb_prob(image, query).iter().enumerate() {
                triplets.push(HoiTriplet {
                    sub_box,
                    obj_box,
                    sub_label: self.subject_category_id,
                    obj_label,
                    verb,
                    score: verb_prob * obj_score * matching,
                });
            }
        }
        triplets
    }

    /// Per (object, verb) category, drops triplets overlapping a better one by
    /// `sub_iou^alpha * obj_iou^beta > thres_nms`. Input must be sorted by score.
    pub fn triplet_nms(&self, triplets: Vec<HoiTriplet>) -> Vec<HoiTriplet> {
        let mut groups: BTreeMap<(usize, usize), Vec<HoiTriplet>> = BTreeMap::new();
        for triplet in triplets {
            groups.entry((triplet.obj_label, triplet.verb)).or_default().push(triplet);
        }

        let mut kept = Vec::new();
        for (_, group) in groups {
            let mut survivors: Vec<HoiTriplet> = Vec::new();
            for candidate in group {
                let suppressed = survivors.iter().any(|best| {
                    let sub_iou = best.sub().iou(&candidate.sub()) as f64;
                    let obj_iou = best.obj().iou(&candidate.obj()) as f64;
                    sub_iou.powf(self.nms_alpha) * obj_iou.powf(self.nms_beta) > self.thres_nms
                });
                if !suppressed {
                    survivors.push(candidate);
                }
            }
            kept.extend(survivors);
        }
        kept.sort_by(by_score_desc);
        kept
    }
}

#[cfg(test)]
mod tests {
    use burn::{backend::NdArray, tensor::{Tensor, TensorData}};

    use super::*;

    type TestBackend = NdArray<f32>;

    fn postprocess() -> PostProcessHoi {
        PostProcessHoi::from_config(&HoiConfig::controller_default())
    }

    fn triplet(score: f32, offset: f32, verb: usize) -> HoiTriplet {
        HoiTriplet {
            sub_box: [offset, 0.0, offset + 10.0, 10.0],
            obj_box: [offset, 20.0, offset + 10.0, 30.0],
            sub_label: 0,
            obj_label: 1,
            verb,
            score,
        }
    }

    #[test]
    fn scores_combine_verb_and_object_probabilities() {
        let device = Default::default();
        // one query, classes [a, b, no-object]; object logits favour `b`
        let obj_logits = Tensor::<TestBackend, 3>::from_data(TensorData::new(vec![0.0f32, 2.0, 0.0], [1, 1, 3]), &device);
        let boxes = Tensor::<TestBackend, 3>::from_data(TensorData::new(vec![0.5f32, 0.5, 0.5, 0.5], [1, 1, 4]), &device);
        let pred = HoiPrediction {
            obj_logits,
            verb_logits: Tensor::zeros([1, 1, 2], &device),
            sub_boxes: boxes.clone(),
            obj_boxes: boxes,
            matching_logits: None,
        };
        let triplets = postprocess().forward(&pred, &[[200, 100]]);

        assert_eq!(triplets.len(), 1);
        assert_eq!(triplets[0].len(), 2);
        let first = triplets[0][0];
        assert_eq!(first.obj_label, 1);
        let obj_score = 2f32.exp() / (2.0 + 2f32.exp());
        assert!((first.score - 0.5 * obj_score).abs() < 1e-5);
        assert_eq!(first.sub_box, [25.0, 50.0, 75.0, 150.0]);
    }

    #[test]
    fn nms_keeps_best_of_overlapping_triplets() {
        let kept = postprocess().triplet_nms(vec![triplet(0.9, 0.0, 0), triplet(0.8, 1.0, 0), triplet(0.7, 50.0, 0), triplet(0.6, 0.0, 1)]);
        let scores: Vec<f32> = kept.iter().map(|t| t.score).collect();
        assert_eq!(scores, vec![0.9, 0.7, 0.6]);
    }
}
