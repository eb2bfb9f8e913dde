use std::collections::VecDeque;

use burn::tensor::{activation::{log_sigmoid, log_softmax, sigmoid}, backend::Backend, ElementConversion, Int, Tensor, TensorData};

use super::{box_ops::paired_generalized_iou, matcher::HungarianMatcherHoi, HoiOutput, HoiPrediction, PredictionArrays};
use crate::{config::{HoiConfig, VerbLossType}, data::HoiTarget, misc::EpochStats};

const FOCAL_CLAMP: f64 = 1e-4;
const MATCHING_LOSS_COEF: f64 = 1.0;

/// Class weights from label frequencies: `(total / count)^p`, normalized to mean one over the
/// seen classes. The last entry is the background class and is not normalized.
pub fn cal_weights(label_nums: &[f64], p: f64) -> Vec<f32> {
    let Some((&background, foreground)) = label_nums.split_last() else {
        return Vec::new();
    };
    let num_all: f64 = foreground.iter().sum();
    let mut weights: Vec<f64> = foreground
        .iter()
        .map(|&count| if count > 0.0 { (num_all / count).powf(p) } else { 0.0 })
        .collect();

    let seen: Vec<f64> = weights.iter().copied().filter(|w| *w > 0.0).collect();
    if !seen.is_empty() {
        let mean = seen.iter().sum::<f64>() / seen.len() as f64;
        weights.iter_mut().for_each(|w| *w /= mean);
    }
    weights.push(if background > 0.0 { (num_all / background).powf(p) } else { 0.0 });
    weights.into_iter().map(|w| w as f32).collect()
}

/// Sliding window of per-image label counts.
#[derive(Debug, Clone)]
pub struct LabelQueue {
    window: VecDeque<Vec<f64>>,
    totals: Vec<f64>,
    capacity: usize,
    p: f64,
    freeze_when_full: bool,
    frozen: Option<Vec<f32>>,
}

impl LabelQueue {
    pub fn new(num_labels: usize, capacity: f64, p: f64, freeze_when_full: bool) -> Self {
        Self {
            window: VecDeque::new(),
            totals: vec![0.0; num_labels],
            capacity: capacity.max(1.0) as usize,
            p,
            freeze_when_full,
            frozen: None,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Records one image and returns the weights to use for it.
    pub fn push(&mut self, counts: Vec<f64>) -> Vec<f32> {
        if let Some(frozen) = &self.frozen {
            return frozen.clone();
        }
        self.totals.iter_mut().zip(&counts).for_each(|(total, c)| *total += c);
        self.window.push_back(counts);
        while self.window.len() > self.capacity {
            if let Some(old) = self.window.pop_front() {
                self.totals.iter_mut().zip(&old).for_each(|(total, c)| *total -= c);
            }
        }

        let weights = cal_weights(&self.totals, self.p);
        if self.freeze_when_full && self.window.len() >= self.capacity {
            self.frozen = Some(weights.clone());
        }
        weights
    }
}

#[derive(Debug, Clone)]
pub struct CriterionOutput<B: Backend> {
    /// Weighted sum over every loss term, `[1]`.
    pub loss: Tensor<B, 1>,
    /// Unweighted terms plus `loss`, as host values.
    pub stats: EpochStats,
}

/// Query/pair correspondences of one layer, flattened over the batch.
struct Matched {
    /// `image * queries + query`
    rows: Vec<i64>,
    /// `(image, pair)` per row.
    pairs: Vec<(usize, usize)>,
}

impl Matched {
    fn new(indices: &[Vec<(usize, usize)>], queries: usize) -> Self {
        let mut rows = Vec::new();
        let mut pairs = Vec::new();
        for (image, matches) in indices.iter().enumerate() {
            for &(query, pair) in matches {
                rows.push((image * queries + query) as i64);
                pairs.push((image, pair));
            }
        }
        Self { rows, pairs }
    }

    fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Matches predictions to targets and computes the HOI training losses.
#[derive(Debug, Clone)]
pub struct SetCriterionHoi {
    pub num_obj_classes: usize,
    pub num_verb_classes: usize,
    matcher: HungarianMatcherHoi,
    verb_loss_type: VerbLossType,
    gamma: f64,
    alpha: Option<f64>,
    use_matching: bool,
    obj_loss_coef: f64,
    verb_loss_coef: f64,
    bbox_loss_coef: f64,
    giou_loss_coef: f64,
    obj_weights: Vec<f32>,
    verb_weights: Option<Vec<f32>>,
    obj_queue: Option<LabelQueue>,
    verb_queue: Option<LabelQueue>,
}

impl SetCriterionHoi {
    pub fn from_config(config: &HoiConfig) -> Self {
        let mut obj_weights = vec![1.0; config.num_obj_classes + 1];
        obj_weights[config.num_obj_classes] = config.eos_coef as f32;

        Self {
            num_obj_classes: config.num_obj_classes,
            num_verb_classes: config.num_verb_classes,
            matcher: HungarianMatcherHoi::from_config(config),
            verb_loss_type: config.verb_loss_type,
            gamma: config.verb_gamma,
            alpha: config.verb_alpha,
            use_matching: config.use_matching,
            obj_loss_coef: config.obj_loss_coef,
            verb_loss_coef: config.verb_loss_coef,
            bbox_loss_coef: config.bbox_loss_coef,
            giou_loss_coef: config.giou_loss_coef,
            obj_weights,
            verb_weights: None,
            obj_queue: config
                .obj_reweight
                .then(|| LabelQueue::new(config.num_obj_classes + 1, config.queue_size, config.p_obj, config.use_static_weights)),
            verb_queue: config
                .verb_reweight
                .then(|| LabelQueue::new(config.num_verb_classes + 1, config.queue_size, config.p_verb, config.use_static_weights)),
        }
    }

    pub fn matcher(&self) -> &HungarianMatcherHoi {
        &self.matcher
    }

    pub fn obj_weights(&self) -> &[f32] {
        &self.obj_weights
    }

    pub fn forward<B: Backend>(&mut self, outputs: &HoiOutput<B>, targets: &[HoiTarget]) -> CriterionOutput<B> {
        let mut stats = EpochStats::new();
        let mut total = self.layer_loss(&outputs.main, targets, true, "", &mut stats);
        for (i, aux) in outputs.aux.iter().enumerate() {
            let aux_loss = self.layer_loss(aux, targets, false, &format!("_{i}"), &mut stats);
            total = total + aux_loss;
        }
        stats.insert("loss", total.clone().into_scalar().elem::<f64>());
        CriterionOutput { loss: total, stats }
    }

    fn layer_loss<B: Backend>(
        &mut self,
        pred: &HoiPrediction<B>,
        targets: &[HoiTarget],
        main: bool,
        suffix: &str,
        stats: &mut EpochStats,
    ) -> Tensor<B, 1> {
        let arrays = PredictionArrays::from_prediction(pred);
        let indices = self.matcher.forward(&arrays, targets);
        let matched = Matched::new(&indices, arrays.queries);
        let num_interactions = targets.iter().map(HoiTarget::num_pairs).sum::<usize>().max(1) as f64;

        let target_classes = self.target_classes(&arrays, &matched, targets);
        let target_verbs = self.target_verbs(&arrays, &matched, targets);
        if main {
            self.update_weights(&arrays, &target_classes, &target_verbs);
            stats.insert("obj_class_error", obj_class_error(&arrays, &matched, &target_classes));
            stats.insert("obj_cardinality_error", cardinality_error(&arrays, targets));
        }

        let mut terms = vec![
            ("loss_obj_ce", self.obj_loss_coef, self.loss_obj_labels(pred, &target_classes)),
            ("loss_verb_ce", self.verb_loss_coef, self.loss_verb_labels(pred, &target_verbs)),
        ];
        let [sub_bbox, obj_bbox, sub_giou, obj_giou] = loss_boxes(pred, &matched, targets, num_interactions);
        terms.push(("loss_sub_bbox", self.bbox_loss_coef, sub_bbox));
        terms.push(("loss_obj_bbox", self.bbox_loss_coef, obj_bbox));
        terms.push(("loss_sub_giou", self.giou_loss_coef, sub_giou));
        terms.push(("loss_obj_giou", self.giou_loss_coef, obj_giou));
        if self.use_matching {
            if let Some(matching) = loss_matching(pred, &matched) {
                terms.push(("loss_matching", MATCHING_LOSS_COEF, matching));
            }
        }

        let mut total: Option<Tensor<B, 1>> = None;
        for (name, coef, loss) in terms {
            stats.insert(format!("{name}{suffix}"), loss.clone().into_scalar().elem::<f64>());
            let weighted = loss.mul_scalar(coef);
            total = Some(match total {
                Some(total) => total + weighted,
                None => weighted,
            });
        }
        total.unwrap_or_else(|| pred.obj_logits.clone().sum().mul_scalar(0.0))
    }

    /// Class index per flattened query, "no object" for unmatched ones.
    fn target_classes(&self, arrays: &PredictionArrays, matched: &Matched, targets: &[HoiTarget]) -> Vec<usize> {
        let mut classes = vec![self.num_obj_classes; arrays.images * arrays.queries];
        for (row, &(image, pair)) in matched.rows.iter().zip(&matched.pairs) {
            classes[*row as usize] = targets[image].obj_labels[pair];
        }
        classes
    }

    /// Multi-hot verb rows per flattened query, zeros for unmatched ones.
    fn target_verbs(&self, arrays: &PredictionArrays, matched: &Matched, targets: &[HoiTarget]) -> Vec<f32> {
        let width = self.num_verb_classes;
        let mut verbs = vec![0.0; arrays.images * arrays.queries * width];
        for (row, &(image, pair)) in matched.rows.iter().zip(&matched.pairs) {
            let start = *row as usize * width;
            verbs[start..start + width].copy_from_slice(&targets[image].verb_labels[pair]);
        }
        verbs
    }

    fn update_weights(&mut self, arrays: &PredictionArrays, target_classes: &[usize], target_verbs: &[f32]) {
        let queries = arrays.queries;
        if let Some(queue) = self.obj_queue.as_mut() {
            for image in target_classes.chunks(queries.max(1)) {
                let mut counts = vec![0.0; self.num_obj_classes + 1];
                image.iter().for_each(|&label| counts[label] += 1.0);
                self.obj_weights = queue.push(counts);
            }
        }
        if let Some(queue) = self.verb_queue.as_mut() {
            let width = self.num_verb_classes;
            for image in target_verbs.chunks((queries * width).max(1)) {
                let mut counts = vec![0.0; width + 1];
                for row in image.chunks(width.max(1)) {
                    let mut positive = false;
                    for (class, _) in row.iter().enumerate().filter(|(_, v)| **v > 0.0) {
                        counts[class] += 1.0;
                        positive = true;
                    }
                    if !positive {
                        counts[width] += 1.0;
                    }
                }
                self.verb_weights = Some(queue.push(counts));
            }
        }
    }

    /// Weighted cross entropy over object classes, normalized by the summed target weights.
    fn loss_obj_labels<B: Backend>(&self, pred: &HoiPrediction<B>, target_classes: &[usize]) -> Tensor<B, 1> {
        let [images, queries, classes] = pred.obj_logits.dims();
        let device = pred.obj_logits.device();
        let rows = images * queries;

        let mut weighted_one_hot = vec![0.0f32; rows * classes];
        let mut weight_sum = 0.0f64;
        for (row, &label) in target_classes.iter().enumerate() {
            let weight = self.obj_weights.get(label).copied().unwrap_or(1.0);
            weighted_one_hot[row * classes + label] = weight;
            weight_sum += weight as f64;
        }
        let weighted_one_hot = Tensor::<B, 2>::from_data(TensorData::new(weighted_one_hot, [rows, classes]), &device);

        let log_probs = log_softmax(pred.obj_logits.clone().reshape([rows, classes]), 1);
        (log_probs * weighted_one_hot).sum().neg().div_scalar(weight_sum.max(f64::EPSILON))
    }

    fn loss_verb_labels<B: Backend>(&self, pred: &HoiPrediction<B>, target_verbs: &[f32]) -> Tensor<B, 1> {
        let [images, queries, classes] = pred.verb_logits.dims();
        let device = pred.verb_logits.device();
        let logits = pred.verb_logits.clone().reshape([images * queries, classes]);
        let gt = Tensor::<B, 2>::from_data(TensorData::new(target_verbs.to_vec(), [images * queries, classes]), &device);

        match self.verb_loss_type {
            VerbLossType::Bce => {
                let pos = gt.clone() * log_sigmoid(logits.clone());
                let neg = gt.neg().add_scalar(1.0) * log_sigmoid(logits.neg());
                (pos + neg).mean().neg()
            }
            VerbLossType::Focal => {
                let num_pos = target_verbs.iter().filter(|v| **v >= 1.0).count();
                let pred = sigmoid(logits).clamp(FOCAL_CLAMP, 1.0 - FOCAL_CLAMP);
                let not_pred = pred.clone().neg().add_scalar(1.0);
                let neg_mask = gt.clone().neg().add_scalar(1.0);

                let mut pos_loss = pred.clone().log() * not_pred.clone().powf_scalar(self.gamma) * gt;
                let mut neg_loss = not_pred.log() * pred.powf_scalar(self.gamma) * neg_mask;
                if let Some(weights) = &self.verb_weights {
                    let (pos_weights, neg_weight) = weights.split_at(classes);
                    let pos_weights = Tensor::<B, 1>::from_data(TensorData::new(pos_weights.to_vec(), [classes]), &device);
                    pos_loss = pos_loss * pos_weights.unsqueeze_dim::<2>(0);
                    neg_loss = neg_loss.mul_scalar(neg_weight.first().copied().unwrap_or(1.0));
                }
                if let Some(alpha) = self.alpha {
                    pos_loss = pos_loss.mul_scalar(alpha);
                    neg_loss = neg_loss.mul_scalar(1.0 - alpha);
                }

                if num_pos == 0 {
                    neg_loss.sum().neg()
                } else {
                    (pos_loss.sum() + neg_loss.sum()).neg().div_scalar(num_pos as f64)
                }
            }
        }
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

/// 100 minus the top-1 accuracy of matched queries.
fn obj_class_error(arrays: &PredictionArrays, matched: &Matched, target_classes: &[usize]) -> f64 {
    if matched.is_empty() {
        return 100.0;
    }
    let correct = matched
        .rows
        .iter()
        .filter(|&&row| {
            let row = row as usize;
            argmax(arrays.obj_prob(row / arrays.queries, row % arrays.queries)) == target_classes[row]
        })
        .count();
    100.0 - 100.0 * correct as f64 / matched.len() as f64
}

/// Mean absolute difference between predicted non-background queries and target pairs.
fn cardinality_error(arrays: &PredictionArrays, targets: &[HoiTarget]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let background = arrays.obj_classes - 1;
    let total: f64 = targets
        .iter()
        .enumerate()
        .map(|(image, target)| {
            let predicted = (0..arrays.queries).filter(|&q| argmax(arrays.obj_prob(image, q)) != background).count();
            (predicted as f64 - target.num_pairs() as f64).abs()
        })
        .sum();
    total / targets.len() as f64
}

/// L1 and GIoU losses for subject and object boxes; object terms skip pairs without an object box.
fn loss_boxes<B: Backend>(pred: &HoiPrediction<B>, matched: &Matched, targets: &[HoiTarget], num_interactions: f64) -> [Tensor<B, 1>; 4] {
    if matched.is_empty() {
        let zero = pred.sub_boxes.clone().sum().mul_scalar(0.0) + pred.obj_boxes.clone().sum().mul_scalar(0.0);
        return [zero.clone(), zero.clone(), zero.clone(), zero];
    }

    let [images, queries, _] = pred.sub_boxes.dims();
    let device = pred.sub_boxes.device();
    let count = matched.len();
    let rows = Tensor::<B, 1, Int>::from_data(TensorData::new(matched.rows.clone(), [count]), &device);

    let mut sub_target = Vec::with_capacity(count * 4);
    let mut obj_target = Vec::with_capacity(count * 4);
    let mut exist = Vec::with_capacity(count);
    for &(image, pair) in &matched.pairs {
        let target = &targets[image];
        sub_target.extend_from_slice(&target.sub_boxes[pair]);
        obj_target.extend_from_slice(&target.obj_boxes[pair]);
        exist.push(if target.has_object_box(pair) { 1.0f32 } else { 0.0 });
    }
    let exist_sum = exist.iter().sum::<f32>() as f64 + 1e-4;

    let sub_target = Tensor::<B, 2>::from_data(TensorData::new(sub_target, [count, 4]), &device);
    let obj_target = Tensor::<B, 2>::from_data(TensorData::new(obj_target, [count, 4]), &device);
    let exist = Tensor::<B, 1>::from_data(TensorData::new(exist, [count]), &device);

    let src_sub = pred.sub_boxes.clone().reshape([images * queries, 4]).select(0, rows.clone());
    let src_obj = pred.obj_boxes.clone().reshape([images * queries, 4]).select(0, rows);

    let sub_bbox = (src_sub.clone() - sub_target.clone()).abs().sum().div_scalar(num_interactions);
    let obj_bbox = ((src_obj.clone() - obj_target.clone()).abs() * exist.clone().unsqueeze_dim::<2>(1))
        .sum()
        .div_scalar(exist_sum);
    let sub_giou = paired_generalized_iou(src_sub, sub_target).neg().add_scalar(1.0).sum().div_scalar(num_interactions);
    let obj_giou = (paired_generalized_iou(src_obj, obj_target).neg().add_scalar(1.0) * exist)
        .sum()
        .div_scalar(exist_sum);
    [sub_bbox, obj_bbox, sub_giou, obj_giou]
}

/// Two-way cross entropy: matched queries are "interactive", the rest are not.
fn loss_matching<B: Backend>(pred: &HoiPrediction<B>, matched: &Matched) -> Option<Tensor<B, 1>> {
    let logits = pred.matching_logits.as_ref()?;
    let [images, queries, _] = logits.dims();
    let rows = images * queries;
    let mut one_hot = vec![0.0f32; rows * 2];
    for row in 0..rows {
        one_hot[row * 2] = 1.0;
    }
    for &row in &matched.rows {
        let row = row as usize;
        one_hot[row * 2] = 0.0;
        one_hot[row * 2 + 1] = 1.0;
    }
    let one_hot = Tensor::<B, 2>::from_data(TensorData::new(one_hot, [rows, 2]), &logits.device());
    let log_probs = log_softmax(logits.clone().reshape([rows, 2]), 1);
    Some((log_probs * one_hot).sum().neg().div_scalar(rows.max(1) as f64))
}
