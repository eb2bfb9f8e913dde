use std::collections::{BTreeMap, HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{data::HoiTarget, distributed::ResultGatherer, error::Result, misc::EpochStats, model::{box_ops::BoxXyxy, postprocess::{HoiTriplet, MAX_DETECTIONS}}};

pub const RARE_THRESHOLD: usize = 10;
const IOU_THRESHOLD: f32 = 0.5;

/// `(object label, verb)`
pub type TripletCategory = (usize, usize);

#[derive(Debug, Clone, Copy)]
struct GtTriplet {
    sub: BoxXyxy,
    obj: BoxXyxy,
    category: TripletCategory,
}

/// Matching result of one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ImageResult {
    gts: Vec<TripletCategory>,
    /// `(category, score, true positive)`
    detections: Vec<(TripletCategory, f32, bool)>,
}

fn xyxy([x0, y0, x1, y1]: [f32; 4]) -> BoxXyxy {
    BoxXyxy::new(x0, y0, x1, y1)
}

/// VOC all-point interpolated average precision.
pub fn voc_ap(recall: &[f64], precision: &[f64]) -> f64 {
    let mut mrec = Vec::with_capacity(recall.len() + 2);
    mrec.push(0.0);
    mrec.extend_from_slice(recall);
    mrec.push(1.0);
    let mut mpre = Vec::with_capacity(precision.len() + 2);
    mpre.push(0.0);
    mpre.extend_from_slice(precision);
    mpre.push(0.0);

    for i in (0..mpre.len() - 1).rev() {
        mpre[i] = mpre[i].max(mpre[i + 1]);
    }
    (0..mrec.len() - 1)
        .filter(|&i| mrec[i + 1] != mrec[i])
        .map(|i| (mrec[i + 1] - mrec[i]) * mpre[i + 1])
        .sum()
}

/// Triplet mAP over HICO-DET style categories, split into rare and non-rare by training frequency.
///
/// Results are kept per image file, so an image seen twice (sampler padding, or the same
/// image on two ranks) is scored once.
#[derive(Debug, Clone, Default)]
pub struct HicoEvaluator {
    rare: HashSet<TripletCategory>,
    images: BTreeMap<String, ImageResult>,
}

impl HicoEvaluator {
    pub fn new(train_counts: &HashMap<TripletCategory, usize>) -> Self {
        Self {
            rare: train_counts
                .iter()
                .filter(|(_, count)| **count < RARE_THRESHOLD)
                .map(|(category, _)| *category)
                .collect(),
            ..Self::default()
        }
    }

    pub fn is_rare(&self, category: &TripletCategory) -> bool {
        self.rare.contains(category)
    }

    /// Number of distinct images scored so far.
    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    /// `detections` must be sorted by descending score; only the first 100 are used.
    /// Interactions without an object box are not evaluated.
    pub fn add(&mut self, detections: &[HoiTriplet], target: &HoiTarget) {
        if self.images.contains_key(&target.file_name) {
            debug!("{} already evaluated, skipping", target.file_name);
            return;
        }
        let gts: Vec<GtTriplet> = target
            .hois
            .iter()
            .filter_map(|hoi| {
                let object = hoi.object?;
                Some(GtTriplet {
                    sub: xyxy(target.boxes[hoi.subject]),
                    obj: xyxy(target.boxes[object]),
                    category: (target.labels[object], hoi.verb),
                })
            })
            .collect();

        let mut used = vec![false; gts.len()];
        let mut result = ImageResult {
            gts: gts.iter().map(|gt| gt.category).collect(),
            detections: Vec::with_capacity(detections.len().min(MAX_DETECTIONS)),
        };
        for det in detections.iter().take(MAX_DETECTIONS) {
            let category = (det.obj_label, det.verb);
            let (sub, obj) = (det.sub(), det.obj());
            let best = gts
                .iter()
                .enumerate()
                .filter(|(i, gt)| !used[*i] && gt.category == category)
                .map(|(i, gt)| (i, gt.sub.iou(&sub).min(gt.obj.iou(&obj))))
                .filter(|(_, overlap)| *overlap >= IOU_THRESHOLD)
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let is_tp = match best {
                Some((i, _)) => {
                    used[i] = true;
                    true
                }
                None => false,
            };
            result.detections.push((category, det.score, is_tp));
        }
        self.images.insert(target.file_name.clone(), result);
    }

    /// Exchanges per-image results with every rank so each one scores the whole split.
    pub fn synchronize(&mut self, gatherer: &dyn ResultGatherer) -> Result<()> {
        let payload = serde_json::to_vec(&self.images)?;
        for part in gatherer.all_gather(payload)? {
            let images: BTreeMap<String, ImageResult> = serde_json::from_slice(&part)?;
            for (file_name, result) in images {
                self.images.entry(file_name).or_insert(result);
            }
        }
        Ok(())
    }

    /// `(ap, max recall)` for one category with at least one ground truth.
    fn category_ap(mut dets: Vec<(f32, bool)>, num_gt: usize) -> (f64, f64) {
        if dets.is_empty() {
            return (0.0, 0.0);
        }
        dets.sort_by(|a, b| b.0.total_cmp(&a.0));

        let (mut tp, mut fp) = (0.0, 0.0);
        let mut recall = Vec::with_capacity(dets.len());
        let mut precision = Vec::with_capacity(dets.len());
        for (_, is_tp) in dets {
            if is_tp { tp += 1.0 } else { fp += 1.0 }
            recall.push(tp / num_gt as f64);
            precision.push(tp / (tp + fp));
        }
        let max_recall = recall.last().copied().unwrap_or(0.0);
        (voc_ap(&recall, &precision), max_recall)
    }

    pub fn evaluate(&self) -> EpochStats {
        let mut num_gt: HashMap<TripletCategory, usize> = HashMap::new();
        let mut detections: HashMap<TripletCategory, Vec<(f32, bool)>> = HashMap::new();
        for result in self.images.values() {
            for category in &result.gts {
                *num_gt.entry(*category).or_insert(0) += 1;
            }
            for (category, score, is_tp) in &result.detections {
                detections.entry(*category).or_default().push((*score, *is_tp));
            }
        }

        let categories: Vec<(TripletCategory, usize)> = num_gt.into_iter().filter(|(_, n)| *n > 0).collect();
        let results: Vec<(bool, f64, f64)> = categories
            .par_iter()
            .map(|(category, n)| {
                let dets = detections.get(category).cloned().unwrap_or_default();
                let (ap, max_recall) = Self::category_ap(dets, *n);
                (self.is_rare(category), ap, max_recall)
            })
            .collect();

        let mean = |values: Vec<f64>| if values.is_empty() { 0.0 } else { values.iter().sum::<f64>() / values.len() as f64 };
        let all = mean(results.iter().map(|r| r.1).collect());
        let rare = mean(results.iter().filter(|r| r.0).map(|r| r.1).collect());
        let non_rare = mean(results.iter().filter(|r| !r.0).map(|r| r.1).collect());
        let max_recall = mean(results.iter().map(|r| r.2).collect());

        EpochStats::new()
            .with("mAP", all)
            .with("mAP rare", rare)
            .with("mAP non-rare", non_rare)
            .with("mean max recall", max_recall)
    }
}
