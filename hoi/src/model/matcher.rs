use super::{box_ops::BoxXyxy, PredictionArrays};
use crate::{config::{BoxMatcher, HoiConfig}, data::HoiTarget};

/// Stand-in for non-finite costs so the solver always terminates.
const COST_CEILING: f64 = 1e9;

/// Minimum-cost assignment on a dense `rows x cols` matrix (Jonker-Volgenant style
/// shortest augmenting paths with potentials). Returns `(row, col)` pairs sorted by row;
/// `min(rows, cols)` pairs are produced.
pub fn linear_sum_assignment(cost: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let rows = cost.len();
    let cols = cost.first().map_or(0, Vec::len);
    if rows == 0 || cols == 0 {
        return Vec::new();
    }
    if rows > cols {
        let transposed: Vec<Vec<f64>> = (0..cols).map(|c| (0..rows).map(|r| cost[r][c]).collect()).collect();
        let mut pairs: Vec<(usize, usize)> = linear_sum_assignment(&transposed).into_iter().map(|(c, r)| (r, c)).collect();
        pairs.sort_unstable();
        return pairs;
    }

    let at = |r: usize, c: usize| {
        let value = cost[r][c];
        if value.is_finite() { value } else { COST_CEILING }
    };

    let (n, m) = (rows, cols);
    let mut u = vec![0.0; n + 1];
    let mut v = vec![0.0; m + 1];
    // p[j]: row (1-based) assigned to column j, 0 when free
    let mut p = vec![0usize; m + 1];
    let mut way = vec![0usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0;
        let mut minv = vec![f64::INFINITY; m + 1];
        let mut used = vec![false; m + 1];
        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = f64::INFINITY;
            let mut j1 = 0;
            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let cur = at(i0 - 1, j - 1) - u[i0] - v[j];
                if cur < minv[j] {
                    minv[j] = cur;
                    way[j] = j0;
                }
                if minv[j] < delta {
                    delta = minv[j];
                    j1 = j;
                }
            }
            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    minv[j] -= delta;
                }
            }
            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m).filter(|&j| p[j] != 0).map(|j| (p[j] - 1, j - 1)).collect();
    pairs.sort_unstable();
    pairs
}

/// One-to-one assignment between queries and subject-object pairs.
#[derive(Debug, Clone)]
pub struct HungarianMatcherHoi {
    pub cost_obj_class: f64,
    pub cost_verb_class: f64,
    pub cost_bbox: f64,
    pub cost_giou: f64,
    pub cost_matching: f64,
    pub box_matcher: BoxMatcher,
    pub use_matching: bool,
}

impl HungarianMatcherHoi {
    pub fn from_config(config: &HoiConfig) -> Self {
        Self {
            cost_obj_class: config.set_cost_obj_class,
            cost_verb_class: config.set_cost_verb_class,
            cost_bbox: config.set_cost_bbox,
            cost_giou: config.set_cost_giou,
            cost_matching: config.set_cost_matching,
            box_matcher: config.box_matcher,
            use_matching: config.use_matching,
        }
    }

    fn combine(&self, sub: f64, obj: f64) -> f64 {
        match self.box_matcher {
            BoxMatcher::SplitMax => sub.max(obj),
            BoxMatcher::SplitSum => sub + obj,
        }
    }

    /// Per image, the matched `(query, target pair)` indices.
    pub fn forward(&self, preds: &PredictionArrays, targets: &[HoiTarget]) -> Vec<Vec<(usize, usize)>> {
        targets
            .iter()
            .enumerate()
            .map(|(image, target)| {
                let cost: Vec<Vec<f64>> = (0..preds.queries)
                    .map(|query| (0..target.num_pairs()).map(|pair| self.pair_cost(preds, image, query, target, pair)).collect())
                    .collect();
                linear_sum_assignment(&cost)
            })
            .collect()
    }

    fn pair_cost(&self, preds: &PredictionArrays, image: usize, query: usize, target: &HoiTarget, pair: usize) -> f64 {
        let obj_prob = preds.obj_prob(image, query);
        let cost_obj_class = -(obj_prob[target.obj_labels[pair]] as f64);

        let verb_prob = preds.verb_prob(image, query);
        let gt = &target.verb_labels[pair];
        let (mut pos, mut pos_norm, mut neg, mut neg_norm) = (0.0, 0.0, 0.0, 0.0);
        for (p, g) in verb_prob.iter().zip(gt) {
            let (p, g) = (*p as f64, *g as f64);
            pos += p * g;
            pos_norm += g;
            neg += (1.0 - p) * (1.0 - g);
            neg_norm += 1.0 - g;
        }
        let cost_verb_class = -(pos / (pos_norm + 1e-4) + neg / (neg_norm + 1e-4)) / 2.0;

        let l1 = |a: &[f32], b: &[f32; 4]| a.iter().zip(b).map(|(x, y)| (x - y).abs() as f64).sum::<f64>();
        let giou = |a: &[f32], b: &[f32; 4]| {
            -(BoxXyxy::from_cxcywh([a[0], a[1], a[2], a[3]]).generalized_iou(&BoxXyxy::from_cxcywh(*b)) as f64)
        };
        let sub_box = preds.sub_box(image, query);
        let obj_box = preds.obj_box(image, query);

        let cost_sub_bbox = l1(sub_box, &target.sub_boxes[pair]);
        let cost_sub_giou = giou(sub_box, &target.sub_boxes[pair]);
        let (cost_obj_bbox, cost_obj_giou) = if target.has_object_box(pair) {
            (l1(obj_box, &target.obj_boxes[pair]), giou(obj_box, &target.obj_boxes[pair]))
        } else {
            (0.0, cost_sub_giou)
        };

        let mut cost = self.cost_obj_class * cost_obj_class
            + self.cost_verb_class * cost_verb_class
            + self.cost_bbox * self.combine(cost_sub_bbox, cost_obj_bbox)
            + self.cost_giou * self.combine(cost_sub_giou, cost_obj_giou);
        if self.use_matching {
            if let Some(matching) = preds.matching_prob(image, query) {
                cost -= self.cost_matching * matching[1] as f64;
            }
        }
        cost
    }
}
