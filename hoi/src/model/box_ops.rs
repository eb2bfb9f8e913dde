use burn::tensor::{backend::Backend, Tensor};
use derive_new::new;

const EPS: f32 = 1e-7;

/// Axis-aligned box in corner form.
#[derive(Debug, Clone, Copy, PartialEq, new)]
pub struct BoxXyxy {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoxXyxy {
    pub fn from_cxcywh([cx, cy, w, h]: [f32; 4]) -> Self {
        Self::new(cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h)
    }

    pub fn to_cxcywh(&self) -> [f32; 4] {
        [(self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0, self.x1 - self.x0, self.y1 - self.y0]
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x0, self.y0, self.x1, self.y1]
    }

    pub fn scale(&self, width: f32, height: f32) -> Self {
        Self::new(self.x0 * width, self.y0 * height, self.x1 * width, self.y1 * height)
    }

    pub fn area(&self) -> f32 {
        (self.x1 - self.x0).max(0.0) * (self.y1 - self.y0).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.x1 <= self.x0 || self.y1 <= self.y0
    }

    fn intersection(&self, other: &Self) -> f32 {
        let w = (self.x1.min(other.x1) - self.x0.max(other.x0)).max(0.0);
        let h = (self.y1.min(other.y1) - self.y0.max(other.y0)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &Self) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    pub fn generalized_iou(&self, other: &Self) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        let hull = BoxXyxy::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
        .area();
        inter / (union + EPS) - (hull - union) / (hull + EPS)
    }
}

fn columns<B: Backend>(boxes: Tensor<B, 2>) -> [Tensor<B, 2>; 4] {
    [0, 1, 2, 3].map(|col| boxes.clone().narrow(1, col, 1))
}

/// `[M, 4]` cxcywh to xyxy.
pub fn box_cxcywh_to_xyxy<B: Backend>(boxes: Tensor<B, 2>) -> Tensor<B, 2> {
    let [cx, cy, w, h] = columns(boxes);
    let half_w = w.mul_scalar(0.5);
    let half_h = h.mul_scalar(0.5);
    Tensor::cat(
        vec![cx.clone() - half_w.clone(), cy.clone() - half_h.clone(), cx + half_w, cy + half_h],
        1,
    )
}

/// Row-wise GIoU between two `[M, 4]` cxcywh box sets, shape `[M]`.
pub fn paired_generalized_iou<B: Backend>(boxes1: Tensor<B, 2>, boxes2: Tensor<B, 2>) -> Tensor<B, 1> {
    let [ax0, ay0, ax1, ay1] = columns(box_cxcywh_to_xyxy(boxes1));
    let [bx0, by0, bx1, by1] = columns(box_cxcywh_to_xyxy(boxes2));

    let area_a = (ax1.clone() - ax0.clone()) * (ay1.clone() - ay0.clone());
    let area_b = (bx1.clone() - bx0.clone()) * (by1.clone() - by0.clone());

    let inter_w = (ax1.clone().min_pair(bx1.clone()) - ax0.clone().max_pair(bx0.clone())).clamp_min(0.0);
    let inter_h = (ay1.clone().min_pair(by1.clone()) - ay0.clone().max_pair(by0.clone())).clamp_min(0.0);
    let inter = inter_w * inter_h;
    let union = area_a + area_b - inter.clone();

    let hull_w = ax1.max_pair(bx1) - ax0.min_pair(bx0);
    let hull_h = ay1.max_pair(by1) - ay0.min_pair(by0);
    let hull = hull_w * hull_h;

    let iou = inter / union.clone().add_scalar(EPS);
    let giou = iou - (hull.clone() - union) / hull.add_scalar(EPS);
    giou.squeeze_dim::<1>(1)
}
