use crate::common::*;

const EPSILON: f64 = 1e-8;

/// The choice of IoU metric for the box IoU loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IouKind {
    Iou,
    Giou,
    Diou,
}

impl FromStr for IouKind {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        let kind = match text {
            "iou" => Self::Iou,
            "giou" => Self::Giou,
            "diou" => Self::Diou,
            _ => bail!("unknown iou_loss_type '{}'", text),
        };
        Ok(kind)
    }
}

/// IoU-based box loss.
#[derive(Debug, Clone)]
pub struct BoxIouLoss {
    kind: IouKind,
}

impl BoxIouLoss {
    pub fn new(kind: IouKind) -> Self {
        Self { kind }
    }

    /// Sum of per-box `1 - IoU` losses normalized by `num_positives * 4`.
    ///
    /// Boxes whose target is all zero are masked out, consistent with the
    /// Huber box loss.
    pub fn forward(&self, box_outputs: &Tensor, box_targets: &Tensor, num_positives: f64) -> Tensor {
        let normalizer = num_positives * 4.0;
        let pred = box_outputs.view([-1, 4]);
        let target = box_targets.view([-1, 4]);

        let loss = iou_loss(&pred, &target, self.kind);
        let mask = target.ne(0.0).any_dim(1, false).to_kind(Kind::Float);
        (loss * mask).sum(Kind::Float) / normalizer
    }
}

/// Elementwise `1 - IoU` variants over `[n, 4]` boxes in TLBR order.
pub fn iou_loss(pred: &Tensor, target: &Tensor, kind: IouKind) -> Tensor {
    // unpack box sides
    let pred_t = pred.i((.., 0));
    let pred_l = pred.i((.., 1));
    let pred_b = pred.i((.., 2));
    let pred_r = pred.i((.., 3));
    let pred_h = (&pred_b - &pred_t).clamp_min(0.0);
    let pred_w = (&pred_r - &pred_l).clamp_min(0.0);
    let pred_area = &pred_h * &pred_w;

    let target_t = target.i((.., 0));
    let target_l = target.i((.., 1));
    let target_b = target.i((.., 2));
    let target_r = target.i((.., 3));
    let target_h = (&target_b - &target_t).clamp_min(0.0);
    let target_w = (&target_r - &target_l).clamp_min(0.0);
    let target_area = &target_h * &target_w;

    // intersection area
    let intersect_t = pred_t.maximum(&target_t);
    let intersect_l = pred_l.maximum(&target_l);
    let intersect_b = pred_b.minimum(&target_b);
    let intersect_r = pred_r.minimum(&target_r);
    let intersect_h = (&intersect_b - &intersect_t).clamp_min(0.0);
    let intersect_w = (&intersect_r - &intersect_l).clamp_min(0.0);
    let intersect_area = &intersect_h * &intersect_w;

    let union_area = &pred_area + &target_area - &intersect_area;
    let iou = &intersect_area / (&union_area + EPSILON);

    match kind {
        IouKind::Iou => 1.0 - iou,
        IouKind::Giou => {
            let closure_t = pred_t.minimum(&target_t);
            let closure_l = pred_l.minimum(&target_l);
            let closure_b = pred_b.maximum(&target_b);
            let closure_r = pred_r.maximum(&target_r);
            let closure_h = &closure_b - &closure_t;
            let closure_w = &closure_r - &closure_l;
            let closure_area = &closure_h * &closure_w + EPSILON;
            let giou = &iou - (&closure_area - &union_area) / &closure_area;
            1.0 - giou
        }
        IouKind::Diou => {
            let pred_cy = (&pred_t + &pred_b) / 2.0;
            let pred_cx = (&pred_l + &pred_r) / 2.0;
            let target_cy = (&target_t + &target_b) / 2.0;
            let target_cx = (&target_l + &target_r) / 2.0;

            let closure_h = pred_b.maximum(&target_b) - pred_t.minimum(&target_t);
            let closure_w = pred_r.maximum(&target_r) - pred_l.minimum(&target_l);

            let center_distance =
                (&pred_cy - &target_cy) * (&pred_cy - &target_cy)
                    + (&pred_cx - &target_cx) * (&pred_cx - &target_cx);
            let diagonal = &closure_h * &closure_h + &closure_w * &closure_w + EPSILON;

            let diou = &iou - center_distance / diagonal;
            1.0 - diou
        }
    }
}
