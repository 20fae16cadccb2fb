use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::detector::{confident, BoundingBox, ObjectDetector};
use crate::error::{EditError, EditResult};

/// 色调分箱数（OpenCV 色调范围 0-180）
pub const HUE_BINS: usize = 30;
/// 饱和度分箱数（范围 0-256）
pub const SATURATION_BINS: usize = 32;
/// 相似度超过该值视为同一目标
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;
/// 选择区域的最小边长（像素）
pub const MIN_SELECTION_SIZE: u32 = 20;
/// 无法识别类别时使用的标签
pub const UNKNOWN_LABEL: &str = "unknown";

/// 色调-饱和度二维直方图，归一化到 [0, 1]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    bins: Vec<f32>,
}

impl Histogram {
    pub fn bins(&self) -> &[f32] {
        &self.bins
    }
}

/// 用户选定的跟踪目标特征
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSubjectSignature {
    /// 目标类别（无法识别时为 "unknown"）
    pub class_label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    pub histogram: Histogram,
}

impl TargetSubjectSignature {
    pub fn is_unknown(&self) -> bool {
        self.class_label == UNKNOWN_LABEL
    }

    /// 检测记录的类别是否可能是该目标
    pub fn matches_label(&self, label: &str) -> bool {
        self.is_unknown() || self.class_label == label
    }
}

/// RGB 转 HSV，返回 OpenCV 8 位约定：H ∈ [0,180)，S ∈ [0,255]
fn rgb_to_hs(r: u8, g: u8, b: u8) -> (f64, f64) {
    let r = r as f64 / 255.0;
    let g = g as f64 / 255.0;
    let b = b as f64 / 255.0;

    let max = r.max(g.max(b));
    let min = r.min(g.min(b));
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max == 0.0 { 0.0 } else { delta / max };

    ((h / 2.0).min(179.999), (s * 255.0).round())
}

/// 提取区域的外观特征（色调-饱和度直方图）
pub fn extract_signature(region: &RgbImage) -> Histogram {
    let mut bins = vec![0f32; HUE_BINS * SATURATION_BINS];

    for pixel in region.pixels() {
        let (h, s) = rgb_to_hs(pixel[0], pixel[1], pixel[2]);
        let h_bin = ((h / 180.0 * HUE_BINS as f64) as usize).min(HUE_BINS - 1);
        let s_bin = ((s / 256.0 * SATURATION_BINS as f64) as usize).min(SATURATION_BINS - 1);
        bins[h_bin * SATURATION_BINS + s_bin] += 1.0;
    }

    // 最小-最大归一化
    let max = bins.iter().cloned().fold(f32::MIN, f32::max);
    let min = bins.iter().cloned().fold(f32::MAX, f32::min);
    let range = max - min;
    if range > 0.0 {
        for v in bins.iter_mut() {
            *v = (*v - min) / range;
        }
    } else {
        bins.iter_mut().for_each(|v| *v = 0.0);
    }

    Histogram { bins }
}

/// 计算两个特征的相似度（相关系数，负相关截断为 0）
///
/// 任一特征缺失时相似度为 0。两者方差都为 0 时按完全相关处理。
pub fn similarity(a: Option<&Histogram>, b: Option<&Histogram>) -> f64 {
    let (a, b) = match (a, b) {
        (Some(a), Some(b)) => (a, b),
        _ => return 0.0,
    };
    if a.bins.len() != b.bins.len() || a.bins.is_empty() {
        return 0.0;
    }

    let n = a.bins.len() as f64;
    let mean_a = a.bins.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_b = b.bins.iter().map(|&v| v as f64).sum::<f64>() / n;

    let mut num = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.bins.iter().zip(&b.bins) {
        let dx = x as f64 - mean_a;
        let dy = y as f64 - mean_b;
        num += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denom = var_a * var_b;
    let correlation = if denom.abs() > f64::EPSILON {
        num / denom.sqrt()
    } else {
        1.0
    };

    correlation.max(0.0)
}

/// 裁剪画面中的区域，区域为空时返回 None
pub fn crop_region(frame: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.clamp_to(frame.width(), frame.height())?;
    Some(image::imageops::crop_imm(frame, x, y, w, h).to_image())
}

/// 根据用户在某一帧上框选的区域建立跟踪目标
///
/// 在区域内运行检测，取面积最大的可信检测作为目标类别；
/// 没有检测结果时类别为 "unknown"，只依靠颜色特征。
pub fn select_target_subject(
    frame: &RgbImage,
    selection: &BoundingBox,
    detector: &mut dyn ObjectDetector,
    confidence_threshold: f64,
) -> EditResult<TargetSubjectSignature> {
    let (x, y, w, h) = selection
        .clamp_to(frame.width(), frame.height())
        .ok_or_else(|| EditError::InvalidSelection("选择区域在画面之外".to_string()))?;

    if w < MIN_SELECTION_SIZE || h < MIN_SELECTION_SIZE {
        return Err(EditError::InvalidSelection(format!(
            "选择区域太小: {}x{}（至少 {}x{}）",
            w, h, MIN_SELECTION_SIZE, MIN_SELECTION_SIZE
        )));
    }

    let region = image::imageops::crop_imm(frame, x, y, w, h).to_image();
    let histogram = extract_signature(&region);

    let records = confident(detector.detect(&region)?, confidence_threshold);
    let best = records.into_iter().fold(None, |best: Option<crate::detector::DetectionRecord>, r| match best {
        Some(b) if b.bbox.area() >= r.bbox.area() => Some(b),
        _ => Some(r),
    });

    Ok(match best {
        Some(record) => TargetSubjectSignature {
            class_label: record.label,
            confidence: record.confidence,
            bbox: record.bbox,
            histogram,
        },
        None => TargetSubjectSignature {
            class_label: UNKNOWN_LABEL.to_string(),
            confidence: 1.0,
            bbox: BoundingBox::new(0.0, 0.0, w as f64, h as f64),
            histogram,
        },
    })
}
