use image::{GrayImage, RgbImage};

/// 像素差异二值化阈值（0-255）
pub const PIXEL_DIFF_THRESHOLD: u8 = 25;

/// 将 RGB 帧转换为灰度图
pub fn to_gray(frame: &RgbImage) -> GrayImage {
    image::imageops::grayscale(frame)
}

/// 计算两帧之间的变化强度
/// 返回 0.0-100.0 之间的值，表示差异超过阈值的像素百分比
///
/// 尺寸不同的两帧视为完全不同
pub fn change_intensity(prev: &GrayImage, curr: &GrayImage) -> f64 {
    if prev.dimensions() != curr.dimensions() {
        return 100.0;
    }

    let total_pixels = prev.as_raw().len();
    if total_pixels == 0 {
        return 0.0;
    }

    let changed = prev
        .as_raw()
        .iter()
        .zip(curr.as_raw())
        .filter(|(p1, p2)| p1.abs_diff(**p2) > PIXEL_DIFF_THRESHOLD)
        .count();

    changed as f64 * 100.0 / total_pixels as f64
}

/// 场景检测器，用于检测视频中的镜头切换点
///
/// 同时要求变化幅度超过阈值、且距上一个剪辑点足够远；
/// 距离不够时丢弃该变化，不重置计时。
#[derive(Debug, Clone)]
pub struct SceneDetector {
    /// 场景变化阈值（像素变化百分比）
    threshold: f64,
    /// 最小场景长度（帧）
    min_scene_frames: u64,
    /// 已记录的剪辑点（帧索引）
    cut_points: Vec<u64>,
}

impl SceneDetector {
    pub fn new(threshold: f64, min_scene_frames: u64) -> Self {
        Self {
            threshold,
            min_scene_frames,
            cut_points: Vec::new(),
        }
    }

    /// 根据帧率和最小场景时长（秒）创建
    pub fn with_fps(threshold: f64, min_scene_seconds: f64, fps: f64) -> Self {
        Self::new(threshold, (fps * min_scene_seconds).floor().max(0.0) as u64)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// 输入一帧的变化强度，若记录为新的剪辑点则返回 true
    pub fn observe(&mut self, frame_idx: u64, change: f64) -> bool {
        if change <= self.threshold {
            return false;
        }

        let spaced = match self.cut_points.last() {
            Some(&last) => frame_idx.saturating_sub(last) > self.min_scene_frames,
            None => true,
        };

        if spaced {
            self.cut_points.push(frame_idx);
        }
        spaced
    }

    pub fn cut_points(&self) -> &[u64] {
        &self.cut_points
    }

    pub fn into_cut_points(self) -> Vec<u64> {
        self.cut_points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn flat(value: u8) -> GrayImage {
        ImageBuffer::from_fn(40, 30, |_, _| Luma([value]))
    }

    #[test]
    fn test_identical_frames_have_no_change() {
        let img = ImageBuffer::from_fn(40, 30, |x, y| Luma([((x * 7 + y * 3) % 256) as u8]));
        assert_eq!(change_intensity(&img, &img), 0.0);
    }

    #[test]
    fn test_full_frame_change() {
        assert_eq!(change_intensity(&flat(10), &flat(200)), 100.0);
    }

    #[test]
    fn test_small_differences_are_ignored() {
        // 差异 25 不超过阈值
        assert_eq!(change_intensity(&flat(100), &flat(125)), 0.0);
        assert_eq!(change_intensity(&flat(100), &flat(126)), 100.0);
    }

    #[test]
    fn test_change_grows_with_altered_pixels() {
        let base = flat(50);
        let mut last = 0.0;
        for rows in [0u32, 3, 10, 20, 30] {
            let altered = ImageBuffer::from_fn(40, 30, |_, y| Luma([if y < rows { 220 } else { 50 }]));
            let change = change_intensity(&base, &altered);
            assert!(change >= last, "{} < {}", change, last);
            last = change;
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_mismatched_sizes_count_as_cut() {
        let small: GrayImage = ImageBuffer::from_fn(10, 10, |_, _| Luma([0u8]));
        assert_eq!(change_intensity(&small, &flat(0)), 100.0);
    }

    #[test]
    fn test_detector_debounces_close_changes() {
        // 30 fps，最小场景 0.5 秒 = 15 帧
        let mut detector = SceneDetector::with_fps(35.0, 0.5, 30.0);
        assert!(detector.observe(10, 80.0));
        assert!(!detector.observe(20, 90.0));
        assert!(!detector.observe(25, 90.0));
        assert!(detector.observe(26, 90.0));
        assert!(!detector.observe(100, 35.0));
        assert_eq!(detector.cut_points(), &[10, 26]);
    }
}
