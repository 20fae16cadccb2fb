use anyhow::Result;
use image::GrayImage;
use std::time::Instant;
use tracing::{debug, info};

use crate::detector::{confident, ObjectDetector, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::jobs::ProgressSink;
use crate::metadata::{StyleProfile, SubjectTable, TransitionCounts};
use crate::scene_detector::{change_intensity, to_gray, SceneDetector};
use crate::video_processor::FrameSource;

/// 参考视频分析参数
#[derive(Debug, Clone)]
pub struct ReferenceParams {
    /// 场景变化阈值（像素变化百分比）
    pub threshold: f64,
    /// 最小场景时长（秒）
    pub min_scene_seconds: f64,
    /// 每隔多少帧进行一次物体检测
    pub detection_interval: u64,
    pub confidence_threshold: f64,
    pub use_object_detection: bool,
    /// 重要主体数量
    pub important_count: usize,
}

impl Default for ReferenceParams {
    fn default() -> Self {
        Self {
            threshold: 35.0,
            min_scene_seconds: 0.5,
            detection_interval: 5,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            use_object_detection: true,
            important_count: 5,
        }
    }
}

/// 分析参考视频的剪辑风格（单次顺序遍历）
pub fn analyze_reference(
    source_name: &str,
    source: &mut dyn FrameSource,
    detector: &mut dyn ObjectDetector,
    params: &ReferenceParams,
    progress: &dyn ProgressSink,
) -> Result<StyleProfile> {
    let start = Instant::now();
    let info = source.info().clone();
    let fps = info.fps;
    let interval = params.detection_interval.max(1);

    let mut scenes = SceneDetector::with_fps(params.threshold, params.min_scene_seconds, fps);
    let mut subjects = SubjectTable::new();
    let mut prev_gray: Option<GrayImage> = None;
    let mut frame_idx: u64 = 0;

    while let Some(frame) = source.next_frame()? {
        let timestamp = frame_idx as f64 / fps;

        if params.use_object_detection && frame_idx % interval == 0 {
            for record in confident(detector.detect(&frame)?, params.confidence_threshold) {
                subjects.record(&record.label, timestamp);
            }
        }

        let gray = to_gray(&frame);
        if let Some(prev) = &prev_gray {
            let change = change_intensity(prev, &gray);
            if scenes.observe(frame_idx, change) {
                debug!("[参考分析] 剪辑点: 第 {} 帧 ({:.2}秒)，变化 {:.1}%", frame_idx, timestamp, change);
            }
        }
        prev_gray = Some(gray);
        frame_idx += 1;

        if frame_idx % 50 == 0 && info.frame_count > 0 {
            let percent = frame_idx as f64 * 100.0 / info.frame_count as f64;
            progress.report(percent.min(99.0), &format!("分析进度: {:.1}%", percent));
        }
    }

    let profile = build_profile(
        source_name,
        fps,
        frame_idx,
        scenes.into_cut_points(),
        subjects,
        params.important_count,
    );

    info!(
        "✅ [参考分析] 完成，耗时: {:.2}秒，{} 帧，{} 个剪辑点，平均片段 {:.2}秒，密度 {:.2} 次/分钟",
        start.elapsed().as_secs_f64(),
        profile.frame_count,
        profile.cut_points.len(),
        profile.avg_segment_duration,
        profile.cutting_density
    );
    if !profile.important_subjects.is_empty() {
        info!("  • 重要主体: {}", profile.important_subjects.join(", "));
    }

    Ok(profile)
}

/// 根据剪辑点与主体统计计算风格指标
///
/// 片段边界为 [0, c1, ..., cn, F]；没有剪辑点时片段列表为空，平均时长取全片时长。
pub fn build_profile(
    source_name: &str,
    fps: f64,
    frame_count: u64,
    cut_points: Vec<u64>,
    subjects: SubjectTable,
    important_count: usize,
) -> StyleProfile {
    let to_secs = |frame: u64| if fps > 0.0 { frame as f64 / fps } else { 0.0 };
    let total_duration = to_secs(frame_count);

    let mut boundaries = Vec::with_capacity(cut_points.len() + 2);
    let mut segment_durations = Vec::new();
    if !cut_points.is_empty() {
        boundaries.push(0);
        boundaries.extend(cut_points.iter().copied());
        boundaries.push(frame_count.max(cut_points[cut_points.len() - 1]));
        segment_durations = boundaries.windows(2).map(|w| to_secs(w[1]) - to_secs(w[0])).collect();
    }

    let avg_segment_duration = if segment_durations.is_empty() {
        total_duration
    } else {
        segment_durations.iter().sum::<f64>() / segment_durations.len() as f64
    };

    let cutting_density = if total_duration > 0.0 {
        cut_points.len() as f64 / (total_duration / 60.0)
    } else {
        0.0
    };

    // 相邻片段的主体两两组合
    let mut subject_transitions = TransitionCounts::new();
    let segment_subjects: Vec<Vec<String>> = boundaries
        .windows(2)
        .map(|w| subjects.labels_within(to_secs(w[0]), to_secs(w[1])))
        .collect();
    for pair in segment_subjects.windows(2) {
        for from in &pair[0] {
            for to in &pair[1] {
                *subject_transitions.entry((from.clone(), to.clone())).or_insert(0) += 1;
            }
        }
    }

    StyleProfile {
        source: source_name.to_string(),
        fps,
        frame_count,
        total_duration,
        cut_points,
        segment_durations,
        avg_segment_duration,
        cutting_density,
        important_subjects: subjects.top_labels(important_count),
        subject_durations: subjects.reoccurrence_intervals(),
        subject_transitions,
        subjects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::testing::{record, ScriptedDetector};
    use crate::detector::NullDetector;
    use crate::jobs::NoProgress;
    use crate::video_processor::MemorySource;
    use image::{ImageBuffer, Rgb, RgbImage};

    fn flat(value: u8) -> RgbImage {
        ImageBuffer::from_fn(8, 8, |_, _| Rgb([value, value, value]))
    }

    /// 60 秒 30fps，在 10 秒和 40 秒处整帧突变
    fn sixty_second_reference() -> MemorySource {
        let frames = (0..1800)
            .map(|i| if (300..1200).contains(&i) { flat(230) } else { flat(20) })
            .collect();
        MemorySource::new(30.0, frames)
    }

    #[test]
    fn test_two_abrupt_changes() {
        let mut source = sixty_second_reference();
        let params = ReferenceParams {
            use_object_detection: false,
            ..Default::default()
        };
        let profile = analyze_reference("ref.mp4", &mut source, &mut NullDetector, &params, &NoProgress).unwrap();

        assert_eq!(profile.cut_points, vec![300, 1200]);
        assert_eq!(profile.frame_count, 1800);
        assert!((profile.total_duration - 60.0).abs() < 1e-9);
        assert_eq!(profile.segment_durations.len(), 3);
        assert!((profile.avg_segment_duration - 20.0).abs() < 1e-9);
        assert!((profile.cutting_density - 2.0).abs() < 1e-9);
        assert!(profile.important_subjects.is_empty());
    }

    #[test]
    fn test_subject_statistics_and_transitions() {
        let mut source = sixty_second_reference();
        let mut detector = ScriptedDetector::default();
        // 每 5 帧检测一次：第 k 次调用对应第 5k 帧
        detector.script.insert(0, vec![record("person", 0.9, [0.0, 0.0, 4.0, 4.0])]);
        detector.script.insert(100, vec![record("person", 0.8, [0.0, 0.0, 4.0, 4.0])]);
        detector.script.insert(250, vec![
            record("dog", 0.7, [0.0, 0.0, 2.0, 2.0]),
            record("cat", 0.4, [0.0, 0.0, 2.0, 2.0]),
        ]);
        detector.script.insert(300, vec![record("person", 0.9, [0.0, 0.0, 4.0, 4.0])]);

        let profile = analyze_reference(
            "ref.mp4",
            &mut source,
            &mut detector,
            &ReferenceParams::default(),
            &NoProgress,
        )
        .unwrap();

        assert_eq!(detector.calls, 360);
        assert_eq!(profile.important_subjects, vec!["person", "dog"]);
        assert!(profile.subjects.get("cat").is_none());
        assert!((profile.subject_durations["person"] - 25.0).abs() < 1e-9);
        assert!(!profile.subject_durations.contains_key("dog"));

        let key = |a: &str, b: &str| (a.to_string(), b.to_string());
        assert_eq!(profile.subject_transitions.get(&key("person", "person")), Some(&2));
        assert_eq!(profile.subject_transitions.get(&key("person", "dog")), Some(&1));
        assert_eq!(profile.subject_transitions.len(), 2);
    }

    #[test]
    fn test_no_cuts_defaults() {
        let profile = build_profile("still.mp4", 25.0, 250, Vec::new(), SubjectTable::new(), 5);
        assert!(profile.segment_durations.is_empty());
        assert_eq!(profile.avg_segment_duration, 10.0);
        assert_eq!(profile.cutting_density, 0.0);
        assert!(profile.subject_transitions.is_empty());
    }

    #[test]
    fn test_empty_video() {
        let mut source = MemorySource::new(30.0, Vec::new());
        let profile = analyze_reference(
            "empty.mp4",
            &mut source,
            &mut NullDetector,
            &ReferenceParams::default(),
            &NoProgress,
        )
        .unwrap();
        assert_eq!(profile.total_duration, 0.0);
        assert_eq!(profile.cutting_density, 0.0);
        assert_eq!(profile.avg_segment_duration, 0.0);
    }

    #[test]
    fn test_cut_points_respect_min_scene_length() {
        // 每 4 帧交替一次，最小场景 15 帧
        let frames = (0..120).map(|i| if (i / 4) % 2 == 0 { flat(0) } else { flat(255) }).collect();
        let mut source = MemorySource::new(30.0, frames);
        let params = ReferenceParams {
            use_object_detection: false,
            ..Default::default()
        };
        let profile = analyze_reference("flicker.mp4", &mut source, &mut NullDetector, &params, &NoProgress).unwrap();
        assert!(!profile.cut_points.is_empty());
        for pair in profile.cut_points.windows(2) {
            assert!(pair[1] - pair[0] > 15);
        }
    }
}
