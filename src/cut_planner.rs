use anyhow::Result;
use image::GrayImage;
use std::collections::{BTreeSet, HashSet};
use std::time::Instant;
use tracing::{debug, info};

use crate::detector::{confident, ObjectDetector, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::jobs::ProgressSink;
use crate::metadata::{CutPlan, Occurrence, SceneRecord, StyleProfile, SubjectTable};
use crate::scene_detector::{change_intensity, to_gray};
use crate::subject_matcher::{crop_region, extract_signature, similarity, TargetSubjectSignature, DEFAULT_SIMILARITY_THRESHOLD};
use crate::subject_tracker::{SubjectTracker, TrackEvent};
use crate::video_processor::FrameSource;

/// 目标视频规划参数
#[derive(Debug, Clone)]
pub struct PlannerParams {
    pub threshold: f64,
    /// 场景最短时长（秒）
    pub min_scene_seconds: f64,
    pub detection_interval: u64,
    pub confidence_threshold: f64,
    pub similarity_threshold: f64,
    /// 片段超过理想时长的该倍数时细分
    pub subdivide_ratio: f64,
    /// 候选剪辑点最小间隔（秒）
    pub min_cut_interval: f64,
    /// 物体优先级（0-1），只记录不参与计算
    pub object_priority: f64,
    /// 剪辑密度系数
    pub density_factor: f64,
}

impl Default for PlannerParams {
    fn default() -> Self {
        Self {
            threshold: 35.0,
            min_scene_seconds: 0.5,
            detection_interval: 10,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            subdivide_ratio: 1.5,
            min_cut_interval: 1.0,
            object_priority: 0.7,
            density_factor: 1.0,
        }
    }
}

/// 场景变化点（帧索引, 变化强度）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneChange {
    pub frame: u64,
    pub score: f64,
}

/// 将参考风格应用到目标视频，生成剪辑点
#[allow(clippy::too_many_arguments)]
pub fn plan_target(
    source_name: &str,
    source: &mut dyn FrameSource,
    detector: &mut dyn ObjectDetector,
    profile: &StyleProfile,
    important: &[String],
    signature: Option<&TargetSubjectSignature>,
    params: &PlannerParams,
    progress: &dyn ProgressSink,
) -> Result<CutPlan> {
    let start = Instant::now();
    let info = source.info().clone();
    let fps = info.fps;
    let interval = params.detection_interval.max(1);
    let important: HashSet<&str> = important.iter().map(String::as_str).collect();

    info!(
        "🎯 [目标规划] 开始，重要主体: {}，物体优先级: {:.2}，密度系数: {:.2}{}",
        important.len(),
        params.object_priority,
        params.density_factor,
        signature.map(|s| format!("，跟踪目标: {}", s.class_label)).unwrap_or_default()
    );

    let mut subjects = SubjectTable::new();
    let mut scene_changes: Vec<SceneChange> = Vec::new();
    let mut scenes: Vec<SceneRecord> = Vec::new();
    let mut scene_start: u64 = 0;
    let mut scene_subjects: BTreeSet<String> = BTreeSet::new();
    let mut tracker = SubjectTracker::new();
    let mut tracked_ids: BTreeSet<i64> = BTreeSet::new();
    let mut prev_gray: Option<GrayImage> = None;
    let mut frame_idx: u64 = 0;

    while let Some(frame) = source.next_frame()? {
        if frame_idx % interval == 0 {
            let timestamp = frame_idx as f64 / fps;
            let raw = match signature {
                Some(_) => detector.detect_with_tracking(&frame)?,
                None => detector.detect(&frame)?,
            };
            let records = confident(raw, params.confidence_threshold);

            let mut seen = false;
            for record in &records {
                subjects.record(&record.label, timestamp);
                if important.contains(record.label.as_str()) {
                    scene_subjects.insert(record.label.clone());
                }

                let Some(sig) = signature else { continue };
                if !sig.matches_label(&record.label) {
                    continue;
                }
                let Some(region) = crop_region(&frame, &record.bbox) else { continue };
                let score = similarity(Some(&sig.histogram), Some(&extract_signature(&region)));
                if score > params.similarity_threshold {
                    seen = true;
                    if let Some(id) = record.track_id {
                        tracked_ids.insert(id);
                    }
                }
            }

            if signature.is_some() {
                let event = if seen {
                    TrackEvent::SubjectSeen(frame_idx)
                } else {
                    TrackEvent::SubjectNotSeen(frame_idx)
                };
                if let Some(occ) = tracker.handle(event) {
                    debug!("[目标规划] 跟踪目标出现: 第 {} - {} 帧", occ.start_frame, occ.end_frame);
                }
            }
        }

        let gray = to_gray(&frame);
        if let Some(prev) = &prev_gray {
            let change = change_intensity(prev, &gray);
            if change > params.threshold / 2.0 {
                scene_changes.push(SceneChange {
                    frame: frame_idx,
                    score: change,
                });
                if change > params.threshold && (frame_idx - scene_start) as f64 > fps * params.min_scene_seconds {
                    scenes.push(SceneRecord {
                        start_frame: scene_start,
                        end_frame: frame_idx,
                        subjects: std::mem::take(&mut scene_subjects),
                    });
                    scene_start = frame_idx;
                }
            }
        }
        prev_gray = Some(gray);
        frame_idx += 1;

        if frame_idx % 50 == 0 && info.frame_count > 0 {
            let percent = frame_idx as f64 * 100.0 / info.frame_count as f64;
            progress.report(percent.min(99.0), &format!("分析进度: {:.1}%", percent));
        }
    }

    let frame_count = frame_idx;
    // 结尾场景只在包含重要主体时记录，其结束帧即视频结尾
    if frame_count > scene_start && !scene_subjects.is_empty() {
        scenes.push(SceneRecord {
            start_frame: scene_start,
            end_frame: frame_count,
            subjects: scene_subjects,
        });
    }
    tracker.handle(TrackEvent::EndOfStream(frame_count));
    let occurrences = tracker.into_occurrences();

    progress.report(99.0, "基于物体和场景变化选择剪辑点...");

    // 视频结尾处的剪辑点没有意义
    let mut candidates = collect_candidates(&scenes, &occurrences, &scene_changes, profile, fps, params.subdivide_ratio);
    candidates.retain(|&frame| frame < frame_count);
    let total_duration = if fps > 0.0 { frame_count as f64 / fps } else { 0.0 };
    let target_count = target_cut_count(total_duration, profile.cutting_density, params.density_factor);
    let filtered = debounce(&candidates, fps * params.min_cut_interval);
    let selected = evenly_sample(&filtered, target_count);
    let cuts: Vec<f64> = selected.iter().map(|&f| f as f64 / fps).collect();

    info!(
        "✅ [目标规划] 完成，耗时: {:.2}秒，{} 个场景，{} 个候选点，目标 {} 个，最终 {} 个剪辑点",
        start.elapsed().as_secs_f64(),
        scenes.len(),
        candidates.len(),
        target_count,
        cuts.len()
    );

    Ok(CutPlan {
        source: source_name.to_string(),
        fps,
        frame_count,
        total_duration,
        scenes,
        occurrences,
        tracked_ids,
        candidates,
        target_cut_count: target_count,
        density_factor: params.density_factor,
        object_priority: params.object_priority,
        cuts,
        subjects,
    })
}

/// 生成候选剪辑点（已排序，可能重复）
pub fn collect_candidates(
    scenes: &[SceneRecord],
    occurrences: &[Occurrence],
    scene_changes: &[SceneChange],
    profile: &StyleProfile,
    fps: f64,
    ratio: f64,
) -> Vec<u64> {
    let mut candidates = Vec::new();
    let avg = profile.avg_segment_duration;

    for occ in occurrences {
        candidates.push(occ.start_frame);
        candidates.push(occ.end_frame);
        candidates.extend(subdivide(occ.start_frame, occ.end_frame, avg, fps, ratio, scene_changes));
    }

    for (i, scene) in scenes.iter().enumerate() {
        if scene.subjects.is_empty() {
            if i > 0 {
                candidates.push(scene.end_frame);
            }
            continue;
        }

        let ideal = scene
            .subjects
            .iter()
            .filter_map(|s| profile.subject_durations.get(s))
            .cloned()
            .fold(0.0, f64::max);
        let ideal = if ideal > 0.0 { ideal } else { avg };

        candidates.extend(subdivide(scene.start_frame, scene.end_frame, ideal, fps, ratio, scene_changes));
        candidates.push(scene.end_frame);
    }

    candidates.sort_unstable();
    candidates
}

/// 区间过长时，在内部变化最显著的点处细分
///
/// 需要 floor(时长 / 理想时长) - 1 个内部剪辑点，受限于区间内的变化点数量。
pub fn subdivide(start: u64, end: u64, ideal: f64, fps: f64, ratio: f64, changes: &[SceneChange]) -> Vec<u64> {
    if ideal <= 0.0 || fps <= 0.0 || end <= start {
        return Vec::new();
    }
    let actual = (end - start) as f64 / fps;
    if actual <= ideal * ratio {
        return Vec::new();
    }

    let needed = (actual / ideal).floor() as usize;
    if needed <= 1 {
        return Vec::new();
    }

    let mut inside: Vec<SceneChange> = changes.iter().filter(|c| start < c.frame && c.frame < end).copied().collect();
    inside.sort_by(|a, b| b.score.total_cmp(&a.score));
    inside.into_iter().take(needed - 1).map(|c| c.frame).collect()
}

/// 目标剪辑点数量：max(1, round(分钟数 × 参考密度 × 系数))
pub fn target_cut_count(duration_secs: f64, density: f64, density_factor: f64) -> usize {
    let count = (duration_secs / 60.0 * density * density_factor).round();
    if count.is_finite() && count >= 1.0 {
        count as usize
    } else {
        1
    }
}

/// 贪心去除间隔小于 `min_gap` 帧的候选点
pub fn debounce(sorted: &[u64], min_gap: f64) -> Vec<u64> {
    let mut kept: Vec<u64> = Vec::new();
    for &candidate in sorted {
        let far_enough = match kept.last() {
            Some(&last) => (candidate as f64 - last as f64) >= min_gap,
            None => true,
        };
        if far_enough {
            kept.push(candidate);
        }
    }
    kept
}

/// 等间距抽取 k 个元素，索引为 floor(i × (n − 1) / (k − 1))
pub fn evenly_sample(items: &[u64], k: usize) -> Vec<u64> {
    let n = items.len();
    if n <= k {
        return items.to_vec();
    }
    if k == 0 {
        return Vec::new();
    }
    if k == 1 {
        return vec![items[0]];
    }
    (0..k).map(|i| items[i * (n - 1) / (k - 1)]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::testing::{record, ScriptedDetector};
    use crate::detector::NullDetector;
    use crate::jobs::NoProgress;
    use crate::style_analyzer::build_profile;
    use crate::subject_matcher::{extract_signature, UNKNOWN_LABEL};
    use crate::video_processor::MemorySource;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::collections::BTreeMap;

    fn flat(rgb: [u8; 3]) -> RgbImage {
        ImageBuffer::from_fn(40, 40, move |_, _| Rgb(rgb))
    }

    fn profile(density: f64, avg: f64, durations: &[(&str, f64)]) -> StyleProfile {
        let mut p = build_profile("ref.mp4", 30.0, 1800, Vec::new(), SubjectTable::new(), 5);
        p.cutting_density = density;
        p.avg_segment_duration = avg;
        p.subject_durations = durations.iter().map(|(k, v)| (k.to_string(), *v)).collect::<BTreeMap<_, _>>();
        p
    }

    #[test]
    fn test_target_cut_count() {
        assert_eq!(target_cut_count(30.0, 4.0, 1.0), 2);
        assert_eq!(target_cut_count(30.0, 0.0, 1.0), 1);
        assert_eq!(target_cut_count(90.0, 4.0, 1.5), 9);
        assert_eq!(target_cut_count(0.0, 4.0, 1.0), 1);
    }

    #[test]
    fn test_debounce_keeps_first_and_spaced() {
        assert_eq!(debounce(&[0, 10, 30, 31, 60, 89, 90], 30.0), vec![0, 30, 60, 90]);
        assert!(debounce(&[], 30.0).is_empty());
    }

    #[test]
    fn test_evenly_sample() {
        let items: Vec<u64> = (0..10).map(|i| i * 100).collect();
        assert_eq!(evenly_sample(&items, 3), vec![0, 400, 900]);
        assert_eq!(evenly_sample(&items, 1), vec![0]);
        assert_eq!(evenly_sample(&items, 20), items);
        assert_eq!(evenly_sample(&items, 4), vec![0, 300, 600, 900]);
    }

    #[test]
    fn test_subdivide_picks_strongest_internal_changes() {
        let changes = [
            SceneChange { frame: 50, score: 20.0 },
            SceneChange { frame: 100, score: 60.0 },
            SceneChange { frame: 150, score: 40.0 },
            SceneChange { frame: 300, score: 90.0 },
        ];
        // 10 秒场景，理想 3 秒 → 需要 3 个片段，2 个内部点
        assert_eq!(subdivide(0, 300, 3.0, 30.0, 1.5, &changes), vec![100, 150]);
        // 不足 1.5 倍不细分
        assert!(subdivide(0, 120, 3.0, 30.0, 1.5, &changes).is_empty());
        assert!(subdivide(0, 300, 0.0, 30.0, 1.5, &changes).is_empty());
    }

    #[test]
    fn test_candidates_from_scenes() {
        let scene = |s: u64, e: u64, subjects: &[&str]| SceneRecord {
            start_frame: s,
            end_frame: e,
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
        };
        let scenes = vec![scene(0, 90, &[]), scene(90, 390, &["person"]), scene(390, 450, &[])];
        let changes = [SceneChange { frame: 200, score: 30.0 }, SceneChange { frame: 250, score: 50.0 }];
        let reference = profile(4.0, 2.0, &[("person", 4.0)]);

        // 第一个无主体场景不贡献；person 场景 10 秒，理想 4 秒 → 1 个内部点
        let candidates = collect_candidates(&scenes, &[], &changes, &reference, 30.0, 1.5);
        assert_eq!(candidates, vec![250, 390, 450]);
    }

    #[test]
    fn test_plan_limits_cuts_to_target_count() {
        // 30 秒目标视频，每 3 秒切换一次画面
        let frames = (0..900)
            .map(|i| if (i / 90) % 2 == 0 { flat([10, 10, 10]) } else { flat([240, 240, 240]) })
            .collect();
        let mut source = MemorySource::new(30.0, frames);
        let reference = profile(4.0, 5.0, &[]);

        let plan = plan_target(
            "target.mp4",
            &mut source,
            &mut NullDetector,
            &reference,
            &[],
            None,
            &PlannerParams::default(),
            &NoProgress,
        )
        .unwrap();

        assert_eq!(plan.frame_count, 900);
        // 最后一个场景没有重要主体，不记录
        assert_eq!(plan.scenes.len(), 9);
        assert_eq!(plan.target_cut_count, 2);
        assert_eq!(plan.cuts, vec![6.0, 27.0]);
        assert!(plan.cuts.iter().all(|&c| c < plan.total_duration));
        assert!(plan.candidates.iter().all(|&f| f < plan.frame_count));
        assert!(plan.occurrences.is_empty());
        assert_eq!(plan.object_priority, 0.7);
    }

    #[test]
    fn test_tracking_produces_occurrence_candidates() {
        // 前 3 秒红色，之后蓝色；跟踪目标为红色区域
        let red = [220, 20, 20];
        let blue = [20, 20, 220];
        let frames = (0..300).map(|i| if i < 90 { flat(red) } else { flat(blue) }).collect();
        let mut source = MemorySource::new(30.0, frames);

        let signature = TargetSubjectSignature {
            class_label: UNKNOWN_LABEL.to_string(),
            confidence: 1.0,
            bbox: [0.0, 0.0, 40.0, 40.0].into(),
            histogram: extract_signature(&flat(red)),
        };

        let mut detector = ScriptedDetector::default();
        for call in 0..30 {
            let mut r = record("ball", 0.9, [0.0, 0.0, 40.0, 40.0]);
            r.track_id = Some(3);
            detector.script.insert(call, vec![r]);
        }

        let reference = profile(12.0, 2.0, &[]);
        let plan = plan_target(
            "target.mp4",
            &mut source,
            &mut detector,
            &reference,
            &[],
            Some(&signature),
            &PlannerParams::default(),
            &NoProgress,
        )
        .unwrap();

        assert_eq!(detector.tracking_calls, 30);
        assert_eq!(
            plan.occurrences,
            vec![Occurrence {
                start_frame: 0,
                end_frame: 90
            }]
        );
        assert!(plan.tracked_ids.contains(&3));
        assert!(plan.candidates.contains(&0));
        assert!(plan.candidates.contains(&90));
        assert_eq!(plan.subjects.get("ball").map(|s| s.occurrence_count), Some(30));
    }

    #[test]
    fn test_end_of_stream_occurrence_is_not_a_cut() {
        // 跟踪目标一直出现到视频结尾
        let red = [220, 20, 20];
        let frames = (0..300).map(|_| flat(red)).collect();
        let mut source = MemorySource::new(30.0, frames);

        let signature = TargetSubjectSignature {
            class_label: UNKNOWN_LABEL.to_string(),
            confidence: 1.0,
            bbox: [0.0, 0.0, 40.0, 40.0].into(),
            histogram: extract_signature(&flat(red)),
        };
        let mut detector = ScriptedDetector::default();
        for call in 0..30 {
            detector.script.insert(call, vec![record("ball", 0.9, [0.0, 0.0, 40.0, 40.0])]);
        }

        let reference = profile(12.0, 20.0, &[]);
        let plan = plan_target(
            "target.mp4",
            &mut source,
            &mut detector,
            &reference,
            &[],
            Some(&signature),
            &PlannerParams::default(),
            &NoProgress,
        )
        .unwrap();

        assert_eq!(
            plan.occurrences,
            vec![Occurrence {
                start_frame: 0,
                end_frame: 300
            }]
        );
        assert_eq!(plan.candidates, vec![0]);
        assert_eq!(plan.cuts, vec![0.0]);
    }

    #[test]
    fn test_long_occurrence_is_subdivided_at_strongest_changes() {
        let changes = [
            SceneChange { frame: 20, score: 99.0 },
            SceneChange { frame: 100, score: 40.0 },
            SceneChange { frame: 150, score: 80.0 },
            SceneChange { frame: 200, score: 60.0 },
            SceneChange { frame: 330, score: 95.0 },
        ];
        // 10 秒出现区间，平均片段 3 秒 → 2 个内部点，只取区间内部的变化点
        let occurrences = [Occurrence {
            start_frame: 30,
            end_frame: 330,
        }];
        let reference = profile(4.0, 3.0, &[]);

        let candidates = collect_candidates(&[], &occurrences, &changes, &reference, 30.0, 1.5);
        assert_eq!(candidates, vec![30, 150, 200, 330]);
    }

    #[test]
    fn test_plan_subdivides_long_tracked_occurrence() {
        // 前 12 秒为两种深浅的红色，每 2 秒交替一次（色相相同、亮度不同），之后为绿色
        let light = [220, 20, 20];
        let dark = [100, 8, 8];
        let green = [20, 220, 20];
        let frames = (0..600)
            .map(|i| match i {
                i if i >= 360 => flat(green),
                i if (i / 60) % 2 == 0 => flat(light),
                _ => flat(dark),
            })
            .collect();
        let mut source = MemorySource::new(30.0, frames);

        let signature = TargetSubjectSignature {
            class_label: UNKNOWN_LABEL.to_string(),
            confidence: 1.0,
            bbox: [0.0, 0.0, 40.0, 40.0].into(),
            histogram: extract_signature(&flat(light)),
        };
        let mut detector = ScriptedDetector::default();
        for call in 0..36 {
            detector.script.insert(call, vec![record("ball", 0.9, [0.0, 0.0, 40.0, 40.0])]);
        }

        let reference = profile(4.0, 2.0, &[]);
        let plan = plan_target(
            "target.mp4",
            &mut source,
            &mut detector,
            &reference,
            &[],
            Some(&signature),
            &PlannerParams::default(),
            &NoProgress,
        )
        .unwrap();

        assert_eq!(
            plan.occurrences,
            vec![Occurrence {
                start_frame: 0,
                end_frame: 360
            }]
        );
        // 12 秒 > 1.5 × 2 秒；第一个场景的结束帧 60 只可能来自区间细分
        for frame in [60, 120, 180, 240, 300] {
            assert!(plan.candidates.contains(&frame), "缺少内部剪辑点 {}", frame);
        }
        assert!(plan.cuts.iter().all(|&c| c < plan.total_duration));
    }
}
