use anyhow::Context;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::audio_muxer::AudioMuxer;
use crate::error::{EditError, EditResult};
use crate::jobs::ProgressSink;
use crate::video_processor::{FrameSource, Rotation, SilentVideoWriter, VideoReader};

/// 导出参数
#[derive(Debug, Clone)]
pub struct ExportParams {
    /// 视频码率（bps）
    pub bit_rate: usize,
    /// 是否尝试合成原音频
    pub mux_audio: bool,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            bit_rate: 4_000_000,
            mux_audio: true,
        }
    }
}

/// 保留/丢弃区间划分（帧，左闭右开）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentPlan {
    pub kept: Vec<(u64, u64)>,
    pub discarded: Vec<(u64, u64)>,
}

impl SegmentPlan {
    pub fn keeps(&self, frame: u64) -> bool {
        self.kept.iter().any(|&(s, e)| s <= frame && frame < e)
    }
}

/// 按剪辑点交替划分区间，从保留开始：边界 [0, c1, ..., cn, F]，偶数序号的区间保留
pub fn partition_segments(cut_frames: &[u64], total_frames: u64) -> SegmentPlan {
    let mut boundaries = Vec::with_capacity(cut_frames.len() + 2);
    boundaries.push(0);
    boundaries.extend(cut_frames.iter().map(|&c| c.min(total_frames)));
    boundaries.push(total_frames);

    let mut plan = SegmentPlan {
        kept: Vec::new(),
        discarded: Vec::new(),
    };
    for (i, w) in boundaries.windows(2).enumerate() {
        if w[0] >= w[1] {
            continue;
        }
        if i % 2 == 0 {
            plan.kept.push((w[0], w[1]));
        } else {
            plan.discarded.push((w[0], w[1]));
        }
    }
    plan
}

/// 音频处理结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AudioOutcome {
    Muxed,
    /// 降级为无声输出
    Silent { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportOutcome {
    pub output: PathBuf,
    pub segments: SegmentPlan,
    pub frames_written: u64,
    pub audio: AudioOutcome,
}

/// 失败或提前返回时删除的临时文件
struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("⚠️  [导出] 删除临时文件失败: {}: {}", self.path.display(), e);
            }
        }
    }
}

/// 确认输出路径可写（不会留下探测文件）
fn check_output_writable(output: &Path) -> EditResult<()> {
    let existed = output.exists();
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(output)
        .map_err(|source| EditError::OutputNotWritable {
            path: output.to_path_buf(),
            source,
        })?;
    if !existed {
        let _ = std::fs::remove_file(output);
    }
    Ok(())
}

fn intermediate_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "export".to_string());
    let name = format!("{}.{}.silent.mp4", stem, uuid::Uuid::new_v4());
    match output.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(name),
        _ => PathBuf::from(name),
    }
}

/// 按剪辑点导出目标视频
///
/// 先重新编码保留区间为无声视频，再尝试合成对应的音频；
/// 音频步骤失败时以无声视频作为输出。
pub fn export_video(
    target: &Path,
    rotation: Rotation,
    cuts: &[f64],
    output: &Path,
    params: &ExportParams,
    progress: &dyn ProgressSink,
) -> EditResult<ExportOutcome> {
    if cuts.is_empty() {
        return Err(EditError::NoCutPoints);
    }
    check_output_writable(output)?;

    let start = Instant::now();
    info!("🎬 [导出] 开始导出: {} → {}", target.display(), output.display());

    let mut reader = VideoReader::open(target, rotation).map_err(|source| EditError::VideoOpen {
        path: target.to_path_buf(),
        source,
    })?;
    let info = reader.info().clone();

    let mut cut_frames: Vec<u64> = cuts.iter().map(|&t| (t.max(0.0) * info.fps).floor() as u64).collect();
    cut_frames.sort_unstable();
    let segments = partition_segments(&cut_frames, info.frame_count);
    let kept_total: u64 = segments.kept.iter().map(|&(s, e)| e - s).sum();
    info!(
        "  • 保留 {} 个片段，共 {} 帧，丢弃 {} 个片段",
        segments.kept.len(),
        kept_total,
        segments.discarded.len()
    );

    // 帧数为估算值时，末尾保留区间延伸到视频结束
    let open_tail = segments.kept.last().filter(|&&(_, e)| e == info.frame_count).map(|&(s, _)| s);
    let last_needed = segments.kept.last().map(|&(_, e)| e).unwrap_or(0);

    let mut silent = TempFile::new(intermediate_path(output));
    let mut writer = SilentVideoWriter::create(&silent.path, info.width, info.height, info.fps, params.bit_rate)?;

    let mut frame_idx: u64 = 0;
    let mut written_ranges: Vec<(u64, u64)> = Vec::new();
    while let Some(frame) = reader.next_frame()? {
        let keep = segments.keeps(frame_idx) || open_tail.is_some_and(|s| frame_idx >= s);
        if keep {
            writer.write(&frame)?;
            match written_ranges.last_mut() {
                Some(range) if range.1 == frame_idx => range.1 = frame_idx + 1,
                _ => written_ranges.push((frame_idx, frame_idx + 1)),
            }
        }
        frame_idx += 1;

        if open_tail.is_none() && frame_idx >= last_needed {
            break;
        }
        if frame_idx % 50 == 0 && kept_total > 0 {
            let done: u64 = written_ranges.iter().map(|&(s, e)| e - s).sum();
            let percent = done as f64 * 100.0 / kept_total as f64;
            progress.report(percent.min(95.0), &format!("导出进度: {:.1}%", percent));
        }
    }
    drop(reader);

    let frames_written = writer.finish()?;
    if frames_written == 0 {
        return Err(EditError::Pipeline(anyhow::anyhow!("剪辑点没有留下任何可导出的帧")));
    }
    info!("✅ [导出] 视频编码完成，写入 {} 帧，耗时: {:.2}秒", frames_written, start.elapsed().as_secs_f64());

    progress.report(96.0, "合成音频...");
    let ranges: Vec<(f64, f64)> = written_ranges
        .iter()
        .map(|&(s, e)| (s as f64 / info.fps, e as f64 / info.fps))
        .collect();
    let audio = mux_audio(target, &silent.path, &ranges, output, info.has_audio, params);

    if let AudioOutcome::Silent { reason } = &audio {
        warn!("⚠️  [导出] 音频合成跳过，输出无声视频: {}", reason);
        std::fs::rename(&silent.path, output)
            .with_context(|| format!("移动输出文件失败: {}", output.display()))?;
        silent.keep = true;
    }

    info!("✅ [导出] 完成: {}，总耗时: {:.2}秒", output.display(), start.elapsed().as_secs_f64());
    Ok(ExportOutcome {
        output: output.to_path_buf(),
        segments,
        frames_written,
        audio,
    })
}

fn mux_audio(
    target: &Path,
    silent: &Path,
    ranges: &[(f64, f64)],
    output: &Path,
    has_audio: bool,
    params: &ExportParams,
) -> AudioOutcome {
    if !params.mux_audio {
        return AudioOutcome::Silent {
            reason: "已关闭音频合成".to_string(),
        };
    }
    if !has_audio {
        return AudioOutcome::Silent {
            reason: "目标视频没有音轨".to_string(),
        };
    }
    let Some(muxer) = AudioMuxer::locate() else {
        return AudioOutcome::Silent {
            reason: "未找到 ffmpeg 命令行工具".to_string(),
        };
    };

    match muxer.mux(target, silent, ranges, output) {
        Ok(()) => AudioOutcome::Muxed,
        Err(e) => {
            let _ = std::fs::remove_file(output);
            AudioOutcome::Silent {
                reason: format!("{:#}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::NoProgress;
    use image::{ImageBuffer, Rgb, RgbImage};

    #[test]
    fn test_partition_alternates_from_keep() {
        let plan = partition_segments(&[30, 60, 90], 120);
        assert_eq!(plan.kept, vec![(0, 30), (60, 90)]);
        assert_eq!(plan.discarded, vec![(30, 60), (90, 120)]);
        assert!(plan.keeps(0));
        assert!(!plan.keeps(30));
        assert!(plan.keeps(89));
        assert!(!plan.keeps(119));
    }

    #[test]
    fn test_partition_covers_all_frames() {
        let plan = partition_segments(&[10, 25], 40);
        let mut all: Vec<(u64, u64)> = plan.kept.iter().chain(&plan.discarded).copied().collect();
        all.sort();
        assert_eq!(all, vec![(0, 10), (10, 25), (25, 40)]);
    }

    #[test]
    fn test_partition_clamps_cuts_past_end() {
        let plan = partition_segments(&[10, 500], 40);
        assert_eq!(plan.kept, vec![(0, 10)]);
        assert_eq!(plan.discarded, vec![(10, 40)]);
    }

    #[test]
    fn test_export_without_cuts_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let err = export_video(
            Path::new("missing.mp4"),
            Rotation::None,
            &[],
            &output,
            &ExportParams::default(),
            &NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, EditError::NoCutPoints));
        assert!(!output.exists());
    }

    #[test]
    fn test_unwritable_output_is_reported_first() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("no-such-dir").join("out.mp4");
        let err = export_video(
            Path::new("missing.mp4"),
            Rotation::None,
            &[1.0],
            &output,
            &ExportParams::default(),
            &NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, EditError::OutputNotWritable { .. }));
    }

    #[test]
    fn test_missing_target_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let err = export_video(
            &dir.path().join("missing.mp4"),
            Rotation::None,
            &[1.0],
            &output,
            &ExportParams::default(),
            &NoProgress,
        )
        .unwrap_err();
        assert!(matches!(err, EditError::VideoOpen { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_export_keeps_first_segment() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.mp4");
        let mut writer = SilentVideoWriter::create(&source, 64, 48, 30.0, 800_000).unwrap();
        for i in 0..40u32 {
            let frame: RgbImage = ImageBuffer::from_fn(64, 48, move |x, _| Rgb([(x * 4) as u8, (i * 6) as u8, 90]));
            writer.write(&frame).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 40);

        let output = dir.path().join("cut.mp4");
        let outcome = export_video(&source, Rotation::None, &[0.5], &output, &ExportParams::default(), &NoProgress)
            .unwrap();

        assert_eq!(outcome.frames_written, 15);
        assert!(matches!(outcome.audio, AudioOutcome::Silent { .. }));
        assert!(output.exists());
        // 只剩源文件和输出文件
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }
}
