use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// 音频合成器：裁剪原视频中保留区间的音频，拼接后合入无声视频
pub struct AudioMuxer {
    ffmpeg: PathBuf,
}

impl AudioMuxer {
    /// 在 PATH 中查找 ffmpeg 命令行工具
    pub fn locate() -> Option<Self> {
        which::which("ffmpeg").ok().map(|ffmpeg| Self { ffmpeg })
    }

    pub fn with_binary(ffmpeg: impl Into<PathBuf>) -> Self {
        Self { ffmpeg: ffmpeg.into() }
    }

    /// 将 `source` 中 `ranges`（秒）内的音频拼接后合入 `silent_video`，写入 `output`
    ///
    /// 视频流直接复制，音频编码为 AAC。
    pub fn mux(&self, source: &Path, silent_video: &Path, ranges: &[(f64, f64)], output: &Path) -> Result<()> {
        if ranges.is_empty() {
            anyhow::bail!("没有需要合成的音频区间");
        }

        let filter = build_audio_filter(ranges);
        debug!("[导出] 音频滤镜: {}", filter);

        let result = Command::new(&self.ffmpeg)
            .arg("-loglevel")
            .arg("error")
            .arg("-i")
            .arg(silent_video)
            .arg("-i")
            .arg(source)
            .arg("-filter_complex")
            .arg(&filter)
            .arg("-map")
            .arg("0:v:0")
            .arg("-map")
            .arg("[outa]")
            .arg("-c:v")
            .arg("copy")
            .arg("-c:a")
            .arg("aac")
            .arg("-b:a")
            .arg("192k")
            .arg("-shortest")
            .arg("-y")
            .arg(output)
            .output()
            .context("执行 ffmpeg 命令失败")?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            anyhow::bail!("音频合成失败: {}", stderr.trim());
        }

        Ok(())
    }
}

/// 构建 atrim + concat 滤镜，输入 1 为原视频
pub fn build_audio_filter(ranges: &[(f64, f64)]) -> String {
    let mut filter = String::new();
    for (i, (start, end)) in ranges.iter().enumerate() {
        filter.push_str(&format!(
            "[1:a]atrim=start={:.6}:end={:.6},asetpts=PTS-STARTPTS[a{}];",
            start, end, i
        ));
    }
    for i in 0..ranges.len() {
        filter.push_str(&format!("[a{}]", i));
    }
    filter.push_str(&format!("concat=n={}:v=0:a=1[outa]", ranges.len()));
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_for_two_ranges() {
        let filter = build_audio_filter(&[(0.0, 2.5), (4.0, 6.0)]);
        assert_eq!(
            filter,
            "[1:a]atrim=start=0.000000:end=2.500000,asetpts=PTS-STARTPTS[a0];\
             [1:a]atrim=start=4.000000:end=6.000000,asetpts=PTS-STARTPTS[a1];\
             [a0][a1]concat=n=2:v=0:a=1[outa]"
        );
    }

    #[test]
    fn test_missing_binary_fails() {
        let muxer = AudioMuxer::with_binary("/nonexistent/ffmpeg-binary");
        let dir = tempfile::tempdir().unwrap();
        let err = muxer.mux(
            &dir.path().join("in.mp4"),
            &dir.path().join("silent.mp4"),
            &[(0.0, 1.0)],
            &dir.path().join("out.mp4"),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_ranges_rejected() {
        let muxer = AudioMuxer::with_binary("ffmpeg");
        let p = Path::new("x.mp4");
        assert!(muxer.mux(p, p, &[], p).is_err());
    }
}
