use ffmpeg_next as ffmpeg;
use image::RgbImage;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::debug;

/// 初始化 FFmpeg，并将日志级别设为 ERROR，抑制警告和信息消息
pub fn init_ffmpeg() -> Result<()> {
    ffmpeg::init().context("初始化 FFmpeg 失败")?;
    ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
    Ok(())
}

/// 固定旋转角度，统一作用于每一帧（分析与导出前）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Cw90 => 90,
            Self::Cw180 => 180,
            Self::Cw270 => 270,
        }
    }

    pub fn apply(self, frame: RgbImage) -> RgbImage {
        match self {
            Self::None => frame,
            Self::Cw90 => image::imageops::rotate90(&frame),
            Self::Cw180 => image::imageops::rotate180(&frame),
            Self::Cw270 => image::imageops::rotate270(&frame),
        }
    }

    /// 旋转后的画面尺寸
    pub fn rotated_size(self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::Cw90 | Self::Cw270 => (height, width),
            _ => (width, height),
        }
    }
}

impl TryFrom<u32> for Rotation {
    type Error = String;

    fn try_from(degrees: u32) -> std::result::Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Self::None),
            90 => Ok(Self::Cw90),
            180 => Ok(Self::Cw180),
            270 => Ok(Self::Cw270),
            other => Err(format!("不支持的旋转角度: {}（可选 0/90/180/270）", other)),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

/// 视频基本信息（尺寸为旋转后的尺寸）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// 容器报告的帧数（可能为估算值）
    pub frame_count: u64,
    pub has_audio: bool,
}

impl VideoInfo {
    pub fn duration(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_count as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// 顺序帧来源：一次遍历，按帧索引递增输出
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    /// 读取下一帧，视频结束时返回 None
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// 内存帧来源，用于合成视频与测试
pub struct MemorySource {
    info: VideoInfo,
    frames: VecDeque<RgbImage>,
}

impl MemorySource {
    pub fn new(fps: f64, frames: Vec<RgbImage>) -> Self {
        let (width, height) = frames.first().map(|f| f.dimensions()).unwrap_or((0, 0));
        Self {
            info: VideoInfo {
                fps,
                width,
                height,
                frame_count: frames.len() as u64,
                has_audio: false,
            },
            frames: frames.into(),
        }
    }
}

impl FrameSource for MemorySource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        Ok(self.frames.pop_front())
    }
}

/// 视频读取器，负责顺序解码视频并输出 RGB 帧
pub struct VideoReader {
    input_path: PathBuf,
    ictx: ffmpeg::format::context::Input,
    decoder: ffmpeg::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    video_stream_index: usize,
    rotation: Rotation,
    info: VideoInfo,
    eof_sent: bool,
}

impl VideoReader {
    pub fn open(input_path: impl AsRef<Path>, rotation: Rotation) -> Result<Self> {
        init_ffmpeg()?;
        let input_path = input_path.as_ref().to_path_buf();

        let ictx = ffmpeg::format::input(&input_path)
            .with_context(|| format!("无法打开视频文件: {}", input_path.display()))?;

        let (video_stream_index, decoder, fps_value, reported_frames) = {
            let video_stream = ictx
                .streams()
                .best(ffmpeg::media::Type::Video)
                .context("未找到视频流")?;

            let decoder_context = ffmpeg::codec::context::Context::from_parameters(video_stream.parameters())
                .context("无法创建解码器上下文")?;
            let decoder = decoder_context.decoder()
                .video()
                .context("无法创建视频解码器")?;

            let fps = video_stream.avg_frame_rate();
            let fps_value = if fps.denominator() > 0 && fps.numerator() > 0 {
                fps.numerator() as f64 / fps.denominator() as f64
            } else {
                30.0 // 默认值
            };

            (video_stream.index(), decoder, fps_value, video_stream.frames())
        };

        let has_audio = ictx.streams().best(ffmpeg::media::Type::Audio).is_some();

        // 部分容器不报告帧数，使用时长估算
        let frame_count = if reported_frames > 0 {
            reported_frames as u64
        } else {
            let duration = ictx.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64;
            (duration.max(0.0) * fps_value).round() as u64
        };

        let scaler = ffmpeg::software::scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        ).context("无法创建缩放器")?;

        let (width, height) = rotation.rotated_size(decoder.width(), decoder.height());

        Ok(Self {
            input_path,
            ictx,
            decoder,
            scaler,
            video_stream_index,
            rotation,
            info: VideoInfo {
                fps: fps_value,
                width,
                height,
                frame_count,
                has_audio,
            },
            eof_sent: false,
        })
    }

    pub fn input_path(&self) -> &Path {
        &self.input_path
    }

    /// 读取指定帧（从头顺序解码）
    pub fn read_frame_at(
        input_path: impl AsRef<Path>,
        rotation: Rotation,
        frame_index: u64,
    ) -> Result<RgbImage> {
        let mut reader = Self::open(input_path, rotation)?;
        let mut idx = 0u64;
        while let Some(frame) = reader.next_frame()? {
            if idx == frame_index {
                return Ok(frame);
            }
            idx += 1;
        }
        anyhow::bail!("帧索引超出范围: {}（共 {} 帧）", frame_index, idx)
    }
}

impl FrameSource for VideoReader {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        loop {
            let mut decoded = ffmpeg::frame::Video::empty();
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = ffmpeg::frame::Video::empty();
                self.scaler.run(&decoded, &mut rgb_frame)
                    .context("帧格式转换失败")?;
                let image = frame_to_image(&rgb_frame);
                return Ok(Some(self.rotation.apply(image)));
            }

            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.ictx) {
                Ok(()) => {
                    if packet.stream() != self.video_stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        // 发送数据包失败，跳过这个数据包
                        debug!("跳过无法解码的数据包: {}", e);
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().context("刷新解码器失败")?;
                    self.eof_sent = true;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e))
                        .with_context(|| format!("读取视频数据失败: {}", self.input_path.display()));
                }
            }
        }
    }
}

/// 将 FFmpeg RGB24 帧转换为 RgbImage（按行拷贝，跳过行尾填充）
fn frame_to_image(frame: &ffmpeg::frame::Video) -> RgbImage {
    let width = frame.width();
    let height = frame.height();
    let stride = frame.stride(0);
    let data = frame.data(0);
    let row_bytes = width as usize * 3;

    let mut buf = Vec::with_capacity(row_bytes * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        buf.extend_from_slice(&data[start..start + row_bytes]);
    }

    RgbImage::from_raw(width, height, buf).unwrap_or_else(|| RgbImage::new(width, height))
}

/// 无声视频写入器：将 RGB 帧编码为 MPEG-4 视频
pub struct SilentVideoWriter {
    octx: ffmpeg::format::context::Output,
    encoder: ffmpeg::encoder::video::Encoder,
    scaler: ffmpeg::software::scaling::Context,
    stream_index: usize,
    encoder_time_base: ffmpeg::Rational,
    stream_time_base: ffmpeg::Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

impl SilentVideoWriter {
    /// 创建写入器；yuv420p 要求偶数尺寸，奇数边会被裁掉一个像素
    pub fn create(
        output_path: impl AsRef<Path>,
        width: u32,
        height: u32,
        fps: f64,
        bit_rate: usize,
    ) -> Result<Self> {
        init_ffmpeg()?;
        let output_path = output_path.as_ref();
        let width = width & !1;
        let height = height & !1;
        if width == 0 || height == 0 {
            anyhow::bail!("无效的输出尺寸: {}x{}", width, height);
        }

        let mut octx = ffmpeg::format::output(&output_path)
            .with_context(|| format!("无法创建输出文件: {}", output_path.display()))?;

        let codec = ffmpeg::encoder::find(ffmpeg::codec::Id::MPEG4)
            .context("未找到 MPEG-4 编码器")?;
        let global_header = octx.format().flags().contains(ffmpeg::format::Flags::GLOBAL_HEADER);

        let frame_rate = ffmpeg::Rational::from(fps);
        let time_base = frame_rate.invert();

        let mut encoder = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("无法创建视频编码器")?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(ffmpeg::format::Pixel::YUV420P);
        encoder.set_time_base(time_base);
        encoder.set_frame_rate(Some(frame_rate));
        encoder.set_bit_rate(bit_rate);
        if global_header {
            encoder.set_flags(ffmpeg::codec::Flags::GLOBAL_HEADER);
        }
        let encoder = encoder.open_as(codec).context("无法打开视频编码器")?;

        let stream_index = {
            let mut ost = octx.add_stream(codec).context("无法创建输出视频流")?;
            ost.set_parameters(&encoder);
            ost.set_time_base(time_base);
            ost.index()
        };

        octx.write_header().context("写入文件头失败")?;
        let stream_time_base = octx
            .stream(stream_index)
            .context("输出视频流不存在")?
            .time_base();

        let scaler = ffmpeg::software::scaling::Context::get(
            ffmpeg::format::Pixel::RGB24,
            width,
            height,
            ffmpeg::format::Pixel::YUV420P,
            width,
            height,
            ffmpeg::software::scaling::Flags::BILINEAR,
        ).context("无法创建缩放器")?;

        Ok(Self {
            octx,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: time_base,
            stream_time_base,
            width,
            height,
            next_pts: 0,
        })
    }

    /// 写入一帧
    pub fn write(&mut self, image: &RgbImage) -> Result<()> {
        let rgb_frame = self.image_to_frame(image)?;
        let mut yuv_frame = ffmpeg::frame::Video::empty();
        self.scaler.run(&rgb_frame, &mut yuv_frame)
            .context("帧格式转换失败")?;
        yuv_frame.set_pts(Some(self.next_pts));
        self.next_pts += 1;

        self.encoder.send_frame(&yuv_frame).context("编码帧失败")?;
        self.drain_packets()
    }

    /// 刷新编码器并写入文件尾，返回写入的帧数
    pub fn finish(mut self) -> Result<u64> {
        self.encoder.send_eof().context("刷新编码器失败")?;
        self.drain_packets()?;
        self.octx.write_trailer().context("写入文件尾失败")?;
        Ok(self.next_pts as u64)
    }

    fn drain_packets(&mut self) -> Result<()> {
        let mut packet = ffmpeg::Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet.write_interleaved(&mut self.octx)
                .context("写入数据包失败")?;
        }
        Ok(())
    }

    fn image_to_frame(&self, image: &RgbImage) -> Result<ffmpeg::frame::Video> {
        if image.width() < self.width || image.height() < self.height {
            anyhow::bail!(
                "帧尺寸不一致: {}x{}，期望 {}x{}",
                image.width(), image.height(), self.width, self.height
            );
        }

        let mut frame = ffmpeg::frame::Video::new(ffmpeg::format::Pixel::RGB24, self.width, self.height);
        let stride = frame.stride(0);
        let row_bytes = self.width as usize * 3;
        let src_row_bytes = image.width() as usize * 3;
        let src = image.as_raw();
        let data = frame.data_mut(0);

        for y in 0..self.height as usize {
            let src_start = y * src_row_bytes;
            data[y * stride..y * stride + row_bytes]
                .copy_from_slice(&src[src_start..src_start + row_bytes]);
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(Rotation::try_from(90), Ok(Rotation::Cw90));
        assert_eq!(Rotation::try_from(0), Ok(Rotation::None));
        assert!(Rotation::try_from(45).is_err());
        assert_eq!(u32::from(Rotation::Cw270), 270);
    }

    #[test]
    fn test_rotation_swaps_dimensions() {
        let frame: RgbImage = ImageBuffer::from_fn(4, 2, |x, _| Rgb([x as u8, 0, 0]));
        let rotated = Rotation::Cw90.apply(frame.clone());
        assert_eq!(rotated.dimensions(), (2, 4));
        assert_eq!(Rotation::Cw90.rotated_size(4, 2), (2, 4));
        assert_eq!(Rotation::Cw180.apply(frame).dimensions(), (4, 2));
    }

    #[test]
    fn test_memory_source_yields_frames_in_order() {
        let frames: Vec<RgbImage> = (0..3u8)
            .map(|v| ImageBuffer::from_fn(2, 2, move |_, _| Rgb([v, v, v])))
            .collect();
        let mut source = MemorySource::new(25.0, frames);
        assert_eq!(source.info().frame_count, 3);
        assert!((source.info().duration() - 0.12).abs() < 1e-9);

        let mut seen = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            seen.push(frame.get_pixel(0, 0)[0]);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_open_missing_file_fails() {
        assert!(VideoReader::open("/nonexistent/video.mp4", Rotation::None).is_err());
    }
}
