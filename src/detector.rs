use anyhow::{Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 默认检测置信度阈值（严格大于才保留）
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;

/// 边界框 (x1, y1, x2, y2)，像素坐标
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    /// 裁剪到画面范围内，返回 (x, y, w, h) 像素区域；区域为空时返回 None
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x1 = self.x1.min(self.x2).max(0.0).min(width as f64) as u32;
        let y1 = self.y1.min(self.y2).max(0.0).min(height as f64) as u32;
        let x2 = self.x1.max(self.x2).max(0.0).min(width as f64) as u32;
        let y2 = self.y1.max(self.y2).max(0.0).min(height as f64) as u32;
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

impl From<[f64; 4]> for BoundingBox {
    fn from(v: [f64; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BoundingBox> for [f64; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// 单条检测记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<i64>,
}

/// 物体检测接口，检测模型本身由外部服务提供
///
/// `detect_with_tracking` 用于需要跨帧身份（track id）的场景，
/// 不支持跟踪的实现退化为普通检测。
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectionRecord>>;

    fn detect_with_tracking(&mut self, frame: &RgbImage) -> Result<Vec<DetectionRecord>> {
        self.detect(frame)
    }
}

impl<D: ObjectDetector + ?Sized> ObjectDetector for Box<D> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectionRecord>> {
        (**self).detect(frame)
    }

    fn detect_with_tracking(&mut self, frame: &RgbImage) -> Result<Vec<DetectionRecord>> {
        (**self).detect_with_tracking(frame)
    }
}

/// 只保留置信度严格高于阈值的记录
pub fn confident(records: Vec<DetectionRecord>, threshold: f64) -> Vec<DetectionRecord> {
    records.into_iter().filter(|r| r.confidence > threshold).collect()
}

/// 空检测器：不返回任何检测结果（未配置检测服务时使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl ObjectDetector for NullDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<DetectionRecord>> {
        Ok(Vec::new())
    }
}

/// 检测服务响应
#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<DetectionRecord>,
}

/// HTTP 检测服务客户端
///
/// 以 JPEG 上传帧，`?track=true` 请求带跟踪 id 的结果。
/// 在阻塞线程中运行，通过运行时句柄等待异步请求。
pub struct HttpDetector {
    endpoint: String,
    client: reqwest::Client,
    runtime: tokio::runtime::Handle,
    jpeg_quality: u8,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, runtime: tokio::runtime::Handle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("创建检测服务客户端失败")?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            runtime,
            jpeg_quality: 85,
        })
    }

    fn request(&self, frame: &RgbImage, track: bool) -> Result<Vec<DetectionRecord>> {
        let body = encode_jpeg(frame, self.jpeg_quality)?;
        let request = self
            .client
            .post(&self.endpoint)
            .query(&[("track", if track { "true" } else { "false" })])
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(body);

        let response: DetectResponse = self.runtime.block_on(async move {
            let response = request.send().await.context("检测服务请求失败")?;
            let status = response.status();
            if !status.is_success() {
                let error_text = response.text().await.unwrap_or_default();
                anyhow::bail!("检测服务返回错误状态: {} - {}", status, error_text);
            }
            let parsed = response.json::<DetectResponse>().await.context("解析检测结果失败")?;
            Ok::<DetectResponse, anyhow::Error>(parsed)
        })?;

        Ok(response.detections)
    }
}

impl ObjectDetector for HttpDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<DetectionRecord>> {
        self.request(frame, false)
    }

    fn detect_with_tracking(&mut self, frame: &RgbImage) -> Result<Vec<DetectionRecord>> {
        self.request(frame, true)
    }
}

fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality)
        .encode(frame.as_raw(), frame.width(), frame.height(), image::ColorType::Rgb8)
        .context("JPEG 编码失败")?;
    Ok(buf)
}
