use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config::{DetectorConfig, EditConfig};
use crate::cut_planner::plan_target;
use crate::detector::{BoundingBox, HttpDetector, NullDetector, ObjectDetector};
use crate::error::{EditError, EditResult};
use crate::exporter::{export_video, AudioOutcome, ExportOutcome};
use crate::jobs::{JobKind, JobRunner, ProgressSink};
use crate::metadata::{CutPlan, StyleProfile};
use crate::style_analyzer::analyze_reference;
use crate::subject_matcher::{select_target_subject, TargetSubjectSignature};
use crate::video_processor::{FrameSource, Rotation, VideoReader};

/// 根据配置创建检测器：配置了检测服务地址时使用 HTTP 检测，否则不检测
pub fn build_detector(config: &DetectorConfig, runtime: &Handle) -> Result<Box<dyn ObjectDetector>> {
    match &config.endpoint {
        Some(endpoint) => {
            let detector = HttpDetector::new(endpoint.clone(), config.timeout, runtime.clone())
                .with_context(|| format!("创建检测服务客户端失败: {}", endpoint))?;
            Ok(Box::new(detector))
        }
        None => Ok(Box::new(NullDetector)),
    }
}

fn open_video(path: &Path, rotation: Rotation) -> EditResult<VideoReader> {
    VideoReader::open(path, rotation).map_err(|source| {
        error!("❌ 无法打开视频: {}: {:#}", path.display(), source);
        EditError::VideoOpen {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// 分析参考视频
pub async fn analyze_reference_video(
    runner: &JobRunner,
    path: PathBuf,
    rotation: Rotation,
    config: &EditConfig,
) -> EditResult<StyleProfile> {
    let params = config.reference.clone();
    let detector_config = config.detector.clone();
    let runtime = Handle::current();

    let handle = runner.submit(JobKind::ReferenceAnalysis, move |progress| {
        let total_start = Instant::now();
        info!("🎬 [参考分析] 开始分析参考视频: {}", path.display());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let mut reader = open_video(&path, rotation)?;
        let info = reader.info().clone();
        info!("  • 分辨率: {}x{}", info.width, info.height);
        info!("  • 帧率: {:.2} fps", info.fps);
        info!("  • 时长: {:.2}秒", info.duration());

        let mut detector: Box<dyn ObjectDetector> = if params.use_object_detection {
            build_detector(&detector_config, &runtime)?
        } else {
            Box::new(NullDetector)
        };

        let profile = analyze_reference(
            &path.display().to_string(),
            &mut reader,
            detector.as_mut(),
            &params,
            progress,
        )?;

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("🎉 [参考分析] 总耗时: {:.2}秒", total_start.elapsed().as_secs_f64());
        Ok(profile)
    })?;

    handle.wait().await
}

/// 规划目标视频的剪辑点
pub async fn plan_target_video(
    runner: &JobRunner,
    path: PathBuf,
    rotation: Rotation,
    profile: StyleProfile,
    important: Vec<String>,
    signature: Option<TargetSubjectSignature>,
    config: &EditConfig,
) -> EditResult<CutPlan> {
    let params = config.planner.clone();
    let detector_config = config.detector.clone();
    let runtime = Handle::current();

    let handle = runner.submit(JobKind::TargetPlanning, move |progress| {
        let total_start = Instant::now();
        info!("🎬 [目标规划] 开始分析目标视频: {}", path.display());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let mut reader = open_video(&path, rotation)?;
        let mut detector = build_detector(&detector_config, &runtime)?;

        let plan = plan_target(
            &path.display().to_string(),
            &mut reader,
            detector.as_mut(),
            &profile,
            &important,
            signature.as_ref(),
            &params,
            progress,
        )?;

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("🎉 [目标规划] 总耗时: {:.2}秒", total_start.elapsed().as_secs_f64());
        Ok(plan)
    })?;

    let plan = handle.wait().await?;

    if let Some(webhook_url) = &config.webhook_url {
        let payload = WebhookPayload::new(JobKind::TargetPlanning, &plan.source, &plan.cuts);
        if let Err(e) = call_webhook(webhook_url, &payload).await {
            warn!("⚠️  Webhook 回调失败: {}", e);
        }
    }

    Ok(plan)
}

/// 在目标视频的某一帧上框选跟踪目标
pub async fn select_subject(
    runner: &JobRunner,
    path: PathBuf,
    rotation: Rotation,
    frame_index: u64,
    selection: BoundingBox,
    config: &EditConfig,
) -> EditResult<TargetSubjectSignature> {
    let confidence = config.planner.confidence_threshold;
    let detector_config = config.detector.clone();
    let runtime = Handle::current();

    let handle = runner.submit(JobKind::SubjectSelection, move |progress| {
        let mut reader = open_video(&path, rotation)?;
        let mut idx = 0u64;
        let frame = loop {
            match reader.next_frame()? {
                Some(frame) if idx == frame_index => break frame,
                Some(_) => idx += 1,
                None => {
                    return Err(EditError::InvalidSelection(format!(
                        "帧索引超出范围: {}（共 {} 帧）",
                        frame_index, idx
                    )))
                }
            }
        };
        progress.report(50.0, "识别选择区域...");

        let mut detector = build_detector(&detector_config, &runtime)?;
        let signature = select_target_subject(&frame, &selection, detector.as_mut(), confidence)?;
        info!(
            "✅ [目标选择] 第 {} 帧，类别: {}，置信度: {:.2}",
            frame_index, signature.class_label, signature.confidence
        );
        Ok(signature)
    })?;

    handle.wait().await
}

/// 按最终剪辑点导出视频
pub async fn export_final_video(
    runner: &JobRunner,
    target: PathBuf,
    rotation: Rotation,
    cuts: Vec<f64>,
    output: PathBuf,
    config: &EditConfig,
) -> EditResult<ExportOutcome> {
    // 输入错误在提交前返回
    if cuts.is_empty() {
        return Err(EditError::NoCutPoints);
    }

    let params = config.export.clone();
    let handle = runner.submit(JobKind::Export, move |progress| {
        export_video(&target, rotation, &cuts, &output, &params, progress)
    })?;
    let outcome = handle.wait().await?;

    if let AudioOutcome::Silent { reason } = &outcome.audio {
        info!("ℹ️  [导出] 已输出无声视频: {}", reason);
    }

    if let Some(webhook_url) = &config.webhook_url {
        let mut payload = WebhookPayload::new(JobKind::Export, &outcome.output.display().to_string(), &[]);
        payload.output = Some(outcome.output.display().to_string());
        payload.audio = Some(outcome.audio.clone());
        if let Err(e) = call_webhook(webhook_url, &payload).await {
            warn!("⚠️  Webhook 回调失败: {}", e);
        }
    }

    Ok(outcome)
}

/// Webhook 回调负载
#[derive(Debug, Serialize)]
struct WebhookPayload {
    status: String,
    event: JobKind,
    source: String,
    cut_count: usize,
    cuts: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<AudioOutcome>,
    timestamp: String,
}

impl WebhookPayload {
    fn new(event: JobKind, source: &str, cuts: &[f64]) -> Self {
        Self {
            status: "success".to_string(),
            event,
            source: source.to_string(),
            cut_count: cuts.len(),
            cuts: cuts.to_vec(),
            output: None,
            audio: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// 调用 webhook 回调
async fn call_webhook(webhook_url: &str, payload: &WebhookPayload) -> Result<()> {
    let client = reqwest::Client::new();
    let response = client
        .post(webhook_url)
        .json(payload)
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await
        .context("Webhook 请求失败")?;

    let status = response.status();
    if status.is_success() {
        info!("Webhook 回调成功: {}", webhook_url);
    } else {
        let error_text = response.text().await.unwrap_or_default();
        warn!("Webhook 回调返回错误状态: {} - {}", status, error_text);
        return Err(anyhow::anyhow!("Webhook 返回错误状态: {}", status));
    }

    Ok(())
}
