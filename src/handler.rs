use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::Json as ResponseJson,
    routing::{delete, get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::EditConfig;
use crate::detector::BoundingBox;
use crate::error::EditError;
use crate::exporter::ExportOutcome;
use crate::jobs::{JobRunner, Progress};
use crate::metadata::{CutPlan, StyleProfile};
use crate::processor;
use crate::session::{format_timestamp, CutDetails, EditSession, PlanSummary};
use crate::video_processor::Rotation;

/// 服务共享状态
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Mutex<EditSession>>,
    pub runner: JobRunner,
    pub config: Arc<EditConfig>,
}

impl AppState {
    pub fn new(config: EditConfig) -> Self {
        Self {
            session: Arc::new(Mutex::new(EditSession::new())),
            runner: JobRunner::new(),
            config: Arc::new(config),
        }
    }
}

type HandlerResult<T> = Result<ResponseJson<T>, (StatusCode, String)>;

/// 错误映射：任务冲突 409，输入错误 400，处理失败 500
fn error_response(e: EditError) -> (StatusCode, String) {
    let status = match &e {
        EditError::Busy(_) => StatusCode::CONFLICT,
        e if e.is_input_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("❌ 请求处理失败: {}", e);
    }
    (status, e.to_string())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route("/progress", get(get_progress))
        .route("/reference/analyze", post(analyze_reference))
        .route("/reference/important-subjects", put(set_important_subjects))
        .route("/target/plan", post(plan_target))
        .route("/target/selection", post(select_subject).delete(clear_selection))
        .route("/cuts", get(list_cuts).post(add_cut))
        .route("/cuts/:index", delete(remove_cut))
        .route("/cuts/:index/details", get(cut_details))
        .route("/export", post(export))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// 健康检查
pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn get_progress(State(state): State<AppState>) -> ResponseJson<Progress> {
    ResponseJson(state.runner.progress())
}

#[derive(Debug, Deserialize)]
pub struct VideoRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub rotation: Rotation,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(flatten)]
    pub video: VideoRequest,
    pub use_object_detection: Option<bool>,
}

pub async fn analyze_reference(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> HandlerResult<StyleProfile> {
    info!("收到参考分析请求: {}", req.video.path.display());

    let mut config = (*state.config).clone();
    if let Some(flag) = req.use_object_detection {
        config.reference.use_object_detection = flag;
    }

    let profile = processor::analyze_reference_video(&state.runner, req.video.path, req.video.rotation, &config)
        .await
        .map_err(error_response)?;

    state.session.lock().await.set_reference(profile.clone());
    Ok(ResponseJson(profile))
}

#[derive(Debug, Deserialize)]
pub struct ImportantSubjectsRequest {
    #[serde(default)]
    pub subjects: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ImportantSubjectsResponse {
    pub important_subjects: Vec<String>,
}

pub async fn set_important_subjects(
    State(state): State<AppState>,
    Json(req): Json<ImportantSubjectsRequest>,
) -> HandlerResult<ImportantSubjectsResponse> {
    let important_subjects = state
        .session
        .lock()
        .await
        .set_important_subjects(req.subjects)
        .map_err(error_response)?;
    Ok(ResponseJson(ImportantSubjectsResponse { important_subjects }))
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    #[serde(flatten)]
    pub video: VideoRequest,
    pub object_priority: Option<f64>,
    pub density_factor: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: CutPlan,
    pub summary: PlanSummary,
}

pub async fn plan_target(State(state): State<AppState>, Json(req): Json<PlanRequest>) -> HandlerResult<PlanResponse> {
    info!("收到目标规划请求: {}", req.video.path.display());

    // 规划期间不持有会话锁
    let (profile, important, signature) = {
        let session = state.session.lock().await;
        let profile = session
            .reference()
            .cloned()
            .ok_or_else(|| error_response(EditError::MissingReference))?;
        (profile, session.important_subjects(), session.signature().cloned())
    };

    let mut config = (*state.config).clone();
    if let Some(priority) = req.object_priority {
        config.planner.object_priority = priority;
    }
    if let Some(factor) = req.density_factor {
        config.planner.density_factor = factor;
    }

    let path = req.video.path;
    let rotation = req.video.rotation;
    let plan = processor::plan_target_video(
        &state.runner,
        path.clone(),
        rotation,
        profile,
        important,
        signature,
        &config,
    )
    .await
    .map_err(error_response)?;

    let mut session = state.session.lock().await;
    session.set_target(path, rotation, plan.clone());
    let summary = session.plan_summary().map_err(error_response)?;
    Ok(ResponseJson(PlanResponse { plan, summary }))
}

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    /// 未指定时使用已规划的目标视频
    pub path: Option<PathBuf>,
    pub rotation: Option<Rotation>,
    #[serde(default)]
    pub frame_index: u64,
    pub bbox: BoundingBox,
}

#[derive(Debug, Serialize)]
pub struct SelectionResponse {
    pub class_label: String,
    pub confidence: f64,
    pub bbox: BoundingBox,
}

pub async fn select_subject(
    State(state): State<AppState>,
    Json(req): Json<SelectionRequest>,
) -> HandlerResult<SelectionResponse> {
    let (path, rotation) = match req.path {
        Some(path) => (path, req.rotation.unwrap_or_default()),
        None => {
            let session = state.session.lock().await;
            let (path, rotation) = session
                .target_source()
                .ok_or_else(|| error_response(EditError::MissingTarget))?;
            (path.to_path_buf(), req.rotation.unwrap_or(rotation))
        }
    };

    let signature = processor::select_subject(&state.runner, path, rotation, req.frame_index, req.bbox, &state.config)
        .await
        .map_err(error_response)?;

    let response = SelectionResponse {
        class_label: signature.class_label.clone(),
        confidence: signature.confidence,
        bbox: signature.bbox,
    };
    state.session.lock().await.set_signature(signature);
    Ok(ResponseJson(response))
}

#[derive(Debug, Serialize)]
pub struct ClearSelectionResponse {
    pub cleared: bool,
}

pub async fn clear_selection(State(state): State<AppState>) -> ResponseJson<ClearSelectionResponse> {
    let cleared = state.session.lock().await.clear_signature().is_some();
    ResponseJson(ClearSelectionResponse { cleared })
}

#[derive(Debug, Serialize)]
pub struct CutEntry {
    pub index: usize,
    pub time: f64,
    pub display: String,
}

#[derive(Debug, Serialize)]
pub struct CutsResponse {
    pub cuts: Vec<CutEntry>,
}

fn cuts_response(cuts: &[f64]) -> CutsResponse {
    CutsResponse {
        cuts: cuts
            .iter()
            .enumerate()
            .map(|(index, &time)| CutEntry {
                index,
                time,
                display: format_timestamp(time),
            })
            .collect(),
    }
}

pub async fn list_cuts(State(state): State<AppState>) -> ResponseJson<CutsResponse> {
    let session = state.session.lock().await;
    ResponseJson(cuts_response(session.cuts()))
}

#[derive(Debug, Deserialize)]
pub struct AddCutRequest {
    /// `分:秒` 或秒数
    pub time: String,
}

#[derive(Debug, Serialize)]
pub struct CutChangeResponse {
    pub index: usize,
    #[serde(flatten)]
    pub cuts: CutsResponse,
}

pub async fn add_cut(State(state): State<AppState>, Json(req): Json<AddCutRequest>) -> HandlerResult<CutChangeResponse> {
    let mut session = state.session.lock().await;
    let index = session.add_cut(&req.time).map_err(error_response)?;
    info!("已添加剪辑点: {}", format_timestamp(session.cuts()[index]));
    Ok(ResponseJson(CutChangeResponse {
        index,
        cuts: cuts_response(session.cuts()),
    }))
}

pub async fn remove_cut(State(state): State<AppState>, Path(index): Path<usize>) -> HandlerResult<CutChangeResponse> {
    let mut session = state.session.lock().await;
    session.remove_cut(index).map_err(error_response)?;
    info!("已移除剪辑点 {}", index + 1);
    Ok(ResponseJson(CutChangeResponse {
        index,
        cuts: cuts_response(session.cuts()),
    }))
}

pub async fn cut_details(State(state): State<AppState>, Path(index): Path<usize>) -> HandlerResult<CutDetails> {
    let session = state.session.lock().await;
    session.cut_details(index).map(ResponseJson).map_err(error_response)
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub output: PathBuf,
}

pub async fn export(State(state): State<AppState>, Json(req): Json<ExportRequest>) -> HandlerResult<ExportOutcome> {
    let (target, rotation, cuts) = {
        let session = state.session.lock().await;
        let (target, rotation) = session
            .target_source()
            .ok_or_else(|| error_response(EditError::MissingTarget))?;
        (target.to_path_buf(), rotation, session.cuts().to_vec())
    };

    info!("收到导出请求: {} 个剪辑点 → {}", cuts.len(), req.output.display());
    let outcome = processor::export_final_video(&state.runner, target, rotation, cuts, req.output, &state.config)
        .await
        .map_err(error_response)?;
    Ok(ResponseJson(outcome))
}
