use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EditError, EditResult};

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ReferenceAnalysis,
    TargetPlanning,
    SubjectSelection,
    Export,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReferenceAnalysis => "参考视频分析",
            Self::TargetPlanning => "目标视频规划",
            Self::SubjectSelection => "跟踪目标选择",
            Self::Export => "视频导出",
        };
        f.write_str(name)
    }
}

/// 当前进度快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub job: Option<JobKind>,
    pub running: bool,
    /// 0-100
    pub percent: f64,
    pub message: String,
}

/// 进度上报接口，实现不得阻塞或失败
pub trait ProgressSink {
    fn report(&self, percent: f64, message: &str);
}

/// 忽略所有进度
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _percent: f64, _message: &str) {}
}

/// 将进度写入任务通道
pub struct ProgressReporter {
    kind: JobKind,
    tx: Arc<watch::Sender<Progress>>,
}

impl ProgressSink for ProgressReporter {
    fn report(&self, percent: f64, message: &str) {
        self.tx.send_replace(Progress {
            job: Some(self.kind),
            running: true,
            percent: percent.clamp(0.0, 100.0),
            message: message.to_string(),
        });
    }
}

/// 任务结束（含失败与 panic）时释放运行槽位
struct SlotGuard {
    active: Arc<Mutex<Option<JobKind>>>,
    tx: Arc<watch::Sender<Progress>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
        self.tx.send_modify(|p| p.running = false);
    }
}

/// 已提交任务的句柄
pub struct JobHandle<T> {
    kind: JobKind,
    task: JoinHandle<EditResult<T>>,
}

impl<T> JobHandle<T> {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// 等待任务完成
    pub async fn wait(self) -> EditResult<T> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(EditError::Pipeline(anyhow::anyhow!("{}任务异常终止: {}", self.kind, e))),
        }
    }
}

/// 单任务执行器
///
/// 同一时间只允许运行一个任务，重复提交直接返回 `Busy`。
/// 进度通过 watch 通道发布，发送方从不阻塞。
#[derive(Clone)]
pub struct JobRunner {
    active: Arc<Mutex<Option<JobKind>>>,
    tx: Arc<watch::Sender<Progress>>,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRunner {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self {
            active: Arc::new(Mutex::new(None)),
            tx: Arc::new(tx),
        }
    }

    /// 正在运行的任务
    pub fn active(&self) -> Option<JobKind> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn progress(&self) -> Progress {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }

    /// 提交任务到阻塞线程池；已有任务运行时返回 `Busy`
    pub fn submit<T, F>(&self, kind: JobKind, job: F) -> EditResult<JobHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(&ProgressReporter) -> EditResult<T> + Send + 'static,
    {
        {
            let mut slot = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(running) = *slot {
                warn!("⚠️  [任务] {} 正在运行，拒绝提交 {}", running, kind);
                return Err(EditError::Busy(running));
            }
            *slot = Some(kind);
        }

        let guard = SlotGuard {
            active: self.active.clone(),
            tx: self.tx.clone(),
        };
        let reporter = ProgressReporter {
            kind,
            tx: self.tx.clone(),
        };
        reporter.report(0.0, "开始");
        debug!("[任务] 提交 {}", kind);

        let task = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            let result = job(&reporter);
            match &result {
                Ok(_) => reporter.report(100.0, "完成"),
                Err(e) => reporter.report(100.0, &format!("失败: {}", e)),
            }
            result
        });

        Ok(JobHandle { kind, task })
    }
}
