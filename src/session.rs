use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::error::{EditError, EditResult};
use crate::metadata::{CutPlan, StyleProfile};
use crate::subject_matcher::TargetSubjectSignature;
use crate::video_processor::Rotation;

/// 剪辑点附近的时间窗口（秒）
pub const DETAIL_WINDOW_SECS: f64 = 1.0;

/// 解析时间输入：`分:秒`（整数）或秒数
pub fn parse_time(input: &str) -> EditResult<f64> {
    let trimmed = input.trim();
    let invalid = || EditError::InvalidTime(input.to_string());

    let value = match trimmed.split_once(':') {
        Some((mins, secs)) => {
            let mins: u64 = mins.trim().parse().map_err(|_| invalid())?;
            let secs: u64 = secs.trim().parse().map_err(|_| invalid())?;
            (mins * 60 + secs) as f64
        }
        None => trimmed.parse::<f64>().map_err(|_| invalid())?,
    };

    if !value.is_finite() {
        return Err(invalid());
    }
    Ok(value)
}

/// 格式化为 `mm:ss.cc`
pub fn format_timestamp(secs: f64) -> String {
    let secs = secs.max(0.0);
    let mins = (secs / 60.0) as u64;
    let whole = (secs % 60.0) as u64;
    let centis = ((secs - secs.trunc()) * 100.0) as u64;
    format!("{:02}:{:02}.{:02}", mins, whole, centis)
}

/// 剪辑点附近出现的主体
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbySubject {
    pub label: String,
    pub count: usize,
    pub important: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CutDetails {
    /// 从 1 开始的序号
    pub number: usize,
    pub time: f64,
    pub display: String,
    /// 在目标视频中的位置（百分比）
    pub position_percent: f64,
    pub nearby: Vec<NearbySubject>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    /// 目标视频中出现的重要主体及次数
    pub important_found: Vec<(String, usize)>,
    pub suggested_cut_count: usize,
    pub target_cut_count: usize,
    pub cuts_per_minute: f64,
    pub total_duration: f64,
}

/// 已规划的目标视频
#[derive(Debug, Clone)]
struct TargetState {
    path: PathBuf,
    rotation: Rotation,
    plan: CutPlan,
}

/// 剪辑会话状态：参考风格、目标规划、重要主体设置、跟踪目标和最终剪辑点
///
/// 所有修改操作在出错时不改变状态。
#[derive(Debug, Default)]
pub struct EditSession {
    reference: Option<StyleProfile>,
    important_override: Option<Vec<String>>,
    target: Option<TargetState>,
    signature: Option<TargetSubjectSignature>,
    final_cuts: Vec<f64>,
}

impl EditSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// 替换参考风格，同时恢复自动重要主体
    pub fn set_reference(&mut self, profile: StyleProfile) {
        self.reference = Some(profile);
        self.important_override = None;
    }

    pub fn reference(&self) -> Option<&StyleProfile> {
        self.reference.as_ref()
    }

    /// 当前生效的重要主体
    pub fn important_subjects(&self) -> Vec<String> {
        match (&self.important_override, &self.reference) {
            (Some(list), _) => list.clone(),
            (None, Some(profile)) => profile.important_subjects.clone(),
            (None, None) => Vec::new(),
        }
    }

    /// 手动设置重要主体；传入空列表恢复自动选择的前 5 个
    pub fn set_important_subjects(&mut self, subjects: Vec<String>) -> EditResult<Vec<String>> {
        if self.reference.is_none() {
            return Err(EditError::MissingReference);
        }

        let mut unique: Vec<String> = Vec::with_capacity(subjects.len());
        for s in subjects {
            let s = s.trim().to_string();
            if !s.is_empty() && !unique.contains(&s) {
                unique.push(s);
            }
        }
        self.important_override = if unique.is_empty() { None } else { Some(unique) };
        Ok(self.important_subjects())
    }

    /// 替换目标规划结果，最终剪辑点重置为建议剪辑点
    pub fn set_target(&mut self, path: impl Into<PathBuf>, rotation: Rotation, plan: CutPlan) {
        self.final_cuts = plan.cuts.clone();
        self.target = Some(TargetState {
            path: path.into(),
            rotation,
            plan,
        });
    }

    pub fn target(&self) -> Option<&CutPlan> {
        self.target.as_ref().map(|t| &t.plan)
    }

    pub fn target_source(&self) -> Option<(&Path, Rotation)> {
        self.target.as_ref().map(|t| (t.path.as_path(), t.rotation))
    }

    fn target_plan(&self) -> EditResult<&CutPlan> {
        self.target().ok_or(EditError::MissingTarget)
    }

    pub fn set_signature(&mut self, signature: TargetSubjectSignature) {
        self.signature = Some(signature);
    }

    pub fn clear_signature(&mut self) -> Option<TargetSubjectSignature> {
        self.signature.take()
    }

    pub fn signature(&self) -> Option<&TargetSubjectSignature> {
        self.signature.as_ref()
    }

    pub fn cuts(&self) -> &[f64] {
        &self.final_cuts
    }

    /// 添加剪辑点，返回插入位置；已存在相同时间点时不重复添加
    pub fn add_cut(&mut self, input: &str) -> EditResult<usize> {
        let duration = self.target_plan()?.total_duration;
        let time = parse_time(input)?;
        if time < 0.0 || time > duration {
            return Err(EditError::TimeOutOfRange { time, duration });
        }

        let index = self.final_cuts.partition_point(|&c| c < time);
        if self.final_cuts.get(index) != Some(&time) {
            self.final_cuts.insert(index, time);
        }
        Ok(index)
    }

    /// 删除指定序号（从 0 开始）的剪辑点
    pub fn remove_cut(&mut self, index: usize) -> EditResult<f64> {
        if index >= self.final_cuts.len() {
            return Err(EditError::CutIndexOutOfRange {
                index,
                len: self.final_cuts.len(),
            });
        }
        Ok(self.final_cuts.remove(index))
    }

    /// 按显示序号（从 1 开始）删除剪辑点
    pub fn remove_cut_number(&mut self, number: usize) -> EditResult<f64> {
        match number.checked_sub(1) {
            Some(index) => self.remove_cut(index),
            None => Err(EditError::CutIndexOutOfRange {
                index: number,
                len: self.final_cuts.len(),
            }),
        }
    }

    /// 剪辑点详情：前后 1 秒内检测到的目标视频主体
    pub fn cut_details(&self, index: usize) -> EditResult<CutDetails> {
        let plan = self.target_plan()?;
        let time = *self.final_cuts.get(index).ok_or(EditError::CutIndexOutOfRange {
            index,
            len: self.final_cuts.len(),
        })?;
        let important = self.important_subjects();

        let mut nearby: Vec<NearbySubject> = plan
            .subjects
            .iter()
            .filter_map(|stats| {
                let count = stats
                    .timestamps
                    .iter()
                    .filter(|&&t| (t - time).abs() <= DETAIL_WINDOW_SECS)
                    .count();
                (count > 0).then(|| NearbySubject {
                    label: stats.label.clone(),
                    count,
                    important: important.contains(&stats.label),
                })
            })
            .collect();
        nearby.sort_by(|a, b| b.count.cmp(&a.count));

        let position_percent = if plan.total_duration > 0.0 {
            time / plan.total_duration * 100.0
        } else {
            0.0
        };

        Ok(CutDetails {
            number: index + 1,
            time,
            display: format_timestamp(time),
            position_percent,
            nearby,
        })
    }

    /// 目标规划摘要
    pub fn plan_summary(&self) -> EditResult<PlanSummary> {
        let plan = self.target_plan()?;
        let important_found = self
            .important_subjects()
            .into_iter()
            .filter_map(|label| plan.subjects.get(&label).map(|s| (label.clone(), s.occurrence_count)))
            .collect();
        let cuts_per_minute = if plan.total_duration > 0.0 {
            plan.cuts.len() as f64 / (plan.total_duration / 60.0)
        } else {
            0.0
        };

        Ok(PlanSummary {
            important_found,
            suggested_cut_count: plan.cuts.len(),
            target_cut_count: plan.target_cut_count,
            cuts_per_minute,
            total_duration: plan.total_duration,
        })
    }
}
