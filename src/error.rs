use std::path::PathBuf;
use thiserror::Error;

use crate::jobs::JobKind;

/// 操作结果类型
pub type EditResult<T> = Result<T, EditError>;

/// 剪辑流程中可能出现的错误
///
/// 输入错误在任何副作用之前返回；流水线错误来自解码、检测或编码过程。
#[derive(Debug, Error)]
pub enum EditError {
    #[error("无法打开视频文件: {path}: {source}")]
    VideoOpen {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("无法写入输出路径: {path}: {source}")]
    OutputNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("没有设定剪辑点")]
    NoCutPoints,

    #[error("无效的时间格式: {0}（请使用 分:秒 或 秒数）")]
    InvalidTime(String),

    #[error("时间点必须在 0 到 {duration:.2} 秒之间: {time:.2}")]
    TimeOutOfRange { time: f64, duration: f64 },

    #[error("剪辑点序号超出范围: {index}（共 {len} 个）")]
    CutIndexOutOfRange { index: usize, len: usize },

    #[error("请先分析参考视频")]
    MissingReference,

    #[error("请先规划目标视频")]
    MissingTarget,

    #[error("无效的目标选择区域: {0}")]
    InvalidSelection(String),

    #[error("已有任务正在运行: {0}")]
    Busy(JobKind),

    #[error("处理失败: {0:#}")]
    Pipeline(#[from] anyhow::Error),
}

impl EditError {
    /// 是否属于输入错误（由调用方参数导致）
    pub fn is_input_error(&self) -> bool {
        !matches!(self, Self::Busy(_) | Self::Pipeline(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(EditError::NoCutPoints.is_input_error());
        assert!(EditError::InvalidTime("abc".into()).is_input_error());
        assert!(!EditError::Busy(JobKind::Export).is_input_error());
        assert!(!EditError::Pipeline(anyhow::anyhow!("decoder failed")).is_input_error());
    }

    #[test]
    fn test_out_of_range_message() {
        let err = EditError::TimeOutOfRange { time: 120.0, duration: 90.0 };
        assert_eq!(err.to_string(), "时间点必须在 0 到 90.00 秒之间: 120.00");
    }
}
