use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// 单个主体（检测类别）的统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStats {
    pub label: String,
    /// 出现次数（每条检测记录计一次）
    pub occurrence_count: usize,
    /// 累计时长（保留字段，始终为 0）
    pub cumulative_duration: f64,
    /// 出现时间戳（秒，按时间顺序）
    pub timestamps: Vec<f64>,
}

/// 主体统计表，标签唯一，保持首次出现的顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<SubjectStats>", into = "Vec<SubjectStats>")]
pub struct SubjectTable {
    entries: Vec<SubjectStats>,
    index: HashMap<String, usize>,
}

impl SubjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次出现
    pub fn record(&mut self, label: &str, timestamp: f64) {
        match self.index.get(label) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                entry.occurrence_count += 1;
                entry.timestamps.push(timestamp);
            }
            None => {
                self.index.insert(label.to_string(), self.entries.len());
                self.entries.push(SubjectStats {
                    label: label.to_string(),
                    occurrence_count: 1,
                    cumulative_duration: 0.0,
                    timestamps: vec![timestamp],
                });
            }
        }
    }

    pub fn get(&self, label: &str) -> Option<&SubjectStats> {
        self.index.get(label).map(|&i| &self.entries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubjectStats> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 按出现次数降序取前 n 个标签，次数相同保持插入顺序
    pub fn top_labels(&self, n: usize) -> Vec<String> {
        let mut sorted: Vec<&SubjectStats> = self.entries.iter().collect();
        sorted.sort_by(|a, b| b.occurrence_count.cmp(&a.occurrence_count));
        sorted.into_iter().take(n).map(|s| s.label.clone()).collect()
    }

    /// 在 [start, end] 时间范围内出现过的标签（按插入顺序）
    pub fn labels_within(&self, start: f64, end: f64) -> Vec<String> {
        self.entries
            .iter()
            .filter(|s| s.timestamps.iter().any(|&t| start <= t && t <= end))
            .map(|s| s.label.clone())
            .collect()
    }

    /// 各主体的平均再出现间隔（秒），只统计出现超过一次的主体
    ///
    /// (最后时间戳 - 首次时间戳) / (次数 - 1)，不是实际在画面中的停留时长
    pub fn reoccurrence_intervals(&self) -> BTreeMap<String, f64> {
        self.entries
            .iter()
            .filter(|s| s.timestamps.len() > 1)
            .map(|s| {
                let first = s.timestamps[0];
                let last = s.timestamps[s.timestamps.len() - 1];
                let avg = (last - first) / (s.occurrence_count - 1) as f64;
                (s.label.clone(), avg)
            })
            .collect()
    }
}

impl From<Vec<SubjectStats>> for SubjectTable {
    fn from(entries: Vec<SubjectStats>) -> Self {
        let mut table = SubjectTable::new();
        for entry in entries {
            match table.index.get(&entry.label) {
                Some(&i) => {
                    let existing = &mut table.entries[i];
                    existing.occurrence_count += entry.occurrence_count;
                    existing.timestamps.extend(entry.timestamps);
                }
                None => {
                    table.index.insert(entry.label.clone(), table.entries.len());
                    table.entries.push(entry);
                }
            }
        }
        table
    }
}

impl From<SubjectTable> for Vec<SubjectStats> {
    fn from(table: SubjectTable) -> Self {
        table.entries
    }
}

/// 主体转场计数 (前一片段主体, 后一片段主体) → 次数
pub type TransitionCounts = BTreeMap<(String, String), usize>;

/// 转场计数序列化为 [{from, to, count}] 列表
mod transitions_serde {
    use super::TransitionCounts;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Entry {
        from: String,
        to: String,
        count: usize,
    }

    pub fn serialize<S: Serializer>(counts: &TransitionCounts, serializer: S) -> Result<S::Ok, S::Error> {
        let entries: Vec<Entry> = counts
            .iter()
            .map(|((from, to), &count)| Entry {
                from: from.clone(),
                to: to.clone(),
                count,
            })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TransitionCounts, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries.into_iter().map(|e| ((e.from, e.to), e.count)).collect())
    }
}

/// 参考视频的剪辑风格
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    /// 参考视频路径
    pub source: String,
    pub fps: f64,
    pub frame_count: u64,
    /// 视频总时长（秒）
    pub total_duration: f64,
    /// 剪辑点（帧索引，严格递增）
    pub cut_points: Vec<u64>,
    /// 各片段时长（秒）
    pub segment_durations: Vec<f64>,
    /// 平均片段时长（秒）
    pub avg_segment_duration: f64,
    /// 剪辑密度（每分钟剪辑次数）
    pub cutting_density: f64,
    /// 重要主体（按出现次数排序）
    pub important_subjects: Vec<String>,
    /// 主体平均再出现间隔（秒）
    pub subject_durations: BTreeMap<String, f64>,
    #[serde(with = "transitions_serde")]
    pub subject_transitions: TransitionCounts,
    /// 主体统计
    pub subjects: SubjectTable,
}

impl StyleProfile {
    /// 剪辑点时间（秒）
    pub fn cut_times(&self) -> Vec<f64> {
        if self.fps <= 0.0 {
            return Vec::new();
        }
        self.cut_points.iter().map(|&f| f as f64 / self.fps).collect()
    }
}

/// 目标视频中检测到的场景 [start, end)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub start_frame: u64,
    pub end_frame: u64,
    /// 场景内出现过的重要主体
    pub subjects: BTreeSet<String>,
}

/// 跟踪目标的一次出现区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Occurrence {
    pub start_frame: u64,
    pub end_frame: u64,
}

/// 目标视频的剪辑规划结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutPlan {
    /// 目标视频路径
    pub source: String,
    pub fps: f64,
    pub frame_count: u64,
    pub total_duration: f64,
    pub scenes: Vec<SceneRecord>,
    /// 跟踪目标的出现区间
    pub occurrences: Vec<Occurrence>,
    /// 跟踪目标命中的 track id
    pub tracked_ids: BTreeSet<i64>,
    /// 候选剪辑点（帧索引，已排序）
    pub candidates: Vec<u64>,
    pub target_cut_count: usize,
    pub density_factor: f64,
    pub object_priority: f64,
    /// 最终剪辑点（秒，升序）
    pub cuts: Vec<f64>,
    /// 目标视频主体统计
    pub subjects: SubjectTable,
}
