use anyhow::Result;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cut_planner::PlannerParams;
use crate::exporter::ExportParams;
use crate::style_analyzer::ReferenceParams;

/// 检测服务配置
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// 检测服务地址，未设置时不做物体检测
    pub endpoint: Option<String>,
    pub timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// 剪辑流程配置
#[derive(Debug, Clone, Default)]
pub struct EditConfig {
    pub reference: ReferenceParams,
    pub planner: PlannerParams,
    pub export: ExportParams,
    pub detector: DetectorConfig,
    /// Webhook URL（规划、导出完成后回调）
    pub webhook_url: Option<String>,
}

/// 扩展配置（包含日志与服务设置）
#[derive(Debug, Clone)]
pub struct ExtendedConfig {
    pub edit: EditConfig,
    /// 日志级别（trace, debug, info, warn, error）
    pub log_level: String,
    /// HTTP 服务监听地址
    pub bind: String,
}

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// 命令行覆盖项
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    /// 同时作用于参考分析和目标规划
    pub threshold: Option<f64>,
    pub density_factor: Option<f64>,
    pub object_priority: Option<f64>,
    pub use_object_detection: Option<bool>,
    pub detector_endpoint: Option<String>,
    pub webhook_url: Option<String>,
    pub log_level: Option<String>,
    pub bind: Option<String>,
}

/// 单个来源读到的配置项
#[derive(Debug, Clone, Default, PartialEq)]
struct Layer {
    ref_threshold: Option<f64>,
    ref_min_scene_seconds: Option<f64>,
    ref_detection_interval: Option<u64>,
    use_object_detection: Option<bool>,
    important_count: Option<usize>,
    target_threshold: Option<f64>,
    target_detection_interval: Option<u64>,
    similarity_threshold: Option<f64>,
    object_priority: Option<f64>,
    density_factor: Option<f64>,
    min_cut_interval: Option<f64>,
    confidence_threshold: Option<f64>,
    detector_endpoint: Option<String>,
    detector_timeout_secs: Option<u64>,
    bit_rate: Option<usize>,
    mux_audio: Option<bool>,
    webhook_url: Option<String>,
    log_level: Option<String>,
    bind: Option<String>,
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty(v: String) -> Option<String> {
    let v = v.trim().to_string();
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

impl Layer {
    /// 按字段合并，self 优先
    fn or(self, lower: Layer) -> Layer {
        Layer {
            ref_threshold: self.ref_threshold.or(lower.ref_threshold),
            ref_min_scene_seconds: self.ref_min_scene_seconds.or(lower.ref_min_scene_seconds),
            ref_detection_interval: self.ref_detection_interval.or(lower.ref_detection_interval),
            use_object_detection: self.use_object_detection.or(lower.use_object_detection),
            important_count: self.important_count.or(lower.important_count),
            target_threshold: self.target_threshold.or(lower.target_threshold),
            target_detection_interval: self.target_detection_interval.or(lower.target_detection_interval),
            similarity_threshold: self.similarity_threshold.or(lower.similarity_threshold),
            object_priority: self.object_priority.or(lower.object_priority),
            density_factor: self.density_factor.or(lower.density_factor),
            min_cut_interval: self.min_cut_interval.or(lower.min_cut_interval),
            confidence_threshold: self.confidence_threshold.or(lower.confidence_threshold),
            detector_endpoint: self.detector_endpoint.or(lower.detector_endpoint),
            detector_timeout_secs: self.detector_timeout_secs.or(lower.detector_timeout_secs),
            bit_rate: self.bit_rate.or(lower.bit_rate),
            mux_audio: self.mux_audio.or(lower.mux_audio),
            webhook_url: self.webhook_url.or(lower.webhook_url),
            log_level: self.log_level.or(lower.log_level),
            bind: self.bind.or(lower.bind),
        }
    }

    fn from_overrides(o: &CliOverrides) -> Layer {
        Layer {
            ref_threshold: o.threshold,
            target_threshold: o.threshold,
            density_factor: o.density_factor,
            object_priority: o.object_priority,
            use_object_detection: o.use_object_detection,
            detector_endpoint: o.detector_endpoint.clone(),
            webhook_url: o.webhook_url.clone(),
            log_level: o.log_level.clone(),
            bind: o.bind.clone(),
            ..Default::default()
        }
    }

    fn from_env_with(get: impl Fn(&str) -> Option<String>) -> Layer {
        let num = |key: &str| get(key).and_then(|v| v.trim().parse::<f64>().ok());
        let threshold = num("STYLE_CUT_THRESHOLD");
        Layer {
            ref_threshold: threshold,
            target_threshold: threshold,
            density_factor: num("STYLE_CUT_DENSITY_FACTOR"),
            object_priority: num("STYLE_CUT_OBJECT_PRIORITY"),
            use_object_detection: get("STYLE_CUT_USE_OBJECT_DETECTION").and_then(|v| parse_bool(&v)),
            detector_endpoint: get("STYLE_CUT_DETECTOR_URL").and_then(non_empty),
            detector_timeout_secs: get("STYLE_CUT_DETECTOR_TIMEOUT").and_then(|v| v.trim().parse().ok()),
            webhook_url: get("STYLE_CUT_WEBHOOK_URL").and_then(non_empty),
            log_level: get("STYLE_CUT_LOG_LEVEL").and_then(non_empty),
            bind: get("STYLE_CUT_BIND").and_then(non_empty),
            ..Default::default()
        }
    }

    fn from_ini(ini: &configparser::ini::Ini) -> Layer {
        let text = |section: &str, key: &str| ini.get(section, key).and_then(non_empty);
        let num = |section: &str, key: &str| text(section, key).and_then(|v| v.parse::<f64>().ok());
        let int = |section: &str, key: &str| text(section, key).and_then(|v| v.parse::<u64>().ok());
        let flag = |section: &str, key: &str| text(section, key).and_then(|v| parse_bool(&v));

        Layer {
            ref_threshold: num("reference", "threshold"),
            ref_min_scene_seconds: num("reference", "min_scene_seconds"),
            ref_detection_interval: int("reference", "detection_interval"),
            use_object_detection: flag("reference", "use_object_detection"),
            important_count: int("reference", "important_count").map(|v| v as usize),
            target_threshold: num("target", "threshold"),
            target_detection_interval: int("target", "detection_interval"),
            similarity_threshold: num("target", "similarity_threshold"),
            object_priority: num("target", "object_priority"),
            density_factor: num("target", "density_factor"),
            min_cut_interval: num("target", "min_cut_interval"),
            confidence_threshold: num("detector", "confidence_threshold"),
            detector_endpoint: text("detector", "endpoint"),
            detector_timeout_secs: int("detector", "timeout_secs"),
            bit_rate: int("export", "bit_rate").map(|v| v as usize),
            mux_audio: flag("export", "mux_audio"),
            webhook_url: text("notify", "webhook_url"),
            log_level: text("logging", "level"),
            bind: text("server", "bind"),
        }
    }

    fn resolve(self) -> ExtendedConfig {
        let reference_defaults = ReferenceParams::default();
        let planner_defaults = PlannerParams::default();
        let export_defaults = ExportParams::default();
        let detector_defaults = DetectorConfig::default();
        let confidence = self.confidence_threshold.unwrap_or(reference_defaults.confidence_threshold);

        ExtendedConfig {
            edit: EditConfig {
                reference: ReferenceParams {
                    threshold: self.ref_threshold.unwrap_or(reference_defaults.threshold),
                    min_scene_seconds: self.ref_min_scene_seconds.unwrap_or(reference_defaults.min_scene_seconds),
                    detection_interval: self.ref_detection_interval.unwrap_or(reference_defaults.detection_interval),
                    confidence_threshold: confidence,
                    use_object_detection: self.use_object_detection.unwrap_or(reference_defaults.use_object_detection),
                    important_count: self.important_count.unwrap_or(reference_defaults.important_count),
                },
                planner: PlannerParams {
                    threshold: self.target_threshold.unwrap_or(planner_defaults.threshold),
                    detection_interval: self.target_detection_interval.unwrap_or(planner_defaults.detection_interval),
                    confidence_threshold: confidence,
                    similarity_threshold: self.similarity_threshold.unwrap_or(planner_defaults.similarity_threshold),
                    object_priority: self.object_priority.unwrap_or(planner_defaults.object_priority),
                    density_factor: self.density_factor.unwrap_or(planner_defaults.density_factor),
                    min_cut_interval: self.min_cut_interval.unwrap_or(planner_defaults.min_cut_interval),
                    ..planner_defaults
                },
                export: ExportParams {
                    bit_rate: self.bit_rate.unwrap_or(export_defaults.bit_rate),
                    mux_audio: self.mux_audio.unwrap_or(export_defaults.mux_audio),
                },
                detector: DetectorConfig {
                    endpoint: self.detector_endpoint,
                    timeout: self
                        .detector_timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(detector_defaults.timeout),
                },
                webhook_url: self.webhook_url,
            },
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            bind: self.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
        }
    }
}

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从多个源加载配置，优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    pub fn load_config(config_file: Option<&Path>, overrides: &CliOverrides) -> Result<ExtendedConfig> {
        let file_layer = match config_file {
            // 显式指定的配置文件必须可读
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_from_default_locations().unwrap_or_default(),
        };
        let env_layer = Layer::from_env_with(|key| env::var(key).ok());

        Ok(Layer::from_overrides(overrides).or(env_layer).or(file_layer).resolve())
    }

    /// 从INI配置文件加载配置
    fn load_from_file(config_path: &Path) -> Result<Layer> {
        if !config_path.exists() {
            return Err(anyhow::anyhow!("配置文件不存在: {}", config_path.display()));
        }

        let mut config_parser = configparser::ini::Ini::new();
        config_parser
            .load(config_path)
            .map_err(|e| anyhow::anyhow!("读取配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(Layer::from_ini(&config_parser))
    }

    /// 默认位置：./style-cut.ini、./.style-cut.ini、~/.style-cut.ini、/etc/style-cut.ini
    fn default_locations() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("style-cut.ini"), PathBuf::from(".style-cut.ini")];
        if let Some(home) = env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".style-cut.ini"));
        }
        paths.push(PathBuf::from("/etc/style-cut.ini"));
        paths
    }

    fn load_from_default_locations() -> Result<Layer> {
        for path in Self::default_locations() {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }
        Err(anyhow::anyhow!("未找到配置文件"))
    }

    /// 创建默认配置文件
    pub fn create_default_config(config_path: &Path) -> Result<()> {
        let reference = ReferenceParams::default();
        let planner = PlannerParams::default();
        let export = ExportParams::default();
        let detector = DetectorConfig::default();

        let mut config_parser = configparser::ini::Ini::new();
        let mut set = |section: &str, key: &str, value: String| {
            config_parser.set(section, key, Some(value));
        };
        set("reference", "threshold", reference.threshold.to_string());
        set("reference", "min_scene_seconds", reference.min_scene_seconds.to_string());
        set("reference", "detection_interval", reference.detection_interval.to_string());
        set("reference", "use_object_detection", reference.use_object_detection.to_string());
        set("reference", "important_count", reference.important_count.to_string());
        set("target", "threshold", planner.threshold.to_string());
        set("target", "detection_interval", planner.detection_interval.to_string());
        set("target", "similarity_threshold", planner.similarity_threshold.to_string());
        set("target", "object_priority", planner.object_priority.to_string());
        set("target", "density_factor", planner.density_factor.to_string());
        set("target", "min_cut_interval", planner.min_cut_interval.to_string());
        set("detector", "endpoint", String::new());
        set("detector", "timeout_secs", detector.timeout.as_secs().to_string());
        set("detector", "confidence_threshold", reference.confidence_threshold.to_string());
        set("export", "bit_rate", export.bit_rate.to_string());
        set("export", "mux_audio", export.mux_audio.to_string());
        set("notify", "webhook_url", String::new());
        set("logging", "level", "info".to_string());
        set("server", "bind", DEFAULT_BIND.to_string());

        config_parser
            .write(config_path)
            .map_err(|e| anyhow::anyhow!("写入配置文件失败: {}: {}", config_path.display(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_ini(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("style-cut.ini");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generated.ini");
        ConfigLoader::create_default_config(&path).unwrap();

        let config = ConfigLoader::load_from_file(&path).unwrap().resolve();
        assert_eq!(config.edit.reference.threshold, 35.0);
        assert_eq!(config.edit.reference.detection_interval, 5);
        assert_eq!(config.edit.planner.detection_interval, 10);
        assert_eq!(config.edit.planner.density_factor, 1.0);
        assert_eq!(config.edit.detector.endpoint, None);
        assert_eq!(config.edit.webhook_url, None);
        assert_eq!(config.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(
            dir.path(),
            "[reference]\nuse_object_detection = false\nimportant_count = 3\n\
             [target]\ndensity_factor = 1.2\n\
             [detector]\nendpoint = http://localhost:9000/detect\nconfidence_threshold = 0.6\n\
             [logging]\nlevel = debug\n",
        );

        let config = ConfigLoader::load_config(Some(&path), &CliOverrides::default()).unwrap();
        assert!(!config.edit.reference.use_object_detection);
        assert_eq!(config.edit.reference.important_count, 3);
        assert_eq!(config.edit.planner.density_factor, 1.2);
        assert_eq!(config.edit.planner.confidence_threshold, 0.6);
        assert_eq!(config.edit.detector.endpoint.as_deref(), Some("http://localhost:9000/detect"));
    }

    #[test]
    fn test_priority_cli_over_env_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_ini(dir.path(), "[target]\ndensity_factor = 0.5\nobject_priority = 0.2\nthreshold = 40\n");
        let file = ConfigLoader::load_from_file(&path).unwrap();

        let env: HashMap<&str, &str> = [("STYLE_CUT_DENSITY_FACTOR", "0.8"), ("STYLE_CUT_OBJECT_PRIORITY", "0.9")]
            .into_iter()
            .collect();
        let env_layer = Layer::from_env_with(|k| env.get(k).map(|v| v.to_string()));

        let cli = CliOverrides {
            density_factor: Some(1.4),
            ..Default::default()
        };

        let config = Layer::from_overrides(&cli).or(env_layer).or(file).resolve();
        assert_eq!(config.edit.planner.density_factor, 1.4);
        assert_eq!(config.edit.planner.object_priority, 0.9);
        assert_eq!(config.edit.planner.threshold, 40.0);
        assert_eq!(config.edit.reference.threshold, 35.0);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.ini");
        assert!(ConfigLoader::load_config(Some(&missing), &CliOverrides::default()).is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("Yes"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
