pub mod audio_muxer;
pub mod config;
pub mod cut_planner;
pub mod detector;
pub mod error;
pub mod exporter;
pub mod handler;
pub mod jobs;
pub mod metadata;
pub mod processor;
pub mod scene_detector;
pub mod session;
pub mod style_analyzer;
pub mod subject_matcher;
pub mod subject_tracker;
pub mod video_processor;

pub use config::{ConfigLoader, EditConfig, ExtendedConfig};
pub use error::{EditError, EditResult};
pub use jobs::{JobKind, JobRunner, Progress};
pub use metadata::{CutPlan, StyleProfile, SubjectTable};
pub use processor::{analyze_reference_video, export_final_video, plan_target_video, select_subject};
pub use scene_detector::SceneDetector;
pub use session::EditSession;
pub use video_processor::{Rotation, VideoReader};
