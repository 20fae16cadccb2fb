use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use video_style_cut::{
    config::{CliOverrides, ConfigLoader, ExtendedConfig},
    detector::BoundingBox,
    handler::{self, AppState},
    jobs::JobRunner,
    metadata::{CutPlan, StyleProfile},
    processor,
    session::{format_timestamp, EditSession},
    video_processor::Rotation,
};

/// 风格剪辑工具 - 学习参考视频的剪辑节奏，为目标视频规划剪辑点并导出
#[derive(Parser, Debug)]
#[command(name = "video-style-cut")]
#[command(about = "风格剪辑工具：分析参考视频、规划目标视频剪辑点、导出剪辑结果", long_about = None)]
struct Args {
    /// 配置文件路径（可选，支持 .ini 格式）
    /// 优先级：命令行参数 > 环境变量 > 配置文件 > 默认值
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别（trace, debug, info, warn, error）
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// 物体检测服务地址，未配置时不做物体检测
    /// 可通过环境变量 STYLE_CUT_DETECTOR_URL 或配置文件设置
    #[arg(long, global = true)]
    detector: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 分析参考视频，输出风格档案
    Analyze {
        /// 参考视频路径
        #[arg(short, long)]
        input: PathBuf,

        /// 旋转角度（0/90/180/270）
        #[arg(long, default_value = "0", value_parser = parse_rotation)]
        rotation: Rotation,

        /// 风格档案输出路径（JSON）
        #[arg(short, long, default_value = "style_profile.json")]
        output: PathBuf,

        /// 场景变化阈值（0-100），灰度差值超过 25 的像素占比超过该值判定为切换
        /// 可通过环境变量 STYLE_CUT_THRESHOLD 或配置文件设置
        #[arg(long)]
        threshold: Option<f64>,

        /// 跳过物体检测，只分析剪辑节奏
        #[arg(long)]
        no_detection: bool,
    },
    /// 按风格档案规划目标视频的剪辑点
    Plan {
        /// 风格档案路径（analyze 的输出）
        #[arg(short, long)]
        reference: PathBuf,

        /// 目标视频路径
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long, default_value = "0", value_parser = parse_rotation)]
        rotation: Rotation,

        /// 手动指定重要主体（逗号分隔），未指定时使用风格档案中的自动结果
        #[arg(long, value_delimiter = ',')]
        important: Vec<String>,

        /// 剪辑密度系数
        #[arg(long)]
        density_factor: Option<f64>,

        /// 目标优先级（0-1）
        #[arg(long)]
        object_priority: Option<f64>,

        /// 框选跟踪目标所在的帧索引
        #[arg(long, default_value_t = 0)]
        select_frame: u64,

        /// 框选区域 x1,y1,x2,y2
        #[arg(long, value_delimiter = ',', num_args = 4)]
        select_bbox: Option<Vec<f64>>,

        /// 剪辑规划输出路径（JSON）
        #[arg(short, long, default_value = "cut_plan.json")]
        output: PathBuf,
    },
    /// 按剪辑规划导出视频
    Export {
        /// 剪辑规划路径（plan 的输出）
        #[arg(short, long)]
        plan: PathBuf,

        /// 目标视频路径，默认使用规划中记录的路径
        #[arg(short, long)]
        input: Option<PathBuf>,

        #[arg(long, default_value = "0", value_parser = parse_rotation)]
        rotation: Rotation,

        /// 追加剪辑点（分:秒 或秒数），可重复
        #[arg(long)]
        add: Vec<String>,

        /// 删除剪辑点（从 1 开始的序号），可重复
        #[arg(long)]
        remove: Vec<usize>,

        /// 输出视频路径
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Web 服务模式：启动 HTTP 服务器
    Serve {
        /// 监听地址（默认 0.0.0.0:8080，可通过 STYLE_CUT_BIND 设置）
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// 生成默认配置文件
    InitConfig {
        #[arg(default_value = "style-cut.ini")]
        path: PathBuf,
    },
}

fn parse_rotation(value: &str) -> std::result::Result<Rotation, String> {
    let degrees: u32 = value.parse().map_err(|_| format!("无效的旋转角度: {}", value))?;
    Rotation::try_from(degrees)
}

fn init_logging(level: &str) {
    let level = tracing::Level::from_str(level).unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).with_context(|| format!("读取文件失败: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("解析 JSON 失败: {}", path.display()))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("序列化失败")?;
    std::fs::write(path, json).with_context(|| format!("写入文件失败: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { path } = &args.command {
        ConfigLoader::create_default_config(path)?;
        println!("已生成配置文件: {}", path.display());
        return Ok(());
    }

    let mut overrides = CliOverrides {
        detector_endpoint: args.detector.clone(),
        log_level: args.log_level.clone(),
        ..Default::default()
    };
    match &args.command {
        Commands::Analyze {
            threshold, no_detection, ..
        } => {
            overrides.threshold = *threshold;
            if *no_detection {
                overrides.use_object_detection = Some(false);
            }
        }
        Commands::Plan {
            density_factor,
            object_priority,
            ..
        } => {
            overrides.density_factor = *density_factor;
            overrides.object_priority = *object_priority;
        }
        Commands::Serve { bind } => overrides.bind = bind.clone(),
        _ => {}
    }

    let config = ConfigLoader::load_config(args.config.as_deref(), &overrides).context("加载配置失败")?;
    init_logging(&config.log_level);

    match args.command {
        Commands::Analyze {
            input,
            rotation,
            output,
            ..
        } => {
            let runner = JobRunner::new();
            let profile = processor::analyze_reference_video(&runner, input, rotation, &config.edit).await?;

            println!("剪辑点: {} 个", profile.cut_points.len());
            println!("平均片段时长: {:.2}秒", profile.avg_segment_duration);
            println!("剪辑密度: {:.2} 次/分钟", profile.cutting_density);
            if !profile.important_subjects.is_empty() {
                println!("重要主体: {}", profile.important_subjects.join(", "));
            }

            write_json(&output, &profile)?;
            println!("风格档案已保存: {}", output.display());
        }
        Commands::Plan {
            reference,
            input,
            rotation,
            important,
            select_frame,
            select_bbox,
            output,
            ..
        } => {
            let profile: StyleProfile = read_json(&reference)?;
            let runner = JobRunner::new();
            let mut session = EditSession::new();
            session.set_reference(profile.clone());
            if !important.is_empty() {
                session.set_important_subjects(important)?;
            }

            let signature = match select_bbox {
                Some(coords) => {
                    let bbox = BoundingBox::from([coords[0], coords[1], coords[2], coords[3]]);
                    let signature =
                        processor::select_subject(&runner, input.clone(), rotation, select_frame, bbox, &config.edit)
                            .await?;
                    println!("跟踪目标: {} (置信度 {:.2})", signature.class_label, signature.confidence);
                    Some(signature)
                }
                None => None,
            };

            let plan = processor::plan_target_video(
                &runner,
                input.clone(),
                rotation,
                profile,
                session.important_subjects(),
                signature,
                &config.edit,
            )
            .await?;
            session.set_target(input, rotation, plan.clone());

            let summary = session.plan_summary()?;
            for (label, count) in &summary.important_found {
                println!("  • {}: 出现 {} 次", label, count);
            }
            println!(
                "建议剪辑点: {} 个（目标 {} 个，{:.2} 次/分钟）",
                summary.suggested_cut_count, summary.target_cut_count, summary.cuts_per_minute
            );
            for (i, cut) in plan.cuts.iter().enumerate() {
                println!("  {}. {}", i + 1, format_timestamp(*cut));
            }

            write_json(&output, &plan)?;
            println!("剪辑规划已保存: {}", output.display());
        }
        Commands::Export {
            plan,
            input,
            rotation,
            add,
            remove,
            output,
        } => {
            let plan: CutPlan = read_json(&plan)?;
            let target = input.unwrap_or_else(|| PathBuf::from(&plan.source));

            let mut session = EditSession::new();
            session.set_target(target.clone(), rotation, plan);

            // 从大到小删除，保持其余序号不变
            let mut remove = remove;
            remove.sort_unstable_by(|a, b| b.cmp(a));
            remove.dedup();
            for number in remove {
                let removed = session.remove_cut_number(number)?;
                println!("已删除剪辑点: {}", format_timestamp(removed));
            }
            for time in &add {
                let index = session.add_cut(time)?;
                println!("已添加剪辑点: {}", format_timestamp(session.cuts()[index]));
            }

            let runner = JobRunner::new();
            let outcome =
                processor::export_final_video(&runner, target, rotation, session.cuts().to_vec(), output, &config.edit)
                    .await?;

            println!("导出完成: {}（{} 帧）", outcome.output.display(), outcome.frames_written);
            println!("{}", serde_json::to_string_pretty(&outcome.audio)?);
        }
        Commands::Serve { .. } => {
            start_web_server(config).await?;
        }
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

async fn start_web_server(config: ExtendedConfig) -> Result<()> {
    let bind = config.bind.clone();
    let app = handler::router(AppState::new(config.edit));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .context(format!("绑定地址失败: {}", bind))?;

    tracing::info!("Web 服务器启动在: http://{}", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    tracing::info!("可用端点:");
    tracing::info!("  • 健康检查: GET  http://{}/health", bind);
    tracing::info!("  • 任务进度: GET  http://{}/progress", bind);
    tracing::info!("  • 参考分析: POST http://{}/reference/analyze", bind);
    tracing::info!("  • 重要主体: PUT  http://{}/reference/important-subjects", bind);
    tracing::info!("  • 目标规划: POST http://{}/target/plan", bind);
    tracing::info!("  • 跟踪目标: POST|DELETE http://{}/target/selection", bind);
    tracing::info!("  • 剪辑点列表: GET|POST http://{}/cuts", bind);
    tracing::info!("  • 删除剪辑点: DELETE http://{}/cuts/<index>", bind);
    tracing::info!("  • 剪辑点详情: GET  http://{}/cuts/<index>/details", bind);
    tracing::info!("  • 导出视频: POST http://{}/export", bind);
    tracing::info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    axum::serve(listener, app).await.context("启动服务器失败")?;

    Ok(())
}
