//! 命令行定义（clap）
//!
//! - run：启动新任务
//! - confirm：回复挂起中的运行
//! - resume：从最新检查点继续
//! - batch：经内存队列与 worker 池执行多个任务

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Hive - 智能体编排运行时
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// 配置文件路径；未指定时读取 HIVE_CONFIG
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// 输出 debug 日志
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    pub fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var_os("HIVE_CONFIG").map(PathBuf::from))
    }
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// 启动新任务
    Run {
        /// 任务描述
        task: String,
    },

    /// 回复等待确认或补充参数的运行
    Confirm {
        run_id: String,
        /// 自由文本回复（如 yes）
        reply: String,
    },

    /// 崩溃后从最新检查点继续
    Resume { run_id: String },

    /// 经 worker 池执行多个任务，结束后逐行打印任务记录
    Batch {
        #[arg(required = true)]
        tasks: Vec<String>,
    },
}
