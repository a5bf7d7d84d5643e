use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use solitudes_search::config::Config;
use solitudes_search::core::Context;
use solitudes_search::storage::JsonStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "solitudes-search", version, about = "Full-text index maintenance for solitudes")]
struct Cli {
    /// 配置文件（缺省：<data_dir>/solitudes/config.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 记录文件，覆盖配置中的 records_path
    #[arg(long)]
    records: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 从记录源全量重建索引
    Rebuild,
    /// 输出当前文档数
    Count,
    /// 检索
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    if let Some(records) = cli.records {
        config.records_path = records;
    }

    let store = Arc::new(JsonStore::new(config.records_path.clone()));
    let ctx = Context::bootstrap(config, store)?;

    match cli.command {
        Command::Rebuild => {
            let report = ctx.rebuild_index()?;
            info!("\n{}", report);
        }
        Command::Count => {
            println!("{}", ctx.doc_count());
        }
        Command::Search { query, limit } => {
            let hits = ctx.search(&query, limit)?;
            for hit in hits.iter() {
                println!("{:>8.3}  {:<16} {}  {}", hit.score, hit.id, hit.title, hit.snippet);
            }
            info!("{} hits", hits.len());
        }
    }

    Ok(())
}
