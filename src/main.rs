use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use accesslog_rs::attendance::{AttendanceStore, Correlator, run_consumer};
use accesslog_rs::broker::{AmqpBroker, AmqpConsumer};
use accesslog_rs::common::signal::ShutdownSignal;
use accesslog_rs::device::{Backoff, DeviceSupervisor, FrameDecoder, HttpDeviceConnector};
use accesslog_rs::http_client::build_client;
use accesslog_rs::model::config::{BackoffConfig, BrokerConfig, Config};
use accesslog_rs::pipeline::{DeadLetterLog, EventQueue, Publisher};
use accesslog_rs::stats::StatsRegistry;

/// 统计日志输出间隔
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "accesslog-rs", version, about = "门禁事件采集与考勤关联")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = Config::default_config_path())]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 采集与关联在同一进程中运行（默认）
    Run,
    /// 只运行设备采集与发布
    Ingest,
    /// 只运行 broker 消费与考勤关联
    Correlate,
    /// 查看考勤记录
    Logs {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accesslog_rs=info,lapin=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Logs {
            user,
            limit,
            offset,
        } => print_logs(&config, user.as_deref(), limit, offset),
        command => serve(config, command).await,
    }
}

/// 运行长期任务直到 Ctrl-C 或 SIGTERM
async fn serve(config: Config, command: Command) -> anyhow::Result<()> {
    let (ingest, correlate) = match command {
        Command::Ingest => (true, false),
        Command::Correlate => (false, true),
        _ => (true, true),
    };
    config.validate(ingest)?;
    if let Some(path) = config.config_path() {
        tracing::info!(
            config = %path.display(),
            devices = config.devices.len(),
            queue = %config.broker.queue_name,
            "配置已加载"
        );
    }

    let shutdown = ShutdownSignal::install().context("注册退出信号失败")?;
    let stats = Arc::new(StatsRegistry::default());
    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();

    if ingest {
        spawn_ingest(&config, &stats, &cancel, &mut tasks)?;
    }
    if correlate {
        let offset = config.attendance.offset()?;
        let store = AttendanceStore::open(&config.attendance.database_path, offset).with_context(
            || {
                format!(
                    "打开考勤数据库失败: {}",
                    config.attendance.database_path.display()
                )
            },
        )?;
        let correlator = Arc::new(Correlator::new(Arc::new(store), stats.correlator.clone()));
        tasks.spawn(correlate_loop(
            config.broker.clone(),
            config.backoff.clone(),
            correlator,
            cancel.clone(),
        ));
    }
    tasks.spawn(report_stats(stats.clone(), cancel.clone()));

    let signal = shutdown.recv().await;
    tracing::info!(signal, "收到退出信号，正在停止");
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("任务异常退出: {}", e);
        }
    }
    stats.report();
    tracing::info!("已退出");
    Ok(())
}

/// 每台设备一个监督任务，共用一个有界队列和一个发布器
fn spawn_ingest(
    config: &Config,
    stats: &Arc<StatsRegistry>,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> anyhow::Result<()> {
    let offset = config.attendance.offset()?;
    let client = build_client(config.stream.connect_timeout())?;
    let (sender, receiver) = EventQueue::bounded(config.queue.capacity);

    for device in &config.devices {
        let connector =
            HttpDeviceConnector::new(client.clone(), device.clone(), config.stream.max_buffer_bytes);
        let supervisor = DeviceSupervisor::new(
            device.id.clone(),
            connector,
            FrameDecoder::for_device(device, offset),
            sender.clone(),
            Backoff::from_config(&config.backoff),
            stats.device(&device.id),
        );
        tracing::info!(
            device = %supervisor.device_id(),
            address = %device.address,
            role = %device.role,
            "启动设备任务"
        );
        tasks.spawn(supervisor.run(cancel.clone()));
    }
    drop(sender);

    let publisher = Publisher::new(
        AmqpBroker::new(config.broker.clone()),
        DeadLetterLog::new(config.broker.dead_letter_path.clone()),
        &config.publisher,
        stats.publisher.clone(),
    );
    tasks.spawn(publisher.run(receiver, cancel.clone()));
    Ok(())
}

/// 消费 broker，连接断开后按退避重连
async fn correlate_loop(
    broker: BrokerConfig,
    backoff: BackoffConfig,
    correlator: Arc<Correlator>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::from_config(&backoff);

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => break,
            result = AmqpConsumer::connect(&broker) => result,
        };

        match connected {
            Ok(consumer) => {
                let started = Instant::now();
                let result = run_consumer(correlator.clone(), consumer, cancel.clone()).await;
                backoff.record_session(started.elapsed());
                match result {
                    Ok(()) => break,
                    Err(e) => tracing::warn!("消费中断: {:#}", e),
                }
            }
            Err(e) => tracing::warn!("连接 broker 失败: {:#}", e),
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::info!("考勤关联已停止");
}

async fn report_stats(stats: Arc<StatsRegistry>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => stats.report(),
        }
    }
}

fn print_logs(config: &Config, user: Option<&str>, limit: u32, offset: u32) -> anyhow::Result<()> {
    let store = AttendanceStore::open(&config.attendance.database_path, config.attendance.offset()?)
        .with_context(|| {
            format!(
                "打开考勤数据库失败: {}",
                config.attendance.database_path.display()
            )
        })?;

    let rows = store.list(user, limit, offset)?;
    if rows.is_empty() {
        println!("没有记录");
        return Ok(());
    }

    let format_time = |time: Option<chrono::DateTime<chrono::FixedOffset>>| {
        time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };
    println!("{:>8}  {:<16}  {:<19}  {:<19}", "id", "user_id", "enter", "exit");
    for row in rows {
        println!(
            "{:>8}  {:<16}  {:<19}  {:<19}",
            row.id,
            row.user_id,
            format_time(row.enter_time),
            format_time(row.exit_time)
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_defaults() {
        Cli::command().debug_assert();

        let cli = Cli::parse_from(["accesslog-rs"]);
        assert_eq!(cli.config, PathBuf::from(Config::default_config_path()));
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["accesslog-rs", "-c", "other.json", "logs", "--user", "7"]);
        assert_eq!(cli.config, PathBuf::from("other.json"));
        assert!(matches!(
            cli.command,
            Some(Command::Logs { user: Some(ref u), limit: 50, offset: 0 }) if u == "7"
        ));
    }
}
