use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use relay_upload::{
    logging, AppConfig, Connectivity, EventKind, HttpStorageClient, UploadFile, UploadManager,
    UploadRequest,
};
use std::sync::Arc;
use tracing::{error, info, warn};

/// 默认配置文件路径
const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

fn cli() -> Command {
    Command::new("relay-upload")
        .version(env!("CARGO_PKG_VERSION"))
        .about("将本地文件上传到对象存储（大文件自动分片）")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("配置文件路径")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("origin")
                .short('o')
                .long("origin")
                .help("任务来源分组标签")
                .default_value("cli"),
        )
        .arg(
            Arg::new("header")
                .short('H')
                .long("header")
                .help("附加请求头（name:value），可重复")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("files")
                .help("要上传的文件")
                .required(true)
                .num_args(1..),
        )
}

/// 解析 name:value 形式的请求头
fn parse_header(raw: &str) -> anyhow::Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("无效的请求头: {}", raw))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);
    let origin = matches
        .get_one::<String>("origin")
        .cloned()
        .unwrap_or_else(|| "cli".to_string());
    let headers = matches
        .get_many::<String>("header")
        .unwrap_or_default()
        .map(|raw| parse_header(raw))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let files: Vec<String> = matches
        .get_many::<String>("files")
        .unwrap_or_default()
        .cloned()
        .collect();

    let config = AppConfig::load_or_default(config_path).await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&config.log);

    info!("Relay Upload v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(
        HttpStorageClient::new(&config.storage, config.upload.request_timeout_secs)
            .context("创建存储客户端失败")?,
    );
    let manager = UploadManager::from_config(&config.upload, storage, Connectivity::new(true));
    let mut events = manager.subscribe_all();

    let threshold = config.upload.multipart_threshold_bytes();
    let mut submitted = 0usize;

    for path in &files {
        let file = match UploadFile::open(path).await {
            Ok(file) => file,
            Err(e) => {
                error!("无法读取文件 {}: {}", path, e);
                continue;
            }
        };

        let id = format!("{}-{}", file.name, uuid::Uuid::new_v4());
        let multipart = file.size > threshold;
        let request = headers.iter().fold(
            UploadRequest::new(id, origin.as_str(), config.storage.upload_url(), file)
                .multipart(multipart),
            |request, (name, value)| request.with_header(name.as_str(), value.as_str()),
        );

        match manager.submit(request) {
            Ok(id) => {
                info!("已提交: {} (multipart={})", id, multipart);
                submitted += 1;
            }
            Err(e) => error!("提交失败 {}: {}", path, e),
        }
    }

    if submitted == 0 {
        anyhow::bail!("没有可上传的文件");
    }

    let mut failed = 0usize;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("收到中断信号，取消所有上传");
                manager.cancel_all(None);
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event.kind {
                    EventKind::Progress => {
                        info!("[{}] 进度 {}%", event.job.id, event.job.progress)
                    }
                    EventKind::Done => info!("[{}] ✓ 上传完成", event.job.id),
                    EventKind::Error => {
                        failed += 1;
                        error!(
                            "[{}] 上传失败: {}",
                            event.job.id,
                            event.job.error.as_deref().unwrap_or("未知错误")
                        );
                    }
                    EventKind::Aborted => {
                        failed += 1;
                        warn!("[{}] 已取消", event.job.id);
                    }
                    EventKind::Offline => warn!("[{}] 网络断开，等待恢复", event.job.id),
                    EventKind::Online => info!("[{}] 网络已恢复", event.job.id),
                    EventKind::Pending | EventKind::Prepare | EventKind::Start => {}
                }

                if event.kind.is_terminal() && manager.is_idle() {
                    break;
                }
            }
        }
    }

    let snapshot = manager.snapshot();
    info!(
        "上传结束: 成功={}, 失败={}, 取消={}",
        snapshot.done.len(),
        snapshot.error.len(),
        snapshot.abort.len()
    );

    if failed > 0 {
        anyhow::bail!("{} 个文件未上传成功", failed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_files_and_headers() {
        let matches = cli()
            .try_get_matches_from([
                "relay-upload",
                "-H",
                "authorization: Bearer t",
                "--origin",
                "batch",
                "a.mp4",
                "b.png",
            ])
            .unwrap();

        assert_eq!(matches.get_one::<String>("origin").unwrap(), "batch");
        assert_eq!(
            matches.get_one::<String>("config").unwrap(),
            DEFAULT_CONFIG_PATH
        );
        let files: Vec<&String> = matches.get_many::<String>("files").unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("authorization: Bearer t").unwrap(),
            ("authorization".to_string(), "Bearer t".to_string())
        );
        assert!(parse_header("invalid").is_err());
    }
}
