use anyhow::Context;
use futures::future::try_join_all;
use gallery_uploader::{logging, AppConfig, BatchController, FileInput, FileStatus, HttpUploadApi};
use std::sync::Arc;
use tracing::{info, warn};

const CONFIG_PATH: &str = "config/app.toml";

fn usage() -> ! {
    eprintln!("用法: gallery-uploader <目标相册ID> <文件路径>...");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let destination = args.next().unwrap_or_else(|| usage());
    let paths: Vec<String> = args.collect();
    if paths.is_empty() {
        usage();
    }

    let config = AppConfig::load_or_default(CONFIG_PATH).await;
    let _log_guard = logging::init_logging(&config.log);

    info!("Gallery Uploader v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let api = Arc::new(HttpUploadApi::new(&config.remote).context("创建上传 API 客户端失败")?);
    let controller = BatchController::new(api, config.upload.clone())?;

    let files = try_join_all(paths.iter().map(|p| FileInput::from_path(p.as_str())))
        .await
        .context("读取待上传文件失败")?;

    let batch_id = match controller.create_batch(files, destination) {
        Ok(id) => id,
        Err(e) => {
            for name in e.rejected_names() {
                warn!("文件不符合上传要求: {}", name);
            }
            anyhow::bail!("批次被拒绝: {}", e);
        }
    };

    let mut subscription = controller.subscribe();
    let finished = loop {
        let Some(event) = subscription.recv().await else {
            anyhow::bail!("快照推送已关闭");
        };
        let Some(batch) = event
            .into_batches()
            .into_iter()
            .find(|b| b.id == batch_id)
        else {
            continue;
        };

        info!(
            "进度: {}/{} bytes, 完成 {}/{}, 失败 {}, 速度 {} B/s, 剩余 {:?}s",
            batch.uploaded_bytes,
            batch.total_bytes,
            batch.completed_files,
            batch.total_files,
            batch.failed_files,
            batch.average_speed,
            batch.eta_secs
        );
        if batch.is_finished() {
            break batch;
        }
    };

    for file in &finished.files {
        match file.status {
            FileStatus::Success => info!(
                "✓ {} -> {}",
                file.name,
                file.asset_id.as_deref().unwrap_or("-")
            ),
            _ => warn!(
                "✗ {} ({:?}): {}",
                file.name,
                file.status,
                file.last_error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("-")
            ),
        }
    }

    controller.shutdown();

    if finished.failed_files > 0 {
        anyhow::bail!("{} 个文件上传失败", finished.failed_files);
    }
    info!("批次 {} 上传完成", batch_id);
    Ok(())
}
