use anyhow::Result;
use chrono::Local;
use rtspgate::http::{AppContext, Service};
use rtspgate::{MpegTsFactory, PgCameraRegistry, Registry, RetinaFactory};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    let config = rtspgate::config::get_setting();

    let env =
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, &config.log_level);
    env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.module_path().unwrap_or("<unnamed>"),
                &record.args()
            )
        })
        .init();

    let shutdown = CancellationToken::new();
    let cameras = PgCameraRegistry::new(&config.database_url())?;

    let ctx = Arc::new(AppContext {
        registry: Registry::new(),
        cameras: Arc::new(cameras),
        sessions: Arc::new(RetinaFactory),
        muxer: Arc::new(MpegTsFactory::new()),
        settings: config,
        shutdown: shutdown.clone(),
    });

    let server = tokio::spawn(Service::new(ctx.clone()).run());

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down...");
    shutdown.cancel();

    // Bounded drain: workers observe the token and release their run locks.
    match tokio::time::timeout(Duration::from_secs(5), server).await {
        Ok(result) => result??,
        Err(_) => log::warn!("Shutdown drain period elapsed, exiting"),
    }

    log::info!("Server exited properly");
    Ok(())
}
