//! TopHealth Crawler - Entry Point
//!
//! Loads proxies from a list file, crawls the configured seeds and writes page
//! records as JSON lines. Stops when the queue drains or on Ctrl+C/SIGTERM.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tophealth_crawler::config::{Config, LogConfig};
use tophealth_crawler::crawl::PageCrawler;
use tophealth_crawler::engine::Scheduler;
use tophealth_crawler::error::{CrawlError, Result};
use tophealth_crawler::proxy::{
    FileSupplier, HttpSession, ProxyHealthPool, ProxySupplier, ReplenishHandle, ReplenishService,
};
use tophealth_crawler::sink::{ChannelSink, JsonLinesWriter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting TopHealth crawler");

    let seeds = config.load_seeds().await?;
    if seeds.is_empty() {
        return Err(CrawlError::InvalidConfig(
            "no seeds configured (set CRAWL_SEEDS or CRAWL_SEED_FILE)".into(),
        ));
    }

    let pool = Arc::new(ProxyHealthPool::new(config.pool.clone()));

    // Start proxy replenishment
    let supplier: Arc<dyn ProxySupplier> =
        Arc::new(FileSupplier::new(config.supplier.proxy_file.clone()));
    let (replenish_handle, replenish_shutdown) = ReplenishHandle::new();
    let replenish_service =
        ReplenishService::new(pool.clone(), supplier, config.supplier.replenish.clone());
    let replenish_task = tokio::spawn(async move {
        replenish_service.run(replenish_shutdown).await;
    });

    // Start record output
    let (sink, records) = ChannelSink::new();
    let output: Box<dyn AsyncWrite + Send + Unpin> = if config.crawl.output == "-" {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(&config.crawl.output).await?)
    };
    let writer_task = tokio::spawn(async move {
        let mut writer = JsonLinesWriter::new(output);
        writer.run(records).await
    });

    let scheduler = Scheduler::new(
        config.engine.clone(),
        pool.clone(),
        HttpSession::new(config.http.clone()),
        Arc::new(sink),
    )?;

    let crawler = PageCrawler::new(config.crawl.settings.clone());
    for seed in &seeds {
        match crawler.seed(seed) {
            Ok(Some(task)) => {
                scheduler.enqueue(task);
            }
            Ok(None) => warn!("Duplicate seed skipped: {}", seed),
            Err(e) => warn!("Invalid seed {:?}: {}", seed, e),
        }
    }

    info!(
        seeds = scheduler.queue().len(),
        workers = config.engine.workers,
        proxy_file = %config.supplier.proxy_file.display(),
        "Crawler started"
    );

    let handle = scheduler.handle();
    let report = {
        let run = scheduler.run();
        tokio::pin!(run);

        tokio::select! {
            report = &mut run => report,
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                handle.shutdown();
                run.await
            }
        }
    };

    replenish_handle.shutdown();
    if let Err(e) = replenish_task.await {
        error!("Replenishment task failed: {}", e);
    }

    // Dropping the scheduler drops the last sink sender and ends the writer
    drop(scheduler);
    match writer_task.await {
        Ok(Ok(written)) => info!(records = written, "Output complete"),
        Ok(Err(e)) => error!("Failed to write records: {}", e),
        Err(e) => error!("Record writer failed: {}", e),
    }

    info!("{}", report);
    info!("TopHealth crawler stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("tophealth_crawler={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format == "pretty" {
        registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
