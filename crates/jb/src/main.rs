mod commands;
mod host;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use jb_core::{
    bridge::event_domain,
    config::Config,
    logging,
    messaging::{
        port::PlatformPort,
        throttled::{ThrottleConfig, ThrottledPlatform},
    },
    persistence::JsonFileStore,
    service::Automation,
};
use jb_ical::IcalFeedSource;
use tokio::{io::BufReader, sync::mpsc};
use tokio_util::sync::CancellationToken;

use crate::host::StdioPlatform;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("load configuration")?;
    let _log_guard = logging::init("jb", &cfg.data_dir)?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(host::write_outbound(out_rx, tokio::io::stdout()));

    let stdio = Arc::new(StdioPlatform::new(out_tx.clone(), cfg.host_query_timeout));
    let platform: Arc<dyn PlatformPort> =
        Arc::new(ThrottledPlatform::new(stdio.clone(), ThrottleConfig::default()));
    let store = Arc::new(
        JsonFileStore::open(&cfg.data_dir)
            .with_context(|| format!("open data dir {}", cfg.data_dir.display()))?,
    );
    let source = Arc::new(IcalFeedSource::new(cfg.feed_timeout)?);

    let (bridge, domain) = event_domain(cfg.domain_queue_capacity);
    let stop = CancellationToken::new();
    let domain_task = tokio::spawn(domain.run(stop.clone()));

    let automation = Arc::new(Automation::new(&cfg, platform, store, source, bridge));
    automation.start().await.context("start automation")?;

    let reader = tokio::spawn(host::read_inbound(
        BufReader::new(tokio::io::stdin()),
        stdio,
        automation.clone(),
        out_tx,
    ));

    tokio::select! {
        res = reader => match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "host connection failed"),
            Err(e) => tracing::error!(error = %e, "host reader panicked"),
        },
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    automation.shutdown().await;
    stop.cancel();
    let _ = domain_task.await;
    drop(automation);

    // Let queued responses drain; a reader still parked on stdin keeps a sender alive.
    if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
        tracing::warn!("host output did not drain before exit");
    }
    Ok(())
}
