use std::time::Duration;

use anyhow::Result;
use conectada_core::command::page_loop;
use conectada_core::connectivity::ConnectivityProbe;
use conectada_core::queue::SyncRegistrar;
use conectada_core::AppEvent;
use tokio::sync::{broadcast, watch};

use crate::cli::app::{RuntimeContext, WatchArgs};

const DEFAULT_INTERVAL_MS: u64 = 5_000;

pub async fn run(ctx: &RuntimeContext, args: &WatchArgs) -> Result<()> {
    let app = &ctx.app;
    let configured = app.config.probe.as_ref();
    let url = args
        .probe_url
        .clone()
        .or_else(|| configured.map(|probe| probe.url.clone()))
        .unwrap_or_else(|| app.config.api_base.clone());
    let interval = args
        .interval_ms
        .map(|ms| Duration::from_millis(ms.max(1)))
        .or_else(|| configured.map(|probe| probe.interval()))
        .unwrap_or(Duration::from_millis(DEFAULT_INTERVAL_MS));

    let probe = ConnectivityProbe::new(ctx.transport.clone(), url.clone(), interval);
    let initial = probe.check_once().await;
    log::info!("watching {url} every {interval:?}; currently {initial:?}");

    // Registrations die with the process that made them; re-arm for work
    // left queued by earlier runs.
    if !app.queue.is_empty()? {
        ctx.worker.register_sync(&app.config.sync_tag)?;
    }

    let (client, bridge) = ctx.worker.register_client();
    let (sender, receiver) = watch::channel(initial);
    let mut events = app.events.subscribe();
    let probing = tokio::spawn(probe.run(sender));
    let page = tokio::spawn(page_loop(app.clone(), bridge, receiver));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let AppEvent::ConnectivityChanged { connectivity } = &event {
                        if connectivity.is_online() {
                            let fired = ctx.worker.fire_pending_syncs();
                            log::debug!("fired {fired} background syncs");
                        }
                    }
                    ctx.output.event(&event)?;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    // Dropping the client's channel ends the page loop once its drains finish.
    probing.abort();
    let _ = probing.await;
    ctx.worker.unregister_client(client);
    let _ = page.await;
    Ok(())
}
