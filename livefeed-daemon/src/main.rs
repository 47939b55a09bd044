//! livefeed daemon: keeps a replica of an upstream push feed in memory.
//!
//! Reads its configuration from the environment (and `.env` if present),
//! subscribes with `livefeed-sync`, and logs every applied delta until
//! Ctrl-C.

mod activity;
mod settings;

use std::sync::Arc;

use log::{error, info};

use activity::ActivityLog;
use livefeed_sync::{ConnectionManager, Delta, Listener, ListenerRegistry, Replica};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = match settings::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    let replica = Replica::new();
    let listeners = ListenerRegistry::new();
    let activity = Arc::new(ActivityLog::new());
    let recorder = activity.clone();
    listeners.register("activity", move |delta: &Delta, replica: &Replica| {
        recorder.on_delta(delta, replica)
    });

    let manager = match ConnectionManager::http(config, replica.clone(), listeners) {
        Ok(manager) => manager,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(2);
        }
    };
    let handle = manager.handle();
    info!("livefeed daemon started, endpoint {}", manager.endpoint());

    let task = tokio::spawn(manager.run());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for Ctrl-C: {e}");
    }
    info!("shutting down");
    handle.shutdown();
    if let Err(e) = task.await {
        error!("connection task failed: {e}");
    }

    info!(
        "stopped after {} session(s), {} delta(s) applied; last update {}",
        handle.sessions(),
        activity.applied(),
        replica
            .last_update()
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
}
