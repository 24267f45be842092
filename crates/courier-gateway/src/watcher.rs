//! Polling config watcher — re-reads the config file every 5 seconds and
//! hands changes to the orchestrator. A bad file keeps the previous config.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::config::{CourierConfig, RELOAD_POLL_SECS};

use crate::orchestrator::Orchestrator;

/// Applies a new log filter directive (wired to the subscriber's reload
/// handle in `main`).
pub type LogReloadFn = Arc<dyn Fn(&str) + Send + Sync>;

pub fn spawn_config_watcher(
    path: String,
    orchestrator: Arc<Orchestrator>,
    log_reload: Option<LogReloadFn>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(RELOAD_POLL_SECS));
        let mut last_hash = hash_file(&path);
        let mut current = orchestrator.config().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("config watcher stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let hash = hash_file(&path);
            if hash == last_hash {
                continue;
            }
            last_hash = hash;

            let new = match CourierConfig::load(Some(&path)) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(error = %e, "config reload failed, keeping previous configuration");
                    continue;
                }
            };
            if new == current {
                continue;
            }
            info!(path = %path, "configuration change detected");

            if new.gateway.log_level != current.gateway.log_level {
                if let Some(reload) = &log_reload {
                    info!(level = %new.gateway.log_level, "log level updated");
                    reload(&new.gateway.log_level);
                }
            }

            orchestrator.apply_config(new.clone()).await;
            current = new;
        }
    })
}

fn hash_file(path: &str) -> Option<[u8; 32]> {
    let bytes = std::fs::read(path).ok()?;
    Some(Sha256::digest(&bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("courier.toml");
        let path_str = path.to_str().unwrap().to_string();

        assert!(hash_file(&path_str).is_none());

        std::fs::write(&path, "a = 1").unwrap();
        let first = hash_file(&path_str);
        assert!(first.is_some());

        std::fs::write(&path, "a = 2").unwrap();
        let second = hash_file(&path_str);
        assert_ne!(first, second);

        std::fs::write(&path, "a = 1").unwrap();
        assert_eq!(hash_file(&path_str), first);
    }
}
