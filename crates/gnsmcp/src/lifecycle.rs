//! Startup and shutdown.
//!
//! Startup order: construct the GNS3 client disconnected, register every
//! service in the container, wrap the container (registrations are
//! immutable from then on), then start the background tasks — the auth
//! loop (which doubles as the token refresher) and the idle-session
//! sweeper. Shutdown cancels the tasks and closes every session, logging
//! final counts.

use std::sync::Arc;
use std::time::Duration;

use gns_client::Gns3Client;
use gns_config::Settings;
use gns_console::{ConsoleManager, ConsoleTunables};
use gns_registry::ServiceRegistry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::AppContext;
use crate::proxy_client::SshProxyClient;

/// Wire every service into the registry and build the context.
pub fn build_context(settings: Settings) -> Arc<AppContext> {
    let mut registry = ServiceRegistry::new();

    registry.register_instance(Gns3Client::new(settings.gns3.clone()));
    registry.register_instance(ConsoleManager::new(ConsoleTunables {
        buffer_cap: settings.session.buffer_cap_bytes,
        buffer_trim: settings.session.buffer_trim_bytes,
        page_lines: settings.session.page_lines,
        ..ConsoleTunables::default()
    }));
    registry.register_instance(SshProxyClient::new(settings.ssh_proxy_url.clone()));

    debug!(services = registry.len(), "service registry frozen");
    Arc::new(AppContext::new(Arc::new(registry), settings))
}

pub struct Background {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Spawn the background tasks. None of them block startup: the server is
/// responsive immediately and GNS3-backed tools report unreachable until
/// the auth loop succeeds.
pub fn start_background(ctx: &Arc<AppContext>) -> Background {
    let (shutdown, _) = watch::channel(false);
    let mut tasks = Vec::new();

    // GNS3 auth loop with backoff; re-authenticates ahead of token expiry.
    let client = ctx.registry.get::<Gns3Client>();
    tasks.push(tokio::spawn(client.run_auth_loop(shutdown.subscribe())));

    // Idle console sweeper. SSH sessions are swept by the proxy process.
    {
        let consoles = ctx.registry.get::<ConsoleManager>();
        let idle = Duration::from_secs(ctx.settings.session.idle_timeout_secs);
        let interval = Duration::from_secs(ctx.settings.session.sweep_interval_secs);
        let mut shutdown_rx = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let closed = consoles.sweep_idle(idle).await;
                if !closed.is_empty() {
                    info!(closed = closed.len(), "idle sweep closed console sessions");
                }
            }
        }));
    }

    info!(tasks = tasks.len(), "background tasks started");
    Background { shutdown, tasks }
}

/// Cancel background work and release every session.
pub async fn shutdown(ctx: &Arc<AppContext>, background: Background) {
    let _ = background.shutdown.send(true);
    for task in background.tasks {
        // Tasks respond to the shutdown signal within one sweep period;
        // abort is the backstop, not the mechanism.
        task.abort();
        let _ = task.await;
    }

    let consoles = ctx.registry.get::<ConsoleManager>();
    let console_sessions = consoles.disconnect_all().await;
    info!(console_sessions, "shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_context_registers_all_services() {
        let ctx = build_context(Settings::default());
        assert!(ctx.registry.contains::<Gns3Client>());
        assert!(ctx.registry.contains::<ConsoleManager>());
        assert!(ctx.registry.contains::<SshProxyClient>());
    }

    #[test]
    fn test_services_are_singletons() {
        let ctx = build_context(Settings::default());
        let a = ctx.registry.get::<ConsoleManager>();
        let b = ctx.registry.get::<ConsoleManager>();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_background_tasks_stop_on_shutdown() {
        let ctx = build_context(Settings::default());
        let background = start_background(&ctx);
        assert_eq!(background.tasks.len(), 2);
        // Must complete promptly; hanging here would mean a task ignored
        // the signal.
        tokio::time::timeout(Duration::from_secs(5), shutdown(&ctx, background))
            .await
            .expect("shutdown completes");
    }
}
