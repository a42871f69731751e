//! Startup, background tasks, hot reload, and shutdown.
//!
//! Startup order: settings -> config store -> shared counters -> auth
//! keys -> snapshot restore (embedded mode) -> background tasks. On
//! shutdown the embedded profile writes a final encrypted snapshot after
//! in-flight requests drain.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use doorman_auth::hash_password;
use doorman_core::{ALL_GROUP, Group, Role, User};
use doorman_gateway::GatewayContext;
use doorman_store::{ConfigStore, ConfigStoreExt, Filter, SnapshotData, collections};

use crate::config::{BackendMode, Settings};
use crate::error::ServerError;

/// How often expired blacklist entries are purged.
const BLACKLIST_PURGE_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// How often the metrics rollup runs.
const ROLLUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Install the tracing subscriber: `RUST_LOG` or `info`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

/// Restore the most recent valid snapshot before accepting traffic
/// (embedded mode only).
pub async fn restore_snapshot(
    ctx: &GatewayContext,
    settings: &Settings,
    master_key: &doorman_crypto::MasterKey,
) -> Result<(), ServerError> {
    if settings.backend.mode != BackendMode::Mem {
        return Ok(());
    }
    match doorman_store::read_snapshot(&settings.snapshot.path, master_key) {
        Ok(Some(snapshot)) => {
            let collections_count = snapshot.collections.len();
            ctx.store
                .restore_all(snapshot.collections)
                .await
                .map_err(|e| ServerError::Config(format!("snapshot restore failed: {e}")))?;
            if let Some(metrics) = &snapshot.metrics {
                ctx.metrics.restore(metrics);
            }
            info!(
                path = %settings.snapshot.path.display(),
                collections = collections_count,
                created_at = %snapshot.created_at,
                "state restored from snapshot"
            );
            Ok(())
        }
        Ok(None) => {
            info!(path = %settings.snapshot.path.display(), "no snapshot found, starting fresh");
            Ok(())
        }
        Err(e) => Err(ServerError::Config(format!(
            "snapshot present but unreadable, refusing to discard state: {e}"
        ))),
    }
}

/// Write the encrypted snapshot of every collection plus the metrics ring.
pub async fn write_snapshot(
    ctx: &GatewayContext,
    settings: &Settings,
    master_key: &doorman_crypto::MasterKey,
) -> Result<(), ServerError> {
    if settings.backend.mode != BackendMode::Mem {
        return Ok(());
    }
    let collections = ctx
        .store
        .dump_all()
        .await
        .map_err(|e| ServerError::Config(format!("snapshot dump failed: {e}")))?;
    let data = SnapshotData::new(collections, Some(ctx.metrics.dump()));
    doorman_store::write_snapshot(&settings.snapshot.path, &data, master_key)
        .map_err(|e| ServerError::Config(format!("snapshot write failed: {e}")))?;
    info!(path = %settings.snapshot.path.display(), "snapshot written");
    Ok(())
}

/// First-start seeding for the embedded profile: the reserved admin role,
/// the `ALL` group, and the admin user from the configured credentials.
pub async fn seed_defaults(ctx: &GatewayContext, settings: &Settings) -> Result<(), ServerError> {
    let store = ctx.store.as_ref();

    if store
        .get_one::<Role>(collections::ROLES, &Filter::new().eq("role_name", "admin"))
        .await
        .is_err()
    {
        store
            .put_one(collections::ROLES, &Role::admin())
            .await
            .map_err(|e| ServerError::Config(format!("seeding admin role: {e}")))?;
        info!("seeded reserved admin role");
    }

    if store
        .get_one::<Group>(collections::GROUPS, &Filter::new().eq("group_name", ALL_GROUP))
        .await
        .is_err()
    {
        store
            .put_one(
                collections::GROUPS,
                &Group {
                    group_name: ALL_GROUP.to_owned(),
                    group_description: Some("Synthetic group granting every active API".to_owned()),
                    api_access: vec![],
                },
            )
            .await
            .map_err(|e| ServerError::Config(format!("seeding ALL group: {e}")))?;
        info!("seeded reserved ALL group");
    }

    if let (Some(email), Some(password)) = (&settings.admin.email, &settings.admin.password)
        && store
            .get_one::<User>(collections::USERS, &Filter::new().eq("username", "admin"))
            .await
            .is_err()
    {
        let admin = User {
            username: "admin".to_owned(),
            email: email.clone(),
            password_hash: hash_password(password)
                .map_err(|e| ServerError::Config(format!("hashing admin password: {e}")))?,
            role: "admin".to_owned(),
            groups: vec![ALL_GROUP.to_owned()],
            active: true,
            // The admin always keeps UI access and a password.
            ui_access: true,
            tier: None,
            rate_limit_enabled: false,
            rate_limit_duration: None,
            rate_limit_duration_type: None,
            throttle_enabled: false,
            throttle_duration: None,
            throttle_duration_type: None,
            throttle_wait_duration: None,
            throttle_wait_duration_type: None,
            throttle_queue_limit: None,
            created_at: Some(chrono::Utc::now()),
        };
        store
            .put_one(collections::USERS, &admin)
            .await
            .map_err(|e| ServerError::Config(format!("seeding admin user: {e}")))?;
        info!(email = %email, "seeded admin user");
    }

    Ok(())
}

/// Spawn the periodic background tasks onto `tracker`.
pub fn spawn_background(
    ctx: Arc<GatewayContext>,
    settings: Arc<Settings>,
    master_key: doorman_crypto::MasterKey,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    // Blacklist purge every 30 minutes.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(BLACKLIST_PURGE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match ctx.blacklist.purge_expired().await {
                            Ok(purged) if purged > 0 => {
                                info!(purged, "purged expired blacklist entries");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "blacklist purge failed"),
                        }
                    }
                }
            }
        });
    }

    // Metrics rollup every 5 minutes.
    {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(ROLLUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => ctx.metrics.rollup(),
                }
            }
        });
    }

    // Snapshot autosave (embedded mode only).
    if settings.backend.mode == BackendMode::Mem {
        let interval_secs = settings.snapshot.autosave_interval_secs.max(30);
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = write_snapshot(&ctx, &settings, &master_key).await {
                            warn!(error = %e, "snapshot autosave failed");
                        }
                    }
                }
            }
        });
    }
}

/// Hot-reload the runtime subset on SIGHUP: timeouts, rate-limit values,
/// circuit-breaker and retry parameters, feature flags. Structural
/// settings (secrets, bind address, worker count, backend mode) are
/// deliberately not touched.
#[cfg(unix)]
pub fn spawn_reload_handler(
    ctx: Arc<GatewayContext>,
    config_path: PathBuf,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    tracker.spawn(async move {
        let Ok(mut hangup) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        else {
            warn!("SIGHUP handler unavailable, hot reload disabled");
            return;
        };
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                signal = hangup.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    match Settings::load(&config_path) {
                        Ok(reloaded) => {
                            ctx.reload_config(reloaded.gateway_config());
                            info!("runtime config reloaded on SIGHUP");
                        }
                        Err(e) => error!(error = %e, "SIGHUP reload failed, keeping old config"),
                    }
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_reload_handler(
    _ctx: Arc<GatewayContext>,
    _config_path: PathBuf,
    _tracker: &TaskTracker,
    _cancel: CancellationToken,
) {
}

/// Resolve when the process receives a termination signal.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received, draining");
}

#[cfg(test)]
mod tests {
    use super::*;
    use doorman_gateway::GatewayConfig;
    use doorman_state_memory::MemorySharedStore;
    use doorman_store::MemoryConfigStore;

    fn master_key() -> doorman_crypto::MasterKey {
        doorman_crypto::parse_master_key(&"77".repeat(32)).unwrap()
    }

    fn context() -> Arc<GatewayContext> {
        Arc::new(GatewayContext::new(
            Arc::new(MemoryConfigStore::new()),
            Arc::new(MemorySharedStore::new()),
            master_key(),
            "lifecycle-test-secret",
            15,
            7,
            None,
            GatewayConfig::default(),
        ))
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let ctx = context();
        let mut settings = Settings::default();
        settings.admin.email = Some("admin@example.com".into());
        settings.admin.password = Some("pw".into());

        seed_defaults(&ctx, &settings).await.unwrap();
        seed_defaults(&ctx, &settings).await.unwrap();

        let roles: Vec<Role> = ctx
            .store
            .get_list(collections::ROLES, &Filter::new())
            .await
            .unwrap();
        assert_eq!(roles.len(), 1);
        let users: Vec<User> = ctx
            .store
            .get_list(collections::USERS, &Filter::new())
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].ui_access, "admin always keeps UI access");
    }

    #[tokio::test]
    async fn snapshot_roundtrip_through_lifecycle() {
        let dir = std::env::temp_dir().join(format!("doorman-lc-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut settings = Settings::default();
        settings.snapshot.path = dir.join("state.snapshot");
        settings.admin.email = Some("admin@example.com".into());
        settings.admin.password = Some("pw".into());

        let ctx = context();
        seed_defaults(&ctx, &settings).await.unwrap();
        write_snapshot(&ctx, &settings, &master_key()).await.unwrap();

        // A fresh context restores the same collections.
        let restored = context();
        restore_snapshot(&restored, &settings, &master_key())
            .await
            .unwrap();
        let users: Vec<User> = restored
            .store
            .get_list(collections::USERS, &Filter::new())
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].username, "admin");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn corrupt_snapshot_refuses_startup() {
        let dir = std::env::temp_dir().join(format!("doorman-lcx-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.snapshot");
        std::fs::write(&path, b"garbage-not-a-snapshot").unwrap();

        let mut settings = Settings::default();
        settings.snapshot.path = path;

        let ctx = context();
        assert!(restore_snapshot(&ctx, &settings, &master_key()).await.is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
