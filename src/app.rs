//! Composition root: builds every component from one pool, one remote store and
//! one connectivity monitor, and hands out shared references.
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cascade::{OpenIssuesView, ResolutionCascade};
use crate::config::Config;
use crate::db::{self, Pool};
use crate::network::NetworkMonitor;
use crate::pending::PendingWriteStore;
use crate::pin::PinFreshnessGuard;
use crate::remote::{HttpRemoteStore, RemoteStore};
use crate::submission::SubmissionController;
use crate::sync::{spawn_sync_loop, RetryPolicy, SyncEngine, SyncSchedule};

/// Tunables the components need; derived from [`Config`] in production.
#[derive(Debug, Clone, Copy)]
pub struct CoreSettings {
    pub call_timeout: Duration,
    pub drain_timeout: Duration,
    pub retry: RetryPolicy,
    pub schedule: SyncSchedule,
}

impl CoreSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            call_timeout: cfg.remote.request_timeout(),
            drain_timeout: Duration::from_secs(cfg.sync.drain_timeout_secs),
            retry: RetryPolicy::from_settings(&cfg.sync),
            schedule: SyncSchedule::from_settings(&cfg.sync),
        }
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            schedule: SyncSchedule {
                startup_delay: Duration::from_secs(3),
                settle_delay: Duration::from_secs(2),
            },
        }
    }
}

#[derive(Clone)]
pub struct Core {
    pub store: PendingWriteStore,
    pub network: NetworkMonitor,
    pub remote: Arc<dyn RemoteStore>,
    pub engine: Arc<SyncEngine>,
    pub cascade: ResolutionCascade,
    pub controller: SubmissionController,
    pub settings: CoreSettings,
}

impl Core {
    pub fn new(
        pool: Pool,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
        settings: CoreSettings,
    ) -> Self {
        let store = PendingWriteStore::new(pool.clone());
        let cascade = ResolutionCascade::new(
            remote.clone(),
            pool,
            OpenIssuesView::default(),
            settings.retry,
            settings.call_timeout,
        );
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            settings.retry,
            settings.call_timeout,
            settings.drain_timeout,
        ));
        let controller = SubmissionController::new(
            store.clone(),
            remote.clone(),
            network.clone(),
            PinFreshnessGuard::new(remote.clone(), settings.call_timeout),
            cascade.clone(),
            settings.call_timeout,
        );
        Self {
            store,
            network,
            remote,
            engine,
            cascade,
            controller,
            settings,
        }
    }

    /// Open the configured database and HTTP remote store.
    pub async fn from_config(cfg: &Config, network: NetworkMonitor) -> Result<Self> {
        let pool = db::init_pool(&cfg.database_url()).await?;
        db::run_migrations(&pool).await?;
        let remote: Arc<dyn RemoteStore> = Arc::new(HttpRemoteStore::from_config(cfg)?);
        Ok(Self::new(pool, remote, network, CoreSettings::from_config(cfg)))
    }

    pub fn spawn_sync_loop(&self) -> JoinHandle<()> {
        spawn_sync_loop(
            self.engine.clone(),
            self.cascade.clone(),
            self.network.clone(),
            self.settings.schedule,
        )
    }
}
