use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, PairingStoreKind};
use crate::crypto::hybrid::HybridEncryptionManager;
use crate::crypto::session_keys::KeyExchangeManager;
use crate::error::Result;
use crate::repositories::memory_pairing::MemoryPairingStore;
use crate::repositories::pairing_store::PairingStore;
use crate::repositories::redis_pairing::RedisPairingStore;
use crate::scheduler::ScheduledTask;
use crate::services::audit::{AuditRecorder, AuditSink, TracingAuditSink};
use crate::services::compliance::ComplianceAuditEngine;
use crate::services::error_handler::SecureErrorHandler;
use crate::services::hub::{ConnectionHub, HubHandle, HubServices};
use crate::services::notifier::{LogNotifier, PairingNotifier, RedisNotifier};
use crate::services::pairing::PairingPool;

/// External collaborators the relay is wired to.
pub struct Backends {
    pub store: Arc<dyn PairingStore>,
    pub notifier: Arc<dyn PairingNotifier>,
    pub audit_sink: Arc<dyn AuditSink>,
    pub clock: SharedClock,
}

/// The application's state.
#[derive(Clone)]
pub struct AppState {
    /// The application's configuration.
    pub config: Config,
    /// Front of the connection hub actor.
    pub hub: HubHandle,
    pub pairing: Arc<PairingPool>,
    pub keys: Arc<KeyExchangeManager>,
    pub compliance: Arc<ComplianceAuditEngine>,
    pub hybrid: Arc<HybridEncryptionManager>,
    pub errors: Arc<SecureErrorHandler>,
    pub audit: AuditRecorder,
    pub clock: SharedClock,
    /// Cancelled on shutdown. Stops the hub, background tasks and connections.
    pub shutdown_token: CancellationToken,
}

impl AppState {
    /// Creates a new `AppState`.
    ///
    /// # Arguments
    ///
    /// * `config` - The application's configuration.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AppState`.
    pub async fn new(config: &Config) -> Result<Self> {
        let clock: SharedClock = Arc::new(SystemClock);

        let backends = match config.pairing_store {
            PairingStoreKind::Redis => {
                let redis_client = redis::Client::open(config.redis_url.as_str())?;
                let redis = ConnectionManager::new(redis_client).await?;
                tracing::info!("✅ Redis Connection Manager initialized (pairing store)");

                Backends {
                    store: Arc::new(RedisPairingStore::new(redis.clone(), clock.clone())),
                    notifier: Arc::new(RedisNotifier::new(redis)),
                    audit_sink: Arc::new(TracingAuditSink),
                    clock,
                }
            }
            PairingStoreKind::Memory => {
                tracing::warn!("⚠️ Using in-memory pairing store, pairing is not shared across instances");
                Backends {
                    store: Arc::new(MemoryPairingStore::new(clock.clone())),
                    notifier: Arc::new(LogNotifier),
                    audit_sink: Arc::new(TracingAuditSink),
                    clock,
                }
            }
        };

        Self::with_backends(config, backends, CancellationToken::new())
    }

    /// Wires every component around explicit backends.
    ///
    /// Must run inside a tokio runtime: the audit recorder and the hub actor
    /// are spawned here.
    pub fn with_backends(config: &Config, backends: Backends, shutdown_token: CancellationToken) -> Result<Self> {
        let Backends {
            store,
            notifier,
            audit_sink,
            clock,
        } = backends;

        let audit = AuditRecorder::spawn(
            audit_sink,
            config.compliance.audit_queue,
            shutdown_token.clone(),
        );
        tracing::info!("✅ Audit recorder initialized");

        let keys = Arc::new(KeyExchangeManager::new(&config.keys, clock.clone()));
        let compliance = Arc::new(ComplianceAuditEngine::new(
            config.compliance.clone(),
            audit.clone(),
            clock.clone(),
        )?);
        tracing::info!(rules = compliance.rules().len(), "✅ Compliance engine initialized");

        let hybrid = Arc::new(HybridEncryptionManager::new(
            config.audit_master_key.as_slice(),
            keys.clone(),
            compliance.clone(),
            clock.clone(),
        )?);
        let errors = Arc::new(SecureErrorHandler::new(
            config.detailed_errors,
            audit.clone(),
            clock.clone(),
        )?);

        let pairing = Arc::new(PairingPool::new(
            store,
            notifier,
            audit.clone(),
            config.pairing.clone(),
            clock.clone(),
        ));

        let hub = ConnectionHub::spawn(
            config.hub.clone(),
            HubServices {
                pairing: pairing.clone(),
                hybrid: hybrid.clone(),
                keys: keys.clone(),
                compliance: compliance.clone(),
                audit: audit.clone(),
                clock: clock.clone(),
            },
            shutdown_token.clone(),
        );

        Ok(AppState {
            config: config.clone(),
            hub,
            pairing,
            keys,
            compliance,
            hybrid,
            errors,
            audit,
            clock,
            shutdown_token,
        })
    }

    /// Starts key cleanup, the pairing sweep and the session inactivity sweep.
    pub fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let keys = self.keys.clone();
        let key_cleanup = ScheduledTask::new(
            "session_key_cleanup",
            self.config.keys.cleanup_interval,
            self.shutdown_token.clone(),
        )
        .start(move || {
            let keys = keys.clone();
            async move { Ok(keys.cleanup_expired_keys().await) }
        });

        let pairing = self.pairing.clone();
        let hub = self.hub.clone();
        let pairing_sweep = ScheduledTask::new(
            "pairing_sweep",
            self.config.pairing.sweep_interval,
            self.shutdown_token.clone(),
        )
        .start(move || {
            let pairing = pairing.clone();
            let hub = hub.clone();
            async move {
                let expired = pairing.sweep_expired().await?;
                hub.pairing_timed_out(&expired).await?;
                Ok(expired.len())
            }
        });

        let hub = self.hub.clone();
        let session_sweep = ScheduledTask::new(
            "session_inactivity_sweep",
            self.config.hub.check_interval,
            self.shutdown_token.clone(),
        )
        .start(move || {
            let hub = hub.clone();
            async move { hub.sweep_inactive().await }
        });

        vec![key_cleanup, pairing_sweep, session_sweep]
    }
}
