//! Startup and shutdown of the whole audio stack.
//!
//! Order matters: storage is opened and tidied before the node exists, the
//! reactor listens before any room is restored, and the idle sweep starts
//! last. A node that cannot be brought up leaves the subsystem running with
//! audio reported as unavailable.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::idle::{IdleTimer, PresenceSource};
use crate::node::{ConnectParams, NodeSession, WsConnector};
use crate::player::{PlayerHost, QueryResolver};
use crate::reactor::{Notifier, Reactor, ReactorPolicy};
use crate::settings::{RoomSettings, RoomSettingsStore};
use crate::storage::{Database, LocalCache, PersistentQueue};
use crate::supervisor::{HttpDownloader, NodeState, NodeStatus, NodeSupervisor, SupervisorSettings};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct AudioSubsystem {
    db: Database,
    supervisor: Arc<NodeSupervisor>,
    host: Arc<PlayerHost>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AudioSubsystem {
    pub async fn start(
        config: &Config,
        notifier: Arc<dyn Notifier>,
        presence: Arc<dyn PresenceSource>,
    ) -> Result<Self> {
        info!("🎵 Iniciando subsistema de audio");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        // Almacenamiento
        let db = Database::open(&config.database_path(), config.storage_workers)
            .await
            .context("opening audio database")?;
        let cache = Arc::new(LocalCache::new(
            &db,
            clock.clone(),
            config.cache_max_age(),
            config.cache_level,
        ));
        cache.evict_expired().await;

        let persist = PersistentQueue::new(&db, clock.clone());
        persist.reap().await;

        let settings = Arc::new(
            RoomSettingsStore::new(config.data_dir.clone(), RoomSettings::from_config(config))
                .await
                .context("loading room settings")?,
        );

        // Nodo
        let downloader = HttpDownloader::new(config.node_download_url.clone())
            .context("building download client")?;
        let supervisor = Arc::new(NodeSupervisor::new(
            SupervisorSettings::from_config(config),
            Arc::new(downloader),
        ));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let host = Arc::new(PlayerHost::new(
            QueryResolver::new(cache),
            persist,
            settings,
            supervisor.status(),
            events_tx.clone(),
            clock,
            config.autoplay_fallback.clone(),
        ));

        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let reactor = Reactor::new(host.clone(), notifier, ReactorPolicy::from_config(config));
        tasks.push(tokio::spawn(reactor.run(events_rx, shutdown.child_token())));

        let connector = WsConnector::new(events_tx);
        let params = ConnectParams {
            host: config.node_host.clone(),
            password: config.node_password.clone(),
            rest_port: config.node_rest_port,
            ws_port: config.node_ws_port,
            timeout: config.connect_timeout(),
            user_id: config.bot_user_id,
        };

        match bring_up(&supervisor, &connector, &params).await {
            Some(session) => {
                host.attach_node(session.client.clone());
                tasks.push(tokio::spawn(keep_session(
                    supervisor.clone(),
                    host.clone(),
                    connector,
                    params,
                    session,
                    shutdown.child_token(),
                )));

                let pending = host.persist().fetch_pending().await;
                if !pending.is_empty() {
                    let restored = host.restore(pending).await;
                    info!("♻️ {} pistas restauradas tras el reinicio", restored);
                }
            }
            None => warn!("🔇 Audio no disponible en esta sesión"),
        }

        let idle = IdleTimer::new(host.clone(), presence);
        tasks.push(tokio::spawn(idle.run(shutdown.child_token())));

        info!("✅ Subsistema de audio listo");
        Ok(Self {
            db,
            supervisor,
            host,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// The handle the command layer talks to.
    pub fn host(&self) -> Arc<PlayerHost> {
        self.host.clone()
    }

    pub fn status(&self) -> watch::Receiver<NodeStatus> {
        self.supervisor.status()
    }

    pub async fn shutdown(&self) {
        info!("⚠️ Deteniendo subsistema de audio...");
        self.shutdown.cancel();
        self.host.detach_node();
        self.supervisor.shutdown().await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Tarea de audio terminó con error: {}", e);
            }
        }
        self.db.close().await;
        info!("👋 Subsistema de audio detenido");
    }
}

async fn bring_up(
    supervisor: &NodeSupervisor,
    connector: &WsConnector,
    params: &ConnectParams,
) -> Option<NodeSession> {
    if let Err(e) = supervisor.start().await {
        error!("❌ No se pudo iniciar el nodo: {}", e);
        return None;
    }
    match supervisor.connect(connector, params).await {
        Ok(session) => Some(session),
        Err(e) => {
            error!("❌ No se pudo conectar al nodo: {}", e);
            None
        }
    }
}

/// Re-establishes the node session whenever its event stream drops, for as
/// long as the supervisor has not given up.
async fn keep_session(
    supervisor: Arc<NodeSupervisor>,
    host: Arc<PlayerHost>,
    connector: WsConnector,
    params: ConnectParams,
    mut session: NodeSession,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                session.lifeline.cancel();
                return;
            }
            _ = session.lifeline.cancelled() => {}
        }

        host.detach_node();
        warn!("🔌 Sesión {} con el nodo perdida", session.session_id);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
            match supervisor.state() {
                NodeState::Stopped => return,
                NodeState::Crashed | NodeState::Restarting => continue,
                _ => {}
            }

            match supervisor.connect(&connector, &params).await {
                Ok(new_session) => {
                    session = new_session;
                    host.attach_node(session.client.clone());
                    break;
                }
                Err(e) => {
                    error!("❌ Reconexión con el nodo fallida: {}", e);
                    return;
                }
            }
        }
    }
}
