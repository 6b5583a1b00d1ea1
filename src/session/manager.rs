use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::audio::entry::Downloader;
use crate::audio::fetch::{FfprobeProbe, HttpFetcher};
use crate::cache::AudioCache;
use crate::config::Config;
use crate::session::Session;
use crate::sources::MediaResolver;
use crate::storage::Autoplaylist;
use crate::types::GroupId;
use crate::voice::{Messenger, VoiceSink};

/// Fábrica de sinks de voz, uno por sesión
pub trait VoiceSinkFactory: Send + Sync {
    fn create(&self, group: GroupId) -> Arc<dyn VoiceSink>;
}

/// Registro explícito de sesiones activas, con ciclo de vida claro
///
/// Las sesiones se crean en la primera interacción con un grupo y viven
/// hasta su eliminación explícita. Grupos distintos no comparten estado de
/// cola ni de player; lo único compartido entre sesiones es la caché de
/// descargas y la autoplaylist.
pub struct SessionManager {
    config: Config,
    sessions: DashMap<GroupId, Arc<Session>>,
    resolver: Arc<dyn MediaResolver>,
    downloader: Arc<Downloader>,
    sink_factory: Arc<dyn VoiceSinkFactory>,
    messenger: Arc<dyn Messenger>,
    autoplaylist: Option<Arc<Autoplaylist>>,
}

impl SessionManager {
    /// Construye el manager con el stack real (reqwest + ffprobe)
    pub async fn new(
        config: Config,
        resolver: Arc<dyn MediaResolver>,
        sink_factory: Arc<dyn VoiceSinkFactory>,
        messenger: Arc<dyn Messenger>,
    ) -> anyhow::Result<Self> {
        let cache = AudioCache::new(config.cache_dir.clone()).await?;
        let downloader = Arc::new(Downloader::new(
            cache,
            Arc::new(HttpFetcher::new()?),
            Arc::new(FfprobeProbe::new()),
            config.download_retries,
            config.retry_backoff(),
        ));
        Ok(Self::with_parts(
            config,
            resolver,
            downloader,
            sink_factory,
            messenger,
        ))
    }

    /// Construcción con dependencias ya montadas (tests, stacks a medida)
    pub fn with_parts(
        config: Config,
        resolver: Arc<dyn MediaResolver>,
        downloader: Arc<Downloader>,
        sink_factory: Arc<dyn VoiceSinkFactory>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        let autoplaylist = if config.enable_autoplaylist {
            Some(Arc::new(Autoplaylist::new(config.autoplaylist_file.clone())))
        } else {
            None
        };

        Self {
            config,
            sessions: DashMap::new(),
            resolver,
            downloader,
            sink_factory,
            messenger,
            autoplaylist,
        }
    }

    /// Sesión del grupo, creándola y restaurando su cola si es la primera vez
    pub async fn get_or_create(&self, group: GroupId) -> Arc<Session> {
        let (session, created) = match self.sessions.entry(group) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                (Arc::clone(occupied.get()), false)
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let session = Session::new(
                    group,
                    &self.config,
                    Arc::clone(&self.resolver),
                    Arc::clone(&self.downloader),
                    self.sink_factory.create(group),
                    Arc::clone(&self.messenger),
                    self.autoplaylist.clone(),
                );
                vacant.insert(Arc::clone(&session));
                (session, true)
            }
        };

        if created {
            info!("🆕 Sesión creada para el grupo {}", group);
            session.start();
            session.deserialize_queue().await;
        }
        session
    }

    pub fn get(&self, group: GroupId) -> Option<Arc<Session>> {
        self.sessions.get(&group).map(|s| Arc::clone(s.value()))
    }

    /// Cierra y elimina la sesión del grupo
    pub async fn remove(&self, group: GroupId) -> bool {
        match self.sessions.remove(&group) {
            Some((_, session)) => {
                session.shutdown().await;
                info!("🗑️ Sesión eliminada para el grupo {}", group);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Cierre ordenado de todas las sesiones (apagado del proceso)
    pub async fn shutdown_all(&self) {
        let groups: Vec<GroupId> = self.sessions.iter().map(|s| *s.key()).collect();
        for group in groups {
            self.remove(group).await;
        }
    }
}
