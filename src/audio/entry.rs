use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::audio::effects::EffectDescriptor;
use crate::audio::fetch::{FetchError, MediaFetcher, MediaProbe};
use crate::cache::AudioCache;
use crate::error::ExtractionError;
use crate::sources::ResolvedMedia;
use crate::types::{ChannelId, UserId};

/// Dependencias compartidas del proceso de descarga
///
/// Una sola instancia por proceso: la caché es compartida entre sesiones y
/// los límites de reintento vienen de la configuración.
pub struct Downloader {
    cache: AudioCache,
    fetcher: Arc<dyn MediaFetcher>,
    probe: Arc<dyn MediaProbe>,
    retries: u32,
    retry_backoff: Duration,
}

impl Downloader {
    pub fn new(
        cache: AudioCache,
        fetcher: Arc<dyn MediaFetcher>,
        probe: Arc<dyn MediaProbe>,
        retries: u32,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            cache,
            fetcher,
            probe,
            retries,
            retry_backoff,
        }
    }

    pub fn cache(&self) -> &AudioCache {
        &self.cache
    }
}

/// Metadatos adjuntos a un entry (quién lo pidió y desde dónde)
#[derive(Debug, Clone, Default)]
pub struct EntryMeta {
    pub requested_by: Option<UserId>,
    pub channel: Option<ChannelId>,
    pub added_at: Option<DateTime<Utc>>,
}

impl EntryMeta {
    pub fn new(requested_by: Option<UserId>, channel: Option<ChannelId>) -> Self {
        Self {
            requested_by,
            channel,
            added_at: Some(Utc::now()),
        }
    }
}

#[derive(Default)]
struct DownloadState {
    in_progress: bool,
    filename: Option<PathBuf>,
    error: Option<ExtractionError>,
    cache_busted: bool,
    waiters: Vec<oneshot::Sender<Result<(), ExtractionError>>>,
}

struct DownloadFailure {
    error: ExtractionError,
    bust_cache: bool,
}

/// Un item de media resuelto y descargable
///
/// El entry es dueño de su propio ciclo de descarga: como mucho una
/// transferencia en vuelo, y todos los que esperan comparten el mismo
/// desenlace. La identidad es por referencia: dos entries con la misma URL
/// encolados por separado son objetos distintos.
pub struct Entry {
    reference: String,
    info: ResolvedMedia,
    meta: EntryMeta,
    duration: RwLock<Option<Duration>>,
    aoptions: RwLock<Vec<EffectDescriptor>>,
    state: Mutex<DownloadState>,
    downloader: Arc<Downloader>,
}

impl Entry {
    pub fn new(
        reference: impl Into<String>,
        info: ResolvedMedia,
        meta: EntryMeta,
        downloader: Arc<Downloader>,
    ) -> Self {
        let duration = info.duration;
        Self {
            reference: reference.into(),
            info,
            meta,
            duration: RwLock::new(duration),
            aoptions: RwLock::new(Vec::new()),
            state: Mutex::new(DownloadState::default()),
            downloader,
        }
    }

    // Getters
    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn url(&self) -> &str {
        &self.info.playable_url
    }

    pub fn info(&self) -> &ResolvedMedia {
        &self.info
    }

    pub fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    pub fn duration(&self) -> Option<Duration> {
        *self.duration.read()
    }

    /// Ruta local del audio, presente solo tras una descarga con éxito
    pub fn filename(&self) -> Option<PathBuf> {
        self.state.lock().filename.clone()
    }

    pub fn is_downloaded(&self) -> bool {
        let st = self.state.lock();
        st.filename.is_some() && !st.cache_busted
    }

    pub fn is_downloading(&self) -> bool {
        self.state.lock().in_progress
    }

    /// `true` si la última descarga dejó un fichero corrupto conocido
    pub fn is_cache_busted(&self) -> bool {
        self.state.lock().cache_busted
    }

    /// Último error de descarga registrado, si lo hay
    pub fn last_error(&self) -> Option<ExtractionError> {
        self.state.lock().error.clone()
    }

    // Cadena de efectos propia del entry
    pub fn aoptions(&self) -> Vec<EffectDescriptor> {
        self.aoptions.read().clone()
    }

    pub fn push_aoption(&self, effect: EffectDescriptor) {
        self.aoptions.write().push(effect);
    }

    pub fn set_aoptions(&self, effects: Vec<EffectDescriptor>) {
        *self.aoptions.write() = effects;
    }

    /// Restaura el resultado de una descarga previa (carga desde disco)
    ///
    /// Solo tiene efecto si el fichero sigue existiendo.
    pub fn restore_download(&self, path: PathBuf) {
        if path.is_file() {
            let mut st = self.state.lock();
            st.filename = Some(path);
            st.cache_busted = false;
        }
    }

    /// Futuro compartido que resuelve cuando el entry es reproducible
    ///
    /// Llamadas concurrentes no disparan más de una descarga: todas las
    /// esperas registradas antes de la resolución observan el mismo
    /// desenlace, en orden de registro. Abandonar la espera no cancela la
    /// descarga ni afecta al resto de consumidores.
    pub async fn ready(self: Arc<Self>) -> Result<Arc<Entry>, ExtractionError> {
        let rx = {
            let mut st = self.state.lock();
            if st.filename.is_some() && !st.cache_busted {
                drop(st);
                return Ok(self);
            }

            let (tx, rx) = oneshot::channel();
            st.waiters.push(tx);

            if !st.in_progress {
                st.in_progress = true;
                st.error = None;
                let entry = Arc::clone(&self);
                tokio::spawn(async move { entry.run_download().await });
            }
            rx
        };

        match rx.await {
            Ok(Ok(())) => Ok(self),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ExtractionError::new(
                self.reference.clone(),
                "la descarga terminó sin notificar",
            )),
        }
    }

    /// Rutina única de descarga: resuelve a todos los waiters al terminar
    async fn run_download(self: Arc<Self>) {
        debug!("⬇️ Comenzando descarga de {}", self.title());
        let outcome = self.download_inner().await;

        let (result, waiters) = {
            let mut st = self.state.lock();
            st.in_progress = false;
            let result = match outcome {
                Ok(path) => {
                    info!("✅ Entry listo: {} -> {}", self.title(), path.display());
                    st.filename = Some(path);
                    st.cache_busted = false;
                    st.error = None;
                    Ok(())
                }
                Err(failure) => {
                    warn!("❌ Descarga fallida de {}: {}", self.title(), failure.error);
                    if failure.bust_cache {
                        st.cache_busted = true;
                        st.filename = None;
                    }
                    st.error = Some(failure.error.clone());
                    Err(failure.error)
                }
            };
            (result, std::mem::take(&mut st.waiters))
        };

        for waiter in waiters {
            if waiter.send(result.clone()).is_err() {
                // un consumidor abandonó su espera; el resto sigue intacto
                debug!("👋 Un waiter canceló antes de resolverse {}", self.title());
            }
        }
    }

    async fn download_inner(&self) -> Result<PathBuf, DownloadFailure> {
        let cache = self.downloader.cache();
        let basename = AudioCache::expected_basename(
            &self.info.extractor_id,
            self.info.item_id.as_deref(),
            &self.info.playable_url,
        );

        let busted = self.state.lock().cache_busted;
        let mut overwrite = false;

        if !busted {
            if let Some(existing) = cache.find_existing(&basename).await {
                let mut reuse = true;
                if self.info.is_generic() {
                    // fuentes sin catálogo: revalidar tamaño contra el remoto
                    match self
                        .downloader
                        .fetcher
                        .content_length(&self.info.playable_url)
                        .await
                    {
                        Ok(Some(remote)) => {
                            let local = cache.local_size(&existing).await;
                            if local != Some(remote) {
                                info!(
                                    "🔄 Tamaño local ({:?}) difiere del remoto ({}), re-descargando {}",
                                    local,
                                    remote,
                                    self.title()
                                );
                                reuse = false;
                                overwrite = true;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!("⚠️ No se pudo verificar el tamaño remoto: {}", e);
                        }
                    }
                }

                if reuse {
                    info!("📦 Reutilizando caché para {}: {}", self.title(), existing.display());
                    self.fill_duration(&existing).await;
                    return Ok(existing);
                }
            }
        } else {
            // descarga anterior conocida como corrupta: forzar transferencia
            overwrite = true;
        }

        let attempts = self.downloader.retries + 1;
        let extension = extension_for(&self.info.playable_url);
        let final_path = cache.final_path(&basename, &extension);

        let mut attempt = 1u32;
        loop {
            match self.try_download_once(&final_path, overwrite).await {
                Ok(path) => {
                    self.fill_duration(&path).await;
                    return Ok(path);
                }
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "⏳ Transferencia truncada de {} (intento {}/{}): {}",
                        self.title(),
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(self.downloader.retry_backoff).await;
                    attempt += 1;
                    overwrite = true;
                }
                Err(e) => {
                    // solo el agotamiento de la clase transitoria invalida la caché
                    let bust_cache = e.is_transient();
                    return Err(DownloadFailure {
                        error: ExtractionError::new(self.reference.clone(), e.to_string()),
                        bust_cache,
                    });
                }
            }
        }
    }

    async fn try_download_once(&self, final_path: &Path, overwrite: bool) -> Result<PathBuf, FetchError> {
        let cache = self.downloader.cache();
        let temp = tempfile::Builder::new()
            .prefix(".part-")
            .tempfile_in(cache.dir())
            .map_err(FetchError::Io)?
            .into_temp_path();

        self.downloader
            .fetcher
            .fetch(&self.info.playable_url, &temp)
            .await?;

        cache
            .commit(temp, final_path, overwrite)
            .await
            .map_err(|e| FetchError::Io(std::io::Error::other(e.to_string())))
    }

    /// Sondea la duración del fichero si la fuente no la traía
    async fn fill_duration(&self, path: &Path) {
        if self.duration().is_some() {
            return;
        }
        if let Some(duration) = self.downloader.probe.probe_duration(path).await {
            debug!(
                "⏱️ Duración sondeada para {}: {}s",
                self.title(),
                duration.as_secs()
            );
            *self.duration.write() = Some(duration);
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("reference", &self.reference)
            .field("title", &self.info.title)
            .field("downloaded", &self.is_downloaded())
            .finish()
    }
}

/// Extensión tomada de la URL reproducible, con fallback razonable
fn extension_for(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
        })
        .and_then(|last| last.rsplit_once('.').map(|(_, ext)| ext.to_string()))
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| "mp3".to_string())
}
