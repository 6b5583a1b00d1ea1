//! # Session Module
//!
//! One session per independently-addressable chat group. The session bundles
//! the group's [`Player`] + [`Queue`] pair, its voice binding, the named-lock
//! registry that serializes mutually-exclusive operations, and the persisted
//! state under `data/<group-id>/`.
//!
//! ## Concurrency model
//!
//! Every operation that must not interleave with itself (or with a competing
//! operation of the same name) takes the session-local named lock for the
//! whole critical section, awaited I/O included:
//!
//! - `change_voice` — sink connect / move / disconnect
//! - `queue_serialization` — queue snapshot save / load
//! - `current_song` — now-playing message lifecycle
//!
//! Locks are per-session, so groups never block each other; the
//! [`manager::SessionManager`] keeps sessions fully independent.

pub mod locks;
pub mod manager;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::audio::effects::EffectDescriptor;
use crate::audio::entry::{Downloader, Entry, EntryMeta};
use crate::audio::player::{Player, PlayerEvent};
use crate::audio::queue::Queue;
use crate::config::Config;
use crate::error::{EnqueueError, ExtractionError, VoiceConnectionError};
use crate::sources::{MediaResolver, ResolveError};
use crate::storage::{Autoplaylist, GroupStore};
use crate::types::{ChannelId, GroupId, MessageId, UserId};
use crate::voice::{Messenger, VoiceSink};

use locks::{LockRegistry, LOCK_CHANGE_VOICE, LOCK_CURRENT_SONG, LOCK_QUEUE_SERIALIZATION};

/// Sesión de un grupo: player + cola + binding de voz + persistencia
pub struct Session {
    id: GroupId,
    config: Config,
    queue: Arc<Queue>,
    player: Arc<Player>,
    locks: LockRegistry,
    store: GroupStore,
    sink: Arc<dyn VoiceSink>,
    messenger: Arc<dyn Messenger>,
    resolver: Arc<dyn MediaResolver>,
    downloader: Arc<Downloader>,
    voice_channel: Mutex<Option<ChannelId>>,
    now_playing_msg: AsyncMutex<Option<(ChannelId, MessageId)>>,
    karaoke: AtomicBool,
    cancel: CancellationToken,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: GroupId,
        config: &Config,
        resolver: Arc<dyn MediaResolver>,
        downloader: Arc<Downloader>,
        sink: Arc<dyn VoiceSink>,
        messenger: Arc<dyn Messenger>,
        autoplaylist: Option<Arc<Autoplaylist>>,
    ) -> Arc<Self> {
        let queue = Arc::new(Queue::new(config.max_queue_size));
        let autoplaylist = if config.enable_autoplaylist {
            autoplaylist
        } else {
            None
        };
        let player = Player::new(
            Arc::clone(&queue),
            config.skip_threshold,
            config.default_volume,
            Arc::clone(&resolver),
            Arc::clone(&downloader),
            autoplaylist,
        );

        Arc::new(Self {
            id,
            config: config.clone(),
            queue,
            player,
            locks: LockRegistry::new(),
            store: GroupStore::new(&config.data_dir, id),
            sink,
            messenger,
            resolver,
            downloader,
            voice_channel: Mutex::new(None),
            now_playing_msg: AsyncMutex::new(None),
            karaoke: AtomicBool::new(config.karaoke_default),
            cancel: CancellationToken::new(),
        })
    }

    /// Arranca el loop del player y el listener de cambios de pista
    pub fn start(self: &Arc<Self>) {
        let player = Arc::clone(&self.player);
        let sink = Arc::clone(&self.sink);
        let cancel = self.cancel.clone();
        tokio::spawn(player.run(sink, cancel));

        // current.txt sigue cada cambio de pista
        let mut events = self.player.subscribe_events();
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(PlayerEvent::TrackStarted { title }) => {
                            if let Err(e) = store.write_current(&title).await {
                                warn!("⚠️ No se pudo escribir current.txt: {}", e);
                            }
                        }
                        Ok(PlayerEvent::TrackEnded { .. }) => {
                            let _ = store.clear_current().await;
                        }
                        Ok(PlayerEvent::PlaybackStopped) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(_) => {}
                    },
                }
            }
        });
    }

    // --- Accessores ---

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn player(&self) -> &Arc<Player> {
        &self.player
    }

    pub fn karaoke_enabled(&self) -> bool {
        self.karaoke.load(Ordering::SeqCst)
    }

    pub fn set_karaoke(&self, enabled: bool) {
        self.karaoke.store(enabled, Ordering::SeqCst);
        info!("🎤 Modo karaoke {} para {}", if enabled { "activado" } else { "desactivado" }, self.id);
    }

    pub fn set_autoplaylist(&self, enabled: bool) {
        self.player.set_autoplaylist_enabled(enabled);
    }

    // --- Encolado ---

    /// Resuelve una referencia y la encola como entry único
    pub async fn enqueue(
        &self,
        reference: &str,
        requested_by: Option<UserId>,
        channel: Option<ChannelId>,
        priority: bool,
    ) -> Result<Arc<Entry>, EnqueueError> {
        if !self.resolver.is_valid_reference(reference) {
            return Err(EnqueueError::Unsupported(reference.to_string()));
        }

        let media = self
            .resolver
            .resolve(reference)
            .await
            .map_err(map_resolve_error)?;

        let entry = Arc::new(Entry::new(
            reference,
            media,
            EntryMeta::new(requested_by, channel),
            Arc::clone(&self.downloader),
        ));
        if self.karaoke_enabled() {
            entry.push_aoption(EffectDescriptor::Karaoke);
        }

        self.queue.add(Arc::clone(&entry), priority)?;
        Ok(entry)
    }

    /// Resuelve una playlist completa, respetando el tope configurado
    pub async fn enqueue_playlist(
        &self,
        reference: &str,
        requested_by: Option<UserId>,
        channel: Option<ChannelId>,
    ) -> Result<usize, EnqueueError> {
        let items = self
            .resolver
            .resolve_playlist(reference)
            .await
            .map_err(map_resolve_error)?;

        let total = items.len();
        let mut added = 0;
        for media in items.into_iter().take(self.config.max_playlist_size) {
            let entry = Arc::new(Entry::new(
                reference,
                media,
                EntryMeta::new(requested_by, channel),
                Arc::clone(&self.downloader),
            ));
            if self.karaoke_enabled() {
                entry.push_aoption(EffectDescriptor::Karaoke);
            }
            if self.queue.add(entry, false).is_err() {
                warn!("⚠️ Cola llena tras {} items de playlist", added);
                break;
            }
            added += 1;
        }

        if added < total {
            info!("✂️ Playlist recortada: {} de {} items encolados", added, total);
        }
        Ok(added)
    }

    // --- Persistencia ---

    /// Congela el entry actual y la cola en `queue.json`
    pub async fn serialize_queue(&self) -> anyhow::Result<()> {
        let lock = self.locks.get(LOCK_QUEUE_SERIALIZATION);
        let _guard = lock.lock().await;

        let current = self.player.now_playing();
        let entries = self.queue.entries();
        self.store.save_queue(current.as_ref(), &entries).await
    }

    /// Restaura la cola persistida; un snapshot inutilizable deja la cola vacía
    pub async fn deserialize_queue(&self) -> usize {
        let lock = self.locks.get(LOCK_QUEUE_SERIALIZATION);
        let _guard = lock.lock().await;

        let snapshots = match self.store.load_queue().await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!(
                    "⚠️ Cola persistida inutilizable para {}: {}; empezando vacía",
                    self.id, e
                );
                return 0;
            }
        };

        let mut restored = 0;
        for snapshot in snapshots {
            let entry = snapshot.restore(&self.downloader);
            if self.queue.add(entry, false).is_err() {
                break;
            }
            restored += 1;
        }
        if restored > 0 {
            info!("📂 {} entries restaurados para {}", restored, self.id);
        }
        restored
    }

    // --- Mensaje de "now playing" ---

    /// Edita el mensaje de now-playing, o lo borra y reenvía
    ///
    /// Como mucho un mensaje queda registrado por grupo: se edita en sitio si
    /// sigue siendo el último del bot en el canal, y si no, se reenvía.
    pub async fn update_now_playing(&self, channel: ChannelId, text: &str) -> anyhow::Result<()> {
        let lock = self.locks.get(LOCK_CURRENT_SONG);
        let _guard = lock.lock().await;

        let mut tracked = self.now_playing_msg.lock().await;

        if let Some((prev_channel, prev_msg)) = *tracked {
            if prev_channel == channel
                && self.messenger.is_latest(channel, prev_msg).await
                && self.messenger.edit(channel, prev_msg, text).await.is_ok()
            {
                return Ok(());
            }
            if let Err(e) = self.messenger.delete(prev_channel, prev_msg).await {
                debug!("🧹 No se pudo borrar el mensaje anterior: {}", e);
            }
            *tracked = None;
        }

        let message = self.messenger.send(channel, text).await?;
        *tracked = Some((channel, message));
        Ok(())
    }

    // --- Binding de voz ---

    /// Conecta, mueve o desconecta el sink de voz
    ///
    /// Moverse al canal ya vinculado o desconectar sin conexión son señales
    /// benignas, no trabajo redundante.
    pub async fn set_voice_binding(
        &self,
        channel: Option<ChannelId>,
    ) -> Result<(), VoiceConnectionError> {
        let lock = self.locks.get(LOCK_CHANGE_VOICE);
        let _guard = lock.lock().await;

        let bound = *self.voice_channel.lock();
        match (bound, channel) {
            (Some(current), Some(target)) if current == target => {
                Err(VoiceConnectionError::AlreadyInChannel)
            }
            (Some(_), Some(target)) => {
                self.sink.move_to(target).await?;
                *self.voice_channel.lock() = Some(target);
                info!("🔀 {} movido al canal de voz {}", self.id, target);
                Ok(())
            }
            (None, Some(target)) => {
                self.sink.connect(target).await?;
                *self.voice_channel.lock() = Some(target);
                self.player.set_sink_bound(true);
                info!("🔗 {} conectado al canal de voz {}", self.id, target);
                Ok(())
            }
            (Some(_), None) => {
                self.sink.disconnect().await?;
                *self.voice_channel.lock() = None;
                self.player.set_sink_bound(false);
                info!("👋 {} desconectado del canal de voz", self.id);
                Ok(())
            }
            (None, None) => Err(VoiceConnectionError::NotConnected),
        }
    }

    pub fn voice_channel(&self) -> Option<ChannelId> {
        *self.voice_channel.lock()
    }

    // --- Estado para el dispatcher ---

    /// Espera estimada hasta la posición dada de la cola
    pub fn estimate_wait(&self, position: usize) -> Duration {
        self.queue
            .estimate_wait(position, self.player.remaining())
    }

    /// Línea de estado del entry actual
    pub fn now_playing_line(&self) -> String {
        match self.player.now_playing() {
            Some(entry) => {
                let progress = whole_seconds(self.player.progress().unwrap_or_default());
                match entry.duration() {
                    Some(total) => format!(
                        "🎵 {} [{} / {}]",
                        entry.title(),
                        humantime::format_duration(progress),
                        humantime::format_duration(whole_seconds(total)),
                    ),
                    None => format!(
                        "🎵 {} [{}]",
                        entry.title(),
                        humantime::format_duration(progress),
                    ),
                }
            }
            None => "📭 Nada sonando".to_string(),
        }
    }

    /// Una línea por entry encolado, con su espera estimada
    pub fn queue_lines(&self) -> Vec<String> {
        self.queue
            .entries()
            .iter()
            .enumerate()
            .map(|(position, entry)| {
                let wait = whole_seconds(self.estimate_wait(position));
                format!(
                    "{}. {} (espera ~{})",
                    position + 1,
                    entry.title(),
                    humantime::format_duration(wait)
                )
            })
            .collect()
    }

    /// Detiene el loop, persiste la cola y suelta el sink
    pub async fn shutdown(&self) {
        info!("🛑 Cerrando sesión {}", self.id);
        if let Err(e) = self.serialize_queue().await {
            warn!("⚠️ No se pudo persistir la cola al cerrar {}: {}", self.id, e);
        }
        self.cancel.cancel();

        let was_bound = self.voice_channel.lock().take().is_some();
        if was_bound {
            if let Err(e) = self.sink.disconnect().await {
                debug!("👋 Desconexión al cerrar: {}", e);
            }
        }
    }
}

/// humantime imprime nanosegundos si no se truncan antes
fn whole_seconds(duration: Duration) -> Duration {
    Duration::from_secs(duration.as_secs())
}

fn map_resolve_error(error: ResolveError) -> EnqueueError {
    match error {
        ResolveError::Unsupported(reference) => EnqueueError::Unsupported(reference),
        ResolveError::WrongType(wrong) => EnqueueError::WrongType(wrong),
        ResolveError::Failed { reference, reason } => {
            EnqueueError::Extraction(ExtractionError::new(reference, reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{test_downloader, TestMessenger, TestSink};
    use crate::sources::DirectUrlResolver;
    use pretty_assertions::assert_eq;

    struct Fixture {
        _tmp: tempfile::TempDir,
        session: Arc<Session>,
        sink: Arc<TestSink>,
        messenger: Arc<TestMessenger>,
    }

    async fn make_session(karaoke: bool) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: tmp.path().join("data"),
            cache_dir: tmp.path().join("cache"),
            karaoke_default: karaoke,
            ..Config::default()
        };
        let downloader = test_downloader(&config.cache_dir).await;
        let sink = TestSink::new();
        let messenger = TestMessenger::new();

        let session = Session::new(
            GroupId(77),
            &config,
            Arc::new(DirectUrlResolver::new()),
            downloader,
            Arc::clone(&sink) as Arc<dyn VoiceSink>,
            Arc::clone(&messenger) as Arc<dyn Messenger>,
            None,
        );

        Fixture {
            _tmp: tmp,
            session,
            sink,
            messenger,
        }
    }

    #[tokio::test]
    async fn test_enqueue_unsupported_reference() {
        let fx = make_session(false).await;
        let err = fx
            .session
            .enqueue("esto no es una url", None, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Unsupported(_)));
        assert!(fx.session.queue().is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_adds_entry_with_meta() {
        let fx = make_session(false).await;
        let entry = fx
            .session
            .enqueue(
                "https://example.com/tracks/tema.mp3",
                Some(UserId(5)),
                Some(ChannelId(6)),
                false,
            )
            .await
            .unwrap();

        assert_eq!(entry.title(), "tema.mp3");
        assert_eq!(entry.meta().requested_by, Some(UserId(5)));
        assert_eq!(fx.session.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_karaoke_flag_prepends_effect() {
        let fx = make_session(true).await;
        let entry = fx
            .session
            .enqueue("https://example.com/tracks/tema.mp3", None, None, false)
            .await
            .unwrap();
        assert_eq!(entry.aoptions(), vec![EffectDescriptor::Karaoke]);
    }

    #[tokio::test]
    async fn test_enqueue_playlist_wrong_type() {
        let fx = make_session(false).await;
        let err = fx
            .session
            .enqueue_playlist("https://example.com/tracks/tema.mp3", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::WrongType(_)));
    }

    #[tokio::test]
    async fn test_voice_binding_transitions() {
        let fx = make_session(false).await;

        // desconectar sin conexión es una señal benigna
        assert_eq!(
            fx.session.set_voice_binding(None).await,
            Err(VoiceConnectionError::NotConnected)
        );

        fx.session
            .set_voice_binding(Some(ChannelId(10)))
            .await
            .unwrap();
        assert_eq!(fx.session.voice_channel(), Some(ChannelId(10)));
        assert_eq!(*fx.sink.connected.lock(), Some(ChannelId(10)));

        // moverse al canal ya vinculado no hace trabajo redundante
        assert_eq!(
            fx.session.set_voice_binding(Some(ChannelId(10))).await,
            Err(VoiceConnectionError::AlreadyInChannel)
        );

        fx.session
            .set_voice_binding(Some(ChannelId(11)))
            .await
            .unwrap();
        assert_eq!(fx.session.voice_channel(), Some(ChannelId(11)));

        fx.session.set_voice_binding(None).await.unwrap();
        assert_eq!(fx.session.voice_channel(), None);
        assert!(fx.sink.connected.lock().is_none());
    }

    #[tokio::test]
    async fn test_now_playing_edits_in_place() {
        let fx = make_session(false).await;
        let channel = ChannelId(3);

        fx.session.update_now_playing(channel, "pista 1").await.unwrap();
        fx.session.update_now_playing(channel, "pista 2").await.unwrap();

        assert_eq!(fx.messenger.sent.lock().len(), 1);
        assert_eq!(fx.messenger.edited.lock().len(), 1);
        assert!(fx.messenger.deleted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_now_playing_resends_when_not_latest() {
        let fx = make_session(false).await;
        let channel = ChannelId(3);

        fx.session.update_now_playing(channel, "pista 1").await.unwrap();

        // otro mensaje del bot quedó por encima
        fx.messenger.latest.store(false, Ordering::SeqCst);
        fx.session.update_now_playing(channel, "pista 2").await.unwrap();

        assert_eq!(fx.messenger.sent.lock().len(), 2);
        assert_eq!(fx.messenger.deleted.lock().len(), 1);
        assert!(fx.messenger.edited.lock().is_empty());
    }

    #[tokio::test]
    async fn test_serialize_then_deserialize_round_trip() {
        let fx = make_session(false).await;

        fx.session
            .enqueue("https://example.com/tracks/uno.mp3", None, None, false)
            .await
            .unwrap();
        fx.session
            .enqueue("https://example.com/tracks/dos.mp3", None, None, false)
            .await
            .unwrap();

        fx.session.serialize_queue().await.unwrap();
        fx.session.queue().clear();

        let restored = fx.session.deserialize_queue().await;
        assert_eq!(restored, 2);

        let titles: Vec<String> = fx
            .session
            .queue()
            .entries()
            .iter()
            .map(|e| e.title().to_string())
            .collect();
        assert_eq!(titles, vec!["uno.mp3", "dos.mp3"]);
    }

    #[tokio::test]
    async fn test_deserialize_without_snapshot_leaves_queue_empty() {
        let fx = make_session(false).await;
        assert_eq!(fx.session.deserialize_queue().await, 0);
        assert!(fx.session.queue().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_serializations_on_same_group_complete() {
        let fx = make_session(false).await;
        fx.session
            .enqueue("https://example.com/tracks/uno.mp3", None, None, false)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&fx.session);
            tasks.push(tokio::spawn(
                async move { session.serialize_queue().await },
            ));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(fx.session.deserialize_queue().await, 1);
    }
}
