use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audio::effects::{merge_pending, EffectDescriptor};
use crate::audio::entry::{Downloader, Entry, EntryMeta};
use crate::audio::queue::Queue;
use crate::sources::MediaResolver;
use crate::storage::Autoplaylist;
use crate::types::UserId;
use crate::voice::{SinkHandle, VoiceSink};

/// Estado observable del player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    /// Nada sonando; la cola puede tener contenido pendiente
    Idle,
    Playing,
    Paused,
    /// Terminal hasta un `restart` explícito
    Stopped,
    /// Transitorio mientras el sink confirma el salto
    Skipping,
}

/// Notificación emitida en cada cambio de pista
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    TrackStarted { title: String },
    TrackEnded { title: String },
    PlaybackStopped,
}

#[derive(Debug)]
enum Command {
    Pause,
    Resume,
    Skip,
    Stop,
    Restart,
    SetVolume(f32),
}

/// Resultado de una petición de salto
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipOutcome {
    Skipped,
    Voted { votes: usize, required: usize },
    AlreadyVoted { votes: usize, required: usize },
    NotPlaying,
}

/// Posición de reproducción con contabilidad de pausas
struct Progress {
    started: Instant,
    paused_at: Option<Instant>,
    paused_total: Duration,
}

impl Progress {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            paused_at: None,
            paused_total: Duration::ZERO,
        }
    }

    fn elapsed(&self) -> Duration {
        let end = self.paused_at.unwrap_or_else(Instant::now);
        end.duration_since(self.started)
            .saturating_sub(self.paused_total)
    }

    fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(Instant::now());
        }
    }

    fn resume(&mut self) {
        if let Some(paused_at) = self.paused_at.take() {
            self.paused_total += paused_at.elapsed();
        }
    }
}

/// Máquina de estados de reproducción de una sesión
///
/// Un loop perpetuo extrae la cabeza de la cola, espera su descarga y
/// entrega el fichero al sink. Los controles externos (pausa, salto, stop)
/// llegan por un canal de comandos y despiertan al loop en vez de que este
/// haga polling con sleeps fijos.
pub struct Player {
    queue: Arc<Queue>,
    state_tx: watch::Sender<PlayerState>,
    /// `true` mientras la sesión tiene un sink de voz vinculado
    gate_tx: watch::Sender<bool>,
    current: RwLock<Option<Arc<Entry>>>,
    progress: RwLock<Option<Progress>>,
    volume: RwLock<f32>,
    pending_effects: Mutex<Vec<EffectDescriptor>>,
    skip_votes: Mutex<HashSet<UserId>>,
    skip_threshold: usize,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    events: broadcast::Sender<PlayerEvent>,
    autoplaylist: Option<Arc<Autoplaylist>>,
    autoplaylist_enabled: AtomicBool,
    resolver: Arc<dyn MediaResolver>,
    downloader: Arc<Downloader>,
}

impl Player {
    pub fn new(
        queue: Arc<Queue>,
        skip_threshold: usize,
        default_volume: f32,
        resolver: Arc<dyn MediaResolver>,
        downloader: Arc<Downloader>,
        autoplaylist: Option<Arc<Autoplaylist>>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(PlayerState::Idle);
        let (gate_tx, _) = watch::channel(false);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let autoplaylist_enabled = autoplaylist.is_some();

        Arc::new(Self {
            queue,
            state_tx,
            gate_tx,
            current: RwLock::new(None),
            progress: RwLock::new(None),
            volume: RwLock::new(default_volume.clamp(0.0, 1.0)),
            pending_effects: Mutex::new(Vec::new()),
            skip_votes: Mutex::new(HashSet::new()),
            skip_threshold,
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            events,
            autoplaylist,
            autoplaylist_enabled: AtomicBool::new(autoplaylist_enabled),
            resolver,
            downloader,
        })
    }

    // --- Estado observable ---

    pub fn state(&self) -> PlayerState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PlayerState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn now_playing(&self) -> Option<Arc<Entry>> {
        self.current.read().clone()
    }

    /// Posición de reproducción del entry actual
    pub fn progress(&self) -> Option<Duration> {
        self.progress.read().as_ref().map(Progress::elapsed)
    }

    /// Tiempo restante del entry actual; cero si se desconoce la duración
    pub fn remaining(&self) -> Duration {
        let Some(entry) = self.now_playing() else {
            return Duration::ZERO;
        };
        let Some(total) = entry.duration() else {
            return Duration::ZERO;
        };
        total.saturating_sub(self.progress().unwrap_or(Duration::ZERO))
    }

    pub fn volume(&self) -> f32 {
        *self.volume.read()
    }

    // --- Controles ---

    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    pub fn resume(&self) {
        let _ = self.commands.send(Command::Resume);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Rearma un player detenido con `stop`
    pub fn restart(&self) {
        let _ = self.commands.send(Command::Restart);
    }

    /// El volumen persiste entre entries hasta que se cambie
    pub fn set_volume(&self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        *self.volume.write() = clamped;
        let _ = self.commands.send(Command::SetVolume(clamped));
        info!("🔊 Volumen ajustado a {}%", (clamped * 100.0) as u8);
    }

    /// Encola un efecto para el próximo entry que arranque
    pub fn push_pending_effect(&self, effect: EffectDescriptor) {
        self.pending_effects.lock().push(effect);
    }

    /// Voto de salto de un usuario sin privilegios
    ///
    /// Idempotente por usuario: repetir el voto no suma. Alcanzado el umbral
    /// se limpia el conjunto y se fuerza el salto.
    pub fn vote_skip(&self, user: UserId) -> SkipOutcome {
        if self.current.read().is_none() {
            return SkipOutcome::NotPlaying;
        }

        let (outcome, skip) = {
            let mut votes = self.skip_votes.lock();
            let newly = votes.insert(user);
            let count = votes.len();
            if count >= self.skip_threshold {
                votes.clear();
                (SkipOutcome::Skipped, true)
            } else if newly {
                (
                    SkipOutcome::Voted {
                        votes: count,
                        required: self.skip_threshold,
                    },
                    false,
                )
            } else {
                (
                    SkipOutcome::AlreadyVoted {
                        votes: count,
                        required: self.skip_threshold,
                    },
                    false,
                )
            }
        };

        if skip {
            info!("🗳️ Umbral de votos alcanzado, saltando pista");
            let _ = self.commands.send(Command::Skip);
        }
        outcome
    }

    /// Salto privilegiado: ignora la votación y la limpia
    pub fn force_skip(&self) -> SkipOutcome {
        if self.current.read().is_none() {
            return SkipOutcome::NotPlaying;
        }
        self.skip_votes.lock().clear();
        let _ = self.commands.send(Command::Skip);
        SkipOutcome::Skipped
    }

    pub fn skip_vote_count(&self) -> usize {
        self.skip_votes.lock().len()
    }

    /// La sesión anuncia aquí si hay sink de voz vinculado
    ///
    /// Sin binding el loop no arranca entries nuevos; la pista ya entregada
    /// al sink no se toca.
    pub fn set_sink_bound(&self, bound: bool) {
        self.gate_tx.send_replace(bound);
    }

    pub fn is_sink_bound(&self) -> bool {
        *self.gate_tx.borrow()
    }

    pub fn autoplaylist_enabled(&self) -> bool {
        self.autoplaylist.is_some() && self.autoplaylist_enabled.load(Ordering::SeqCst)
    }

    pub fn set_autoplaylist_enabled(&self, enabled: bool) {
        self.autoplaylist_enabled.store(enabled, Ordering::SeqCst);
    }

    // --- Loop de reproducción ---

    /// Loop perpetuo del player; una sola llamada por sesión
    pub async fn run(self: Arc<Self>, sink: Arc<dyn VoiceSink>, cancel: CancellationToken) {
        let mut commands = match self.command_rx.lock().take() {
            Some(rx) => rx,
            None => {
                error!("🚫 El loop del player ya fue arrancado una vez");
                return;
            }
        };
        let mut queue_events = self.queue.subscribe();
        let mut gate = self.gate_tx.subscribe();
        info!("🎵 Loop de reproducción iniciado");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !*gate.borrow() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = gate.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    cmd = commands.recv() => match cmd {
                        Some(Command::Stop) => self.set_state(PlayerState::Stopped),
                        Some(_) => {}
                        None => break,
                    },
                }
                continue;
            }

            if self.state() == PlayerState::Stopped {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = commands.recv() => match cmd {
                        Some(Command::Restart) => {
                            info!("▶️ Reproducción rearmada");
                            self.set_state(PlayerState::Idle);
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
                continue;
            }

            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.next_entry() => next,
            };

            let entry = match next {
                Some(entry) => entry,
                None => {
                    // nada reproducible: dormir hasta que cambie la cola
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = queue_events.recv() => {}
                        cmd = commands.recv() => match cmd {
                            Some(Command::Stop) => self.set_state(PlayerState::Stopped),
                            Some(_) => {}
                            None => break,
                        },
                    }
                    continue;
                }
            };

            self.play_entry(entry, &sink, &mut commands, &cancel).await;
        }

        info!("👋 Loop de reproducción terminado");
    }

    /// Siguiente candidato: cabeza de la cola o reserva de autoplaylist
    ///
    /// Un fallo de descarga descarta el candidato y prueba el siguiente; el
    /// loop nunca se detiene por un entry malo.
    async fn next_entry(&self) -> Option<Arc<Entry>> {
        loop {
            match self.queue.pop_next(true).await {
                Some(Ok(entry)) => return Some(entry),
                Some(Err(e)) => {
                    warn!("🗑️ Entry descartado de la cola: {}", e);
                    continue;
                }
                None => break,
            }
        }

        if !self.autoplaylist_enabled() {
            return None;
        }
        let autoplaylist = self.autoplaylist.as_ref()?;

        loop {
            let reference = autoplaylist.pick().await?;
            debug!("🎲 Probando referencia de autoplaylist: {}", reference);

            match self.resolver.resolve(&reference).await {
                Ok(media) => {
                    let entry = Arc::new(Entry::new(
                        reference.clone(),
                        media,
                        EntryMeta::default(),
                        Arc::clone(&self.downloader),
                    ));
                    match entry.ready().await {
                        Ok(entry) => {
                            info!("🎶 Entrada de autoplaylist lista: {}", entry.title());
                            return Some(entry);
                        }
                        Err(e) => {
                            warn!("⚠️ Autoplaylist: descarga fallida de {}: {}", reference, e);
                            autoplaylist.mark_bad(&reference);
                        }
                    }
                }
                Err(e) => {
                    warn!("⚠️ Autoplaylist: no se pudo resolver {}: {}", reference, e);
                    autoplaylist.mark_bad(&reference);
                }
            }
        }
    }

    /// Reproduce un entry ya listo y atiende comandos hasta que termina
    async fn play_entry(
        &self,
        entry: Arc<Entry>,
        sink: &Arc<dyn VoiceSink>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) {
        let pending = std::mem::take(&mut *self.pending_effects.lock());
        if !pending.is_empty() {
            entry.set_aoptions(merge_pending(pending, &entry.aoptions()));
        }

        let Some(path) = entry.filename() else {
            warn!("⚠️ Entry listo sin fichero local: {}", entry.title());
            return;
        };

        let handle = match sink.play(&path, &entry.aoptions(), self.volume()).await {
            Ok(handle) => handle,
            Err(e) => {
                // descartar y avanzar
                error!("❌ El sink rechazó {}: {}", entry.title(), e);
                return;
            }
        };

        info!("🎵 Reproduciendo: {}", entry.title());
        *self.current.write() = Some(Arc::clone(&entry));
        self.skip_votes.lock().clear();
        *self.progress.write() = Some(Progress::new());
        self.set_state(PlayerState::Playing);
        let _ = self.events.send(PlayerEvent::TrackStarted {
            title: entry.title().to_string(),
        });

        let mut stopped = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    handle.stop();
                    break;
                }
                _ = handle.ended() => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Pause) => {
                        if self.state() == PlayerState::Playing {
                            handle.pause();
                            if let Some(progress) = self.progress.write().as_mut() {
                                progress.pause();
                            }
                            self.set_state(PlayerState::Paused);
                            info!("⏸️ Reproducción pausada");
                        }
                    }
                    Some(Command::Resume) => {
                        if self.state() == PlayerState::Paused {
                            handle.resume();
                            if let Some(progress) = self.progress.write().as_mut() {
                                progress.resume();
                            }
                            self.set_state(PlayerState::Playing);
                            info!("▶️ Reproducción reanudada");
                        }
                    }
                    Some(Command::Skip) => {
                        info!("⏭️ Saltando: {}", entry.title());
                        self.set_state(PlayerState::Skipping);
                        handle.stop();
                        break;
                    }
                    Some(Command::Stop) => {
                        info!("⏹️ Reproducción detenida");
                        handle.stop();
                        self.set_state(PlayerState::Stopped);
                        stopped = true;
                        break;
                    }
                    Some(Command::Restart) => {}
                    Some(Command::SetVolume(volume)) => handle.set_volume(volume),
                    None => {
                        handle.stop();
                        self.set_state(PlayerState::Stopped);
                        stopped = true;
                        break;
                    }
                },
            }
        }

        let _ = self.events.send(PlayerEvent::TrackEnded {
            title: entry.title().to_string(),
        });
        *self.current.write() = None;
        *self.progress.write() = None;
        self.skip_votes.lock().clear();

        if stopped {
            let _ = self.events.send(PlayerEvent::PlaybackStopped);
        } else if !cancel.is_cancelled() {
            self.set_state(PlayerState::Idle);
        }
    }

    fn set_state(&self, state: PlayerState) {
        self.state_tx.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::fetch::{FetchError, MediaFetcher, NullProbe};
    use crate::audio::testutil::{test_downloader, test_entry, TestSink};
    use crate::cache::AudioCache;
    use crate::sources::DirectUrlResolver;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    struct Fixture {
        _tmp: tempfile::TempDir,
        downloader: Arc<Downloader>,
        queue: Arc<Queue>,
        player: Arc<Player>,
        sink: Arc<TestSink>,
        cancel: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn start_player(titles: &[&str], autoplaylist: Option<Arc<Autoplaylist>>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Arc::new(Queue::new(100));

        for title in titles {
            queue.add(test_entry(&downloader, title), false).unwrap();
        }

        let player = Player::new(
            Arc::clone(&queue),
            3,
            0.5,
            Arc::new(DirectUrlResolver::new()),
            Arc::clone(&downloader),
            autoplaylist,
        );
        let sink = TestSink::new();
        let cancel = CancellationToken::new();

        player.set_sink_bound(true);
        tokio::spawn(Arc::clone(&player).run(
            Arc::clone(&sink) as Arc<dyn VoiceSink>,
            cancel.clone(),
        ));

        Fixture {
            _tmp: tmp,
            downloader,
            queue,
            player,
            sink,
            cancel,
        }
    }

    async fn wait_state(player: &Player, target: PlayerState) {
        let mut rx = player.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
            .await
            .expect("timeout esperando estado")
            .expect("watch cerrado");
    }

    async fn wait_play_count(sink: &TestSink, target: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.play_count() < target {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timeout esperando reproducciones");
    }

    #[tokio::test]
    async fn test_natural_end_advances_in_order() {
        let fx = start_player(&["primera", "segunda"], None).await;

        wait_play_count(&fx.sink, 1).await;
        wait_state(&fx.player, PlayerState::Playing).await;
        assert_eq!(fx.player.now_playing().unwrap().title(), "primera");

        fx.sink.last_handle().unwrap().finish();
        wait_play_count(&fx.sink, 2).await;

        let played = fx.sink.played.lock().clone();
        assert!(played[0].0.to_string_lossy().contains("primera"));
        assert!(played[1].0.to_string_lossy().contains("segunda"));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let fx = start_player(&["pista"], None).await;
        wait_play_count(&fx.sink, 1).await;
        wait_state(&fx.player, PlayerState::Playing).await;

        fx.player.pause();
        wait_state(&fx.player, PlayerState::Paused).await;
        assert!(fx.sink.last_handle().unwrap().is_paused());

        fx.player.resume();
        wait_state(&fx.player, PlayerState::Playing).await;
        assert!(!fx.sink.last_handle().unwrap().is_paused());
    }

    #[tokio::test]
    async fn test_vote_skip_threshold() {
        let fx = start_player(&["pista"], None).await;
        wait_play_count(&fx.sink, 1).await;
        wait_state(&fx.player, PlayerState::Playing).await;

        assert_eq!(
            fx.player.vote_skip(UserId(1)),
            SkipOutcome::Voted { votes: 1, required: 3 }
        );
        assert_eq!(
            fx.player.vote_skip(UserId(2)),
            SkipOutcome::Voted { votes: 2, required: 3 }
        );
        // repetir un voto no suma
        assert_eq!(
            fx.player.vote_skip(UserId(1)),
            SkipOutcome::AlreadyVoted { votes: 2, required: 3 }
        );
        assert_eq!(fx.player.state(), PlayerState::Playing);

        assert_eq!(fx.player.vote_skip(UserId(3)), SkipOutcome::Skipped);
        wait_state(&fx.player, PlayerState::Idle).await;
        assert_eq!(fx.player.skip_vote_count(), 0);
        assert!(fx.player.now_playing().is_none());
    }

    #[tokio::test]
    async fn test_privileged_skip_bypasses_votes() {
        let fx = start_player(&["pista"], None).await;
        wait_play_count(&fx.sink, 1).await;
        wait_state(&fx.player, PlayerState::Playing).await;

        fx.player.vote_skip(UserId(1));
        assert_eq!(fx.player.force_skip(), SkipOutcome::Skipped);
        wait_state(&fx.player, PlayerState::Idle).await;
        assert_eq!(fx.player.skip_vote_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_terminal_until_restart() {
        let fx = start_player(&["primera", "segunda"], None).await;
        wait_play_count(&fx.sink, 1).await;
        wait_state(&fx.player, PlayerState::Playing).await;

        fx.player.stop();
        wait_state(&fx.player, PlayerState::Stopped).await;

        // la segunda pista sigue encolada y no arranca sola
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.sink.play_count(), 1);
        assert_eq!(fx.queue.len(), 1);

        fx.player.restart();
        wait_play_count(&fx.sink, 2).await;
        wait_state(&fx.player, PlayerState::Playing).await;
    }

    #[tokio::test]
    async fn test_failed_download_discards_and_advances() {
        struct BrokenFetcher;

        #[async_trait]
        impl MediaFetcher for BrokenFetcher {
            async fn content_length(&self, _url: &str) -> Result<Option<u64>, FetchError> {
                Ok(None)
            }
            async fn fetch(&self, _url: &str, _dest: &Path) -> Result<u64, FetchError> {
                Err(FetchError::Http("410 Gone".to_string()))
            }
        }

        let fx = start_player(&[], None).await;

        let broken_downloader = Arc::new(Downloader::new(
            fx.downloader.cache().clone(),
            Arc::new(BrokenFetcher),
            Arc::new(NullProbe),
            0,
            Duration::ZERO,
        ));
        let bad = Arc::new(Entry::new(
            "https://example.com/tracks/rota.mp3",
            crate::sources::ResolvedMedia::new("https://example.com/tracks/rota.mp3", "rota", "generic"),
            EntryMeta::default(),
            broken_downloader,
        ));

        fx.queue.add(bad, false).unwrap();
        fx.queue.add(test_entry(&fx.downloader, "buena"), false).unwrap();

        wait_play_count(&fx.sink, 1).await;
        let played = fx.sink.played.lock().clone();
        assert!(played[0].0.to_string_lossy().contains("buena"));
    }

    #[tokio::test]
    async fn test_pending_effects_apply_to_next_entry() {
        let fx = start_player(&[], None).await;

        fx.player.push_pending_effect(EffectDescriptor::Karaoke);
        fx.queue.add(test_entry(&fx.downloader, "pista"), false).unwrap();

        wait_play_count(&fx.sink, 1).await;
        let played = fx.sink.played.lock().clone();
        assert!(played[0].1.contains(&EffectDescriptor::Karaoke));
        assert_eq!(played[0].2, 0.5);
    }

    #[tokio::test]
    async fn test_autoplaylist_fallback_when_queue_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("autoplaylist.txt");
        tokio::fs::write(&file, "https://example.com/tracks/reserva.mp3\n")
            .await
            .unwrap();

        let fx = start_player(&[], Some(Arc::new(Autoplaylist::new(file)))).await;

        wait_play_count(&fx.sink, 1).await;
        let played = fx.sink.played.lock().clone();
        assert!(played[0].0.to_string_lossy().contains("reserva"));
    }

    #[tokio::test]
    async fn test_volume_is_clamped() {
        let fx = start_player(&[], None).await;
        fx.player.set_volume(1.8);
        assert_eq!(fx.player.volume(), 1.0);
        fx.player.set_volume(-0.2);
        assert_eq!(fx.player.volume(), 0.0);
    }

    #[test]
    fn test_progress_accounting() {
        let mut progress = Progress::new();
        std::thread::sleep(Duration::from_millis(20));
        progress.pause();
        let at_pause = progress.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        // pausado: el tiempo no avanza
        assert_eq!(progress.elapsed(), at_pause);
        progress.resume();
        assert!(progress.elapsed() >= at_pause);
    }
}
