//! Dobles de prueba compartidos entre los tests del crate

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::audio::effects::EffectDescriptor;
use crate::audio::entry::{Downloader, Entry, EntryMeta};
use crate::audio::fetch::{FetchError, MediaFetcher, NullProbe};
use crate::cache::AudioCache;
use crate::error::VoiceConnectionError;
use crate::sources::ResolvedMedia;
use crate::types::{ChannelId, MessageId};
use crate::voice::{Messenger, SinkHandle, VoiceSink};

/// Fetcher instantáneo que siempre escribe el mismo payload
pub(crate) struct InstantFetcher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl MediaFetcher for InstantFetcher {
    async fn content_length(&self, _url: &str) -> Result<Option<u64>, FetchError> {
        Ok(None)
    }

    async fn fetch(&self, _url: &str, dest: &Path) -> Result<u64, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(dest, b"test-audio").await?;
        Ok(10)
    }
}

pub(crate) async fn test_downloader(dir: &Path) -> Arc<Downloader> {
    let cache = AudioCache::new(dir.to_path_buf()).await.unwrap();
    Arc::new(Downloader::new(
        cache,
        Arc::new(InstantFetcher {
            calls: AtomicUsize::new(0),
        }),
        Arc::new(NullProbe),
        2,
        Duration::from_millis(1),
    ))
}

pub(crate) fn test_entry(downloader: &Arc<Downloader>, title: &str) -> Arc<Entry> {
    let url = format!("https://example.com/tracks/{}.mp3", title);
    Arc::new(Entry::new(
        url.clone(),
        ResolvedMedia::new(url, title, "generic"),
        EntryMeta::default(),
        Arc::clone(downloader),
    ))
}

pub(crate) fn test_entry_with_duration(
    downloader: &Arc<Downloader>,
    title: &str,
    duration: Duration,
) -> Arc<Entry> {
    let url = format!("https://example.com/tracks/{}.mp3", title);
    Arc::new(Entry::new(
        url.clone(),
        ResolvedMedia::new(url, title, "generic").with_duration(duration),
        EntryMeta::default(),
        Arc::clone(downloader),
    ))
}

/// Handle de prueba: un `watch` hace de señal de fin de pista
pub(crate) struct TestHandle {
    active: watch::Sender<bool>,
    pub paused: AtomicBool,
    pub volume: Mutex<f32>,
}

impl TestHandle {
    fn new() -> Arc<Self> {
        let (active, _) = watch::channel(true);
        Arc::new(Self {
            active,
            paused: AtomicBool::new(false),
            volume: Mutex::new(1.0),
        })
    }

    /// Simula el fin natural de la pista
    pub fn finish(&self) {
        let _ = self.active.send(false);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SinkHandle for TestHandle {
    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        let _ = self.active.send(false);
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock() = volume;
    }

    async fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    async fn ended(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|active| !*active).await;
    }
}

/// Sink de prueba que registra lo reproducido y sus handles
#[derive(Default)]
pub(crate) struct TestSink {
    pub connected: Mutex<Option<ChannelId>>,
    pub played: Mutex<Vec<(PathBuf, Vec<EffectDescriptor>, f32)>>,
    pub handles: Mutex<Vec<Arc<TestHandle>>>,
}

impl TestSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Último handle entregado al player
    pub fn last_handle(&self) -> Option<Arc<TestHandle>> {
        self.handles.lock().last().cloned()
    }

    pub fn play_count(&self) -> usize {
        self.played.lock().len()
    }
}

/// Mensajero de prueba que registra toda la actividad
#[derive(Default)]
pub(crate) struct TestMessenger {
    next_id: AtomicUsize,
    pub sent: Mutex<Vec<(ChannelId, MessageId, String)>>,
    pub edited: Mutex<Vec<(ChannelId, MessageId, String)>>,
    pub deleted: Mutex<Vec<(ChannelId, MessageId)>>,
    /// Controla lo que responde `is_latest`
    pub latest: AtomicBool,
}

impl TestMessenger {
    pub fn new() -> Arc<Self> {
        let messenger = Self::default();
        messenger.latest.store(true, Ordering::SeqCst);
        Arc::new(messenger)
    }
}

#[async_trait]
impl Messenger for TestMessenger {
    async fn send(&self, channel: ChannelId, text: &str) -> anyhow::Result<MessageId> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) as u64 + 1);
        self.sent.lock().push((channel, id, text.to_string()));
        Ok(id)
    }

    async fn edit(&self, channel: ChannelId, message: MessageId, text: &str) -> anyhow::Result<()> {
        self.edited.lock().push((channel, message, text.to_string()));
        Ok(())
    }

    async fn delete(&self, channel: ChannelId, message: MessageId) -> anyhow::Result<()> {
        self.deleted.lock().push((channel, message));
        Ok(())
    }

    async fn is_latest(&self, _channel: ChannelId, _message: MessageId) -> bool {
        self.latest.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceSink for TestSink {
    async fn connect(&self, channel: ChannelId) -> Result<(), VoiceConnectionError> {
        *self.connected.lock() = Some(channel);
        Ok(())
    }

    async fn move_to(&self, channel: ChannelId) -> Result<(), VoiceConnectionError> {
        *self.connected.lock() = Some(channel);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), VoiceConnectionError> {
        *self.connected.lock() = None;
        Ok(())
    }

    async fn play(
        &self,
        path: &Path,
        filters: &[EffectDescriptor],
        volume: f32,
    ) -> anyhow::Result<Arc<dyn SinkHandle>> {
        let handle = TestHandle::new();
        self.played
            .lock()
            .push((path.to_path_buf(), filters.to_vec(), volume));
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}
