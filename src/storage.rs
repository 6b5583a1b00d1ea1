//! # Storage Module
//!
//! Crash-recoverable persistence for each session, JSON files on disk.
//!
//! Layout per group:
//!
//! ```text
//! data/<group-id>/queue.json    # versioned snapshot of current + queued entries
//! data/<group-id>/current.txt   # plain-text title of the playing entry
//! data/autoplaylist.txt         # shared fallback references, one per line
//! ```
//!
//! The queue snapshot carries an explicit format version. Loading checks the
//! tag before touching anything else: a missing or mismatched version is an
//! [`InvalidDataError`] and the caller substitutes an empty queue instead of
//! guessing at the contents.

use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::audio::effects::EffectDescriptor;
use crate::audio::entry::{Downloader, Entry, EntryMeta};
use crate::error::InvalidDataError;
use crate::sources::ResolvedMedia;
use crate::types::{ChannelId, GroupId, UserId};

/// Versión actual del formato de cola persistida
pub const QUEUE_FORMAT_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub entries: Vec<EntrySnapshot>,
}

/// Un entry congelado en disco
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub version: u32,
    pub info: InfoSnapshot,
    pub downloaded: bool,
    pub filename: Option<PathBuf>,
    pub meta: MetaSnapshot,
    pub aoptions: Vec<EffectDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoSnapshot {
    pub reference: String,
    pub media: ResolvedMedia,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaSnapshot {
    pub requested_by: Option<UserId>,
    pub channel: Option<ChannelId>,
}

impl EntrySnapshot {
    /// Congela el estado reproducible de un entry
    pub fn capture(entry: &Entry) -> Self {
        let mut media = entry.info().clone();
        media.duration = entry.duration();

        Self {
            version: QUEUE_FORMAT_VERSION,
            info: InfoSnapshot {
                reference: entry.reference().to_string(),
                media,
            },
            downloaded: entry.is_downloaded(),
            filename: entry.filename(),
            meta: MetaSnapshot {
                requested_by: entry.meta().requested_by,
                channel: entry.meta().channel,
            },
            aoptions: entry.aoptions(),
        }
    }

    /// Reconstruye el entry; una descarga previa se reusa si el fichero sigue ahí
    pub fn restore(self, downloader: &Arc<Downloader>) -> Arc<Entry> {
        let entry = Arc::new(Entry::new(
            self.info.reference,
            self.info.media,
            EntryMeta {
                requested_by: self.meta.requested_by,
                channel: self.meta.channel,
                added_at: None,
            },
            Arc::clone(downloader),
        ));

        entry.set_aoptions(self.aoptions);

        if self.downloaded {
            if let Some(path) = self.filename {
                entry.restore_download(path);
            }
        }

        entry
    }
}

/// Ficheros persistidos de un grupo concreto
#[derive(Debug, Clone)]
pub struct GroupStore {
    dir: PathBuf,
}

impl GroupStore {
    pub fn new(data_dir: &Path, group: GroupId) -> Self {
        Self {
            dir: data_dir.join(group.to_string()),
        }
    }

    pub fn queue_file(&self) -> PathBuf {
        self.dir.join("queue.json")
    }

    pub fn current_file(&self) -> PathBuf {
        self.dir.join("current.txt")
    }

    /// Escribe el snapshot versionado de la cola (entry actual primero)
    pub async fn save_queue(
        &self,
        current: Option<&Arc<Entry>>,
        entries: &[Arc<Entry>],
    ) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut snapshots = Vec::with_capacity(entries.len() + 1);
        if let Some(entry) = current {
            snapshots.push(EntrySnapshot::capture(entry));
        }
        for entry in entries {
            snapshots.push(EntrySnapshot::capture(entry));
        }

        let snapshot = QueueSnapshot {
            version: QUEUE_FORMAT_VERSION,
            entries: snapshots,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        fs::write(self.queue_file(), content).await?;
        debug!(
            "💾 Cola persistida para {} ({} entries)",
            self.dir.display(),
            snapshot.entries.len()
        );
        Ok(())
    }

    /// Lee el snapshot persistido, validando la versión antes que nada
    pub async fn load_queue(&self) -> Result<Vec<EntrySnapshot>, InvalidDataError> {
        let content = fs::read_to_string(self.queue_file()).await.map_err(|e| {
            InvalidDataError::new(format!("no se pudo leer la cola persistida: {}", e))
        })?;

        let raw: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| InvalidDataError::new(format!("JSON inválido: {}", e)))?;

        match raw.get("version").and_then(|v| v.as_u64()) {
            Some(v) if v == QUEUE_FORMAT_VERSION as u64 => {}
            Some(v) => {
                return Err(InvalidDataError::new(format!(
                    "versión de formato {} no soportada (esperada {})",
                    v, QUEUE_FORMAT_VERSION
                )))
            }
            None => return Err(InvalidDataError::new("falta la etiqueta de versión")),
        }

        let snapshot: QueueSnapshot = serde_json::from_value(raw)
            .map_err(|e| InvalidDataError::new(format!("snapshot malformado: {}", e)))?;

        Ok(snapshot.entries)
    }

    /// Reescribe current.txt en cada cambio de pista
    pub async fn write_current(&self, title: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.current_file(), title).await?;
        Ok(())
    }

    pub async fn clear_current(&self) -> Result<()> {
        match fs::remove_file(self.current_file()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_current(&self) -> Option<String> {
        fs::read_to_string(self.current_file()).await.ok()
    }
}

/// Lista de reserva persistente para cuando la cola se queda vacía
///
/// Una referencia por línea; las líneas vacías y los comentarios `#` se
/// ignoran. Las elecciones consumen la lista en memoria y al agotarse se
/// recarga desde disco. Las referencias marcadas como malas se descartan en
/// memoria y no vuelven al recargar; el fichero nunca se reescribe desde
/// aquí.
pub struct Autoplaylist {
    path: PathBuf,
    remaining: Mutex<Vec<String>>,
    bad: Mutex<HashSet<String>>,
}

impl Autoplaylist {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            remaining: Mutex::new(Vec::new()),
            bad: Mutex::new(HashSet::new()),
        }
    }

    /// Elige una referencia al azar, recargando la lista si está agotada
    pub async fn pick(&self) -> Option<String> {
        if self.remaining.lock().is_empty() {
            self.reload().await;
        }

        let mut remaining = self.remaining.lock();
        if remaining.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..remaining.len());
        Some(remaining.swap_remove(index))
    }

    /// Descarta una referencia que no se pudo reproducir
    pub fn mark_bad(&self, reference: &str) {
        warn!("🚫 Referencia de autoplaylist descartada: {}", reference);
        self.bad.lock().insert(reference.to_string());
        self.remaining.lock().retain(|r| r != reference);
    }

    async fn reload(&self) {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("📭 Sin autoplaylist en {}: {}", self.path.display(), e);
                return;
            }
        };

        let bad = self.bad.lock().clone();
        let references: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter(|line| !bad.contains(*line))
            .map(String::from)
            .collect();

        info!(
            "🔁 Autoplaylist recargada: {} referencias desde {}",
            references.len(),
            self.path.display()
        );
        *self.remaining.lock() = references;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{test_downloader, test_entry, test_entry_with_duration};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(&tmp.path().join("cache")).await;
        let store = GroupStore::new(&tmp.path().join("data"), GroupId(42));

        let entries = vec![
            test_entry_with_duration(&downloader, "primera", Duration::from_secs(120)),
            test_entry(&downloader, "segunda"),
            test_entry(&downloader, "tercera"),
        ];
        entries[1].push_aoption(EffectDescriptor::Karaoke);

        store.save_queue(None, &entries).await.unwrap();
        let restored = store.load_queue().await.unwrap();

        assert_eq!(restored.len(), 3);
        let rebuilt: Vec<_> = restored
            .into_iter()
            .map(|s| s.restore(&downloader))
            .collect();

        for (original, copy) in entries.iter().zip(&rebuilt) {
            assert_eq!(original.title(), copy.title());
            assert_eq!(original.url(), copy.url());
        }
        assert_eq!(rebuilt[0].duration(), Some(Duration::from_secs(120)));
        assert_eq!(rebuilt[1].aoptions(), vec![EffectDescriptor::Karaoke]);
    }

    #[tokio::test]
    async fn test_current_entry_is_saved_first() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(&tmp.path().join("cache")).await;
        let store = GroupStore::new(&tmp.path().join("data"), GroupId(7));

        let current = test_entry(&downloader, "sonando");
        let queued = vec![test_entry(&downloader, "siguiente")];

        store.save_queue(Some(&current), &queued).await.unwrap();
        let restored = store.load_queue().await.unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored[0].info.media.title, "sonando");
        assert_eq!(restored[1].info.media.title, "siguiente");
    }

    #[tokio::test]
    async fn test_version_mismatch_is_invalid_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GroupStore::new(tmp.path(), GroupId(1));

        tokio::fs::create_dir_all(tmp.path().join("1")).await.unwrap();
        tokio::fs::write(
            store.queue_file(),
            r#"{ "version": 99, "entries": [] }"#,
        )
        .await
        .unwrap();

        let err = store.load_queue().await.unwrap_err();
        assert!(err.reason.contains("99"));
    }

    #[tokio::test]
    async fn test_missing_version_tag_is_invalid_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GroupStore::new(tmp.path(), GroupId(1));

        tokio::fs::create_dir_all(tmp.path().join("1")).await.unwrap();
        tokio::fs::write(store.queue_file(), r#"{ "entries": [] }"#)
            .await
            .unwrap();

        let err = store.load_queue().await.unwrap_err();
        assert!(err.reason.contains("versión"));
    }

    #[tokio::test]
    async fn test_missing_file_is_invalid_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GroupStore::new(tmp.path(), GroupId(1));
        assert!(store.load_queue().await.is_err());
    }

    #[tokio::test]
    async fn test_current_txt_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let store = GroupStore::new(tmp.path(), GroupId(3));

        store.write_current("Mi Canción").await.unwrap();
        assert_eq!(store.read_current().await.unwrap(), "Mi Canción");

        store.clear_current().await.unwrap();
        assert!(store.read_current().await.is_none());

        // limpiar dos veces no falla
        store.clear_current().await.unwrap();
    }

    #[tokio::test]
    async fn test_autoplaylist_pick_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("autoplaylist.txt");
        tokio::fs::write(&file, "# comentario\nref-a\n\nref-b\n")
            .await
            .unwrap();

        let list = Autoplaylist::new(file);

        let mut picked = vec![list.pick().await.unwrap(), list.pick().await.unwrap()];
        picked.sort();
        assert_eq!(picked, vec!["ref-a", "ref-b"]);

        // agotada: la siguiente elección recarga desde disco
        assert!(list.pick().await.is_some());
    }

    #[tokio::test]
    async fn test_autoplaylist_mark_bad_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("autoplaylist.txt");
        tokio::fs::write(&file, "ref-a\nref-b\n").await.unwrap();

        let list = Autoplaylist::new(file);
        list.mark_bad("ref-a");

        for _ in 0..4 {
            assert_eq!(list.pick().await.unwrap(), "ref-b");
        }
    }

    #[tokio::test]
    async fn test_autoplaylist_missing_file_is_empty() {
        let list = Autoplaylist::new(PathBuf::from("/nonexistent/autoplaylist.txt"));
        assert!(list.pick().await.is_none());
    }
}
