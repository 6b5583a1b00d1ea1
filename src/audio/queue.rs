use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audio::entry::Entry;
use crate::error::{ExtractionError, QueueFullError};

/// Notificación emitida por la cola hacia sus observadores
#[derive(Debug, Clone)]
pub enum QueueEvent {
    EntryAdded { title: String, head: bool },
    EntryRemoved { title: String },
    Cleared,
    Shuffled,
}

/// Cola ordenada de entries de una sesión
///
/// FIFO salvo shuffle explícito. Solo la cabeza se predescarga: al agregar un
/// entry que queda en cabeza y al extraer la cabeza (para solapar la descarga
/// del siguiente con la reproducción del actual).
pub struct Queue {
    entries: RwLock<VecDeque<Arc<Entry>>>,
    events: broadcast::Sender<QueueEvent>,
    max_size: usize,
}

impl Queue {
    pub fn new(max_size: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: RwLock::new(VecDeque::new()),
            events,
            max_size,
        }
    }

    /// Canal de eventos de la cola
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Agrega un entry al final, o al principio con `priority`
    ///
    /// Si el entry queda en cabeza su descarga arranca inmediatamente en
    /// segundo plano, antes de que el player lo necesite.
    pub fn add(&self, entry: Arc<Entry>, priority: bool) -> Result<(), QueueFullError> {
        let head = {
            let mut q = self.entries.write();
            if q.len() >= self.max_size {
                return Err(QueueFullError { max: self.max_size });
            }
            if priority {
                q.push_front(Arc::clone(&entry));
            } else {
                q.push_back(Arc::clone(&entry));
            }
            q.len() == 1 || priority
        };

        info!("➕ Agregado a la cola: {}", entry.title());
        let _ = self.events.send(QueueEvent::EntryAdded {
            title: entry.title().to_string(),
            head,
        });

        if head {
            Self::prefetch(entry);
        }
        Ok(())
    }

    /// Extrae la cabeza y espera a que sea reproducible
    ///
    /// Con `predownload_next` la nueva cabeza empieza a descargarse en cuanto
    /// se extrae la anterior. Devuelve `None` con la cola vacía.
    pub async fn pop_next(
        &self,
        predownload_next: bool,
    ) -> Option<Result<Arc<Entry>, ExtractionError>> {
        let entry = self.entries.write().pop_front()?;

        if predownload_next {
            if let Some(next) = self.peek() {
                debug!("🚚 Predescargando la nueva cabeza: {}", next.title());
                Self::prefetch(next);
            }
        }

        Some(entry.ready().await)
    }

    /// Cabeza de la cola sin extraerla
    pub fn peek(&self) -> Option<Arc<Entry>> {
        self.entries.read().front().cloned()
    }

    /// Mezcla la cola en sitio; las predescargas en vuelo no se tocan
    pub fn shuffle(&self) {
        {
            let mut q = self.entries.write();
            let mut items: Vec<_> = q.drain(..).collect();
            items.shuffle(&mut rand::thread_rng());
            q.extend(items);
        }
        info!("🔀 Cola mezclada");
        let _ = self.events.send(QueueEvent::Shuffled);
    }

    /// Espera estimada hasta la posición dada
    ///
    /// Suma las duraciones conocidas de los entries anteriores a `position`
    /// más lo que queda del actual; las desconocidas cuentan como cero, así
    /// que es una aproximación, no una garantía.
    pub fn estimate_wait(&self, position: usize, current_remaining: Duration) -> Duration {
        let queued: Duration = self
            .entries
            .read()
            .iter()
            .take(position)
            .filter_map(|e| e.duration())
            .sum();
        queued + current_remaining
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Vacía la cola
    pub fn clear(&self) {
        self.entries.write().clear();
        info!("🗑️ Cola limpiada");
        let _ = self.events.send(QueueEvent::Cleared);
    }

    /// Elimina el entry en esa posición
    pub fn remove_at(&self, index: usize) -> Option<Arc<Entry>> {
        let removed = self.entries.write().remove(index);
        if let Some(entry) = &removed {
            debug!("❌ Entry eliminado de la posición {}: {}", index, entry.title());
            let _ = self.events.send(QueueEvent::EntryRemoved {
                title: entry.title().to_string(),
            });
        }
        removed
    }

    /// Copia del contenido actual, para estado y persistencia
    pub fn entries(&self) -> Vec<Arc<Entry>> {
        self.entries.read().iter().cloned().collect()
    }

    fn prefetch(entry: Arc<Entry>) {
        let title = entry.title().to_string();
        tokio::spawn(async move {
            if let Err(e) = entry.ready().await {
                warn!("⚠️ Predescarga fallida de {}: {}", title, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testutil::{test_downloader, test_entry, test_entry_with_duration};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_pop_preserves_enqueue_order() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Queue::new(100);

        let titles = ["uno", "dos", "tres", "cuatro", "cinco"];
        for title in titles {
            queue.add(test_entry(&downloader, title), false).unwrap();
        }

        for expected in titles {
            let entry = queue.pop_next(true).await.unwrap().unwrap();
            assert_eq!(entry.title(), expected);
        }
        assert!(queue.pop_next(true).await.is_none());
    }

    #[tokio::test]
    async fn test_priority_add_goes_to_head() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Queue::new(100);

        queue.add(test_entry(&downloader, "normal"), false).unwrap();
        queue.add(test_entry(&downloader, "urgente"), true).unwrap();

        assert_eq!(queue.peek().unwrap().title(), "urgente");
        let first = queue.pop_next(false).await.unwrap().unwrap();
        assert_eq!(first.title(), "urgente");
    }

    #[tokio::test]
    async fn test_full_queue_rejects_add() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Queue::new(2);

        queue.add(test_entry(&downloader, "a"), false).unwrap();
        queue.add(test_entry(&downloader, "b"), false).unwrap();
        let err = queue.add(test_entry(&downloader, "c"), false).unwrap_err();

        assert_eq!(err.max, 2);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_add_emits_entry_added_event() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Queue::new(100);
        let mut events = queue.subscribe();

        queue.add(test_entry(&downloader, "pista"), false).unwrap();

        match events.recv().await.unwrap() {
            QueueEvent::EntryAdded { title, head } => {
                assert_eq!(title, "pista");
                assert!(head);
            }
            other => panic!("evento inesperado: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_estimate_wait_ignores_unknown_durations() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Queue::new(100);

        queue
            .add(
                test_entry_with_duration(&downloader, "a", Duration::from_secs(60)),
                false,
            )
            .unwrap();
        queue.add(test_entry(&downloader, "sin-duracion"), false).unwrap();
        queue
            .add(
                test_entry_with_duration(&downloader, "c", Duration::from_secs(30)),
                false,
            )
            .unwrap();

        let wait = queue.estimate_wait(3, Duration::from_secs(10));
        assert_eq!(wait, Duration::from_secs(100));

        let wait_head = queue.estimate_wait(0, Duration::ZERO);
        assert_eq!(wait_head, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_shuffle_keeps_same_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = test_downloader(tmp.path()).await;
        let queue = Queue::new(100);

        for title in ["a", "b", "c", "d", "e", "f"] {
            queue.add(test_entry(&downloader, title), false).unwrap();
        }

        queue.shuffle();

        let mut titles: Vec<String> = queue
            .entries()
            .iter()
            .map(|e| e.title().to_string())
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["a", "b", "c", "d", "e", "f"]);
    }
}
