use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

/// Nombres de lock usados por la sesión
pub const LOCK_CHANGE_VOICE: &str = "change_voice";
pub const LOCK_QUEUE_SERIALIZATION: &str = "queue_serialization";
pub const LOCK_CURRENT_SONG: &str = "current_song";

/// Registro perezoso de locks con nombre
///
/// Cada operación serializable de la sesión adquiere el lock de su nombre
/// durante toda la sección crítica, incluidos los puntos de suspensión de
/// I/O que contenga. El mutex del registro solo protege la inserción en la
/// tabla, nunca la operación en sí. Locks de nombres distintos son
/// independientes, y cada sesión tiene su propio registro, así que grupos
/// distintos nunca se bloquean entre sí.
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Devuelve el lock de ese nombre, creándolo en el primer acceso
    pub fn get(&self, name: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.inner.lock();
        if !table.contains_key(name) {
            debug!("🔐 Lock creado: {}", name);
        }
        Arc::clone(
            table
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Cantidad de locks ya materializados
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
