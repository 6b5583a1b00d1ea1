pub mod direct_url;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::error::WrongEntryTypeError;

pub use direct_url::DirectUrlResolver;

/// Fallo al resolver una referencia de usuario
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("referencia no soportada: {0}")]
    Unsupported(String),
    #[error(transparent)]
    WrongType(#[from] WrongEntryTypeError),
    #[error("no se pudo resolver {reference}: {reason}")]
    Failed { reference: String, reason: String },
}

/// Trait común para todas las librerías de resolución de medios
///
/// Convierte la referencia que escribió el usuario en una URL reproducible
/// con metadatos. Las implementaciones concretas para servicios catalogados
/// viven fuera del motor; aquí solo se define la frontera.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Resuelve una referencia a un único item reproducible
    async fn resolve(&self, reference: &str) -> Result<ResolvedMedia, ResolveError>;

    /// Resuelve una referencia de playlist a una lista de items
    async fn resolve_playlist(&self, reference: &str) -> Result<Vec<ResolvedMedia>, ResolveError>;

    /// Verifica si la referencia es válida para este resolver
    fn is_valid_reference(&self, reference: &str) -> bool;

    /// Nombre del resolver
    fn resolver_name(&self) -> &'static str;
}

/// Metadatos de un item ya resuelto
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMedia {
    pub playable_url: String,
    pub title: String,
    pub duration: Option<Duration>,
    /// Identificador del extractor que resolvió la referencia
    pub extractor_id: String,
    /// Identificador del item dentro del catálogo del extractor
    ///
    /// `None` para fuentes genéricas sin catálogo; ahí el nombre de caché
    /// sale de un hash del contenido de la URL.
    pub item_id: Option<String>,
    pub thumbnail: Option<String>,
}

impl ResolvedMedia {
    pub fn new(playable_url: impl Into<String>, title: impl Into<String>, extractor_id: impl Into<String>) -> Self {
        Self {
            playable_url: playable_url.into(),
            title: title.into(),
            duration: None,
            extractor_id: extractor_id.into(),
            item_id: None,
            thumbnail: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = Some(item_id.into());
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: impl Into<String>) -> Self {
        self.thumbnail = Some(thumbnail.into());
        self
    }

    /// `true` si el item no viene de un catálogo identificable
    pub fn is_generic(&self) -> bool {
        self.item_id.is_none()
    }
}
