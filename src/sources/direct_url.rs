// Resolver para URLs http(s) directas a ficheros de audio

use super::{MediaResolver, ResolveError, ResolvedMedia};
use crate::error::WrongEntryTypeError;
use async_trait::async_trait;
use url::Url;

const AUDIO_EXTENSIONS: [&str; 6] = [".mp3", ".wav", ".ogg", ".flac", ".m4a", ".opus"];

pub struct DirectUrlResolver {}

impl DirectUrlResolver {
    pub fn new() -> Self {
        Self {}
    }

    /// Saca un título legible del último segmento del path
    fn title_from_url(url: &Url) -> String {
        url.path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.to_string())
            .unwrap_or_else(|| url.to_string())
    }
}

impl Default for DirectUrlResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaResolver for DirectUrlResolver {
    async fn resolve(&self, reference: &str) -> Result<ResolvedMedia, ResolveError> {
        if !self.is_valid_reference(reference) {
            return Err(ResolveError::Unsupported(reference.to_string()));
        }

        let url = Url::parse(reference).map_err(|e| ResolveError::Failed {
            reference: reference.to_string(),
            reason: e.to_string(),
        })?;

        Ok(ResolvedMedia::new(
            reference,
            Self::title_from_url(&url),
            "generic",
        ))
    }

    async fn resolve_playlist(&self, reference: &str) -> Result<Vec<ResolvedMedia>, ResolveError> {
        // Una URL directa nunca es una playlist
        Err(ResolveError::WrongType(WrongEntryTypeError {
            reference: reference.to_string(),
            is_playlist: false,
        }))
    }

    fn is_valid_reference(&self, reference: &str) -> bool {
        if !reference.starts_with("http://") && !reference.starts_with("https://") {
            return false;
        }

        let lower = reference.to_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }

    fn resolver_name(&self) -> &'static str {
        "direct"
    }
}
