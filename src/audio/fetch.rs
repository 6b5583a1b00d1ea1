use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

/// Fallo de una transferencia individual
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transferencia interrumpida: llegaron menos bytes de los anunciados
    #[error("contenido demasiado corto: esperados {expected} bytes, recibidos {got}")]
    TooShort { expected: u64, got: u64 },
    #[error("error http: {0}")]
    Http(String),
    #[error("error de disco: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Solo la clase de truncamiento se considera transitoria y se reintenta
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::TooShort { .. })
    }
}

/// Trait para traer el contenido de una URL reproducible a disco
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Tamaño anunciado por el servidor, si lo publica
    async fn content_length(&self, url: &str) -> Result<Option<u64>, FetchError>;

    /// Descarga `url` a `dest` y devuelve los bytes escritos
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError>;
}

/// Fetcher real sobre reqwest con streaming a disco
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn content_length(&self, url: &str) -> Result<Option<u64>, FetchError> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| FetchError::Http(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::Http(format!("HEAD {} -> {}", url, resp.status())));
        }

        Ok(resp.content_length())
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| FetchError::Http(e.to_string()))?;

        let expected = resp.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = chunk.map_err(|e| FetchError::Http(e.to_string()))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if let Some(expected) = expected {
            if written < expected {
                return Err(FetchError::TooShort {
                    expected,
                    got: written,
                });
            }
        }

        debug!("⬇️ Descargados {} bytes de {}", written, url);
        Ok(written)
    }
}

/// Trait para sondear la duración de un fichero de audio ya descargado
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MediaProbe: Send + Sync {
    /// Duración del fichero, o `None` si no se pudo determinar
    ///
    /// El fallo del sondeo nunca es fatal: una duración desconocida cuenta
    /// como cero en las estimaciones de espera.
    async fn probe_duration(&self, path: &Path) -> Option<Duration>;
}

/// Sonda real basada en el binario externo `ffprobe`
pub struct FfprobeProbe {
    binary: String,
}

impl FfprobeProbe {
    pub fn new() -> Self {
        Self {
            binary: "ffprobe".to_string(),
        }
    }
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe_duration(&self, path: &Path) -> Option<Duration> {
        let output = async_process::Command::new(&self.binary)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("default=noprint_wrappers=1:nokey=1")
            .arg(path)
            .output()
            .await;

        let output = match output {
            Ok(out) => out,
            Err(e) => {
                warn!("⚠️ No se pudo ejecutar {}: {}", self.binary, e);
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                "⚠️ ffprobe terminó con error para {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        if seconds.is_finite() && seconds >= 0.0 {
            Some(Duration::from_secs_f64(seconds))
        } else {
            None
        }
    }
}

/// Sonda nula para cuando no interesa descubrir duraciones
pub struct NullProbe;

#[async_trait]
impl MediaProbe for NullProbe {
    async fn probe_duration(&self, _path: &Path) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_truncation_is_transient() {
        assert!(FetchError::TooShort {
            expected: 100,
            got: 10
        }
        .is_transient());
        assert!(!FetchError::Http("404".to_string()).is_transient());
        assert!(!FetchError::Io(std::io::Error::other("boom")).is_transient());
    }
}
