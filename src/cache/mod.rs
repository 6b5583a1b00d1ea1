//! # Cache Module
//!
//! Content-addressed audio file cache shared by every session.
//!
//! Each downloaded item lands in a single shared directory under a
//! deterministic name, so a second request for the same item never hits the
//! network again. Names are derived from the extractor id plus the catalog
//! item id, or from a content hash of the URL for generic sources.
//!
//! ## Naming
//!
//! ```text
//! <extractor>-<item_id>.<ext>      # catalogued sources
//! generic-<sha256-prefix>.<ext>    # generic (hash of the playable URL)
//! ```
//!
//! ## Atomicity
//!
//! Downloads are written to a hidden temp file in the same directory and
//! renamed to the final name only once the transfer is complete, so a
//! concurrent reader never observes a partial file under the final name.
//! If another task won the race and the final name already exists, the
//! redundant temp file is simply discarded.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::fs;
use tracing::{debug, info};

/// Caché de ficheros de audio descargados
#[derive(Debug, Clone)]
pub struct AudioCache {
    dir: PathBuf,
}

impl AudioCache {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("📁 Caché de audio inicializado en: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Nombre base determinista para un item resuelto
    ///
    /// Con `item_id` el nombre sale del catálogo del extractor; sin él se usa
    /// un prefijo del hash de la URL para desambiguar fuentes genéricas.
    pub fn expected_basename(extractor_id: &str, item_id: Option<&str>, url: &str) -> String {
        match item_id {
            Some(id) => format!("{}-{}", sanitize(extractor_id), sanitize(id)),
            None => {
                let digest = Sha256::digest(url.as_bytes());
                let hash = hex_prefix(&digest, 16);
                format!("{}-{}", sanitize(extractor_id), hash)
            }
        }
    }

    /// Busca un fichero ya descargado con ese nombre base
    ///
    /// Acepta cualquier extensión: un `youtube-abc123.webm` previo sirve
    /// aunque ahora esperásemos `.m4a`.
    pub async fn find_existing(&self, basename: &str) -> Option<PathBuf> {
        let mut dir = fs::read_dir(&self.dir).await.ok()?;
        while let Ok(Some(dir_entry)) = dir.next_entry().await {
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str());
            if stem == Some(basename) {
                debug!("✅ Cache hit para {}: {}", basename, path.display());
                return Some(path);
            }
        }
        None
    }

    /// Ruta final para un nombre base y extensión
    pub fn final_path(&self, basename: &str, extension: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", basename, extension))
    }

    /// Renombra un fichero temporal completo a su nombre final
    ///
    /// Si otro descargador llegó antes y el nombre final ya existe, el
    /// temporal sobrante se descarta y se reutiliza el existente. Con
    /// `overwrite` el renombrado reemplaza el fichero anterior (caso de
    /// revalidación fallida de una fuente genérica).
    pub async fn commit(&self, temp: TempPath, final_path: &Path, overwrite: bool) -> Result<PathBuf> {
        if !overwrite && fs::try_exists(final_path).await.unwrap_or(false) {
            debug!(
                "♻️ {} ya existe, descartando temporal redundante",
                final_path.display()
            );
            drop(temp);
            return Ok(final_path.to_path_buf());
        }

        temp.persist(final_path)
            .map_err(|e| anyhow::anyhow!("no se pudo renombrar la descarga: {}", e))?;
        debug!("💾 Descarga confirmada en {}", final_path.display());
        Ok(final_path.to_path_buf())
    }

    /// Tamaño del fichero local, si existe
    pub async fn local_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).await.ok().map(|m| m.len())
    }
}

/// Sustituye caracteres problemáticos para nombres de fichero
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}
