//! # Error Module
//!
//! Typed failure taxonomy for the playback engine.
//!
//! Most internal plumbing uses [`anyhow::Result`], but the failures that
//! callers are expected to match on get their own types here:
//!
//! - [`ExtractionError`]: resolution or download failed (possibly after
//!   retries), surfaced to everyone waiting on an entry.
//! - [`WrongEntryTypeError`]: a single-item operation received a playlist
//!   reference or vice versa, the caller must re-dispatch.
//! - [`InvalidDataError`]: persisted state is missing or carries the wrong
//!   format version, the loader substitutes an empty queue.
//! - [`VoiceConnectionError`]: a sink transition into the state it is already
//!   in, a benign signal rather than a crash.

use thiserror::Error;

/// La resolución o descarga de un entry falló de forma definitiva.
///
/// Se clona hacia todos los que esperan el mismo entry, por eso es `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("extracción fallida para {reference}: {reason}")]
pub struct ExtractionError {
    pub reference: String,
    pub reason: String,
}

impl ExtractionError {
    pub fn new(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            reason: reason.into(),
        }
    }
}

/// Una operación de item único recibió una playlist, o al revés.
#[derive(Debug, Clone, Error)]
pub struct WrongEntryTypeError {
    pub reference: String,
    /// `true` si la referencia resultó ser una playlist
    pub is_playlist: bool,
}

impl std::fmt::Display for WrongEntryTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_playlist {
            write!(f, "{} es una playlist, no un item único", self.reference)
        } else {
            write!(f, "{} es un item único, no una playlist", self.reference)
        }
    }
}

/// Estado persistido ausente o con versión de formato incompatible.
#[derive(Debug, Clone, Error)]
#[error("datos persistidos inválidos: {reason}")]
pub struct InvalidDataError {
    pub reason: String,
}

impl InvalidDataError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Transición del sink de voz hacia un estado en el que ya está.
///
/// Señal benigna: el llamador normalmente la reporta y sigue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VoiceConnectionError {
    #[error("ya hay una conexión de voz activa")]
    AlreadyConnected,
    #[error("no hay ninguna conexión de voz activa")]
    NotConnected,
    #[error("ya estamos en ese canal de voz")]
    AlreadyInChannel,
}

/// La cola alcanzó su tamaño máximo configurado.
#[derive(Debug, Clone, Copy, Error)]
#[error("la cola está llena (máximo {max} canciones)")]
pub struct QueueFullError {
    pub max: usize,
}

/// Fallo visible al usuario al encolar una referencia.
///
/// Distingue la causa concreta para que el dispatcher pueda responder algo
/// mejor que un error genérico.
#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("referencia no soportada: {0}")]
    Unsupported(String),
    #[error(transparent)]
    WrongType(#[from] WrongEntryTypeError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    QueueFull(#[from] QueueFullError),
}
