//! # Voice Module
//!
//! Trait boundaries towards the two external collaborators the engine talks
//! to at playback time:
//!
//! - [`VoiceSink`]: the audio output for one session (connect / move /
//!   disconnect plus starting playback of a local file). The concrete
//!   transport (opus encoding, UDP, whatever the platform needs) lives
//!   outside the crate.
//! - [`SinkHandle`]: control surface over one in-flight track. `ended()`
//!   resolves when the sink stops outputting, which is what drives the
//!   player's state machine instead of fixed-interval polling.
//! - [`Messenger`]: the minimal chat surface needed for the "now playing"
//!   message lifecycle.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::audio::effects::EffectDescriptor;
use crate::error::VoiceConnectionError;
use crate::types::{ChannelId, MessageId};

/// Salida de audio de una sesión
#[async_trait]
pub trait VoiceSink: Send + Sync {
    async fn connect(&self, channel: ChannelId) -> Result<(), VoiceConnectionError>;

    async fn move_to(&self, channel: ChannelId) -> Result<(), VoiceConnectionError>;

    async fn disconnect(&self) -> Result<(), VoiceConnectionError>;

    /// Comienza a reproducir un fichero local con su cadena de efectos
    async fn play(
        &self,
        path: &Path,
        filters: &[EffectDescriptor],
        volume: f32,
    ) -> anyhow::Result<Arc<dyn SinkHandle>>;
}

/// Control sobre una pista en reproducción
#[async_trait]
pub trait SinkHandle: Send + Sync {
    fn pause(&self);

    fn resume(&self);

    fn stop(&self);

    fn set_volume(&self, volume: f32);

    /// `true` mientras el sink sigue emitiendo audio
    async fn is_active(&self) -> bool;

    /// Resuelve cuando el sink deja de emitir (fin natural o stop)
    async fn ended(&self);
}

/// Superficie mínima de mensajería para el mensaje de "now playing"
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, channel: ChannelId, text: &str) -> anyhow::Result<MessageId>;

    async fn edit(&self, channel: ChannelId, message: MessageId, text: &str) -> anyhow::Result<()>;

    async fn delete(&self, channel: ChannelId, message: MessageId) -> anyhow::Result<()>;

    /// `true` si el mensaje sigue siendo el último del bot en ese canal
    async fn is_latest(&self, channel: ChannelId, message: MessageId) -> bool;
}
