//! # Open Jukebox
//!
//! Per-channel media playback queue engine for chat music bots.
//!
//! Users submit media references, the engine resolves them to playable
//! audio, downloads and caches the files, and streams entries to a voice
//! sink one at a time with pause / resume / skip / shuffle control and
//! crash-recoverable persistence.
//!
//! The chat gateway, command parsing and the concrete audio transport stay
//! outside this crate: they plug in through the [`sources::MediaResolver`],
//! [`voice::VoiceSink`] and [`voice::Messenger`] traits and drive the engine
//! through [`session::Session`] and [`session::manager::SessionManager`].
//!
//! ## Quick tour
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use open_jukebox::config::Config;
//! use open_jukebox::session::manager::SessionManager;
//! use open_jukebox::sources::DirectUrlResolver;
//! use open_jukebox::types::{ChannelId, GroupId};
//!
//! # async fn example(
//! #     sink_factory: Arc<dyn open_jukebox::session::manager::VoiceSinkFactory>,
//! #     messenger: Arc<dyn open_jukebox::voice::Messenger>,
//! # ) -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let manager = SessionManager::new(
//!     config,
//!     Arc::new(DirectUrlResolver::new()),
//!     sink_factory,
//!     messenger,
//! )
//! .await?;
//!
//! let session = manager.get_or_create(GroupId(123)).await;
//! session.set_voice_binding(Some(ChannelId(456))).await?;
//! session
//!     .enqueue("https://example.com/song.mp3", None, None, false)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod cache;
pub mod config;
pub mod error;
pub mod session;
pub mod sources;
pub mod storage;
pub mod types;
pub mod voice;

pub use audio::entry::{Downloader, Entry, EntryMeta};
pub use audio::player::{Player, PlayerEvent, PlayerState, SkipOutcome};
pub use audio::queue::{Queue, QueueEvent};
pub use config::Config;
pub use error::{
    EnqueueError, ExtractionError, InvalidDataError, QueueFullError, VoiceConnectionError,
    WrongEntryTypeError,
};
pub use session::manager::{SessionManager, VoiceSinkFactory};
pub use session::Session;
pub use types::{ChannelId, GroupId, MessageId, UserId};
