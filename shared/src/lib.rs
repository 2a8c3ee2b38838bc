//! Client-side conversation sync core.
//!
//! Reconciles an incrementally updated, partly trusted view of a chat service
//! with local optimistic state. The shell owns all I/O and talks to the core
//! through Crux events and effects.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

mod actions;
mod activity;
pub mod app;
pub mod capabilities;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod ids;
pub mod inbox;
pub mod message;
pub mod meta;
pub mod notification;
pub mod ordinal;
pub mod outbox;
pub mod paginator;
pub mod pending;
pub mod projection;
pub mod selection;
pub mod send;
pub mod unbox_queue;

pub use app::{App, Event, Model};
pub use capabilities::{Capabilities, Effect};
pub use crux_core::{render::Render, App as CruxApp};
pub use engine::{Engine, EngineEvent};
pub use error::{ConfigError, EngineError, ErrorSeverity, Notice, RemoteError, RemoteErrorClass};
pub use ids::{ConversationIdKey, MessageId, OutboxId, TeamName, Username};
pub use notification::Notification;
pub use projection::ViewModel;
