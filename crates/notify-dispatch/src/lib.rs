//! notify-dispatch library crate.
//!
//! Pluggable notification dispatch: turns a [`model::Notification`] into a
//! provider payload, resolves the target channel and delivers it through a
//! [`adapter::DeliveryAdapter`] with retry and per-destination circuit breaking.

pub mod adapter;
pub mod breaker;
pub mod channel;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod render;
pub mod retry;
pub mod settings;

pub use adapter::{DeliveryAdapter, DeliveryOutcome};
pub use channel::{ChannelOption, ChannelResolver, ChannelSource, StaticChannelSource};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatchStats};
pub use error::{Error, ErrorCode, Result};
pub use model::{Attribute, AttributeStyle, Notification};
pub use render::Payload;
pub use settings::{FieldSchema, ModuleSettings, NotificationSettings};
