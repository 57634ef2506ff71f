//! Fleety Support Client
//!
//! Client side of the Fleety support widget: anonymous chat with the support
//! assistant, plus a local, live-updated view of the visitor's tickets.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod chat;
pub mod config;
pub mod events;
pub mod multiplexer;
pub mod session;
pub mod sse;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod view;
pub mod widget;

pub use api::ApiClient;
pub use backoff::BackoffPolicy;
pub use cache::TicketSyncCache;
pub use chat::{ChatClient, ReplyFragment, ReplyStream};
pub use config::{ClientConfig, ConfigError};
pub use events::{EventBus, WidgetEvent};
pub use multiplexer::{ChannelStatus, ConnectionMultiplexer, MultiplexerStats, Subscription};
pub use session::{SessionManager, SessionToken};
pub use storage::{JsonFileStore, MemoryStore, StorageError, TicketStore};
pub use timer::{Timer, TokioTimer};
pub use transport::{MemoryConnector, SocketConnector, SocketLink, TungsteniteConnector};
pub use view::TicketView;
pub use widget::SupportWidget;
