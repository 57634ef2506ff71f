//! Support widget composition root
//!
//! Wires one instance of every client component together from a
//! [`ClientConfig`]. Hosts that need other transports, clocks or storage
//! use [`SupportWidget::with_parts`].

use std::sync::Arc;

use tokio::task::JoinHandle;

use fleety_shared::WidgetResult;

use crate::api::ApiClient;
use crate::backoff::BackoffPolicy;
use crate::cache::TicketSyncCache;
use crate::chat::ChatClient;
use crate::config::ClientConfig;
use crate::events::EventBus;
use crate::multiplexer::ConnectionMultiplexer;
use crate::session::SessionManager;
use crate::storage::{JsonFileStore, TicketStore};
use crate::timer::{Timer, TokioTimer};
use crate::transport::{SocketConnector, TungsteniteConnector};
use crate::view::TicketView;

pub struct SupportWidget {
    config: ClientConfig,
    events: EventBus,
    session: SessionManager,
    multiplexer: ConnectionMultiplexer,
    chat: ChatClient,
    cache: TicketSyncCache,
    view: TicketView,
    autoloader: JoinHandle<()>,
}

impl SupportWidget {
    /// Build the widget with the WebSocket transport, tokio timers and a
    /// JSON file store. Must be called from within a tokio runtime.
    pub fn new(config: ClientConfig) -> WidgetResult<Self> {
        let connector = Arc::new(TungsteniteConnector::new(
            config.ws_url.clone(),
            config.request_timeout,
        ));
        let store = Arc::new(JsonFileStore::new(config.ticket_store_path.clone()));
        Self::with_parts(config, connector, Arc::new(TokioTimer), store)
    }

    pub fn with_parts(
        config: ClientConfig,
        connector: Arc<dyn SocketConnector>,
        timer: Arc<dyn Timer>,
        store: Arc<dyn TicketStore>,
    ) -> WidgetResult<Self> {
        let api = ApiClient::new(config.api_url.clone(), config.request_timeout)?;
        let events = EventBus::new();

        let session = SessionManager::new(
            api.clone(),
            config.project_id.clone(),
            config.session_renew_after,
            Arc::clone(&timer),
        );
        let multiplexer = ConnectionMultiplexer::new(
            connector,
            timer,
            BackoffPolicy::new(config.reconnect_base_delay, config.max_reconnect_attempts),
        );
        let chat = ChatClient::new(api.clone(), session.clone(), events.clone());
        let cache = TicketSyncCache::open(
            config.project_id.clone(),
            api.clone(),
            multiplexer.clone(),
            store,
        );
        let view = TicketView::new(
            config.project_id.clone(),
            api,
            cache.clone(),
            multiplexer.clone(),
        );
        let autoloader = view.follow_created(&events);

        tracing::info!(
            project_id = %config.project_id,
            api_url = %config.api_url,
            "Support widget initialized"
        );

        Ok(Self {
            config,
            events,
            session,
            multiplexer,
            chat,
            cache,
            view,
            autoloader,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn multiplexer(&self) -> &ConnectionMultiplexer {
        &self.multiplexer
    }

    pub fn chat(&self) -> &ChatClient {
        &self.chat
    }

    pub fn tickets(&self) -> &TicketSyncCache {
        &self.cache
    }

    pub fn view(&self) -> &TicketView {
        &self.view
    }

    /// Called when the visitor opens the widget: correct stale unread
    /// counts from the backend
    pub async fn on_open(&self) -> usize {
        self.cache.refresh_all().await
    }

    /// Stop timers, listeners and sockets
    pub fn shutdown(&self) {
        self.autoloader.abort();
        self.view.close();
        self.cache.shutdown();
        self.multiplexer.shutdown();
        self.session.shutdown();
        tracing::info!("Support widget shut down");
    }
}

impl Drop for SupportWidget {
    fn drop(&mut self) {
        self.autoloader.abort();
    }
}
