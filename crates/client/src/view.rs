//! Foreground ticket view
//!
//! Shows one ticket at a time with live updates. While a ticket is open, the
//! view owns its updates and the cache skips it; every update received here
//! also marks the thread read, since the visitor is looking at it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use fleety_shared::{
    AddMessageRequest, MessageAuthor, MessageKind, ProjectId, PushKind, PushMessage, Reader,
    SubscriptionKey, Ticket, TicketMessage, TicketSlug, WidgetError, WidgetResult,
    PROVISIONAL_ID_PREFIX,
};

use crate::api::ApiClient;
use crate::cache::TicketSyncCache;
use crate::events::{EventBus, WidgetEvent};
use crate::multiplexer::{sequential, ConnectionMultiplexer, Subscription};

struct ViewInner {
    project_id: ProjectId,
    api: ApiClient,
    cache: TicketSyncCache,
    multiplexer: ConnectionMultiplexer,
    current: watch::Sender<Option<Ticket>>,
    foreground: Mutex<Option<Subscription>>,
    /// Provisional message ids whose send has not settled
    pending: Mutex<HashSet<String>>,
}

#[derive(Clone)]
pub struct TicketView {
    inner: Arc<ViewInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TicketView {
    pub fn new(
        project_id: ProjectId,
        api: ApiClient,
        cache: TicketSyncCache,
        multiplexer: ConnectionMultiplexer,
    ) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(ViewInner {
                project_id,
                api,
                cache,
                multiplexer,
                current,
                foreground: Mutex::new(None),
                pending: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Ticket currently shown, with any unconfirmed messages
    pub fn current(&self) -> Option<Ticket> {
        self.inner.current.borrow().clone()
    }

    pub fn current_slug(&self) -> Option<TicketSlug> {
        self.inner
            .current
            .borrow()
            .as_ref()
            .map(|t| t.slug.clone())
    }

    /// Observe the shown ticket
    pub fn watch(&self) -> watch::Receiver<Option<Ticket>> {
        self.inner.current.subscribe()
    }

    /// Load a ticket, show it, and mark it read
    pub async fn open(&self, slug: &TicketSlug) -> WidgetResult<Ticket> {
        let ticket = self.inner.cache.load_ticket(slug).await?;
        self.show(ticket.clone());

        if let Err(e) = self.refresh().await {
            tracing::warn!(ticket = %slug, error = %e, "Failed to mark opened ticket read");
        }
        Ok(self.current().unwrap_or(ticket))
    }

    /// Create a ticket and show it
    pub async fn create(&self, title: &str, description: &str) -> WidgetResult<Ticket> {
        let ticket = self.inner.cache.create_ticket(title, description).await?;
        self.show(ticket.clone());
        Ok(ticket)
    }

    /// Show an already fetched ticket and attach the live listener
    pub fn show(&self, ticket: Ticket) {
        let slug = ticket.slug.clone();
        self.detach();

        self.inner.cache.set_focus(Some(slug.clone()));
        self.inner.current.send_replace(Some(ticket));

        let weak: Weak<ViewInner> = Arc::downgrade(&self.inner);
        let listener_slug = slug.clone();
        let subscription = self.inner.multiplexer.subscribe(
            SubscriptionKey::new(self.inner.project_id.clone(), slug.clone()),
            sequential(move |message: PushMessage| {
                let weak = weak.clone();
                let slug = listener_slug.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        TicketView { inner }.apply_push(&slug, &message).await;
                    }
                }
            }),
        );
        *lock(&self.inner.foreground) = Some(subscription);

        tracing::debug!(ticket = %slug, "Showing ticket");
    }

    /// Stop showing the current ticket
    pub fn close(&self) {
        self.detach();
        self.inner.current.send_replace(None);
    }

    fn detach(&self) {
        let previous = lock(&self.inner.foreground).take();
        if let Some(subscription) = previous {
            subscription.unsubscribe();
        }
        lock(&self.inner.pending).clear();
        self.inner.cache.set_focus(None);
    }

    /// Mark the shown ticket read and replace it with the backend's copy
    pub async fn refresh(&self) -> WidgetResult<()> {
        let Some(slug) = self.current_slug() else {
            return Ok(());
        };
        let ticket = self.inner.cache.mark_read(&slug).await?;
        self.replace_current(ticket);
        Ok(())
    }

    /// Install an authoritative snapshot, keeping unsettled provisional
    /// messages at the end of the thread
    fn replace_current(&self, mut ticket: Ticket) {
        let pending = lock(&self.inner.pending).clone();
        let mut updated = false;

        self.inner.current.send_if_modified(|current| match current {
            Some(shown) if shown.slug == ticket.slug => {
                let unsettled = shown
                    .messages
                    .iter()
                    .filter(|m| m.is_provisional() && pending.contains(&m.id))
                    .cloned();
                ticket.messages.extend(unsettled);
                *shown = ticket.clone();
                updated = true;
                true
            }
            _ => false,
        });

        if updated {
            self.inner.cache.record_ticket(&ticket);
        }
    }

    /// Append a visitor message.
    ///
    /// A provisional copy shows immediately and is removed again if the
    /// backend rejects the message; the refreshed thread replaces it once the
    /// backend accepts.
    pub async fn send_message(&self, content: &str) -> WidgetResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(WidgetError::Validation("Message cannot be empty".to_string()));
        }
        let Some(slug) = self.current_slug() else {
            return Err(WidgetError::Validation("No ticket is open".to_string()));
        };

        let provisional = TicketMessage {
            id: format!("{}{}", PROVISIONAL_ID_PREFIX, Uuid::new_v4()),
            author: MessageAuthor::User,
            content: content.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            read_by: vec![Reader::User],
            kind: Some(MessageKind::Message),
            metadata: None,
        };
        let provisional_id = provisional.id.clone();

        lock(&self.inner.pending).insert(provisional_id.clone());
        self.inner.current.send_if_modified(|current| match current {
            Some(shown) if shown.slug == slug => {
                shown.messages.push(provisional);
                true
            }
            _ => false,
        });

        let request = AddMessageRequest {
            author: MessageAuthor::User,
            content: content.to_string(),
        };
        let result = self
            .inner
            .api
            .add_message(&self.inner.project_id, &slug, &request)
            .await;
        lock(&self.inner.pending).remove(&provisional_id);

        match result {
            Ok(()) => {
                tracing::debug!(ticket = %slug, "Message sent");
                if let Err(e) = self.refresh().await {
                    // Next push or refresh replaces the provisional copy
                    tracing::warn!(ticket = %slug, error = %e, "Failed to refresh after sending");
                }
                Ok(())
            }
            Err(e) => {
                self.inner.current.send_if_modified(|current| match current {
                    Some(shown) => {
                        let before = shown.messages.len();
                        shown.messages.retain(|m| m.id != provisional_id);
                        shown.messages.len() != before
                    }
                    None => false,
                });
                tracing::error!(ticket = %slug, error = %e, "Error sending message");
                Err(e)
            }
        }
    }

    /// Handle a push frame for the shown ticket
    pub async fn apply_push(&self, slug: &TicketSlug, message: &PushMessage) {
        if self.current_slug().as_ref() != Some(slug) {
            return;
        }

        match message.kind {
            PushKind::TicketUpdate | PushKind::NewMessage | PushKind::StatusChange => {
                if let Some(ticket) = message.ticket_snapshot() {
                    self.replace_current(ticket);
                }
                if let Err(e) = self.refresh().await {
                    tracing::warn!(ticket = %slug, error = %e, "Failed to refresh shown ticket");
                }
            }
            PushKind::Error => {
                tracing::warn!(
                    ticket = %slug,
                    error = message.error_message().unwrap_or("unknown"),
                    "Ticket channel reported an error"
                );
            }
            PushKind::Subscribed => {
                tracing::debug!(ticket = %slug, "Subscribed to ticket updates");
            }
        }
    }

    /// Open tickets the assistant creates as soon as they are announced
    pub fn follow_created(&self, events: &EventBus) -> JoinHandle<()> {
        let mut receiver = events.subscribe();
        let view = self.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(WidgetEvent::TicketCreated { ticket_slug }) => {
                        tracing::info!(ticket = %ticket_slug, "Opening ticket created by assistant");
                        if let Err(e) = view.open(&ticket_slug).await {
                            tracing::error!(ticket = %ticket_slug, error = %e, "Error loading created ticket");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Missed widget events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
