//! Local cache of the visitor's tickets
//!
//! Holds one summary per known ticket (title, status, unread count), keeps it
//! durable through a [`TicketStore`], and keeps it fresh by listening on every
//! saved ticket's push channel in the background. The ticket the visitor is
//! looking at is left to the foreground view so the two never race.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;

use fleety_shared::{
    CreateTicketRequest, ProjectId, PushKind, PushMessage, SavedTicket, SubscriptionKey, Ticket,
    TicketSlug, WidgetError, WidgetResult,
};

use crate::api::ApiClient;
use crate::multiplexer::{sequential, ConnectionMultiplexer, Subscription};
use crate::storage::TicketStore;

struct CacheInner {
    project_id: ProjectId,
    api: ApiClient,
    multiplexer: ConnectionMultiplexer,
    store: Arc<dyn TicketStore>,
    /// Most recently touched first
    tickets: Mutex<Vec<SavedTicket>>,
    background: Mutex<HashMap<TicketSlug, Subscription>>,
    focused: Mutex<Option<TicketSlug>>,
    changes: watch::Sender<Vec<SavedTicket>>,
}

/// Saved ticket summaries kept in sync with the backend
#[derive(Clone)]
pub struct TicketSyncCache {
    inner: Arc<CacheInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TicketSyncCache {
    /// Load the saved list and start background listeners for it.
    ///
    /// An unreadable store starts an empty list. Must be called from within a
    /// tokio runtime.
    pub fn open(
        project_id: ProjectId,
        api: ApiClient,
        multiplexer: ConnectionMultiplexer,
        store: Arc<dyn TicketStore>,
    ) -> Self {
        let tickets = match store.load() {
            Ok(tickets) => tickets,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load saved tickets, starting empty");
                Vec::new()
            }
        };
        let (changes, _) = watch::channel(tickets.clone());
        let slugs: Vec<TicketSlug> = tickets.iter().map(|t| t.slug.clone()).collect();

        let cache = Self {
            inner: Arc::new(CacheInner {
                project_id,
                api,
                multiplexer,
                store,
                tickets: Mutex::new(tickets),
                background: Mutex::new(HashMap::new()),
                focused: Mutex::new(None),
                changes,
            }),
        };

        for slug in &slugs {
            cache.ensure_background(slug);
        }
        tracing::info!(tickets = slugs.len(), "Loaded saved tickets");
        cache
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.inner.project_id
    }

    /// Summaries, most recently touched first
    pub fn summaries(&self) -> Vec<SavedTicket> {
        lock(&self.inner.tickets).clone()
    }

    pub fn get(&self, slug: &TicketSlug) -> Option<SavedTicket> {
        lock(&self.inner.tickets)
            .iter()
            .find(|t| &t.slug == slug)
            .cloned()
    }

    /// Sum of unread counts across all saved tickets
    pub fn total_unread(&self) -> usize {
        lock(&self.inner.tickets)
            .iter()
            .map(|t| t.unread_count)
            .sum()
    }

    /// Observe the summary list; a new value is published after every change
    pub fn watch(&self) -> watch::Receiver<Vec<SavedTicket>> {
        self.inner.changes.subscribe()
    }

    /// Mark the ticket shown in the foreground (or none)
    pub fn set_focus(&self, slug: Option<TicketSlug>) {
        *lock(&self.inner.focused) = slug;
    }

    pub fn focused(&self) -> Option<TicketSlug> {
        lock(&self.inner.focused).clone()
    }

    fn is_focused(&self, slug: &TicketSlug) -> bool {
        lock(&self.inner.focused).as_ref() == Some(slug)
    }

    /// Number of tickets with a background listener
    pub fn background_count(&self) -> usize {
        lock(&self.inner.background).len()
    }

    /// Apply a change to the list, persist it and notify watchers.
    ///
    /// The list lock is held across the write so persisted states follow the
    /// order of in-memory updates.
    fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut Vec<SavedTicket>) -> bool,
    {
        let mut tickets = lock(&self.inner.tickets);
        if !f(&mut tickets) {
            return;
        }
        if let Err(e) = self.inner.store.save(&tickets) {
            tracing::error!(error = %e, "Failed to persist saved tickets");
        }
        self.inner.changes.send_replace(tickets.clone());
    }

    /// Insert or refresh a ticket at the top of the list and listen to it
    pub fn record_ticket(&self, ticket: &Ticket) {
        let summary = SavedTicket::from(ticket);
        self.mutate(|tickets| {
            tickets.retain(|t| t.slug != summary.slug);
            tickets.insert(0, summary);
            true
        });
        self.ensure_background(&ticket.slug);
    }

    /// Update the cached fields of a known ticket in place
    pub fn apply_snapshot(&self, ticket: &Ticket) -> bool {
        let mut found = false;
        self.mutate(|tickets| {
            if let Some(entry) = tickets.iter_mut().find(|t| t.slug == ticket.slug) {
                let summary = SavedTicket::from(ticket);
                found = true;
                if *entry != summary {
                    *entry = summary;
                    return true;
                }
            }
            false
        });
        found
    }

    fn set_unread(&self, slug: &TicketSlug, count: usize) {
        self.mutate(|tickets| match tickets.iter_mut().find(|t| &t.slug == slug) {
            Some(entry) if entry.unread_count != count => {
                entry.unread_count = count;
                true
            }
            _ => false,
        });
    }

    /// Mark a ticket's messages read.
    ///
    /// The local unread count drops to zero and is persisted before the
    /// backend is contacted; the refetched ticket then reconciles the summary
    /// and is returned.
    pub async fn mark_read(&self, slug: &TicketSlug) -> WidgetResult<Ticket> {
        self.set_unread(slug, 0);

        self.inner
            .api
            .mark_read(&self.inner.project_id, slug, fleety_shared::Reader::User)
            .await
            .inspect_err(|e| tracing::warn!(ticket = %slug, error = %e, "Error marking messages as read"))?;

        let ticket = self
            .inner
            .api
            .get_ticket_with_retry(&self.inner.project_id, slug)
            .await?;
        self.apply_snapshot(&ticket);
        Ok(ticket)
    }

    /// Create a ticket for the visitor and start tracking it
    pub async fn create_ticket(&self, title: &str, description: &str) -> WidgetResult<Ticket> {
        let title = title.trim();
        let description = description.trim();
        if title.is_empty() || description.is_empty() {
            return Err(WidgetError::Validation("Please fill in all fields".to_string()));
        }

        let request = CreateTicketRequest {
            project_id: self.inner.project_id.clone(),
            title: title.to_string(),
            description: description.to_string(),
            public_key: None,
        };
        let ticket = self.inner.api.create_ticket(&request).await?;

        tracing::info!(ticket = %ticket.slug, "Ticket created");
        self.record_ticket(&ticket);
        Ok(ticket)
    }

    /// Fetch a ticket by slug and track it
    pub async fn load_ticket(&self, slug: &TicketSlug) -> WidgetResult<Ticket> {
        let ticket = self
            .inner
            .api
            .get_ticket_with_retry(&self.inner.project_id, slug)
            .await?;
        self.record_ticket(&ticket);
        Ok(ticket)
    }

    /// Refetch every saved ticket to correct unread counts and statuses.
    ///
    /// Failures are logged per ticket; returns how many were refreshed.
    pub async fn refresh_all(&self) -> usize {
        let slugs: Vec<TicketSlug> = self.summaries().into_iter().map(|t| t.slug).collect();
        let mut refreshed = 0;

        for slug in &slugs {
            match self
                .inner
                .api
                .get_ticket_with_retry(&self.inner.project_id, slug)
                .await
            {
                Ok(ticket) => {
                    self.apply_snapshot(&ticket);
                    refreshed += 1;
                }
                Err(e) => {
                    tracing::warn!(ticket = %slug, error = %e, "Error refreshing ticket");
                }
            }
        }

        tracing::debug!(refreshed, total = slugs.len(), "Refreshed saved tickets");
        refreshed
    }

    /// Handle a push frame for a ticket the visitor is not looking at
    pub async fn apply_push(&self, slug: &TicketSlug, message: &PushMessage) {
        if self.is_focused(slug) {
            tracing::trace!(ticket = %slug, "Skipping background update for focused ticket");
            return;
        }

        // Notifications only say that something changed
        if message.requires_refetch() {
            self.refetch_background(slug).await;
            return;
        }

        match message.kind {
            PushKind::TicketUpdate => match message.ticket_snapshot() {
                Some(ticket) => {
                    self.apply_background_snapshot(&ticket);
                }
                None => self.refetch_background(slug).await,
            },
            PushKind::NewMessage | PushKind::StatusChange => {}
            PushKind::Error => {
                tracing::warn!(
                    ticket = %slug,
                    error = message.error_message().unwrap_or("unknown"),
                    "Ticket channel reported an error"
                );
            }
            PushKind::Subscribed => {
                tracing::debug!(ticket = %slug, "Background listener subscribed");
            }
        }
    }

    async fn refetch_background(&self, slug: &TicketSlug) {
        match self
            .inner
            .api
            .get_ticket_with_retry(&self.inner.project_id, slug)
            .await
        {
            Ok(ticket) => {
                self.apply_background_snapshot(&ticket);
            }
            Err(e) => {
                tracing::warn!(ticket = %slug, error = %e, "Error refreshing background ticket");
            }
        }
    }

    fn apply_background_snapshot(&self, ticket: &Ticket) {
        // Focus may have moved here while the fetch was in flight
        if self.is_focused(&ticket.slug) {
            return;
        }
        if self.apply_snapshot(ticket) {
            tracing::debug!(
                ticket = %ticket.slug,
                status = %ticket.status,
                unread = ticket.unread_count(),
                "Updated ticket from background push"
            );
        }
    }

    fn ensure_background(&self, slug: &TicketSlug) {
        let mut background = lock(&self.inner.background);
        if background.contains_key(slug) {
            return;
        }

        // Frames for one ticket are applied in arrival order
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        let listener_slug = slug.clone();
        let subscription = self.inner.multiplexer.subscribe(
            SubscriptionKey::new(self.inner.project_id.clone(), slug.clone()),
            sequential(move |message: PushMessage| {
                let weak = weak.clone();
                let slug = listener_slug.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        TicketSyncCache { inner }.apply_push(&slug, &message).await;
                    }
                }
            }),
        );
        background.insert(slug.clone(), subscription);
    }

    /// Stop every background listener
    pub fn shutdown(&self) {
        let subscriptions: Vec<Subscription> = lock(&self.inner.background)
            .drain()
            .map(|(_, s)| s)
            .collect();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
    }
}
