//! Assistant chat client
//!
//! Sends the conversation so far plus a new user message, then surfaces the
//! reply as a stream of fragments. Replies arrive either as one JSON
//! envelope (plain answer or tool call) or as an event stream of deltas.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use fleety_shared::{
    ChatEnvelope, ChatEnvelopeKind, ChatRequest, ConversationMessage, TicketSlug, WidgetError,
    WidgetResult,
};

use crate::api::ApiClient;
use crate::events::{EventBus, WidgetEvent};
use crate::session::SessionManager;
use crate::sse::{SseDecoder, StreamEvent};

const FRAGMENT_BUFFER: usize = 32;

/// One observable step of an assistant reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyFragment {
    /// Full text accumulated so far in a streamed reply
    Partial { text: String },
    /// A complete reply delivered in one piece
    Complete {
        text: String,
        ticket_slug: Option<TicketSlug>,
    },
    Failed(WidgetError),
}

/// Fragments of one reply, in order. Ends after the reply completes,
/// fails, or is cancelled.
pub struct ReplyStream {
    fragments: ReceiverStream<ReplyFragment>,
    cancel: CancellationToken,
}

impl ReplyStream {
    /// Stop reading the reply. Text received so far is kept in the history.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Stream for ReplyStream {
    type Item = ReplyFragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.fragments).poll_next(cx)
    }
}

struct ChatInner {
    api: ApiClient,
    session: SessionManager,
    events: EventBus,
    history: Mutex<Vec<ConversationMessage>>,
}

/// Conversation with the support assistant
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ChatInner>,
}

impl ChatClient {
    pub fn new(api: ApiClient, session: SessionManager, events: EventBus) -> Self {
        Self {
            inner: Arc::new(ChatInner {
                api,
                session,
                events,
                history: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Messages exchanged so far
    pub fn history(&self) -> Vec<ConversationMessage> {
        self.lock_history().clone()
    }

    pub fn clear_history(&self) {
        self.lock_history().clear();
    }

    fn lock_history(&self) -> MutexGuard<'_, Vec<ConversationMessage>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a user message with the current history as context.
    ///
    /// The exchange runs on a background task; the returned stream yields
    /// its fragments. Must be called from within a tokio runtime.
    pub fn send(&self, message: impl Into<String>) -> ReplyStream {
        let (tx, rx) = mpsc::channel(FRAGMENT_BUFFER);
        let cancel = CancellationToken::new();

        let client = self.clone();
        let message = message.into();
        let token = cancel.clone();
        tokio::spawn(async move {
            client.run_exchange(message, tx, token).await;
        });

        ReplyStream {
            fragments: ReceiverStream::new(rx),
            cancel,
        }
    }

    /// Send a message and wait for the full reply text
    pub async fn ask(&self, message: impl Into<String>) -> WidgetResult<String> {
        let mut stream = self.send(message);
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            match fragment {
                ReplyFragment::Partial { text } | ReplyFragment::Complete { text, .. } => {
                    reply = text
                }
                ReplyFragment::Failed(e) => return Err(e),
            }
        }
        Ok(reply)
    }

    async fn run_exchange(
        &self,
        message: String,
        tx: mpsc::Sender<ReplyFragment>,
        cancel: CancellationToken,
    ) {
        let user_message = ConversationMessage::user(message);
        let request = ChatRequest {
            messages: {
                let mut messages = self.history();
                messages.push(user_message.clone());
                messages
            },
            enable_tool_calling: true,
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Chat request cancelled before a reply arrived");
                return;
            }
            response = self.request(&request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Chat request failed");
                let _ = tx.send(ReplyFragment::Failed(e)).await;
                return;
            }
        };

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("application/json"));

        if is_json {
            self.finish_envelope(user_message, response, &tx).await;
        } else {
            self.stream_reply(user_message, response, &tx, &cancel).await;
        }
    }

    /// Post the chat request, re-acquiring the session once if the backend
    /// rejects the token
    async fn request(&self, request: &ChatRequest) -> WidgetResult<Response> {
        let token = self.inner.session.ensure_token().await?;

        match self.inner.api.chat(token.bearer(), request).await {
            Err(WidgetError::AuthExpired) => {
                tracing::warn!("Session token rejected, reinitializing session");
                self.inner.session.invalidate();
                let fresh = self
                    .inner
                    .session
                    .acquire()
                    .await
                    .map_err(|_| WidgetError::AuthExpired)?;
                self.inner.api.chat(fresh.bearer(), request).await
            }
            other => other,
        }
    }

    /// Handle a JSON reply. Bodies that are not a known envelope are read
    /// as event-stream text instead.
    async fn finish_envelope(
        &self,
        user_message: ConversationMessage,
        response: Response,
        tx: &mpsc::Sender<ReplyFragment>,
    ) {
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let error = WidgetError::transport(e);
                tracing::error!(error = %error, "Failed to read chat reply");
                let _ = tx.send(ReplyFragment::Failed(error)).await;
                return;
            }
        };

        let envelope: ChatEnvelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "JSON chat reply is not an envelope, reading as stream");
                let mut decoder = SseDecoder::new();
                let mut events = decoder.push(&body);
                events.extend(decoder.finish());

                let mut text = String::new();
                forward_events(events, &mut text, tx).await;
                if text.is_empty() {
                    let error = WidgetError::Transport("Unexpected chat reply".to_string());
                    tracing::error!(error = %error, "Chat reply had no usable content");
                    let _ = tx.send(ReplyFragment::Failed(error)).await;
                } else {
                    self.commit(user_message, &text);
                }
                return;
            }
        };

        let ticket_slug = match envelope.kind {
            ChatEnvelopeKind::ToolCall => envelope.ticket_slug.clone(),
            ChatEnvelopeKind::Message => None,
        };

        self.commit(user_message, &envelope.message);

        if let Some(slug) = &ticket_slug {
            tracing::info!(ticket = %slug, "Ticket created via chat");
            self.inner.events.publish(WidgetEvent::TicketCreated {
                ticket_slug: slug.clone(),
            });
        }

        let _ = tx
            .send(ReplyFragment::Complete {
                text: envelope.message,
                ticket_slug,
            })
            .await;
    }

    async fn stream_reply(
        &self,
        user_message: ConversationMessage,
        response: Response,
        tx: &mpsc::Sender<ReplyFragment>,
        cancel: &CancellationToken,
    ) {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut text = String::new();
        let mut open = true;

        while open {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(received = text.len(), "Chat stream cancelled");
                    break;
                }
                chunk = body.next() => chunk,
            };

            let events = match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(e)) => {
                    let error = WidgetError::transport(e);
                    tracing::error!(error = %error, "Chat stream interrupted");
                    let _ = tx.send(ReplyFragment::Failed(error)).await;
                    return;
                }
                None => {
                    open = false;
                    decoder.finish().into_iter().collect()
                }
            };

            if !forward_events(events, &mut text, tx).await {
                break;
            }
        }

        if !text.is_empty() {
            self.commit(user_message, &text);
        }
    }

    /// Append a finished exchange to the history
    fn commit(&self, user_message: ConversationMessage, reply: &str) {
        let mut history = self.lock_history();
        history.push(user_message);
        history.push(ConversationMessage::assistant(reply));
    }
}

/// Append deltas to `text`, emitting the whole text after each one.
///
/// Returns false once the sentinel is seen or the consumer went away.
async fn forward_events(
    events: Vec<StreamEvent>,
    text: &mut String,
    tx: &mpsc::Sender<ReplyFragment>,
) -> bool {
    for event in events {
        match event {
            StreamEvent::Done => return false,
            StreamEvent::Delta(delta) if delta.is_empty() => {}
            StreamEvent::Delta(delta) => {
                text.push_str(&delta);
                let fragment = ReplyFragment::Partial { text: text.clone() };
                if tx.send(fragment).await.is_err() {
                    tracing::debug!("Reply stream dropped by consumer");
                    return false;
                }
            }
        }
    }
    true
}
