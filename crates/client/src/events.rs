//! In-process widget notifications
//!
//! Components that need to react to each other without holding references
//! (the chat creating a ticket, the ticket view opening it) talk through
//! this broadcast bus.

use tokio::sync::broadcast;

use fleety_shared::TicketSlug;

const EVENT_BUS_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidgetEvent {
    /// A ticket was created on the visitor's behalf by the assistant
    TicketCreated { ticket_slug: TicketSlug },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WidgetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Publish an event; returns the number of receivers that saw it
    pub fn publish(&self, event: WidgetEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(event = ?event, "No receivers for widget event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_receiver() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let event = WidgetEvent::TicketCreated {
            ticket_slug: TicketSlug::from("abc-123"),
        };
        assert_eq!(bus.publish(event.clone()), 2);
        assert_eq!(a.recv().await.unwrap(), event);
        assert_eq!(b.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_receivers() {
        let bus = EventBus::new();
        let event = WidgetEvent::TicketCreated {
            ticket_slug: TicketSlug::from("abc-123"),
        };
        assert_eq!(bus.publish(event), 0);
    }
}
