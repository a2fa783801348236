use crate::domain::ports::{Broadcaster, ControlEvent};
use tokio::sync::broadcast;
use tracing::debug;

/// The control plane's WS fan-out (§4.6, §9: replaces the singleton log
/// broadcaster with an explicit handle passed into the Execution Engine and
/// Dispatcher). Cloning shares the same underlying channel; each WS client
/// subscribes its own `Receiver`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ControlEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.tx.subscribe()
    }
}

impl Broadcaster for EventBus {
    fn publish(&self, event: ControlEvent) {
        // No subscribers is the common case at startup; not an error.
        if self.tx.send(event).is_err() {
            debug!("control-plane broadcast had no subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn publish_reaches_every_subscriber() {
        let bus = EventBus::new(16);
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        bus.publish(ControlEvent::Ticker {
            symbol: "BTCUSDT".to_string(),
            price: dec!(65000),
        });

        assert!(matches!(
            sub1.try_recv().unwrap(),
            ControlEvent::Ticker { .. }
        ));
        assert!(matches!(
            sub2.try_recv().unwrap(),
            ControlEvent::Ticker { .. }
        ));
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.publish(ControlEvent::Log {
            message: "hello".to_string(),
        });
    }
}
