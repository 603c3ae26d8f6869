use crate::{
    instrument::{InstrumentKey, OptionContract},
    upstream::{OptionQuote, StockQuote},
};
use smol_str::SmolStr;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Push update delivered by an upstream quote stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    OptionQuote {
        contract: OptionContract,
        quote: OptionQuote,
    },
    StockQuote {
        ticker: SmolStr,
        quote: StockQuote,
    },
}

impl UpstreamEvent {
    pub fn key(&self) -> InstrumentKey {
        match self {
            UpstreamEvent::OptionQuote { contract, .. } => InstrumentKey::Option(contract.clone()),
            UpstreamEvent::StockQuote { ticker, .. } => InstrumentKey::Underlying(ticker.clone()),
        }
    }
}

/// Process wide fan-out of [`UpstreamEvent`]s.
///
/// Upstream integrations publish here without knowing who is listening. Every authenticated
/// session owns one receiver and filters it down to the instruments it is registered to.
#[derive(Debug, Clone)]
pub struct QuoteBus {
    tx: broadcast::Sender<UpstreamEvent>,
}

impl QuoteBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event, returning the number of receivers it reached.
    pub fn publish(&self, event: UpstreamEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpstreamEvent> {
        self.tx.subscribe()
    }

    /// Receiver wrapped as a [`Stream`](futures::Stream); lag surfaces as an item error.
    pub fn stream(&self) -> BroadcastStream<UpstreamEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::StockQuote;
    use futures::StreamExt;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_publish_reaches_every_stream() {
        let bus = QuoteBus::new(16);
        let mut first = bus.stream();
        let mut second = bus.stream();
        assert_eq!(bus.receiver_count(), 2);

        let event = UpstreamEvent::StockQuote {
            ticker: SmolStr::new("SPY"),
            quote: StockQuote::from_bid_ask(dec!(450.10), dec!(450.20), 100, 200),
        };
        assert_eq!(bus.publish(event.clone()), 2);

        assert_eq!(first.next().await.unwrap().unwrap(), event);
        assert_eq!(second.next().await.unwrap().unwrap(), event);
        assert_eq!(event.key(), InstrumentKey::Underlying(SmolStr::new("SPY")));
    }

    #[test]
    fn test_publish_without_receivers_is_not_an_error() {
        let bus = QuoteBus::new(4);
        let event = UpstreamEvent::StockQuote {
            ticker: SmolStr::new("QQQ"),
            quote: StockQuote::from_bid_ask(dec!(380), dec!(380.02), 1, 1),
        };
        assert_eq!(bus.publish(event), 0);
    }
}
