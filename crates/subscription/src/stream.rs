//! `receive()` as a `futures::Stream`

use std::sync::Arc;

use contracts::{Consumer, ContractError, Message};
use futures::Stream;

/// Infinite stream of messages from `consumer`
///
/// Ends once the consumer is closed. Broker errors are yielded as items and
/// the stream keeps going.
pub fn message_stream<C: Consumer>(
    consumer: Arc<C>,
) -> impl Stream<Item = Result<Message, ContractError>> + Send {
    futures::stream::unfold(consumer, |consumer| async move {
        match consumer.receive().await {
            Err(ContractError::Closed { .. }) => None,
            item => Some((item, consumer)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::InMemoryBroker;
    use bytes::Bytes;
    use contracts::{BrokerClient, ContentType, InitialPosition, SubscriptionConfig, SubscriptionKind};
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_yields_in_order_and_ends_on_close() {
        let broker = InMemoryBroker::new();
        let consumer = Arc::new(
            broker
                .create_consumer(SubscriptionConfig {
                    topics: vec!["events".to_string()],
                    subscription_name: "s".to_string(),
                    consumer_name: "c".to_string(),
                    kind: SubscriptionKind::Exclusive,
                    initial_position: InitialPosition::Earliest,
                    content_type: ContentType::Binary,
                    ack_group_time: Duration::ZERO,
                    max_unacked_messages: 0,
                })
                .await
                .unwrap(),
        );
        for i in 0..3u8 {
            broker.publish("events", None, Bytes::from(vec![i])).unwrap();
        }

        let stream = message_stream(Arc::clone(&consumer));
        let mut stream = std::pin::pin!(stream);
        for expected in 0..3u8 {
            let msg = stream.next().await.unwrap().unwrap();
            assert_eq!(msg.content[0], expected);
        }

        consumer.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
