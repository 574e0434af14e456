//! Push-mode message sink.

use bytes::Bytes;
use respconn_protocol::RespValue;
use tokio::sync::mpsc;

/// An unsolicited frame received while the connection is in push mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    /// `message <channel> <payload>`
    Message { channel: Bytes, payload: Bytes },
    /// `pmessage <pattern> <channel> <payload>`
    PatternMessage {
        pattern: Bytes,
        channel: Bytes,
        payload: Bytes,
    },
    /// `subscribe`, `unsubscribe`, `psubscribe`, `punsubscribe` confirmations.
    Confirmation {
        kind: String,
        channel: Option<Bytes>,
        count: i64,
    },
    /// Anything else, such as a `pong` while subscribed.
    Other(RespValue),
}

impl PushMessage {
    pub fn from_value(value: RespValue) -> Self {
        let items = match value {
            RespValue::Array(items) => items,
            other => return PushMessage::Other(other),
        };

        let kind = match items.first().and_then(RespValue::as_str) {
            Some(kind) => kind.to_ascii_lowercase(),
            None => return PushMessage::Other(RespValue::Array(items)),
        };

        match (kind.as_str(), items.as_slice()) {
            ("message", [_, channel, payload]) => {
                match (channel.as_bytes(), payload.as_bytes()) {
                    (Some(channel), Some(payload)) => PushMessage::Message {
                        channel: channel.clone(),
                        payload: payload.clone(),
                    },
                    _ => PushMessage::Other(RespValue::Array(items)),
                }
            }
            ("pmessage", [_, pattern, channel, payload]) => {
                match (pattern.as_bytes(), channel.as_bytes(), payload.as_bytes()) {
                    (Some(pattern), Some(channel), Some(payload)) => PushMessage::PatternMessage {
                        pattern: pattern.clone(),
                        channel: channel.clone(),
                        payload: payload.clone(),
                    },
                    _ => PushMessage::Other(RespValue::Array(items)),
                }
            }
            ("subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe", [_, channel, count]) => {
                match count.as_integer() {
                    Some(count) => PushMessage::Confirmation {
                        channel: channel.as_bytes().cloned(),
                        kind,
                        count,
                    },
                    None => PushMessage::Other(RespValue::Array(items)),
                }
            }
            _ => PushMessage::Other(RespValue::Array(items)),
        }
    }
}

/// Sending half of a push sink, registered with the partitioner.
#[derive(Debug, Clone)]
pub struct Subscription {
    tx: mpsc::UnboundedSender<PushMessage>,
}

/// Receiving half of a push sink.
#[derive(Debug)]
pub struct Subscriber {
    rx: mpsc::UnboundedReceiver<PushMessage>,
}

impl Subscription {
    pub fn channel() -> (Subscription, Subscriber) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Subscription { tx }, Subscriber { rx })
    }

    /// Delivers a decoded push frame. Returns `false` once the subscriber is gone.
    pub fn deliver(&self, value: RespValue) -> bool {
        self.tx.send(PushMessage::from_value(value)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Subscriber {
    /// Next push message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(items: &[&str]) -> RespValue {
        RespValue::Array(
            items
                .iter()
                .map(|s| RespValue::bulk(Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        )
    }

    #[test]
    fn test_parse_message() {
        let msg = PushMessage::from_value(array(&["message", "news", "hello"]));
        assert_eq!(
            msg,
            PushMessage::Message {
                channel: Bytes::from_static(b"news"),
                payload: Bytes::from_static(b"hello"),
            }
        );
    }

    #[test]
    fn test_parse_pattern_message() {
        let msg = PushMessage::from_value(array(&["pmessage", "n*", "news", "hi"]));
        assert!(matches!(msg, PushMessage::PatternMessage { ref pattern, .. } if pattern == "n*"));
    }

    #[test]
    fn test_parse_confirmation() {
        let value = RespValue::Array(vec![
            RespValue::bulk("subscribe"),
            RespValue::bulk("news"),
            RespValue::Integer(1),
        ]);
        assert_eq!(
            PushMessage::from_value(value),
            PushMessage::Confirmation {
                kind: "subscribe".into(),
                channel: Some(Bytes::from_static(b"news")),
                count: 1,
            }
        );
    }

    #[test]
    fn test_unknown_shapes_are_other() {
        let pong = RespValue::simple("PONG");
        assert_eq!(PushMessage::from_value(pong.clone()), PushMessage::Other(pong));

        let short = array(&["message", "news"]);
        assert!(matches!(PushMessage::from_value(short), PushMessage::Other(_)));
    }

    #[tokio::test]
    async fn test_delivery_order() {
        let (sink, mut subscriber) = Subscription::channel();
        assert!(sink.deliver(array(&["message", "a", "1"])));
        assert!(sink.deliver(array(&["message", "a", "2"])));

        for expected in ["1", "2"] {
            match subscriber.recv().await {
                Some(PushMessage::Message { payload, .. }) => assert_eq!(payload, expected),
                other => panic!("unexpected {:?}", other),
            }
        }

        drop(subscriber);
        assert!(sink.is_closed());
        assert!(!sink.deliver(RespValue::Null));
    }
}
