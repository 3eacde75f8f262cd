//! Reference change-feed transport speaking a small JSON protocol over a
//! websocket.
//!
//! Commands carry a client-assigned request id; the backend acknowledges each
//! subscribe with the server-side subscription id used for later unsubscribes.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async as tungstenite_connect,
    connect_async_tls_with_config as tungstenite_connect_tls,
    tungstenite::{
        Message as TungsteniteMessage,
        client::IntoClientRequest,
        http::header::{AUTHORIZATION, HeaderValue},
    },
};

use crate::core::{ChangeEvent, ChangeKind, SyncError, TopicId};
use crate::tls::install_rustls_crypto_provider;
use crate::transport::{FeedCommand, FeedConnectFuture, FeedEvent, FeedTransport};

fn map_ws_error(context: &'static str, err: impl ToString) -> SyncError {
    SyncError::TransportError {
        context,
        error: err.to_string(),
    }
}

#[derive(Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum WireCommand<'a> {
    Subscribe {
        id: u64,
        topic: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        predicate: Option<&'a str>,
    },
    Unsubscribe {
        subscription: u64,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Change {
        topic: String,
        #[serde(default)]
        event: Option<String>,
        #[serde(default)]
        payload: Option<sonic_rs::Value>,
    },
    Subscribed {
        id: u64,
        subscription: u64,
    },
    SubscribeError {
        id: u64,
        message: String,
    },
    // Forward compatibility: unknown event types are skipped, not fatal.
    #[serde(other)]
    Unknown,
}

fn encode_command(command: &FeedCommand) -> Result<String, SyncError> {
    let wire = match command {
        FeedCommand::Subscribe {
            request_id,
            topic,
            filter,
        } => WireCommand::Subscribe {
            id: *request_id,
            topic: topic.as_str(),
            source: filter.source.as_deref(),
            predicate: filter.predicate.as_deref(),
        },
        FeedCommand::Unsubscribe { subscription_id } => WireCommand::Unsubscribe {
            subscription: *subscription_id,
        },
    };
    sonic_rs::to_string(&wire).map_err(|err| SyncError::ParseFailed(err.to_string()))
}

fn parse_event(data: &[u8]) -> Result<Option<FeedEvent>, SyncError> {
    let wire: WireEvent =
        sonic_rs::from_slice(data).map_err(|err| SyncError::ParseFailed(err.to_string()))?;
    Ok(match wire {
        WireEvent::Change {
            topic,
            event,
            payload,
        } => {
            let kind = event
                .as_deref()
                .map(ChangeKind::parse)
                .unwrap_or(ChangeKind::Other);
            let payload = match payload {
                Some(value) => Bytes::from(
                    sonic_rs::to_vec(&value).map_err(|err| SyncError::ParseFailed(err.to_string()))?,
                ),
                None => Bytes::new(),
            };
            Some(FeedEvent::Change(ChangeEvent {
                topic: TopicId::from(topic),
                kind,
                payload,
            }))
        }
        WireEvent::Subscribed { id, subscription } => Some(FeedEvent::Subscribed {
            request_id: id,
            subscription_id: subscription,
        }),
        WireEvent::SubscribeError { id, message } => Some(FeedEvent::SubscribeRejected {
            request_id: id,
            message,
        }),
        WireEvent::Unknown => None,
    })
}

/// Websocket implementation of [`FeedTransport`].
#[derive(Clone, Default)]
pub struct WebSocketFeedTransport {
    connector: Option<Connector>,
    bearer: Option<String>,
}

impl WebSocketFeedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connector(connector: Connector) -> Self {
        Self {
            connector: Some(connector),
            bearer: None,
        }
    }

    pub fn rustls(config: Arc<rustls::ClientConfig>) -> Self {
        Self::with_connector(Connector::Rustls(config))
    }

    /// Attach a bearer token sent as the `Authorization` header on connect.
    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }
}

pub struct WebSocketFeedReader {
    inner: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl Stream for WebSocketFeedReader {
    type Item = Result<FeedEvent, SyncError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => match msg {
                    TungsteniteMessage::Text(text) => {
                        match parse_event(text.as_str().as_bytes()) {
                            Ok(Some(event)) => return Poll::Ready(Some(Ok(event))),
                            Ok(None) => continue,
                            Err(err) => return Poll::Ready(Some(Err(err))),
                        }
                    }
                    TungsteniteMessage::Binary(bytes) => match parse_event(&bytes) {
                        Ok(Some(event)) => return Poll::Ready(Some(Ok(event))),
                        Ok(None) => continue,
                        Err(err) => return Poll::Ready(Some(Err(err))),
                    },
                    TungsteniteMessage::Close(frame) => {
                        return Poll::Ready(Some(Ok(FeedEvent::Closed {
                            reason: frame.map(|f| f.reason.as_str().to_string()),
                        })));
                    }
                    // Pings are answered by tungstenite itself.
                    _ => continue,
                },
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(map_ws_error("read", err))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub struct WebSocketFeedWriter {
    inner: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, TungsteniteMessage>,
}

impl Sink<FeedCommand> for WebSocketFeedWriter {
    type Error = SyncError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: FeedCommand) -> Result<(), Self::Error> {
        let text = encode_command(&item)?;
        Pin::new(&mut self.inner)
            .start_send(TungsteniteMessage::Text(text.into()))
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| map_ws_error("write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| map_ws_error("write", e))
    }
}

impl FeedTransport for WebSocketFeedTransport {
    type Events = WebSocketFeedReader;
    type Commands = WebSocketFeedWriter;

    fn open(&self, url: String) -> FeedConnectFuture<Self::Events, Self::Commands> {
        let connector = self.connector.clone();
        let bearer = self.bearer.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut request = url
                .into_client_request()
                .map_err(|err| SyncError::ConnectionFailed(err.to_string()))?;
            if let Some(token) = bearer {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| SyncError::ConnectionFailed("invalid bearer token".to_string()))?;
                request.headers_mut().insert(AUTHORIZATION, value);
            }

            let (stream, _) = match connector {
                Some(connector) => {
                    tungstenite_connect_tls(request, None, false, Some(connector))
                        .await
                        .map_err(|e| map_ws_error("connect", e))?
                }
                None => tungstenite_connect(request)
                    .await
                    .map_err(|e| map_ws_error("connect", e))?,
            };

            let (write, read) = stream.split();
            Ok((
                WebSocketFeedReader { inner: read },
                WebSocketFeedWriter { inner: write },
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TopicFilter;

    #[test]
    fn subscribe_command_serializes_with_filter() {
        let command = FeedCommand::Subscribe {
            request_id: 3,
            topic: TopicId::from("signals"),
            filter: TopicFilter {
                source: Some("signal_rows".to_string()),
                predicate: Some("pair=eq.EURUSD".to_string()),
            },
        };
        let json = encode_command(&command).unwrap();
        assert_eq!(
            json,
            r#"{"action":"subscribe","id":3,"topic":"signals","source":"signal_rows","predicate":"pair=eq.EURUSD"}"#
        );

        let unsubscribe = encode_command(&FeedCommand::Unsubscribe { subscription_id: 9 }).unwrap();
        assert_eq!(unsubscribe, r#"{"action":"unsubscribe","subscription":9}"#);
    }

    #[test]
    fn change_events_parse_kind_and_payload() {
        let event = parse_event(
            br#"{"type":"change","topic":"signals","event":"INSERT","payload":{"id":7}}"#,
        )
        .unwrap()
        .unwrap();

        match event {
            FeedEvent::Change(change) => {
                assert_eq!(change.topic.as_str(), "signals");
                assert_eq!(change.kind, ChangeKind::Insert);
                assert_eq!(change.payload.as_ref(), br#"{"id":7}"#);
            }
            other => panic!("expected change event, got {other:?}"),
        }
    }

    #[test]
    fn subscription_responses_parse_by_request_id() {
        let event = parse_event(br#"{"type":"subscribed","id":1,"subscription":44}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            FeedEvent::Subscribed {
                request_id: 1,
                subscription_id: 44
            }
        ));

        let event = parse_event(br#"{"type":"subscribe_error","id":2,"message":"denied"}"#)
            .unwrap()
            .unwrap();
        match event {
            FeedEvent::SubscribeRejected { request_id, message } => {
                assert_eq!(request_id, 2);
                assert_eq!(message, "denied");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_skipped() {
        assert!(parse_event(br#"{"type":"heartbeat"}"#).unwrap().is_none());
        assert!(parse_event(b"not json").is_err());
    }
}
