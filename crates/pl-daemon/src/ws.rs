//! WebSocket Message Adapters
//!
//! Presents both WebSocket flavours (the axum server side and the
//! tungstenite client side) as a stream and a sink of [`SignalMessage`]s.
//! Text and binary frames both carry JSON; control frames are skipped.

use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use pl_core::{PortLinkError, Result, SignalMessage};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

fn signaling_error(err: impl std::fmt::Display) -> PortLinkError {
    PortLinkError::Signaling(err.to_string())
}

/// Inbound signaling messages of a server-side socket
pub fn axum_incoming<S>(rx: S) -> impl Stream<Item = Result<SignalMessage>> + Unpin
where
    S: Stream<Item = std::result::Result<WsMessage, axum::Error>> + Unpin,
{
    rx.filter_map(|frame| {
        future::ready(match frame {
            Ok(WsMessage::Text(text)) => Some(SignalMessage::from_json(text.as_bytes())),
            Ok(WsMessage::Binary(data)) => Some(SignalMessage::from_json(&data)),
            Ok(_) => None,
            Err(e) => Some(Err(signaling_error(e))),
        })
    })
}

/// Outbound signaling messages of a server-side socket
pub fn axum_outgoing<K>(tx: K) -> impl Sink<SignalMessage, Error = PortLinkError> + Unpin
where
    K: Sink<WsMessage, Error = axum::Error> + Unpin,
{
    tx.sink_map_err(signaling_error)
        .with(|message: SignalMessage| future::ready(message.to_json().map(WsMessage::Text)))
}

/// Inbound signaling messages of a client-side socket
pub fn tungstenite_incoming<S>(rx: S) -> impl Stream<Item = Result<SignalMessage>> + Unpin
where
    S: Stream<Item = std::result::Result<TungsteniteMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    rx.filter_map(|frame| {
        future::ready(match frame {
            Ok(TungsteniteMessage::Text(text)) => Some(SignalMessage::from_json(text.as_bytes())),
            Ok(TungsteniteMessage::Binary(data)) => Some(SignalMessage::from_json(&data)),
            Ok(_) => None,
            Err(e) => Some(Err(signaling_error(e))),
        })
    })
}

/// Outbound signaling messages of a client-side socket
pub fn tungstenite_outgoing<K>(tx: K) -> impl Sink<SignalMessage, Error = PortLinkError> + Unpin
where
    K: Sink<TungsteniteMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    tx.sink_map_err(signaling_error).with(|message: SignalMessage| {
        future::ready(message.to_json().map(TungsteniteMessage::Text))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use pl_core::SignalKind;
    use tokio_tungstenite::tungstenite::Error as TungsteniteError;

    #[tokio::test]
    async fn test_text_and_binary_frames_decode() {
        let frames = stream::iter(vec![
            Ok::<_, TungsteniteError>(TungsteniteMessage::Text(r#"{"type":"answer","sdp":"v=0"}"#.into())),
            Ok(TungsteniteMessage::Ping(vec![1])),
            Ok(TungsteniteMessage::Binary(br#"{"type":"offer","sdp":"v=0"}"#.to_vec())),
        ]);
        let decoded: Vec<_> = tungstenite_incoming(frames).collect().await;

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].as_ref().unwrap().kind, SignalKind::Answer);
        assert_eq!(decoded[1].as_ref().unwrap().kind, SignalKind::Offer);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_an_error() {
        let frames = stream::iter(vec![Ok::<_, axum::Error>(WsMessage::Text("{oops".into()))]);
        let decoded: Vec<_> = axum_incoming(frames).collect().await;
        assert!(decoded[0].is_err());
    }

    #[tokio::test]
    async fn test_outgoing_encodes_json_text() {
        let (tx, mut rx) = futures::channel::mpsc::unbounded::<TungsteniteMessage>();
        let tx = tx.sink_map_err(|_| TungsteniteError::ConnectionClosed);
        let mut sink = tungstenite_outgoing(tx);

        sink.send(SignalMessage::offer("v=0")).await.unwrap();

        match rx.next().await.unwrap() {
            TungsteniteMessage::Text(text) => assert_eq!(text, r#"{"type":"offer","sdp":"v=0"}"#),
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
