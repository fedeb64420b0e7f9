//! Signaling Relay
//!
//! Drives the offer/answer/candidate exchange of one peer link over a
//! message connection. Both roles use it: the server from the first message
//! it receives, the client after sending its own offer.

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::link::ArcPeerLink;
use crate::protocol::{CandidateInit, SessionDescription, SignalKind, SignalMessage};

/// Relays signaling for a single link until the connection ends
pub struct SignalingRelay {
    link: ArcPeerLink,
}

impl SignalingRelay {
    pub fn new(link: ArcPeerLink) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &ArcPeerLink {
        &self.link
    }

    /// Processes inbound messages and pushes local candidates out until
    /// `incoming` ends or fails.
    ///
    /// A message that cannot be applied is logged and skipped. Candidate
    /// send failures are ignored.
    pub async fn run<S, K>(self, mut incoming: S, mut outgoing: K) -> Result<()>
    where
        S: Stream<Item = Result<SignalMessage>> + Unpin,
        K: Sink<SignalMessage, Error = crate::error::PortLinkError> + Unpin,
    {
        let mut candidates = self.link.take_local_candidates();

        loop {
            tokio::select! {
                message = incoming.next() => match message {
                    Some(Ok(message)) => {
                        let kind = message.kind;
                        if let Err(e) = self.dispatch(message, &mut outgoing).await {
                            warn!("{} could not apply {:?} message: {}", self.link.id(), kind, e);
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        debug!("{} signaling connection closed", self.link.id());
                        return Ok(());
                    }
                },
                candidate = next_candidate(&mut candidates) => match candidate {
                    Some(candidate) => {
                        if let Err(e) = outgoing.send(SignalMessage::candidate(candidate)).await {
                            debug!("{} dropped local candidate: {}", self.link.id(), e);
                        }
                    }
                    None => candidates = None,
                },
            }
        }
    }

    async fn dispatch<K>(&self, message: SignalMessage, outgoing: &mut K) -> Result<()>
    where
        K: Sink<SignalMessage, Error = crate::error::PortLinkError> + Unpin,
    {
        match message.kind {
            SignalKind::Offer => {
                let offer = SessionDescription::offer(message.sdp_or_empty());
                self.link.set_remote_description(offer).await?;
                let answer = self.link.create_answer().await?;
                self.link.set_local_description(answer.clone()).await?;
                outgoing.send(SignalMessage::from(answer)).await?;
            }
            SignalKind::Answer => {
                let answer = SessionDescription::answer(message.sdp_or_empty());
                self.link.set_remote_description(answer).await?;
            }
            SignalKind::Candidate => {
                if let Some(candidate) = message.candidate {
                    self.link.add_candidate(candidate).await?;
                }
            }
            SignalKind::Unknown => {
                debug!("{} ignoring unknown signaling message", self.link.id());
            }
        }
        Ok(())
    }
}

async fn next_candidate(rx: &mut Option<mpsc::Receiver<CandidateInit>>) -> Option<CandidateInit> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PortLinkError;
    use crate::link::loopback::LoopbackNetwork;
    use crate::link::{LinkFactory, LinkState};
    use futures::channel::mpsc as fmpsc;
    use std::time::Duration;

    struct Harness {
        to_relay: fmpsc::UnboundedSender<Result<SignalMessage>>,
        from_relay: fmpsc::UnboundedReceiver<SignalMessage>,
        relay: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(link: ArcPeerLink) -> Harness {
        let (to_relay, incoming) = fmpsc::unbounded();
        let (outgoing, from_relay) = fmpsc::unbounded();
        let outgoing = outgoing.sink_map_err(|e| PortLinkError::Signaling(e.to_string()));
        let relay = tokio::spawn(SignalingRelay::new(link).run(incoming, outgoing));
        Harness {
            to_relay,
            from_relay,
            relay,
        }
    }

    async fn next(h: &mut Harness) -> SignalMessage {
        tokio::time::timeout(Duration::from_secs(2), h.from_relay.next())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_is_answered_and_candidates_pushed() {
        let network = LoopbackNetwork::new();
        let client = network.create().await.unwrap();
        let server = network.create().await.unwrap();
        let mut h = start(server.clone());

        let offer = client.create_offer().await.unwrap();
        client.set_local_description(offer.clone()).await.unwrap();
        h.to_relay.unbounded_send(Ok(offer.into())).unwrap();

        let first = next(&mut h).await;
        let second = next(&mut h).await;
        let (answer, candidate) = if first.kind == SignalKind::Answer {
            (first, second)
        } else {
            (second, first)
        };
        assert_eq!(answer.kind, SignalKind::Answer);
        assert_eq!(candidate.kind, SignalKind::Candidate);
        assert!(candidate.candidate.is_some());

        client
            .set_remote_description(SessionDescription::answer(answer.sdp_or_empty()))
            .await
            .unwrap();
        assert_eq!(client.state(), LinkState::Connected);
        assert_eq!(server.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn test_answer_and_candidate_are_applied() {
        let network = LoopbackNetwork::new();
        let client = network.create().await.unwrap();
        let server = network.create().await.unwrap();
        let mut h = start(client.clone());

        let offer = client.create_offer().await.unwrap();
        client.set_local_description(offer.clone()).await.unwrap();
        server.set_remote_description(offer).await.unwrap();
        let answer = server.create_answer().await.unwrap();
        server.set_local_description(answer.clone()).await.unwrap();

        let remote = CandidateInit {
            candidate: "candidate:9 1 udp 1 192.0.2.1 5000 typ host".into(),
            ..Default::default()
        };
        h.to_relay
            .unbounded_send(Ok(SignalMessage::candidate(remote.clone())))
            .unwrap();
        h.to_relay.unbounded_send(Ok(answer.into())).unwrap();

        // the client's own candidate goes out; nothing answers an answer
        assert_eq!(next(&mut h).await.kind, SignalKind::Candidate);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client.state(), LinkState::Connected);
        assert_eq!(network.received_candidates(&client), vec![remote]);
    }

    #[tokio::test]
    async fn test_bad_message_does_not_end_relay() {
        let network = LoopbackNetwork::new();
        let link = network.create().await.unwrap();
        let mut h = start(link);

        h.to_relay
            .unbounded_send(Ok(SignalMessage::offer("not a description")))
            .unwrap();
        h.to_relay
            .unbounded_send(Ok(SignalMessage::from_json(br#"{"type":"bye"}"#).unwrap()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!h.relay.is_finished());
        assert!(h.from_relay.try_next().is_err());
    }

    #[tokio::test]
    async fn test_relay_ends_with_connection() {
        let network = LoopbackNetwork::new();
        let link = network.create().await.unwrap();
        let h = start(link);

        drop(h.to_relay);
        assert!(h.relay.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_read_error_ends_relay() {
        let network = LoopbackNetwork::new();
        let link = network.create().await.unwrap();
        let h = start(link);

        h.to_relay
            .unbounded_send(Err(PortLinkError::Signaling("reset".into())))
            .unwrap();
        assert!(h.relay.await.unwrap().is_err());
    }
}
