//! WebRTC Peer Links
//!
//! Backs [`PeerLink`] with a `webrtc` peer connection. Virtual streams are
//! data channels, detached into raw byte streams once open.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use regex::Regex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use webrtc::api::APIBuilder;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data::data_channel::PollDataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{
    ArcPeerLink, BoxedDuplex, BoxedVirtualStream, LinkFactory, LinkId, LinkState, PeerLink,
    StreamState, VirtualStream,
};
use crate::config::LinkConfig;
use crate::error::{PortLinkError, Result};
use crate::protocol::{CandidateInit, SdpKind, SessionDescription};

/// Queue depth for incoming streams and local candidates
const CHANNEL_CAPACITY: usize = 64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::Idle,
        // a disconnected link may still recover, so it is not terminal yet
        RTCPeerConnectionState::Connecting | RTCPeerConnectionState::Disconnected => {
            LinkState::Connecting
        }
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn stream_state(state: RTCDataChannelState) -> StreamState {
    match state {
        RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
            StreamState::Connecting
        }
        RTCDataChannelState::Open => StreamState::Open,
        RTCDataChannelState::Closing | RTCDataChannelState::Closed => StreamState::Closed,
    }
}

impl From<CandidateInit> for RTCIceCandidateInit {
    fn from(c: CandidateInit) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for CandidateInit {
    fn from(c: RTCIceCandidateInit) -> Self {
        CandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Creates WebRTC peer links from a [`LinkConfig`]
pub struct RtcLinkFactory {
    config: LinkConfig,
    excluded: Arc<Vec<Regex>>,
}

impl RtcLinkFactory {
    pub fn new(config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let excluded = config
            .exclude_candidates
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    PortLinkError::ConfigError(format!("bad exclude pattern '{}': {}", pattern, e))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            excluded: Arc::new(excluded),
        })
    }

    async fn create_link(&self) -> Result<RtcLink> {
        let mut settings = SettingEngine::default();
        settings.detach_data_channels();
        settings.set_receive_mtu(self.config.receive_mtu);

        let api = APIBuilder::new().with_setting_engine(settings).build();
        let mut rtc_config = RTCConfiguration::default();
        if !self.config.ice_servers.is_empty() {
            rtc_config.ice_servers = vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let pc = Arc::new(api.new_peer_connection(rtc_config).await?);
        Ok(RtcLink::wire(pc, self.excluded.clone()))
    }
}

impl LinkFactory for RtcLinkFactory {
    fn create(&self) -> BoxFuture<'_, Result<ArcPeerLink>> {
        async move {
            let link: ArcPeerLink = Arc::new(self.create_link().await?);
            Ok(link)
        }
        .boxed()
    }
}

/// A peer link over one `RTCPeerConnection`
pub struct RtcLink {
    id: LinkId,
    pc: Arc<RTCPeerConnection>,
    state_tx: Arc<watch::Sender<LinkState>>,
    candidates_rx: Mutex<Option<mpsc::Receiver<CandidateInit>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<BoxedVirtualStream>>>,
}

impl RtcLink {
    fn wire(pc: Arc<RTCPeerConnection>, excluded: Arc<Vec<Regex>>) -> Self {
        let id = LinkId::next();
        let (state_tx, _) = watch::channel(LinkState::Idle);
        let state_tx = Arc::new(state_tx);
        let (candidates_tx, candidates_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);

        {
            let state_tx = state_tx.clone();
            pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let next = link_state(s);
                let changed = state_tx.send_if_modified(|state| {
                    if state.is_terminal() || *state == next {
                        false
                    } else {
                        *state = next;
                        true
                    }
                });
                if changed {
                    debug!("{} peer connection state: {}", id, s);
                }
                Box::pin(async {})
            }));
        }

        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let candidates_tx = candidates_tx.clone();
            let excluded = excluded.clone();
            Box::pin(async move {
                let Some(c) = c else {
                    return;
                };
                if excluded.iter().any(|re| re.is_match(&c.address)) {
                    debug!("{} not advertising excluded candidate {}", id, c.address);
                    return;
                }
                match c.to_json() {
                    Ok(init) => {
                        let _ = candidates_tx.send(init.into()).await;
                    }
                    Err(e) => debug!("{} cannot encode candidate: {}", id, e),
                }
            })
        }));

        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let incoming_tx = incoming_tx.clone();
            Box::pin(async move {
                debug!("{} peer opened data channel '{}'", id, dc.label());
                let stream: BoxedVirtualStream = Box::new(RtcStream::new(dc));
                let _ = incoming_tx.send(stream).await;
            })
        }));

        Self {
            id,
            pc,
            state_tx,
            candidates_rx: Mutex::new(Some(candidates_rx)),
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
        let rtc = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        Ok(rtc)
    }
}

impl PeerLink for RtcLink {
    fn id(&self) -> LinkId {
        self.id
    }

    fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    fn create_offer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        async move {
            let offer = self.pc.create_offer(None).await?;
            Ok(SessionDescription::offer(offer.sdp))
        }
        .boxed()
    }

    fn create_answer(&self) -> BoxFuture<'_, Result<SessionDescription>> {
        async move {
            let answer = self.pc.create_answer(None).await?;
            Ok(SessionDescription::answer(answer.sdp))
        }
        .boxed()
    }

    fn set_local_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        async move {
            self.pc.set_local_description(Self::to_rtc(desc)?).await?;
            Ok(())
        }
        .boxed()
    }

    fn set_remote_description(&self, desc: SessionDescription) -> BoxFuture<'_, Result<()>> {
        async move {
            self.pc.set_remote_description(Self::to_rtc(desc)?).await?;
            Ok(())
        }
        .boxed()
    }

    fn add_candidate(&self, candidate: CandidateInit) -> BoxFuture<'_, Result<()>> {
        async move {
            self.pc.add_ice_candidate(candidate.into()).await?;
            Ok(())
        }
        .boxed()
    }

    fn take_local_candidates(&self) -> Option<mpsc::Receiver<CandidateInit>> {
        lock(&self.candidates_rx).take()
    }

    fn take_incoming_streams(&self) -> Option<mpsc::Receiver<BoxedVirtualStream>> {
        lock(&self.incoming_rx).take()
    }

    fn create_stream(&self, label: &str) -> BoxFuture<'_, Result<BoxedVirtualStream>> {
        let label = label.to_string();
        async move {
            let dc = self
                .pc
                .create_data_channel(&label, None)
                .await
                .map_err(|e| PortLinkError::Transport(e.to_string()))?;
            Ok(Box::new(RtcStream::new(dc)) as BoxedVirtualStream)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        async move {
            info!("Closing {}", self.id);
            self.pc.close().await?;
            self.state_tx.send_replace(LinkState::Closed);
            Ok(())
        }
        .boxed()
    }
}

/// A data channel viewed as a virtual stream
pub struct RtcStream {
    label: String,
    channel: Arc<RTCDataChannel>,
    state_tx: Arc<watch::Sender<StreamState>>,
}

impl RtcStream {
    fn new(channel: Arc<RTCDataChannel>) -> Self {
        let (state_tx, _) = watch::channel(stream_state(channel.ready_state()));
        let state_tx = Arc::new(state_tx);

        {
            let state_tx = state_tx.clone();
            channel.on_open(Box::new(move || {
                state_tx.send_replace(StreamState::Open);
                Box::pin(async {})
            }));
        }
        {
            let state_tx = state_tx.clone();
            channel.on_close(Box::new(move || {
                state_tx.send_replace(StreamState::Closed);
                Box::pin(async {})
            }));
        }

        // the channel may have opened before the handlers were installed
        let now = stream_state(channel.ready_state());
        if now != StreamState::Connecting {
            state_tx.send_replace(now);
        }

        Self {
            label: channel.label().to_string(),
            channel,
            state_tx,
        }
    }
}

impl VirtualStream for RtcStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    fn opened(&self) -> BoxFuture<'_, StreamState> {
        let mut rx = self.state_tx.subscribe();
        async move {
            loop {
                let state = *rx.borrow_and_update();
                if state != StreamState::Connecting {
                    return state;
                }
                if rx.changed().await.is_err() {
                    return StreamState::Closed;
                }
            }
        }
        .boxed()
    }

    fn detach(self: Box<Self>) -> BoxFuture<'static, Result<BoxedDuplex>> {
        async move {
            if self.ready_state() != StreamState::Open {
                return Err(PortLinkError::StreamClosed(self.label.clone()));
            }
            let raw = self
                .channel
                .detach()
                .await
                .map_err(|e| PortLinkError::Transport(format!("detach '{}': {}", self.label, e)))?;
            Ok(Box::new(PollDataChannel::new(raw)) as BoxedDuplex)
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        async move {
            if let Err(e) = self.channel.close().await {
                debug!("closing data channel '{}': {}", self.label, e);
            }
            self.state_tx.send_replace(StreamState::Closed);
        }
        .boxed()
    }
}
