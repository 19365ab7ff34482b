//! WebRTC transport on webrtc-rs
//!
//! One `RTCPeerConnection` with a single ordered, reliable data channel
//! labelled [`DATA_CHANNEL_LABEL`]. The initiator creates the channel before
//! its offer; the responder receives it through `on_data_channel`.
//! `Connected` is reported when the channel opens, not when ICE connects.
//!
//! Callbacks are tagged with an epoch. A rollback replaces the peer
//! connection and bumps the epoch so late callbacks of the discarded
//! connection are muted.

use super::transport::{PeerTransport, TransportContext, TransportEvent, TransportEventSink, TransportFactory};
use crate::config::IceConfig;
use crate::signaling::IceCandidate;
use crate::{Error, PeerId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the counter data channel
pub const DATA_CHANNEL_LABEL: &str = "cloudcounter";

type SharedChannel = Arc<RwLock<Option<Arc<RTCDataChannel>>>>;

/// Map STUN/TURN settings to webrtc-rs ICE servers
pub fn ice_servers(config: &IceConfig) -> Vec<RTCIceServer> {
    config
        .stun_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }))
        .collect()
}

/// Creates [`WebRtcTransport`]s
#[derive(Clone)]
pub struct WebRtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcTransportFactory {
    pub fn new(ice: &IceConfig) -> Self {
        Self {
            ice_servers: ice_servers(ice),
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, context: TransportContext) -> Result<Box<dyn PeerTransport>> {
        let transport = WebRtcTransport::new(context, self.ice_servers.clone()).await?;
        Ok(Box::new(transport))
    }
}

#[derive(Clone)]
struct EpochGate {
    epoch: Arc<AtomicU64>,
    value: u64,
}

impl EpochGate {
    fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.value
    }
}

/// [`PeerTransport`] backed by an `RTCPeerConnection`
pub struct WebRtcTransport {
    peer_id: PeerId,
    api: API,
    ice_servers: Vec<RTCIceServer>,
    events: TransportEventSink,
    epoch: Arc<AtomicU64>,
    connection: RwLock<Arc<RTCPeerConnection>>,
    channel: SharedChannel,
}

impl WebRtcTransport {
    pub async fn new(context: TransportContext, ice_servers: Vec<RTCIceServer>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let epoch = Arc::new(AtomicU64::new(0));
        let channel: SharedChannel = Arc::new(RwLock::new(None));
        let gate = EpochGate {
            epoch: Arc::clone(&epoch),
            value: 0,
        };
        let connection = Self::open_connection(
            &api,
            &ice_servers,
            &context.remote_peer_id,
            &context.events,
            &channel,
            gate,
        )
        .await?;

        Ok(Self {
            peer_id: context.remote_peer_id,
            api,
            ice_servers,
            events: context.events,
            epoch,
            connection: RwLock::new(connection),
            channel,
        })
    }

    async fn open_connection(
        api: &API,
        ice_servers: &[RTCIceServer],
        peer_id: &str,
        events: &TransportEventSink,
        channel: &SharedChannel,
        gate: EpochGate,
    ) -> Result<Arc<RTCPeerConnection>> {
        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        };

        let connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let sink = events.clone();
        let candidate_gate = gate.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            let gate = candidate_gate.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                if !gate.is_current() {
                    return;
                }
                match candidate.to_json() {
                    Ok(init) => sink.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!("Failed to convert ICE candidate to JSON: {}", e),
                }
            })
        }));

        let sink = events.clone();
        let state_gate = gate.clone();
        let peer = peer_id.to_string();
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                let gate = state_gate.clone();
                let peer = peer.clone();
                Box::pin(async move {
                    if !gate.is_current() {
                        return;
                    }
                    debug!("Peer {} connection state: {}", peer, state);
                    match state {
                        RTCPeerConnectionState::Failed => {
                            sink.emit(TransportEvent::Failed("peer connection failed".to_string()))
                        }
                        RTCPeerConnectionState::Disconnected => {
                            sink.emit(TransportEvent::Disconnected)
                        }
                        _ => {}
                    }
                })
            },
        ));

        let sink = events.clone();
        let channel_slot = Arc::clone(channel);
        connection.on_data_channel(Box::new(move |data_channel: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            let gate = gate.clone();
            let channel_slot = Arc::clone(&channel_slot);
            Box::pin(async move {
                if !gate.is_current() {
                    return;
                }
                debug!("Remote data channel '{}' announced", data_channel.label());
                wire_channel(&data_channel, &sink, &gate);
                *channel_slot.write().await = Some(data_channel);
            })
        }));

        Ok(connection)
    }

    fn current_gate(&self) -> EpochGate {
        EpochGate {
            epoch: Arc::clone(&self.epoch),
            value: self.epoch.load(Ordering::SeqCst),
        }
    }

    async fn connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&*self.connection.read().await)
    }

    async fn local_sdp(connection: &RTCPeerConnection) -> Result<String> {
        connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| Error::SdpError("No local description".to_string()))
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, events: &TransportEventSink, gate: &EpochGate) {
    let sink = events.clone();
    let open_gate = gate.clone();
    let label = channel.label().to_string();
    channel.on_open(Box::new(move || {
        Box::pin(async move {
            if open_gate.is_current() {
                debug!("Data channel '{}' opened", label);
                sink.emit(TransportEvent::Connected);
            }
        })
    }));

    let sink = events.clone();
    let message_gate = gate.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let sink = sink.clone();
        let gate = message_gate.clone();
        Box::pin(async move {
            if gate.is_current() {
                sink.emit(TransportEvent::Data(message.data));
            }
        })
    }));

    let sink = events.clone();
    let close_gate = gate.clone();
    channel.on_close(Box::new(move || {
        let sink = sink.clone();
        let gate = close_gate.clone();
        Box::pin(async move {
            if gate.is_current() {
                sink.emit(TransportEvent::Disconnected);
            }
        })
    }));
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    #[instrument(skip(self), fields(peer = %self.peer_id))]
    async fn create_offer(&self) -> Result<String> {
        let connection = self.connection().await;

        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = connection
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to create data channel: {}", e)))?;
        wire_channel(&channel, &self.events, &self.current_gate());
        *self.channel.write().await = Some(channel);

        let offer = connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;
        connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP offer");
        Self::local_sdp(&connection).await
    }

    #[instrument(skip(self, offer_sdp), fields(peer = %self.peer_id))]
    async fn accept_offer(&self, offer_sdp: &str) -> Result<String> {
        let connection = self.connection().await;

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e)))?;
        connection
            .set_remote_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;
        connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        debug!("Created SDP answer");
        Self::local_sdp(&connection).await
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e)))?;
        self.connection()
            .await
            .set_remote_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.connection()
            .await
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        info!("Discarding local offer for peer {}", self.peer_id);

        let value = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let gate = EpochGate {
            epoch: Arc::clone(&self.epoch),
            value,
        };
        let fresh = Self::open_connection(
            &self.api,
            &self.ice_servers,
            &self.peer_id,
            &self.events,
            &self.channel,
            gate,
        )
        .await?;

        self.channel.write().await.take();
        let old = std::mem::replace(&mut *self.connection.write().await, fresh);
        if let Err(e) = old.close().await {
            debug!("Closing discarded peer connection failed: {}", e);
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let channel = self
            .channel
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::DataChannelError("No data channel".to_string()))?;
        channel
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| Error::DataChannelError(format!("Failed to send: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing peer connection for peer {}", self.peer_id);
        self.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close().await;
        }
        self.connection()
            .await
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
