//! In-process transport
//!
//! Endpoints created by one [`LoopbackNetwork`] connect to each other
//! without sockets. The "SDP" names the endpoint and a single synthetic
//! candidate per endpoint stands in for ICE: an endpoint is ready once it
//! knows the remote endpoint and has applied a candidate for it, and a link
//! comes up when both ends are ready. Links between two peers can be
//! partitioned to simulate a network that silently drops traffic.

use super::transport::{PeerTransport, TransportContext, TransportEvent, TransportEventSink, TransportFactory};
use crate::signaling::IceCandidate;
use crate::{Error, PeerId, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

const CANDIDATE_PREFIX: &str = "candidate:loopback ";

#[derive(Debug, Serialize, Deserialize)]
struct LoopbackSdp {
    endpoint: String,
    peer: PeerId,
}

#[derive(Debug)]
struct Endpoint {
    local: PeerId,
    remote: PeerId,
    sink: TransportEventSink,
    remote_endpoint: Option<String>,
    remote_candidate: bool,
    linked: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<String, Endpoint>,
    partitions: HashSet<(PeerId, PeerId)>,
    next_id: u64,
    links_established: u64,
}

impl NetworkState {
    fn pair(a: &str, b: &str) -> (PeerId, PeerId) {
        if a < b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    fn partitioned(&self, a: &str, b: &str) -> bool {
        self.partitions.contains(&Self::pair(a, b))
    }

    /// Link `id` with its remote endpoint when both ends are ready
    fn try_link(&mut self, id: &str) -> Vec<TransportEventSink> {
        let Some(endpoint) = self.endpoints.get(id) else {
            return Vec::new();
        };
        if endpoint.linked || !endpoint.remote_candidate {
            return Vec::new();
        }
        let Some(remote_id) = endpoint.remote_endpoint.clone() else {
            return Vec::new();
        };
        if self.partitioned(&endpoint.local, &endpoint.remote) {
            return Vec::new();
        }

        let remote_ready = self
            .endpoints
            .get(&remote_id)
            .map(|r| r.remote_candidate && r.remote_endpoint.as_deref() == Some(id))
            .unwrap_or(false);
        if !remote_ready {
            return Vec::new();
        }

        let mut sinks = Vec::new();
        for key in [id, remote_id.as_str()] {
            if let Some(endpoint) = self.endpoints.get_mut(key) {
                endpoint.linked = true;
                sinks.push(endpoint.sink.clone());
            }
        }
        self.links_established += 1;
        debug!("loopback: linked {} <-> {}", id, remote_id);
        sinks
    }
}

/// Shared in-process network; also the [`TransportFactory`]
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently drop all traffic between two peers and block new links
    pub fn partition(&self, a: &str, b: &str) {
        self.state.lock().partitions.insert(NetworkState::pair(a, b));
    }

    /// Undo [`partition`](Self::partition)
    pub fn heal(&self, a: &str, b: &str) {
        self.state
            .lock()
            .partitions
            .remove(&NetworkState::pair(a, b));
    }

    /// Open endpoints (transports not yet closed)
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    /// Open endpoints of `local` towards `remote`
    pub fn endpoints_between(&self, local: &str, remote: &str) -> usize {
        self.state
            .lock()
            .endpoints
            .values()
            .filter(|e| e.local == local && e.remote == remote)
            .count()
    }

    /// Links established since the network was created
    pub fn links_established(&self) -> u64 {
        self.state.lock().links_established
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(&self, context: TransportContext) -> Result<Box<dyn PeerTransport>> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("{}-{}-{}", context.local_peer_id, context.remote_peer_id, state.next_id);
        state.endpoints.insert(
            id.clone(),
            Endpoint {
                local: context.local_peer_id.clone(),
                remote: context.remote_peer_id.clone(),
                sink: context.events,
                remote_endpoint: None,
                remote_candidate: false,
                linked: false,
            },
        );
        trace!("loopback: opened endpoint {}", id);

        Ok(Box::new(LoopbackTransport {
            network: self.clone(),
            id,
            local: context.local_peer_id,
        }))
    }
}

/// One endpoint of a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    id: String,
    local: PeerId,
}

impl LoopbackTransport {
    fn describe(&self) -> Result<String> {
        Ok(serde_json::to_string(&LoopbackSdp {
            endpoint: self.id.clone(),
            peer: self.local.clone(),
        })?)
    }

    fn parse(sdp: &str) -> Result<LoopbackSdp> {
        serde_json::from_str(sdp)
            .map_err(|e| Error::SdpError(format!("Not a loopback description: {}", e)))
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("{}{}", CANDIDATE_PREFIX, self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    /// Record the remote endpoint and announce our own candidate
    fn set_remote(&self, remote_endpoint: String) -> Result<()> {
        let sink = {
            let mut state = self.network.state.lock();
            let endpoint = state
                .endpoints
                .get_mut(&self.id)
                .ok_or_else(|| Error::TransportError("endpoint closed".to_string()))?;
            endpoint.remote_endpoint = Some(remote_endpoint);
            endpoint.sink.clone()
        };
        sink.emit(TransportEvent::LocalCandidate(self.candidate()));
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<String> {
        let sink = self
            .network
            .state
            .lock()
            .endpoints
            .get(&self.id)
            .map(|e| e.sink.clone())
            .ok_or_else(|| Error::TransportError("endpoint closed".to_string()))?;
        sink.emit(TransportEvent::LocalCandidate(self.candidate()));
        self.describe()
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String> {
        let offer = Self::parse(offer_sdp)?;
        self.set_remote(offer.endpoint)?;
        self.describe()
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<()> {
        let answer = Self::parse(answer_sdp)?;
        let mut state = self.network.state.lock();
        let endpoint = state
            .endpoints
            .get_mut(&self.id)
            .ok_or_else(|| Error::TransportError("endpoint closed".to_string()))?;
        endpoint.remote_endpoint = Some(answer.endpoint);
        drop(state);
        self.link_if_ready();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let target = candidate
            .candidate
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| Error::IceCandidateError(candidate.candidate.clone()))?;

        {
            let mut state = self.network.state.lock();
            let Some(endpoint) = state.endpoints.get_mut(&self.id) else {
                return Ok(());
            };
            if endpoint.remote_endpoint.as_deref() != Some(target) {
                debug!("loopback: {} ignoring candidate for {}", self.id, target);
                return Ok(());
            }
            endpoint.remote_candidate = true;
        }
        self.link_if_ready();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        if let Some(endpoint) = state.endpoints.get_mut(&self.id) {
            endpoint.remote_endpoint = None;
            endpoint.remote_candidate = false;
        }
        Ok(())
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let sink = {
            let state = self.network.state.lock();
            let endpoint = state
                .endpoints
                .get(&self.id)
                .ok_or_else(|| Error::DataChannelError("endpoint closed".to_string()))?;
            if !endpoint.linked {
                return Err(Error::DataChannelError("data channel not open".to_string()));
            }
            if state.partitioned(&endpoint.local, &endpoint.remote) {
                trace!("loopback: dropping {} bytes (partitioned)", data.len());
                return Ok(());
            }
            let remote = endpoint
                .remote_endpoint
                .as_ref()
                .and_then(|id| state.endpoints.get(id));
            match remote {
                Some(remote) => remote.sink.clone(),
                None => return Err(Error::DataChannelError("remote endpoint closed".to_string())),
            }
        };
        sink.emit(TransportEvent::Data(data));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let remote_sink = {
            let mut state = self.network.state.lock();
            let Some(endpoint) = state.endpoints.remove(&self.id) else {
                return Ok(());
            };
            endpoint
                .remote_endpoint
                .filter(|_| endpoint.linked)
                .and_then(|id| state.endpoints.get_mut(&id))
                .map(|remote| {
                    remote.linked = false;
                    remote.sink.clone()
                })
        };
        trace!("loopback: closed endpoint {}", self.id);
        if let Some(sink) = remote_sink {
            sink.emit(TransportEvent::Disconnected);
        }
        Ok(())
    }
}

impl LoopbackTransport {
    fn link_if_ready(&self) {
        let sinks = self.network.state.lock().try_link(&self.id);
        for sink in sinks {
            sink.emit(TransportEvent::Connected);
        }
    }
}
