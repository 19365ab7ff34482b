//! Per-incarnation driver task
//!
//! Owns the transport of one peer incarnation and executes transport
//! operations and signaling publishes strictly in the order the state
//! machine requested them. Results flow back to the session worker as
//! [`DriverReport`]s tagged by the worker with the incarnation generation.

use super::lifecycle::{retry_transient, ReconnectionPolicy};
use super::transport::{PeerFrame, PeerTransport, TransportCommand, TransportContext, TransportFactory};
use crate::signaling::{SignalingChannel, SignalingMessage};
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

/// Work item for a driver
#[derive(Debug, Clone)]
pub(crate) enum DriverCommand {
    Publish(SignalingMessage),
    Transport(TransportCommand),
}

/// Result of driver work that the state machine needs to see
#[derive(Debug, Clone, PartialEq)]
pub enum DriverReport {
    /// Local offer SDP is ready to publish
    OfferCreated(String),
    /// Local answer SDP is ready to publish
    AnswerCreated(String),
    /// A transport operation failed
    OperationFailed { op: &'static str, error: String },
    /// A signaling publish failed after retries
    PublishFailed(String),
    /// A data channel frame could not be sent
    SendFailed(PeerFrame),
    /// The transport was closed and the driver stopped
    Closed,
}

/// Dependencies of a driver task
pub(crate) struct DriverSetup {
    pub context: TransportContext,
    pub factory: Arc<dyn TransportFactory>,
    pub channel: Arc<dyn SignalingChannel>,
    pub publish_policy: ReconnectionPolicy,
}

/// Handle to a running driver task
pub(crate) struct PeerDriver {
    commands: mpsc::UnboundedSender<DriverCommand>,
    handle: JoinHandle<()>,
}

impl PeerDriver {
    pub fn spawn<F>(setup: DriverSetup, report: F) -> Self
    where
        F: Fn(DriverReport) + Send + Sync + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!(
            "peer_driver",
            session = %setup.context.session_id,
            peer = %setup.context.remote_peer_id
        );
        let handle = tokio::spawn(run(setup, rx, report).instrument(span));
        Self { commands, handle }
    }

    /// Queue a command. Returns `false` once the driver has stopped.
    pub fn send(&self, command: DriverCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn into_handle(self) -> JoinHandle<()> {
        self.handle
    }
}

async fn run<F>(setup: DriverSetup, mut rx: mpsc::UnboundedReceiver<DriverCommand>, report: F)
where
    F: Fn(DriverReport) + Send + Sync + 'static,
{
    let session_id = setup.context.session_id.clone();

    let transport = match setup.factory.create(setup.context).await {
        Ok(transport) => Some(transport),
        Err(e) => {
            warn!("Failed to create transport: {}", e);
            report(DriverReport::OperationFailed {
                op: "create_transport",
                error: e.to_string(),
            });
            None
        }
    };

    while let Some(command) = rx.recv().await {
        match command {
            DriverCommand::Publish(message) => {
                if let Err(e) = publish_with_retry(
                    setup.channel.as_ref(),
                    &session_id,
                    &message,
                    &setup.publish_policy,
                )
                .await
                {
                    warn!("Giving up on {} publish: {}", message.type_name(), e);
                    report(DriverReport::PublishFailed(e.to_string()));
                }
            }

            DriverCommand::Transport(TransportCommand::Close) => {
                if let Some(transport) = &transport {
                    if let Err(e) = transport.close().await {
                        debug!("Transport close failed: {}", e);
                    }
                }
                report(DriverReport::Closed);
                return;
            }

            DriverCommand::Transport(command) => {
                let Some(transport) = transport.as_deref() else {
                    report(DriverReport::OperationFailed {
                        op: command.name(),
                        error: "transport unavailable".to_string(),
                    });
                    continue;
                };
                if let Some(result) = execute(transport, command).await {
                    report(result);
                }
            }
        }
    }

    // worker dropped the queue without closing
    if let Some(transport) = transport {
        let _ = transport.close().await;
    }
}

async fn execute(transport: &dyn PeerTransport, command: TransportCommand) -> Option<DriverReport> {
    let op = command.name();
    trace!("transport: {}", op);

    let result = match command {
        TransportCommand::CreateOffer => transport
            .create_offer()
            .await
            .map(|sdp| Some(DriverReport::OfferCreated(sdp))),
        TransportCommand::AcceptOffer(sdp) => transport
            .accept_offer(&sdp)
            .await
            .map(|answer| Some(DriverReport::AnswerCreated(answer))),
        TransportCommand::ApplyAnswer(sdp) => transport.apply_answer(&sdp).await.map(|_| None),
        TransportCommand::AddCandidate(candidate) => {
            // a single bad candidate does not doom the connection
            if let Err(e) = transport.add_ice_candidate(&candidate).await {
                warn!("Ignoring remote candidate: {}", e);
            }
            Ok(None)
        }
        TransportCommand::Rollback => transport.rollback().await.map(|_| None),
        TransportCommand::SendFrame(frame) => {
            let sent = match frame.to_bytes() {
                Ok(bytes) => transport.send(bytes).await,
                Err(e) => Err(e),
            };
            return match sent {
                Ok(()) => None,
                Err(e) => {
                    debug!("Frame not sent: {}", e);
                    Some(DriverReport::SendFailed(frame))
                }
            };
        }
        TransportCommand::Close => Ok(None),
    };

    match result {
        Ok(report) => report,
        Err(e) => Some(DriverReport::OperationFailed {
            op,
            error: e.to_string(),
        }),
    }
}

/// Publish with bounded retries on transient relay errors
pub(crate) async fn publish_with_retry(
    channel: &dyn SignalingChannel,
    session_id: &str,
    message: &SignalingMessage,
    policy: &ReconnectionPolicy,
) -> Result<()> {
    let what = format!("Publish of {} to {}", message.type_name(), message.to);
    retry_transient(policy, &what, || channel.publish(session_id, message)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::TransportEventSink;
    use crate::signaling::{MemoryRelay, Signal};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingTransport {
        recorder: Recorder,
    }

    impl RecordingTransport {
        fn record(&self, call: impl Into<String>) {
            self.recorder.calls.lock().push(call.into());
        }
    }

    #[async_trait]
    impl PeerTransport for RecordingTransport {
        async fn create_offer(&self) -> Result<String> {
            self.record("create_offer");
            Ok("offer".to_string())
        }

        async fn accept_offer(&self, offer_sdp: &str) -> Result<String> {
            self.record(format!("accept_offer:{}", offer_sdp));
            Ok("answer".to_string())
        }

        async fn apply_answer(&self, answer_sdp: &str) -> Result<()> {
            self.record(format!("apply_answer:{}", answer_sdp));
            Err(Error::SdpError("mismatched answer".to_string()))
        }

        async fn add_ice_candidate(&self, _candidate: &crate::signaling::IceCandidate) -> Result<()> {
            self.record("add_candidate");
            Err(Error::IceCandidateError("bad candidate".to_string()))
        }

        async fn rollback(&self) -> Result<()> {
            self.record("rollback");
            Ok(())
        }

        async fn send(&self, _data: Bytes) -> Result<()> {
            self.record("send");
            Err(Error::DataChannelError("not open".to_string()))
        }

        async fn close(&self) -> Result<()> {
            self.record("close");
            Ok(())
        }
    }

    #[async_trait]
    impl TransportFactory for Recorder {
        async fn create(&self, _context: TransportContext) -> Result<Box<dyn PeerTransport>> {
            Ok(Box::new(RecordingTransport {
                recorder: self.clone(),
            }))
        }
    }

    fn spawn_driver(
        recorder: &Recorder,
        relay: &MemoryRelay,
    ) -> (PeerDriver, mpsc::UnboundedReceiver<DriverReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _events_rx) = TransportEventSink::channel();
        let setup = DriverSetup {
            context: TransportContext {
                session_id: "S1".to_string(),
                local_peer_id: "a".to_string(),
                remote_peer_id: "b".to_string(),
                events,
            },
            factory: Arc::new(recorder.clone()),
            channel: Arc::new(relay.clone()),
            publish_policy: ReconnectionPolicy::signaling(3),
        };
        let driver = PeerDriver::spawn(setup, move |report| {
            let _ = tx.send(report);
        });
        (driver, rx)
    }

    fn bye(seq: u64) -> SignalingMessage {
        SignalingMessage {
            session_id: "S1".to_string(),
            from: "a".to_string(),
            to: "b".to_string(),
            seq,
            ts: 0,
            signal: Signal::Bye { reason: None },
        }
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let recorder = Recorder::default();
        let relay = MemoryRelay::new();
        let (driver, mut reports) = spawn_driver(&recorder, &relay);

        driver.send(DriverCommand::Transport(TransportCommand::CreateOffer));
        driver.send(DriverCommand::Transport(TransportCommand::Rollback));
        driver.send(DriverCommand::Transport(TransportCommand::AcceptOffer(
            "remote".into(),
        )));
        driver.send(DriverCommand::Transport(TransportCommand::Close));

        assert_eq!(
            reports.recv().await,
            Some(DriverReport::OfferCreated("offer".into()))
        );
        assert_eq!(
            reports.recv().await,
            Some(DriverReport::AnswerCreated("answer".into()))
        );
        assert_eq!(reports.recv().await, Some(DriverReport::Closed));

        driver.into_handle().await.unwrap();
        assert_eq!(
            *recorder.calls.lock(),
            vec!["create_offer", "rollback", "accept_offer:remote", "close"]
        );
    }

    #[tokio::test]
    async fn test_failures_are_reported() {
        let recorder = Recorder::default();
        let relay = MemoryRelay::new();
        let (driver, mut reports) = spawn_driver(&recorder, &relay);

        driver.send(DriverCommand::Transport(TransportCommand::AddCandidate(
            crate::signaling::IceCandidate {
                candidate: "candidate:x".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            },
        )));
        driver.send(DriverCommand::Transport(TransportCommand::ApplyAnswer(
            "answer".into(),
        )));
        let frame = PeerFrame::Heartbeat { ts: 1 };
        driver.send(DriverCommand::Transport(TransportCommand::SendFrame(
            frame.clone(),
        )));

        // candidate errors are swallowed
        assert!(matches!(
            reports.recv().await,
            Some(DriverReport::OperationFailed { op: "apply_answer", .. })
        ));
        assert_eq!(reports.recv().await, Some(DriverReport::SendFailed(frame)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_retries_transient_errors() {
        let recorder = Recorder::default();
        let relay = MemoryRelay::new();
        let (driver, mut reports) = spawn_driver(&recorder, &relay);

        relay.fail_next_publishes(2);
        driver.send(DriverCommand::Publish(bye(1)));
        driver.send(DriverCommand::Transport(TransportCommand::Close));

        assert_eq!(reports.recv().await, Some(DriverReport::Closed));
        assert_eq!(relay.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_gives_up() {
        let recorder = Recorder::default();
        let relay = MemoryRelay::new();
        let (driver, mut reports) = spawn_driver(&recorder, &relay);

        relay.fail_next_publishes(10);
        driver.send(DriverCommand::Publish(bye(1)));

        assert!(matches!(
            reports.recv().await,
            Some(DriverReport::PublishFailed(_))
        ));
        assert!(relay.published().is_empty());
    }
}
