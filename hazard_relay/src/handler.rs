use crate::backend::InferenceError;
use crate::caption::CaptionService;
use crate::frame::Frame;
use crate::server::SharedState;
use crate::telemetry::Metrics;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, net::SocketAddr, sync::Arc};
use tokio::{
    sync::broadcast::{self, error::TryRecvError},
    time::Instant,
};
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingFrame,
    Processing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::AwaitingFrame => "awaiting_frame",
            ConnectionState::Processing => "processing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// The joined outcome of the two calls made for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameAnalysis {
    pub hazardous: bool,
    pub description: String,
}

enum Inbound {
    Frame(Frame),
    Ignored,
    Closed,
}

fn classify_message<E: Display>(message: Option<Result<Message, E>>) -> Inbound {
    match message {
        Some(Ok(Message::Binary(data))) => Inbound::Frame(Frame::from(data)),
        Some(Ok(Message::Close(_))) | None => Inbound::Closed,
        Some(Ok(_)) => Inbound::Ignored,
        Some(Err(e)) => {
            tracing::debug!("Connection dropped while reading: {}", e);
            Inbound::Closed
        }
    }
}

/// Issues the hazard and describe calls concurrently. The first failure wins
/// and the sibling call is dropped.
pub async fn analyze_frame(
    caption: &CaptionService,
    frame: &Frame,
) -> Result<FrameAnalysis, InferenceError> {
    let routes = caption.routes();
    let (hazardous, description) = tokio::try_join!(
        caption.is_hazardous_frame(frame, routes.hazard.as_ref()),
        caption.describe_frame(frame, routes.describe.as_ref()),
    )?;

    Ok(FrameAnalysis {
        hazardous,
        description,
    })
}

pub struct ConnectionHandler {
    caption: Arc<CaptionService>,
    metrics: Arc<Metrics>,
    shutdown_rx: broadcast::Receiver<()>,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub fn new(
        caption: Arc<CaptionService>,
        metrics: Arc<Metrics>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            caption,
            metrics,
            shutdown_rx,
            state: ConnectionState::AwaitingFrame,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        tracing::trace!("{} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
    }

    /// Drives one connection until it closes. A closed connection is the
    /// normal outcome; an inference failure closes it with an error frame and
    /// is returned to the caller.
    pub async fn run<S, K, E>(mut self, mut stream: S, mut sink: K) -> Result<(), InferenceError>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        K: Sink<Message> + Unpin,
        K::Error: Display,
        E: Display,
    {
        let mut pending: Option<Frame> = None;

        let outcome = loop {
            if self.shutdown_requested() {
                tracing::info!("Closing connection for shutdown");
                send_close(&mut sink, close_code::AWAY, "server shutting down").await;
                break Ok(());
            }

            let frame = match pending.take() {
                Some(frame) => frame,
                None => {
                    let inbound = tokio::select! {
                        message = stream.next() => classify_message(message),
                        _ = self.shutdown_rx.recv() => {
                            tracing::info!("Closing connection for shutdown");
                            send_close(&mut sink, close_code::AWAY, "server shutting down").await;
                            break Ok(());
                        }
                    };
                    match inbound {
                        Inbound::Frame(frame) => frame,
                        Inbound::Ignored => {
                            self.metrics.record_frame("ignored");
                            continue;
                        }
                        Inbound::Closed => break Ok(()),
                    }
                }
            };

            self.metrics.record_frame("binary");
            self.transition(ConnectionState::Processing);

            let analysis = match self.process(&frame, &mut stream, &mut pending).await {
                Some(Ok(analysis)) => analysis,
                Some(Err(e)) => {
                    self.metrics.record_inference_failure(e.kind());
                    send_close(&mut sink, close_code::ERROR, "inference failed").await;
                    break Err(e);
                }
                None => {
                    tracing::debug!("Connection closed during processing");
                    break Ok(());
                }
            };

            self.metrics.record_verdict(analysis.hazardous);
            if analysis.hazardous {
                tracing::info!(description = %analysis.description, "Hazard detected");
                if let Err(e) = sink.send(Message::Text(analysis.description.into())).await {
                    tracing::debug!("Connection closed while replying: {}", e);
                    break Ok(());
                }
            }

            self.transition(ConnectionState::AwaitingFrame);
        };

        self.transition(ConnectionState::Closed);
        outcome
    }

    /// A shutdown signalled while a frame was processing is only seen here,
    /// so a held frame is never started once the server is draining.
    fn shutdown_requested(&mut self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => true,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        }
    }

    /// Runs the analysis while still watching the connection. Returns `None`
    /// when the peer goes away before the analysis completes. The newest frame
    /// that arrives meanwhile is held in `pending`; an older held frame is
    /// superseded.
    async fn process<S, E>(
        &self,
        frame: &Frame,
        stream: &mut S,
        pending: &mut Option<Frame>,
    ) -> Option<Result<FrameAnalysis, InferenceError>>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let started = Instant::now();
        let analysis = analyze_frame(&self.caption, frame);
        tokio::pin!(analysis);

        loop {
            tokio::select! {
                biased;
                result = &mut analysis => {
                    self.metrics
                        .record_inference_duration(started.elapsed().as_millis() as u64);
                    return Some(result);
                }
                message = stream.next() => {
                    match classify_message(message) {
                        Inbound::Frame(next) => {
                            if pending.replace(next).is_some() {
                                self.metrics.record_frame("superseded");
                            }
                        }
                        Inbound::Ignored => self.metrics.record_frame("ignored"),
                        Inbound::Closed => return None,
                    }
                }
            }
        }
    }
}

async fn send_close<K>(sink: &mut K, code: u16, reason: &'static str)
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    let frame = CloseFrame {
        code,
        reason: Utf8Bytes::from_static(reason),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!("Failed to send close frame: {}", e);
    }
}

#[instrument(skip(socket, state))]
pub async fn serve_connection(socket: WebSocket, peer: SocketAddr, state: SharedState) {
    let _guard = state.connections.register();
    state.metrics.record_connection_opened();
    tracing::info!("Connection opened");

    let (sink, stream) = socket.split();
    let handler = ConnectionHandler::new(
        state.caption_service.clone(),
        state.metrics.clone(),
        state.shutdown_tx.subscribe(),
    );

    match handler.run(stream, sink).await {
        Ok(()) => tracing::info!("Connection closed"),
        Err(e) => tracing::error!("Connection terminated: {}", e),
    }

    state.metrics.record_connection_closed();
}
