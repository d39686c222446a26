//! Async per-connection runner
//!
//! ```text
//!                ┌──────────────┐  frames   ┌──────────────────────┐
//!  socket read ─▶│ reader task  │──────────▶│                      │── FramedWrite ─▶ socket write
//!                └──────────────┘           │  owner loop          │
//!                ┌──────────────┐  ticks    │  (only mutator of    │── EngineEvent ─▶ host
//!                │ alive-check  │──────────▶│   ProtocolEngine)    │
//!                │ ticker task  │           │                      │◀─ commands ──── ConnectionHandle
//!                └──────────────┘           └──────────────────────┘
//! ```
//!
//! The ticker only exists while routing is Active and is cancelled through
//! a child [`CancellationToken`]. Teardown cancels the ticker, aborts the
//! reader and awaits both before the engine state is dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::doip::{CodecError, DoipCodec, DoipFrame, FramingError};
use crate::engine::{EngineEvent, EngineOutput, ProtocolEngine};
use crate::routing::RoutingState;
use crate::transfer::TransferState;

const FRAME_QUEUE: usize = 32;
const EVENT_QUEUE: usize = 64;
const COMMAND_QUEUE: usize = 16;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Engine(#[from] crate::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Peer did not answer alive check")]
    AliveCheckTimeout,

    #[error("Connection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<CodecError> for ConnectionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Framing(e) => Self::Framing(e),
            CodecError::Io(e) => Self::Io(e),
        }
    }
}

/// Snapshot of the session, readable without going through the owner loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub routing: RoutingState,
    pub tester_address: Option<u16>,
    pub transfer: TransferState,
    pub bytes_transferred: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            routing: RoutingState::Idle,
            tester_address: None,
            transfer: TransferState::Idle,
            bytes_transferred: 0,
        }
    }
}

enum Command {
    SendDiagnostic {
        target_address: u16,
        uds: Vec<u8>,
        reply: oneshot::Sender<Result<(), crate::Error>>,
    },
    Deactivate {
        reply: oneshot::Sender<()>,
    },
}

/// Host-side handle to a running connection
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    status: Arc<RwLock<ConnectionStatus>>,
    task: JoinHandle<Result<(), ConnectionError>>,
}

impl ConnectionHandle {
    /// Send a UDS request from this gateway to `target_address`
    pub async fn send_diagnostic(&self, target_address: u16, uds: &[u8]) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendDiagnostic {
                target_address,
                uds: uds.to_vec(),
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)??;
        Ok(())
    }

    /// Leave the Active state; the connection stays open
    pub async fn deactivate(&self) -> Result<(), ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Deactivate { reply })
            .await
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_active(&self) -> bool {
        self.status.read().routing == RoutingState::Active
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the connection and wait for teardown
    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        self.cancel.cancel();
        self.task.await?
    }

    /// Wait for the connection to end on its own
    pub async fn join(self) -> Result<(), ConnectionError> {
        self.task.await?
    }
}

/// Start serving `io` with `engine`.
///
/// Events are delivered in order on the returned receiver, which the host
/// must keep draining. The receiver ends once the connection is torn down.
pub fn spawn<IO>(io: IO, engine: ProtocolEngine) -> (ConnectionHandle, mpsc::Receiver<EngineEvent>)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_payload_length = engine.config().doip.max_payload_length;
    let (read_half, write_half) = tokio::io::split(io);

    let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (tick_tx, tick_rx) = mpsc::channel(1);

    let cancel = CancellationToken::new();
    let status = Arc::new(RwLock::new(ConnectionStatus::default()));

    let reader = tokio::spawn(read_frames(
        FramedRead::new(read_half, DoipCodec::new(max_payload_length)),
        frame_tx,
        cancel.child_token(),
    ));

    let connection = Connection {
        engine,
        writer: FramedWrite::new(write_half, DoipCodec::new(max_payload_length)),
        frames: frame_rx,
        commands: command_rx,
        events: event_tx,
        tick_tx,
        tick_rx,
        ticker: None,
        reader,
        cancel: cancel.clone(),
        status: status.clone(),
    };
    let task = tokio::spawn(connection.run());

    (
        ConnectionHandle {
            commands: command_tx,
            cancel,
            status,
            task,
        },
        event_rx,
    )
}

/// Clock shared with tokio so paused-time tests stay deterministic
fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn read_frames<R>(
    mut reader: FramedRead<R, DoipCodec>,
    frames: mpsc::Sender<Result<DoipFrame, CodecError>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if frames.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                let _ = frames.send(Err(e)).await;
                break;
            }
            None => break,
        }
    }
    debug!("Reader stopped");
}

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

fn spawn_ticker(period: Duration, ticks: mpsc::Sender<()>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {
                    // A full queue already holds a pending tick
                    if let Err(TrySendError::Closed(_)) = ticks.try_send(()) {
                        break;
                    }
                }
            }
        }
    })
}

struct Connection<W> {
    engine: ProtocolEngine,
    writer: FramedWrite<W, DoipCodec>,
    frames: mpsc::Receiver<Result<DoipFrame, CodecError>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<EngineEvent>,
    tick_tx: mpsc::Sender<()>,
    tick_rx: mpsc::Receiver<()>,
    ticker: Option<Ticker>,
    reader: JoinHandle<()>,
    cancel: CancellationToken,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) -> Result<(), ConnectionError> {
        let result = self.serve().await;
        match &result {
            Ok(()) => info!("Connection closed"),
            Err(e) => warn!(error = %e, "Connection ended"),
        }
        self.teardown().await;
        result
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = self.frames.recv() => match frame {
                    Some(Ok(frame)) => {
                        let out = self.engine.handle_frame(&frame, now());
                        self.apply(out).await?;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Framing failure, closing connection");
                        return Err(e.into());
                    }
                    None => {
                        info!("Peer disconnected");
                        return Ok(());
                    }
                },
                Some(()) = self.tick_rx.recv() => {
                    let out = self.engine.poll_alive_check(now());
                    let expired = out
                        .events
                        .iter()
                        .any(|e| matches!(e, EngineEvent::RoutingExpired { .. }));
                    self.apply(out).await?;
                    if expired {
                        return Err(ConnectionError::AliveCheckTimeout);
                    }
                }
                Some(command) = self.commands.recv() => self.on_command(command).await?,
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<(), ConnectionError> {
        match command {
            Command::SendDiagnostic {
                target_address,
                uds,
                reply,
            } => match self.engine.diagnostic_request(target_address, &uds) {
                Ok(frame) => {
                    self.writer.send(frame).await?;
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Deactivate { reply } => {
                let out = self.engine.deactivate();
                self.apply(out).await?;
                let _ = reply.send(());
            }
        }
        Ok(())
    }

    /// Write frames, adjust the ticker, then publish events
    async fn apply(&mut self, out: EngineOutput) -> Result<(), ConnectionError> {
        let reactivated = out
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::RoutingActivated { .. }));

        for frame in out.frames {
            debug!(payload_type = %frame.payload_type, len = frame.payload.len(), "Frame sent");
            self.writer.feed(frame).await?;
        }
        self.writer.flush().await?;

        if reactivated || !self.engine.routing().is_active() {
            self.stop_ticker().await;
        }
        if self.engine.routing().is_active() && self.ticker.is_none() {
            self.start_ticker();
        }
        self.publish_status();

        for event in out.events {
            if self.events.send(event).await.is_err() {
                debug!("Event receiver dropped");
            }
        }
        Ok(())
    }

    fn start_ticker(&mut self) {
        let period = self.engine.routing().alive_check_interval();
        let token = self.cancel.child_token();
        debug!(period_ms = period.as_millis() as u64, "Starting alive-check ticker");
        let handle = spawn_ticker(period, self.tick_tx.clone(), token.clone());
        self.ticker = Some(Ticker { token, handle });
    }

    async fn stop_ticker(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.token.cancel();
            if let Err(e) = ticker.handle.await {
                error!(error = %e, "Alive-check ticker failed");
            }
            // Drop a tick that was already queued for the old schedule
            while self.tick_rx.try_recv().is_ok() {}
        }
    }

    fn publish_status(&self) {
        let routing = self.engine.routing();
        let transfer = self.engine.transfer();
        *self.status.write() = ConnectionStatus {
            routing: routing.state(),
            tester_address: routing.peer_logical_address(),
            transfer: transfer.state(),
            bytes_transferred: transfer.bytes_transferred(),
        };
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        self.stop_ticker().await;
        self.reader.abort();
        let _ = (&mut self.reader).await;
        if let Err(e) = self.writer.close().await {
            debug!(error = %e, "Error closing writer");
        }
        self.engine.reset();
        *self.status.write() = ConnectionStatus::default();
    }
}
