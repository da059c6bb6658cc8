//! Per-connection protocol state machine.
//!
//! A [`Connection`] owns the operation-id → [`Operation`] map of one
//! socket and processes inbound frames strictly in arrival order. Each
//! `start` spawns an independent operation task, so results of different
//! operations may interleave on the wire.
//!
//! Every exit path of [`Connection::run`] (terminate, disconnect, transport
//! failure, protocol violation) cancels all live operations before
//! returning, which releases their bus subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use super::messages::{
    CLOSE_ABNORMAL, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_PROTOCOL_VIOLATION, ClientMessage,
    OperationMessage, StartPayload,
};
use super::operation::{Finished, Operation, Outbound, Outbox};
use super::server::SubscriptionServer;
use crate::error::ProtocolError;
use crate::execution::{ExecutionResult, OperationContext, Principal, SubscribeOutcome};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, waiting for a successful `connection_init`.
    Init,
    /// Acknowledged; operations may be started.
    Ready,
    /// Terminate or disconnect observed; operations are being drained.
    Closing,
}

/// Inbound transport event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Text frame.
    Text(String),
    /// Binary frame, decoded as UTF-8 text.
    Binary(Vec<u8>),
    /// Peer closed the socket, with its close code if it sent one.
    Close(Option<u16>),
}

/// Transport read failure.
pub type TransportError = String;

enum Flow {
    Continue,
    Close { code: u16, reason: String },
}

/// Protocol state machine for one connection.
#[derive(Debug)]
pub struct Connection {
    id: Uuid,
    server: Arc<SubscriptionServer>,
    state: ConnectionState,
    operations: HashMap<String, Operation>,
    principal: Option<Principal>,
    outbox: Outbox,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
    next_generation: u64,
}

impl Connection {
    /// Creates a connection in [`ConnectionState::Init`] writing to `outbox`.
    #[must_use]
    pub fn new(server: Arc<SubscriptionServer>, outbox: Outbox) -> Self {
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            server,
            state: ConnectionState::Init,
            operations: HashMap::new(),
            principal: None,
            outbox,
            finished_tx,
            finished_rx,
            next_generation: 0,
        }
    }

    /// Connection identifier used in logs and operation contexts.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of live operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Processes `inbound` until the connection ends, then cancels every
    /// live operation.
    pub async fn run<S>(mut self, mut inbound: S)
    where
        S: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        tracing::info!(connection_id = %self.id, "connection opened");
        let mut keep_alive: Option<Interval> = None;

        let close_code = loop {
            tokio::select! {
                frame = inbound.next() => {
                    let flow = match frame {
                        Some(Ok(Frame::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Frame::Binary(bytes))) => match String::from_utf8(bytes) {
                            Ok(text) => self.handle_text(&text).await,
                            Err(_) => self.reject_frame(&ProtocolError::InvalidUtf8),
                        },
                        Some(Ok(Frame::Close(code))) => {
                            break normalize_close_code(code);
                        }
                        Some(Err(err)) => {
                            tracing::warn!(connection_id = %self.id, error = %err, "transport read failed");
                            break CLOSE_INTERNAL_ERROR;
                        }
                        None => break CLOSE_NORMAL,
                    };
                    if let Flow::Close { code, reason } = flow {
                        self.outbox.close(code, reason);
                        break code;
                    }
                    if self.state == ConnectionState::Ready && keep_alive.is_none() {
                        keep_alive = self.server.keep_alive().map(|period| {
                            let mut ticker = tokio::time::interval(period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            ticker
                        });
                    }
                }
                Some(done) = self.finished_rx.recv() => self.reap(done),
                () = next_tick(&mut keep_alive) => {
                    self.outbox.send(OperationMessage::keep_alive());
                }
                () = self.outbox.closed() => {
                    tracing::warn!(connection_id = %self.id, "transport write failed");
                    break CLOSE_INTERNAL_ERROR;
                }
            }
        };

        self.shutdown().await;
        tracing::info!(connection_id = %self.id, code = close_code, "connection closed");
    }

    async fn handle_text(&mut self, text: &str) -> Flow {
        match ClientMessage::decode(text) {
            Ok(message) => self.dispatch(message).await,
            Err(err) => self.reject_frame(&err),
        }
    }

    fn reject_frame(&mut self, err: &ProtocolError) -> Flow {
        tracing::warn!(connection_id = %self.id, error = %err, "undecodable frame");
        self.outbox
            .send(OperationMessage::connection_error(err.to_string()));
        Flow::Close {
            code: CLOSE_PROTOCOL_VIOLATION,
            reason: err.to_string(),
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Flow {
        match message {
            ClientMessage::ConnectionInit { payload } => self.init(payload).await,
            ClientMessage::Start { id, payload } => {
                if self.state == ConnectionState::Ready {
                    self.start(id, payload).await;
                } else {
                    self.outbox.send(OperationMessage::error(
                        Some(id),
                        serde_json::json!({ "message": "connection not initialised" }),
                    ));
                }
                Flow::Continue
            }
            ClientMessage::Stop { id } => {
                self.stop(&id).await;
                Flow::Continue
            }
            ClientMessage::ConnectionTerminate => {
                self.shutdown().await;
                Flow::Close {
                    code: CLOSE_NORMAL,
                    reason: String::new(),
                }
            }
            ClientMessage::Invalid { id, reason } => {
                tracing::debug!(connection_id = %self.id, ?id, %reason, "invalid message");
                self.outbox.send(OperationMessage::error(
                    id,
                    serde_json::json!({ "message": reason }),
                ));
                Flow::Continue
            }
        }
    }

    async fn init(&mut self, payload: Option<serde_json::Value>) -> Flow {
        if let Some(authenticate) = self.server.authenticator() {
            match authenticate(payload).await {
                Ok(principal) => {
                    tracing::debug!(connection_id = %self.id, principal = %principal.id, "authenticated");
                    self.principal = Some(principal);
                }
                Err(reason) => {
                    tracing::warn!(connection_id = %self.id, %reason, "authentication failed");
                    self.outbox
                        .send(OperationMessage::connection_error(reason.clone()));
                    return Flow::Close {
                        code: CLOSE_PROTOCOL_VIOLATION,
                        reason,
                    };
                }
            }
        }
        self.outbox.send(OperationMessage::connection_ack());
        self.state = ConnectionState::Ready;
        Flow::Continue
    }

    async fn start(&mut self, id: String, payload: StartPayload) {
        // At most one live operation per id.
        if let Some(previous) = self.operations.remove(&id) {
            tracing::debug!(connection_id = %self.id, op_id = %id, "replacing operation");
            previous.cancel().await;
        }

        let engine = Arc::clone(self.server.engine());
        let format = Arc::clone(self.server.error_formatter());

        let document = match engine.parse(&payload.query) {
            Ok(document) => document,
            Err(err) => {
                self.outbox
                    .send_result(&id, &ExecutionResult::from_error(err), &format);
                self.outbox.send(OperationMessage::complete(id.as_str()));
                return;
            }
        };

        let context = OperationContext {
            connection_id: self.id,
            operation_id: id.clone(),
            principal: self.principal.clone(),
        };
        let outcome = engine
            .subscribe(
                &document,
                payload.variables,
                payload.operation_name.as_deref(),
                &context,
            )
            .await;

        match outcome {
            Ok(SubscribeOutcome::Immediate(result)) => {
                self.outbox.send_result(&id, &result, &format);
                self.outbox.send(OperationMessage::complete(id.as_str()));
            }
            Ok(SubscribeOutcome::Stream(results)) => {
                self.next_generation += 1;
                tracing::debug!(connection_id = %self.id, op_id = %id, "operation started");
                let operation = Operation::spawn(
                    id.clone(),
                    self.next_generation,
                    results,
                    self.outbox.clone(),
                    format,
                    self.finished_tx.clone(),
                );
                self.operations.insert(id, operation);
            }
            Err(err) => {
                tracing::debug!(connection_id = %self.id, op_id = %id, error = %err, "subscribe failed");
                self.outbox.send_error(&id, &err, &format);
                self.outbox.send(OperationMessage::complete(id.as_str()));
            }
        }
    }

    async fn stop(&mut self, id: &str) {
        if let Some(operation) = self.operations.remove(id) {
            operation.cancel().await;
        }
        self.outbox.send(OperationMessage::complete(id));
    }

    /// Drops the map entry of an operation that completed on its own,
    /// unless the id has since been reused.
    fn reap(&mut self, done: Finished) {
        if self
            .operations
            .get(&done.id)
            .is_some_and(|op| op.generation() == done.generation)
        {
            self.operations.remove(&done.id);
        }
    }

    async fn shutdown(&mut self) {
        self.state = ConnectionState::Closing;
        for (_, operation) in self.operations.drain() {
            operation.cancel().await;
        }
    }
}

fn normalize_close_code(code: Option<u16>) -> u16 {
    match code {
        None | Some(CLOSE_ABNORMAL) => CLOSE_NORMAL,
        Some(code) => code,
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Runs the `graphql-ws` protocol over an upgraded WebSocket.
///
/// Spawns a writer task that drains the connection's outbound queue onto
/// the socket, then runs the [`Connection`] read loop until the socket
/// ends.
pub async fn run_connection(socket: WebSocket, server: Arc<SubscriptionServer>) {
    let (ws_tx, ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(ws_tx, out_rx));

    let inbound = ws_rx.filter_map(|msg| async move {
        match msg {
            Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
            Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes.to_vec()))),
            Ok(Message::Close(frame)) => Some(Ok(Frame::Close(frame.map(|f| f.code)))),
            Ok(Message::Ping(_) | Message::Pong(_)) => None,
            Err(err) => Some(Err(err.to_string())),
        }
    });

    Connection::new(server, Outbox::new(out_tx))
        .run(Box::pin(inbound))
        .await;

    if let Err(err) = writer.await {
        tracing::warn!(error = %err, "ws writer task failed");
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Message(message) => {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to serialize protocol message");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::text(json)).await {
                    tracing::debug!(error = %err, "ws send failed");
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        }
    }
}
