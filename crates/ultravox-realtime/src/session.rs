//! Manages the realtime connection lifecycle for a single call.
//!
//! A [`Session`] owns one duplex connection to a call's join URL. Once started, a
//! background receive loop decodes inbound frames, tracks the agent's
//! conversation state, accumulates streamed agent output, answers client tool
//! invocations and publishes [`SessionEvent`]s. [`Session::stop`] tears all of it
//! down again and never fails.

use crate::{
    events::{EventDispatcher, EventKind, Listener, SessionEvent, Subscription},
    protocol::{self, CallState, ClientMessage, ProtocolError, ServerMessage, ToolResult},
    tools::{Parameters, ToolHandler, ToolRegistry},
    transport::{
        Connection, Connector, Frame, FrameSink, FrameStream, TransportError, WebSocketConnector,
    },
};
use futures_util::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{Instrument, debug, info, info_span, instrument, trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("Socket not connected. Call start() first.")]
    NotConnected,
    #[error("session is already connected")]
    AlreadyConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection closed abnormally (code {code}): {reason}")]
    RemoteClosed { code: u16, reason: String },
}

type SharedSink = Arc<Mutex<FrameSink>>;

/// State shared between the session handle and its receive loop.
#[derive(Debug, Default)]
struct Conversation {
    state: CallState,
    pending_output: String,
}

#[derive(Clone, Default)]
struct SharedConversation(Arc<StdMutex<Conversation>>);

impl SharedConversation {
    fn lock(&self) -> MutexGuard<'_, Conversation> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `state`, returning whether it differed from the current one.
    fn transition(&self, state: CallState) -> bool {
        let mut conversation = self.lock();
        if conversation.state == state {
            return false;
        }
        conversation.state = state;
        true
    }
}

/// The connection and the task reading from it. They exist together or not at all.
struct ActiveConnection {
    sink: SharedSink,
    receive_task: JoinHandle<()>,
}

/// Configures a [`Session`] before it is created.
pub struct SessionBuilder {
    url: String,
    connector: Arc<dyn Connector>,
    tools: ToolRegistry,
}

impl SessionBuilder {
    /// Uses `connector` instead of the WebSocket connector.
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Dispatches tool invocations to `tools`.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn build(self) -> Session {
        Session {
            url: self.url,
            connector: self.connector,
            conversation: SharedConversation::default(),
            tools: self.tools,
            events: EventDispatcher::new(),
            active: None,
        }
    }
}

/// A live connection to one call.
///
/// A session serves a single call: construct a new one for every join URL rather
/// than restarting a stopped one.
pub struct Session {
    url: String,
    connector: Arc<dyn Connector>,
    conversation: SharedConversation,
    tools: ToolRegistry,
    events: EventDispatcher,
    active: Option<ActiveConnection>,
}

impl Session {
    /// Creates an idle, disconnected session for `join_url`.
    pub fn new(join_url: impl Into<String>) -> Self {
        Self::builder(join_url).build()
    }

    pub fn builder(join_url: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            url: join_url.into(),
            connector: Arc::new(WebSocketConnector),
            tools: ToolRegistry::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> CallState {
        self.conversation.lock().state
    }

    /// Agent output received so far in the current, unfinished turn.
    pub fn pending_output(&self) -> String {
        self.conversation.lock().pending_output.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.active.is_some()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Subscribes `listener` to one kind of session event.
    pub fn on<L>(&self, kind: EventKind, listener: L) -> Subscription
    where
        L: Listener + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    /// Registers `handler` for invocations of `tool_name`, replacing any handler
    /// already registered under that name.
    pub fn register_tool(&self, tool_name: impl Into<String>, handler: Arc<dyn ToolHandler>) {
        self.tools.insert(tool_name, handler);
    }

    /// Opens the connection and starts the receive loop.
    ///
    /// Connection failures are returned as-is; retrying is up to the caller.
    #[instrument(skip_all, fields(url = %self.url))]
    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Err(SessionError::AlreadyConnected);
        }

        debug!("Connecting to call");
        let Connection { sink, stream } =
            self.connector
                .connect(&self.url)
                .await
                .map_err(|source| SessionError::Connect {
                    url: self.url.clone(),
                    source,
                })?;

        let sink = Arc::new(Mutex::new(sink));
        let receiver = Receiver {
            conversation: self.conversation.clone(),
            tools: self.tools.clone(),
            events: self.events.clone(),
            sink: sink.clone(),
        };
        let span = info_span!("session_receive", url = %self.url);
        let receive_task = tokio::spawn(receiver.run(stream).instrument(span));

        self.active = Some(ActiveConnection { sink, receive_task });
        info!("Session connected");
        Ok(())
    }

    /// Closes the connection, cancels the receive loop and returns to `Idle`.
    ///
    /// Safe to call repeatedly and on a session that never started. Teardown
    /// failures are logged, never returned.
    pub async fn stop(&mut self) {
        debug!("Stopping session...");
        if let Some(ActiveConnection { sink, receive_task }) = self.active.take() {
            receive_task.abort();
            let (closed, joined) = tokio::join!(close_sink(&sink), receive_task);

            let mut failures = Vec::new();
            if let Err(e) = closed {
                failures.push(e.to_string());
            }
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    failures.push(e.to_string());
                }
            }
            report_teardown_failures(&failures);
        }

        if self.conversation.transition(CallState::Idle) {
            self.events.emit(SessionEvent::State(CallState::Idle)).await;
        }
    }

    /// Sends a user text turn to the agent.
    pub async fn send_text_message(&self, text: &str) -> Result<(), SessionError> {
        let active = self.active.as_ref().ok_or(SessionError::NotConnected)?;
        debug!(text, "Sending user message");
        send(
            &active.sink,
            &ClientMessage::InputTextMessage {
                text: text.to_string(),
            },
        )
        .await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.receive_task.abort();
        }
    }
}

async fn send(sink: &SharedSink, message: &ClientMessage) -> Result<(), SessionError> {
    let frame = Frame::Text(protocol::encode(message)?);
    sink.lock().await.send(frame).await?;
    Ok(())
}

async fn close_sink(sink: &SharedSink) -> Result<(), TransportError> {
    match sink.lock().await.close().await {
        Err(TransportError::Closed) => Ok(()),
        other => other,
    }
}

fn teardown_summary(failures: &[String]) -> Option<String> {
    match failures {
        [] => None,
        [failure] => Some(failure.clone()),
        _ => Some(format!("Multiple failures: {}", failures.join(", "))),
    }
}

fn report_teardown_failures(failures: &[String]) {
    if let Some(summary) = teardown_summary(failures) {
        warn!(error = %summary, "Error during session teardown");
    }
}

/// The receive loop's view of the session.
struct Receiver {
    conversation: SharedConversation,
    tools: ToolRegistry,
    events: EventDispatcher,
    sink: SharedSink,
}

impl Receiver {
    /// Processes frames until the connection ends.
    ///
    /// A normal close publishes `Ended`. Any failure publishes `Error` instead and
    /// ends the loop.
    async fn run(self, mut stream: FrameStream) {
        while let Some(frame) = stream.next().await {
            let outcome = match frame {
                Ok(Frame::Text(text)) => self.on_text(&text).await,
                Ok(Frame::Binary(data)) => {
                    trace!(bytes = data.len(), "Ignoring binary frame");
                    Ok(())
                }
                Ok(Frame::Close(Some(close))) if !close.is_normal() => {
                    Err(SessionError::RemoteClosed {
                        code: close.code,
                        reason: close.reason,
                    })
                }
                Ok(Frame::Close(close)) => {
                    debug!(code = close.as_ref().map(|c| c.code), "Socket closed normally");
                    break;
                }
                Err(TransportError::Closed) => break,
                Err(e) => Err(e.into()),
            };

            if let Err(e) = outcome {
                warn!(error = %e, "Session receive loop failed");
                self.events.emit(SessionEvent::Error(Arc::new(e))).await;
                return;
            }
        }

        debug!("Socket receive task completed");
        self.events.emit(SessionEvent::Ended).await;
    }

    async fn on_text(&self, text: &str) -> Result<(), SessionError> {
        match protocol::decode(text)? {
            // Audio playback is not handled by this client.
            ServerMessage::PlaybackClearBuffer => {}
            ServerMessage::State { state } => self.on_state(&state).await,
            ServerMessage::Transcript {
                role,
                text,
                delta,
                is_final,
            } => {
                if role.as_deref() == Some("agent") {
                    self.on_agent_transcript(text, delta, is_final).await;
                }
            }
            ServerMessage::ClientToolInvocation {
                tool_name,
                invocation_id,
                parameters,
            } => {
                self.on_tool_invocation(&tool_name, invocation_id, parameters.unwrap_or_default())
                    .await?
            }
            ServerMessage::Debug { message } => debug!(?message, "Debug message"),
            ServerMessage::Unhandled(kind) => warn!(?kind, "Unhandled message type"),
        }
        Ok(())
    }

    async fn on_state(&self, state: &str) {
        let state = match state.parse::<CallState>() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Ignoring state message");
                return;
            }
        };
        if self.conversation.transition(state) {
            self.events.emit(SessionEvent::State(state)).await;
        }
    }

    async fn on_agent_transcript(&self, text: Option<String>, delta: Option<String>, is_final: bool) {
        let output = {
            let mut conversation = self.conversation.lock();
            match text {
                Some(text) => conversation.pending_output = text,
                None => conversation
                    .pending_output
                    .push_str(delta.as_deref().unwrap_or_default()),
            }
            conversation.pending_output.clone()
        };

        self.events
            .emit(SessionEvent::Output {
                text: output,
                is_final,
            })
            .await;

        if is_final {
            self.conversation.lock().pending_output.clear();
        }
    }

    /// Runs the invoked tool and answers with exactly one `client_tool_result`.
    async fn on_tool_invocation(
        &self,
        tool_name: &str,
        invocation_id: String,
        parameters: Parameters,
    ) -> Result<(), SessionError> {
        debug!(tool = %tool_name, invocation_id = %invocation_id, "Client tool call");
        let result = match self.tools.dispatch(tool_name, parameters).await {
            Some(Ok(value)) => ToolResult::success(invocation_id, &value),
            Some(Err(e)) => ToolResult::failure(invocation_id, e.wire_type(), e.to_string()),
            None => ToolResult::unknown_tool(invocation_id, tool_name),
        };
        send(&self.sink, &ClientMessage::ClientToolResult(result)).await
    }
}
