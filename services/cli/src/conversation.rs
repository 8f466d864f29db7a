//! The interactive text conversation driven from the terminal.
//!
//! Session events are forwarded into a channel so that a single task can wait on
//! user input, agent output and shutdown at the same time.

use anyhow::Context;
use async_trait::async_trait;
use std::{future::Future, io::Write};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc,
};
use tracing::{debug, error};
use ultravox_realtime::{CallState, EventKind, Listener, Session, SessionEvent, Subscription};

pub const WELCOME: &str =
    "Welcome to UltraVox CLI! Type 'exit', 'quit', or 'bye' to end the conversation.";

const EXIT_COMMANDS: [&str; 3] = ["exit", "quit", "bye"];

/// How a conversation came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The user typed an exit command.
    UserExit,
    /// The call ended normally.
    Ended,
    /// The session reported an error, or a message could not be sent.
    Failed,
    /// Standard input reached end of file.
    InputClosed,
    /// The shutdown signal fired.
    Interrupted,
}

pub fn is_exit_command(input: &str) -> bool {
    let input = input.trim();
    EXIT_COMMANDS
        .iter()
        .any(|command| command.eq_ignore_ascii_case(input))
}

/// The line printed for `event`, if any.
///
/// Only final output is shown; the `final` flag is the sole completion signal.
pub fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::State(CallState::Thinking) => Some("Agent thinking...".to_string()),
        SessionEvent::Output {
            text,
            is_final: true,
        } if !text.trim().is_empty() => Some(format!("Agent: {}", text.trim())),
        SessionEvent::Ended => Some("Session ended.".to_string()),
        SessionEvent::Error(e) => Some(format!("Error: {}", e)),
        _ => None,
    }
}

struct ForwardEvents(mpsc::UnboundedSender<SessionEvent>);

#[async_trait]
impl Listener for ForwardEvents {
    async fn handle(&self, event: &SessionEvent) -> anyhow::Result<()> {
        self.0
            .send(event.clone())
            .context("conversation is no longer listening")?;
        Ok(())
    }
}

pub struct Conversation {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    subscriptions: Vec<Subscription>,
}

impl Conversation {
    /// Reads events from `events` instead of a session's listeners.
    pub fn new(events: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self {
            events,
            subscriptions: Vec::new(),
        }
    }

    /// Subscribes to every event kind of `session`. Attach before starting the
    /// session so that no event is missed.
    pub fn attach(session: &Session) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = [
            EventKind::State,
            EventKind::Output,
            EventKind::Error,
            EventKind::Ended,
        ]
        .into_iter()
        .map(|kind| session.on(kind, ForwardEvents(tx.clone())))
        .collect();
        Self {
            events: rx,
            subscriptions,
        }
    }

    /// Runs until the user leaves, the call ends or `shutdown` completes.
    ///
    /// Stopping the session is left to the caller.
    pub async fn run<R, W, S>(
        mut self,
        session: &Session,
        input: R,
        output: &mut W,
        shutdown: S,
    ) -> anyhow::Result<Outcome>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
        S: Future<Output = ()>,
    {
        writeln!(output, "{}", WELCOME)?;
        let mut lines = input.lines();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    writeln!(output, "\nGoodbye!")?;
                    return Ok(Outcome::Interrupted);
                }

                event = self.events.recv() => {
                    let Some(event) = event else {
                        return Ok(Outcome::Ended);
                    };
                    if let Some(line) = render(&event) {
                        writeln!(output, "{}", line)?;
                        output.flush()?;
                    }
                    match event {
                        SessionEvent::Ended => return Ok(Outcome::Ended),
                        SessionEvent::Error(_) => return Ok(Outcome::Failed),
                        _ => {}
                    }
                }

                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        debug!("Input closed");
                        return Ok(Outcome::InputClosed);
                    };
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if is_exit_command(text) {
                        writeln!(output, "Goodbye!")?;
                        return Ok(Outcome::UserExit);
                    }
                    if let Err(e) = session.send_text_message(text).await {
                        error!(error = %e, "Failed to send message");
                        writeln!(output, "Error: {}", e)?;
                        return Ok(Outcome::Failed);
                    }
                }
            }
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
    }
}
