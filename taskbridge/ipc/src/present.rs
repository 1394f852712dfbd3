//! Present loop - renders one turn's content blocks and dispatches its tool
//!
//! Blocks are handled strictly in order. Text goes to the [`Transcript`]; the
//! first complete tool use goes to the [`ToolExecutor`] and holds the lock
//! until its result is back. Only one tool runs per turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actor::Actor;
use crate::assistant_message::{ContentBlock, ToolUse};

const DETAILS_OPEN: &str = "<environment_details>";
const DETAILS_CLOSE: &str = "</environment_details>";
const THINKING_OPEN: &str = "<thinking>";
const THINKING_CLOSE: &str = "</thinking>";

/// Remove content that must never reach the user-visible transcript.
///
/// Complete `<environment_details>` sections are cut out, an unterminated one
/// is cut to the end, `<thinking>` markers are dropped (their text stays) and
/// a trailing fragment of any of these markers is removed.
pub fn strip_internal_metadata(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find(DETAILS_OPEN) {
        out.push_str(&rest[..open]);
        let after = &rest[open + DETAILS_OPEN.len()..];
        rest = match after.find(DETAILS_CLOSE) {
            Some(close) => &after[close + DETAILS_CLOSE.len()..],
            None => "",
        };
    }
    out.push_str(rest);

    let mut out = remove_thinking_markers(&out);
    truncate_marker_fragment(&mut out);
    out
}

/// Drop `<thinking>` plus one following whitespace character, and
/// `</thinking>` plus one preceding whitespace character.
fn remove_thinking_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        let open = rest.find(THINKING_OPEN);
        let close = rest.find(THINKING_CLOSE);
        let (at, marker) = match (open, close) {
            (Some(o), Some(c)) if c < o => (c, THINKING_CLOSE),
            (Some(o), _) => (o, THINKING_OPEN),
            (None, Some(c)) => (c, THINKING_CLOSE),
            (None, None) => break,
        };

        let mut before = &rest[..at];
        let mut after = &rest[at + marker.len()..];
        if marker == THINKING_OPEN {
            if let Some(c) = after.chars().next().filter(|c| c.is_whitespace()) {
                after = &after[c.len_utf8()..];
            }
        } else if let Some(c) = before.chars().next_back().filter(|c| c.is_whitespace()) {
            before = &before[..before.len() - c.len_utf8()];
        }
        out.push_str(before);
        rest = after;
    }
    out.push_str(rest);
    out
}

fn truncate_marker_fragment(text: &mut String) {
    let Some(lt) = text.rfind('<') else {
        return;
    };
    let fragment = &text[lt..];
    let is_fragment = [DETAILS_OPEN, DETAILS_CLOSE, THINKING_OPEN, THINKING_CLOSE]
        .iter()
        .any(|marker| marker.len() > fragment.len() && marker.starts_with(fragment));
    if is_fragment {
        text.truncate(lt);
    }
}

/// Where rendered output goes.
pub trait Transcript: Send + 'static {
    /// Render block `index` as text. Called again with the same index while the
    /// block is still streaming.
    fn say_text(&mut self, index: usize, text: &str, partial: bool);

    /// A tool use still streaming in, shown before it can run.
    fn tool_partial(&mut self, _tool: &ToolUse) {}

    fn tool_started(&mut self, tool: &ToolUse);

    fn tool_result(&mut self, outcome: &ToolOutcome);

    fn reasoning(&mut self, _text: &str) {}

    fn error(&mut self, message: &str);
}

/// Runs tools. The returned future must not borrow the executor.
pub trait ToolExecutor: Send + Sync + 'static {
    fn execute(&self, tool: ToolUse) -> BoxFuture<'static, Result<String, String>>;
}

/// Shared cancel switch for a turn, checked between block dispatches.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutcome {
    pub tool: ToolUse,
    pub result: Result<String, String>,
}

/// How a turn ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// The tool this turn executed (or tried to).
    pub tool: Option<ToolOutcome>,
    /// Tool uses that came after the executed one and were not run.
    pub rejected_tools: Vec<String>,
    pub aborted: bool,
}

enum PresentMessage {
    Update(Vec<ContentBlock>),
    Complete(Vec<ContentBlock>),
    Reasoning(String),
    Error(String),
}

struct PresentActor<T, X> {
    receiver: mpsc::UnboundedReceiver<PresentMessage>,
    transcript: T,
    executor: Arc<X>,
    abort: AbortFlag,
    blocks: Vec<ContentBlock>,
    /// Next block to present.
    index: usize,
    /// Held from the start of a presentation pass until it ends, including
    /// while a tool runs.
    locked: bool,
    /// Blocks changed while locked; reconcile once the lock is released.
    pending_updates: bool,
    stream_complete: bool,
    /// The handle is gone; no further messages will arrive.
    receiver_closed: bool,
    tool_used: bool,
    running: Option<(ToolUse, BoxFuture<'static, Result<String, String>>)>,
    outcome: TurnOutcome,
    outcome_tx: Option<oneshot::Sender<TurnOutcome>>,
}

impl<T: Transcript, X: ToolExecutor> PresentActor<T, X> {
    fn accept(&mut self, blocks: Vec<ContentBlock>, complete: bool) {
        self.blocks = blocks;
        self.stream_complete |= complete;
        if self.locked {
            debug!("Presentation locked; queueing update");
            self.pending_updates = true;
            return;
        }
        self.present();
    }

    fn present(&mut self) {
        if self.locked {
            self.pending_updates = true;
            return;
        }
        self.locked = true;
        self.pending_updates = false;

        while self.index < self.blocks.len() {
            if self.abort.is_aborted() {
                info!("Turn aborted; {} blocks left unpresented", self.blocks.len() - self.index);
                self.outcome.aborted = true;
                break;
            }

            match self.blocks[self.index].clone() {
                ContentBlock::Text(text) => {
                    let partial = text.partial && !self.stream_complete;
                    if !self.tool_used {
                        let visible = strip_internal_metadata(&text.content);
                        if !visible.trim().is_empty() {
                            self.transcript.say_text(self.index, &visible, partial);
                        }
                    }
                    if partial {
                        break;
                    }
                    self.index += 1;
                }
                ContentBlock::ToolUse(tool) => {
                    if tool.partial && !self.stream_complete {
                        if !self.tool_used {
                            self.transcript.tool_partial(&tool);
                        }
                        break;
                    }
                    self.index += 1;

                    if self.tool_used {
                        warn!("Tool {} not executed: one tool per turn", tool.name);
                        self.outcome.rejected_tools.push(tool.name);
                        continue;
                    }
                    self.tool_used = true;

                    if tool.partial {
                        let message = format!("Tool {} was cut off before it was complete", tool.name);
                        self.transcript.error(&message);
                        self.outcome.tool = Some(ToolOutcome {
                            tool,
                            result: Err(message),
                        });
                        continue;
                    }

                    self.transcript.tool_started(&tool);
                    let future = self.executor.execute(tool.clone());
                    self.running = Some((tool, future));
                    // Lock stays held until the result arrives
                    return;
                }
            }
        }

        self.locked = false;
    }

    fn tool_finished(&mut self, result: Result<String, String>) {
        let Some((tool, _)) = self.running.take() else {
            return;
        };
        let outcome = ToolOutcome { tool, result };
        if let Err(e) = &outcome.result {
            self.transcript
                .error(&format!("Error executing {}: {}", outcome.tool.name, e));
        }
        self.transcript.tool_result(&outcome);
        self.outcome.tool = Some(outcome);

        self.locked = false;
        if self.pending_updates {
            debug!("Reconciling updates queued during tool execution");
        }
        self.present();
    }

    fn is_finished(&self) -> bool {
        self.stream_complete
            && !self.locked
            && self.running.is_none()
            && (self.outcome.aborted || self.index >= self.blocks.len())
    }
}

impl<T: Transcript, X: ToolExecutor> Actor for PresentActor<T, X> {
    async fn run(mut self) {
        while !self.is_finished() {
            tokio::select! {
                message = self.receiver.recv(), if !self.receiver_closed => match message {
                    Some(PresentMessage::Update(blocks)) => self.accept(blocks, false),
                    Some(PresentMessage::Complete(blocks)) => self.accept(blocks, true),
                    Some(PresentMessage::Reasoning(text)) => self.transcript.reasoning(&text),
                    Some(PresentMessage::Error(message)) => self.transcript.error(&message),
                    None => {
                        // Whatever arrived last is all there is
                        self.receiver_closed = true;
                        self.stream_complete = true;
                        self.present();
                    }
                },

                result = tool_result(&mut self.running) => self.tool_finished(result),
            }
        }

        if let Some(outcome_tx) = self.outcome_tx.take() {
            let _ = outcome_tx.send(std::mem::take(&mut self.outcome));
        }
    }
}

async fn tool_result(
    running: &mut Option<(ToolUse, BoxFuture<'static, Result<String, String>>)>,
) -> Result<String, String> {
    match running {
        Some((_, future)) => future.await,
        None => std::future::pending().await,
    }
}

/// Feeds one turn's blocks to a present actor.
pub struct PresentHandle {
    sender: mpsc::UnboundedSender<PresentMessage>,
    outcome_rx: oneshot::Receiver<TurnOutcome>,
}

impl PresentHandle {
    pub fn spawn<T: Transcript, X: ToolExecutor>(
        transcript: T,
        executor: Arc<X>,
        abort: AbortFlag,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        PresentActor {
            receiver,
            transcript,
            executor,
            abort,
            blocks: Vec::new(),
            index: 0,
            locked: false,
            pending_updates: false,
            stream_complete: false,
            receiver_closed: false,
            tool_used: false,
            running: None,
            outcome: TurnOutcome::default(),
            outcome_tx: Some(outcome_tx),
        }
        .spawn();
        Self { sender, outcome_rx }
    }

    fn send(&self, message: PresentMessage) {
        if self.sender.send(message).is_err() {
            debug!("Present actor already finished");
        }
    }

    /// Latest snapshot of the streaming message.
    pub fn update(&self, blocks: Vec<ContentBlock>) {
        self.send(PresentMessage::Update(blocks));
    }

    /// Final blocks; the stream is over.
    pub fn complete(&self, blocks: Vec<ContentBlock>) {
        self.send(PresentMessage::Complete(blocks));
    }

    pub fn reasoning(&self, text: String) {
        self.send(PresentMessage::Reasoning(text));
    }

    pub fn error(&self, message: String) {
        self.send(PresentMessage::Error(message));
    }

    /// Wait for the turn to be fully presented.
    pub async fn wait(self) -> TurnOutcome {
        let Self { sender, outcome_rx } = self;
        drop(sender);
        outcome_rx.await.unwrap_or_else(|_| TurnOutcome {
            aborted: true,
            ..TurnOutcome::default()
        })
    }
}
