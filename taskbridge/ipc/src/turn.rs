//! One assistant turn: model stream in, presented blocks and at most one tool
//! execution out.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::assistant_message::{
    AssistantMessageParser, ReasoningSplitter, StreamChunk, ToolVocabulary,
};
use crate::present::{AbortFlag, PresentHandle, ToolExecutor, Transcript, TurnOutcome};

/// Drive `stream` through reasoning split, parsing and presentation.
///
/// A stream error ends the turn: it is shown in the transcript and the text
/// received so far is finalized as usual.
pub async fn run_turn<S, T, X>(
    stream: S,
    vocabulary: ToolVocabulary,
    transcript: T,
    executor: Arc<X>,
    abort: AbortFlag,
) -> TurnOutcome
where
    S: Stream<Item = anyhow::Result<String>>,
    T: Transcript,
    X: ToolExecutor,
{
    let presenter = PresentHandle::spawn(transcript, executor, abort.clone());
    let mut splitter = ReasoningSplitter::default();
    let mut parser = AssistantMessageParser::new(vocabulary);
    let mut stream = std::pin::pin!(stream);

    while let Some(chunk) = stream.next().await {
        if abort.is_aborted() {
            info!("Turn aborted while streaming");
            break;
        }
        match chunk {
            Ok(chunk) => {
                for piece in splitter.update(&chunk) {
                    forward(&presenter, &mut parser, piece);
                }
            }
            Err(e) => {
                warn!("Model stream failed: {:#}", e);
                presenter.error(format!("Model stream failed: {e:#}"));
                break;
            }
        }
    }

    for piece in splitter.finish() {
        forward(&presenter, &mut parser, piece);
    }
    presenter.complete(parser.finish());

    let outcome = presenter.wait().await;
    debug!(
        "Turn finished: tool={:?} rejected={:?} aborted={}",
        outcome.tool.as_ref().map(|t| &t.tool.name),
        outcome.rejected_tools,
        outcome.aborted
    );
    outcome
}

fn forward(presenter: &PresentHandle, parser: &mut AssistantMessageParser, piece: StreamChunk) {
    match piece {
        StreamChunk::Reasoning(text) => presenter.reasoning(text),
        StreamChunk::Text(text) => presenter.update(parser.update(&text)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant_message::ToolUse;
    use crate::present::ToolOutcome;
    use futures::future::BoxFuture;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Transcript for Log {
        fn say_text(&mut self, index: usize, text: &str, partial: bool) {
            if !partial {
                self.0.lock().unwrap().push(format!("say[{index}] {text}"));
            }
        }

        fn tool_started(&mut self, tool: &ToolUse) {
            let path = tool.param("path").unwrap_or_default();
            self.0.lock().unwrap().push(format!("start {} {}", tool.name, path));
        }

        fn tool_result(&mut self, outcome: &ToolOutcome) {
            self.0
                .lock()
                .unwrap()
                .push(format!("result {:?}", outcome.result));
        }

        fn reasoning(&mut self, text: &str) {
            self.0.lock().unwrap().push(format!("reasoning {text}"));
        }

        fn error(&mut self, message: &str) {
            self.0.lock().unwrap().push(format!("error {message}"));
        }
    }

    struct Echo;

    impl ToolExecutor for Echo {
        fn execute(&self, tool: ToolUse) -> BoxFuture<'static, Result<String, String>> {
            Box::pin(async move { Ok(format!("ran {}", tool.name)) })
        }
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = anyhow::Result<String>> + use<> {
        let parts: Vec<anyhow::Result<String>> = parts.iter().map(|p| Ok(p.to_string())).collect();
        futures::stream::iter(parts)
    }

    #[tokio::test]
    async fn test_streamed_turn_runs_one_tool() {
        let log = Log::default();
        let outcome = run_turn(
            chunks(&[
                "<think>need the file</think>Let me <re",
                "ad_file><path>src/",
                "lib.rs</path></read_file> and then <list_files><path>.</path></list_files>",
            ]),
            ToolVocabulary::default(),
            log.clone(),
            Arc::new(Echo),
            AbortFlag::new(),
        )
        .await;

        assert_eq!(
            *log.0.lock().unwrap(),
            vec![
                "reasoning need the file",
                "say[0] Let me",
                "start read_file src/lib.rs",
                "result Ok(\"ran read_file\")",
            ]
        );
        assert_eq!(outcome.rejected_tools, vec!["list_files"]);
    }

    #[tokio::test]
    async fn test_stream_error_finalizes_partial_output() {
        let log = Log::default();
        let parts: Vec<anyhow::Result<String>> = vec![
            Ok("Working on it".to_string()),
            Err(anyhow::anyhow!("connection reset")),
            Ok("never seen".to_string()),
        ];
        let outcome = run_turn(
            futures::stream::iter(parts),
            ToolVocabulary::default(),
            log.clone(),
            Arc::new(Echo),
            AbortFlag::new(),
        )
        .await;

        assert_eq!(
            *log.0.lock().unwrap(),
            vec![
                "error Model stream failed: connection reset",
                "say[0] Working on it",
            ]
        );
        assert!(outcome.tool.is_none());
    }
}
