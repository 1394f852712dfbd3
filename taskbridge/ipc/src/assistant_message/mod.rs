//! Parsing of streamed assistant output into text and tool-use blocks.

mod content;
mod parser;
mod reasoning;

pub use content::{ContentBlock, TextBlock, ToolUse, ToolVocabulary};
pub use parser::{AssistantMessageParser, parse_assistant_message};
pub use reasoning::{ReasoningSplitter, StreamChunk};
