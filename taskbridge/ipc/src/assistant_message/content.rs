use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// One piece of a parsed assistant message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUse),
}

impl ContentBlock {
    /// True while the block may still change as more text streams in.
    pub fn is_partial(&self) -> bool {
        match self {
            ContentBlock::Text(text) => text.partial,
            ContentBlock::ToolUse(tool) => tool.partial,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUse> {
        match self {
            ContentBlock::ToolUse(tool) => Some(tool),
            ContentBlock::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextBlock {
    pub content: String,
    pub partial: bool,
}

/// A tool invocation: `<name><param>value</param>...</name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolUse {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub partial: bool,
}

impl ToolUse {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

const TOOL_NAMES: &[&str] = &[
    "execute_command",
    "read_file",
    "fetch_instructions",
    "write_to_file",
    "apply_diff",
    "insert_content",
    "search_and_replace",
    "search_files",
    "list_files",
    "list_code_definition_names",
    "browser_action",
    "use_mcp_tool",
    "access_mcp_resource",
    "ask_followup_question",
    "attempt_completion",
    "switch_mode",
    "new_task",
    "codebase_search",
    "update_todo_list",
];

const PARAM_NAMES: &[&str] = &[
    "command",
    "path",
    "content",
    "line_count",
    "regex",
    "file_pattern",
    "recursive",
    "action",
    "url",
    "coordinate",
    "text",
    "server_name",
    "tool_name",
    "arguments",
    "uri",
    "question",
    "result",
    "diff",
    "mode_slug",
    "reason",
    "line",
    "mode",
    "message",
    "cwd",
    "follow_up",
    "task",
    "size",
    "search",
    "replace",
    "use_regex",
    "ignore_case",
    "args",
    "start_line",
    "end_line",
    "query",
    "todos",
];

/// The tag names the parser recognizes. Anything else is plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVocabulary {
    tools: BTreeSet<String>,
    params: BTreeSet<String>,
}

impl ToolVocabulary {
    pub fn new<T, P>(tools: T, params: P) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            tools: tools.into_iter().map(Into::into).collect(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_tool(&self, name: &str) -> bool {
        self.tools.contains(name)
    }

    pub fn is_param(&self, name: &str) -> bool {
        self.params.contains(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(String::as_str)
    }

    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(String::as_str)
    }
}

impl Default for ToolVocabulary {
    fn default() -> Self {
        Self::new(TOOL_NAMES.iter().copied(), PARAM_NAMES.iter().copied())
    }
}
