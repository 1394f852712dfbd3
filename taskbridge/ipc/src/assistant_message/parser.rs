//! Streaming parser for assistant messages.
//!
//! Markup is `<tool><param>value</param></tool>` using only names from a
//! [`ToolVocabulary`]; everything else is text. The parser keeps the whole
//! message in a buffer and a scan cursor that never moves backwards, so each
//! delimiter is classified exactly once no matter how the text was chunked.
//! A `<` whose tag is still incomplete is held back until enough text arrives
//! to tell whether it can become a recognized tag.

use std::collections::BTreeMap;

use super::content::{ContentBlock, TextBlock, ToolUse, ToolVocabulary};

enum State {
    /// Scanning free text that began at `start`.
    Text { start: usize },
    /// Inside a tool element, between parameters.
    InTag(OpenTool),
    /// Inside a parameter value that began at `value_start`.
    InParam {
        tool: OpenTool,
        param: String,
        value_start: usize,
    },
}

struct OpenTool {
    name: String,
    params: BTreeMap<String, String>,
}

impl OpenTool {
    fn new(name: String) -> Self {
        Self {
            name,
            params: BTreeMap::new(),
        }
    }

    fn into_block(self, partial: bool) -> ContentBlock {
        ContentBlock::ToolUse(ToolUse {
            name: self.name,
            params: self.params,
            partial,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
}

struct Tag {
    kind: TagKind,
    name: String,
}

impl Tag {
    /// Classify the text between `<` and `>`, tolerating whitespace.
    fn classify(inner: &str) -> Self {
        let inner = inner.trim();
        let (kind, name) = if let Some(rest) = inner.strip_prefix('/') {
            (TagKind::Close, rest.trim_start())
        } else if let Some(rest) = inner.strip_suffix('/') {
            (TagKind::SelfClosing, rest.trim_end())
        } else {
            (TagKind::Open, inner)
        };
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

enum Scan<'a> {
    /// Another `<` comes before any `>`: this one starts no tag.
    NotATag,
    /// No `>` yet; the text after `<` so far.
    Incomplete(&'a str),
    /// `inner` is the text between the brackets; `end` is just past `>`.
    Complete { inner: &'a str, end: usize },
}

fn scan_tag(buffer: &str, lt: usize) -> Scan<'_> {
    let after = &buffer[lt + 1..];
    match after.find(['<', '>']) {
        None => Scan::Incomplete(after),
        Some(i) if after.as_bytes()[i] == b'<' => Scan::NotATag,
        Some(i) => Scan::Complete {
            inner: &after[..i],
            end: lt + 1 + i + 1,
        },
    }
}

/// Could `partial` still grow into an opening tag for one of `names`?
fn could_open<'a>(
    partial: &str,
    mut names: impl Iterator<Item = &'a str>,
    allow_self_closing: bool,
) -> bool {
    let partial = partial.trim_start();
    if partial.is_empty() {
        return true;
    }
    if partial.starts_with('/') {
        return false;
    }
    names.any(|name| {
        if name.starts_with(partial) {
            return true;
        }
        let Some(rest) = partial.strip_prefix(name) else {
            return false;
        };
        let rest = rest.trim_start();
        rest.is_empty()
            || (allow_self_closing && rest.strip_prefix('/').is_some_and(|r| r.trim().is_empty()))
    })
}

/// Could `partial` still grow into a closing tag for one of `names`?
fn could_close<'a>(partial: &str, mut names: impl Iterator<Item = &'a str>) -> bool {
    let partial = partial.trim_start();
    if partial.is_empty() {
        return true;
    }
    let Some(rest) = partial.strip_prefix('/') else {
        return false;
    };
    let rest = rest.trim_start();
    names.any(|name| {
        name.starts_with(rest)
            || rest
                .strip_prefix(name)
                .is_some_and(|tail| tail.trim().is_empty())
    })
}

/// Incremental parser; feed it chunks with [`update`](Self::update) and end
/// the stream with [`finish`](Self::finish).
pub struct AssistantMessageParser {
    vocabulary: ToolVocabulary,
    buffer: String,
    cursor: usize,
    blocks: Vec<ContentBlock>,
    state: State,
}

impl AssistantMessageParser {
    pub fn new(vocabulary: ToolVocabulary) -> Self {
        Self {
            vocabulary,
            buffer: String::new(),
            cursor: 0,
            blocks: Vec::new(),
            state: State::Text { start: 0 },
        }
    }

    /// Append `chunk` and return every block seen so far. The last block may
    /// be partial; earlier ones never change again.
    pub fn update(&mut self, chunk: &str) -> Vec<ContentBlock> {
        self.buffer.push_str(chunk);
        self.advance();
        self.snapshot()
    }

    /// End of stream. Held-back text becomes literal, an open text block is
    /// completed and an unterminated tool is returned with `partial: true`.
    pub fn finish(mut self) -> Vec<ContentBlock> {
        let end = self.buffer.len();
        match std::mem::replace(&mut self.state, State::Text { start: end }) {
            State::Text { start } => self.push_text(start, end),
            State::InTag(tool) => self.blocks.push(tool.into_block(true)),
            State::InParam {
                mut tool,
                param,
                value_start,
            } => {
                let value = self.buffer[value_start..].trim().to_string();
                tool.params.insert(param, value);
                self.blocks.push(tool.into_block(true));
            }
        }
        self.blocks
    }

    fn advance(&mut self) {
        loop {
            let Some(lt) = self.buffer[self.cursor..].find('<').map(|i| self.cursor + i) else {
                self.cursor = self.buffer.len();
                return;
            };

            match scan_tag(&self.buffer, lt) {
                Scan::NotATag => self.cursor = lt + 1,
                Scan::Incomplete(partial) => {
                    if self.could_complete(partial) {
                        // Hold the `<` back until the tag resolves
                        self.cursor = lt;
                        return;
                    }
                    self.cursor = lt + 1;
                }
                Scan::Complete { inner, end } => {
                    let tag = Tag::classify(inner);
                    self.cursor = if self.accept(tag, lt, end) { end } else { lt + 1 };
                }
            }
        }
    }

    fn could_complete(&self, partial: &str) -> bool {
        let vocabulary = &self.vocabulary;
        match &self.state {
            State::Text { .. } => could_open(partial, vocabulary.tools(), false),
            State::InTag(tool) => {
                could_open(partial, vocabulary.params(), true)
                    || could_close(partial, std::iter::once(tool.name.as_str()))
            }
            State::InParam { tool, param, .. } => could_close(
                partial,
                [param.as_str(), tool.name.as_str()].into_iter(),
            ),
        }
    }

    /// Apply a complete tag found at `lt..end`. Returns false when the tag
    /// means nothing in the current state and should be read as text.
    fn accept(&mut self, tag: Tag, lt: usize, end: usize) -> bool {
        let state = std::mem::replace(&mut self.state, State::Text { start: end });
        let (next, accepted) = match state {
            State::Text { start } => {
                if tag.kind == TagKind::Open && self.vocabulary.is_tool(&tag.name) {
                    self.push_text(start, lt);
                    (State::InTag(OpenTool::new(tag.name)), true)
                } else {
                    (State::Text { start }, false)
                }
            }
            State::InTag(mut tool) => match tag.kind {
                TagKind::Close if tag.name == tool.name => {
                    self.blocks.push(tool.into_block(false));
                    (State::Text { start: end }, true)
                }
                TagKind::Open if self.vocabulary.is_param(&tag.name) => (
                    State::InParam {
                        tool,
                        param: tag.name,
                        value_start: end,
                    },
                    true,
                ),
                TagKind::SelfClosing if self.vocabulary.is_param(&tag.name) => {
                    tool.params.insert(tag.name, String::new());
                    (State::InTag(tool), true)
                }
                _ => (State::InTag(tool), false),
            },
            State::InParam {
                mut tool,
                param,
                value_start,
            } => {
                if tag.kind == TagKind::Close && (tag.name == param || tag.name == tool.name) {
                    let value = self.buffer[value_start..lt].trim().to_string();
                    tool.params.insert(param, value);
                    if tag.name == tool.name {
                        self.blocks.push(tool.into_block(false));
                        (State::Text { start: end }, true)
                    } else {
                        (State::InTag(tool), true)
                    }
                } else {
                    (
                        State::InParam {
                            tool,
                            param,
                            value_start,
                        },
                        false,
                    )
                }
            }
        };
        self.state = next;
        accepted
    }

    fn push_text(&mut self, start: usize, end: usize) {
        let content = self.buffer[start..end].trim();
        if !content.is_empty() {
            self.blocks.push(ContentBlock::Text(TextBlock {
                content: content.to_string(),
                partial: false,
            }));
        }
    }

    fn snapshot(&self) -> Vec<ContentBlock> {
        let mut blocks = self.blocks.clone();
        match &self.state {
            State::Text { start } => {
                let content = self.buffer[*start..self.cursor].trim();
                if !content.is_empty() {
                    blocks.push(ContentBlock::Text(TextBlock {
                        content: content.to_string(),
                        partial: true,
                    }));
                }
            }
            State::InTag(tool) => blocks.push(ContentBlock::ToolUse(ToolUse {
                name: tool.name.clone(),
                params: tool.params.clone(),
                partial: true,
            })),
            State::InParam {
                tool,
                param,
                value_start,
            } => {
                let mut params = tool.params.clone();
                let value = self.buffer[*value_start..self.cursor].trim();
                params.insert(param.clone(), value.to_string());
                blocks.push(ContentBlock::ToolUse(ToolUse {
                    name: tool.name.clone(),
                    params,
                    partial: true,
                }));
            }
        }
        blocks
    }
}

/// Parse a complete message in one go.
pub fn parse_assistant_message(message: &str, vocabulary: &ToolVocabulary) -> Vec<ContentBlock> {
    let mut parser = AssistantMessageParser::new(vocabulary.clone());
    parser.update(message);
    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::{Expect, expect};

    fn check_parse(message: &str, expected: Expect) {
        let blocks = parse_assistant_message(message, &ToolVocabulary::default());
        expected.assert_debug_eq(&blocks);
    }

    fn parse_streaming(chunks: &[&str]) -> Vec<ContentBlock> {
        let mut parser = AssistantMessageParser::new(ToolVocabulary::default());
        for chunk in chunks {
            parser.update(chunk);
        }
        parser.finish()
    }

    const SAMPLES: &[&str] = &[
        "Let me look.\n<read_file>\n<path>src/main.rs</path>\n</read_file>",
        "Plain text with a < b and c > d, nothing else.",
        "<write_to_file><path>a.rs</path><content>\nfn f() -> Vec<u8> { vec![] }\n</content><line_count>1</line_count></write_to_file> done",
        "Über <execute_command><command>ls -la</command></execute_command>\n<attempt_completion><result>ok ✓</result></attempt_completion>",
        "< read_file >< path / ></ read_file ><bogus>x</bogus>",
        "<read_file><path>cut off in the mid",
        "text <read_fi",
        "<search_files><path>.</path><regex><div></regex></search_files>",
    ];

    #[test]
    fn test_text_only() {
        check_parse(
            "  Hello, world!  ",
            expect![[r#"
                [
                    Text(
                        TextBlock {
                            content: "Hello, world!",
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_text_then_tool() {
        check_parse(
            "Let me look.\n<read_file>\n<path>src/main.rs</path>\n</read_file>",
            expect![[r#"
                [
                    Text(
                        TextBlock {
                            content: "Let me look.",
                            partial: false,
                        },
                    ),
                    ToolUse(
                        ToolUse {
                            name: "read_file",
                            params: {
                                "path": "src/main.rs",
                            },
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_unknown_tags_are_text() {
        check_parse(
            "Use <div> and <bogus_tool><path>x</path></bogus_tool> freely",
            expect![[r#"
                [
                    Text(
                        TextBlock {
                            content: "Use <div> and <bogus_tool><path>x</path></bogus_tool> freely",
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_whitespace_in_tags_and_self_closing_params() {
        check_parse(
            "< read_file >< path / ></ read_file >",
            expect![[r#"
                [
                    ToolUse(
                        ToolUse {
                            name: "read_file",
                            params: {
                                "path": "",
                            },
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_param_value_keeps_nested_markup() {
        check_parse(
            "<write_to_file><path>a.html</path><content>\n<div><p>hi</p></div>\n</content></write_to_file>",
            expect![[r#"
                [
                    ToolUse(
                        ToolUse {
                            name: "write_to_file",
                            params: {
                                "content": "<div><p>hi</p></div>",
                                "path": "a.html",
                            },
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_tool_close_ends_open_param() {
        check_parse(
            "<attempt_completion><result>All done</attempt_completion>after",
            expect![[r#"
                [
                    ToolUse(
                        ToolUse {
                            name: "attempt_completion",
                            params: {
                                "result": "All done",
                            },
                            partial: false,
                        },
                    ),
                    Text(
                        TextBlock {
                            content: "after",
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_adjacent_tools_are_separate_blocks() {
        check_parse(
            "<read_file><path>a</path></read_file><read_file><path>b</path></read_file>",
            expect![[r#"
                [
                    ToolUse(
                        ToolUse {
                            name: "read_file",
                            params: {
                                "path": "a",
                            },
                            partial: false,
                        },
                    ),
                    ToolUse(
                        ToolUse {
                            name: "read_file",
                            params: {
                                "path": "b",
                            },
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_unterminated_tool_is_partial() {
        check_parse(
            "<read_file><path>cut off in the mid",
            expect![[r#"
                [
                    ToolUse(
                        ToolUse {
                            name: "read_file",
                            params: {
                                "path": "cut off in the mid",
                            },
                            partial: true,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_dangling_open_bracket_becomes_text() {
        check_parse(
            "text <read_fi",
            expect![[r#"
                [
                    Text(
                        TextBlock {
                            content: "text <read_fi",
                            partial: false,
                        },
                    ),
                ]
            "#]],
        );
    }

    #[test]
    fn test_streaming_snapshots_hide_pending_tag() {
        let mut parser = AssistantMessageParser::new(ToolVocabulary::default());

        let blocks = parser.update("Checking <rea");
        assert_eq!(
            blocks,
            vec![ContentBlock::Text(TextBlock {
                content: "Checking".to_string(),
                partial: true,
            })]
        );

        let blocks = parser.update("d_file><path>src/li");
        assert_eq!(blocks.len(), 2);
        assert!(!blocks[0].is_partial());
        let tool = blocks[1].as_tool_use().unwrap();
        assert!(tool.partial);
        assert_eq!(tool.param("path"), Some("src/li"));

        let blocks = parser.update("b.rs</path></read_file>");
        let tool = blocks[1].as_tool_use().unwrap();
        assert!(!tool.partial);
        assert_eq!(tool.param("path"), Some("src/lib.rs"));
    }

    #[test]
    fn test_tool_split_at_tag_boundaries() {
        let blocks = parse_streaming(&["<read_file>", "<path>a.py</path>", "</read_file>"]);
        assert_eq!(blocks.len(), 1);
        let tool = blocks[0].as_tool_use().unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.param("path"), Some("a.py"));
        assert!(!tool.partial);
    }

    #[test]
    fn test_every_split_point_matches_one_shot() {
        let vocabulary = ToolVocabulary::default();
        for sample in SAMPLES {
            let expected = parse_assistant_message(sample, &vocabulary);
            for (split, _) in sample.char_indices().skip(1) {
                let (head, tail) = sample.split_at(split);
                assert_eq!(
                    parse_streaming(&[head, tail]),
                    expected,
                    "split at {split} of {sample:?}"
                );
            }
        }
    }

    #[test]
    fn test_char_by_char_matches_one_shot() {
        let vocabulary = ToolVocabulary::default();
        for sample in SAMPLES {
            let chars: Vec<String> = sample.chars().map(String::from).collect();
            let chunks: Vec<&str> = chars.iter().map(String::as_str).collect();
            assert_eq!(
                parse_streaming(&chunks),
                parse_assistant_message(sample, &vocabulary),
                "{sample:?}"
            );
        }
    }

    #[test]
    fn test_custom_vocabulary() {
        let vocabulary = ToolVocabulary::new(["deploy"], ["target"]);
        let blocks = parse_assistant_message(
            "<deploy><target>prod</target></deploy><read_file/>",
            &vocabulary,
        );
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].as_tool_use().unwrap().param("target"), Some("prod"));
        assert!(matches!(&blocks[1], ContentBlock::Text(text) if text.content == "<read_file/>"));
    }
}
