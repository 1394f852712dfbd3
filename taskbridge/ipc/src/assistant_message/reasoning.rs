//! Splits `<think>...</think>` reasoning out of a model stream before tool
//! parsing sees it.

/// A piece of the stream, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Reasoning(String),
    Text(String),
}

/// Streaming splitter. Marker fragments cut across chunk boundaries are held
/// back until they resolve.
#[derive(Debug)]
pub struct ReasoningSplitter {
    open: String,
    close: String,
    inside: bool,
    pending: String,
}

impl Default for ReasoningSplitter {
    fn default() -> Self {
        Self::new("think")
    }
}

impl ReasoningSplitter {
    pub fn new(tag: &str) -> Self {
        Self {
            open: format!("<{tag}>"),
            close: format!("</{tag}>"),
            inside: false,
            pending: String::new(),
        }
    }

    pub fn update(&mut self, chunk: &str) -> Vec<StreamChunk> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let marker = if self.inside { &self.close } else { &self.open };
            if let Some(at) = self.pending.find(marker.as_str()) {
                let marker_len = marker.len();
                let before: String = self.pending.drain(..at).collect();
                self.pending.drain(..marker_len);
                self.emit(&mut out, before);
                self.inside = !self.inside;
                continue;
            }

            let keep = held_back(&self.pending, marker);
            let ready: String = self.pending.drain(..self.pending.len() - keep).collect();
            self.emit(&mut out, ready);
            return out;
        }
    }

    /// Flush whatever is held back. An unclosed reasoning section stays
    /// reasoning.
    pub fn finish(mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.emit(&mut out, rest);
        out
    }

    fn emit(&self, out: &mut Vec<StreamChunk>, text: String) {
        if text.is_empty() {
            return;
        }
        match (out.last_mut(), self.inside) {
            (Some(StreamChunk::Reasoning(last)), true) | (Some(StreamChunk::Text(last)), false) => {
                last.push_str(&text)
            }
            (_, true) => out.push(StreamChunk::Reasoning(text)),
            (_, false) => out.push(StreamChunk::Text(text)),
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`.
fn held_back(text: &str, marker: &str) -> usize {
    (1..marker.len().min(text.len() + 1))
        .rev()
        .find(|&n| {
            let start = text.len() - n;
            text.is_char_boundary(start) && marker.starts_with(&text[start..])
        })
        .unwrap_or(0)
}
