use bytes::Bytes;
use std::collections::VecDeque;

/// Rolling tail of decoded terminal output, capped by characters.
///
/// Prompt detection looks at this window as well as at the newest chunk so a
/// prompt split across two reads is still recognised.
#[derive(Debug)]
pub struct PromptWindow {
    text: String,
    char_count: usize,
    max_chars: usize,
}

impl PromptWindow {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            char_count: 0,
            max_chars: max_chars.max(1),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        self.char_count += chunk.chars().count();
        if self.char_count > self.max_chars {
            let excess = self.char_count - self.max_chars;
            let cut = self
                .text
                .char_indices()
                .nth(excess)
                .map(|(index, _)| index)
                .unwrap_or(self.text.len());
            self.text.drain(..cut);
            self.char_count = self.max_chars;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[cfg(test)]
    fn len_chars(&self) -> usize {
        self.char_count
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.char_count = 0;
    }
}

/// Ordered chunks held back until a shell starts streaming.
#[derive(Debug, Default)]
pub struct StartupQueue {
    chunks: VecDeque<Bytes>,
    buffered_bytes: usize,
}

impl StartupQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.buffered_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Append every queued chunk, oldest first, to `out` and empty the queue.
    pub fn drain_into(&mut self, out: &mut Vec<u8>) {
        out.reserve(self.buffered_bytes);
        for chunk in self.chunks.drain(..) {
            out.extend_from_slice(&chunk);
        }
        self.buffered_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_only_tail() {
        let mut window = PromptWindow::new(10);
        window.push("0123456789");
        window.push("abc");
        assert_eq!(window.as_str(), "3456789abc");
        assert_eq!(window.len_chars(), 10);
    }

    #[test]
    fn window_cuts_on_char_boundaries() {
        let mut window = PromptWindow::new(3);
        window.push("héllo→");
        assert_eq!(window.as_str(), "lo→");
        window.clear();
        assert_eq!(window.as_str(), "");
    }

    #[test]
    fn queue_drains_in_arrival_order() {
        let mut queue = StartupQueue::new();
        queue.push(b"first ".to_vec());
        queue.push(Vec::new());
        queue.push(Bytes::from_static(b"second"));
        assert_eq!(queue.buffered_bytes(), 12);

        let mut out = b">".to_vec();
        queue.drain_into(&mut out);
        assert_eq!(out, b">first second");
        assert!(queue.is_empty());
        assert_eq!(queue.buffered_bytes(), 0);
    }
}
