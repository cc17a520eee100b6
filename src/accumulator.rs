/// The three-character marker that opens and closes a code block.
pub const FENCE: &str = "```";

/// A code block structure is renderable once the text holds a balanced
/// (even, at least two) number of fence delimiters. Global parity over the
/// whole text, not a stack: a delimiter inside an already-closed block
/// still counts, which matches how the transcript is re-rendered.
pub fn fences_balanced(text: &str) -> bool {
    let count = text.matches(FENCE).count();
    count >= 2 && count % 2 == 0
}

/// Accumulates streamed fragments into the text of one assistant message
/// and tracks fence parity. One accumulator per message; state never
/// resets mid-stream.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    fence_count: usize,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        StreamAccumulator::default()
    }

    /// Appends a fragment and reports whether a structural boundary is now
    /// complete. The count is recomputed over the whole text because a
    /// delimiter can arrive split across fragments.
    pub fn feed(&mut self, fragment: &str) -> bool {
        self.text.push_str(fragment);
        self.fence_count = self.text.matches(FENCE).count();
        self.boundary_completed()
    }

    pub fn boundary_completed(&self) -> bool {
        self.fence_count >= 2 && self.fence_count % 2 == 0
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn fence_count(&self) -> usize {
        self.fence_count
    }
}
