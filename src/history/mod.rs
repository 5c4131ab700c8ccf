//! 历史记录与截断：按安全单元整体丢弃最旧的对话。
//!
//! Conversation transcript with unit-safe truncation. When the history
//! outgrows its token budget, whole exchange units are dropped from the
//! oldest end, never splitting a tool-call/tool-result pair, and the
//! retained suffix always starts at a plain user turn.

use crate::types::message::{ContentPart, Message, Role};

/// Token buffer reserved below the hard budget when selecting units.
const TRUNCATION_BUFFER: usize = 500;
/// Fraction of the budget that triggers truncation.
const TRUNCATION_THRESHOLD: f64 = 0.8;
/// Flat token charge per message-level tool call.
const TOKENS_PER_TOOL_CALL: usize = 50;

/// Pluggable token estimation.
pub trait TokenEstimator: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    /// Message estimate: text of text and tool-result parts, plus a flat
    /// charge per tool call.
    fn count_message(&self, msg: &Message) -> usize {
        let mut tokens = 0;
        for part in &msg.content {
            match part {
                ContentPart::Text { text } => tokens += self.count_text(text),
                ContentPart::ToolResult { text, .. } => tokens += self.count_text(text),
                _ => {}
            }
        }
        tokens + msg.tool_calls.len() * TOKENS_PER_TOOL_CALL
    }

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }
}

/// Coarse default estimator: one token per character, halved. Imprecise
/// by design but stable across runs.
#[derive(Debug, Clone, Default)]
pub struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn count_text(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        text.chars().count() / 2
    }
}

/// Kind of a droppable history unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// `user -> assistant` exchange without tool calls.
    Dialog,
    /// `user -> assistant(tools) -> tool* -> assistant(final)` exchange.
    ToolSequence,
}

/// A contiguous slice of history that is safe to drop or keep whole.
#[derive(Debug, Clone)]
pub struct HistoryUnit {
    pub start: usize,
    pub end: usize,
    pub tokens: usize,
    pub kind: UnitKind,
}

/// Identify the safe units of a transcript, walking from the front.
pub fn identify_units(messages: &[Message], estimator: &dyn TokenEstimator) -> Vec<HistoryUnit> {
    let mut units = Vec::new();
    let mut i = 0usize;

    while i < messages.len() {
        if messages[i].role == Role::User {
            let start = i;
            let mut kind = UnitKind::Dialog;
            let mut end = None;

            i += 1;
            while i < messages.len() {
                match messages[i].role {
                    Role::Assistant => {
                        if messages[i].has_tool_calls() {
                            kind = UnitKind::ToolSequence;
                            i = end_of_tool_sequence(messages, i);
                        }
                        end = Some(i);
                        break;
                    }
                    Role::Tool => i += 1,
                    _ => {
                        // Next user turn; the current unit ends before it.
                        i -= 1;
                        end = Some(i);
                        break;
                    }
                }
            }

            let end = end.unwrap_or(messages.len() - 1);
            units.push(HistoryUnit {
                start,
                end,
                tokens: estimator.count_messages(&messages[start..=end]),
                kind,
            });
        }
        i += 1;
    }

    units
}

/// Find the index of the assistant message that closes a tool sequence:
/// the first following assistant message with no tool calls.
fn end_of_tool_sequence(messages: &[Message], start: usize) -> usize {
    let mut i = start + 1;
    while i < messages.len() {
        match messages[i].role {
            Role::Tool => i += 1,
            Role::Assistant => {
                if messages[i].has_tool_calls() {
                    i += 1;
                } else {
                    return i;
                }
            }
            _ => return i - 1,
        }
    }
    messages.len() - 1
}

/// Select units newest-to-oldest while they fit, stopping at the first
/// unit that does not. Returned oldest-first.
fn select_units_from_end(units: &[HistoryUnit], max_tokens: usize) -> Vec<HistoryUnit> {
    let mut selected: Vec<HistoryUnit> = Vec::new();
    let mut current = 0usize;
    for unit in units.iter().rev() {
        if current + unit.tokens <= max_tokens {
            current += unit.tokens;
            selected.insert(0, unit.clone());
        } else {
            // Skipping and continuing would break contiguity.
            break;
        }
    }
    selected
}

/// Append-only transcript with a pluggable token estimator.
pub struct History {
    messages: Vec<Message>,
    estimator: Box<dyn TokenEstimator>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self::with_estimator(Box::new(CharEstimator))
    }

    pub fn with_estimator(estimator: Box<dyn TokenEstimator>) -> Self {
        Self {
            messages: Vec::new(),
            estimator,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn tokens(&self) -> usize {
        self.estimator.count_messages(&self.messages)
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn restore(&mut self, snapshot: Vec<Message>) {
        self.messages = snapshot;
    }

    /// Drop whole units from the oldest end until the transcript plus
    /// system prompt fit the budget. No-op below the trigger threshold.
    pub fn truncate(&mut self, system_prompt: &str, max_history_tokens: usize) {
        if self.messages.is_empty() {
            return;
        }

        let current = self.estimator.count_messages(&self.messages);
        let system_tokens = self.estimator.count_text(system_prompt);
        let total = current + system_tokens;

        let threshold = (max_history_tokens as f64 * TRUNCATION_THRESHOLD) as usize;
        if total <= threshold {
            return;
        }

        let available = max_history_tokens as i64 - system_tokens as i64 - TRUNCATION_BUFFER as i64;
        if available <= 0 {
            // The system prompt alone exhausts the budget.
            self.messages.clear();
            return;
        }

        let units = identify_units(&self.messages, self.estimator.as_ref());
        if units.is_empty() {
            return;
        }

        let mut selected = select_units_from_end(&units, available as usize);

        // The retained suffix must open with a plain user turn.
        while selected
            .first()
            .map(|u| u.kind != UnitKind::Dialog)
            .unwrap_or(false)
        {
            selected.remove(0);
        }

        match selected.first() {
            Some(first) => {
                let start = first.start;
                self.messages.drain(..start);
            }
            None => self.messages.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tool::ToolCall;

    fn user(text: &str) -> Message {
        Message::user(text)
    }

    fn assistant(text: &str) -> Message {
        Message::assistant(text)
    }

    fn assistant_with_call(id: &str) -> Message {
        let call = ToolCall::function(id, "lookup", "{}").unwrap();
        Message::new(Role::Assistant, vec![ContentPart::tool_call(call.clone())])
            .with_tool_calls(vec![call])
    }

    fn tool_result(id: &str) -> Message {
        Message::tool_result(id, "result text")
    }

    fn history_of(messages: Vec<Message>) -> History {
        let mut h = History::new();
        for m in messages {
            h.push(m);
        }
        h
    }

    #[test]
    fn test_default_estimator_halves_char_count() {
        let est = CharEstimator;
        assert_eq!(est.count_text("abcd"), 2);
        assert_eq!(est.count_text("你好你好"), 2);
        assert_eq!(est.count_text(""), 0);
    }

    #[test]
    fn test_tool_calls_add_flat_charge() {
        let est = CharEstimator;
        let msg = assistant_with_call("call_1");
        assert_eq!(est.count_message(&msg), TOKENS_PER_TOOL_CALL);
    }

    #[test]
    fn test_dialog_unit_identification() {
        let messages = vec![user("q1"), assistant("a1"), user("q2"), assistant("a2")];
        let units = identify_units(&messages, &CharEstimator);
        assert_eq!(units.len(), 2);
        assert_eq!((units[0].start, units[0].end), (0, 1));
        assert_eq!((units[1].start, units[1].end), (2, 3));
        assert!(units.iter().all(|u| u.kind == UnitKind::Dialog));
    }

    #[test]
    fn test_tool_sequence_unit_spans_to_final_assistant() {
        let messages = vec![
            user("q"),
            assistant_with_call("c1"),
            tool_result("c1"),
            assistant_with_call("c2"),
            tool_result("c2"),
            assistant("done"),
            user("next"),
            assistant("a"),
        ];
        let units = identify_units(&messages, &CharEstimator);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].kind, UnitKind::ToolSequence);
        assert_eq!((units[0].start, units[0].end), (0, 5));
        assert_eq!((units[1].start, units[1].end), (6, 7));
    }

    #[test]
    fn test_unit_sequence_ends_on_first_plain_assistant() {
        // The closer must be the first assistant message with no tool
        // calls, even when another user turn follows immediately.
        let messages = vec![
            user("q"),
            assistant_with_call("c1"),
            tool_result("c1"),
            assistant("closing"),
        ];
        let units = identify_units(&messages, &CharEstimator);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].end, 3);
    }

    #[test]
    fn test_truncation_below_threshold_is_noop() {
        // 4 messages x "xxxxxxxxxx" (10 chars -> 5 tokens) = 20 tokens.
        let messages = vec![
            user("xxxxxxxxxx"),
            assistant("xxxxxxxxxx"),
            user("xxxxxxxxxx"),
            assistant("xxxxxxxxxx"),
        ];
        let mut h = history_of(messages);
        // Threshold = 0.8 * 1000 = 800 > 20.
        h.truncate("", 1000);
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn test_truncation_boundary_exact_threshold() {
        // One dialog unit of exactly 80 tokens against a budget of 100:
        // threshold is 80, and 80 <= 80 keeps the history untouched.
        let mut h = history_of(vec![
            user(&"a".repeat(80)),
            assistant(&"b".repeat(80)),
        ]);
        assert_eq!(h.tokens(), 80);
        h.truncate("", 100);
        assert_eq!(h.len(), 2);

        // One more token crosses the threshold.
        let mut h = history_of(vec![
            user(&"a".repeat(82)),
            assistant(&"b".repeat(80)),
        ]);
        assert_eq!(h.tokens(), 81);
        h.truncate("", 100);
        // 81 > 80 triggers truncation; available = 100 - 500 < 0 clears.
        assert_eq!(h.len(), 0);
    }

    #[test]
    fn test_truncation_returns_suffix_starting_with_user() {
        let mut messages = Vec::new();
        for i in 0..20 {
            messages.push(user(&format!("question {i} {}", "x".repeat(200))));
            messages.push(assistant(&format!("answer {i} {}", "y".repeat(200))));
        }
        let original = messages.clone();
        let mut h = history_of(messages);
        h.truncate("", 1000);

        assert!(h.len() < original.len());
        assert!(h.len() > 0);
        assert_eq!(h.messages()[0].role, Role::User);
        // Suffix property: retained messages equal the tail of the
        // original transcript.
        let tail = &original[original.len() - h.len()..];
        assert_eq!(h.messages(), tail);
    }

    #[test]
    fn test_truncation_preserves_tool_pairing() {
        let messages = vec![
            // Oversized old dialog unit that will be dropped.
            user(&"x".repeat(3000)),
            assistant(&"y".repeat(3000)),
            // Tool sequence that ends up oldest among the fitting units;
            // it must be dropped whole rather than become the opener.
            user("q1"),
            assistant_with_call("c1"),
            tool_result("c1"),
            assistant("done1"),
            // Dialog unit that becomes the retained opener.
            user("q2"),
            assistant("a2"),
            // Newest tool sequence, retained whole.
            user("q3"),
            assistant_with_call("c3"),
            tool_result("c3"),
            assistant("done3"),
        ];
        let mut h = history_of(messages);
        h.truncate("", 1000);
        assert!(h.len() > 0);
        assert_eq!(h.messages()[0].role, Role::User);
        assert_eq!(h.messages()[0].text(), "q2");

        // Every retained tool call has its result retained after it.
        for (idx, msg) in h.messages().iter().enumerate() {
            for call in &msg.tool_calls {
                let paired = h.messages()[idx..]
                    .iter()
                    .any(|m| m.tool_result_text().map(|(id, _)| id) == Some(call.id.as_str()));
                assert!(paired, "tool call {} lost its result", call.id);
            }
        }
        // And no stray tool results from the dropped sequence.
        assert!(h
            .messages()
            .iter()
            .all(|m| m.tool_result_text().map(|(id, _)| id) != Some("c1")));
    }

    #[test]
    fn test_truncation_drops_leading_tool_sequence_unit() {
        // Both trailing units fit the budget, but the older of them is a
        // tool sequence; it must not become the opener, so only the final
        // dialog unit survives.
        let messages = vec![
            user(&"q".repeat(2000)),
            assistant(&"a".repeat(2000)),
            user("use the tool"),
            assistant_with_call("c1"),
            tool_result("c1"),
            assistant("tool done"),
            user("final question"),
            assistant("final answer"),
        ];
        let mut h = history_of(messages);
        h.truncate("", 800);
        assert_eq!(h.len(), 2);
        assert_eq!(h.messages()[0].role, Role::User);
        assert_eq!(h.messages()[0].text(), "final question");
    }

    #[test]
    fn test_system_prompt_counts_against_budget() {
        let mut h = history_of(vec![
            user(&"a".repeat(400)),
            assistant(&"b".repeat(400)),
        ]);
        // History alone (400 tokens) is under threshold (480), but the
        // system prompt pushes the total over it and the remaining budget
        // under the buffer, clearing everything.
        h.truncate(&"s".repeat(400), 600);
        assert_eq!(h.len(), 0);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut h = history_of(vec![user("q"), assistant("a")]);
        let snapshot = h.snapshot();
        h.push(user("extra"));
        assert_eq!(h.len(), 3);
        h.restore(snapshot);
        assert_eq!(h.len(), 2);
        assert_eq!(h.messages()[1].text(), "a");
    }
}
