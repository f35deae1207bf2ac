//! Tool-call grouping and streaming reconciliation.
//!
//! The model may deliver its tool calls twice: first spread over streaming
//! chunks, then again in the final canonical message. The reconciler tracks
//! one group per LLM call and guarantees each call is dispatched exactly
//! once and the round produces exactly one follow-up — the next model call
//! or a stop — regardless of chunk arrival order.

use std::collections::{HashMap, HashSet};

use tiller_domain::{AssistantMessage, ToolCall, ToolMessage};

/// The tool calls of one assistant message plus their collected responses.
#[derive(Debug)]
pub struct ToolCallGroup {
    pub id: u64,
    pub assistant: AssistantMessage,
    responses: HashMap<String, ToolMessage>,
    pub terminal: bool,
}

impl ToolCallGroup {
    fn new(id: u64, assistant: AssistantMessage) -> Self {
        Self {
            id,
            assistant,
            responses: HashMap::new(),
            terminal: false,
        }
    }

    fn record(&mut self, response: ToolMessage) {
        self.responses.insert(response.tool_call_id.clone(), response);
    }

    fn is_complete(&self) -> bool {
        !self.assistant.tool_calls.is_empty()
            && self.assistant.tool_calls.len() == self.responses.len()
    }

    /// Responses in the order of the assistant's tool-calls array,
    /// regardless of completion order.
    fn ordered_responses(&mut self) -> Vec<ToolMessage> {
        let mut out = Vec::with_capacity(self.assistant.tool_calls.len());
        for call in &self.assistant.tool_calls {
            if let Some(response) = self.responses.remove(&call.id) {
                out.push(response);
            }
        }
        out
    }

    /// Adopt the canonical final message, keeping any chunk-observed calls
    /// the final message omitted.
    fn adopt_final(&mut self, final_message: AssistantMessage) {
        let mut merged = final_message;
        for call in std::mem::take(&mut self.assistant.tool_calls) {
            if !merged.tool_calls.iter().any(|c| c.id == call.id) {
                merged.tool_calls.push(call);
            }
        }
        self.assistant = merged;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No model call in flight.
    Idle,
    /// Chunks are arriving; the final message has not been seen.
    Streaming,
    /// The final message arrived; waiting for tool responses.
    Finalizing,
}

/// What the worker must do after the final message of a model call.
#[derive(Debug)]
pub enum FinalOutcome {
    /// No tool calls at all: seal the turn with this message and stop.
    SealTurn(AssistantMessage),
    /// Tool calls pending; dispatch any the chunks did not already cover.
    NewCalls(Vec<ToolCall>),
    /// Every chunk-dispatched call already answered: the final message
    /// closes the group itself.
    Complete(ClosedGroup),
}

/// What the worker must do after recording one tool response.
#[derive(Debug)]
pub enum ResponseOutcome {
    /// The group is still open (responses missing, or the stream has not
    /// finalized yet).
    Pending,
    /// Every call is answered: append responses, emit events, and queue
    /// exactly one follow-up.
    Complete(ClosedGroup),
}

/// A fully-resolved tool-call round.
#[derive(Debug)]
pub struct ClosedGroup {
    pub assistant: AssistantMessage,
    pub responses: Vec<ToolMessage>,
    pub terminal: bool,
    /// Assistant content was already emitted as streaming deltas.
    pub content_streamed: bool,
}

/// Per-LLM-call reconciliation state. Reset before every model call.
#[derive(Debug)]
pub struct Reconciler {
    state: State,
    group: Option<ToolCallGroup>,
    processed: HashSet<String>,
    group_seq: u64,
    content_streamed: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            group: None,
            processed: HashSet::new(),
            group_seq: 0,
            content_streamed: false,
        }
    }

    /// Forget the previous call's state. Responses for a stale group ID are
    /// ignored afterwards.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.group = None;
        self.processed.clear();
        self.content_streamed = false;
    }

    pub fn group_id(&self) -> Option<u64> {
        self.group.as_ref().map(|g| g.id)
    }

    /// The current group's assistant message (the one carrying this round's
    /// tool calls).
    pub fn assistant_snapshot(&self) -> Option<AssistantMessage> {
        self.group.as_ref().map(|g| g.assistant.clone())
    }

    pub fn content_streamed(&self) -> bool {
        self.content_streamed
    }

    /// Note that chunk content reached the caller, so the closed group must
    /// not emit it again.
    pub fn mark_content_streamed(&mut self) {
        self.content_streamed = true;
    }

    /// Process one streaming chunk. Returns the tool calls this chunk
    /// introduced (deduplicated against everything already dispatched).
    pub fn on_chunk(&mut self, chunk: &AssistantMessage) -> Vec<ToolCall> {
        if chunk.tool_calls.is_empty() {
            return Vec::new();
        }

        if self.state == State::Idle {
            self.state = State::Streaming;
            self.group_seq += 1;
            self.group = Some(ToolCallGroup::new(self.group_seq, chunk.clone()));
        }

        let mut fresh = Vec::new();
        for call in &chunk.tool_calls {
            if self.processed.insert(call.id.clone()) {
                fresh.push(call.clone());
            }
        }

        // Keep the seed group's call list in sync with everything observed.
        if let Some(group) = &mut self.group {
            for call in &fresh {
                if !group.assistant.tool_calls.iter().any(|c| c.id == call.id) {
                    group.assistant.tool_calls.push(call.clone());
                }
            }
        }

        fresh
    }

    /// Process the canonical final message of a model call.
    pub fn on_final(&mut self, final_message: AssistantMessage) -> FinalOutcome {
        if final_message.tool_calls.is_empty() && self.group.is_none() {
            self.state = State::Idle;
            return FinalOutcome::SealTurn(final_message);
        }

        let fresh: Vec<ToolCall> = final_message
            .tool_calls
            .iter()
            .filter(|call| self.processed.insert(call.id.clone()))
            .cloned()
            .collect();

        match &mut self.group {
            Some(group) => group.adopt_final(final_message),
            None => {
                self.group_seq += 1;
                self.group = Some(ToolCallGroup::new(self.group_seq, final_message));
            }
        }
        self.state = State::Finalizing;

        if fresh.is_empty() && self.group.as_ref().is_some_and(|g| g.is_complete()) {
            let mut group = self.group.take().expect("group checked above");
            self.state = State::Idle;
            return FinalOutcome::Complete(ClosedGroup {
                responses: group.ordered_responses(),
                terminal: group.terminal,
                content_streamed: self.content_streamed,
                assistant: group.assistant,
            });
        }

        FinalOutcome::NewCalls(fresh)
    }

    /// Record a tool response for the given group. Stale responses (from a
    /// superseded group) are dropped.
    pub fn on_response(
        &mut self,
        group_id: u64,
        response: ToolMessage,
        terminal: bool,
    ) -> ResponseOutcome {
        let Some(group) = &mut self.group else {
            tracing::warn!(
                tool_call_id = %response.tool_call_id,
                "dropping tool response with no open group"
            );
            return ResponseOutcome::Pending;
        };
        if group.id != group_id {
            tracing::warn!(
                tool_call_id = %response.tool_call_id,
                "dropping tool response for a stale group"
            );
            return ResponseOutcome::Pending;
        }

        group.record(response);
        if terminal {
            group.terminal = true;
        }

        // While the stream is open the canonical call set is unknown; wait
        // for the final message before closing.
        if self.state == State::Streaming {
            return ResponseOutcome::Pending;
        }

        if !group.is_complete() {
            return ResponseOutcome::Pending;
        }

        let mut group = self.group.take().expect("group checked above");
        self.state = State::Idle;
        ResponseOutcome::Complete(ClosedGroup {
            responses: group.ordered_responses(),
            terminal: group.terminal,
            content_streamed: self.content_streamed,
            assistant: group.assistant,
        })
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: "{}".into(),
        }
    }

    fn assistant_with(calls: Vec<ToolCall>) -> AssistantMessage {
        AssistantMessage {
            tool_calls: calls,
            ..Default::default()
        }
    }

    fn response(id: &str, name: &str) -> ToolMessage {
        ToolMessage {
            tool_call_id: id.into(),
            tool_name: name.into(),
            content: format!("{name} output"),
        }
    }

    #[test]
    fn final_without_calls_seals_the_turn() {
        let mut r = Reconciler::new();
        let outcome = r.on_final(AssistantMessage::text("done"));
        assert!(matches!(outcome, FinalOutcome::SealTurn(m) if m.content == "done"));
    }

    #[test]
    fn non_streamed_round_closes_in_call_order() {
        let mut r = Reconciler::new();
        let outcome = r.on_final(assistant_with(vec![call("a", "one"), call("b", "two")]));
        let fresh = match outcome {
            FinalOutcome::NewCalls(calls) => calls,
            other => panic!("expected NewCalls, got {other:?}"),
        };
        assert_eq!(fresh.len(), 2);
        let group_id = r.group_id().unwrap();

        // Responses arrive out of order; the close puts them back in the
        // assistant's call order.
        assert!(matches!(
            r.on_response(group_id, response("b", "two"), false),
            ResponseOutcome::Pending
        ));
        match r.on_response(group_id, response("a", "one"), false) {
            ResponseOutcome::Complete(closed) => {
                let ids: Vec<_> = closed
                    .responses
                    .iter()
                    .map(|m| m.tool_call_id.as_str())
                    .collect();
                assert_eq!(ids, vec!["a", "b"]);
                assert!(!closed.terminal);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn chunked_calls_are_dispatched_once() {
        let mut r = Reconciler::new();
        let first = r.on_chunk(&assistant_with(vec![call("a", "one")]));
        assert_eq!(first.len(), 1);
        // The same call repeated in a later chunk is not re-dispatched.
        let repeat = r.on_chunk(&assistant_with(vec![call("a", "one"), call("b", "two")]));
        assert_eq!(repeat.len(), 1);
        assert_eq!(repeat[0].id, "b");

        // The final message repeats both calls; neither is fresh.
        match r.on_final(assistant_with(vec![call("a", "one"), call("b", "two")])) {
            FinalOutcome::NewCalls(fresh) => assert!(fresh.is_empty()),
            other => panic!("expected NewCalls, got {other:?}"),
        }
    }

    #[test]
    fn responses_during_streaming_wait_for_the_final() {
        let mut r = Reconciler::new();
        r.on_chunk(&assistant_with(vec![call("a", "one")]));
        let group_id = r.group_id().unwrap();

        // The response lands before the final message: still pending.
        assert!(matches!(
            r.on_response(group_id, response("a", "one"), false),
            ResponseOutcome::Pending
        ));

        // The final message repeats the call and finds every response
        // already recorded, so it closes the group itself.
        match r.on_final(assistant_with(vec![call("a", "one")])) {
            FinalOutcome::Complete(closed) => {
                assert_eq!(closed.responses.len(), 1);
                assert_eq!(closed.responses[0].tool_call_id, "a");
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn terminal_flag_survives_to_the_close() {
        let mut r = Reconciler::new();
        r.on_final(assistant_with(vec![call("a", "one"), call("b", "two")]));
        let group_id = r.group_id().unwrap();

        r.on_response(group_id, response("a", "one"), true);
        match r.on_response(group_id, response("b", "two"), false) {
            ResponseOutcome::Complete(closed) => assert!(closed.terminal),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn stale_group_responses_are_dropped() {
        let mut r = Reconciler::new();
        r.on_final(assistant_with(vec![call("a", "one")]));
        let old_group = r.group_id().unwrap();

        r.reset();
        r.on_final(assistant_with(vec![call("c", "three")]));

        assert!(matches!(
            r.on_response(old_group, response("a", "one"), false),
            ResponseOutcome::Pending
        ));
        // The new group still completes normally.
        let new_group = r.group_id().unwrap();
        assert!(matches!(
            r.on_response(new_group, response("c", "three"), false),
            ResponseOutcome::Complete(_)
        ));
    }

    #[test]
    fn reset_clears_the_dedup_set() {
        let mut r = Reconciler::new();
        r.on_chunk(&assistant_with(vec![call("a", "one")]));
        r.reset();
        // After reset the same ID counts as fresh again (next model call).
        let fresh = r.on_chunk(&assistant_with(vec![call("a", "one")]));
        assert_eq!(fresh.len(), 1);
    }
}
