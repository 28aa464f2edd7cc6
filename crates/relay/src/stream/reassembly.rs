//! Reassembles unified chunks into a Claude Messages event stream.
//!
//! Vendors stream text, reasoning and tool calls as loose deltas. Claude clients
//! expect typed content blocks with an explicit lifecycle, so this state machine
//! opens and closes blocks as the kind of content changes, rebuilds tool calls
//! from their fragments and emits exactly one terminal sequence.

use serde_json::Value;

use super::tool_calls::{ToolCallTable, ToolCallUpdate};
use crate::{
    error::TransformError,
    messages::{
        claude::{
            ClaudeContentDelta, ClaudeMessageDelta, ClaudeResponseBlock, ClaudeStreamEvent, ClaudeStreamMessage,
            ClaudeUsage,
        },
        unified::{FinishReason, ThinkingFragment, UnifiedChoiceDelta, UnifiedChunk, Usage},
    },
    transformer::{ResponseContext, SseFrame, StreamEncoder, claude::stop_reason},
    usage::{self, EmittedContent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    NotStarted,
    /// `message_start` was sent and no block is open.
    Started,
    Text {
        index: u32,
    },
    /// Tool use blocks are open, listed in `open_tools`. Vendors interleave
    /// the fragments of parallel calls, so they stay open together.
    ToolUse,
    Thinking {
        index: u32,
    },
    /// A finish reason arrived. The terminal sequence waits for usage.
    Finished,
    Closed,
}

/// Claude event encoder for one stream.
pub(crate) struct ClaudeStreamEncoder {
    context: ResponseContext,
    message_id: String,
    state: StreamState,
    next_block: u32,
    open_tools: Vec<u32>,
    tool_calls: ToolCallTable,
    text: String,
    finish_reason: Option<FinishReason>,
    vendor_usage: Option<Usage>,
    usage: Usage,
}

impl ClaudeStreamEncoder {
    pub fn new(context: ResponseContext) -> Self {
        let usage = Usage {
            prompt_tokens: context.prompt_tokens,
            total_tokens: context.prompt_tokens,
            ..Default::default()
        };

        Self {
            context,
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            state: StreamState::NotStarted,
            next_block: 0,
            open_tools: Vec::new(),
            tool_calls: ToolCallTable::default(),
            text: String::new(),
            finish_reason: None,
            vendor_usage: None,
            usage,
        }
    }

    fn start(&mut self, frames: &mut Vec<SseFrame>) {
        if self.state != StreamState::NotStarted {
            return;
        }

        let message = ClaudeStreamMessage {
            id: self.message_id.clone(),
            object_type: "message",
            role: "assistant",
            content: Vec::new(),
            model: self.context.model.clone(),
            stop_reason: None,
            stop_sequence: None,
            usage: ClaudeUsage {
                input_tokens: self.context.prompt_tokens,
                output_tokens: 0,
            },
        };

        push(frames, ClaudeStreamEvent::MessageStart { message });
        self.state = StreamState::Started;
    }

    fn close_block(&mut self, frames: &mut Vec<SseFrame>) {
        match self.state {
            StreamState::Text { index } | StreamState::Thinking { index } => {
                push(frames, ClaudeStreamEvent::ContentBlockStop { index });
            }
            StreamState::ToolUse => {
                for index in self.open_tools.drain(..) {
                    push(frames, ClaudeStreamEvent::ContentBlockStop { index });
                }
            }
            _ => return,
        }

        self.state = StreamState::Started;
    }

    fn open_block(&mut self, frames: &mut Vec<SseFrame>, content_block: ClaudeResponseBlock) -> u32 {
        let another_tool = matches!(content_block, ClaudeResponseBlock::ToolUse { .. });

        if !(another_tool && self.state == StreamState::ToolUse) {
            self.close_block(frames);
        }

        let index = self.next_block;
        self.next_block += 1;

        self.state = match content_block {
            ClaudeResponseBlock::Text { .. } => StreamState::Text { index },
            ClaudeResponseBlock::ToolUse { .. } => {
                self.open_tools.push(index);
                StreamState::ToolUse
            }
            ClaudeResponseBlock::Thinking { .. } => StreamState::Thinking { index },
        };

        push(frames, ClaudeStreamEvent::ContentBlockStart { index, content_block });

        index
    }

    fn thinking(&mut self, frames: &mut Vec<SseFrame>, fragment: ThinkingFragment) {
        let index = match self.state {
            StreamState::Thinking { index } => index,
            _ => self.open_block(
                frames,
                ClaudeResponseBlock::Thinking {
                    thinking: String::new(),
                    signature: None,
                },
            ),
        };

        match fragment {
            ThinkingFragment::Text(thinking) => {
                if !thinking.is_empty() {
                    push(frames, delta(index, ClaudeContentDelta::ThinkingDelta { thinking }));
                }
            }
            ThinkingFragment::Signature(signature) => {
                push(frames, delta(index, ClaudeContentDelta::SignatureDelta { signature }));
                self.close_block(frames);
            }
        }
    }

    fn text(&mut self, frames: &mut Vec<SseFrame>, text: String) {
        if text.is_empty() {
            return;
        }

        let index = match self.state {
            StreamState::Text { index } => index,
            _ => self.open_block(frames, ClaudeResponseBlock::Text { text: String::new() }),
        };

        self.text.push_str(&text);
        push(frames, delta(index, ClaudeContentDelta::TextDelta { text }));
    }

    fn tool_fragment(&mut self, frames: &mut Vec<SseFrame>, fragment: crate::messages::unified::ToolCallFragment) {
        let slot = match self.tool_calls.apply(fragment) {
            ToolCallUpdate::Opened(slot) => {
                let call = self.tool_calls.get(slot);

                let block = ClaudeResponseBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: Value::Object(Default::default()),
                };

                let index = self.open_block(frames, block);
                self.tool_calls.assign_block(slot, index);

                slot
            }
            ToolCallUpdate::Appended(slot) => slot,
        };

        let Some(index) = self.tool_calls.get(slot).block_index else {
            return;
        };

        // text or thinking in between closed the block, its arguments are kept for usage only
        if !self.open_tools.contains(&index) {
            log::warn!("Dropping tool call arguments for closed content block {index}");
            return;
        }

        if let Some(partial_json) = self.tool_calls.take_unsent(slot) {
            push(frames, delta(index, ClaudeContentDelta::InputJsonDelta { partial_json }));
        }
    }

    fn apply_choice(&mut self, frames: &mut Vec<SseFrame>, choice: UnifiedChoiceDelta) {
        let UnifiedChoiceDelta {
            delta, finish_reason, ..
        } = choice;

        if let Some(fragment) = delta.thinking {
            self.thinking(frames, fragment);
        }

        if let Some(text) = delta.content {
            self.text(frames, text);
        }

        for fragment in delta.tool_calls {
            self.tool_fragment(frames, fragment);
        }

        if let Some(reason) = finish_reason {
            self.close_block(frames);
            self.finish_reason = Some(reason);
            self.state = StreamState::Finished;
        }
    }

    fn terminate(&mut self, frames: &mut Vec<SseFrame>) {
        self.close_block(frames);

        let mut emitted = EmittedContent::default();
        emitted.push_text(&self.text);

        for call in self.tool_calls.iter() {
            emitted.push_tool_call(&call.name, &call.arguments);
        }

        self.usage = usage::reconcile(
            self.vendor_usage,
            self.context.prompt_tokens,
            &emitted,
            self.context.estimator.as_ref(),
            &self.context.model,
        );

        let reason = self.finish_reason.take().unwrap_or(if self.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolCalls
        });

        log::debug!(
            "Closing Claude stream {} with finish reason {reason} after {} blocks",
            self.message_id,
            self.next_block
        );

        push(
            frames,
            ClaudeStreamEvent::MessageDelta {
                delta: ClaudeMessageDelta {
                    stop_reason: Some(stop_reason(&reason)),
                    stop_sequence: None,
                },
                usage: ClaudeUsage {
                    input_tokens: self.usage.prompt_tokens,
                    output_tokens: self.usage.completion_tokens,
                },
            },
        );

        push(frames, ClaudeStreamEvent::MessageStop);
        self.state = StreamState::Closed;
    }
}

impl StreamEncoder for ClaudeStreamEncoder {
    fn encode(&mut self, chunk: UnifiedChunk) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        if self.state == StreamState::Closed {
            return frames;
        }

        self.start(&mut frames);

        for choice in chunk.choices.into_iter().take(1) {
            if self.state == StreamState::Finished {
                for fragment in &choice.delta.tool_calls {
                    log::warn!("{}", TransformError::ToolCallAmbiguity(fragment.index));
                }

                continue;
            }

            self.apply_choice(&mut frames, choice);
        }

        if let Some(usage) = chunk.usage {
            self.vendor_usage = Some(usage);
        }

        if self.state == StreamState::Finished && self.vendor_usage.is_some() {
            self.terminate(&mut frames);
        }

        frames
    }

    fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        if self.state == StreamState::Closed {
            return frames;
        }

        self.start(&mut frames);
        self.terminate(&mut frames);

        frames
    }

    fn abort(&mut self) {
        self.state = StreamState::Closed;
    }

    fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    fn usage(&self) -> Usage {
        self.usage
    }
}

fn delta(index: u32, delta: ClaudeContentDelta) -> ClaudeStreamEvent {
    ClaudeStreamEvent::ContentBlockDelta { index, delta }
}

fn push(frames: &mut Vec<SseFrame>, event: ClaudeStreamEvent) {
    frames.push(SseFrame::json(Some(event.name()), &event));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indoc::indoc;

    use super::*;
    use crate::{
        messages::unified::{ToolCallFragment, UnifiedDelta},
        usage::tests::WordEstimator,
    };

    fn encoder() -> ClaudeStreamEncoder {
        ClaudeStreamEncoder::new(ResponseContext {
            model: "claude-3-5-sonnet".to_string(),
            prompt_tokens: 9,
            include_usage: false,
            estimator: Arc::new(WordEstimator),
        })
    }

    fn chunk(delta: UnifiedDelta, finish_reason: Option<FinishReason>) -> UnifiedChunk {
        UnifiedChunk {
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            ..Default::default()
        }
    }

    fn text(text: &str) -> UnifiedChunk {
        chunk(
            UnifiedDelta {
                content: Some(text.to_string()),
                ..Default::default()
            },
            None,
        )
    }

    fn tool(index: u32, id: Option<&str>, name: Option<&str>, arguments: &str) -> UnifiedChunk {
        chunk(
            UnifiedDelta {
                tool_calls: vec![ToolCallFragment {
                    index,
                    id: id.map(str::to_string),
                    name: name.map(str::to_string),
                    arguments: Some(arguments.to_string()),
                }],
                ..Default::default()
            },
            None,
        )
    }

    fn finish(reason: FinishReason) -> UnifiedChunk {
        chunk(UnifiedDelta::default(), Some(reason))
    }

    fn usage(prompt_tokens: u32, completion_tokens: u32) -> UnifiedChunk {
        UnifiedChunk {
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
                reasoning_tokens: 0,
            }),
            ..Default::default()
        }
    }

    /// Renders frames as `event data` lines, with the random message id masked.
    fn render(frames: Vec<SseFrame>, message_id: &str) -> String {
        frames
            .into_iter()
            .map(|frame| format!("{} {}", frame.event.unwrap_or("data"), frame.data))
            .collect::<Vec<_>>()
            .join("\n")
            .replace(message_id, "msg_[id]")
    }

    fn run(chunks: Vec<UnifiedChunk>) -> (String, ClaudeStreamEncoder) {
        let mut encoder = encoder();
        let mut frames = Vec::new();

        for chunk in chunks {
            frames.extend(encoder.encode(chunk));
        }

        frames.extend(encoder.finish());

        (render(frames, &encoder.message_id), encoder)
    }

    #[test]
    fn split_tool_call_fragments() {
        let (output, _) = run(vec![
            tool(0, Some("abc"), Some("get_weather"), "{\"city\":"),
            tool(0, None, None, "\"NYC\"}"),
            finish(FinishReason::ToolCalls),
        ]);

        insta::assert_snapshot!(output, @r#"
        message_start {"type":"message_start","message":{"id":"msg_[id]","type":"message","role":"assistant","content":[],"model":"claude-3-5-sonnet","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":9,"output_tokens":0}}}
        content_block_start {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"abc","name":"get_weather","input":{}}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"city\":"}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"NYC\"}"}}
        content_block_stop {"type":"content_block_stop","index":0}
        message_delta {"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"input_tokens":9,"output_tokens":1}}
        message_stop {"type":"message_stop"}
        "#);
    }

    #[test]
    fn text_then_tools_switch_blocks() {
        let (output, encoder) = run(vec![
            text("Let me "),
            text("check."),
            tool(0, Some("call_a"), Some("search"), "{}"),
            tool(1, Some("call_b"), Some("fetch"), ""),
            tool(1, None, None, "{\"url\":\"x\"}"),
            finish(FinishReason::ToolCalls),
            usage(20, 7),
        ]);

        insta::assert_snapshot!(output, @r#"
        message_start {"type":"message_start","message":{"id":"msg_[id]","type":"message","role":"assistant","content":[],"model":"claude-3-5-sonnet","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":9,"output_tokens":0}}}
        content_block_start {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Let me "}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"check."}}
        content_block_stop {"type":"content_block_stop","index":0}
        content_block_start {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"call_a","name":"search","input":{}}}
        content_block_delta {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{}"}}
        content_block_start {"type":"content_block_start","index":2,"content_block":{"type":"tool_use","id":"call_b","name":"fetch","input":{}}}
        content_block_delta {"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"url\":\"x\"}"}}
        content_block_stop {"type":"content_block_stop","index":1}
        content_block_stop {"type":"content_block_stop","index":2}
        message_delta {"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"input_tokens":20,"output_tokens":7}}
        message_stop {"type":"message_stop"}
        "#);

        assert_eq!(encoder.usage().total_tokens, 27);
    }

    #[test]
    fn thinking_block_closes_on_signature() {
        let thinking = |fragment| {
            chunk(
                UnifiedDelta {
                    thinking: Some(fragment),
                    ..Default::default()
                },
                None,
            )
        };

        let (output, _) = run(vec![
            thinking(ThinkingFragment::Text("hmm".to_string())),
            thinking(ThinkingFragment::Signature("sig".to_string())),
            text("done"),
            finish(FinishReason::Stop),
        ]);

        insta::assert_snapshot!(output, @r#"
        message_start {"type":"message_start","message":{"id":"msg_[id]","type":"message","role":"assistant","content":[],"model":"claude-3-5-sonnet","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":9,"output_tokens":0}}}
        content_block_start {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig"}}
        content_block_stop {"type":"content_block_stop","index":0}
        content_block_start {"type":"content_block_start","index":1,"content_block":{"type":"text","text":""}}
        content_block_delta {"type":"content_block_delta","index":1,"delta":{"type":"text_delta","text":"done"}}
        content_block_stop {"type":"content_block_stop","index":1}
        message_delta {"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"input_tokens":9,"output_tokens":1}}
        message_stop {"type":"message_stop"}
        "#);
    }

    #[test]
    fn nothing_is_emitted_after_the_terminal_sequence() {
        let mut encoder = encoder();

        encoder.encode(text("hi"));

        // the text block is closed, the terminal sequence waits for usage
        let frames = encoder.encode(finish(FinishReason::Stop));
        assert_eq!(frames.len(), 1);
        assert!(!encoder.is_closed());

        let terminal = encoder.encode(usage(3, 1));
        assert_eq!(terminal.len(), 2);
        assert!(encoder.is_closed());

        assert!(encoder.encode(finish(FinishReason::Length)).is_empty());
        assert!(encoder.encode(text("late")).is_empty());
        assert!(encoder.finish().is_empty());
        assert!(encoder.finish().is_empty());
    }

    #[test]
    fn fragments_after_finish_are_dropped() {
        let (output, encoder) = run(vec![
            tool(0, Some("abc"), Some("search"), "{}"),
            finish(FinishReason::ToolCalls),
            tool(0, None, None, "garbage"),
            tool(5, Some("late"), Some("late"), "{}"),
        ]);

        assert_eq!(output.matches("content_block_start").count(), 1);
        assert!(!output.contains("garbage"));
        assert!(encoder.is_closed());
    }

    #[test]
    fn eof_without_finish_reason_ends_the_turn() {
        let (output, encoder) = run(vec![text("partial answer")]);

        insta::assert_snapshot!(output, @r#"
        message_start {"type":"message_start","message":{"id":"msg_[id]","type":"message","role":"assistant","content":[],"model":"claude-3-5-sonnet","stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":9,"output_tokens":0}}}
        content_block_start {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}
        content_block_delta {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial answer"}}
        content_block_stop {"type":"content_block_stop","index":0}
        message_delta {"type":"message_delta","delta":{"stop_reason":"end_turn","stop_sequence":null},"usage":{"input_tokens":9,"output_tokens":2}}
        message_stop {"type":"message_stop"}
        "#);

        assert_eq!(encoder.usage().completion_tokens, 2);
    }

    #[test]
    fn empty_stream_is_still_a_complete_message() {
        let (output, encoder) = run(Vec::new());

        let events: Vec<_> = output.lines().map(|line| line.split(' ').next().unwrap()).collect();
        assert_eq!(events, ["message_start", "message_delta", "message_stop"]);
        assert_eq!(encoder.usage().completion_tokens, 0);
    }

    #[test]
    fn aborted_stream_writes_nothing() {
        let mut encoder = encoder();

        encoder.encode(text("hi"));
        encoder.abort();

        assert!(encoder.encode(text("more")).is_empty());
        assert!(encoder.finish().is_empty());
    }

    #[test]
    fn late_fragments_stay_on_their_own_block() {
        let mut encoder = encoder();
        let mut frames = Vec::new();

        for chunk in [
            tool(0, Some("a"), Some("first"), "{\"x\":"),
            tool(1, Some("b"), Some("second"), "{}"),
            tool(0, None, None, "1}"),
            finish(FinishReason::ToolCalls),
        ] {
            frames.extend(encoder.encode(chunk));
        }

        frames.extend(encoder.finish());

        let events: Vec<Value> = frames.iter().map(|frame| serde_json::from_str(&frame.data).unwrap()).collect();

        let first: String = events
            .iter()
            .filter(|event| event["type"] == "content_block_delta" && event["index"] == 0)
            .map(|event| event["delta"]["partial_json"].as_str().unwrap())
            .collect();

        assert_eq!(first, "{\"x\":1}");

        // no block receives a delta once it was stopped
        for (position, event) in events.iter().enumerate() {
            if event["type"] != "content_block_stop" {
                continue;
            }

            let index = &event["index"];

            assert!(
                !events[position..]
                    .iter()
                    .any(|later| later["type"] == "content_block_delta" && &later["index"] == index),
                "delta after stop of block {index}"
            );
        }
    }

    #[test]
    fn fragments_of_a_closed_tool_block_are_not_emitted() {
        let (output, encoder) = run(vec![
            tool(0, Some("a"), Some("first"), "{\"x\":"),
            text("meanwhile"),
            tool(0, None, None, "1}"),
            finish(FinishReason::ToolCalls),
        ]);

        assert_eq!(output.matches("input_json_delta").count(), 1);
        assert_eq!(encoder.tool_calls.get(0).arguments, "{\"x\":1}");
    }

    #[test]
    fn eof_after_tool_calls_asks_for_tool_use() {
        let (output, _) = run(vec![tool(0, Some("abc"), Some("search"), "{}")]);

        assert!(output.contains(r#""stop_reason":"tool_use""#));
        assert_eq!(output.matches("content_block_stop").count(), 1);
    }

    #[test]
    fn three_piece_tool_call_reassembles() {
        // the unified chunk sequence of a vendor that streams a tool call in three pieces
        let fixture = indoc! {r#"
            {"index":0,"id":"toolu_1","name":"lookup","arguments":"{\"a\""}
            {"index":0,"arguments":":1,"}
            {"index":0,"arguments":"\"b\":2}"}
        "#};

        let mut encoder = encoder();
        let mut emitted = String::new();

        for line in fixture.lines() {
            let value: Value = serde_json::from_str(line).unwrap();

            let fragment = ToolCallFragment {
                index: value["index"].as_u64().unwrap() as u32,
                id: value["id"].as_str().map(str::to_string),
                name: value["name"].as_str().map(str::to_string),
                arguments: value["arguments"].as_str().map(str::to_string),
            };

            let frames = encoder.encode(chunk(
                UnifiedDelta {
                    tool_calls: vec![fragment],
                    ..Default::default()
                },
                None,
            ));

            for frame in frames {
                let data: Value = serde_json::from_str(&frame.data).unwrap();

                if let Some(partial) = data["delta"]["partial_json"].as_str() {
                    emitted.push_str(partial);
                }
            }
        }

        assert_eq!(emitted, "{\"a\":1,\"b\":2}");
    }
}
