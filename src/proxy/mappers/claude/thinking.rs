// Thinking-block integrity. The upstream enforces three load-bearing rules
// on resumed conversations:
//   1. Every replayed thinking block carries a valid signature, or is gone.
//   2. With thinking enabled, the final assistant message begins with a
//      thinking block.
//   3. A tool_use answered by a plain user message (no tool_result) is a
//      corrupted sequence and gets rejected.
// The passes below repair all three before translation.

use tracing::{debug, info};

use super::models::{ContentBlock, Message, MessageContent};
use crate::proxy::signature_cache::SignatureCache;

pub const MIN_SIGNATURE_LENGTH: usize = 50;

pub const LEADING_THINKING_PLACEHOLDER: &str = "[Continuing from previous context]";
pub const INTERRUPTED_TOOL_TEXT: &str = "[Tool call was interrupted.]";
pub const CONTINUE_TEXT: &str = "[Continue]";

#[derive(Debug, Default, PartialEq)]
pub struct ConversationState {
    pub last_assistant_idx: Option<usize>,
    pub has_valid_thinking: bool,
    pub tool_result_count_after_last: usize,
    pub plain_user_after_last: bool,
    pub in_tool_loop: bool,
    pub interrupted_tool: bool,
}

fn is_valid_signature(signature: &Option<String>) -> bool {
    signature
        .as_ref()
        .map(|s| s.len() >= MIN_SIGNATURE_LENGTH)
        .unwrap_or(false)
}

fn is_thinking_block(block: &ContentBlock) -> bool {
    matches!(
        block,
        ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. }
    )
}

/// Derive the repair-relevant shape of the conversation tail.
pub fn analyze_conversation_state(messages: &[Message]) -> ConversationState {
    let mut state = ConversationState::default();

    state.last_assistant_idx = messages.iter().rposition(|m| m.role == "assistant");
    let Some(idx) = state.last_assistant_idx else {
        return state;
    };

    let last_assistant = &messages[idx];
    let has_tool_use = last_assistant
        .blocks()
        .map(|blocks| blocks.iter().any(|b| matches!(b, ContentBlock::ToolUse { .. })))
        .unwrap_or(false);

    state.has_valid_thinking = last_assistant
        .blocks()
        .map(|blocks| {
            blocks.iter().any(|b| match b {
                ContentBlock::Thinking { thinking, signature } => {
                    !thinking.is_empty() && is_valid_signature(signature)
                }
                _ => false,
            })
        })
        .unwrap_or(false);

    for msg in &messages[idx + 1..] {
        if msg.role != "user" {
            continue;
        }
        match &msg.content {
            MessageContent::Text(text) => {
                if !text.trim().is_empty() {
                    state.plain_user_after_last = true;
                }
            }
            MessageContent::Blocks(blocks) => {
                let results = blocks
                    .iter()
                    .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                    .count();
                state.tool_result_count_after_last += results;
                if results == 0 {
                    state.plain_user_after_last = true;
                }
            }
        }
    }

    if has_tool_use {
        if state.tool_result_count_after_last > 0 {
            state.in_tool_loop = true;
            debug!("[Thinking-Integrity] Active tool loop detected");
        } else if state.plain_user_after_last {
            state.interrupted_tool = true;
            debug!("[Thinking-Integrity] Interrupted tool call detected");
        }
    }

    state
}

/// Pass 1 — restore. Unsigned (or under-length-signed) thinking blocks in
/// assistant messages get their signature back from the cache when the
/// content matches; blocks that stay unsigned are dropped.
/// Idempotent given a stable cache.
pub fn restore_thinking_signatures(messages: &mut [Message]) {
    let cache = SignatureCache::global();
    let mut restored = 0usize;
    let mut dropped = 0usize;

    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let Some(blocks) = msg.blocks_mut() else { continue };

        let mut kept = Vec::with_capacity(blocks.len());
        for block in blocks.drain(..) {
            match block {
                ContentBlock::Thinking { thinking, signature } if !is_valid_signature(&signature) => {
                    match cache.lookup(&thinking) {
                        Some(cached) => {
                            restored += 1;
                            kept.push(ContentBlock::Thinking {
                                thinking,
                                signature: Some(cached),
                            });
                        }
                        None => {
                            dropped += 1;
                        }
                    }
                }
                other => kept.push(other),
            }
        }
        *blocks = kept;
    }

    if restored > 0 || dropped > 0 {
        info!(
            "[Thinking-Integrity] Signature restore: {} restored, {} dropped",
            restored, dropped
        );
    }
}

/// Pass 2 — reorder. Stable partition of every assistant message into
/// [thinking…, text…, tool_use…]; empty text blocks are discarded.
/// Idempotent.
pub fn reorder_assistant_content(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let Some(blocks) = msg.blocks_mut() else { continue };

        blocks.retain(|b| match b {
            ContentBlock::Text { text } => !text.trim().is_empty(),
            _ => true,
        });

        blocks.sort_by_key(|b| match b {
            ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => 0u8,
            ContentBlock::ToolUse { .. } => 2,
            _ => 1,
        });
    }
}

/// Pass 3 — trailing drop. The upstream rejects unsigned thinking at the
/// tail of an assistant message even when it tolerates it elsewhere.
pub fn drop_trailing_unsigned_thinking(messages: &mut [Message]) {
    for msg in messages.iter_mut() {
        if msg.role != "assistant" {
            continue;
        }
        let Some(blocks) = msg.blocks_mut() else { continue };

        let mut end = blocks.len();
        for i in (0..blocks.len()).rev() {
            match &blocks[i] {
                ContentBlock::Thinking { signature, .. } => {
                    if is_valid_signature(signature) {
                        break;
                    }
                    end = i;
                }
                _ => break,
            }
        }

        if end < blocks.len() {
            let removed = blocks.len() - end;
            blocks.truncate(end);
            debug!(
                "[Thinking-Integrity] Removed {} trailing unsigned thinking block(s)",
                removed
            );
        }
    }
}

/// Pass 4 — leading thinking. With thinking enabled, the final assistant
/// message must begin with a thinking block; a message without any gets a
/// synthetic unsigned placeholder (tolerated in this one position).
/// `redacted_thinking` satisfies the invariant.
pub fn ensure_leading_thinking(messages: &mut [Message], thinking_enabled: bool) {
    if !thinking_enabled {
        return;
    }

    let Some(idx) = messages.iter().rposition(|m| m.role == "assistant") else {
        return;
    };

    let msg = &mut messages[idx];
    let has_thinking = match &msg.content {
        MessageContent::Blocks(blocks) => blocks.iter().any(is_thinking_block),
        MessageContent::Text(_) => false,
    };

    if has_thinking {
        return;
    }

    let placeholder = ContentBlock::Thinking {
        thinking: LEADING_THINKING_PLACEHOLDER.to_string(),
        signature: None,
    };

    match &mut msg.content {
        MessageContent::Blocks(blocks) => blocks.insert(0, placeholder),
        MessageContent::Text(text) => {
            let text_block = ContentBlock::Text { text: text.clone() };
            msg.content = MessageContent::Blocks(vec![placeholder, text_block]);
        }
    }

    debug!("[Thinking-Integrity] Prepended placeholder thinking to final assistant message");
}

/// Pass 5 — tool-loop closure. When the conversation tail is a tool loop or
/// an interrupted tool call and no valid thinking anchors it, the whole
/// history loses its thinking blocks and a synthetic closure is inserted so
/// the upstream sees a coherent sequence.
pub fn close_tool_loop(messages: &mut Vec<Message>) {
    let state = analyze_conversation_state(messages);

    if (!state.in_tool_loop && !state.interrupted_tool) || state.has_valid_thinking {
        return;
    }

    strip_all_thinking(messages);

    if state.interrupted_tool {
        let Some(idx) = state.last_assistant_idx else { return };
        info!("[Thinking-Integrity] Closing interrupted tool call with synthetic assistant text");
        messages.insert(
            idx + 1,
            Message {
                role: "assistant".to_string(),
                content: MessageContent::Blocks(vec![ContentBlock::Text {
                    text: INTERRUPTED_TOOL_TEXT.to_string(),
                }]),
            },
        );
    } else {
        let executions = count_tool_results(messages);
        info!(
            "[Thinking-Integrity] Closing tool loop ({} executions) with synthetic turn",
            executions
        );
        messages.push(Message {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::Text {
                text: format!("[{} tool executions completed.]", executions),
            }]),
        });
        messages.push(Message {
            role: "user".to_string(),
            content: MessageContent::Blocks(vec![ContentBlock::Text {
                text: CONTINUE_TEXT.to_string(),
            }]),
        });
    }
}

fn strip_all_thinking(messages: &mut [Message]) {
    let mut stripped = 0usize;

    for msg in messages.iter_mut() {
        let Some(blocks) = msg.blocks_mut() else { continue };
        let before = blocks.len();
        blocks.retain(|b| !is_thinking_block(b));
        stripped += before - blocks.len();

        // An assistant message emptied by the strip keeps a placeholder so
        // role alternation survives translation
        if blocks.is_empty() && before > 0 {
            blocks.push(ContentBlock::Text {
                text: ".".to_string(),
            });
        }
    }

    if stripped > 0 {
        info!("[Thinking-Integrity] Stripped {} thinking block(s) from history", stripped);
    }
}

fn count_tool_results(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter_map(|m| m.blocks())
        .flatten()
        .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
        .count()
}

/// All integrity passes in dispatcher order.
pub fn apply_integrity_passes(messages: &mut Vec<Message>, thinking_enabled: bool) {
    restore_thinking_signatures(messages);
    reorder_assistant_content(messages);
    drop_trailing_unsigned_thinking(messages);
    ensure_leading_thinking(messages, thinking_enabled);
    close_tool_loop(messages);
}
