//! Conversation query layer
//!
//! The store knows nothing about links. Callers that want "conversations
//! with peers I can reach right now" pass an allow-list (usually
//! [`PeerDirectory::reachable`](crate::peers::PeerDirectory::reachable)) and
//! get summaries back newest first.

use std::collections::HashSet;

use crate::packet::BROADCAST;
use crate::store::{ConversationSummary, Message, MessageStore};

/// Longest preview, in characters, before truncation.
pub const PREVIEW_LEN: usize = 48;

/// Last eight characters of an id, for display.
///
/// ```
/// use whisper_core::query::short_id;
/// assert_eq!(short_id("0123456789abcdef"), "89abcdef");
/// assert_eq!(short_id("abc"), "abc");
/// assert_eq!(short_id(""), "?");
/// ```
pub fn short_id(id: &str) -> &str {
    if id.is_empty() {
        return "?";
    }
    match id.char_indices().rev().nth(7) {
        Some((idx, _)) => &id[idx..],
        None => id,
    }
}

/// Display text for a stored message.
pub fn preview(message: &Message) -> String {
    if message.encrypted {
        return "[encrypted]".to_string();
    }
    match message.text() {
        Some(text) if text.chars().count() > PREVIEW_LEN => {
            let cut: String = text.chars().take(PREVIEW_LEN).collect();
            format!("{}...", cut)
        }
        Some(text) => text.to_string(),
        None => String::new(),
    }
}

/// Sort summaries newest first; ties broken by peer id for stable output.
pub fn sort_by_recency(summaries: &mut [ConversationSummary]) {
    summaries.sort_by(|a, b| {
        b.last_updated
            .cmp(&a.last_updated)
            .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
}

/// Keep summaries whose peer is in `allow`. The broadcast channel is kept
/// regardless since it is not tied to one peer.
pub fn filter_reachable(
    summaries: Vec<ConversationSummary>,
    allow: &HashSet<String>,
) -> Vec<ConversationSummary> {
    summaries
        .into_iter()
        .filter(|s| s.peer_id == BROADCAST || allow.contains(&s.peer_id))
        .collect()
}

/// Conversation summaries, optionally restricted to `allow`, newest first.
pub fn list_conversations(
    store: &MessageStore,
    allow: Option<&HashSet<String>>,
) -> Vec<ConversationSummary> {
    let summaries = store.get_conversations();
    let mut summaries = match allow {
        Some(allow) => filter_reachable(summaries, allow),
        None => summaries,
    };
    sort_by_recency(&mut summaries);
    summaries
}

/// Total unread messages across the given summaries.
pub fn total_unread(summaries: &[ConversationSummary]) -> usize {
    summaries.iter().map(|s| s.unread_count).sum()
}
