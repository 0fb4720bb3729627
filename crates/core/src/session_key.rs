//! Deterministic session key resolution.
//!
//! Every inbound trigger maps to exactly one session key, which is the
//! unit of serialization for the actor queue.  Key shapes:
//!
//! - `agent:<id>:main`
//! - `agent:<id>:dm:<peer>`
//! - `agent:<id>:<channel>:dm:<peer>`
//! - `agent:<id>:<channel>:<account>:dm:<peer>`
//! - `agent:<id>:<channel>:group:<group>[:channel:<channel_id>]`
//! - `agent:<id>:<channel>:channel:<channel_id>`
//!
//! A `:thread:<thread_id>` suffix is appended whenever the trigger
//! carries a thread.

use swb_domain::config::{DmScope, InboundMetadata};

/// Resolve the session key for an inbound trigger.  Same metadata in,
/// same key out, always.
pub fn resolve_session_key(agent_id: &str, dm_scope: DmScope, meta: &InboundMetadata) -> String {
    let mut segments: Vec<String> = vec!["agent".into(), seg(agent_id)];

    if meta.is_direct {
        push_dm_segments(&mut segments, dm_scope, meta);
    } else {
        push_group_segments(&mut segments, meta);
    }

    if let Some(tid) = &meta.thread_id {
        segments.push("thread".into());
        segments.push(seg(tid));
    }

    segments.join(":")
}

fn push_dm_segments(segments: &mut Vec<String>, dm_scope: DmScope, meta: &InboundMetadata) {
    let peer = meta.peer_id.as_deref().unwrap_or("unknown");
    match dm_scope {
        DmScope::Main => {
            segments.push("main".into());
        }
        DmScope::PerPeer => {
            segments.push("dm".into());
            segments.push(seg(peer));
        }
        DmScope::PerChannelPeer => {
            segments.push(seg(meta.channel.as_deref().unwrap_or("default")));
            segments.push("dm".into());
            segments.push(seg(peer));
        }
        DmScope::PerAccountChannelPeer => {
            segments.push(seg(meta.channel.as_deref().unwrap_or("default")));
            segments.push(seg(meta.account_id.as_deref().unwrap_or("default")));
            segments.push("dm".into());
            segments.push(seg(peer));
        }
    }
}

fn push_group_segments(segments: &mut Vec<String>, meta: &InboundMetadata) {
    segments.push(seg(meta.channel.as_deref().unwrap_or("default")));
    match (&meta.group_id, &meta.channel_id) {
        (Some(gid), Some(cid)) => {
            segments.push("group".into());
            segments.push(seg(gid));
            segments.push("channel".into());
            segments.push(seg(cid));
        }
        (Some(gid), None) => {
            segments.push("group".into());
            segments.push(seg(gid));
        }
        (None, Some(cid)) => {
            segments.push("channel".into());
            segments.push(seg(cid));
        }
        (None, None) => {
            segments.push("group".into());
            segments.push("unknown".into());
        }
    }
}

/// Identifiers come from external platforms; keep the key parseable by
/// replacing the separator and any whitespace inside a segment.
fn seg(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown".into();
    }
    trimmed
        .chars()
        .map(|c| if c == ':' || c.is_whitespace() { '-' } else { c })
        .collect()
}
