//! Topic filter matching.
//!
//! Filters and topics are split on `/`. `+` matches exactly one segment,
//! a trailing `#` matches zero or more trailing segments (so `a/#` matches
//! `a`), anything else matches literally and case-sensitively. Both ends
//! are anchored. A leading `$` gets no special treatment here; see
//! `BrokerOptions::with_hide_system_topics` for that policy.

/// Does `filter` match `topic`?
///
/// ```
/// use keel_proto::mqtt::topic_matches;
///
/// assert!(topic_matches("a/+/c", "a/b/c"));
/// assert!(!topic_matches("a/+/c", "a/b/d/c"));
/// assert!(topic_matches("a/#", "a"));
/// assert!(!topic_matches("a/b", "a/B"));
/// ```
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segs = filter.split('/');
    let mut topic_segs = topic.split('/');
    loop {
        match (filter_segs.next(), topic_segs.next()) {
            (Some("#"), _) => return filter_segs.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A filter is valid when it is non-empty, `#` only appears as the whole
/// last segment and `+` only as a whole segment.
#[must_use]
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() || filter.contains('\0') {
        return false;
    }
    let mut segs = filter.split('/').peekable();
    while let Some(seg) = segs.next() {
        let last = segs.peek().is_none();
        match seg {
            "#" if !last => return false,
            "#" | "+" => {}
            s if s.contains(['#', '+']) => return false,
            _ => {}
        }
    }
    true
}

/// Topic names used in PUBLISH carry no wildcards.
#[must_use]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['#', '+', '\0'])
}
