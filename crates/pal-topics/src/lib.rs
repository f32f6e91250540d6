//! Canonical subscription topic names shared across services.
//!
//! This crate centralizes the mapping between policy directories and the
//! pub/sub topics the distribution server publishes on, so the updater,
//! the webhook bridge, and the tests all agree on one namespace.

/// Namespace prefix for directory-derived topics.
pub const POLICY_PREFIX: &str = "policy:";

/// Reserved control topic published when a repository webhook fires.
/// It carries no directory; subscribers treat it as "something changed".
pub const TOPIC_WEBHOOK: &str = "webhook";

/// Derive one topic per directory, preserving order.
pub fn directories_to_topics<I, S>(dirs: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    dirs.into_iter()
        .map(|d| format!("{}{}", POLICY_PREFIX, d.as_ref()))
        .collect()
}

/// Recover the directory a topic was derived from.
///
/// Returns `None` for the control topic and for anything outside the
/// `policy:` namespace. Callers must treat `None` as "unknown, assume
/// everything changed" rather than an error.
pub fn topic_to_directory(topic: &str) -> Option<&str> {
    if topic == TOPIC_WEBHOOK {
        return None;
    }
    topic.strip_prefix(POLICY_PREFIX)
}
