//! Ordered message log for the active session, and its display projection.
//!
//! The log keeps arrival order: history first (server-ordered), then live messages as the
//! subscription delivers them. Nothing is re-sorted by timestamp.

use crate::message::{parse_timestamp, ChatMessage, UserId};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;

/// Largest gap between a stored row's timestamp and its live broadcast's timestamp.
/// The backend stamps the persisted row and the broadcast copy separately.
const ECHO_WINDOW_MS: i64 = 5_000;

/// Whether `live` is the broadcast copy of the history row `stored`.
///
/// Ids decide when both sides carry one. Otherwise the pair must share sender, receiver and
/// body, with timestamps inside [`ECHO_WINDOW_MS`]; unparseable timestamps must be equal.
fn is_echo_of(stored: &ChatMessage, live: &ChatMessage) -> bool {
    if let (Some(a), Some(b)) = (stored.id, live.id) {
        return a == b;
    }
    if stored.sender_id != live.sender_id
        || stored.receiver_id != live.receiver_id
        || stored.body != live.body
    {
        return false;
    }
    match (stored.sent_at(), live.sent_at()) {
        (Some(a), Some(b)) => (a - b).num_milliseconds().abs() <= ECHO_WINDOW_MS,
        _ => stored.timestamp == live.timestamp,
    }
}

/// Remove and report the first pending history row that `live` echoes.
fn take_match(pending: &mut Vec<ChatMessage>, live: &ChatMessage) -> bool {
    match pending.iter().position(|h| is_echo_of(h, live)) {
        Some(i) => {
            pending.remove(i);
            true
        }
        None => false,
    }
}

/// A message ready to show: who it is from and how long ago it was sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderableMessage {
    pub id: Option<i64>,
    pub sender_id: UserId,
    pub body: String,
    pub timestamp: String,
    pub is_own_message: bool,
    pub display_name: String,
    pub time_label: String,
}

/// In-memory log for one session.
#[derive(Debug, Clone)]
pub struct MessageStore {
    local_user_id: UserId,
    counterpart_name: Option<String>,
    messages: Vec<ChatMessage>,
    /// History rows not yet matched by a live duplicate.
    pending_history: Vec<ChatMessage>,
    seeded: bool,
}

impl MessageStore {
    pub fn new(local_user_id: UserId, counterpart_name: Option<String>) -> Self {
        Self {
            local_user_id,
            counterpart_name,
            messages: Vec::new(),
            pending_history: Vec::new(),
            seeded: false,
        }
    }

    /// Install fetched history. Live messages that got here first stay, after the history,
    /// minus any that duplicate a history row. Only the first call per session has effect.
    pub fn seed(&mut self, history: Vec<ChatMessage>) {
        if self.seeded {
            log::warn!("message store already seeded; ignoring {} history rows", history.len());
            return;
        }
        self.seeded = true;

        let mut pending = history.clone();
        let live = std::mem::replace(&mut self.messages, history);
        let live_count = live.len();
        for m in live {
            if take_match(&mut pending, &m) {
                log::debug!("dropping live duplicate of history row from sender {}", m.sender_id);
                continue;
            }
            self.messages.push(m);
        }
        if live_count > 0 {
            log::debug!("merged history behind {} early live messages", live_count);
        }
        self.pending_history = pending;
    }

    /// Add one message at the end. A live copy of an already shown history row is dropped.
    /// Returns whether the message was added.
    pub fn append(&mut self, message: ChatMessage) -> bool {
        if take_match(&mut self.pending_history, &message) {
            log::debug!("dropping live duplicate of history row from sender {}", message.sender_id);
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.pending_history.clear();
        self.seeded = false;
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Project the log for display at `now`. The iterator can be cloned and restarted;
    /// without a mutation in between, every pass yields the same sequence.
    pub fn to_display_list(
        &self,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = RenderableMessage> + Clone + '_ {
        self.messages.iter().map(move |m| self.render(m, now))
    }

    fn render(&self, m: &ChatMessage, now: DateTime<Utc>) -> RenderableMessage {
        let is_own_message = m.sender_id == self.local_user_id;
        let display_name = if is_own_message {
            "You".to_string()
        } else {
            self.counterpart_name
                .clone()
                .unwrap_or_else(|| format!("User {}", m.sender_id))
        };
        RenderableMessage {
            id: m.id,
            sender_id: m.sender_id,
            body: m.body.clone(),
            timestamp: m.timestamp.clone(),
            is_own_message,
            display_name,
            time_label: relative_time_label(&m.timestamp, now),
        }
    }
}

/// "Just now", "<n> min ago", "<n>h ago", or a local date and time for anything a day or older.
pub fn relative_time_label(timestamp: &str, now: DateTime<Utc>) -> String {
    let Some(at) = parse_timestamp(timestamp) else {
        return timestamp.to_string();
    };
    let age = now.signed_duration_since(at);
    if age.num_seconds() < 60 {
        return "Just now".to_string();
    }
    let minutes = age.num_minutes();
    if minutes < 60 {
        return format!("{} min ago", minutes);
    }
    let hours = age.num_hours();
    if hours < 24 {
        return format!("{}h ago", hours);
    }
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{SecondsFormat, TimeZone};

    const ME: UserId = 1;
    const ALICE: UserId = 7;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap()
    }

    fn ago(secs: i64) -> String {
        (now() - chrono::Duration::seconds(secs)).to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    fn msg(sender: UserId, body: &str, timestamp: &str) -> ChatMessage {
        ChatMessage {
            id: None,
            task_id: 42,
            sender_id: sender,
            receiver_id: if sender == ME { ALICE } else { ME },
            body: body.to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    fn bodies(store: &MessageStore) -> Vec<String> {
        store.to_display_list(now()).map(|r| r.body).collect()
    }

    #[test]
    fn append_keeps_arrival_order_regardless_of_timestamps() {
        let mut store = MessageStore::new(ME, Some("Alice".to_string()));
        store.append(msg(ALICE, "c", &ago(10)));
        store.append(msg(ME, "a", &ago(3000)));
        store.append(msg(ALICE, "b", &ago(100)));
        store.append(msg(ALICE, "b", &ago(100)));
        assert_eq!(bodies(&store), ["c", "a", "b", "b"]);
    }

    #[test]
    fn open_seed_then_live_scenario() {
        let mut store = MessageStore::new(ME, Some("Alice".to_string()));
        store.seed(vec![msg(ALICE, "hi", &ago(120))]);
        store.append(msg(ME, "hello", &ago(5)));
        let list: Vec<_> = store.to_display_list(now()).collect();
        assert_eq!(list.len(), 2);
        assert_eq!((list[0].display_name.as_str(), list[0].body.as_str()), ("Alice", "hi"));
        assert!(!list[0].is_own_message);
        assert_eq!((list[1].display_name.as_str(), list[1].body.as_str()), ("You", "hello"));
        assert!(list[1].is_own_message);
    }

    #[test]
    fn live_before_history_is_kept_after_history() {
        let mut store = MessageStore::new(ME, None);
        store.append(msg(ALICE, "early live", &ago(5)));
        store.seed(vec![msg(ALICE, "old", &ago(600)), msg(ME, "older reply", &ago(500))]);
        assert_eq!(bodies(&store), ["old", "older reply", "early live"]);
    }

    #[test]
    fn duplicates_across_history_and_live_are_dropped_once() {
        let mut store = MessageStore::new(ME, None);
        let mut dup_by_id = msg(ALICE, "persisted", &ago(30));
        dup_by_id.id = Some(9);
        let same_content = msg(ME, "same", &ago(20));

        store.append(same_content.clone());
        store.seed(vec![dup_by_id.clone(), same_content.clone()]);
        assert_eq!(bodies(&store), ["persisted", "same"]);

        let mut live_copy = dup_by_id.clone();
        live_copy.timestamp = ago(1);
        assert!(!store.append(live_copy.clone()));
        assert!(store.append(live_copy));
        assert_eq!(store.len(), 3);
    }

    fn stored_row(id: i64, sender: UserId, body: &str, timestamp: &str) -> ChatMessage {
        ChatMessage {
            id: Some(id),
            ..msg(sender, body, timestamp)
        }
    }

    #[test]
    fn broadcast_copy_without_id_matches_stored_row() {
        let row = stored_row(5, ME, "hi", "2025-09-01T11:59:00.123456");
        let echo = msg(ME, "hi", "2025-09-01T11:59:00.123789");

        let mut live_first = MessageStore::new(ME, None);
        live_first.append(echo.clone());
        live_first.seed(vec![row.clone()]);
        assert_eq!(bodies(&live_first), ["hi"]);
        assert_eq!(live_first.to_display_list(now()).next().unwrap().id, Some(5));

        let mut history_first = MessageStore::new(ME, None);
        history_first.seed(vec![row]);
        assert!(!history_first.append(echo.clone()));
        assert!(history_first.append(echo));
        assert_eq!(bodies(&history_first), ["hi", "hi"]);
    }

    #[test]
    fn same_text_outside_the_echo_window_is_kept() {
        let mut store = MessageStore::new(ME, None);
        store.seed(vec![stored_row(5, ME, "ok", &ago(600))]);
        assert!(store.append(msg(ME, "ok", &ago(1))));
        assert!(store.append(msg(ALICE, "ok", &ago(600))));
        assert_eq!(bodies(&store), ["ok", "ok", "ok"]);
    }

    #[test]
    fn second_seed_is_ignored() {
        let mut store = MessageStore::new(ME, None);
        store.seed(vec![msg(ALICE, "one", &ago(60))]);
        store.seed(vec![msg(ALICE, "two", &ago(60))]);
        assert_eq!(bodies(&store), ["one"]);
        assert!(store.is_seeded());
    }

    #[test]
    fn display_list_is_restartable() {
        let mut store = MessageStore::new(ME, Some("Alice".to_string()));
        store.seed(vec![msg(ALICE, "x", &ago(90)), msg(ME, "y", &ago(30))]);
        let view = store.to_display_list(now());
        let first: Vec<_> = view.clone().collect();
        let second: Vec<_> = view.collect();
        assert_eq!(first, second);
        assert_eq!(first, store.to_display_list(now()).collect::<Vec<_>>());
    }

    #[test]
    fn unknown_counterpart_falls_back_to_user_id() {
        let mut store = MessageStore::new(ME, None);
        store.append(msg(ALICE, "hey", &ago(1)));
        let r = store.to_display_list(now()).next().unwrap();
        assert_eq!(r.display_name, "User 7");

        let mut named = MessageStore::new(ME, Some("Alice".to_string()));
        named.append(msg(ALICE, "hey", &ago(1)));
        assert_eq!(named.to_display_list(now()).next().unwrap().display_name, "Alice");
    }

    #[test]
    fn clear_empties_and_allows_reseed() {
        let mut store = MessageStore::new(ME, None);
        store.seed(vec![msg(ALICE, "one", &ago(60))]);
        store.clear();
        assert!(store.is_empty());
        assert!(!store.is_seeded());
        store.seed(vec![msg(ALICE, "two", &ago(60))]);
        assert_eq!(bodies(&store), ["two"]);
    }

    #[test]
    fn relative_labels() {
        assert_eq!(relative_time_label(&ago(30), now()), "Just now");
        assert_eq!(relative_time_label(&ago(5 * 60), now()), "5 min ago");
        assert_eq!(relative_time_label(&ago(59 * 60 + 59), now()), "59 min ago");
        assert_eq!(relative_time_label(&ago(3 * 3600 + 10), now()), "3h ago");
        assert_eq!(relative_time_label(&ago(-120), now()), "Just now");
        assert_eq!(relative_time_label("T0", now()), "T0");

        let old = ago(3 * 86_400);
        let expected = parse_timestamp(&old)
            .unwrap()
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M")
            .to_string();
        assert_eq!(relative_time_label(&old, now()), expected);
    }
}
