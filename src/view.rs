//! Pure helpers that derive display values from cached notifications.

use crate::model::{FeedPage, NotificationItem, NotificationKind};
use std::sync::Arc;
use url::form_urlencoded;

/// Title used when a notification carries none.
pub const FALLBACK_TITLE: &str = "Notification";

/// Lazy concatenation of pages in page order.
pub fn flatten(pages: &[FeedPage]) -> impl Iterator<Item = &Arc<NotificationItem>> + Clone + '_ {
    pages.iter().flatten()
}

pub fn count_unread<I>(items: I) -> usize
where
    I: IntoIterator,
    I::Item: AsRef<NotificationItem>,
{
    items.into_iter().filter(|n| n.as_ref().is_unread()).count()
}

/// Unread items that also satisfy `predicate`.
pub fn count_unread_of_kind<I, P>(items: I, mut predicate: P) -> usize
where
    I: IntoIterator,
    I::Item: AsRef<NotificationItem>,
    P: FnMut(&NotificationItem) -> bool,
{
    items
        .into_iter()
        .filter(|n| {
            let n = n.as_ref();
            n.is_unread() && predicate(n)
        })
        .count()
}

/// Unread mention count, as shown on the mentions badge.
pub fn count_unread_mentions<I>(items: I) -> usize
where
    I: IntoIterator,
    I::Item: AsRef<NotificationItem>,
{
    count_unread_of_kind(items, is_mention)
}

pub fn resolve_display_title(item: &NotificationItem) -> &str {
    item.payload.title().unwrap_or(FALLBACK_TITLE)
}

/// `message`, else `body`, else nothing.
pub fn resolve_display_message(item: &NotificationItem) -> Option<&str> {
    item.payload.message().or_else(|| item.payload.body())
}

/// A mention with enough payload to navigate to.
pub fn is_mention(item: &NotificationItem) -> bool {
    item.kind == NotificationKind::Mention && item.payload.mention_target().is_some()
}

/// In-app location a notification links to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationTarget {
    pub route: String,
    pub query: Vec<(String, String)>,
}

impl NavigationTarget {
    /// Route with its query string, ready to hand to a router.
    pub fn href(&self) -> String {
        if self.query.is_empty() {
            return self.route.clone();
        }
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish();
        format!("{}?{}", self.route, query)
    }
}

/// Where tapping the notification should go. Only mentions navigate.
pub fn build_navigation_target(item: &NotificationItem) -> Option<NavigationTarget> {
    if item.kind != NotificationKind::Mention {
        return None;
    }
    let target = item.payload.mention_target()?;

    let mut query = Vec::new();
    if let Some(thread) = target.thread_id {
        query.push(("thread".to_string(), thread));
    }
    if let Some(comment) = target.comment_id {
        query.push(("comment".to_string(), comment));
    }
    Some(NavigationTarget {
        route: format!("/prompts/{}", target.prompt_id),
        query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::apply_change;
    use crate::backend::ChangeEvent;
    use crate::cache::FeedCache;
    use crate::model::{Payload, PAGE_SIZE};
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn item(id: &str, kind: &str, payload: Value, read: bool) -> NotificationItem {
        let Value::Object(map) = payload else {
            panic!("payload fixture must be an object");
        };
        NotificationItem {
            id: id.to_string(),
            kind: NotificationKind::from(kind),
            payload: Payload::new(map),
            read_at: read.then(|| DateTime::<Utc>::from_timestamp(1_600_000_000, 0).unwrap()),
            created_at: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_title_falls_back() {
        let titled = item("a", "system", json!({ "title": "Weekly digest" }), false);
        let blank = item("b", "system", json!({ "title": "" }), false);
        assert_eq!(resolve_display_title(&titled), "Weekly digest");
        assert_eq!(resolve_display_title(&blank), FALLBACK_TITLE);
    }

    #[test]
    fn test_message_prefers_message_then_body() {
        let both = item("a", "system", json!({ "message": "m", "body": "b" }), false);
        let body = item("b", "system", json!({ "body": "b" }), false);
        let neither = item("c", "system", json!({}), false);
        assert_eq!(resolve_display_message(&both), Some("m"));
        assert_eq!(resolve_display_message(&body), Some("b"));
        assert_eq!(resolve_display_message(&neither), None);
    }

    #[test]
    fn test_mention_requires_prompt_id() {
        let mention = item("a", "mention", json!({ "prompt_id": "p1" }), false);
        let bare = item("b", "mention", json!({}), false);
        let other = item("c", "invite", json!({ "prompt_id": "p1" }), false);
        assert!(is_mention(&mention));
        assert!(!is_mention(&bare));
        assert!(!is_mention(&other));
    }

    #[test]
    fn test_navigation_target_with_thread_and_comment() {
        let n = item(
            "a",
            "mention",
            json!({ "prompt_id": "p1", "thread_id": "t 2", "comment_id": "c3" }),
            false,
        );
        let target = build_navigation_target(&n).unwrap();
        assert_eq!(target.route, "/prompts/p1");
        assert_eq!(target.href(), "/prompts/p1?thread=t+2&comment=c3");
    }

    #[test]
    fn test_navigation_target_without_query() {
        let n = item("a", "mention", json!({ "prompt_id": "p1" }), false);
        assert_eq!(build_navigation_target(&n).unwrap().href(), "/prompts/p1");
        let other = item("b", "system", json!({ "prompt_id": "p1" }), false);
        assert_eq!(build_navigation_target(&other), None);
    }

    #[test]
    fn test_count_unread_mentions() {
        let items = vec![
            item("a", "mention", json!({ "prompt_id": "p1" }), false),
            item("b", "mention", json!({ "prompt_id": "p1" }), true),
            item("c", "system", json!({}), false),
            item("d", "mention", json!({}), false),
        ];
        assert_eq!(count_unread(&items), 3);
        assert_eq!(count_unread_mentions(&items), 1);
        assert_eq!(count_unread_of_kind(&items, |n| n.kind.as_str() == "system"), 1);
    }

    #[test]
    fn test_flatten_preserves_page_order() {
        let pages = vec![
            vec![Arc::new(item("a", "system", json!({}), false))],
            vec![
                Arc::new(item("b", "system", json!({}), true)),
                Arc::new(item("c", "system", json!({}), false)),
            ],
        ];
        let ids: Vec<_> = flatten(&pages).map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(count_unread(flatten(&pages)), 2);
    }

    proptest! {
        #[test]
        fn prop_count_unread_matches_filter(reads in proptest::collection::vec(any::<bool>(), 0..60)) {
            let items: Vec<_> = reads
                .iter()
                .enumerate()
                .map(|(i, read)| item(&format!("n{i}"), "system", json!({}), *read))
                .collect();
            let expected = reads.iter().filter(|read| !**read).count();
            prop_assert_eq!(count_unread(&items), expected);
        }

        #[test]
        fn prop_inserts_never_overflow_first_page(start in 0usize..=PAGE_SIZE, inserts in 0usize..50) {
            let mut feed = FeedCache::new();
            feed.store_page(
                0,
                (0..start.max(1)).map(|i| item(&format!("seed{i}"), "system", json!({}), false)).collect(),
            );
            for i in 0..inserts {
                apply_change(&mut feed, &ChangeEvent::Insert(item(&format!("new{i}"), "system", json!({}), false)));
            }
            prop_assert!(feed.pages()[0].len() <= PAGE_SIZE);
            let ids: std::collections::HashSet<_> = feed.iter().map(|n| n.id.clone()).collect();
            prop_assert_eq!(ids.len(), feed.len());
        }
    }
}
