use crate::config::RunSettings;
use crate::ledger::{Item, TrackedSource};

/// Remote items whose id is not yet in `known_items`, in listing order.
///
/// A known id always wins over whatever the listing now says about it.
pub fn diff(source: &TrackedSource, remote_items: &[Item]) -> Vec<Item> {
    remote_items
        .iter()
        .filter(|item| !source.is_known(&item.id))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Known duration below the shorts bound.
    Short,
    /// Older than the first-run window of a newly tracked source.
    BeforeFirstRun,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Short => "short video",
            SkipReason::BeforeFirstRun => "published before the source was tracked",
        }
    }
}

/// What one source contributes to a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePlan {
    pub queue: Vec<Item>,
    pub skipped: Vec<(Item, SkipReason)>,
}

/// Splits the gap into items to download and items to mark skipped.
///
/// A source that has never been checked only downloads its newest
/// `initial_items_per_source` items; older ones are recorded as skipped so
/// later cycles only pick up new uploads.
pub fn plan(source: &TrackedSource, remote_items: &[Item], settings: &RunSettings) -> SourcePlan {
    let mut out = SourcePlan::default();
    let first_run = source.never_checked();

    for item in diff(source, remote_items) {
        let is_short = settings.skip_shorts
            && item
                .duration_seconds
                .is_some_and(|d| d < settings.shorts_max_seconds);
        if is_short {
            out.skipped.push((item, SkipReason::Short));
        } else if first_run && out.queue.len() >= settings.initial_items_per_source {
            out.skipped.push((item, SkipReason::BeforeFirstRun));
        } else {
            out.queue.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{SourceDescriptor, SourceKind};

    fn source(known: &[&str]) -> TrackedSource {
        let mut s = TrackedSource::from_descriptor(&SourceDescriptor {
            id: "@s".to_string(),
            kind: SourceKind::Channel,
            display_name: "s".to_string(),
        });
        s.known_items = known.iter().map(|k| k.to_string()).collect();
        s.last_checked_at_ms = Some(1);
        s
    }

    fn item(id: &str, duration: Option<u64>) -> Item {
        let mut i = Item::pending("@s", id);
        i.duration_seconds = duration;
        i
    }

    fn ids(items: &[Item]) -> Vec<&str> {
        items.iter().map(|i| i.id.as_str()).collect()
    }

    #[test]
    fn new_item_is_returned_and_known_item_is_not() {
        let s = source(&["v2"]);
        let remote = vec![item("v1", Some(300)), item("v2", Some(300))];
        assert_eq!(ids(&diff(&s, &remote)), vec!["v1"]);
    }

    #[test]
    fn diff_preserves_order_and_is_idempotent() {
        let s = source(&["b"]);
        let remote = vec![item("c", None), item("b", None), item("a", None)];
        let first = diff(&s, &remote);
        let second = diff(&s, &remote);
        assert_eq!(ids(&first), vec!["c", "a"]);
        assert_eq!(first, second);
        assert!(first.iter().all(|i| !s.is_known(&i.id)));
    }

    #[test]
    fn empty_listing_gives_empty_gap() {
        assert!(diff(&source(&["x"]), &[]).is_empty());
    }

    #[test]
    fn metadata_drift_does_not_refetch() {
        let s = source(&["v1"]);
        let mut edited = item("v1", Some(999));
        edited.title = Some("Renamed by uploader".to_string());
        assert!(diff(&s, &[edited]).is_empty());
    }

    #[test]
    fn plan_skips_shorts_with_known_duration_only() {
        let s = source(&[]);
        let remote = vec![item("short", Some(45)), item("long", Some(600)), item("unknown", None)];
        let plan = plan(&s, &remote, &RunSettings::default());
        assert_eq!(ids(&plan.queue), vec!["long", "unknown"]);
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(plan.skipped[0].0.id, "short");
        assert_eq!(plan.skipped[0].1, SkipReason::Short);
    }

    #[test]
    fn plan_keeps_shorts_when_filter_is_off() {
        let settings = RunSettings {
            skip_shorts: false,
            ..RunSettings::default()
        };
        let plan = plan(&source(&[]), &[item("short", Some(10))], &settings);
        assert_eq!(ids(&plan.queue), vec!["short"]);
    }

    #[test]
    fn first_run_limits_the_queue_to_newest_items() {
        let mut s = source(&[]);
        s.last_checked_at_ms = None;
        let remote: Vec<Item> = (0..8).map(|i| item(&format!("v{i}"), Some(600))).collect();
        let settings = RunSettings {
            initial_items_per_source: 3,
            ..RunSettings::default()
        };
        let plan = plan(&s, &remote, &settings);
        assert_eq!(ids(&plan.queue), vec!["v0", "v1", "v2"]);
        assert_eq!(plan.skipped.len(), 5);
        assert!(plan
            .skipped
            .iter()
            .all(|(_, reason)| *reason == SkipReason::BeforeFirstRun));
    }

    #[test]
    fn later_runs_are_not_limited() {
        let s = source(&[]);
        let remote: Vec<Item> = (0..8).map(|i| item(&format!("v{i}"), Some(600))).collect();
        let settings = RunSettings {
            initial_items_per_source: 3,
            ..RunSettings::default()
        };
        assert_eq!(plan(&s, &remote, &settings).queue.len(), 8);
    }
}
