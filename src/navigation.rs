//! Navigation state: the single source of truth for where the user is.
//!
//! The stack always holds the root region level. Each deeper level is
//! entered from the confirmed item of the level below it, so the current
//! resource path can always be read back with [`NavigationStack::selection`].

use std::fmt;

use crate::cache::{CacheKey, Payload};
use crate::error::ValidationError;
use crate::model::{Action, Cluster, Container, Region, Service, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LevelKind {
    Region,
    Cluster,
    Service,
    Task,
    Container,
    Action,
}

impl LevelKind {
    /// The level entered from a confirmed item of this level.
    pub fn child(self) -> Option<LevelKind> {
        match self {
            Self::Region => Some(Self::Cluster),
            Self::Cluster => Some(Self::Service),
            Self::Service => Some(Self::Task),
            Self::Task => Some(Self::Container),
            Self::Container => Some(Self::Action),
            Self::Action => None,
        }
    }

    /// Levels that skip themselves when they hold exactly one item.
    pub fn auto_selects(self) -> bool {
        matches!(self, Self::Task | Self::Container)
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Region => "Regions",
            Self::Cluster => "Clusters",
            Self::Service => "Services",
            Self::Task => "Tasks",
            Self::Container => "Containers",
            Self::Action => "Actions",
        }
    }
}

impl fmt::Display for LevelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Region => "region",
            Self::Cluster => "cluster",
            Self::Service => "service",
            Self::Task => "task",
            Self::Container => "container",
            Self::Action => "action",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavItem {
    Region(Region),
    Cluster(Cluster),
    Service(Service),
    Task(Task),
    Container(Container),
    Action(Action),
}

impl NavItem {
    pub fn kind(&self) -> LevelKind {
        match self {
            Self::Region(_) => LevelKind::Region,
            Self::Cluster(_) => LevelKind::Cluster,
            Self::Service(_) => LevelKind::Service,
            Self::Task(_) => LevelKind::Task,
            Self::Container(_) => LevelKind::Container,
            Self::Action(_) => LevelKind::Action,
        }
    }

    /// Name used for filtering and breadcrumbs.
    pub fn display_name(&self) -> String {
        match self {
            Self::Region(r) => format!("{} ({})", r.id, r.name),
            Self::Cluster(c) => c.name.clone(),
            Self::Service(s) => s.name.clone(),
            Self::Task(t) => t.id.clone(),
            Self::Container(c) => c.name.clone(),
            Self::Action(a) => a.label(),
        }
    }

    /// Cache key holding this item's children, if they come from the cache.
    pub fn child_key(&self) -> Option<CacheKey> {
        match self {
            Self::Region(r) => Some(CacheKey::Clusters(r.id.clone())),
            Self::Cluster(c) => Some(CacheKey::Services(c.clone())),
            Self::Service(s) => Some(CacheKey::Tasks(s.clone())),
            Self::Task(t) => Some(CacheKey::TaskDetail(t.clone())),
            Self::Container(_) | Self::Action(_) => None,
        }
    }

    /// Navigation items for a cache payload. The agent container is never included.
    pub fn from_payload(payload: &Payload) -> Vec<NavItem> {
        match payload {
            Payload::Clusters(clusters) => clusters.iter().cloned().map(Self::Cluster).collect(),
            Payload::Services(services) => services.iter().cloned().map(Self::Service).collect(),
            Payload::Tasks(tasks) => tasks.iter().cloned().map(Self::Task).collect(),
            Payload::TaskDetail(task) => task.eligible_containers().cloned().map(Self::Container).collect(),
        }
    }
}

/// One level of the stack with its own filter, cursor and error banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    kind: LevelKind,
    items: Vec<NavItem>,
    filter: String,
    /// Index into the visible (filtered) items
    cursor: usize,
    error: Option<String>,
    loading: bool,
    auto_selected: bool,
    key: Option<CacheKey>,
}

impl Level {
    fn new(kind: LevelKind, items: Vec<NavItem>, key: Option<CacheKey>, loading: bool) -> Self {
        Self {
            kind,
            items,
            filter: String::new(),
            cursor: 0,
            error: None,
            loading,
            auto_selected: false,
            key,
        }
    }

    pub fn kind(&self) -> LevelKind {
        self.kind
    }

    /// Every fetched item, regardless of the filter.
    pub fn items(&self) -> &[NavItem] {
        &self.items
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn was_auto_selected(&self) -> bool {
        self.auto_selected
    }

    pub fn key(&self) -> Option<&CacheKey> {
        self.key.as_ref()
    }

    /// Items matching the filter (case-insensitive substring on the display name).
    pub fn visible(&self) -> Vec<&NavItem> {
        if self.filter.is_empty() {
            return self.items.iter().collect();
        }
        let needle = self.filter.to_lowercase();
        self.items
            .iter()
            .filter(|item| item.display_name().to_lowercase().contains(&needle))
            .collect()
    }

    /// Item under the cursor.
    pub fn selected(&self) -> Option<&NavItem> {
        if self.loading {
            return None;
        }
        self.visible().get(self.cursor).copied()
    }

    fn clamp_cursor(&mut self) {
        let len = self.visible().len();
        self.cursor = self.cursor.min(len.saturating_sub(1));
    }
}

/// Resource path made of the confirmed item of every level below the top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub region: Option<Region>,
    pub cluster: Option<Cluster>,
    pub service: Option<Service>,
    pub task: Option<Task>,
    pub container: Option<Container>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome {
    Popped,
    /// The root level cannot be popped; the caller should offer to exit.
    AtRoot,
}

#[derive(Debug)]
pub struct NavigationStack {
    levels: Vec<Level>,
}

impl NavigationStack {
    pub fn new(regions: Vec<Region>) -> Self {
        let items = regions.into_iter().map(NavItem::Region).collect();
        Self {
            levels: vec![Level::new(LevelKind::Region, items, None, false)],
        }
    }

    pub fn top(&self) -> &Level {
        &self.levels[self.levels.len() - 1]
    }

    fn top_mut(&mut self) -> &mut Level {
        let last = self.levels.len() - 1;
        &mut self.levels[last]
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    fn check_transition(&self, kind: LevelKind) -> Result<(), ValidationError> {
        let top = self.top();
        if top.kind.child() != Some(kind) || top.selected().is_none() {
            return Err(ValidationError::InvalidTransition {
                from: top.kind.to_string(),
                to: kind.to_string(),
            });
        }
        Ok(())
    }

    /// Enters a level whose items are already known.
    pub fn push(&mut self, kind: LevelKind, items: Vec<NavItem>) -> Result<(), ValidationError> {
        self.check_transition(kind)?;
        self.levels.push(Level::new(kind, items, None, false));
        Ok(())
    }

    /// Enters a level filled from a cached payload. It reloads under `key`.
    pub fn push_cached(&mut self, kind: LevelKind, key: CacheKey, items: Vec<NavItem>) -> Result<(), ValidationError> {
        self.check_transition(kind)?;
        self.levels.push(Level::new(kind, items, Some(key), false));
        Ok(())
    }

    /// Enters a level whose items are being fetched under `key`.
    pub fn push_loading(&mut self, kind: LevelKind, key: CacheKey) -> Result<(), ValidationError> {
        self.check_transition(kind)?;
        self.levels.push(Level::new(kind, Vec::new(), Some(key), true));
        Ok(())
    }

    /// Marks the top level as loading again (explicit refresh).
    pub fn reload(&mut self) -> Option<CacheKey> {
        let top = self.top_mut();
        let key = top.key.clone()?;
        top.loading = true;
        top.error = None;
        Some(key)
    }

    /// Completes a loading level. Ignored unless `key` belongs to the top level.
    ///
    /// On reload the cursor stays on the previously selected item when it is
    /// still present.
    pub fn fill(&mut self, key: &CacheKey, result: Result<Vec<NavItem>, String>) -> bool {
        let top = self.top_mut();
        if !top.loading || top.key.as_ref().map(CacheKey::id) != Some(key.id()) {
            return false;
        }
        let previous = top.visible().get(top.cursor).map(|item| item.display_name());
        top.loading = false;
        match result {
            Ok(items) => {
                top.items = items;
                top.error = None;
                let cursor = previous
                    .and_then(|name| top.visible().iter().position(|item| item.display_name() == name))
                    .unwrap_or(0);
                top.cursor = cursor;
            }
            Err(message) => top.error = Some(message),
        }
        top.clamp_cursor();
        true
    }

    /// Leaves the top level, discarding its filter and cursor.
    pub fn pop(&mut self) -> PopOutcome {
        if self.levels.len() <= 1 {
            return PopOutcome::AtRoot;
        }
        self.levels.pop();
        PopOutcome::Popped
    }

    /// Pops the top level and every auto-selected level beneath it, so the
    /// user lands on a level that will not immediately advance again.
    pub fn back(&mut self) -> PopOutcome {
        if self.pop() == PopOutcome::AtRoot {
            return PopOutcome::AtRoot;
        }
        while self.levels.len() > 1 && self.top().auto_selected {
            self.levels.pop();
        }
        self.top_mut().auto_selected = false;
        PopOutcome::Popped
    }

    pub fn set_filter(&mut self, text: &str) {
        let top = self.top_mut();
        top.filter = text.to_string();
        top.clamp_cursor();
    }

    pub fn set_error(&mut self, message: impl Into<String>) {
        self.top_mut().error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.top_mut().error = None;
    }

    pub fn next(&mut self) {
        let top = self.top_mut();
        let len = top.visible().len();
        if len > 0 {
            top.cursor = (top.cursor + 1) % len;
        }
    }

    pub fn previous(&mut self) {
        let top = self.top_mut();
        let len = top.visible().len();
        if len > 0 {
            top.cursor = if top.cursor == 0 { len - 1 } else { top.cursor - 1 };
        }
    }

    /// Item under the cursor of the top level, for explicit confirmation.
    pub fn confirm(&self) -> Option<&NavItem> {
        self.top().selected()
    }

    /// The single eligible item of the top level, if it qualifies for
    /// auto-selection. Marks the level so `back` skips it later.
    pub fn auto_select(&mut self) -> Option<NavItem> {
        let top = self.top_mut();
        if !top.kind.auto_selects() || top.loading || !top.filter.is_empty() || top.items.len() != 1 {
            return None;
        }
        top.cursor = 0;
        top.auto_selected = true;
        top.items.first().cloned()
    }

    /// Up to `count` items the user is likely to open next: the highlighted
    /// item, then its neighbours.
    pub fn likely_next(&self, count: usize) -> Vec<&NavItem> {
        let top = self.top();
        let visible = top.visible();
        if top.loading || visible.is_empty() {
            return Vec::new();
        }
        let len = visible.len();
        let mut picked = vec![top.cursor];
        let mut offset = 1;
        while picked.len() < count.min(len) {
            let after = (top.cursor + offset) % len;
            if !picked.contains(&after) {
                picked.push(after);
            }
            let before = (top.cursor + len - offset % len) % len;
            if picked.len() < count.min(len) && !picked.contains(&before) {
                picked.push(before);
            }
            offset += 1;
        }
        picked.into_iter().map(|i| visible[i]).collect()
    }

    /// The confirmed resource path below the top level.
    pub fn selection(&self) -> Selection {
        let mut selection = Selection::default();
        for level in &self.levels[..self.levels.len() - 1] {
            match level.selected() {
                Some(NavItem::Region(r)) => selection.region = Some(r.clone()),
                Some(NavItem::Cluster(c)) => selection.cluster = Some(c.clone()),
                Some(NavItem::Service(s)) => selection.service = Some(s.clone()),
                Some(NavItem::Task(t)) => selection.task = Some(t.clone()),
                Some(NavItem::Container(c)) => selection.container = Some(c.clone()),
                Some(NavItem::Action(_)) | None => {}
            }
        }
        selection
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn regions() -> Vec<Region> {
        vec![Region::new("us-east-1"), Region::new("eu-west-1"), Region::new("eu-west-2")]
    }

    fn cluster(name: &str) -> NavItem {
        NavItem::Cluster(Cluster {
            arn: format!("arn:aws:ecs:eu-west-1:1:cluster/{name}"),
            name: name.to_string(),
            region: "eu-west-1".to_string(),
        })
    }

    #[test]
    fn test_root_level() {
        let stack = NavigationStack::new(regions());
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().kind(), LevelKind::Region);
        assert_eq!(stack.selection(), Selection::default());
    }

    #[test]
    fn test_push_out_of_order_is_rejected() {
        let mut stack = NavigationStack::new(regions());
        let err = stack.push(LevelKind::Task, vec![]).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InvalidTransition {
                from: "region".into(),
                to: "task".into()
            }
        );
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn test_push_requires_selection() {
        let mut stack = NavigationStack::new(vec![]);
        assert!(stack.push(LevelKind::Cluster, vec![]).is_err());
    }

    #[test]
    fn test_cursor_wraps() {
        let mut stack = NavigationStack::new(regions());
        stack.previous();
        assert_eq!(stack.top().cursor(), 2);
        stack.next();
        assert_eq!(stack.top().cursor(), 0);
    }

    #[test]
    fn test_filter_is_pure_and_clamps_cursor() {
        let mut stack = NavigationStack::new(regions());
        stack.next();
        stack.next();
        stack.set_filter("IRELAND");
        assert_eq!(stack.top().visible().len(), 1);
        assert_eq!(stack.top().cursor(), 0);
        assert_eq!(stack.top().items().len(), 3);
        stack.set_filter("");
        assert_eq!(stack.top().visible().len(), 3);
    }

    #[test]
    fn test_fill_ignores_stale_key() {
        let mut stack = NavigationStack::new(regions());
        stack
            .push_loading(LevelKind::Cluster, CacheKey::Clusters("us-east-1".into()))
            .unwrap();
        assert!(stack.confirm().is_none());
        assert!(!stack.fill(&CacheKey::Clusters("eu-west-1".into()), Ok(vec![cluster("x")])));
        assert!(stack.top().is_loading());
        assert!(stack.fill(&CacheKey::Clusters("us-east-1".into()), Ok(vec![cluster("a"), cluster("b")])));
        assert_eq!(stack.top().items().len(), 2);
        assert!(!stack.top().is_loading());
    }

    #[test]
    fn test_fill_error_sets_banner() {
        let mut stack = NavigationStack::new(regions());
        let key = CacheKey::Clusters("us-east-1".into());
        stack.push_loading(LevelKind::Cluster, key.clone()).unwrap();
        stack.fill(&key, Err("permission denied".into()));
        assert_eq!(stack.top().error(), Some("permission denied"));
    }

    #[test]
    fn test_reload_keeps_cursor_on_same_item() {
        let mut stack = NavigationStack::new(regions());
        let key = CacheKey::Clusters("us-east-1".into());
        stack.push_loading(LevelKind::Cluster, key.clone()).unwrap();
        stack.fill(&key, Ok(vec![cluster("a"), cluster("b")]));
        stack.next();
        assert_eq!(stack.reload(), Some(key.clone()));
        stack.fill(&key, Ok(vec![cluster("0"), cluster("a"), cluster("b")]));
        assert_eq!(stack.confirm().unwrap().display_name(), "b");
    }

    #[test]
    fn test_pop_at_root() {
        let mut stack = NavigationStack::new(regions());
        assert_eq!(stack.pop(), PopOutcome::AtRoot);
        assert_eq!(stack.back(), PopOutcome::AtRoot);
    }

    #[test]
    fn test_selection_tracks_confirmed_path() {
        let mut stack = NavigationStack::new(regions());
        stack.next();
        stack.push(LevelKind::Cluster, vec![cluster("a"), cluster("b")]).unwrap();
        stack.next();
        let selection = stack.selection();
        assert_eq!(selection.region.unwrap().id, "eu-west-1");
        assert!(selection.cluster.is_none());
    }

    #[test]
    fn test_likely_next_prefers_neighbours() {
        let mut stack = NavigationStack::new(regions());
        stack.next();
        let names: Vec<String> = stack.likely_next(3).iter().map(|i| i.display_name()).collect();
        assert_eq!(names, vec!["eu-west-1 (Ireland)", "eu-west-2 (London)", "us-east-1 (N.Virginia)"]);
        assert_eq!(stack.likely_next(1).len(), 1);
        assert_eq!(stack.likely_next(10).len(), 3);
    }
}
