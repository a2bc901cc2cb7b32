use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};
use warden_core::{WardenError, WardenResult};

/// A named unit of work to be ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique item name.
    pub name: String,
    /// Lower values are more urgent.
    #[serde(default)]
    pub priority: i64,
    /// Names of items that must be scheduled first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Free-form data carried along with the item.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkItem {
    /// An item with no dependencies.
    pub fn new(name: impl Into<String>, priority: i64) -> Self {
        Self {
            name: name.into(),
            priority,
            depends_on: BTreeSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// Replace the dependency set.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn is_ready(&self, scheduled: &HashSet<&str>, known: &HashSet<&str>) -> bool {
        self.depends_on
            .iter()
            .filter(|dep| known.contains(dep.as_str()))
            .all(|dep| scheduled.contains(dep.as_str()))
    }
}

/// A computed order plus the items that had to be placed by the cycle fallback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// Item names in dispatch order.
    pub order: Vec<String>,
    /// Items appended in name order because no item was ready (a cycle).
    pub cycle_fallback: Vec<String>,
}

impl ExecutionPlan {
    /// Whether any items were placed by the cycle fallback.
    pub fn has_cycle(&self) -> bool {
        !self.cycle_fallback.is_empty()
    }
}

/// Dependency-aware priority ordering of [`WorkItem`]s.
///
/// Among items whose dependencies are all placed, the lowest priority value
/// goes next, ties broken by insertion order. Dependency cycles never fail
/// the schedule: the leftover items are appended sorted by name.
#[derive(Debug, Default, Clone)]
pub struct PriorityScheduler {
    items: Vec<WorkItem>,
}

impl PriorityScheduler {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Add an item, replacing (in place) any existing item with the same name.
    pub fn add_item(&mut self, item: WorkItem) -> WardenResult<()> {
        if item.depends_on.contains(&item.name) {
            return Err(WardenError::InvalidWorkflow(format!(
                "work item '{}' depends on itself",
                item.name
            )));
        }
        match self.items.iter_mut().find(|existing| existing.name == item.name) {
            Some(existing) => *existing = item,
            None => self.items.push(item),
        }
        Ok(())
    }

    /// Remove an item; dependents treat it as satisfied afterwards.
    pub fn remove_item(&mut self, name: &str) -> Option<WorkItem> {
        let index = self.items.iter().position(|item| item.name == name)?;
        Some(self.items.remove(index))
    }

    /// Whether an item named `name` is queued.
    pub fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|item| item.name == name)
    }

    /// Queued item named `name`.
    pub fn get(&self, name: &str) -> Option<&WorkItem> {
        self.items.iter().find(|item| item.name == name)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether no items are queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Every item name exactly once, in execution order.
    pub fn get_execution_order(&self) -> Vec<String> {
        self.plan().order
    }

    /// Compute the execution order, reporting any cycle fallback.
    pub fn plan(&self) -> ExecutionPlan {
        let known: HashSet<&str> = self.items.iter().map(|i| i.name.as_str()).collect();
        for item in &self.items {
            for dep in &item.depends_on {
                if !known.contains(dep.as_str()) {
                    debug!(item = %item.name, dependency = %dep, "Ignoring unknown dependency");
                }
            }
        }

        let mut scheduled: HashSet<&str> = HashSet::new();
        let mut plan = ExecutionPlan::default();

        while scheduled.len() < self.items.len() {
            let next = self
                .items
                .iter()
                .filter(|item| !scheduled.contains(item.name.as_str()))
                .filter(|item| item.is_ready(&scheduled, &known))
                .fold(None::<&WorkItem>, |best, item| match best {
                    Some(b) if b.priority <= item.priority => Some(b),
                    _ => Some(item),
                });

            match next {
                Some(item) => {
                    scheduled.insert(item.name.as_str());
                    plan.order.push(item.name.clone());
                }
                None => {
                    let mut remaining: Vec<&str> = self
                        .items
                        .iter()
                        .map(|item| item.name.as_str())
                        .filter(|name| !scheduled.contains(name))
                        .collect();
                    remaining.sort_unstable();
                    warn!(
                        remaining = ?remaining,
                        "Dependency cycle detected, appending remaining items in name order"
                    );
                    plan.cycle_fallback = remaining.iter().map(ToString::to_string).collect();
                    plan.order.extend(plan.cycle_fallback.iter().cloned());
                    break;
                }
            }
        }

        plan
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let index: HashMap<&str, &WorkItem> =
            self.items.iter().map(|i| (i.name.as_str(), i)).collect();
        let mut visited: HashMap<&str, u8> = HashMap::new();
        self.items
            .iter()
            .any(|item| Self::dfs_cycle(item.name.as_str(), &index, &mut visited))
    }

    fn dfs_cycle<'a>(
        name: &'a str,
        index: &HashMap<&'a str, &'a WorkItem>,
        visited: &mut HashMap<&'a str, u8>,
    ) -> bool {
        match visited.get(name) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(name, 1);
        if let Some(&item) = index.get(name) {
            for dep in &item.depends_on {
                if Self::dfs_cycle(dep.as_str(), index, visited) {
                    return true;
                }
            }
        }
        visited.insert(name, 2);
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_empty_scheduler() {
        let scheduler = PriorityScheduler::new();
        assert!(scheduler.is_empty());
        assert!(scheduler.get_execution_order().is_empty());
        assert!(!scheduler.has_cycle());
    }

    #[test]
    fn test_priority_order_without_deps() {
        let mut scheduler = PriorityScheduler::new();
        scheduler.add_item(WorkItem::new("low", 5)).unwrap();
        scheduler.add_item(WorkItem::new("urgent", 0)).unwrap();
        scheduler.add_item(WorkItem::new("mid", 2)).unwrap();
        assert_eq!(scheduler.get_execution_order(), vec!["urgent", "mid", "low"]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let mut scheduler = PriorityScheduler::new();
        for name in ["c", "a", "b"] {
            scheduler.add_item(WorkItem::new(name, 1)).unwrap();
        }
        assert_eq!(scheduler.get_execution_order(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_dependencies_respected() {
        let mut scheduler = PriorityScheduler::new();
        scheduler
            .add_item(WorkItem::new("review", 0).with_dependencies(["code", "test"]))
            .unwrap();
        scheduler
            .add_item(WorkItem::new("test", 0).with_dependencies(["code"]))
            .unwrap();
        scheduler
            .add_item(WorkItem::new("code", 9).with_dependencies(["design"]))
            .unwrap();
        scheduler.add_item(WorkItem::new("design", 9)).unwrap();
        scheduler.add_item(WorkItem::new("lint", 3)).unwrap();

        let order = scheduler.get_execution_order();
        assert_eq!(order.len(), 5);
        for item in ["review", "test", "code"] {
            let deps = &scheduler.get(item).unwrap().depends_on;
            for dep in deps {
                assert!(position(&order, dep) < position(&order, item));
            }
        }
        // "lint" is ready from the start and beats priority-9 "design".
        assert_eq!(order[0], "lint");
    }

    #[test]
    fn test_cycle_falls_back_to_name_order() {
        let mut scheduler = PriorityScheduler::new();
        scheduler.add_item(WorkItem::new("free", 1)).unwrap();
        scheduler
            .add_item(WorkItem::new("b", 0).with_dependencies(["a"]))
            .unwrap();
        scheduler
            .add_item(WorkItem::new("a", 0).with_dependencies(["b"]))
            .unwrap();

        assert!(scheduler.has_cycle());
        let plan = scheduler.plan();
        assert!(plan.has_cycle());
        assert_eq!(plan.order, vec!["free", "a", "b"]);
        assert_eq!(plan.cycle_fallback, vec!["a", "b"]);
    }

    #[test]
    fn test_totality_on_dense_cycles() {
        let mut scheduler = PriorityScheduler::new();
        let names: Vec<String> = (0..20).map(|i| format!("n{i:02}")).collect();
        for (i, name) in names.iter().enumerate() {
            let next = &names[(i + 1) % names.len()];
            let prev = &names[(i + names.len() - 1) % names.len()];
            scheduler
                .add_item(WorkItem::new(name.clone(), (i % 3) as i64).with_dependencies([next, prev]))
                .unwrap();
        }
        let mut order = scheduler.get_execution_order();
        order.sort();
        assert_eq!(order, names);
    }

    #[test]
    fn test_unknown_dependency_ignored() {
        let mut scheduler = PriorityScheduler::new();
        scheduler
            .add_item(WorkItem::new("a", 0).with_dependencies(["external"]))
            .unwrap();
        let plan = scheduler.plan();
        assert_eq!(plan.order, vec!["a"]);
        assert!(!plan.has_cycle());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut scheduler = PriorityScheduler::new();
        let err = scheduler
            .add_item(WorkItem::new("loop", 0).with_dependencies(["loop"]))
            .unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_add_replaces_and_remove() {
        let mut scheduler = PriorityScheduler::new();
        scheduler.add_item(WorkItem::new("a", 5)).unwrap();
        scheduler.add_item(WorkItem::new("b", 1)).unwrap();
        scheduler
            .add_item(WorkItem::new("a", 0).with_metadata("owner", serde_json::json!("ops")))
            .unwrap();
        assert_eq!(scheduler.len(), 2);
        assert_eq!(scheduler.get_execution_order(), vec!["a", "b"]);
        assert_eq!(scheduler.get("a").unwrap().metadata["owner"], "ops");

        assert!(scheduler.remove_item("a").is_some());
        assert!(scheduler.remove_item("a").is_none());
        assert!(!scheduler.contains("a"));
        assert_eq!(scheduler.get_execution_order(), vec!["b"]);
    }
}
