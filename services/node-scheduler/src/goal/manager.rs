//! The goal table.

use std::collections::BTreeSet;

use ses_events::{Event, EventKind, META_GOAL};
use ses_id::GoalId;
use tracing::{debug, error, info, warn};

use super::{GoalError, GoalTable, SourceEvent, SourceEventKind};
use crate::model::{JobTemplate, Node, Plugin, ScienceGoal, SubGoal};

/// Owns the goals known to this node.
///
/// Lives inside the orchestration loop. Goals are inserted or replaced
/// wholesale from source updates; plugin state inside them is mutated only
/// through the loop.
#[derive(Debug, Clone)]
pub struct NodeGoalManager {
    node_id: String,
    goal_key: String,
    goals: GoalTable,
    /// Names of goals loaded from the watched key.
    sourced: BTreeSet<String>,
}

impl NodeGoalManager {
    pub fn new(node_id: impl Into<String>, goal_key: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            goal_key: goal_key.into(),
            goals: GoalTable::new(),
            sourced: BTreeSet::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Applies one goal source update.
    ///
    /// Returns the resulting table changes: `goal.new` or `goal.updated` for
    /// a loaded template, one `goal.removed` per goal when the watched entry
    /// is deleted. Goals loaded from the entry accumulate until it is
    /// deleted. A malformed update is logged and dropped with the table
    /// untouched.
    pub fn apply_source_event(&mut self, event: &SourceEvent) -> Vec<Event> {
        if event.kind == SourceEventKind::Deleted {
            if self.sourced.is_empty() {
                debug!("Goal source entry deleted, nothing loaded from it");
            }
            let names = std::mem::take(&mut self.sourced);
            return names
                .iter()
                .filter_map(|name| self.remove_goal(name))
                .collect();
        }

        match self.parse_update(event) {
            Ok(template) => {
                self.sourced.insert(template.name.clone());
                let goal = self.convert_job_template(&template);
                vec![self.upsert_goal(goal)]
            }
            Err(e) => {
                error!(error = %e, "Failed to load goal from source update");
                Vec::new()
            }
        }
    }

    fn parse_update(&self, event: &SourceEvent) -> Result<JobTemplate, GoalError> {
        let raw = event
            .data
            .get(&self.goal_key)
            .ok_or_else(|| GoalError::MissingKey(self.goal_key.clone()))?;
        JobTemplate::from_yaml(raw)
    }

    /// Builds a fresh goal with one sub-goal bound to this node.
    pub fn convert_job_template(&self, job: &JobTemplate) -> ScienceGoal {
        let mut sub_goal = SubGoal::new(Node::new(self.node_id.as_str()));
        sub_goal.plugins = job.plugins.iter().cloned().map(Plugin::new).collect();
        sub_goal.science_rules = job.science_rules.clone();

        ScienceGoal {
            id: GoalId::new(),
            name: job.name.clone(),
            sub_goals: vec![sub_goal],
        }
    }

    /// Inserts or replaces a goal by name.
    pub fn upsert_goal(&mut self, goal: ScienceGoal) -> Event {
        let name = goal.name.clone();
        let id = goal.id;
        let plugins = goal
            .my_sub_goal(&self.node_id)
            .map_or(0, |s| s.plugins.len());

        let kind = match self.goals.insert(name.clone(), goal) {
            Some(_) => EventKind::GoalUpdated,
            None => EventKind::GoalNew,
        };
        info!(goal = %name, goal_id = %id, plugins, event = %kind, "Received a goal");

        Event::new(kind, name.as_str()).with_meta(META_GOAL, id.to_string())
    }

    /// Removes a goal by name or id.
    pub fn remove_goal(&mut self, name_or_id: &str) -> Option<Event> {
        let key = self.resolve_key(name_or_id)?;
        let goal = self.goals.remove(&key)?;
        info!(goal = %goal.name, goal_id = %goal.id, "Removed goal");
        Some(Event::new(EventKind::GoalRemoved, goal.name).with_meta(META_GOAL, goal.id.to_string()))
    }

    fn resolve_key(&self, name_or_id: &str) -> Option<String> {
        if self.goals.contains_key(name_or_id) {
            return Some(name_or_id.to_string());
        }
        self.goals
            .values()
            .find(|g| g.is_referenced_by(name_or_id))
            .map(|g| g.name.clone())
    }

    /// Looks a goal up by name or id.
    pub fn get_goal(&self, name_or_id: &str) -> Option<&ScienceGoal> {
        self.goals
            .get(name_or_id)
            .or_else(|| self.goals.values().find(|g| g.is_referenced_by(name_or_id)))
    }

    pub fn goals(&self) -> &GoalTable {
        &self.goals
    }

    /// This node's sub-goals, for promotion passes.
    pub fn local_sub_goals_mut(&mut self) -> impl Iterator<Item = &mut SubGoal> + '_ {
        let node_id = self.node_id.as_str();
        self.goals
            .values_mut()
            .filter_map(move |g| g.my_sub_goal_mut(node_id))
    }

    /// Finds this node's copy of `plugin_name`.
    ///
    /// With a goal reference only that goal is searched; a reference to an
    /// unknown goal resolves to nothing. Without one, every goal is scanned
    /// in name order. Returns the owning goal's name with the plugin.
    pub fn find_plugin_mut(
        &mut self,
        goal: Option<&str>,
        plugin_name: &str,
    ) -> Option<(String, &mut Plugin)> {
        let node_id = self.node_id.as_str();
        match goal {
            Some(reference) => {
                let key = self
                    .goals
                    .values()
                    .find(|g| g.is_referenced_by(reference))
                    .map(|g| g.name.clone());
                let Some(key) = key else {
                    warn!(goal = %reference, plugin = %plugin_name, "Event references an unknown goal");
                    return None;
                };
                let plugin = self
                    .goals
                    .get_mut(&key)?
                    .my_sub_goal_mut(node_id)?
                    .get_plugin_mut(plugin_name)?;
                Some((key, plugin))
            }
            None => self.goals.iter_mut().find_map(|(name, g)| {
                g.my_sub_goal_mut(node_id)
                    .and_then(|s| s.get_plugin_mut(plugin_name))
                    .map(|p| (name.clone(), p))
            }),
        }
    }

    /// Clones of every goal, for the status surface.
    pub fn snapshot(&self) -> Vec<ScienceGoal> {
        self.goals.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.goals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SchedulingStatus;

    const TEMPLATE: &str = "name: sky-watch\nplugins:\n  - name: cloud-cover\n    version: 0.2.1\n  - name: rain-gauge\n    version: 1.0.0\nscienceRules:\n  - 'cloud-cover: True'\n";

    fn test_manager() -> NodeGoalManager {
        NodeGoalManager::new("n1", "goals")
    }

    fn modified(raw: &str) -> SourceEvent {
        SourceEvent::new(SourceEventKind::Modified, "goals", raw)
    }

    #[test]
    fn test_new_goal() {
        let mut manager = test_manager();
        let event = manager
            .apply_source_event(&SourceEvent::new(SourceEventKind::Added, "goals", TEMPLATE))
            .pop()
            .unwrap();
        assert_eq!(event.kind, EventKind::GoalNew);
        assert_eq!(event.body, "sky-watch");

        let goal = manager.get_goal("sky-watch").unwrap();
        assert_eq!(event.goal(), Some(goal.id.to_string().as_str()));
        assert_eq!(goal.sub_goals.len(), 1);
        let sub_goal = goal.my_sub_goal("n1").unwrap();
        assert_eq!(sub_goal.plugins.len(), 2);
        assert_eq!(sub_goal.science_rules, vec!["cloud-cover: True"]);
        assert!(sub_goal
            .plugins
            .iter()
            .all(|p| p.scheduling() == SchedulingStatus::Waiting));
    }

    #[test]
    fn test_update_replaces_wholesale_with_fresh_id() {
        let mut manager = test_manager();
        manager.apply_source_event(&modified(TEMPLATE));
        let first_id = manager.get_goal("sky-watch").unwrap().id;
        manager
            .find_plugin_mut(None, "cloud-cover")
            .unwrap()
            .1
            .apply(crate::transition::Transition::Promote)
            .unwrap();

        let event = manager
            .apply_source_event(&modified(
                "name: sky-watch\nplugins:\n  - name: cloud-cover\n    version: 0.3.0\n",
            ))
            .pop()
            .unwrap();
        assert_eq!(event.kind, EventKind::GoalUpdated);
        assert_eq!(manager.len(), 1);

        let goal = manager.get_goal("sky-watch").unwrap();
        assert_ne!(goal.id, first_id);
        let plugin = goal.my_sub_goal("n1").unwrap().get_plugin("cloud-cover").unwrap();
        assert_eq!(plugin.spec.version, "0.3.0");
        assert_eq!(plugin.scheduling(), SchedulingStatus::Waiting);
    }

    #[test]
    fn test_malformed_update_leaves_table_untouched() {
        let mut manager = test_manager();
        manager.apply_source_event(&modified(TEMPLATE));
        let before = manager.goals().clone();

        assert!(manager.apply_source_event(&modified("name: [oops")).is_empty());
        assert!(manager.apply_source_event(&modified("plugins: []")).is_empty());
        assert!(manager
            .apply_source_event(&SourceEvent::new(SourceEventKind::Modified, "other", TEMPLATE))
            .is_empty());
        assert_eq!(manager.goals(), &before);
    }

    #[test]
    fn test_deleted_removes_sourced_goals() {
        let mut manager = test_manager();
        assert!(manager.apply_source_event(&SourceEvent::deleted()).is_empty());

        manager.apply_source_event(&modified(TEMPLATE));
        manager.apply_source_event(&modified(
            "name: rain-watch\nplugins:\n  - name: rain-gauge\n    version: 1.0.0\n",
        ));
        let local = manager.convert_job_template(
            &JobTemplate::from_yaml("name: local\nplugins:\n  - name: thermal\n    version: 1.0.0\n")
                .unwrap(),
        );
        manager.upsert_goal(local);

        let removed = manager.apply_source_event(&SourceEvent::deleted());
        let names: Vec<_> = removed.iter().map(|e| e.body.as_str()).collect();
        assert_eq!(names, vec!["rain-watch", "sky-watch"]);
        assert!(removed.iter().all(|e| e.kind == EventKind::GoalRemoved));
        assert_eq!(manager.len(), 1);
        assert!(manager.get_goal("local").is_some());

        assert!(manager.apply_source_event(&SourceEvent::deleted()).is_empty());
    }

    #[test]
    fn test_lookup_by_id_and_remove() {
        let mut manager = test_manager();
        manager.apply_source_event(&modified(TEMPLATE));
        let id = manager.get_goal("sky-watch").unwrap().id.to_string();

        assert!(manager.get_goal(&id).is_some());
        assert!(manager.get_goal("rain-watch").is_none());

        let event = manager.remove_goal(&id).unwrap();
        assert_eq!(event.kind, EventKind::GoalRemoved);
        assert_eq!(event.body, "sky-watch");
        assert!(manager.is_empty());
        assert!(manager.remove_goal("sky-watch").is_none());
    }

    #[test]
    fn test_find_plugin() {
        let mut manager = test_manager();
        manager.apply_source_event(&modified(TEMPLATE));
        manager
            .apply_source_event(&modified(
                "name: rain-watch\nplugins:\n  - name: rain-gauge\n    version: 1.0.0\n",
            ));

        let (goal, _) = manager.find_plugin_mut(Some("rain-watch"), "Rain-Gauge").unwrap();
        assert_eq!(goal, "rain-watch");

        let (goal, _) = manager.find_plugin_mut(None, "rain-gauge").unwrap();
        assert_eq!(goal, "rain-watch");

        assert!(manager.find_plugin_mut(Some("goal_01HV4Z2WQXKJNM8GPQY6VBKC3D"), "rain-gauge").is_none());
        assert!(manager.find_plugin_mut(Some("sky-watch"), "thermal").is_none());
        assert!(manager.find_plugin_mut(None, "thermal").is_none());
    }

    #[test]
    fn test_local_sub_goals() {
        let mut manager = test_manager();
        manager.apply_source_event(&modified(TEMPLATE));
        assert_eq!(manager.local_sub_goals_mut().count(), 1);
    }
}
