//! Integration tests for goal updates: file source, watcher and goal table.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ses_events::EventKind;
use ses_node_scheduler::backoff::ReconnectPolicy;
use ses_node_scheduler::goal::{run_goal_watcher, FileGoalSource, SourceEventKind};
use ses_node_scheduler::{GoalSource, NodeGoalManager, SchedulingStatus, SourceEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const SKY_WATCH: &str = r#"
name: sky-watch
plugins:
  - name: cloud-cover
    version: 0.2.1
  - name: rain-gauge
    version: 1.0.0
scienceRules:
  - 'cloud-cover: True'
"#;

const SKY_WATCH_V2: &str = r#"
name: sky-watch
plugins:
  - name: cloud-motion
    version: 0.1.0
"#;

fn write_atomically(path: &Path, content: &str) {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

async fn next(rx: &mut mpsc::Receiver<SourceEvent>) -> SourceEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a goal update")
        .expect("goal watcher stopped")
}

#[tokio::test]
async fn test_file_updates_reach_the_goal_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("goals.yaml");
    let source: Arc<dyn GoalSource> = Arc::new(FileGoalSource::new(
        &path,
        "goals",
        Duration::from_millis(20),
    ));

    let (tx, mut rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = tokio::spawn(run_goal_watcher(
        source,
        tx,
        ReconnectPolicy::fixed(Duration::from_millis(20)),
        shutdown_rx,
    ));

    let mut manager = NodeGoalManager::new("n1", "goals");

    write_atomically(&path, SKY_WATCH);
    let update = next(&mut rx).await;
    assert_eq!(update.kind, SourceEventKind::Added);
    let event = manager.apply_source_event(&update).pop().unwrap();
    assert_eq!(event.kind, EventKind::GoalNew);
    let first_id = manager.get_goal("sky-watch").unwrap().id;

    write_atomically(&path, SKY_WATCH_V2);
    let update = next(&mut rx).await;
    assert_eq!(update.kind, SourceEventKind::Modified);
    let event = manager.apply_source_event(&update).pop().unwrap();
    assert_eq!(event.kind, EventKind::GoalUpdated);

    let goal = manager.get_goal("sky-watch").unwrap();
    assert_ne!(goal.id, first_id);
    let sub_goal = goal.my_sub_goal("n1").unwrap();
    assert_eq!(sub_goal.plugins.len(), 1);
    assert!(sub_goal.get_plugin("cloud-cover").is_none());
    assert!(sub_goal.science_rules.is_empty());

    std::fs::remove_file(&path).unwrap();
    let update = next(&mut rx).await;
    assert_eq!(update.kind, SourceEventKind::Deleted);
    let removed = manager.apply_source_event(&update);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].kind, EventKind::GoalRemoved);
    assert_eq!(removed[0].body, "sky-watch");
    assert!(manager.is_empty());

    shutdown_tx.send(true).unwrap();
    timeout(Duration::from_secs(5), watcher).await.unwrap().unwrap();
}

#[test]
fn test_unparsable_update_leaves_table_unchanged() {
    let mut manager = NodeGoalManager::new("n1", "goals");
    manager
        .apply_source_event(&SourceEvent::new(SourceEventKind::Added, "goals", SKY_WATCH));
    manager
        .find_plugin_mut(Some("sky-watch"), "cloud-cover")
        .unwrap()
        .1
        .status
        .scheduling = SchedulingStatus::Running;
    let before = manager.goals().clone();

    for raw in [
        "name: [unclosed",
        "plugins:\n  - name: cloud-cover\n    version: 0.2.1\n",
        "name: sky-watch\nplugins:\n  - version: 0.2.1\n",
        "name: sky-watch\nplugins:\n  - name: cloud-cover\n    version: 0.2.1\n    resource:\n      cpu: -1\n",
        "",
    ] {
        let update = SourceEvent::new(SourceEventKind::Modified, "goals", raw);
        assert!(manager.apply_source_event(&update).is_empty(), "accepted {raw:?}");
    }

    assert_eq!(manager.goals(), &before);
}

#[test]
fn test_goals_are_independent() {
    let mut manager = NodeGoalManager::new("n1", "goals");
    manager
        .apply_source_event(&SourceEvent::new(SourceEventKind::Added, "goals", SKY_WATCH));
    manager
        .apply_source_event(&SourceEvent::new(
            SourceEventKind::Added,
            "goals",
            "name: rain-watch\nplugins:\n  - name: rain-gauge\n    version: 1.0.0\n",
        ));
    let rain_watch = manager.get_goal("rain-watch").unwrap().clone();

    manager
        .apply_source_event(&SourceEvent::new(SourceEventKind::Modified, "goals", SKY_WATCH_V2));

    assert_eq!(manager.len(), 2);
    assert_eq!(manager.get_goal("rain-watch").unwrap(), &rain_watch);
}
