use serial_test::serial;
use taskprog::{TaskFilter, TaskManager, TaskScope, TaskSpec, TaskStatus};

#[test]
#[serial]
fn test_global_registry_lists_live_tasks() {
    let manager = TaskManager::global();
    let before = manager.task_count();

    let save = manager
        .create_task(TaskSpec::new("Save project").with_scopes([TaskScope::Modal]))
        .unwrap();
    let load = manager
        .create_task(TaskSpec::new("Load plugin").with_scopes([TaskScope::Background]))
        .unwrap();
    load.set_running().unwrap();

    assert_eq!(manager.task_count(), before + 2);
    assert_eq!(
        manager
            .filter_tasks(&TaskFilter::new().with_scopes([TaskScope::Modal]))
            .iter()
            .filter(|task| task.id == save.id())
            .count(),
        1
    );
    assert!(
        manager
            .filter_tasks(&TaskFilter::new().with_statuses([TaskStatus::Running]))
            .iter()
            .any(|task| task.id == load.id())
    );

    drop(save);
    drop(load);
    assert_eq!(manager.task_count(), before);
}

#[test]
#[serial]
fn test_global_statistics_and_export() {
    let manager = TaskManager::global();
    let before = manager.statistics();

    let task = manager
        .create_task(TaskSpec::new("Export dataset").hidden())
        .unwrap();
    task.set_running().unwrap();
    task.set_finished().unwrap();

    let stats = manager.statistics();
    assert_eq!(stats.total_tasks, before.total_tasks + 1);
    assert_eq!(stats.hidden_tasks, before.hidden_tasks + 1);
    assert_eq!(
        stats.count(TaskStatus::Finished),
        before.count(TaskStatus::Finished) + 1
    );
    assert!(stats.total_tasks_created > before.total_tasks_created);

    let json = manager.export_to_json().unwrap();
    assert!(json.contains("Export dataset"));
    assert!(manager.validate_tree_integrity().is_empty());
}
