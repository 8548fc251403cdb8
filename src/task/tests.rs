#[cfg(test)]
mod tests {
    use crate::config::TaskManagerConfig;
    use crate::task::handle::*;
    use crate::task::manager::*;
    use crate::task::registry::*;
    use crate::task::types::*;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn drain(events: &mut UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = events.try_recv() {
            drained.push(event);
        }
        drained
    }

    fn create(manager: &TaskManager, name: &str) -> Task {
        manager.create_task(TaskSpec::new(name)).unwrap()
    }

    fn create_child(manager: &TaskManager, name: &str, parent: &TaskHandle) -> Task {
        manager
            .create_task(TaskSpec::new(name).with_parent(parent.id()))
            .unwrap()
    }

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_task_creation_defaults() {
        let manager = TaskManager::default();
        let task = manager
            .create_task(TaskSpec::new("Load dataset").with_description("Reads a CSV file"))
            .unwrap();

        assert_eq!(task.name(), "Load dataset");
        assert_eq!(task.description(), "Reads a CSV file");
        assert!(task.is_undefined());
        assert_eq!(task.progress(), 0.0);
        assert_eq!(task.progress_mode(), ProgressMode::Manual);
        assert!(task.is_enabled());
        assert!(task.is_visible());
        assert!(!task.may_kill());
        assert!(task.has_scope(TaskScope::None));
        assert!(task.parent_task().is_none());
        assert_eq!(task.progress_text(), "Undefined");
        assert_eq!(manager.task_count(), 1);
    }

    #[test]
    fn test_repeated_finished_is_noop() {
        let manager = TaskManager::default();
        let task = create(&manager, "Export");

        task.set_running().unwrap();
        task.set_finished().unwrap();
        assert!(task.is_finished());
        assert_eq!(task.progress(), 1.0);

        let mut events = manager.subscribe();
        task.set_finished().unwrap();

        assert!(task.is_finished());
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_finished_rejected_after_aborted() {
        let manager = TaskManager::default();
        let task = create(&manager, "Export");

        task.set_running().unwrap();
        task.set_aborted().unwrap();
        task.set_finished().unwrap();

        assert!(task.is_aborted());

        task.set_idle().unwrap();
        assert!(task.is_idle());
    }

    #[test]
    fn test_status_change_emits_previous_and_current() {
        let manager = TaskManager::default();
        let task = create(&manager, "Import");
        let mut events = manager.subscribe();

        task.set_running().unwrap();

        let events = drain(&mut events);
        assert!(events.contains(&TaskEvent::StatusChanged {
            task_id: task.id(),
            previous: TaskStatus::Undefined,
            current: TaskStatus::Running,
        }));
        assert!(events.contains(&TaskEvent::ProgressTextChanged {
            task_id: task.id(),
            text: "0.0%".to_string(),
        }));
    }

    #[test]
    fn test_aggregate_parent_follows_children() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let children: Vec<Task> = (0..3)
            .map(|i| create_child(&manager, &format!("Dataset {}", i), &parent))
            .collect();

        assert_eq!(parent.progress_mode(), ProgressMode::Aggregate);
        assert!(parent.is_idle());

        children[0].set_running().unwrap();
        assert!(parent.is_running());

        children[0].set_progress(0.5, None).unwrap();
        assert_close(parent.progress(), 0.5 / 3.0);

        for child in &children {
            child.set_running().unwrap();
            child.set_finished().unwrap();
        }

        assert!(parent.is_finished());
        assert_eq!(parent.progress(), 1.0);
    }

    #[test]
    fn test_aggregate_ignores_direct_status_and_progress() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let child = create_child(&manager, "Dataset", &parent);

        child.set_running().unwrap();
        parent.set_finished().unwrap();
        parent.set_progress(0.9, None).unwrap();

        assert!(parent.is_running());
        assert_eq!(parent.progress(), 0.0);
        assert!(child.is_running());
    }

    #[test]
    fn test_aggregate_propagates_upward() {
        let manager = TaskManager::default();
        let root = create(&manager, "Root");
        let middle = create_child(&manager, "Middle", &root);
        let leaf = create_child(&manager, "Leaf", &middle);

        leaf.set_running().unwrap();
        leaf.set_progress(0.4, None).unwrap();

        assert!(middle.is_running());
        assert!(root.is_running());
        assert_close(middle.progress(), 0.4);
        assert_close(root.progress(), 0.4);

        leaf.set_aborted().unwrap();
        assert!(root.is_aborted());
    }

    #[test]
    fn test_aggregate_precedence_of_aborting() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let first = create_child(&manager, "First", &parent);
        let second = create_child(&manager, "Second", &parent);

        first.set_running().unwrap();
        second.set_aborting().unwrap();
        assert!(parent.is_aborting());

        second.set_about_to_be_aborted().unwrap();
        assert!(parent.is_about_to_be_aborted());
    }

    #[test]
    fn test_disabled_children_do_not_participate() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let finished = create_child(&manager, "Finished", &parent);
        let stalled = create_child(&manager, "Stalled", &parent);

        finished.set_running().unwrap();
        finished.set_finished().unwrap();
        stalled.set_running().unwrap();
        assert!(parent.is_running());

        stalled.set_enabled(false, false).unwrap();
        assert!(parent.is_finished());
        assert_eq!(parent.progress(), 1.0);

        finished.set_enabled(false, false).unwrap();
        assert!(parent.is_idle());
        assert_eq!(parent.progress(), 0.0);
    }

    #[test]
    fn test_subtasks_progress() {
        let manager = TaskManager::default();
        let task = create(&manager, "Compute");
        task.set_subtasks(4).unwrap();
        assert_eq!(task.progress_mode(), ProgressMode::Subtasks);

        task.set_subtask_finished(0, None).unwrap();
        task.set_subtask_finished(2, None).unwrap();
        assert_eq!(task.progress(), 0.5);
        assert_eq!(task.finished_subtasks(), vec![true, false, true, false]);

        let mut events = manager.subscribe();
        task.set_subtask_finished(0, None).unwrap();
        assert_eq!(task.progress(), 0.5);
        assert!(!drain(&mut events)
            .iter()
            .any(|event| matches!(event, TaskEvent::SubtaskFinished { .. })));

        task.set_subtask_finished(7, None).unwrap();
        assert_eq!(task.progress(), 0.5);
    }

    #[test]
    fn test_subtasks_by_name_update_description() {
        let manager = TaskManager::default();
        let task = create(&manager, "Import");
        task.set_subtasks_named(["Read header", "Read points", "Build index"])
            .unwrap();
        task.set_running().unwrap();

        assert_eq!(task.subtask_index("Read points"), Some(1));
        assert_eq!(task.subtask_index("Missing"), None);

        task.set_subtask_started("Read points", None).unwrap();
        assert_eq!(task.progress_description(), "Read points");

        task.set_subtask_finished("Read points", Some("Points loaded"))
            .unwrap();
        assert_eq!(task.progress_description(), "Points loaded");
        assert_close(task.progress(), 1.0 / 3.0);
        assert_eq!(task.progress_text(), "Points loaded 33.3%");

        task.set_subtask_finished("Missing", None).unwrap();
        assert_close(task.progress(), 1.0 / 3.0);

        task.set_subtask_name(2, "Write index").unwrap();
        assert_eq!(
            task.subtask_names(),
            vec!["Read header", "Read points", "Write index"]
        );
    }

    #[test]
    fn test_subtask_calls_ignored_outside_subtasks_mode() {
        let manager = TaskManager::default();
        let task = create(&manager, "Manual");

        task.set_subtask_finished(0, Some("Nothing")).unwrap();
        assert_eq!(task.progress(), 0.0);
        assert_eq!(task.progress_description(), "");
    }

    #[test]
    fn test_manual_progress_is_clamped() {
        let manager = TaskManager::default();
        let task = create(&manager, "Copy");
        task.set_running().unwrap();

        task.set_progress(1.7, None).unwrap();
        assert_eq!(task.progress(), 1.0);

        task.set_progress(-3.0, None).unwrap();
        assert_eq!(task.progress(), 0.0);

        task.set_progress(0.25, Some("Copying")).unwrap();
        task.set_progress(f32::NAN, None).unwrap();
        assert_eq!(task.progress(), 0.25);
        assert_eq!(task.progress_text(), "Copying 25.0%");
    }

    #[test]
    fn test_progress_text_per_status() {
        let manager = TaskManager::default();
        let task = create(&manager, "Render");

        task.set_running_indeterminate().unwrap();
        assert_eq!(task.progress_text(), "Running...");

        task.set_aborting().unwrap();
        assert_eq!(task.progress_text(), "Aborting...");

        task.set_idle().unwrap();
        task.set_progress_description("Waiting for input", None)
            .unwrap();
        assert_eq!(task.progress_text(), "Waiting for input");
    }

    #[test]
    fn test_custom_progress_text_formatter() {
        let manager = TaskManager::default();
        let task = create(&manager, "Copy");

        task.set_progress_text_formatter(Some(ProgressTextFormatter::new(|snapshot| {
            format!("{}: {:.0}%", snapshot.name, snapshot.progress * 100.0)
        })))
        .unwrap();
        task.set_progress(0.42, None).unwrap();
        assert_eq!(task.progress_text(), "Copy: 42%");

        task.set_progress_text_formatter(None).unwrap();
        assert_eq!(task.progress_text(), "Undefined");
    }

    #[test]
    fn test_formatter_may_read_other_tasks() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let first = create_child(&manager, "First", &parent);
        let second = create_child(&manager, "Second", &parent);
        let mut events = manager.subscribe();

        let peer = parent.handle();
        parent
            .set_progress_text_formatter(Some(ProgressTextFormatter::new(move |_| {
                format!("{} children", peer.child_tasks(false, false).len())
            })))
            .unwrap();

        assert_eq!(parent.progress_text(), "2 children");
        assert!(drain(&mut events).contains(&TaskEvent::ProgressTextChanged {
            task_id: parent.id(),
            text: "2 children".to_string(),
        }));

        drop(second);
        assert_eq!(parent.progress_text(), "1 children");
        assert!(first.exists());
        assert_eq!(manager.task_count(), 2);
    }

    #[test]
    fn test_formatter_receives_standard_text() {
        let manager = TaskManager::default();
        let task = create(&manager, "Copy");
        task.set_running().unwrap();

        task.set_progress_text_formatter(Some(ProgressTextFormatter::new(|snapshot| {
            format!("[{}]", snapshot.progress_text)
        })))
        .unwrap();
        task.set_progress(0.5, None).unwrap();
        assert_eq!(task.progress_text(), "[50.0%]");

        task.set_progress(0.75, None).unwrap();
        assert_eq!(task.progress_text(), "[75.0%]");
        assert_eq!(task.snapshot().unwrap().progress_text, "[75.0%]");
    }

    #[test]
    fn test_kill_requires_may_kill() {
        let manager = TaskManager::default();
        let task = create(&manager, "Export");
        task.set_running().unwrap();

        task.kill(false).unwrap();
        assert!(task.is_running());
        assert!(!task.abort_requested());
    }

    #[test]
    fn test_kill_requires_running_status() {
        let manager = TaskManager::default();
        let task = manager
            .create_task(TaskSpec::new("Export").with_may_kill(true))
            .unwrap();

        assert!(!task.is_killable());
        task.kill(false).unwrap();
        assert!(task.is_undefined());
        assert!(!task.abort_requested());
    }

    #[test]
    fn test_kill_cancels_token_and_emits_abort_requested() {
        let manager = TaskManager::default();
        let task = manager
            .create_task(TaskSpec::new("Export").with_may_kill(true))
            .unwrap();
        let token = task.cancellation_token();

        let mut events = manager.subscribe();
        task.set_running().unwrap();
        assert!(task.is_killable());

        task.kill(false).unwrap();
        assert!(task.is_about_to_be_aborted());
        assert!(token.is_cancelled());

        let events = drain(&mut events);
        assert!(events.contains(&TaskEvent::KillableChanged {
            task_id: task.id(),
            killable: true,
        }));
        assert!(events.contains(&TaskEvent::AbortRequested { task_id: task.id() }));
    }

    #[test]
    fn test_recursive_kill_is_guarded_per_task() {
        let manager = TaskManager::default();
        let parent = manager
            .create_task(TaskSpec::new("Project").with_may_kill(true))
            .unwrap();
        let killable = manager
            .create_task(
                TaskSpec::new("Killable")
                    .with_may_kill(true)
                    .with_parent(parent.id()),
            )
            .unwrap();
        let stubborn = create_child(&manager, "Stubborn", &parent);

        killable.set_running().unwrap();
        stubborn.set_running().unwrap();
        assert!(parent.is_killable());

        parent.kill(true).unwrap();

        assert!(parent.abort_requested());
        assert!(killable.is_about_to_be_aborted());
        assert!(killable.abort_requested());
        assert!(stubborn.is_running());
        assert!(!stubborn.abort_requested());
        assert!(parent.is_about_to_be_aborted());
    }

    #[test]
    fn test_reset_recursive() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let child = manager
            .create_task(
                TaskSpec::new("Worker")
                    .with_may_kill(true)
                    .with_parent(parent.id()),
            )
            .unwrap();

        child.set_running().unwrap();
        child.set_progress(0.6, Some("Working")).unwrap();
        child.kill(false).unwrap();
        assert!(child.abort_requested());

        parent.reset(true).unwrap();

        assert!(child.is_idle());
        assert_eq!(child.progress(), 0.0);
        assert_eq!(child.progress_description(), "");
        assert!(!child.abort_requested());
        assert!(parent.is_idle());
        assert_eq!(parent.progress(), 0.0);
    }

    #[test]
    fn test_reset_clears_subtask_bits() {
        let manager = TaskManager::default();
        let task = create(&manager, "Compute");
        task.set_subtasks(2).unwrap();
        task.set_subtask_finished(1, None).unwrap();
        task.set_running().unwrap();

        task.reset(false).unwrap();

        assert!(task.is_idle());
        assert_eq!(task.finished_subtasks(), vec![false, false]);
        assert_eq!(task.progress_mode(), ProgressMode::Subtasks);
    }

    #[test]
    fn test_reset_aggregate_keeps_following_children() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let child = create_child(&manager, "Dataset", &parent);
        child.set_running().unwrap();
        child.set_progress(0.4, None).unwrap();
        parent
            .set_progress_description("Importing", None)
            .unwrap();

        let mut events = manager.subscribe();
        parent.reset(false).unwrap();

        let events = drain(&mut events);
        assert!(!events.iter().any(|event| matches!(
            event,
            TaskEvent::StatusChanged { task_id, .. } | TaskEvent::ProgressChanged { task_id, .. }
                if *task_id == parent.id()
        )));
        assert!(events.contains(&TaskEvent::ProgressDescriptionChanged {
            task_id: parent.id(),
            description: String::new(),
        }));
        assert!(parent.is_running());
        assert_close(parent.progress(), 0.4);
        assert!(child.is_running());
    }

    #[test]
    fn test_recursive_status_and_flags() {
        let manager = TaskManager::default();
        let root = create(&manager, "Root");
        let child = create_child(&manager, "Child", &root);
        let grandchild = create_child(&manager, "Grandchild", &child);

        root.set_may_kill(true, true).unwrap();
        assert!(child.may_kill());
        assert!(grandchild.may_kill());

        root.set_status(TaskStatus::Running, true).unwrap();
        assert!(grandchild.is_running());
        assert!(root.is_running());

        root.set_enabled(false, true).unwrap();
        assert!(!child.is_enabled());
        assert!(!grandchild.is_enabled());
    }

    #[test]
    fn test_cycle_is_rejected_and_tree_unchanged() {
        let manager = TaskManager::default();
        let b = create(&manager, "B");
        let a = create_child(&manager, "A", &b);

        let result = b.set_parent_task(Some(&a.handle()));
        assert_eq!(
            result,
            Err(TaskEngineError::Cycle {
                task: b.id(),
                parent: a.id(),
            })
        );

        assert!(b.parent_task().is_none());
        assert_eq!(a.parent_task(), Some(b.handle()));
        assert_eq!(b.child_tasks(false, false), vec![a.handle()]);
        assert!(manager.validate_tree_integrity().is_empty());
    }

    #[test]
    fn test_self_parent_and_foreign_parent_rejected() {
        let manager = TaskManager::default();
        let other_manager = TaskManager::default();
        let task = create(&manager, "Task");
        let foreign = create(&other_manager, "Foreign");

        assert_eq!(
            task.set_parent_task(Some(&task.handle())),
            Err(TaskEngineError::SelfParent(task.id()))
        );
        assert_eq!(
            task.set_parent_task(Some(&foreign.handle())),
            Err(TaskEngineError::ForeignTask(foreign.id()))
        );
    }

    #[test]
    fn test_reparenting_moves_child() {
        let manager = TaskManager::default();
        let first = create(&manager, "First");
        let second = create(&manager, "Second");
        let child = create_child(&manager, "Child", &first);
        child.set_running().unwrap();
        assert!(first.is_running());

        let mut events = manager.subscribe();
        child.set_parent_task(Some(&second.handle())).unwrap();

        assert!(first.child_tasks(false, false).is_empty());
        assert_eq!(second.child_tasks(false, false), vec![child.handle()]);
        assert!(first.is_idle());
        assert!(second.is_running());

        let events = drain(&mut events);
        let position = |wanted: &TaskEvent| events.iter().position(|event| event == wanted);
        let about_to_be_removed = position(&TaskEvent::ChildTaskAboutToBeRemoved {
            task_id: first.id(),
            child_id: child.id(),
        });
        let removed = position(&TaskEvent::ChildTaskRemoved {
            task_id: first.id(),
            child_id: child.id(),
        });
        assert!(about_to_be_removed.is_some());
        assert!(about_to_be_removed < removed);
        assert!(events.contains(&TaskEvent::ChildTaskAdded {
            task_id: second.id(),
            child_id: child.id(),
        }));
        assert!(events.contains(&TaskEvent::ParentTaskChanged {
            task_id: child.id(),
            previous: Some(first.id()),
            current: Some(second.id()),
        }));

        child.set_parent_task(None).unwrap();
        assert!(child.parent_task().is_none());
        assert!(second.is_idle());
    }

    #[test]
    fn test_child_tasks_order_and_enabled_only() {
        let manager = TaskManager::default();
        let root = create(&manager, "Root");
        let first = create_child(&manager, "First", &root);
        let nested = create_child(&manager, "Nested", &first);
        let second = create_child(&manager, "Second", &root);
        let hidden_subtree = create_child(&manager, "Hidden subtree", &second);

        assert_eq!(
            root.child_tasks(false, false),
            vec![first.handle(), second.handle()]
        );
        assert_eq!(
            root.child_tasks(true, false),
            vec![
                first.handle(),
                nested.handle(),
                second.handle(),
                hidden_subtree.handle()
            ]
        );

        second.set_enabled(false, false).unwrap();
        assert_eq!(
            root.child_tasks(true, true),
            vec![first.handle(), nested.handle()]
        );
    }

    #[test]
    fn test_child_tasks_for_statuses_and_scopes() {
        let manager = TaskManager::default();
        let root = create(&manager, "Root");
        let background = manager
            .create_task(
                TaskSpec::new("Background")
                    .with_parent(root.id())
                    .with_scopes([TaskScope::Background]),
            )
            .unwrap();
        let modal = manager
            .create_task(
                TaskSpec::new("Modal")
                    .with_parent(root.id())
                    .with_scopes([TaskScope::Modal]),
            )
            .unwrap();
        background.set_running().unwrap();

        assert_eq!(
            root.child_tasks_for(false, false, &[TaskStatus::Running], &[]),
            vec![background.handle()]
        );
        assert_eq!(
            root.child_tasks_for(false, false, &[], &[TaskScope::Modal]),
            vec![modal.handle()]
        );
        assert_eq!(root.child_tasks_for(false, false, &[], &[]).len(), 2);
    }

    #[test]
    fn test_drop_detaches_and_unregisters() {
        let manager = TaskManager::default();
        let parent = create(&manager, "Project");
        let child = create_child(&manager, "Dataset", &parent);
        let grandchild = create_child(&manager, "Points", &child);
        let child_id = child.id();
        let handle = child.handle();

        let mut events = manager.subscribe();
        drop(child);

        let events = drain(&mut events);
        let about_to_be_removed = events.iter().position(|event| {
            *event
                == TaskEvent::ChildTaskAboutToBeRemoved {
                    task_id: parent.id(),
                    child_id,
                }
        });
        let removed = events.iter().position(|event| {
            *event
                == TaskEvent::ChildTaskRemoved {
                    task_id: parent.id(),
                    child_id,
                }
        });
        assert!(about_to_be_removed.is_some());
        assert!(about_to_be_removed < removed);
        assert!(events.contains(&TaskEvent::TaskDestroyed { task_id: child_id }));

        assert!(!handle.exists());
        assert!(parent.child_tasks(false, false).is_empty());
        assert!(grandchild.parent_task().is_none());
        assert!(manager.tasks().iter().all(|task| task.id != child_id));
        assert_eq!(manager.task_count(), 2);
        assert!(manager.validate_tree_integrity().is_empty());
    }

    #[test]
    fn test_destroyed_task_accessors_and_mutators() {
        let manager = TaskManager::default();
        let task = create(&manager, "Short lived");
        let handle = task.handle();
        drop(task);

        assert_eq!(handle.status(), TaskStatus::Undefined);
        assert_eq!(handle.progress_text(), "");
        assert!(handle.snapshot().is_none());
        assert!(handle.abort_requested());
        assert_eq!(
            handle.set_running(),
            Err(TaskEngineError::TaskNotFound(handle.id()))
        );
    }

    #[test]
    fn test_create_with_unknown_parent_fails() {
        let manager = TaskManager::default();
        let missing = uuid::Uuid::new_v4();

        let result = manager.create_task(TaskSpec::new("Orphan").with_parent(missing));
        assert!(matches!(result, Err(TaskEngineError::TaskNotFound(id)) if id == missing));
        assert_eq!(manager.task_count(), 0);
    }

    #[test]
    fn test_scopes_and_flags_emit_events() {
        let manager = TaskManager::default();
        let task = create(&manager, "Save project");
        let mut events = manager.subscribe();

        task.add_scope(TaskScope::Modal).unwrap();
        task.remove_scope(TaskScope::None).unwrap();
        task.set_visible(false).unwrap();
        task.set_name("Save workspace").unwrap();

        assert_eq!(task.scopes().into_iter().collect::<Vec<_>>(), vec![TaskScope::Modal]);
        let emitted = drain(&mut events);
        assert!(emitted.contains(&TaskEvent::VisibleChanged {
            task_id: task.id(),
            visible: false,
        }));
        assert!(emitted.contains(&TaskEvent::NameChanged {
            task_id: task.id(),
            name: "Save workspace".to_string(),
        }));
        assert_eq!(
            emitted
                .iter()
                .filter(|event| matches!(event, TaskEvent::ScopesChanged { .. }))
                .count(),
            2
        );

        task.add_scope(TaskScope::Modal).unwrap();
        assert!(drain(&mut events).is_empty());
    }

    #[test]
    fn test_filter_and_statistics() {
        let manager = TaskManager::default();
        let root = manager
            .create_task(TaskSpec::new("Project").with_scopes([TaskScope::Foreground]))
            .unwrap();
        let running = create_child(&manager, "Load points", &root);
        let hidden = manager
            .create_task(TaskSpec::new("Cache").hidden().with_parent(root.id()))
            .unwrap();
        let _standalone = create(&manager, "Standalone");
        running.set_running().unwrap();
        hidden.set_running().unwrap();
        hidden.set_finished().unwrap();

        let names = |filter: TaskFilter| -> Vec<String> {
            manager
                .filter_tasks(&filter)
                .into_iter()
                .map(|task| task.name)
                .collect()
        };

        assert_eq!(names(TaskFilter::new().top_level_only()), vec!["Project", "Standalone"]);
        assert_eq!(
            names(TaskFilter::new().with_statuses([TaskStatus::Running])),
            vec!["Project", "Load points"]
        );
        assert_eq!(
            names(TaskFilter::new().with_parent_name("Proj").hide_hidden()),
            vec!["Load points"]
        );
        assert_eq!(
            names(TaskFilter::new().with_scopes([TaskScope::Foreground])),
            vec!["Project"]
        );
        assert_eq!(names(TaskFilter::new().with_name_containing("Cache")), vec!["Cache"]);

        let stats = manager.statistics();
        assert_eq!(stats.total_tasks, 4);
        assert_eq!(stats.total_tasks_created, 4);
        assert_eq!(stats.top_level_tasks, 2);
        assert_eq!(stats.hidden_tasks, 1);
        assert_eq!(stats.running_tasks(), 2);
        assert_eq!(stats.count(TaskStatus::Finished), 1);
        assert_eq!(stats.completion_percentage, 25.0);
    }

    #[test]
    fn test_export_to_json() {
        let manager = TaskManager::default();
        let task = create(&manager, "Export me");
        task.set_running().unwrap();

        let json = manager.export_to_json().unwrap();
        let exported: Vec<TaskSnapshot> = serde_json::from_str(&json).unwrap();

        assert_eq!(exported.len(), 1);
        assert_eq!(exported[0].id, task.id());
        assert_eq!(exported[0].status, TaskStatus::Running);
    }

    #[test]
    fn test_cross_context_mutation_is_queued() {
        let manager = TaskManager::default();
        let task = create(&manager, "Remote");
        let handle = task.handle();

        std::thread::spawn(move || {
            handle.set_progress(0.3, None).unwrap();
            handle.set_progress(0.7, None).unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(task.progress(), 0.0);
        assert_eq!(manager.pending_events(), 2);

        assert_eq!(manager.process_events(), 2);
        assert_close(task.progress(), 0.7);
        assert_eq!(manager.pending_events(), 0);
    }

    #[test]
    fn test_logging_handler_accepts_events() {
        let handler = LoggingEventHandler;
        let task_id = uuid::Uuid::new_v4();

        assert!(handler
            .handle_event(&TaskEvent::AbortRequested { task_id })
            .is_ok());
        assert!(handler
            .handle_event(&TaskEvent::ProgressChanged {
                task_id,
                progress: 0.5,
            })
            .is_ok());
    }

    #[test]
    fn test_failing_handler_does_not_block_others() {
        struct FailingHandler;

        impl TaskEventHandler for FailingHandler {
            fn handle_event(&self, _event: &TaskEvent) -> anyhow::Result<()> {
                Err(anyhow::anyhow!("handler failure"))
            }
        }

        let manager = TaskManager::new(TaskManagerConfig {
            log_events: true,
            ..Default::default()
        });
        manager.add_event_handler(Box::new(FailingHandler));
        let mut events = manager.subscribe();

        let task = create(&manager, "Resilient");
        task.set_running().unwrap();

        assert!(!drain(&mut events).is_empty());
        assert!(task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_deferred_status_wins() {
        let manager = TaskManager::default();
        let task = create(&manager, "Debounced");
        task.set_running().unwrap();

        task.set_status_deferred(TaskStatus::Finished, false, Some(Duration::from_millis(100)))
            .unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        task.set_status_deferred(TaskStatus::Idle, false, Some(Duration::from_millis(50)))
            .unwrap();

        tokio::time::advance(Duration::from_millis(40)).await;
        manager.process_events();
        assert!(task.is_running());

        tokio::time::advance(Duration::from_millis(100)).await;
        manager.process_events();
        assert!(task.is_idle());
        assert!(manager.next_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_status_cancels_deferred() {
        let manager = TaskManager::default();
        let task = create(&manager, "Debounced");
        task.set_running().unwrap();

        task.set_status_deferred(TaskStatus::Idle, false, None).unwrap();
        assert!(manager.next_deadline().is_some());

        task.set_finished().unwrap();
        assert!(manager.next_deadline().is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        manager.process_events();
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_description_lingers_after_finish() {
        let manager = TaskManager::default();
        let task = create(&manager, "Writer");
        task.set_running().unwrap();
        task.set_progress(0.5, Some("Writing blocks")).unwrap();

        task.set_finished().unwrap();
        assert_eq!(task.progress_description(), "Writing blocks");
        assert_eq!(task.progress_text(), "Writing blocks");

        tokio::time::advance(Duration::from_millis(1000)).await;
        manager.process_events();
        assert_eq!(task.progress_description(), "Writing blocks");

        tokio::time::advance(Duration::from_millis(600)).await;
        manager.process_events();
        assert_eq!(task.progress_description(), "");
        assert_eq!(task.progress_text(), "Finished");
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_description_clear_after() {
        let manager = TaskManager::default();
        let task = create(&manager, "Notifier");
        task.set_running_indeterminate().unwrap();

        task.set_progress_description("Contacting server", Some(Duration::from_millis(200)))
            .unwrap();
        assert_eq!(task.progress_text(), "Contacting server");

        tokio::time::advance(Duration::from_millis(250)).await;
        manager.process_events();
        assert_eq!(task.progress_description(), "");
        assert_eq!(task.progress_text(), "Running...");
    }
}
