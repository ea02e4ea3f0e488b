//! Editing scenarios through the named-command boundary.

use serde_json::{json, Value};
use tempfile::TempDir;

use constellation::command::{ConstellationEditor, TaskSpec};
use constellation::core::Constellation;
use constellation::Error;

use crate::fixtures::diamond;

fn editor() -> ConstellationEditor {
    ConstellationEditor::new(Constellation::new("scenario"))
}

fn task_count(snapshot: &Value) -> usize {
    snapshot["tasks"].as_object().map(|m| m.len()).unwrap_or(0)
}

fn dependency_count(snapshot: &Value) -> usize {
    snapshot["dependencies"].as_object().map(|m| m.len()).unwrap_or(0)
}

#[test]
fn test_chain_scenario_by_name() {
    let mut editor = editor();

    editor
        .execute_by_name("add_task", json!({"id": "t1", "name": "open", "description": "open the file"}))
        .unwrap();
    editor
        .execute_by_name("add_task", json!({"id": "t2", "name": "edit"}))
        .unwrap();
    let snapshot = editor
        .execute_by_name("add_dependency", json!({"from_task_id": "t1", "to_task_id": "t2"}))
        .unwrap();

    assert_eq!(task_count(&snapshot), 2);
    assert_eq!(dependency_count(&snapshot), 1);
    assert_eq!(
        editor.constellation().get_topological_order().unwrap(),
        vec!["t1", "t2"]
    );

    // A back edge would close a cycle.
    let err = editor
        .execute_by_name("add_dependency", json!({"from_task_id": "t2", "to_task_id": "t1"}))
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(editor.constellation().dependency_count(), 1);
    assert!(editor.validate().0);

    // Removing the source cascades to its edge.
    let snapshot = editor
        .execute_by_name("remove_task", json!({"task_id": "t1"}))
        .unwrap();
    assert_eq!(task_count(&snapshot), 1);
    assert_eq!(dependency_count(&snapshot), 0);
}

#[test]
fn test_self_loop_rejected() {
    let mut editor = editor();
    editor.add_task(TaskSpec::new("t1", "t1", "")).unwrap();

    let err = editor
        .execute_by_name("add_dependency", json!({"from_task_id": "t1", "to_task_id": "t1"}))
        .unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(editor.constellation().dependency_count(), 0);
}

#[test]
fn test_refusal_names_valid_ids() {
    let mut editor = editor();
    editor.add_task(TaskSpec::new("t1", "t1", "")).unwrap();
    editor.add_task(TaskSpec::new("t2", "t2", "")).unwrap();

    let err = editor
        .execute_by_name("remove_task", json!({"task_id": "ghost"}))
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("t1"));
    assert!(message.contains("t2"));
}

#[test]
fn test_every_command_undo_restores_snapshot() {
    let dir = TempDir::new().unwrap();
    let saved = dir.path().join("saved.json");
    diamond().save_to_file(&saved).unwrap();

    let steps: Vec<(&str, Value)> = vec![
        ("add_task", json!({"id": "e", "name": "extra"})),
        ("update_task", json!({"task_id": "a", "updates": {"description": "changed"}})),
        ("add_dependency", json!({"from_task_id": "d", "to_task_id": "e"})),
        (
            "update_dependency",
            json!({"dependency_id": "d->e", "updates": {"condition_description": "if ok"}}),
        ),
        ("remove_dependency", json!({"dependency_id": "d->e"})),
        ("remove_task", json!({"task_id": "e"})),
        (
            "build_constellation",
            json!({"tasks": [{"id": "x"}, {"id": "y"}], "dependencies": [{"from_task_id": "x", "to_task_id": "y"}]}),
        ),
        ("clear_constellation", json!({})),
        ("load_constellation", json!({"path": saved})),
    ];

    let mut editor = ConstellationEditor::new(diamond());
    for (name, params) in steps {
        let before = editor.constellation().to_dict().unwrap();
        editor.execute_by_name(name, params).unwrap();
        assert!(editor.validate().0, "{} left an invalid graph", name);

        assert!(editor.undo().unwrap(), "{} was not undoable", name);
        assert_eq!(editor.constellation().to_dict().unwrap(), before, "{} undo", name);

        assert!(editor.redo().unwrap());
    }
}

#[test]
fn test_history_bounded_to_three() {
    let mut editor = ConstellationEditor::with_max_history(Constellation::new("bounded"), 3);
    for i in 1..=5 {
        editor
            .add_task(TaskSpec::new(&format!("t{}", i), "", ""))
            .unwrap();
    }

    assert_eq!(editor.history().len(), 3);
    let mut undone = 0;
    while editor.undo().unwrap() {
        undone += 1;
    }

    assert_eq!(undone, 3);
    assert_eq!(editor.constellation().task_ids(), vec!["t1", "t2"]);
}

#[test]
fn test_new_command_truncates_redo() {
    let mut editor = editor();
    editor.add_task(TaskSpec::new("t1", "", "")).unwrap();
    editor.add_task(TaskSpec::new("t2", "", "")).unwrap();
    editor.undo().unwrap();
    assert!(editor.can_redo());

    editor.add_task(TaskSpec::new("t3", "", "")).unwrap();

    assert!(!editor.can_redo());
    assert_eq!(editor.constellation().task_ids(), vec!["t1", "t3"]);
}

#[test]
fn test_save_and_reload_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("diamond.json");
    let mut editor = ConstellationEditor::new(diamond());

    editor.save_constellation(&path).unwrap();
    assert!(!editor.can_undo());

    let reloaded = Constellation::load_from_file(&path).unwrap();
    assert_eq!(
        reloaded.to_dict().unwrap(),
        editor.constellation().to_dict().unwrap()
    );
    assert_eq!(
        reloaded.get_topological_order().unwrap(),
        editor.constellation().get_topological_order().unwrap()
    );
}

#[test]
fn test_unknown_command_lists_names() {
    let mut editor = editor();
    let err = editor
        .execute_by_name("explode", json!({}))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCommand(_)));
    assert!(err.to_string().contains("add_task"));
}

#[test]
fn test_build_with_unknown_endpoint_lists_tasks() {
    let mut editor = editor();
    editor.add_task(TaskSpec::new("existing", "existing", "")).unwrap();
    let before = editor.constellation().to_dict().unwrap();

    let err = editor
        .execute_by_name(
            "build_constellation",
            json!({"tasks": [{"id": "a"}], "dependencies": [{"from_task_id": "a", "to_task_id": "publish"}]}),
        )
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("publish"), "message: {}", message);
    assert!(message.contains("existing"), "message: {}", message);
    assert!(message.contains("a]"), "message: {}", message);
    assert_eq!(editor.constellation().to_dict().unwrap(), before);
    assert_eq!(editor.history().len(), 1);
}
