//! Factory provisioning, capacity, teardown, and restart restoration.

use std::sync::Arc;

use hindsight_store::Encoding;
use hindsight_types::Value;
use hindsight_vm::verify::{compare_archives, compare_logs};
use hindsight_vm::{
    CallInvocation, DeployOptions, Factory, FactoryConfig, ReplayAssertions, ReplayOptions, Vm,
    VmError, VmPhase,
};

/// A factory guest that persists its children under /vms so a restarted
/// host can rebuild them.
const FACTORY_CODE: &str = r#"
method provision_vm(args) {
  let info = system.vms.provision_vm(args);
  system.files.write_file("/vms/" + info.id + ".json", args, "json");
  info
}
method shutdown_vm(id) {
  system.vms.shutdown_vm(id);
  system.files.unlink("/vms/" + id + ".json");
}
"#;

fn provision_args(code: &str, title: &str) -> Value {
    Value::object([
        ("code", Value::Str(code.to_string())),
        ("title", Value::Str(title.to_string())),
    ])
}

async fn deployed_factory(dir: &std::path::Path, config: FactoryConfig) -> Factory {
    let factory = Factory::new(FACTORY_CODE, config);
    factory
        .deploy(DeployOptions::new(dir, "factory"))
        .await
        .unwrap();
    factory
}

#[tokio::test]
async fn provision_and_call_a_child() {
    let dir = tempfile::tempdir().unwrap();
    let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;

    let info = factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method hello() { \"world\" }", "foo")],
            user_id: None,
        })
        .await
        .unwrap();
    let info = info.as_object().unwrap().clone();
    let id = info["id"].as_str().unwrap().to_string();
    assert!(info["callLogUrl"].as_str().unwrap().starts_with("apl://"));
    assert!(info["filesArchiveUrl"]
        .as_str()
        .unwrap()
        .starts_with("varc://"));
    assert_eq!(factory.num_vms(), 1);

    let child = factory.child(&id).unwrap();
    assert_eq!(
        child
            .call(CallInvocation {
                method_name: "hello".to_string(),
                args: vec![],
                user_id: None,
            })
            .await
            .unwrap(),
        Value::Str("world".to_string())
    );

    // Both ledgers recorded their sides: the factory its provision call,
    // the child its hello call.
    assert_eq!(factory.vm().call_log().unwrap().len(), 2);
    assert_eq!(child.call_log().unwrap().len(), 2);

    factory.close().await;
    assert_eq!(child.phase(), VmPhase::Closed);
}

#[tokio::test]
async fn shutdown_unregisters_and_closes() {
    let dir = tempfile::tempdir().unwrap();
    let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;

    let info = factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method f() { 1 }", "t")],
            user_id: None,
        })
        .await
        .unwrap();
    let id = info.as_object().unwrap()["id"].as_str().unwrap().to_string();
    let child = factory.child(&id).unwrap();

    factory
        .vm()
        .call(CallInvocation {
            method_name: "shutdown_vm".to_string(),
            args: vec![Value::Str(id.clone())],
            user_id: None,
        })
        .await
        .unwrap();

    assert_eq!(factory.num_vms(), 0);
    assert!(factory.child(&id).is_none());
    assert_eq!(child.phase(), VmPhase::Closed);

    // Unknown ids are guest errors.
    let err = factory
        .vm()
        .call(CallInvocation {
            method_name: "shutdown_vm".to_string(),
            args: vec![Value::Str("nope".to_string())],
            user_id: None,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown vm"));

    factory.close().await;
}

#[tokio::test]
async fn capacity_bound_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let factory = deployed_factory(
        dir.path(),
        FactoryConfig {
            max_vms: Some(1),
            ..FactoryConfig::default()
        },
    )
    .await;

    factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method f() { 1 }", "one")],
            user_id: None,
        })
        .await
        .unwrap();
    // Over the bound is the structural capacity error, not a generic
    // guest error.
    let err = factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method f() { 1 }", "two")],
            user_id: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::AtCapacity { max: 1 }));

    // Empty code is rejected before any child is built.
    let err = factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("", "bad")],
            user_id: None,
        })
        .await
        .unwrap_err();
    let VmError::Guest { message } = err else {
        panic!("expected guest error, got {err:?}");
    };
    assert!(message.contains("non-empty"));

    factory.close().await;
}

#[tokio::test]
async fn reprovision_restores_saved_children_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;
        factory
            .vm()
            .call(CallInvocation {
                method_name: "provision_vm".to_string(),
                args: vec![provision_args("method ping() { \"pong\" }", "saved")],
                user_id: None,
            })
            .await
            .unwrap();
        // The guest recorded the child spec into its own archive.
        let saved = factory.vm().files().unwrap().read_dir("/vms").await.unwrap();
        assert_eq!(saved.as_array().unwrap().len(), 1);
        factory.close().await;
    }

    // Restart: same dir, fresh process state.
    let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;
    assert_eq!(factory.num_vms(), 0);
    let restored = factory.reprovision_saved_vms().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(factory.num_vms(), 1);

    // Child identity derives from the saved args, so the restored child
    // reopened its original stores under the same id.
    let saved = factory.vm().files().unwrap().read_dir("/vms").await.unwrap();
    assert_eq!(saved.as_array().unwrap().len(), 1);
    let child_id = saved.as_array().unwrap()[0].as_object().unwrap()["name"]
        .as_str()
        .unwrap()
        .trim_end_matches(".json")
        .to_string();
    let child = factory.child(&child_id).unwrap();
    assert_eq!(
        child
            .call(CallInvocation {
                method_name: "ping".to_string(),
                args: vec![],
                user_id: None,
            })
            .await
            .unwrap(),
        Value::Str("pong".to_string())
    );

    factory.close().await;
}

#[tokio::test]
async fn factory_and_child_logs_replay_and_verify_independently() {
    let dir = tempfile::tempdir().unwrap();
    let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;

    let info = factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method hello() { \"world\" }", "foo")],
            user_id: None,
        })
        .await
        .unwrap();
    let id = info.as_object().unwrap()["id"].as_str().unwrap().to_string();
    let child = factory.child(&id).unwrap();
    child
        .call(CallInvocation {
            method_name: "hello".to_string(),
            args: vec![],
            user_id: Some("auditor".to_string()),
        })
        .await
        .unwrap();

    // Factory ledger: replaying re-provisions the child with the same
    // derived identity, so the logs and archives come out byte-equal.
    let replayed_factory = Factory::from_call_log(
        &factory.vm().call_log().unwrap(),
        ReplayAssertions {
            files_archive_url: Some(factory.vm().files_archive_url().unwrap()),
        },
        FactoryConfig::default(),
        ReplayOptions::default(),
    )
    .await
    .unwrap();
    compare_logs(
        &factory.vm().call_log().unwrap(),
        &replayed_factory.vm().call_log().unwrap(),
    )
    .await
    .unwrap();
    compare_archives(
        &factory.vm().files_archive().unwrap(),
        &replayed_factory.vm().files_archive().unwrap(),
    )
    .await
    .unwrap();
    assert!(replayed_factory.child(&id).is_some());

    // Child ledger: independently replayable.
    let replayed_child = Vm::from_call_log(
        &child.call_log().unwrap(),
        ReplayAssertions {
            files_archive_url: Some(child.files_archive_url().unwrap()),
        },
        ReplayOptions::default(),
    )
    .await
    .unwrap();
    compare_logs(
        &child.call_log().unwrap(),
        &replayed_child.call_log().unwrap(),
    )
    .await
    .unwrap();
    compare_archives(
        &child.files_archive().unwrap(),
        &replayed_child.files_archive().unwrap(),
    )
    .await
    .unwrap();

    replayed_child.close().await;
    replayed_factory.close().await;
    factory.close().await;
}

#[tokio::test]
async fn externally_closed_children_leave_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;

    let info = factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method f() { 1 }", "t")],
            user_id: None,
        })
        .await
        .unwrap();
    let id = info.as_object().unwrap()["id"].as_str().unwrap().to_string();

    let child = factory.child(&id).unwrap();
    child.close().await;

    // The close watcher prunes the registry.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(factory.num_vms(), 0);

    factory.close().await;
}

#[tokio::test]
async fn factory_guest_can_read_child_specs_with_json_encoding() {
    let dir = tempfile::tempdir().unwrap();
    let factory = deployed_factory(dir.path(), FactoryConfig::default()).await;
    factory
        .vm()
        .call(CallInvocation {
            method_name: "provision_vm".to_string(),
            args: vec![provision_args("method f() { 1 }", "spec")],
            user_id: None,
        })
        .await
        .unwrap();

    let files = factory.vm().files().unwrap();
    let rows = files.read_dir("/vms").await.unwrap();
    let name = rows.as_array().unwrap()[0].as_object().unwrap()["name"]
        .as_str()
        .unwrap()
        .to_string();
    let spec = files
        .read_file(&format!("/vms/{name}"), Encoding::Json)
        .await
        .unwrap();
    assert_eq!(
        spec.as_object().unwrap()["title"],
        Value::Str("spec".to_string())
    );

    factory.close().await;
}
