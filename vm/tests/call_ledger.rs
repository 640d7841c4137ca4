//! Ledger-shape and kernel-lifecycle coverage.

use std::sync::Arc;

use hindsight_store::GetOptions;
use hindsight_types::{DecodedEntry, LogEntry, Value};
use hindsight_vm::{CallInvocation, DeployOptions, Vm, VmError, VmPhase};

fn invocation(method: &str, args: Vec<Value>) -> CallInvocation {
    CallInvocation {
        method_name: method.to_string(),
        args,
        user_id: None,
    }
}

async fn entry(vm: &Arc<Vm>, seq: u64) -> LogEntry {
    let log = vm.call_log().unwrap();
    match log.get(seq, GetOptions::default()).await.unwrap().unwrap() {
        DecodedEntry::Known(entry) => entry,
        DecodedEntry::Unknown { entry_type } => panic!("unknown entry {entry_type}"),
    }
}

#[tokio::test]
async fn basic_call_logging() {
    let vm = Arc::new(Vm::new("method func1(v = 0) { v + 1 }"));
    vm.deploy_ephemeral().await.unwrap();

    assert_eq!(
        vm.execute_call(invocation("func1", vec![])).await.unwrap(),
        Value::Int(1)
    );
    assert_eq!(
        vm.execute_call(invocation("func1", vec![Value::Int(5)]))
            .await
            .unwrap(),
        Value::Int(6)
    );

    let log = vm.call_log().unwrap();
    assert_eq!(log.len(), 3);

    let LogEntry::Init(init) = entry(&vm, 0).await else {
        panic!("sequence 0 must be init");
    };
    assert_eq!(init.code, vm.code());
    assert_eq!(init.files_archive_url, vm.files_archive_url().unwrap());

    let LogEntry::Call(first) = entry(&vm, 1).await else {
        panic!("sequence 1 must be a call");
    };
    assert_eq!(first.call.method_name, "func1");
    assert_eq!(first.result.files_version, 1);
    assert_eq!(first.result.res, Some(Value::Int(1)));
    assert_eq!(first.result.err, None);

    let LogEntry::Call(second) = entry(&vm, 2).await else {
        panic!("sequence 2 must be a call");
    };
    assert_eq!(second.result.files_version, 1);
    assert_eq!(second.result.res, Some(Value::Int(6)));

    vm.close().await;
}

#[tokio::test]
async fn guest_errors_are_recorded_and_resurfaced() {
    let vm = Arc::new(Vm::new(
        r#"method boom() { fail("no dice"); }"#,
    ));
    vm.deploy_ephemeral().await.unwrap();

    let err = vm.execute_call(invocation("boom", vec![])).await.unwrap_err();
    let VmError::Guest { message } = err else {
        panic!("expected guest error, got {err:?}");
    };
    assert_eq!(message, "no dice");

    let LogEntry::Call(logged) = entry(&vm, 1).await else {
        panic!("expected call entry");
    };
    assert_eq!(logged.result.res, None);
    assert_eq!(logged.result.err.unwrap().message, "no dice");
    vm.close().await;
}

#[tokio::test]
async fn caller_identity_reaches_the_guest_and_the_ledger() {
    let vm = Arc::new(Vm::new("method who() { system.caller.id }"));
    vm.deploy_ephemeral().await.unwrap();

    let result = vm
        .execute_call(CallInvocation {
            method_name: "who".to_string(),
            args: vec![],
            user_id: Some("user-7".to_string()),
        })
        .await
        .unwrap();
    assert_eq!(result, Value::Str("user-7".to_string()));

    let LogEntry::Call(logged) = entry(&vm, 1).await else {
        panic!("expected call entry");
    };
    assert_eq!(logged.call.user_id.as_deref(), Some("user-7"));

    // Cleared between calls.
    assert_eq!(
        vm.execute_call(invocation("who", vec![])).await.unwrap(),
        Value::Str(String::new())
    );
    vm.close().await;
}

#[tokio::test]
async fn init_export_runs_at_deploy_and_is_logged() {
    let vm = Arc::new(Vm::new(
        r#"
        method init() { system.files.write_file("/greeting", "hello"); }
        method read() { system.files.read_file("/greeting") }
        "#,
    ));
    vm.deploy_ephemeral().await.unwrap();
    assert_eq!(vm.phase(), VmPhase::Evaluated);

    let LogEntry::Call(logged) = entry(&vm, 1).await else {
        panic!("init call must be logged at sequence 1");
    };
    assert_eq!(logged.call.method_name, "init");
    assert_eq!(logged.call.user_id, None);
    assert_eq!(logged.result.files_version, 2);

    assert_eq!(
        vm.execute_call(invocation("read", vec![])).await.unwrap(),
        Value::Str("hello".to_string())
    );
    vm.close().await;
}

#[tokio::test]
async fn unknown_methods_are_rejected_without_logging() {
    let vm = Arc::new(Vm::new("method f() { 1 }"));
    vm.deploy_ephemeral().await.unwrap();
    let before = vm.call_log().unwrap().len();
    let err = vm.execute_call(invocation("missing", vec![])).await.unwrap_err();
    assert!(matches!(err, VmError::NoSuchMethod(name) if name == "missing"));
    assert_eq!(vm.call_log().unwrap().len(), before);
    vm.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_releases_state() {
    let vm = Arc::new(Vm::new("method f() { 1 }"));
    vm.deploy_ephemeral().await.unwrap();
    vm.close().await;
    vm.close().await;
    assert_eq!(vm.phase(), VmPhase::Closed);
    assert!(matches!(vm.call_log(), Err(VmError::NotDeployed)));
    assert!(matches!(vm.files_archive(), Err(VmError::NotDeployed)));
    assert!(matches!(
        vm.execute_call(invocation("f", vec![])).await,
        Err(VmError::Closed)
    ));
}

#[tokio::test]
async fn queue_preserves_arrival_order() {
    let vm = Arc::new(Vm::new(
        r#"
        method s(n) {
          system.sleep(60 - n * 10);
          system.files.write_file("/file", str(n));
        }
        "#,
    ));
    vm.deploy_ephemeral().await.unwrap();

    let mut receivers = Vec::new();
    for n in 1..=5 {
        receivers.push(
            vm.enqueue_call(invocation("s", vec![Value::Int(n)]))
                .unwrap(),
        );
    }
    for receiver in receivers {
        receiver.await.unwrap().unwrap();
    }

    let files = vm.files().unwrap();
    let content = files
        .read_file("/file", hindsight_store::Encoding::Utf8)
        .await
        .unwrap();
    assert_eq!(content, Value::Str("5".to_string()));

    // Version monotonicity across the recorded entries.
    let entries = vm.call_log().unwrap().entries(None, None).await.unwrap();
    let mut last = 0;
    for (_, entry) in entries {
        if let DecodedEntry::Known(LogEntry::Call(call)) = entry {
            assert!(call.result.files_version >= last);
            last = call.result.files_version;
        }
    }
    vm.close().await;
}

#[tokio::test]
async fn queue_bound_rejects_with_capacity_error() {
    let vm = Arc::new(Vm::with_config(
        "method s() { system.sleep(50); }",
        hindsight_vm::VmConfig { queue_capacity: 2 },
    ));
    vm.deploy_ephemeral().await.unwrap();

    // No await between enqueues, so the worker cannot drain: the bound
    // is hit exactly at capacity.
    let _a = vm.enqueue_call(invocation("s", vec![])).unwrap();
    let _b = vm.enqueue_call(invocation("s", vec![])).unwrap();
    let err = vm.enqueue_call(invocation("s", vec![])).unwrap_err();
    assert!(matches!(err, VmError::QueueFull));
    vm.close().await;
}

#[tokio::test]
async fn close_cancels_queued_calls() {
    let vm = Arc::new(Vm::new(
        "method slow() { system.sleep(30); } method fast() { 1 }",
    ));
    vm.deploy_ephemeral().await.unwrap();

    let active = vm.enqueue_call(invocation("slow", vec![])).unwrap();
    let queued = vm.enqueue_call(invocation("fast", vec![])).unwrap();
    // Let the worker pick up the first call before closing.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    vm.close().await;

    // The active call ran to completion; the queued one was cancelled.
    assert!(active.await.unwrap().is_ok());
    assert!(matches!(queued.await.unwrap(), Err(VmError::Closed)));
}

#[tokio::test]
async fn redeploy_reopens_the_same_stores() {
    let dir = tempfile::tempdir().unwrap();
    let options = DeployOptions::new(dir.path(), "persistent");
    let code = r#"method w(v) { system.files.write_file("/f", v) }"#;

    let (archive_url, log_len) = {
        let vm = Arc::new(Vm::new(code));
        vm.deploy(options.clone()).await.unwrap();
        vm.execute_call(invocation("w", vec![Value::Str("x".to_string())]))
            .await
            .unwrap();
        let url = vm.files_archive_url().unwrap();
        let len = vm.call_log().unwrap().len();
        vm.close().await;
        (url, len)
    };

    let vm = Arc::new(Vm::new(code));
    vm.deploy(options.clone()).await.unwrap();
    assert_eq!(vm.files_archive_url().unwrap(), archive_url);
    assert_eq!(vm.call_log().unwrap().len(), log_len);
    vm.close().await;

    // Reopening with a wrong expected url is a fatal configuration error.
    let vm = Arc::new(Vm::new(code));
    let err = vm
        .deploy(options.with_url("varc://bogus"))
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::UrlMismatch { .. }));
}

#[tokio::test]
async fn crash_between_execute_and_append_is_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let options = DeployOptions::new(dir.path(), "repair");
    let code = r#"method w(v) { system.files.write_file("/f", v) }"#;

    {
        let vm = Arc::new(Vm::new(code));
        vm.deploy(options.clone()).await.unwrap();
        vm.execute_call(invocation("w", vec![Value::Str("logged".to_string())]))
            .await
            .unwrap();
        // Simulate the crash window: mutate the archive without logging.
        let files = vm.files().unwrap();
        files
            .write_file(
                "/f",
                &Value::Str("dangling".to_string()),
                hindsight_store::Encoding::Utf8,
            )
            .await
            .unwrap();
        vm.close().await;
    }

    let vm = Arc::new(Vm::new(code));
    vm.deploy(options).await.unwrap();
    // The dangling version was reverted; the log is the source of truth.
    let files = vm.files().unwrap();
    assert_eq!(
        files
            .read_file("/f", hindsight_store::Encoding::Utf8)
            .await
            .unwrap(),
        Value::Str("logged".to_string())
    );
    vm.close().await;
}
