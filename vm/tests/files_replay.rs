//! Write-versioning, replay equivalence, and divergence detection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hindsight_store::Encoding;
use hindsight_types::{DecodedEntry, LogEntry, Value};
use hindsight_vm::verify::{compare_archives, compare_logs, VerifierError};
use hindsight_vm::{
    CallInvocation, ReplayAssertions, ReplayOptions, ScriptError, SystemNamespace, Vm, VmError,
};

fn invocation(method: &str, args: Vec<Value>) -> CallInvocation {
    CallInvocation {
        method_name: method.to_string(),
        args,
        user_id: None,
    }
}

#[tokio::test]
async fn writes_advance_the_recorded_version() {
    let vm = Arc::new(Vm::new(
        r#"method w(v) { system.files.write_file("/file", v) }"#,
    ));
    vm.deploy_ephemeral().await.unwrap();

    for word in ["foo", "bar", "baz"] {
        vm.execute_call(invocation("w", vec![Value::Str(word.to_string())]))
            .await
            .unwrap();
    }

    let entries = vm.call_log().unwrap().entries(None, None).await.unwrap();
    let versions: Vec<u64> = entries
        .iter()
        .filter_map(|(_, entry)| match entry {
            DecodedEntry::Known(LogEntry::Call(call)) => Some(call.result.files_version),
            _ => None,
        })
        .collect();
    assert_eq!(versions, vec![2, 3, 4]);

    let files = vm.files().unwrap();
    assert_eq!(
        files.read_file("/file", Encoding::Utf8).await.unwrap(),
        Value::Str("baz".to_string())
    );

    // Replay rebuilds the same file state.
    let replayed = vm.replay_of(ReplayOptions::default()).await.unwrap();
    let replayed_files = replayed.files().unwrap();
    assert_eq!(
        replayed_files
            .read_file("/file", Encoding::Utf8)
            .await
            .unwrap(),
        Value::Str("baz".to_string())
    );

    compare_logs(&vm.call_log().unwrap(), &replayed.call_log().unwrap())
        .await
        .unwrap();
    compare_archives(
        &vm.files_archive().unwrap(),
        &replayed.files_archive().unwrap(),
    )
    .await
    .unwrap();

    replayed.close().await;
    vm.close().await;
}

#[tokio::test]
async fn deterministic_guest_with_init_replays_byte_identically() {
    let vm = Arc::new(Vm::new(
        r#"
        method init() { system.files.write_file("/counter", "0"); }
        method bump() {
          let n = system.files.read_file("/counter");
          system.files.write_file("/counter", n + "1");
          system.files.read_file("/counter")
        }
        "#,
    ));
    vm.deploy_ephemeral().await.unwrap();
    for _ in 0..3 {
        vm.execute_call(invocation("bump", vec![])).await.unwrap();
    }

    let replayed = vm.replay_of(ReplayOptions::default()).await.unwrap();
    compare_logs(&vm.call_log().unwrap(), &replayed.call_log().unwrap())
        .await
        .unwrap();
    compare_archives(
        &vm.files_archive().unwrap(),
        &replayed.files_archive().unwrap(),
    )
    .await
    .unwrap();
    replayed.close().await;
    vm.close().await;
}

/// Looks deterministic to the guest, is not: each call answers with a
/// fresh counter sample mixed with process entropy.
struct EntropyNamespace {
    counter: AtomicU64,
}

#[async_trait]
impl SystemNamespace for EntropyNamespace {
    async fn invoke(&self, method: &str, _args: Vec<Value>) -> Result<Value, ScriptError> {
        match method {
            "random" => {
                let sample = self.counter.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Int((rand::random::<u32>() as i64) << 8 | sample as i64))
            }
            other => Err(ScriptError::Runtime(format!(
                "unknown test operation `{other}`"
            ))),
        }
    }
}

#[tokio::test]
async fn nondeterminism_is_detected_by_the_verifier() {
    let code = r#"method r() { system.test.random() }"#;
    let vm = Arc::new(Vm::new(code));
    vm.install_namespace(
        "test",
        Arc::new(EntropyNamespace {
            counter: AtomicU64::new(0),
        }),
    );
    vm.deploy_ephemeral().await.unwrap();
    for _ in 0..3 {
        vm.execute_call(invocation("r", vec![])).await.unwrap();
    }

    let mut namespaces: BTreeMap<String, Arc<dyn SystemNamespace>> = BTreeMap::new();
    namespaces.insert(
        "test".to_string(),
        Arc::new(EntropyNamespace {
            counter: AtomicU64::new(0),
        }),
    );
    let replayed = vm
        .replay_of(ReplayOptions {
            namespaces,
            ..ReplayOptions::default()
        })
        .await
        .unwrap();

    let err = compare_logs(&vm.call_log().unwrap(), &replayed.call_log().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, VerifierError::LogMismatch { .. }));

    replayed.close().await;
    vm.close().await;
}

#[tokio::test]
async fn url_assertion_mismatch_is_fatal() {
    let vm = Arc::new(Vm::new("method f() { 1 }"));
    vm.deploy_ephemeral().await.unwrap();
    vm.execute_call(invocation("f", vec![])).await.unwrap();

    let log = vm.call_log().unwrap();
    let err = Vm::from_call_log(
        &log,
        ReplayAssertions {
            files_archive_url: Some("bogus".to_string()),
        },
        ReplayOptions::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VmError::AssertionMismatch { .. }));
    vm.close().await;
}

#[tokio::test]
async fn replay_rejects_logs_that_do_not_start_with_init() {
    use hindsight_store::{AppendOnlyLog, CallLog, JournalLog};
    use hindsight_types::{CallEntry, CallRequest, CallResult};

    let raw = JournalLog::memory("apl://forged".to_string());
    let entry = LogEntry::Call(CallEntry {
        call: CallRequest {
            method_name: "f".to_string(),
            args: vec![],
            user_id: None,
        },
        result: CallResult {
            files_version: 1,
            res: None,
            err: None,
        },
    });
    raw.append(&entry.to_canonical_bytes()).await.unwrap();
    let log = CallLog::from_log(Arc::new(raw));

    let err = Vm::from_call_log(&log, ReplayAssertions::default(), ReplayOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VmError::MalformedLog(_)));
}

#[tokio::test]
async fn fetched_logs_replay_like_local_ones() {
    use hindsight_store::LocalNetwork;
    use hindsight_vm::{replay_fetched, DeployOptions};

    let network = Arc::new(LocalNetwork::new());
    let dir = tempfile::tempdir().unwrap();
    let vm = Arc::new(Vm::new(
        r#"method w(v) { system.files.write_file("/data", v) }"#,
    ));
    vm.deploy(DeployOptions::new(dir.path(), "origin").with_network(Arc::clone(&network)))
        .await
        .unwrap();
    vm.execute_call(invocation("w", vec![Value::Str("shared".to_string())]))
        .await
        .unwrap();

    let replayed = replay_fetched(
        network.as_ref(),
        &vm.call_log_url().unwrap(),
        ReplayAssertions {
            files_archive_url: Some(vm.files_archive_url().unwrap()),
        },
        ReplayOptions::default(),
    )
    .await
    .unwrap();

    compare_logs(&vm.call_log().unwrap(), &replayed.call_log().unwrap())
        .await
        .unwrap();
    compare_archives(
        &vm.files_archive().unwrap(),
        &replayed.files_archive().unwrap(),
    )
    .await
    .unwrap();

    replayed.close().await;
    vm.close().await;
}
