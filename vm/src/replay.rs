//! The replay driver.
//!
//! Rebuilds a VM from a fetched call log by re-executing every recorded
//! call in sequence. The reconstructed stores claim the durable
//! identities of the originals, so under honest, deterministic execution
//! the rebuilt log and archive are byte-identical; the verifier
//! (`crate::verify`) does the comparing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use hindsight_store::{CallLog, GetOptions};
use hindsight_types::{DecodedEntry, InitEntry, LogEntry};

use crate::sandbox::SystemNamespace;
use crate::vm::{CallInvocation, StoreIdentity, Vm};
use crate::VmError;

/// What the replaying party asserts about the log before trusting it.
#[derive(Debug, Clone, Default)]
pub struct ReplayAssertions {
    /// Expected files-archive URL; must equal the log's `init` record.
    pub files_archive_url: Option<String>,
}

/// Options for [`Vm::from_call_log`].
#[derive(Clone, Default)]
pub struct ReplayOptions {
    /// Rebuild into this directory; `None` uses memory-backed scratch.
    pub dir: Option<PathBuf>,
    /// Host namespaces the original VM carried (e.g. an injected test
    /// API); replay installs the same surface before re-executing.
    pub namespaces: BTreeMap<String, Arc<dyn SystemNamespace>>,
}

impl std::fmt::Debug for ReplayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayOptions")
            .field("dir", &self.dir)
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Validate the ledger prefix and the caller's assertions, returning the
/// decoded entries and the init record.
pub(crate) async fn validated_entries(
    log: &CallLog,
    assertions: &ReplayAssertions,
) -> Result<(Vec<(u64, DecodedEntry)>, InitEntry), VmError> {
    let entries = log.entries(None, None).await?;
    let Some((_, DecodedEntry::Known(LogEntry::Init(init)))) = entries.first() else {
        return Err(VmError::MalformedLog("first entry is not init".to_string()));
    };
    if let Some(expected) = &assertions.files_archive_url {
        if expected != &init.files_archive_url {
            return Err(VmError::AssertionMismatch {
                expected: expected.clone(),
                actual: init.files_archive_url.clone(),
            });
        }
    }
    let init = init.clone();
    Ok((entries, init))
}

/// Re-execute every recorded call after the init record. Guest errors
/// are re-recorded, not fatal; unknown entry types are skipped; a stray
/// `init` is a malformed log.
pub(crate) async fn replay_entries(
    vm: &Arc<Vm>,
    entries: &[(u64, DecodedEntry)],
) -> Result<(), VmError> {
    for (seq, entry) in entries {
        match entry {
            DecodedEntry::Known(LogEntry::Call(call)) => {
                let outcome = vm
                    .execute_call(CallInvocation {
                        method_name: call.call.method_name.clone(),
                        args: call.call.args.clone(),
                        user_id: call.call.user_id.clone(),
                    })
                    .await;
                match outcome {
                    Ok(_) => {}
                    Err(VmError::Guest { message }) => {
                        debug!(seq, %message, "replayed call failed in guest");
                    }
                    Err(VmError::AtCapacity { max }) => {
                        debug!(seq, max, "replayed call refused at capacity");
                    }
                    Err(other) => return Err(other),
                }
            }
            DecodedEntry::Known(LogEntry::Init(_)) => {
                return Err(VmError::MalformedLog(format!(
                    "init entry at sequence {seq}"
                )));
            }
            DecodedEntry::Unknown { entry_type } => {
                debug!(seq, entry_type = %entry_type, "skipping unknown entry type");
            }
        }
    }
    Ok(())
}

impl Vm {
    /// Rebuild a VM by replaying a call log.
    ///
    /// The guest `init` export is *not* run at deploy here: its recorded
    /// call entry is replayed from the ledger like every other call, so
    /// the rebuilt log lines up sequence-for-sequence with the original.
    ///
    /// # Errors
    ///
    /// `VmError::MalformedLog` when sequence 0 is not `init` or an `init`
    /// appears later; `VmError::AssertionMismatch` when the caller's
    /// expected archive URL disagrees with the record. Guest errors
    /// during replay are re-recorded, not fatal.
    pub async fn from_call_log(
        log: &CallLog,
        assertions: ReplayAssertions,
        options: ReplayOptions,
    ) -> Result<Arc<Vm>, VmError> {
        let (entries, init) = validated_entries(log, &assertions).await?;

        let vm = Arc::new(Vm::new(init.code.clone()));
        for (name, namespace) in options.namespaces {
            vm.install_namespace(name, namespace);
        }
        vm.deploy_for_replay(
            options.dir,
            StoreIdentity {
                files_archive_url: init.files_archive_url.clone(),
                call_log_url: log.url().to_string(),
            },
        )
        .await?;
        info!(vm = %vm.id(), entries = entries.len(), "replaying call log");
        replay_entries(&vm, &entries[1..]).await?;
        Ok(vm)
    }

    /// Replay this VM's own recorded history into scratch state.
    ///
    /// # Errors
    ///
    /// As [`Vm::from_call_log`].
    pub async fn replay_of(&self, options: ReplayOptions) -> Result<Arc<Vm>, VmError> {
        let log = self.call_log()?;
        let assertions = ReplayAssertions {
            files_archive_url: Some(self.files_archive_url()?),
        };
        Self::from_call_log(&log, assertions, options).await
    }
}

/// Fetch a log by URL and replay it in one step.
///
/// # Errors
///
/// Fetch errors from the network; replay errors as
/// [`Vm::from_call_log`].
pub async fn replay_fetched(
    network: &dyn hindsight_store::ContentNetwork,
    call_log_url: &str,
    assertions: ReplayAssertions,
    options: ReplayOptions,
) -> Result<Arc<Vm>, VmError> {
    let log = CallLog::fetch(network, call_log_url, None).await?;
    let len = log.len();
    if len == 0 {
        return Err(VmError::MalformedLog("fetched log is empty".to_string()));
    }
    let _ = log.get(len - 1, GetOptions::default()).await?;
    Vm::from_call_log(&log, assertions, options).await
}
