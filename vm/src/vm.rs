//! The execution kernel.
//!
//! A VM binds a guest sandbox, a files archive, and a call log, and
//! guarantees two things: calls execute strictly one at a time, and every
//! attempt — success or guest error — lands in the ledger together with
//! the archive version observed after it returned. That serialization is
//! what makes the recorded history a pure function of the input sequence,
//! and therefore replayable.
//!
//! Lifecycle: `Constructed → Deployed → { Evaluated ↔ Executing } →
//! Closed`, published on a watch channel. `close` is idempotent and
//! terminal.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hindsight_store::{
    Archive, CallLog, FilesAdaptor, LocalNetwork, StoreError, VersionedArchive,
};
use hindsight_types::{CallEntry, CallRequest, CallResult, DecodedEntry, GuestErrorPayload,
    LogEntry, Value};

use crate::sandbox::{CallerSlot, Sandbox, SystemNamespace, SystemSurface};
use crate::script::ScriptError;
use crate::VmError;

/// Archive directory name under a VM's data dir.
const ARCHIVE_DIR: &str = "archive";
/// Log directory name under a VM's data dir.
const LOG_DIR: &str = "log";
/// Metadata file name under a VM's data dir.
const META_FILE: &str = "meta.json";

/// VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Bound on queued-but-not-active calls.
    pub queue_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
        }
    }
}

/// Lifecycle phase, published on the VM's watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    /// Constructed; nothing on disk yet.
    Constructed,
    /// Stores bound, script not yet evaluated.
    Deployed,
    /// Ready: script evaluated, no call active.
    Evaluated,
    /// A call is executing.
    Executing,
    /// Closed; stores released.
    Closed,
}

/// One invocation: method, arguments, and the authenticated caller.
#[derive(Debug, Clone)]
pub struct CallInvocation {
    /// Exported method name.
    pub method_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Opaque authenticated user id, when the transport supplied one.
    pub user_id: Option<String>,
}

/// Durable identities to force onto freshly created stores. Used for
/// deterministically derived children and for replay reconstructions,
/// which claim the identity of the stores they rebuild.
#[derive(Debug, Clone)]
pub struct StoreIdentity {
    /// Files archive URL.
    pub files_archive_url: String,
    /// Call log URL.
    pub call_log_url: String,
}

/// Options for [`Vm::deploy`].
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Data directory for this VM.
    pub dir: PathBuf,
    /// Archive title when creating fresh state.
    pub title: String,
    /// Expected archive URL when reopening; disagreement is fatal.
    pub url: Option<String>,
    /// Distribution registry to announce the stores on.
    pub network: Option<Arc<LocalNetwork>>,
    /// Identities to force onto freshly created stores.
    pub identity: Option<StoreIdentity>,
}

impl DeployOptions {
    /// Options with just a data directory and archive title.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, title: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            title: title.into(),
            url: None,
            network: None,
            identity: None,
        }
    }

    /// Expect this archive URL when reopening.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Announce the stores on a distribution registry.
    #[must_use]
    pub fn with_network(mut self, network: Arc<LocalNetwork>) -> Self {
        self.network = Some(network);
        self
    }

    /// Force durable identities onto freshly created stores.
    #[must_use]
    pub fn with_identity(mut self, identity: StoreIdentity) -> Self {
        self.identity = Some(identity);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct VmMeta {
    title: String,
    url: String,
}

struct QueuedCall {
    invocation: CallInvocation,
    respond: oneshot::Sender<Result<Value, VmError>>,
}

/// Deployed state. Field order matters for release: the archive drops
/// before the log.
struct Deployed {
    archive: Arc<dyn VersionedArchive>,
    log: CallLog,
    sandbox: Arc<Sandbox>,
    queue_tx: Option<mpsc::Sender<QueuedCall>>,
    worker: Option<JoinHandle<()>>,
}

enum DeployTarget {
    Dir(DeployOptions),
    Memory {
        title: String,
        identity: Option<StoreIdentity>,
    },
}

/// The auditable execution kernel.
pub struct Vm {
    id: String,
    code: String,
    config: VmConfig,
    caller: CallerSlot,
    phase_tx: watch::Sender<VmPhase>,
    exec_lock: Mutex<()>,
    closed: AtomicBool,
    namespaces: StdMutex<BTreeMap<String, Arc<dyn SystemNamespace>>>,
    state: StdRwLock<Option<Deployed>>,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Vm {
    /// Store the script and assign an identity. Touches nothing on disk.
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self::with_config(code, VmConfig::default())
    }

    /// [`Vm::new`] with an explicit configuration.
    #[must_use]
    pub fn with_config(code: impl Into<String>, config: VmConfig) -> Self {
        let mut key = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut key);
        let id: String = key.iter().map(|b| format!("{b:02x}")).collect();
        Self::new_with_id(code, config, id)
    }

    /// Construct with a caller-chosen identity. Factories derive child
    /// identities from their own, so replays reproduce them.
    pub(crate) fn new_with_id(code: impl Into<String>, config: VmConfig, id: String) -> Self {
        let (phase_tx, _) = watch::channel(VmPhase::Constructed);
        Self {
            id,
            code: code.into(),
            config,
            caller: CallerSlot::new(),
            phase_tx,
            exec_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            namespaces: StdMutex::new(BTreeMap::new()),
            state: StdRwLock::new(None),
        }
    }

    /// Unique VM identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The guest script, verbatim.
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> VmPhase {
        *self.phase_tx.borrow()
    }

    /// Observe lifecycle transitions (`ready` is the flip to
    /// `Evaluated`, `close` the flip to `Closed`).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<VmPhase> {
        self.phase_tx.subscribe()
    }

    /// Install a `system.<name>` namespace. Must precede deploy.
    pub fn install_namespace(&self, name: impl Into<String>, ns: Arc<dyn SystemNamespace>) {
        self.namespaces
            .lock()
            .expect("namespace lock")
            .insert(name.into(), ns);
    }

    /// Exported method names.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy.
    pub fn exports(&self) -> Result<Vec<String>, VmError> {
        let state = self.state.read().expect("vm state lock");
        state
            .as_ref()
            .map(|d| d.sandbox.exports())
            .ok_or(VmError::NotDeployed)
    }

    /// Durable URL of the call log.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy.
    pub fn call_log_url(&self) -> Result<String, VmError> {
        let state = self.state.read().expect("vm state lock");
        state
            .as_ref()
            .map(|d| d.log.url().to_string())
            .ok_or(VmError::NotDeployed)
    }

    /// Durable URL of the files archive.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy.
    pub fn files_archive_url(&self) -> Result<String, VmError> {
        let state = self.state.read().expect("vm state lock");
        state
            .as_ref()
            .map(|d| d.archive.url().to_string())
            .ok_or(VmError::NotDeployed)
    }

    /// The call log handle.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy.
    pub fn call_log(&self) -> Result<CallLog, VmError> {
        let state = self.state.read().expect("vm state lock");
        state
            .as_ref()
            .map(|d| d.log.clone())
            .ok_or(VmError::NotDeployed)
    }

    /// The files archive handle.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy.
    pub fn files_archive(&self) -> Result<Arc<dyn VersionedArchive>, VmError> {
        let state = self.state.read().expect("vm state lock");
        state
            .as_ref()
            .map(|d| Arc::clone(&d.archive))
            .ok_or(VmError::NotDeployed)
    }

    /// A guest-equivalent files adaptor over this VM's archive.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy.
    pub fn files(&self) -> Result<FilesAdaptor, VmError> {
        Ok(FilesAdaptor::new(self.files_archive()?))
    }

    /// Bind stores under `options.dir`, evaluate the script, run the
    /// guest `init` export (logged like any call), and flip to
    /// `Evaluated`. Idempotent once deployed.
    ///
    /// # Errors
    ///
    /// `VmError::UrlMismatch` on any URL disagreement when reopening;
    /// store and script errors otherwise.
    pub async fn deploy(self: &Arc<Self>, options: DeployOptions) -> Result<(), VmError> {
        self.deploy_inner(DeployTarget::Dir(options), true).await
    }

    /// Deploy onto fresh memory-backed stores (scratch space).
    ///
    /// # Errors
    ///
    /// Store and script errors.
    pub async fn deploy_ephemeral(self: &Arc<Self>) -> Result<(), VmError> {
        self.deploy_inner(
            DeployTarget::Memory {
                title: "scratch".to_string(),
                identity: None,
            },
            true,
        )
        .await
    }

    /// Deploy without running the `init` export; the replay driver
    /// re-executes it from the ledger instead, preserving sequence
    /// numbers exactly. The reconstructed stores claim the identities of
    /// the stores they rebuild, so the replayed `init` record (and any
    /// URLs the guest observed) come out byte-identical.
    pub(crate) async fn deploy_for_replay(
        self: &Arc<Self>,
        dir: Option<PathBuf>,
        claimed: StoreIdentity,
    ) -> Result<(), VmError> {
        let target = match dir {
            Some(dir) => {
                DeployTarget::Dir(DeployOptions::new(dir, "replay").with_identity(claimed))
            }
            None => DeployTarget::Memory {
                title: "replay".to_string(),
                identity: Some(claimed),
            },
        };
        self.deploy_inner(target, false).await
    }

    async fn deploy_inner(
        self: &Arc<Self>,
        target: DeployTarget,
        run_init: bool,
    ) -> Result<(), VmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VmError::Closed);
        }
        if self.state.read().expect("vm state lock").is_some() {
            return Ok(());
        }

        let (archive, log): (Arc<dyn VersionedArchive>, CallLog);
        let network = match &target {
            DeployTarget::Dir(options) => options.network.clone(),
            DeployTarget::Memory { .. } => None,
        };
        match target {
            DeployTarget::Dir(options) => {
                let meta_path = options.dir.join(META_FILE);
                if meta_path.exists() {
                    (archive, log) = self.reopen(&options, &meta_path).await?;
                } else {
                    std::fs::create_dir_all(&options.dir).map_err(StoreError::from)?;
                    if let Some(url) = &options.url {
                        warn!(vm = %self.id, url = %url, "ignoring url option on fresh deploy");
                    }
                    let archive_dir = options.dir.join(ARCHIVE_DIR);
                    let log_dir = options.dir.join(LOG_DIR);
                    let (created, created_log) = match options.identity {
                        Some(identity) => {
                            let created = Archive::create_with_url(
                                &archive_dir,
                                &options.title,
                                identity.files_archive_url,
                            )?;
                            let created_log = CallLog::create_with_url(
                                &log_dir,
                                identity.call_log_url,
                                &self.code,
                                created.url(),
                            )
                            .await?;
                            (created, created_log)
                        }
                        None => {
                            let created = Archive::create(&archive_dir, &options.title)?;
                            let created_log =
                                CallLog::create(&log_dir, &self.code, created.url()).await?;
                            (created, created_log)
                        }
                    };
                    let meta = VmMeta {
                        title: options.title.clone(),
                        url: created.url().to_string(),
                    };
                    let meta_json =
                        serde_json::to_vec_pretty(&meta).expect("meta serialization is infallible");
                    std::fs::write(&meta_path, meta_json).map_err(StoreError::from)?;
                    archive = Arc::new(created);
                    log = created_log;
                }
            }
            DeployTarget::Memory { title, identity } => {
                let (created, created_log) = match identity {
                    Some(identity) => {
                        let created =
                            Archive::memory_with_url(&title, identity.files_archive_url);
                        let created_log = CallLog::create_in_memory_with_url(
                            identity.call_log_url,
                            &self.code,
                            created.url(),
                        )
                        .await?;
                        (created, created_log)
                    }
                    None => {
                        let created = Archive::memory(&title);
                        let created_log =
                            CallLog::create_in_memory(&self.code, created.url()).await?;
                        (created, created_log)
                    }
                };
                archive = Arc::new(created);
                log = created_log;
            }
        }

        if let Some(network) = &network {
            network.announce_archive(Arc::clone(&archive)).await;
            network.announce_log(Arc::clone(log.as_log())).await;
        }

        let _ = self.phase_tx.send(VmPhase::Deployed);

        let namespaces = std::mem::take(&mut *self.namespaces.lock().expect("namespace lock"));
        let surface = SystemSurface::new(
            self.id.clone(),
            FilesAdaptor::new(Arc::clone(&archive)),
            self.caller.clone(),
            namespaces,
        );
        let sandbox = Arc::new(Sandbox::evaluate(&self.code, Arc::new(surface))?);

        let (queue_tx, queue_rx) = mpsc::channel(self.config.queue_capacity);
        {
            let mut state = self.state.write().expect("vm state lock");
            *state = Some(Deployed {
                archive,
                log,
                sandbox: Arc::clone(&sandbox),
                queue_tx: Some(queue_tx),
                worker: None,
            });
        }
        let worker = tokio::spawn(worker_loop(Arc::clone(self), queue_rx));
        if let Some(deployed) = self.state.write().expect("vm state lock").as_mut() {
            deployed.worker = Some(worker);
        }

        if run_init && sandbox.has_method("init") {
            let outcome = self
                .execute_call(CallInvocation {
                    method_name: "init".to_string(),
                    args: vec![],
                    user_id: None,
                })
                .await;
            match outcome {
                Ok(_) => {}
                Err(VmError::Guest { message }) => {
                    warn!(vm = %self.id, %message, "guest init failed");
                }
                Err(other) => return Err(other),
            }
        }

        let _ = self.phase_tx.send(VmPhase::Evaluated);
        info!(vm = %self.id, "vm ready");
        Ok(())
    }

    /// Reopen existing stores, verifying every recorded URL against the
    /// caller's expectation, and repair a dangling archive version left
    /// by a crash between execution and append.
    async fn reopen(
        &self,
        options: &DeployOptions,
        meta_path: &std::path::Path,
    ) -> Result<(Arc<dyn VersionedArchive>, CallLog), VmError> {
        let meta_raw = std::fs::read(meta_path).map_err(StoreError::from)?;
        let meta: VmMeta = serde_json::from_slice(&meta_raw)
            .map_err(|e| VmError::MalformedLog(format!("bad meta.json: {e}")))?;
        if let Some(expected) = &options.url {
            if expected != &meta.url {
                return Err(VmError::UrlMismatch {
                    expected: expected.clone(),
                    actual: meta.url,
                });
            }
        }
        if let Some(identity) = &options.identity {
            if identity.files_archive_url != meta.url {
                return Err(VmError::UrlMismatch {
                    expected: identity.files_archive_url.clone(),
                    actual: meta.url,
                });
            }
        }
        let archive = Archive::open(&options.dir.join(ARCHIVE_DIR))?;
        if archive.url() != meta.url {
            return Err(VmError::UrlMismatch {
                expected: meta.url,
                actual: archive.url().to_string(),
            });
        }
        let log = CallLog::open(&options.dir.join(LOG_DIR)).await?;
        let init = log.init_entry().await?;
        if init.files_archive_url != meta.url {
            return Err(VmError::UrlMismatch {
                expected: meta.url,
                actual: init.files_archive_url,
            });
        }

        // The log is the source of truth: a crash after a mutation but
        // before the append leaves the archive one version ahead.
        let expected_version = last_logged_version(&log).await?;
        let actual_version = archive.version();
        if actual_version > expected_version {
            warn!(
                vm = %self.id,
                logged = expected_version,
                actual = actual_version,
                "archive ran ahead of the log; reverting"
            );
            archive.revert_to(expected_version).await?;
        } else if actual_version < expected_version {
            return Err(VmError::Store(StoreError::Corrupt {
                line: 0,
                reason: format!(
                    "archive at version {actual_version} but log records {expected_version}"
                ),
            }));
        }
        Ok((Arc::new(archive), log))
    }

    /// Queue a call; completion arrives on the returned channel. Queue
    /// order is execution order.
    ///
    /// # Errors
    ///
    /// `VmError::QueueFull` when the queue is at capacity,
    /// `VmError::Closed` / `NotDeployed` per lifecycle.
    pub fn enqueue_call(
        &self,
        invocation: CallInvocation,
    ) -> Result<oneshot::Receiver<Result<Value, VmError>>, VmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VmError::Closed);
        }
        let queue_tx = {
            let state = self.state.read().expect("vm state lock");
            let deployed = state.as_ref().ok_or(VmError::NotDeployed)?;
            deployed
                .queue_tx
                .as_ref()
                .ok_or(VmError::Closed)?
                .clone()
        };
        let (respond, receiver) = oneshot::channel();
        queue_tx
            .try_send(QueuedCall {
                invocation,
                respond,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => VmError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => VmError::Closed,
            })?;
        Ok(receiver)
    }

    /// Queue a call and await its completion.
    ///
    /// # Errors
    ///
    /// Queueing errors, then whatever the call itself produced.
    pub async fn call(&self, invocation: CallInvocation) -> Result<Value, VmError> {
        let receiver = self.enqueue_call(invocation)?;
        receiver.await.map_err(|_| VmError::Closed)?
    }

    /// The serialized execution path.
    ///
    /// Runs the guest method under the caller identity, observes the
    /// archive version afterward, appends the call record **whether the
    /// method succeeded or threw**, and returns the result.
    ///
    /// A second concurrent invocation is a programmer error and is
    /// rejected with `VmError::CallOverlap` without touching the ledger.
    ///
    /// # Errors
    ///
    /// `VmError::Guest` re-surfaces guest errors after recording them;
    /// store errors abort the append.
    pub async fn execute_call(&self, invocation: CallInvocation) -> Result<Value, VmError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VmError::Closed);
        }
        let (archive, log, sandbox) = {
            let state = self.state.read().expect("vm state lock");
            let deployed = state.as_ref().ok_or(VmError::NotDeployed)?;
            (
                Arc::clone(&deployed.archive),
                deployed.log.clone(),
                Arc::clone(&deployed.sandbox),
            )
        };
        let _guard = self.exec_lock.try_lock().map_err(|_| VmError::CallOverlap)?;
        if !sandbox.has_method(&invocation.method_name) {
            return Err(VmError::NoSuchMethod(invocation.method_name));
        }

        let _ = self.phase_tx.send(VmPhase::Executing);
        debug!(
            vm = %self.id,
            method = %invocation.method_name,
            user = invocation.user_id.as_deref().unwrap_or(""),
            "executing call"
        );
        self.caller.set(invocation.user_id.clone());
        let outcome = sandbox
            .call(&invocation.method_name, invocation.args.clone())
            .await;
        self.caller.clear();

        let files_version = archive.version();
        let entry = CallEntry {
            call: CallRequest {
                method_name: invocation.method_name,
                args: invocation.args,
                user_id: invocation.user_id,
            },
            result: CallResult {
                files_version,
                res: match &outcome {
                    Ok(value) if !value.is_null() => Some(value.clone()),
                    _ => None,
                },
                err: outcome.as_ref().err().map(|e| GuestErrorPayload {
                    message: e.to_string(),
                }),
            },
        };
        log.append_call(entry).await?;

        let _ = self.phase_tx.send(VmPhase::Evaluated);
        // Capacity refusals stay structural so callers (and the RPC
        // adapter) can tell them apart from ordinary guest errors.
        outcome.map_err(|e| match e {
            ScriptError::Capacity { max } => VmError::AtCapacity { max },
            other => VmError::Guest {
                message: other.to_string(),
            },
        })
    }

    /// Close the VM: cancel queued calls, wait for the active one, then
    /// release the archive and the log, in that order. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (queue_tx, worker) = {
            let mut state = self.state.write().expect("vm state lock");
            match state.as_mut() {
                Some(deployed) => (deployed.queue_tx.take(), deployed.worker.take()),
                None => (None, None),
            }
        };
        drop(queue_tx);
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        // Wait out a directly-issued active call before releasing.
        let _guard = self.exec_lock.lock().await;
        drop(_guard);
        let _ = self.state.write().expect("vm state lock").take();
        let _ = self.phase_tx.send(VmPhase::Closed);
        info!(vm = %self.id, "vm closed");
    }
}

/// Drains the call queue strictly in order, one call at a time. Queued
/// calls observed after close fail with `Closed` instead of executing.
async fn worker_loop(vm: Arc<Vm>, mut queue_rx: mpsc::Receiver<QueuedCall>) {
    while let Some(queued) = queue_rx.recv().await {
        if vm.closed.load(Ordering::SeqCst) {
            let _ = queued.respond.send(Err(VmError::Closed));
            continue;
        }
        let result = vm.execute_call(queued.invocation).await;
        let _ = queued.respond.send(result);
    }
}

/// The files version the ledger last recorded: 1 right after `init`,
/// otherwise the version in the newest call entry.
async fn last_logged_version(log: &CallLog) -> Result<u64, VmError> {
    let mut seq = log.len();
    while seq > 1 {
        seq -= 1;
        let entry = log
            .get(seq, hindsight_store::GetOptions::default())
            .await?
            .ok_or_else(|| VmError::MalformedLog("log shrank during open".to_string()))?;
        match entry {
            DecodedEntry::Known(LogEntry::Call(call)) => {
                return Ok(call.result.files_version)
            }
            DecodedEntry::Known(LogEntry::Init(_)) => {
                return Err(VmError::MalformedLog(
                    "init entry past sequence 0".to_string(),
                ))
            }
            DecodedEntry::Unknown { .. } => continue,
        }
    }
    Ok(1)
}
