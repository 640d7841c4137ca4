//! The multi-tenant factory.
//!
//! A factory is a VM whose guest provisions and tears down child VMs
//! through a native `system.vms` namespace. Composition, not inheritance:
//! the factory *has* a [`Vm`] plus a child registry and a mount seam.
//!
//! Child identity is content-derived — `sha256(factory archive url,
//! canonical provision args)` — and the child's store URLs derive from
//! that identity. Provisioning is therefore reproducible: replaying the
//! factory's log provisions children with identical ids and URLs, which
//! is what lets a third party verify the factory ledger byte-for-byte
//! and then audit each child independently.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock, Weak};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use hindsight_store::{CallLog, Encoding, LocalNetwork};
use hindsight_types::Value;

use crate::replay::{replay_entries, validated_entries, ReplayAssertions, ReplayOptions};
use crate::sandbox::SystemNamespace;
use crate::script::ScriptError;
use crate::vm::{CallInvocation, DeployOptions, StoreIdentity, Vm, VmConfig, VmPhase};
use crate::VmError;

/// Mount bookkeeping seam, implemented by the RPC adapter. The factory
/// holds non-owning mounts for its children.
pub trait Mounter: Send + Sync {
    /// Register a VM's exports under `path`.
    fn mount(&self, path: &str, vm: Arc<Vm>) -> Result<(), VmError>;

    /// Remove a mount.
    fn unmount(&self, path: &str) -> Result<(), VmError>;
}

/// Factory configuration.
#[derive(Debug, Clone, Default)]
pub struct FactoryConfig {
    /// Bound on live children; `None` is unbounded.
    pub max_vms: Option<usize>,
    /// Configuration applied to each child (and the factory itself).
    pub vm: VmConfig,
}

struct FactoryShared {
    factory_vm: Weak<Vm>,
    children: StdMutex<BTreeMap<String, Arc<Vm>>>,
    max_vms: Option<usize>,
    vm_config: VmConfig,
    dir: StdRwLock<Option<PathBuf>>,
    mounter: StdRwLock<Option<Arc<dyn Mounter>>>,
    network: StdRwLock<Option<Arc<LocalNetwork>>>,
}

impl FactoryShared {
    fn unmount_quietly(&self, id: &str) {
        if let Some(mounter) = self.mounter.read().expect("mounter lock").as_ref() {
            if let Err(error) = mounter.unmount(&format!("/{id}")) {
                debug!(child = %id, %error, "unmount on shutdown failed");
            }
        }
    }
}

/// A VM that provisions other VMs.
pub struct Factory {
    vm: Arc<Vm>,
    shared: Arc<FactoryShared>,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory")
            .field("vm", &self.vm.id())
            .field("num_vms", &self.num_vms())
            .finish()
    }
}

impl Factory {
    /// Construct a factory around a guest script. The script must export
    /// `provision_vm` and `shutdown_vm`, which it implements in terms of
    /// the installed native `system.vms` namespace.
    #[must_use]
    pub fn new(code: impl Into<String>, config: FactoryConfig) -> Self {
        let vm = Arc::new(Vm::with_config(code, config.vm.clone()));
        let shared = Arc::new(FactoryShared {
            factory_vm: Arc::downgrade(&vm),
            children: StdMutex::new(BTreeMap::new()),
            max_vms: config.max_vms,
            vm_config: config.vm,
            dir: StdRwLock::new(None),
            mounter: StdRwLock::new(None),
            network: StdRwLock::new(None),
        });
        vm.install_namespace(
            "vms",
            Arc::new(VmsNamespace {
                shared: Arc::clone(&shared),
            }),
        );
        Self { vm, shared }
    }

    /// Install the mount seam. Must precede deploy for children to be
    /// remotely callable.
    pub fn set_mounter(&self, mounter: Arc<dyn Mounter>) {
        *self.shared.mounter.write().expect("mounter lock") = Some(mounter);
    }

    /// The factory's own VM (for mounting and direct calls).
    #[must_use]
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    /// Live child count.
    #[must_use]
    pub fn num_vms(&self) -> usize {
        self.shared.children.lock().expect("children lock").len()
    }

    /// Look up a live child.
    #[must_use]
    pub fn child(&self, id: &str) -> Option<Arc<Vm>> {
        self.shared
            .children
            .lock()
            .expect("children lock")
            .get(id)
            .cloned()
    }

    /// Deploy the factory VM; children deploy under the same directory.
    ///
    /// # Errors
    ///
    /// As [`Vm::deploy`].
    pub async fn deploy(&self, options: DeployOptions) -> Result<(), VmError> {
        *self.shared.dir.write().expect("dir lock") = Some(options.dir.clone());
        *self.shared.network.write().expect("network lock") = options.network.clone();
        self.vm.deploy(options).await
    }

    /// Rebuild a factory by replaying its call log. Children are
    /// re-provisioned with their original (derived) identities as the
    /// recorded `provision_vm` calls re-execute; they deploy under
    /// `options.dir`, or a scratch directory when it is absent.
    ///
    /// # Errors
    ///
    /// As [`Vm::from_call_log`].
    pub async fn from_call_log(
        log: &CallLog,
        assertions: ReplayAssertions,
        config: FactoryConfig,
        options: ReplayOptions,
    ) -> Result<Factory, VmError> {
        let (entries, init) = validated_entries(log, &assertions).await?;
        let factory = Factory::new(init.code.clone(), config);
        for (name, namespace) in options.namespaces {
            factory.vm.install_namespace(name, namespace);
        }
        let children_dir = options.dir.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("hindsight-replay-{}", factory.vm.id()))
        });
        *factory.shared.dir.write().expect("dir lock") = Some(children_dir);
        factory
            .vm
            .deploy_for_replay(
                None,
                StoreIdentity {
                    files_archive_url: init.files_archive_url.clone(),
                    call_log_url: log.url().to_string(),
                },
            )
            .await?;
        info!(vm = %factory.vm.id(), entries = entries.len(), "replaying factory log");
        replay_entries(&factory.vm, &entries[1..]).await?;
        Ok(factory)
    }

    /// Host-restart path: re-run the guest's `provision_vm` for every
    /// `/vms/*.json` the factory guest saved into its own archive. Each
    /// restoration is logged like any call, so the restart itself stays
    /// auditable; because child identity derives from the saved args,
    /// restored children reopen their existing stores. Returns the
    /// number of children restored.
    ///
    /// # Errors
    ///
    /// `VmError::NotDeployed` before deploy; store errors reading the
    /// archive.
    pub async fn reprovision_saved_vms(&self) -> Result<usize, VmError> {
        let files = self.vm.files()?;
        let rows = match files.read_dir("/vms").await {
            Ok(rows) => rows,
            Err(hindsight_store::StoreError::NotFound(_)) => return Ok(0),
            Err(other) => return Err(other.into()),
        };
        let mut restored = 0;
        let names: Vec<String> = rows
            .as_array()
            .unwrap_or(&[])
            .iter()
            .filter_map(|row| row.as_object())
            .filter_map(|row| row.get("name").and_then(Value::as_str))
            .filter(|name| name.ends_with(".json"))
            .map(str::to_string)
            .collect();
        for name in names {
            let args = files
                .read_file(&format!("/vms/{name}"), Encoding::Json)
                .await?;
            let outcome = self
                .vm
                .call(CallInvocation {
                    method_name: "provision_vm".to_string(),
                    args: vec![args],
                    user_id: None,
                })
                .await;
            match outcome {
                Ok(_) => restored += 1,
                Err(VmError::Guest { message }) => {
                    warn!(saved = %name, %message, "reprovision failed");
                }
                Err(VmError::AtCapacity { max }) => {
                    warn!(saved = %name, max, "reprovision refused at capacity");
                }
                Err(other) => return Err(other),
            }
        }
        info!(vm = %self.vm.id(), restored, "reprovisioned saved vms");
        Ok(restored)
    }

    /// Close every child, then the factory VM. Idempotent.
    pub async fn close(&self) {
        let children: Vec<(String, Arc<Vm>)> = {
            let mut map = self.shared.children.lock().expect("children lock");
            std::mem::take(&mut *map).into_iter().collect()
        };
        for (id, child) in children {
            self.shared.unmount_quietly(&id);
            child.close().await;
        }
        self.vm.close().await;
    }
}

/// Child identity: 16 hex chars of `sha256(factory url, canonical args)`.
fn derive_child_id(factory_url: &str, spec: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"hindsight-child");
    hasher.update(factory_url.as_bytes());
    hasher.update(spec.canonical_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Child store URLs derive from the child identity.
fn derive_store_url(scheme: &str, child_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"hindsight-store");
    hasher.update(scheme.as_bytes());
    hasher.update(child_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();
    format!("{scheme}://{hex}")
}

/// The native `system.vms` namespace bound into the factory guest.
struct VmsNamespace {
    shared: Arc<FactoryShared>,
}

impl VmsNamespace {
    async fn provision(&self, args: Vec<Value>) -> Result<Value, ScriptError> {
        let spec_value = args.first().cloned().unwrap_or(Value::Null);
        let spec = spec_value.as_object().ok_or_else(|| {
            ScriptError::Runtime("provision_vm expects {code, title}".to_string())
        })?;
        let code = match spec.get("code").and_then(Value::as_str) {
            Some(code) if !code.is_empty() => code.to_string(),
            _ => {
                return Err(ScriptError::Guest(
                    "code must be a non-empty string".to_string(),
                ))
            }
        };

        let shared = &self.shared;
        {
            let children = shared.children.lock().expect("children lock");
            if let Some(max) = shared.max_vms {
                if children.len() >= max {
                    return Err(ScriptError::Capacity { max });
                }
            }
        }
        let base_dir = shared
            .dir
            .read()
            .expect("dir lock")
            .clone()
            .ok_or_else(|| ScriptError::Runtime("factory is not deployed".to_string()))?;
        let network = shared.network.read().expect("network lock").clone();
        let factory_url = shared
            .factory_vm
            .upgrade()
            .ok_or_else(|| ScriptError::Runtime("factory vm is gone".to_string()))?
            .files_archive_url()
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;

        let id = derive_child_id(&factory_url, &spec_value);
        if shared
            .children
            .lock()
            .expect("children lock")
            .contains_key(&id)
        {
            return Err(ScriptError::Guest(format!("vm already provisioned: {id}")));
        }
        let title = spec
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(&id)
            .to_string();

        let child = Arc::new(Vm::new_with_id(code, shared.vm_config.clone(), id.clone()));
        let mut deploy = DeployOptions::new(base_dir.join(&id), title).with_identity(
            StoreIdentity {
                files_archive_url: derive_store_url("varc", &id),
                call_log_url: derive_store_url("apl", &id),
            },
        );
        if let Some(network) = network {
            deploy = deploy.with_network(network);
        }
        child
            .deploy(deploy)
            .await
            .map_err(|e| ScriptError::Guest(e.to_string()))?;

        let call_log_url = child
            .call_log_url()
            .map_err(|e| ScriptError::Guest(e.to_string()))?;
        let files_archive_url = child
            .files_archive_url()
            .map_err(|e| ScriptError::Guest(e.to_string()))?;

        shared
            .children
            .lock()
            .expect("children lock")
            .insert(id.clone(), Arc::clone(&child));
        spawn_close_watcher(Arc::clone(shared), id.clone(), &child);

        let mount_result = shared
            .mounter
            .read()
            .expect("mounter lock")
            .as_ref()
            .map(|mounter| mounter.mount(&format!("/{id}"), Arc::clone(&child)));
        if let Some(Err(error)) = mount_result {
            shared.children.lock().expect("children lock").remove(&id);
            child.close().await;
            return Err(ScriptError::Guest(error.to_string()));
        }

        info!(child = %id, "provisioned vm");
        Ok(Value::object([
            ("id", Value::Str(id)),
            ("callLogUrl", Value::Str(call_log_url)),
            ("filesArchiveUrl", Value::Str(files_archive_url)),
        ]))
    }

    async fn shutdown(&self, args: Vec<Value>) -> Result<Value, ScriptError> {
        let id = args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| ScriptError::Runtime("shutdown_vm expects an id".to_string()))?;
        let child = self
            .shared
            .children
            .lock()
            .expect("children lock")
            .remove(id)
            .ok_or_else(|| ScriptError::Guest(format!("unknown vm: {id}")))?;
        self.shared.unmount_quietly(id);
        child.close().await;
        info!(child = %id, "shut down vm");
        Ok(Value::Null)
    }
}

#[async_trait]
impl SystemNamespace for VmsNamespace {
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        match method {
            "provision_vm" => self.provision(args).await,
            "shutdown_vm" => self.shutdown(args).await,
            other => Err(ScriptError::Runtime(format!(
                "unknown vms operation `{other}`"
            ))),
        }
    }
}

/// Keep the registry honest when a child closes behind the factory's
/// back (e.g. a direct `close` instead of `shutdown_vm`).
fn spawn_close_watcher(shared: Arc<FactoryShared>, id: String, child: &Arc<Vm>) {
    let mut phases = child.subscribe();
    tokio::spawn(async move {
        loop {
            if *phases.borrow_and_update() == VmPhase::Closed {
                break;
            }
            if phases.changed().await.is_err() {
                break;
            }
        }
        let removed = shared
            .children
            .lock()
            .expect("children lock")
            .remove(&id)
            .is_some();
        if removed {
            shared.unmount_quietly(&id);
            debug!(child = %id, "removed closed child from registry");
        }
    });
}
