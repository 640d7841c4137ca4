//! The guest sandbox: a curated `system` surface plus the exported
//! method table.
//!
//! Hosts install the surface before evaluation; the guest can read it but
//! never rebind it (the interpreter treats `system` as a reserved root,
//! so nothing a guest does leaks back to the host). The `files` namespace
//! is native; `vms` and any test namespaces arrive through
//! [`SystemNamespace`].

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::info;

use hindsight_store::{Encoding, FilesAdaptor};
use hindsight_types::Value;

use crate::script::{invoke_method, parse_script, CallCtx, Script, ScriptError};

/// The caller context slot: the opaque user id of the currently executing
/// call. One cell per VM; serialized execution makes reads race-free.
#[derive(Debug, Clone, Default)]
pub struct CallerSlot(Arc<RwLock<Option<String>>>);

impl CallerSlot {
    /// An empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the caller for the duration of a call.
    pub fn set(&self, user_id: Option<String>) {
        *self.0.write().expect("caller slot lock") = user_id;
    }

    /// Clear when no call is active.
    pub fn clear(&self) {
        self.set(None);
    }

    /// The current caller id; empty string when unset.
    #[must_use]
    pub fn get(&self) -> String {
        self.0
            .read()
            .expect("caller slot lock")
            .clone()
            .unwrap_or_default()
    }
}

/// A host-installed `system.<name>` namespace.
#[async_trait]
pub trait SystemNamespace: Send + Sync {
    /// Invoke one namespace method with evaluated arguments.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value, ScriptError>;
}

/// The curated global surface a guest sees.
pub struct SystemSurface {
    vm_id: String,
    files: FilesAdaptor,
    caller: CallerSlot,
    namespaces: BTreeMap<String, Arc<dyn SystemNamespace>>,
}

impl std::fmt::Debug for SystemSurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSurface")
            .field("vm_id", &self.vm_id)
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SystemSurface {
    /// Assemble a surface.
    #[must_use]
    pub fn new(
        vm_id: String,
        files: FilesAdaptor,
        caller: CallerSlot,
        namespaces: BTreeMap<String, Arc<dyn SystemNamespace>>,
    ) -> Self {
        Self {
            vm_id,
            files,
            caller,
            namespaces,
        }
    }

    /// Current caller id (`system.caller.id`).
    #[must_use]
    pub fn caller_id(&self) -> String {
        self.caller.get()
    }

    /// The files adaptor behind `system.files`.
    #[must_use]
    pub fn files(&self) -> &FilesAdaptor {
        &self.files
    }

    /// Guest console output (`system.log`).
    pub(crate) fn console_log(&self, args: &[Value]) {
        let line = args
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "hindsight::guest", vm = %self.vm_id, "{line}");
    }

    /// Dispatch `system.<ns>.<method>(args…)`.
    pub(crate) async fn invoke(
        &self,
        ns: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        if ns == "files" {
            return self.invoke_files(method, args).await;
        }
        match self.namespaces.get(ns) {
            Some(namespace) => namespace.invoke(method, args).await,
            None => Err(ScriptError::Runtime(format!(
                "unknown namespace `system.{ns}`"
            ))),
        }
    }

    async fn invoke_files(&self, method: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        let guest = |e: hindsight_store::StoreError| ScriptError::Guest(e.to_string());
        let path_arg = |index: usize| -> Result<String, ScriptError> {
            match args.get(index) {
                Some(Value::Str(path)) => Ok(path.clone()),
                other => Err(ScriptError::Runtime(format!(
                    "files.{method} expects a path string, got {other:?}"
                ))),
            }
        };
        let encoding_arg = |index: usize| -> Result<Encoding, ScriptError> {
            match args.get(index) {
                None | Some(Value::Null) => Ok(Encoding::Utf8),
                Some(Value::Str(name)) => Encoding::parse(name).map_err(guest),
                other => Err(ScriptError::Runtime(format!(
                    "files.{method} expects an encoding name, got {other:?}"
                ))),
            }
        };
        let version_arg = |index: usize| -> Option<u64> {
            match args.get(index) {
                Some(Value::Int(n)) if *n >= 0 => Some(*n as u64),
                _ => None,
            }
        };

        match method {
            "get_info" => Ok(self.files.get_info()),
            "stat" => self.files.stat(&path_arg(0)?).await.map_err(guest),
            "read_file" => {
                let path = path_arg(0)?;
                let encoding = encoding_arg(1)?;
                self.files.read_file(&path, encoding).await.map_err(guest)
            }
            "read_dir" => self.files.read_dir(&path_arg(0)?).await.map_err(guest),
            "history" => self
                .files
                .history(version_arg(0), version_arg(1))
                .await
                .map_err(guest),
            "write_file" => {
                let path = path_arg(0)?;
                let value = args.get(1).cloned().unwrap_or(Value::Null);
                let encoding = encoding_arg(2)?;
                let version = self
                    .files
                    .write_file(&path, &value, encoding)
                    .await
                    .map_err(guest)?;
                Ok(Value::Int(version as i64))
            }
            "mkdir" => {
                let version = self.files.mkdir(&path_arg(0)?).await.map_err(guest)?;
                Ok(Value::Int(version as i64))
            }
            "unlink" => {
                let version = self.files.unlink(&path_arg(0)?).await.map_err(guest)?;
                Ok(Value::Int(version as i64))
            }
            "rmdir" => {
                let path = path_arg(0)?;
                let recursive = args
                    .get(1)
                    .map(Value::is_truthy)
                    .unwrap_or(false);
                let version = self.files.rmdir(&path, recursive).await.map_err(guest)?;
                Ok(Value::Int(version as i64))
            }
            other => Err(ScriptError::Runtime(format!(
                "unknown files operation `{other}`"
            ))),
        }
    }
}

/// An evaluated guest: parsed script bound to its surface.
pub struct Sandbox {
    script: Script,
    surface: Arc<SystemSurface>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("exports", &self.script.exports())
            .finish()
    }
}

impl Sandbox {
    /// Evaluate guest code: parse it and bind the surface. Runs no guest
    /// statements — execution only happens through [`Sandbox::call`].
    ///
    /// # Errors
    ///
    /// Parse errors from the script.
    pub fn evaluate(code: &str, surface: Arc<SystemSurface>) -> Result<Self, ScriptError> {
        let script = parse_script(code)?;
        Ok(Self { script, surface })
    }

    /// Exported method names.
    #[must_use]
    pub fn exports(&self) -> Vec<String> {
        self.script.exports()
    }

    /// Whether a method is exported.
    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.script.method(name).is_some()
    }

    /// Run one exported method to completion.
    ///
    /// # Errors
    ///
    /// `ScriptError::Runtime` for an unknown method; guest errors
    /// otherwise.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ScriptError> {
        let method = self
            .script
            .method(name)
            .ok_or_else(|| ScriptError::Runtime(format!("unknown method `{name}`")))?;
        let ctx = CallCtx {
            script: &self.script,
            surface: &self.surface,
        };
        invoke_method(&ctx, method, args, 0).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hindsight_store::Archive;

    fn surface() -> Arc<SystemSurface> {
        let archive = Arc::new(Archive::memory("t"));
        Arc::new(SystemSurface::new(
            "vm-test".to_string(),
            FilesAdaptor::new(archive),
            CallerSlot::new(),
            BTreeMap::new(),
        ))
    }

    #[tokio::test]
    async fn default_parameters_apply() {
        let sandbox = Sandbox::evaluate("method func1(v = 0) { v + 1 }", surface()).unwrap();
        assert_eq!(
            sandbox.call("func1", vec![]).await.unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            sandbox.call("func1", vec![Value::Int(5)]).await.unwrap(),
            Value::Int(6)
        );
    }

    #[tokio::test]
    async fn files_namespace_round_trips() {
        let sandbox = Sandbox::evaluate(
            r#"
            method w(v) { system.files.write_file("/file", v) }
            method r() { system.files.read_file("/file") }
            "#,
            surface(),
        )
        .unwrap();
        let version = sandbox
            .call("w", vec![Value::Str("foo".to_string())])
            .await
            .unwrap();
        assert_eq!(version, Value::Int(2));
        assert_eq!(
            sandbox.call("r", vec![]).await.unwrap(),
            Value::Str("foo".to_string())
        );
    }

    #[tokio::test]
    async fn caller_slot_is_visible() {
        let archive = Arc::new(Archive::memory("t"));
        let caller = CallerSlot::new();
        let surface = Arc::new(SystemSurface::new(
            "vm-test".to_string(),
            FilesAdaptor::new(archive),
            caller.clone(),
            BTreeMap::new(),
        ));
        let sandbox = Sandbox::evaluate("method who() { system.caller.id }", surface).unwrap();
        assert_eq!(
            sandbox.call("who", vec![]).await.unwrap(),
            Value::Str(String::new())
        );
        caller.set(Some("alice".to_string()));
        assert_eq!(
            sandbox.call("who", vec![]).await.unwrap(),
            Value::Str("alice".to_string())
        );
    }

    #[tokio::test]
    async fn fail_surfaces_verbatim() {
        let sandbox =
            Sandbox::evaluate(r#"method f() { fail("boom"); }"#, surface()).unwrap();
        let err = sandbox.call("f", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[tokio::test]
    async fn guest_methods_can_call_each_other() {
        let sandbox = Sandbox::evaluate(
            "method half(n) { n / 2 } method quarter(n) { half(half(n)) }",
            surface(),
        )
        .unwrap();
        assert_eq!(
            sandbox.call("quarter", vec![Value::Int(8)]).await.unwrap(),
            Value::Int(2)
        );
    }

    #[tokio::test]
    async fn path_escape_reaches_guest_as_error() {
        let sandbox = Sandbox::evaluate(
            r#"method w() { system.files.write_file("/../oops", "x") }"#,
            surface(),
        )
        .unwrap();
        let err = sandbox.call("w", vec![]).await.unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[tokio::test]
    async fn objects_and_loops_evaluate() {
        let sandbox = Sandbox::evaluate(
            r#"
            method sum(n) {
              let total = 0;
              let i = 0;
              while i < n {
                i = i + 1;
                total = total + i;
              }
              { total: total, count: i }
            }
            "#,
            surface(),
        )
        .unwrap();
        let result = sandbox.call("sum", vec![Value::Int(3)]).await.unwrap();
        let map = result.as_object().unwrap();
        assert_eq!(map["total"], Value::Int(6));
        assert_eq!(map["count"], Value::Int(3));
    }
}
