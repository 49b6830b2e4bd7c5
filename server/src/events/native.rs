//! The native plugin engine.
//!
//! A `<phase>.rs` script is compiled on first use (or file change) into a
//! cdylib and loaded with `libloading`. The module exposes a C ABI
//! exchanging the same JSON shapes as the JavaScript engine:
//!
//! ```ignore
//! #[no_mangle]
//! pub extern "C" fn haven_run(input: *const c_char) -> *mut c_char { ... }
//! #[no_mangle]
//! pub extern "C" fn haven_free(output: *mut c_char) { ... }
//! ```
//!
//! Modules are invoked concurrently and must be reentrant with respect to
//! their own globals. The input carries `timeoutMs`; long-running handlers
//! are expected to honor it.

use libloading::Library;
use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};

use super::ScriptError;
use crate::events::context::{ScriptInput, ScriptOutput};

/// A loaded plugin. Dropping the last `Arc` unloads the library, so cache
/// generations keep superseded modules alive until no in-flight call
/// references them.
pub struct NativeModule {
    library: Library,
    path: PathBuf,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeModule")
            .field("path", &self.path)
            .finish()
    }
}

type RunFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);

impl NativeModule {
    /// Load a compiled module and verify its entry points.
    pub fn load(path: &Path) -> Result<NativeModule, ScriptError> {
        // SAFETY: the artifact was produced by our own rustc invocation and
        // is only reachable through the state directory.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ScriptError::Compile(format!("loading {}: {e}", path.display())))?;

        unsafe {
            library
                .get::<RunFn>(b"haven_run")
                .map_err(|e| ScriptError::Compile(format!("missing haven_run: {e}")))?;
            library
                .get::<FreeFn>(b"haven_free")
                .map_err(|e| ScriptError::Compile(format!("missing haven_free: {e}")))?;
        }

        Ok(NativeModule {
            library,
            path: path.to_path_buf(),
        })
    }

    /// Invoke the module. Blocking; callers dispatch through
    /// `spawn_blocking`.
    pub fn run(&self, input: &ScriptInput) -> Result<ScriptOutput, ScriptError> {
        let input_json = serde_json::to_string(input)
            .map_err(|e| ScriptError::Failed(format!("input encoding: {e}")))?;
        let input_c = CString::new(input_json)
            .map_err(|e| ScriptError::Failed(format!("input encoding: {e}")))?;

        let raw = unsafe {
            let run = self
                .library
                .get::<RunFn>(b"haven_run")
                .map_err(|e| ScriptError::Failed(e.to_string()))?;
            let free = self
                .library
                .get::<FreeFn>(b"haven_free")
                .map_err(|e| ScriptError::Failed(e.to_string()))?;

            let out_ptr = run(input_c.as_ptr());
            if out_ptr.is_null() {
                return Err(ScriptError::Failed(
                    "native handler returned null".to_string(),
                ));
            }
            let raw = CStr::from_ptr(out_ptr).to_string_lossy().into_owned();
            free(out_ptr);
            raw
        };

        serde_json::from_str(&raw)
            .map_err(|e| ScriptError::Failed(format!("output decoding: {e}")))
    }
}

/// Compile a script source into a position-independent loadable module.
pub async fn compile(source: &Path, artifact: &Path) -> Result<(), ScriptError> {
    if let Some(parent) = artifact.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ScriptError::Compile(e.to_string()))?;
    }

    let output = tokio::process::Command::new("rustc")
        .arg("--edition")
        .arg("2021")
        .arg("--crate-type")
        .arg("cdylib")
        .arg("-O")
        .arg("-o")
        .arg(artifact)
        .arg(source)
        .output()
        .await
        .map_err(|e| ScriptError::Compile(format!("spawning rustc: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScriptError::Compile(format!(
            "{}: {}",
            source.display(),
            stderr.trim()
        )));
    }

    tracing::info!(
        source = %source.display(),
        artifact = %artifact.display(),
        "compiled native event module"
    );
    Ok(())
}

/// Artifact filename for a source hash, using the platform's dylib suffix.
pub fn artifact_name(collection: &str, phase: &str, hash: &str) -> String {
    format!(
        "{collection}-{phase}-{}.{}",
        &hash[..16.min(hash.len())],
        std::env::consts::DLL_EXTENSION
    )
}
