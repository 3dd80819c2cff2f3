//! ONNX Runtime library discovery and process-wide environment lifecycle.
//!
//! `ort` is built with `load-dynamic`, so `libonnxruntime` and the GPU
//! runtime libraries it depends on are located at startup
//! ([`setup_runtime_libs`]). Filter instances hold an [`EngineRuntime`]
//! guard; the first acquire commits the ORT environment.

use std::env;
#[cfg(windows)]
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::error::Error;

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ENVIRONMENT_NAME: &str = "w2x";

/// Search directories relative to the current executable for runtime libraries.
///
/// Probes these locations in order:
///   1. `<exe_dir>/` (Windows only)
///   2. `<exe_dir>/lib/`
///   3. `<exe_dir>/../lib/`
///   4. `<cwd>/lib/`
///   5. `/usr/local/lib/` (Unix only)
///   6. `/usr/lib/` (Unix only)
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

#[cfg(windows)]
fn build_path_with_prepended_dirs(current: Option<OsString>, dirs: &[PathBuf]) -> OsString {
    use std::collections::HashSet;

    let key = |path: &Path| {
        path.to_string_lossy()
            .replace('/', "\\")
            .to_ascii_lowercase()
    };
    let fallback = current.clone().unwrap_or_default();
    let mut merged = Vec::new();
    let mut seen = HashSet::<String>::new();

    for dir in dirs.iter().filter(|dir| dir.is_dir()) {
        if seen.insert(key(dir)) {
            merged.push(dir.clone());
        }
    }
    if let Some(path) = current {
        for dir in env::split_paths(&path) {
            if !dir.as_os_str().is_empty() && seen.insert(key(&dir)) {
                merged.push(dir);
            }
        }
    }

    env::join_paths(merged).unwrap_or(fallback)
}

/// Load-priority tier for known GPU runtime libs, `None` for anything we
/// must not preload. ORT provider libs need symbols from `libonnxruntime`
/// itself and are left to ORT.
///
///   0: CUDA runtime, 1: cuDNN, 2: TensorRT
#[cfg(unix)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["libcudart", "libcublas", "libcufft", "libcurand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("libcudnn") {
        Some(1)
    } else if name.starts_with("libnvinfer") || name.starts_with("libnvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(windows)]
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    if ["cudart64_", "cublas64_", "cublaslt64_"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn64_") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libraries found in `dirs`, in load order. The first directory that
/// holds a given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    use std::collections::HashSet;

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

#[cfg(unix)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) =
        libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL)
    {
        std::mem::forget(lib);
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) {
    if let Ok(lib) = libloading::Library::new(path) {
        std::mem::forget(lib);
    }
}

/// Locate `libonnxruntime` and preload CUDA / cuDNN / TensorRT libraries.
///
/// glibc caches `LD_LIBRARY_PATH` at startup, so libraries are opened by
/// absolute path with `RTLD_GLOBAL` instead. Call at the very start of
/// `main()`, before any ORT use.
pub fn setup_runtime_libs() {
    let dirs = candidate_lib_dirs();

    if env::var_os("ORT_DYLIB_PATH").is_none() {
        if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
            env::set_var("ORT_DYLIB_PATH", &path);
        }

        #[cfg(windows)]
        env::set_var(
            "PATH",
            build_path_with_prepended_dirs(env::var_os("PATH"), &dirs),
        );
    }

    for lib_path in collect_preload_libs(&dirs) {
        unsafe { load_library(&lib_path) };
    }
}

/// Log which runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var("ORT_DYLIB_PATH") {
        Ok(ort) if Path::new(&ort).is_file() => info!("ORT library: {ort}"),
        Ok(ort) => warn!("ORT_DYLIB_PATH set to {ort} but file not found"),
        Err(_) => warn!("ORT_DYLIB_PATH not set, ORT will try default search paths"),
    }
}

#[derive(Debug, Default)]
struct RuntimeState {
    users: usize,
    initialized: bool,
}

static RUNTIME: Mutex<RuntimeState> = Mutex::new(RuntimeState {
    users: 0,
    initialized: false,
});

fn commit_environment() -> Result<(), Error> {
    let dylib = env::var_os("ORT_DYLIB_PATH")
        .map(PathBuf::from)
        .or_else(|| find_ort_dylib_in_dirs(&candidate_lib_dirs()));

    match dylib {
        Some(path) => {
            let builder = ort::init_from(path.to_string_lossy().to_string()).map_err(|e| {
                Error::initialization(format!(
                    "failed to load ONNX Runtime from {}: {e}",
                    path.display()
                ))
            })?;
            let _ = builder.with_name(ENVIRONMENT_NAME).commit();
            info!(library = %path.display(), "ONNX Runtime environment committed");
        }
        None => {
            let _ = ort::init().with_name(ENVIRONMENT_NAME).commit();
            info!("ONNX Runtime environment committed from default search path");
        }
    }
    Ok(())
}

/// Process-wide ONNX Runtime handle. Dropping the last guard releases the
/// runtime for this process's filters.
#[derive(Debug)]
pub struct EngineRuntime {
    _private: (),
}

impl EngineRuntime {
    pub fn acquire() -> Result<Self, Error> {
        let mut state = RUNTIME
            .lock()
            .map_err(|_| Error::initialization("engine runtime lock poisoned"))?;
        if !state.initialized {
            commit_environment()?;
            state.initialized = true;
        }
        state.users += 1;
        debug!(users = state.users, "Engine runtime acquired");
        Ok(Self { _private: () })
    }

    /// Guards currently alive.
    pub fn active_users() -> usize {
        RUNTIME.lock().map(|state| state.users).unwrap_or_default()
    }
}

impl Drop for EngineRuntime {
    fn drop(&mut self) {
        if let Ok(mut state) = RUNTIME.lock() {
            state.users = state.users.saturating_sub(1);
            if state.users == 0 {
                debug!("Engine runtime released by last user");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn candidate_lib_dirs_contains_system_paths() {
        let dirs = candidate_lib_dirs();
        assert!(dirs.contains(&PathBuf::from("/usr/local/lib")));
        assert!(dirs.contains(&PathBuf::from("/usr/lib")));
    }

    #[test]
    fn candidate_lib_dirs_includes_cwd_lib() {
        let dirs = candidate_lib_dirs();
        if let Ok(cwd) = env::current_dir() {
            assert!(dirs.contains(&cwd.join("lib")));
        }
    }

    #[test]
    fn find_ort_dylib_prefers_first_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = temp.path().join("first");
        let second = temp.path().join("second");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();
        std::fs::write(second.join(ORT_LIB_NAME), b"").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second.clone()]),
            Some(second.join(ORT_LIB_NAME))
        );

        std::fs::write(first.join(ORT_LIB_NAME), b"").unwrap();
        assert_eq!(
            find_ort_dylib_in_dirs(&[first.clone(), second]),
            Some(first.join(ORT_LIB_NAME))
        );
    }

    #[cfg(unix)]
    #[test]
    fn load_priority_orders_cuda_before_cudnn_before_trt() {
        assert!(load_priority("libcudart.so.12") < load_priority("libcudnn.so.9"));
        assert!(load_priority("libcublasLt.so.12") < load_priority("libcudnn_ops.so.9"));
        assert!(load_priority("libcudnn.so.9") < load_priority("libnvinfer.so.10"));
        assert_eq!(load_priority("libonnxruntime_providers_cuda.so"), None);
        assert_eq!(load_priority("libsomething_else.so"), None);
    }

    #[cfg(unix)]
    #[test]
    fn preload_order_follows_priority_and_dedups_names() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        for name in ["libnvinfer.so.10", "libcudnn.so.9", "libunrelated.so"] {
            std::fs::write(a.join(name), b"").unwrap();
        }
        std::fs::write(b.join("libcudart.so.12"), b"").unwrap();
        std::fs::write(b.join("libcudnn.so.9"), b"").unwrap();

        let libs = collect_preload_libs(&[a.clone(), b.clone()]);
        assert_eq!(
            libs,
            vec![
                b.join("libcudart.so.12"),
                a.join("libcudnn.so.9"),
                a.join("libnvinfer.so.10"),
            ]
        );
    }

    #[cfg(windows)]
    #[test]
    fn build_path_with_prepended_dirs_prefers_candidate_dirs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let preferred = temp.path().join("preferred-lib");
        let existing = temp.path().join("existing");
        std::fs::create_dir_all(&preferred).unwrap();
        std::fs::create_dir_all(&existing).unwrap();

        let current = env::join_paths([existing.clone(), preferred.clone()]).unwrap();
        let merged = build_path_with_prepended_dirs(Some(current), &[preferred.clone()]);
        let dirs: Vec<PathBuf> = env::split_paths(&merged).collect();

        assert_eq!(dirs, vec![preferred, existing]);
    }
}
