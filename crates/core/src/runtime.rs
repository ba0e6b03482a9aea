//! Locating the ONNX Runtime shared library for `ort`'s `load-dynamic` mode.

use std::env;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

#[cfg(target_os = "linux")]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(target_os = "macos")]
const ORT_LIB_NAME: &str = "libonnxruntime.dylib";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";
#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
const ORT_LIB_NAME: &str = "libonnxruntime.so";

pub const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Directories probed for the runtime library, in order:
///   1. each of `extra` (e.g. `<data_dir>/lib`)
///   2. `<exe_dir>/` (Windows only), `<exe_dir>/lib/`, `<exe_dir>/../lib/`
///   3. `<cwd>/lib/`
///   4. `/usr/local/lib/`, `/usr/lib/` (Unix only)
fn candidate_lib_dirs(extra: &[PathBuf]) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = extra.to_vec();
    let push = |dir: PathBuf, dirs: &mut Vec<PathBuf>| {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    };

    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            push(exe_dir.to_path_buf(), &mut dirs);
            push(exe_dir.join("lib"), &mut dirs);
            if let Some(parent) = exe_dir.parent() {
                push(parent.join("lib"), &mut dirs);
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        push(cwd.join("lib"), &mut dirs);
    }
    #[cfg(unix)]
    {
        push(PathBuf::from("/usr/local/lib"), &mut dirs);
        push(PathBuf::from("/usr/lib"), &mut dirs);
    }
    dirs
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Point `ORT_DYLIB_PATH` at the first runtime library found, unless the
/// variable is already set. Call before the first session is built.
pub fn setup_runtime_libs(extra_dirs: &[PathBuf]) -> Option<PathBuf> {
    if let Some(existing) = env::var_os(ORT_DYLIB_ENV) {
        return Some(PathBuf::from(existing));
    }
    let found = find_ort_dylib_in_dirs(&candidate_lib_dirs(extra_dirs))?;
    env::set_var(ORT_DYLIB_ENV, &found);
    Some(found)
}

/// Log which runtime library was resolved. Call after tracing is initialized.
pub fn log_runtime_lib_status() {
    match env::var(ORT_DYLIB_ENV) {
        Ok(path) if Path::new(&path).is_file() => info!(path = %path, "ONNX Runtime library"),
        Ok(path) => warn!(path = %path, "{ORT_DYLIB_ENV} is set but the file does not exist"),
        Err(_) => warn!("{ORT_DYLIB_ENV} not set; ONNX Runtime will use the default search path"),
    }
}
