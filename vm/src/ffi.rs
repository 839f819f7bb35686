use std::path::{Path, PathBuf};

use parking_lot::Mutex;

/// Libraries consulted for FFI symbol resolution when a lookup names no
/// library explicitly. Process-wide, shared by every process on every
/// host thread, so all access goes through the mutex; the bridge that
/// actually resolves symbols lives outside the core.
static DEFAULT_LIBRARIES: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

/// Append a library to the process-wide default list.
pub fn add_default_library(path: impl AsRef<Path>) {
    let mut libraries = DEFAULT_LIBRARIES.lock();
    libraries.push(path.as_ref().to_path_buf());
}

/// Run `f` with the default-library list held. The lock is scoped to the
/// call so no caller can retain the list across a suspension point.
pub fn with_default_libraries<R>(f: impl FnOnce(&[PathBuf]) -> R) -> R {
    let libraries = DEFAULT_LIBRARIES.lock();
    f(&libraries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_library_list_is_shared_and_scoped() {
        add_default_library("/usr/lib/libdemo.so");
        let seen = with_default_libraries(|libs| {
            libs.iter()
                .any(|p| p.ends_with("libdemo.so"))
        });
        assert!(seen);
    }
}
