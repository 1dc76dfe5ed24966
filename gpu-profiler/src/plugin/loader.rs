//! Dynamic loading of plugin libraries

use std::ffi::c_int;
use std::path::Path;

use libloading::{Library, Symbol};
use tracing::info;

use super::abi::{GetInterfaceFn, ProfilerInterface, PLUGIN_ENTRY_POINT};
use super::profiler::PluginProfiler;
use crate::error::{LoadError, PLUGIN_OK};
use crate::session::ChildProfiler;

/// Open a plugin shared library and wrap its interface table
///
/// The library stays loaded for as long as the returned profiler or any of
/// its sessions is alive.
pub fn load_plugin(path: &Path) -> Result<PluginProfiler, LoadError> {
    // Safety: loading runs the library's initialisers; plugins are trusted code.
    let library = unsafe { Library::new(path)? };

    let mut interface = ProfilerInterface::default();
    let code: c_int = unsafe {
        let get_interface: Symbol<GetInterfaceFn> = library.get(PLUGIN_ENTRY_POINT)?;
        get_interface(&mut interface)
    };
    if code != PLUGIN_OK {
        return Err(LoadError::EntryPoint(code));
    }

    let profiler = PluginProfiler::with_library(interface, Some(library));
    info!("Loaded plugin profiler {} from {}", profiler.name(), path.display());
    Ok(profiler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_library() {
        let result = load_plugin(Path::new("/nonexistent/libtandem_missing_plugin.so"));
        assert!(matches!(result, Err(LoadError::Library(_))));
    }
}
