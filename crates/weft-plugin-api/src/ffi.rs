//! Binary contract between the host and a loadable unit
//!
//! A unit exports exactly three C-ABI entry points:
//!
//! | Symbol | Signature | Purpose |
//! |---|---|---|
//! | `weft_plugin_instantiate` | `fn() -> *mut c_void` | create one instance |
//! | `weft_plugin_destroy` | `fn(*mut c_void)` | release an instance created above |
//! | `weft_plugin_describe` | `fn() -> *const c_char` | manifest JSON, no instantiation |
//!
//! The opaque handle is a thin pointer to a heap-allocated [`PluginBox`].
//! It must only ever be released by the `destroy` entry point of the unit
//! that created it, so allocation and deallocation stay in one binary.
//! Host and units must be built with the same toolchain and the same
//! [`ABI_VERSION`]; both are stamped into the manifest so the host can
//! refuse a unit before touching its vtable.

use crate::metadata::{PluginManifest, PluginMetadata};
use crate::plugin::Plugin;
use std::ffi::{c_char, c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

/// Revision of this contract, stamped into every manifest
pub const ABI_VERSION: u32 = 1;

/// `rustc -V` of the compiler that built this crate, stamped into every
/// manifest
pub const RUSTC_VERSION: &str = env!("WEFT_RUSTC_VERSION");

/// Name of the instantiate entry point
pub const INSTANTIATE_SYMBOL: &str = "weft_plugin_instantiate";

/// Name of the destroy entry point
pub const DESTROY_SYMBOL: &str = "weft_plugin_destroy";

/// Name of the describe entry point
pub const DESCRIBE_SYMBOL: &str = "weft_plugin_describe";

/// The value behind an opaque plugin handle
pub type PluginBox = Box<dyn Plugin>;

/// Signature of `weft_plugin_instantiate`
pub type InstantiateFn = unsafe extern "C" fn() -> *mut c_void;

/// Signature of `weft_plugin_destroy`
pub type DestroyFn = unsafe extern "C" fn(*mut c_void);

/// Signature of `weft_plugin_describe`
pub type DescribeFn = unsafe extern "C" fn() -> *const c_char;

/// Turn a plugin into an opaque handle
pub fn into_raw(plugin: PluginBox) -> *mut c_void {
    Box::into_raw(Box::new(plugin)).cast()
}

/// Run `factory` and box its result, returning null if it panics
pub fn instantiate_with<F>(factory: F) -> *mut c_void
where
    F: FnOnce() -> PluginBox,
{
    match panic::catch_unwind(AssertUnwindSafe(factory)) {
        Ok(plugin) => into_raw(plugin),
        Err(_) => ptr::null_mut(),
    }
}

/// Release a handle produced by [`into_raw`] or [`instantiate_with`]
///
/// # Safety
///
/// `raw` must be null or a handle created by this same binary that has
/// not been released yet.
pub unsafe extern "C" fn release_plugin(raw: *mut c_void) {
    if raw.is_null() {
        return;
    }

    // SAFETY: the caller guarantees `raw` came from `into_raw` in this binary.
    let plugin = unsafe { Box::from_raw(raw.cast::<PluginBox>()) };
    let _ = panic::catch_unwind(AssertUnwindSafe(move || drop(plugin)));
}

/// Render the NUL-terminated manifest returned by `weft_plugin_describe`
///
/// Falls back to an empty string, which every host rejects as invalid.
pub fn manifest_cstring(metadata: &PluginMetadata) -> CString {
    let json = PluginManifest::new(metadata.clone())
        .to_json()
        .unwrap_or_default();
    CString::new(json).unwrap_or_default()
}

/// Export the three entry points for a plugin type
///
/// ```ignore
/// weft_plugin_api::declare_plugin!(CounterPlugin, CounterPlugin::new, CounterPlugin::describe);
/// ```
///
/// `$constructor` is called once per instantiation and must return the
/// plugin type. `$describe` returns its [`PluginMetadata`] without
/// constructing an instance; the manifest is rendered once and cached.
#[macro_export]
macro_rules! declare_plugin {
    ($plugin:ty, $constructor:path, $describe:path) => {
        #[no_mangle]
        pub extern "C" fn weft_plugin_instantiate() -> *mut ::std::ffi::c_void {
            $crate::ffi::instantiate_with(|| {
                let plugin: $plugin = $constructor();
                ::std::boxed::Box::new(plugin) as $crate::ffi::PluginBox
            })
        }

        /// # Safety
        ///
        /// `raw` must come from `weft_plugin_instantiate` of this unit.
        #[no_mangle]
        pub unsafe extern "C" fn weft_plugin_destroy(raw: *mut ::std::ffi::c_void) {
            $crate::ffi::release_plugin(raw)
        }

        #[no_mangle]
        pub extern "C" fn weft_plugin_describe() -> *const ::std::ffi::c_char {
            static MANIFEST: ::std::sync::OnceLock<::std::ffi::CString> =
                ::std::sync::OnceLock::new();
            MANIFEST
                .get_or_init(|| $crate::ffi::manifest_cstring(&$describe()))
                .as_ptr()
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PluginContext;
    use semver::Version;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct DropCounter {
        metadata: PluginMetadata,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Plugin for DropCounter {
        fn metadata(&self) -> &PluginMetadata {
            &self.metadata
        }

        fn initialize(&mut self, _ctx: &PluginContext) -> bool {
            true
        }

        fn shutdown(&mut self) {}

        fn is_initialized(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_handle_round_trip_releases_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let plugin = DropCounter {
            metadata: PluginMetadata::new("drop", Version::new(1, 0, 0)),
            drops: drops.clone(),
        };

        let raw = instantiate_with(|| Box::new(plugin));
        assert!(!raw.is_null());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        unsafe { release_plugin(raw) };
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_factory_yields_null() {
        let raw = instantiate_with(|| panic!("constructor blew up"));
        assert!(raw.is_null());

        // Releasing null is a no-op.
        unsafe { release_plugin(raw) };
    }

    #[test]
    fn test_manifest_cstring_is_parseable() {
        let metadata = PluginMetadata::new("counter", Version::new(0, 1, 0)).with_priority(3);
        let manifest = manifest_cstring(&metadata);

        let parsed = PluginManifest::parse(manifest.to_str().unwrap()).unwrap();
        assert_eq!(parsed.metadata, metadata);
        assert_eq!(parsed.abi_version, Some(ABI_VERSION));
    }
}
