//! Native unit loading
//!
//! This is the only module that touches `unsafe`: opening shared
//! libraries, resolving the three entry points and owning the opaque
//! instance handle they produce.

use crate::error::LoadError;
use libloading::{Library, Symbol};
use parking_lot::Mutex;
use semver::Version;
use sha2::{Digest, Sha256};
use std::ffi::{c_void, CStr};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use tracing::{debug, warn};
use weft_plugin_api::ffi::{
    self, DescribeFn, DestroyFn, InstantiateFn, PluginBox, ABI_VERSION, DESCRIBE_SYMBOL,
    DESTROY_SYMBOL, INSTANTIATE_SYMBOL, RUSTC_VERSION,
};
use weft_plugin_api::{Plugin, PluginManifest, PluginMetadata};

/// Whether `path` carries the platform's shared library extension
pub fn is_library_file(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };

    match std::env::consts::OS {
        "macos" => matches!(ext, "dylib" | "so"),
        "windows" => ext.eq_ignore_ascii_case("dll"),
        _ => ext == "so",
    }
}

/// SHA-256 of a file's contents, hex encoded
pub fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let bytes = fs::read(path)?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Parse manifest text and check it was built for this host's ABI and
/// compiler
///
/// Manifests without the stamps are accepted.
pub fn read_manifest(path: &Path, text: &str) -> Result<PluginManifest, LoadError> {
    let manifest = PluginManifest::parse(text).map_err(|e| LoadError::manifest(path, e))?;

    if let Some(found) = manifest.abi_version.filter(|found| *found != ABI_VERSION) {
        return Err(LoadError::AbiMismatch {
            path: path.to_path_buf(),
            expected: ABI_VERSION,
            found,
        });
    }
    if let Some(found) = manifest
        .rustc_version
        .as_deref()
        .filter(|found| *found != RUSTC_VERSION)
    {
        return Err(LoadError::ToolchainMismatch {
            path: path.to_path_buf(),
            expected: RUSTC_VERSION.to_string(),
            found: found.to_string(),
        });
    }
    Ok(manifest)
}

/// Owning handle to one plugin instance
///
/// Dropping the handle hands the instance back to the `destroy` entry
/// point of the unit that created it.
pub struct PluginInstance {
    raw: NonNull<PluginBox>,
    destroy: DestroyFn,
}

// SAFETY: the pointee is a `Box<dyn Plugin>` and `Plugin: Send + Sync`.
unsafe impl Send for PluginInstance {}
// SAFETY: see above.
unsafe impl Sync for PluginInstance {}

impl PluginInstance {
    /// Wrap a plugin built in the host's own binary
    pub fn from_boxed(plugin: PluginBox) -> Self {
        Self {
            raw: NonNull::from(Box::leak(Box::new(plugin))),
            destroy: ffi::release_plugin,
        }
    }

    /// Adopt a handle returned by a unit's `instantiate`
    ///
    /// # Safety
    ///
    /// `raw` must be null or a live handle created by the unit that
    /// exported `destroy`, and that unit must stay loaded for as long as
    /// the returned value exists.
    unsafe fn from_raw(raw: *mut c_void, destroy: DestroyFn) -> Option<Self> {
        NonNull::new(raw.cast::<PluginBox>()).map(|raw| Self { raw, destroy })
    }

    /// Borrow the plugin
    pub fn plugin(&self) -> &(dyn Plugin + 'static) {
        // SAFETY: `raw` is valid until `drop`.
        let boxed: &PluginBox = unsafe { self.raw.as_ref() };
        &**boxed
    }

    /// Borrow the plugin mutably
    pub fn plugin_mut(&mut self) -> &mut (dyn Plugin + 'static) {
        // SAFETY: `raw` is valid until `drop` and `&mut self` is exclusive.
        let boxed: &mut PluginBox = unsafe { self.raw.as_mut() };
        &mut **boxed
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        // SAFETY: `raw` came from the unit that exported `destroy` and is
        // released exactly once, here.
        unsafe { (self.destroy)(self.raw.as_ptr().cast()) }
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("plugin", &self.plugin().name())
            .finish()
    }
}

/// Path, metadata and retained build of a unit that has been unloaded
#[derive(Debug, Clone)]
pub struct RetainedUnit {
    /// Path the unit was loaded from
    pub path: PathBuf,

    /// Private copy of the build, if the loader kept one
    pub snapshot: Option<PathBuf>,

    /// Metadata the unit was loaded with
    pub metadata: PluginMetadata,
}

/// A loaded unit and the instance created from it
///
/// Owns both the library handle and the instance. Unloading destroys the
/// instance first and closes the library second, then leaves the value
/// inert; a second unload does nothing. Moving out with
/// [`take`](Self::take) leaves the source inert as well.
pub struct LoadedPlugin {
    instance: Option<PluginInstance>,
    library: Option<Library>,
    metadata: PluginMetadata,
    path: PathBuf,
    snapshot: Option<PathBuf>,
    fingerprint: Option<String>,
}

impl LoadedPlugin {
    /// Pair an instance with the library it came from
    pub fn new(
        path: impl Into<PathBuf>,
        metadata: PluginMetadata,
        instance: PluginInstance,
        library: Option<Library>,
    ) -> Self {
        Self {
            instance: Some(instance),
            library,
            metadata,
            path: path.into(),
            snapshot: None,
            fingerprint: None,
        }
    }

    /// Record the private copy this unit was opened from
    pub fn with_snapshot(mut self, snapshot: impl Into<PathBuf>) -> Self {
        self.snapshot = Some(snapshot.into());
        self
    }

    /// Record the content fingerprint of the loaded build
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    /// Metadata the unit was loaded with
    pub fn metadata(&self) -> &PluginMetadata {
        &self.metadata
    }

    /// Path the unit was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Private copy the unit was opened from
    pub fn snapshot(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    /// Content fingerprint of the loaded build
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Whether an instance is still held
    pub fn is_loaded(&self) -> bool {
        self.instance.is_some()
    }

    /// Borrow the plugin instance
    pub fn plugin(&self) -> Option<&(dyn Plugin + 'static)> {
        self.instance.as_ref().map(PluginInstance::plugin)
    }

    /// Borrow the plugin instance mutably
    pub fn plugin_mut(&mut self) -> Option<&mut (dyn Plugin + 'static)> {
        self.instance.as_mut().map(PluginInstance::plugin_mut)
    }

    /// Everything needed to bring this unit back after it is unloaded
    pub fn retain(&self) -> RetainedUnit {
        RetainedUnit {
            path: self.path.clone(),
            snapshot: self.snapshot.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Move the contents out, leaving `self` inert
    pub fn take(&mut self) -> LoadedPlugin {
        std::mem::take(self)
    }

    /// Destroy the instance, then close the library
    ///
    /// An instance that is still initialized is shut down first. Never
    /// fails; close errors are logged.
    pub fn unload(&mut self) {
        if let Some(mut instance) = self.instance.take() {
            if instance.plugin().is_initialized() {
                debug!(plugin = %self.metadata.name, "Shutting down instance before destroying it");
                instance.plugin_mut().shutdown();
            }
            drop(instance);
        }

        if let Some(library) = self.library.take() {
            if let Err(e) = library.close() {
                warn!(
                    plugin = %self.metadata.name,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to close plugin library"
                );
            }
        }
    }
}

impl Default for LoadedPlugin {
    fn default() -> Self {
        Self {
            instance: None,
            library: None,
            metadata: PluginMetadata::new(String::new(), Version::new(0, 0, 0)),
            path: PathBuf::new(),
            snapshot: None,
            fingerprint: None,
        }
    }
}

impl Drop for LoadedPlugin {
    fn drop(&mut self) {
        self.unload();
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.metadata.name)
            .field("version", &self.metadata.version.to_string())
            .field("path", &self.path)
            .field("snapshot", &self.snapshot)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Source of plugin instances
///
/// [`DynamicLoader`] is the production implementation; the `testing`
/// feature adds an in-process one.
pub trait UnitLoader: Send + Sync + fmt::Debug {
    /// Read a unit's manifest text without creating an instance
    fn describe(&self, path: &Path) -> Result<String, LoadError>;

    /// Open a unit and create one instance from it
    fn load(&self, path: &Path) -> Result<LoadedPlugin, LoadError>;

    /// Bring back a previously unloaded build
    fn restore(&self, unit: &RetainedUnit) -> Result<LoadedPlugin, LoadError>;

    /// Destroy the instance and close the unit, keeping its snapshot
    fn unload(&self, plugin: &mut LoadedPlugin) {
        plugin.unload();
    }

    /// Unload and forget the retained build as well
    fn discard(&self, plugin: &mut LoadedPlugin) {
        self.unload(plugin);
        if let Some(snapshot) = plugin.snapshot.take() {
            self.release_snapshot(&snapshot);
        }
    }

    /// Delete a retained build that will never be restored
    fn release_snapshot(&self, _snapshot: &Path) {}

    /// Content fingerprint of the unit currently at `path`
    fn fingerprint(&self, path: &Path) -> Option<String> {
        fingerprint_file(path).ok()
    }

    /// Whether a directory scan should try `path`
    fn is_candidate(&self, path: &Path) -> bool {
        is_library_file(path)
    }
}

#[derive(Clone, Copy)]
struct Exports {
    instantiate: InstantiateFn,
    destroy: DestroyFn,
    describe: DescribeFn,
}

/// Loads shared libraries through the platform loader
///
/// By default every unit is copied into a private temporary directory
/// and opened from there. The copy is what [`restore`] reopens after the
/// original file has been overwritten by a broken build, and it keeps the
/// platform loader from handing back a cached image for a path it has
/// seen before.
///
/// [`restore`]: UnitLoader::restore
pub struct DynamicLoader {
    shadow_copies: bool,
    shadow_root: Mutex<Option<TempDir>>,
    generation: AtomicU64,
}

impl DynamicLoader {
    /// Create a loader that opens shadow copies
    pub fn new() -> Self {
        Self {
            shadow_copies: true,
            shadow_root: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Create a loader that opens units in place
    ///
    /// Rollback cannot restore a previous build in this mode.
    pub fn without_shadow_copies() -> Self {
        Self {
            shadow_copies: false,
            ..Self::new()
        }
    }

    /// Whether units are opened from private copies
    pub fn uses_shadow_copies(&self) -> bool {
        self.shadow_copies
    }

    fn check_path(path: &Path) -> Result<(), LoadError> {
        if !path.exists() {
            return Err(LoadError::invalid_path(path, "does not exist"));
        }
        if !path.is_file() {
            return Err(LoadError::invalid_path(path, "not a regular file"));
        }
        Ok(())
    }

    fn shadow_copy(&self, path: &Path) -> Result<PathBuf, LoadError> {
        let mut root = self.shadow_root.lock();
        let dir = match root.as_ref() {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("weft-units-")
                    .tempdir()
                    .map_err(|e| LoadError::io(path, e))?;
                let dir_path = dir.path().to_path_buf();
                *root = Some(dir);
                dir_path
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unit");
        let mut file_name = format!("{stem}-{generation}");
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            file_name.push('.');
            file_name.push_str(ext);
        }

        let target = dir.join(file_name);
        fs::copy(path, &target).map_err(|e| LoadError::io(path, e))?;
        debug!(source = %path.display(), copy = %target.display(), "Created shadow copy");
        Ok(target)
    }

    fn remove_copy(copy: &Path) {
        if let Err(e) = fs::remove_file(copy) {
            debug!(path = %copy.display(), error = %e, "Failed to remove shadow copy");
        }
    }

    // Errors name `path`; `open_path` is what actually gets opened.
    fn open(path: &Path, open_path: &Path) -> Result<(Library, Exports), LoadError> {
        // SAFETY: opening a library runs its initializers. Plugin units are
        // trusted code built against this host's SDK.
        let library = unsafe { Library::new(open_path) }.map_err(|e| LoadError::open(path, e))?;

        // SAFETY: the symbol types match the signatures `declare_plugin!` exports.
        let exports = unsafe {
            Exports {
                instantiate: symbol(&library, path, INSTANTIATE_SYMBOL)?,
                destroy: symbol(&library, path, DESTROY_SYMBOL)?,
                describe: symbol(&library, path, DESCRIBE_SYMBOL)?,
            }
        };

        Ok((library, exports))
    }

    fn manifest_text(path: &Path, describe: DescribeFn) -> Result<String, LoadError> {
        // SAFETY: `describe` returns a NUL-terminated string that lives as
        // long as the unit stays loaded; it is copied before returning.
        let raw = unsafe { describe() };
        if raw.is_null() {
            return Err(LoadError::manifest(path, "describe returned null"));
        }

        // SAFETY: non-null and NUL-terminated per the contract above.
        let text = unsafe { CStr::from_ptr(raw) };
        text.to_str()
            .map(str::to_owned)
            .map_err(|e| LoadError::manifest(path, e))
    }

    fn instantiate(path: &Path, open_path: &Path) -> Result<LoadedPlugin, LoadError> {
        let (library, exports) = Self::open(path, open_path)?;
        let text = Self::manifest_text(path, exports.describe)?;
        let manifest = read_manifest(path, &text)?;

        // SAFETY: entry point exported by this unit with the documented signature.
        let raw = unsafe { (exports.instantiate)() };
        // SAFETY: `raw` came from this unit's `instantiate`, and `library`
        // is stored next to the instance and closed only after it is dropped.
        let instance = unsafe { PluginInstance::from_raw(raw, exports.destroy) }.ok_or_else(|| {
            LoadError::NullInstance {
                path: path.to_path_buf(),
            }
        })?;

        Ok(LoadedPlugin::new(path, manifest.metadata, instance, Some(library)))
    }
}

/// Resolve `name` in `library` and copy the function pointer out
///
/// # Safety
///
/// `T` must be the exact type of the exported symbol.
unsafe fn symbol<T: Copy>(library: &Library, path: &Path, name: &'static str) -> Result<T, LoadError> {
    // SAFETY: forwarded to the caller.
    let symbol: Symbol<'_, T> = unsafe { library.get(name.as_bytes()) }.map_err(|e| {
        LoadError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: name,
            reason: e.to_string(),
        }
    })?;
    Ok(*symbol)
}

impl Default for DynamicLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DynamicLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicLoader")
            .field("shadow_copies", &self.shadow_copies)
            .field(
                "shadow_root",
                &self.shadow_root.lock().as_ref().map(|d| d.path().to_path_buf()),
            )
            .finish()
    }
}

impl UnitLoader for DynamicLoader {
    fn describe(&self, path: &Path) -> Result<String, LoadError> {
        Self::check_path(path)?;

        let copy = if self.shadow_copies {
            Some(self.shadow_copy(path)?)
        } else {
            None
        };

        let result = Self::open(path, copy.as_deref().unwrap_or(path))
            .and_then(|(_library, exports)| Self::manifest_text(path, exports.describe));

        if let Some(copy) = copy {
            Self::remove_copy(&copy);
        }
        result
    }

    fn load(&self, path: &Path) -> Result<LoadedPlugin, LoadError> {
        Self::check_path(path)?;

        let copy = if self.shadow_copies {
            Some(self.shadow_copy(path)?)
        } else {
            None
        };
        let open_path = copy.as_deref().unwrap_or(path);
        let fingerprint = fingerprint_file(open_path).ok();

        match Self::instantiate(path, open_path) {
            Ok(mut loaded) => {
                loaded.snapshot = copy;
                loaded.fingerprint = fingerprint;
                debug!(
                    plugin = %loaded.metadata.name,
                    version = %loaded.metadata.version,
                    path = %path.display(),
                    "Unit loaded"
                );
                Ok(loaded)
            }
            Err(e) => {
                if let Some(copy) = copy {
                    Self::remove_copy(&copy);
                }
                Err(e)
            }
        }
    }

    fn restore(&self, unit: &RetainedUnit) -> Result<LoadedPlugin, LoadError> {
        let snapshot = unit
            .snapshot
            .as_deref()
            .filter(|snapshot| snapshot.is_file())
            .ok_or_else(|| LoadError::open(&unit.path, "no retained build to restore"))?;

        let mut loaded = Self::instantiate(&unit.path, snapshot)?;
        loaded.snapshot = Some(snapshot.to_path_buf());
        loaded.fingerprint = fingerprint_file(snapshot).ok();
        Ok(loaded)
    }

    fn release_snapshot(&self, snapshot: &Path) {
        let root = self.shadow_root.lock();
        let owned = root
            .as_ref()
            .map_or(false, |dir| snapshot.starts_with(dir.path()));
        if owned {
            Self::remove_copy(snapshot);
        }
    }
}
