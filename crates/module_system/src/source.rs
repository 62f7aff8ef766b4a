//! Module sources: where module code comes from.
//!
//! A [`ModuleSource`] turns a logical name into a [`LoadedUnit`], a
//! constructible handle on the module's code. The manager caches units by
//! code location so unload/reload can invalidate them explicitly.

use crate::error::ModuleSystemError;
use crate::module::{Module, MODULE_ABI_VERSION};
use compact_str::CompactString;
use dashmap::DashMap;
use libloading::{Library, Symbol};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Constructs fresh module instances from a resolved unit of code.
pub trait ModuleFactory: Send + Sync {
    fn construct(&self) -> Result<Box<dyn Module>, ModuleSystemError>;
}

impl<F> ModuleFactory for F
where
    F: Fn() -> Result<Box<dyn Module>, ModuleSystemError> + Send + Sync,
{
    fn construct(&self) -> Result<Box<dyn Module>, ModuleSystemError> {
        self()
    }
}

/// A resolved unit of module code.
///
/// Dylib units keep their [`Library`] alive for as long as any clone of the
/// unit exists; instances constructed from the factory borrow code from it,
/// so the library must never be dropped while one lives.
#[derive(Clone)]
pub struct LoadedUnit {
    /// Logical name this unit resolves.
    pub name: CompactString,
    /// Code location, used as the cache key and for prefix purges.
    pub location: String,
    /// Constructor for instances of the unit's module type.
    pub factory: Arc<dyn ModuleFactory>,
    /// Backing library for dylib units, `None` for static ones.
    pub library: Option<Arc<Library>>,
}

impl fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("dylib", &self.library.is_some())
            .finish()
    }
}

/// Resolves logical module names to loadable code.
pub trait ModuleSource: Send + Sync {
    /// Resolves `name` to a fresh unit. Missing code, missing exports, or an
    /// ABI mismatch are resolution failures.
    fn resolve(&self, name: &str) -> Result<LoadedUnit, ModuleSystemError>;

    /// Stable code location for `name`, defined even when the name does not
    /// currently resolve (the cache purge needs a prefix to match against).
    fn location_of(&self, name: &str) -> String;

    /// Every logical name this source can currently resolve.
    fn list(&self) -> Vec<CompactString>;
}

// ============================================================================
// Dylib source
// ============================================================================

/// Scans a directory for platform dynamic libraries and loads them through
/// the `relay_module_abi_version` / `relay_create_module` exports.
#[derive(Debug, Clone)]
pub struct DylibModuleSource {
    directory: PathBuf,
}

struct DylibFactory {
    library: Arc<Library>,
    location: String,
}

impl ModuleFactory for DylibFactory {
    fn construct(&self) -> Result<Box<dyn Module>, ModuleSystemError> {
        let constructor: Symbol<'_, unsafe extern "C" fn() -> *mut dyn Module> = unsafe {
            self.library.get(b"relay_create_module").map_err(|e| {
                ModuleSystemError::Library(format!(
                    "{} does not export 'relay_create_module': {}",
                    self.location, e
                ))
            })?
        };
        let raw = unsafe { constructor() };
        if raw.is_null() {
            return Err(ModuleSystemError::Library(format!(
                "module constructor in {} returned null",
                self.location
            )));
        }
        Ok(unsafe { Box::from_raw(raw) })
    }
}

impl DylibModuleSource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    #[cfg(target_os = "windows")]
    const DYLIB_EXTENSION: &'static str = "dll";
    #[cfg(target_os = "macos")]
    const DYLIB_EXTENSION: &'static str = "dylib";
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    const DYLIB_EXTENSION: &'static str = "so";

    /// `libmodule_echo.so` resolves the logical name `module_echo`.
    fn stem_to_name(stem: &str) -> &str {
        stem.strip_prefix("lib").unwrap_or(stem)
    }

    fn scan(&self) -> Vec<PathBuf> {
        let entries = match std::fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    "Module directory {} is not readable: {}",
                    self.directory.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .map(|ext| ext.to_string_lossy().to_lowercase() == Self::DYLIB_EXTENSION)
                        .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    fn find_file(&self, name: &str) -> Option<PathBuf> {
        self.scan().into_iter().find(|path| {
            path.file_stem()
                .map(|stem| Self::stem_to_name(&stem.to_string_lossy()) == name)
                .unwrap_or(false)
        })
    }
}

impl ModuleSource for DylibModuleSource {
    fn resolve(&self, name: &str) -> Result<LoadedUnit, ModuleSystemError> {
        let path = self.find_file(name).ok_or_else(|| {
            ModuleSystemError::Resolution(format!(
                "no module '{}' in {}",
                name,
                self.directory.display()
            ))
        })?;
        let location = path.display().to_string();
        info!("🔄 Loading module code from: {}", location);

        let library = unsafe {
            Library::new(&path).map_err(|e| {
                ModuleSystemError::Library(format!("failed to open {}: {}", location, e))
            })?
        };

        let abi_version = {
            let abi: Symbol<'_, unsafe extern "C" fn() -> u32> = unsafe {
                library.get(b"relay_module_abi_version").map_err(|e| {
                    ModuleSystemError::Library(format!(
                        "{} does not export 'relay_module_abi_version': {}",
                        location, e
                    ))
                })?
            };
            unsafe { abi() }
        };
        if abi_version != MODULE_ABI_VERSION {
            return Err(ModuleSystemError::AbiMismatch(format!(
                "module '{}' was built against ABI v{}, host expects v{}",
                name, abi_version, MODULE_ABI_VERSION
            )));
        }

        // Require the constructor now so a broken dylib fails at resolution,
        // not at first construction.
        {
            let _constructor: Symbol<'_, unsafe extern "C" fn() -> *mut dyn Module> = unsafe {
                library.get(b"relay_create_module").map_err(|e| {
                    ModuleSystemError::Library(format!(
                        "{} does not export 'relay_create_module': {}",
                        location, e
                    ))
                })?
            };
        }

        let library = Arc::new(library);
        Ok(LoadedUnit {
            name: CompactString::new(name),
            location: location.clone(),
            factory: Arc::new(DylibFactory {
                library: library.clone(),
                location,
            }),
            library: Some(library),
        })
    }

    fn location_of(&self, name: &str) -> String {
        self.find_file(name)
            .unwrap_or_else(|| self.directory.join(name))
            .display()
            .to_string()
    }

    fn list(&self) -> Vec<CompactString> {
        self.scan()
            .iter()
            .filter_map(|path| path.file_stem())
            .map(|stem| CompactString::new(Self::stem_to_name(&stem.to_string_lossy())))
            .collect()
    }
}

// ============================================================================
// Static source
// ============================================================================

/// In-memory name → factory table, for embedders and tests that do not ship
/// dylibs.
#[derive(Default)]
pub struct StaticModuleSource {
    factories: DashMap<CompactString, Arc<dyn ModuleFactory>>,
}

impl fmt::Debug for StaticModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticModuleSource")
            .field("registered", &self.factories.len())
            .finish()
    }
}

impl StaticModuleSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: ModuleFactory + 'static,
    {
        self.factories
            .insert(CompactString::new(name), Arc::new(factory));
    }
}

impl ModuleSource for StaticModuleSource {
    fn resolve(&self, name: &str) -> Result<LoadedUnit, ModuleSystemError> {
        let factory = self
            .factories
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ModuleSystemError::Resolution(format!("no registered module '{}'", name))
            })?;
        Ok(LoadedUnit {
            name: CompactString::new(name),
            location: self.location_of(name),
            factory,
            library: None,
        })
    }

    fn location_of(&self, name: &str) -> String {
        format!("static://{name}")
    }

    fn list(&self) -> Vec<CompactString> {
        let mut names: Vec<CompactString> =
            self.factories.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModuleError;
    use crate::module::ModuleContext;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    struct NullModule;

    #[async_trait]
    impl Module for NullModule {
        fn name(&self) -> &str {
            "null"
        }

        async fn setup(&mut self, _ctx: &ModuleContext) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    #[test]
    fn dylib_scan_finds_platform_libraries_only() {
        let temp_dir = TempDir::new().unwrap();
        let temp_path = temp_dir.path();

        let module_file = temp_path.join(format!(
            "libmodule_demo.{}",
            DylibModuleSource::DYLIB_EXTENSION
        ));
        fs::write(&module_file, "dummy content").unwrap();
        fs::write(temp_path.join("not_a_module.txt"), "dummy content").unwrap();

        let source = DylibModuleSource::new(temp_path);
        let names = source.list();
        assert_eq!(names, vec![CompactString::new("module_demo")]);
        assert_eq!(source.location_of("module_demo"), module_file.display().to_string());
    }

    #[test]
    fn dylib_resolve_of_garbage_file_is_a_library_error() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join(format!(
            "libbroken.{}",
            DylibModuleSource::DYLIB_EXTENSION
        ));
        fs::write(&file, "this is not a shared object").unwrap();

        let source = DylibModuleSource::new(temp_dir.path());
        let err = source.resolve("broken").unwrap_err();
        assert!(matches!(err, ModuleSystemError::Library(_)));
    }

    #[test]
    fn dylib_resolve_of_missing_name_is_a_resolution_error() {
        let temp_dir = TempDir::new().unwrap();
        let source = DylibModuleSource::new(temp_dir.path());
        let err = source.resolve("ghost").unwrap_err();
        assert!(matches!(err, ModuleSystemError::Resolution(_)));
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let source = DylibModuleSource::new("/definitely/not/a/real/path");
        assert!(source.list().is_empty());
    }

    #[test]
    fn static_source_resolves_registered_factories() {
        let source = StaticModuleSource::new();
        source.register("null", || -> Result<Box<dyn Module>, ModuleSystemError> {
            Ok(Box::new(NullModule))
        });

        let unit = source.resolve("null").unwrap();
        assert_eq!(unit.name, "null");
        assert_eq!(unit.location, "static://null");
        assert!(unit.library.is_none());

        let module = unit.factory.construct().unwrap();
        assert_eq!(module.name(), "null");

        assert!(matches!(
            source.resolve("missing"),
            Err(ModuleSystemError::Resolution(_))
        ));
        assert_eq!(source.list(), vec![CompactString::new("null")]);
    }
}
