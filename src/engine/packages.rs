//! Package content providers
//!
//! Modules are addressed by locators of the form `host/owner/repo/path.star`.
//! The first three segments name the package; everything after is a path
//! inside it.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::error::PackageError;

/// Number of leading locator segments naming a package.
pub const PACKAGE_PREFIX_SEGMENTS: usize = 3;

/// Package prefix → replacement package prefix.
pub type PackageReplaceOptions = BTreeMap<String, String>;

/// Source of module text for the interpreter.
pub trait PackageContentProvider {
    /// Script text of the module at an absolute locator.
    fn get_module_contents(&self, locator: &str) -> Result<String, PackageError>;

    /// Resolve a locator written inside `parent_module_locator` into an
    /// absolute one, applying package replacements.
    fn get_absolute_locator(
        &self,
        package_id: &str,
        parent_module_locator: &str,
        locator: &str,
        replace_options: &PackageReplaceOptions,
    ) -> Result<String, PackageError> {
        let absolute = if is_relative(locator) {
            resolve_relative(package_id, parent_module_locator, locator)?
        } else {
            locator.to_string()
        };
        Ok(apply_replace_options(&absolute, replace_options))
    }

    /// Make replacement packages available before interpretation starts.
    fn clone_replaced_packages_if_needed(
        &self,
        replace_options: &PackageReplaceOptions,
    ) -> Result<(), PackageError>;
}

/// Package part of a locator: its first three segments, or the whole
/// locator when it has fewer.
pub fn get_module_prefix(locator: &str) -> String {
    locator
        .splitn(PACKAGE_PREFIX_SEGMENTS + 1, '/')
        .take(PACKAGE_PREFIX_SEGMENTS)
        .collect::<Vec<_>>()
        .join("/")
}

fn is_relative(locator: &str) -> bool {
    locator.starts_with("./") || locator.starts_with("../")
}

fn resolve_relative(
    package_id: &str,
    parent_module_locator: &str,
    locator: &str,
) -> Result<String, PackageError> {
    let invalid = || PackageError::InvalidLocator {
        package_id: package_id.to_string(),
        locator: locator.to_string(),
    };
    let prefix = get_module_prefix(parent_module_locator);
    let root_depth = prefix.split('/').count();

    let mut segments: Vec<&str> = parent_module_locator.split('/').collect();
    // drop the file name of the importing module
    segments.pop();
    for part in locator.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.len() <= root_depth {
                    return Err(invalid());
                }
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if segments.len() <= root_depth {
        return Err(invalid());
    }
    Ok(segments.join("/"))
}

/// Rewrite a locator whose package has a replacement. The longest matching
/// prefix wins.
pub fn apply_replace_options(locator: &str, replace_options: &PackageReplaceOptions) -> String {
    let matched = replace_options
        .iter()
        .filter(|(package, _)| {
            locator == package.as_str()
                || locator
                    .strip_prefix(package.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .max_by_key(|(package, _)| package.len());
    match matched {
        Some((package, replacement)) => format!("{}{}", replacement, &locator[package.len()..]),
        None => locator.to_string(),
    }
}

/// Provider backed by a map of locator → script text.
#[derive(Debug, Default)]
pub struct InMemoryPackageContentProvider {
    modules: RwLock<HashMap<String, String>>,
}

impl InMemoryPackageContentProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`add_module`](Self::add_module).
    pub fn with_module(self, locator: impl Into<String>, contents: impl Into<String>) -> Self {
        self.add_module(locator, contents);
        self
    }

    /// Register or replace a module.
    pub fn add_module(&self, locator: impl Into<String>, contents: impl Into<String>) {
        self.modules.write().insert(locator.into(), contents.into());
    }
}

impl PackageContentProvider for InMemoryPackageContentProvider {
    fn get_module_contents(&self, locator: &str) -> Result<String, PackageError> {
        self.modules
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| PackageError::ModuleNotFound(locator.to_string()))
    }

    fn clone_replaced_packages_if_needed(
        &self,
        replace_options: &PackageReplaceOptions,
    ) -> Result<(), PackageError> {
        let modules = self.modules.read();
        for (package, replacement) in replace_options {
            let available = modules
                .keys()
                .any(|locator| get_module_prefix(locator) == get_module_prefix(replacement));
            if !available {
                return Err(PackageError::ReplacementUnavailable {
                    package: package.clone(),
                    replacement: replacement.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Provider reading packages from a directory laid out by locator, e.g.
/// `<root>/github.com/org/pkg/main.star`.
#[derive(Debug, Clone)]
pub struct LocalPackageContentProvider {
    root: PathBuf,
}

impl LocalPackageContentProvider {
    /// Provider rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File path of a locator under `root`. Locators must stay inside it.
    fn path_for(&self, locator: &str) -> Result<PathBuf, PackageError> {
        let mut path = self.root.clone();
        for component in Path::new(locator.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(PackageError::InvalidLocator {
                        package_id: get_module_prefix(locator),
                        locator: locator.to_string(),
                    });
                }
            }
        }
        Ok(path)
    }
}

impl PackageContentProvider for LocalPackageContentProvider {
    fn get_module_contents(&self, locator: &str) -> Result<String, PackageError> {
        let path = self.path_for(locator)?;
        if !path.is_file() {
            return Err(PackageError::ModuleNotFound(locator.to_string()));
        }
        fs::read_to_string(&path).map_err(|source| PackageError::Io { path, source })
    }

    fn clone_replaced_packages_if_needed(
        &self,
        replace_options: &PackageReplaceOptions,
    ) -> Result<(), PackageError> {
        for (package, replacement) in replace_options {
            if !self.path_for(replacement)?.is_dir() {
                return Err(PackageError::ReplacementUnavailable {
                    package: package.clone(),
                    replacement: replacement.clone(),
                });
            }
            tracing::debug!(%package, %replacement, "Replacement package available locally");
        }
        Ok(())
    }
}
