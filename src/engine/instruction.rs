//! Instruction catalogue and resolution against history
//!
//! An instruction is one action the enclave should perform. Resolution
//! compares a freshly generated instruction with one taken from the enclave
//! history and decides whether the historical result can be reused (Equal),
//! whether the new instruction supersedes it (Update), or whether the two
//! are unrelated (Different). Resolution never touches a live enclave; what
//! it learns about services and artifacts is recorded in
//! [`EnclaveComponents`] so that later instructions of the same pass can see
//! it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Result of resolving a new instruction against a historical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionStatus {
    /// Identical inputs; the historical result can be reused.
    Equal,
    /// Same action and target with changed parameters.
    Update,
    /// No relationship.
    Different,
}

impl ResolutionStatus {
    /// Whether the historical instruction can stand in for the new one at
    /// all (Equal or Update).
    pub fn is_match(self) -> bool {
        matches!(self, ResolutionStatus::Equal | ResolutionStatus::Update)
    }
}

/// What a pass learned about an enclave component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentStatus {
    /// Unchanged relative to history.
    Equal,
    /// Changed relative to history; dependants must re-run.
    Updated,
    /// Not present in history.
    New,
}

/// Dependency accumulator for one interpretation pass.
///
/// Tracks services and files artifacts touched by the pass so resolution of
/// later instructions can tell whether something they depend on changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnclaveComponents {
    services: BTreeMap<String, ComponentStatus>,
    files_artifacts: BTreeMap<String, ComponentStatus>,
}

impl EnclaveComponents {
    /// Empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the status of a service.
    pub fn add_service(&mut self, name: &str, status: ComponentStatus) {
        self.services.insert(name.to_string(), status);
    }

    /// Record the status of a files artifact.
    pub fn add_files_artifact(&mut self, name: &str, status: ComponentStatus) {
        self.files_artifacts.insert(name.to_string(), status);
    }

    /// Status recorded for a service, if any.
    pub fn service_status(&self, name: &str) -> Option<ComponentStatus> {
        self.services.get(name).copied()
    }

    /// Status recorded for a files artifact, if any.
    pub fn files_artifact_status(&self, name: &str) -> Option<ComponentStatus> {
        self.files_artifacts.get(name).copied()
    }

    /// Whether the service changed (or appeared) in this pass.
    pub fn is_service_updated(&self, name: &str) -> bool {
        matches!(
            self.service_status(name),
            Some(ComponentStatus::Updated) | Some(ComponentStatus::New)
        )
    }

    /// Whether the files artifact changed (or appeared) in this pass.
    pub fn is_files_artifact_updated(&self, name: &str) -> bool {
        matches!(
            self.files_artifact_status(name),
            Some(ComponentStatus::Updated) | Some(ComponentStatus::New)
        )
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.files_artifacts.is_empty()
    }
}

/// Image pull policy forwarded to instructions that start containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageDownloadMode {
    /// Always pull.
    Always,
    /// Pull only when the image is not present locally.
    #[default]
    Missing,
}

impl fmt::Display for ImageDownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageDownloadMode::Always => write!(f, "always"),
            ImageDownloadMode::Missing => write!(f, "missing"),
        }
    }
}

/// Execution settings carried alongside an instruction. Not part of its
/// identity: two instructions differing only here resolve Equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstructionOptions {
    /// Do not wait for readiness checks.
    pub non_blocking: bool,
    /// Image pull policy.
    pub image_download_mode: ImageDownloadMode,
}

/// One action against the enclave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    /// Start (or reconfigure) a service.
    AddService {
        /// Service name.
        name: String,
        /// Service configuration as JSON.
        config: serde_json::Value,
    },
    /// Stop and remove a service.
    RemoveService {
        /// Service name.
        name: String,
    },
    /// Run a command inside a service.
    Exec {
        /// Target service.
        service_name: String,
        /// Command and arguments.
        command: Vec<String>,
    },
    /// Store files from the package as a named artifact.
    UploadFiles {
        /// Package-relative source path.
        src: String,
        /// Artifact name.
        name: String,
    },
    /// Emit a message in the run output.
    Print {
        /// Message text.
        message: String,
    },
}

impl Instruction {
    /// Name the script uses to issue this instruction.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::AddService { .. } => "add_service",
            Instruction::RemoveService { .. } => "remove_service",
            Instruction::Exec { .. } => "exec",
            Instruction::UploadFiles { .. } => "upload_files",
            Instruction::Print { .. } => "print",
        }
    }

    /// Resolve this (new) instruction against a historical one.
    pub fn try_resolve_with(
        &self,
        historical: &Instruction,
        components: &mut EnclaveComponents,
    ) -> ResolutionStatus {
        match (self, historical) {
            (
                Instruction::AddService { name, config },
                Instruction::AddService {
                    name: old_name,
                    config: old_config,
                },
            ) if name == old_name => {
                let mounts_changed = mounted_artifacts(config)
                    .any(|artifact| components.is_files_artifact_updated(artifact));
                if config == old_config && !mounts_changed {
                    components.add_service(name, ComponentStatus::Equal);
                    ResolutionStatus::Equal
                } else {
                    components.add_service(name, ComponentStatus::Updated);
                    ResolutionStatus::Update
                }
            }
            (
                Instruction::RemoveService { name },
                Instruction::RemoveService { name: old_name },
            ) if name == old_name => ResolutionStatus::Equal,
            (
                Instruction::Exec {
                    service_name,
                    command,
                },
                Instruction::Exec {
                    service_name: old_service,
                    command: old_command,
                },
            ) if service_name == old_service => {
                if command != old_command || components.is_service_updated(service_name) {
                    ResolutionStatus::Update
                } else {
                    ResolutionStatus::Equal
                }
            }
            (
                Instruction::UploadFiles { src, name },
                Instruction::UploadFiles {
                    src: old_src,
                    name: old_name,
                },
            ) if name == old_name => {
                if src == old_src {
                    components.add_files_artifact(name, ComponentStatus::Equal);
                    ResolutionStatus::Equal
                } else {
                    components.add_files_artifact(name, ComponentStatus::Updated);
                    ResolutionStatus::Update
                }
            }
            (Instruction::Print { message }, Instruction::Print { message: old }) => {
                if message == old {
                    ResolutionStatus::Equal
                } else {
                    ResolutionStatus::Update
                }
            }
            _ => ResolutionStatus::Different,
        }
    }

    /// Record in `components` that this instruction runs without a
    /// historical counterpart.
    pub fn record_as_new(&self, components: &mut EnclaveComponents) {
        match self {
            Instruction::AddService { name, .. } => {
                components.add_service(name, ComponentStatus::New)
            }
            Instruction::UploadFiles { name, .. } => {
                components.add_files_artifact(name, ComponentStatus::New)
            }
            _ => {}
        }
    }
}

/// Artifact names an `add_service` config mounts, from its `files` dict.
fn mounted_artifacts(config: &serde_json::Value) -> impl Iterator<Item = &str> {
    config
        .get("files")
        .and_then(serde_json::Value::as_object)
        .into_iter()
        .flat_map(|files| files.values())
        .filter_map(serde_json::Value::as_str)
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::AddService { name, config } => {
                write!(f, "add_service(name={:?}, config={})", name, config)
            }
            Instruction::RemoveService { name } => write!(f, "remove_service(name={:?})", name),
            Instruction::Exec {
                service_name,
                command,
            } => write!(f, "exec(service_name={:?}, command={:?})", service_name, command),
            Instruction::UploadFiles { src, name } => {
                write!(f, "upload_files(src={:?}, name={:?})", src, name)
            }
            Instruction::Print { message } => write!(f, "print(msg={:?})", message),
        }
    }
}
