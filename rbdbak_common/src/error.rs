// rbdbak_common is the shared library implementing the backup orchestration engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::io;

use thiserror::Error;

/// A `ConfigError` indicates a failure loading or validating the backup configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist or could not be opened.
    #[error("Cannot open config file: {0}")]
    Io(#[from] io::Error),
    /// The requested section is missing from the configuration file.
    #[error("Config section \"{0}\" not found")]
    MissingSection(String),
    /// A required key is missing from the section.
    #[error("Missing required config key \"{0}\"")]
    MissingKey(String),
    /// A key's value could not be parsed into the expected type.
    #[error("Invalid value for config key \"{0}\": {1}")]
    InvalidValue(String, String),
    /// The underlying INI document is malformed.
    #[error("Malformed INI document: {0}")]
    Ini(#[from] ini::Error),
    /// The backup inventory YAML document is malformed.
    #[error("Malformed inventory document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A `ClusterError` indicates a failure querying the storage cluster.
/// Per spec these are never fatal to the run; callers degrade to sentinel values.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Cluster session could not be established for pool \"{0}\"")]
    SessionFailed(String),
    #[error("Cluster query failed: {0}")]
    QueryFailed(String),
    #[error("IO error talking to cluster tooling: {0}")]
    Io(#[from] io::Error),
}

/// A `TaskError` indicates a failure preparing or executing a task.
/// Task execution itself never propagates this type out of `Task::execute`;
/// it is captured into the task's `TaskResult` instead.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Missing required field \"{0}\" for this task variant")]
    MissingField(&'static str),
    #[error("External command failed with exit code {0}: {1}")]
    CommandFailed(i32, String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A `MetadataError` indicates a failure reading or writing a metadata document.
/// Per spec.md I1-I5 these are logged and treated as "no history", never fatal mid-stage.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Malformed metadata document \"{0}\": {1}")]
    Malformed(String, serde_json::Error),
}

/// An `EngineError` is the only error kind able to end the process with a non-zero
/// exit once logging has been initialized; all other failures are per-image
/// and are folded into a `RunSummary` instead of propagating.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to initialize the backup directory: {0}")]
    InitFailed(#[from] io::Error),
    #[error("Failed to initialize metadata store: {0}")]
    Metadata(#[from] MetadataError),
    #[error("Failed to resolve backup inventory: {0}")]
    Inventory(#[from] ConfigError),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;
pub type TaskOutcome<T> = std::result::Result<T, TaskError>;
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
pub type EngineResult<T> = std::result::Result<T, EngineError>;
