use std::fmt;

use crate::util::{CommandError, FileError};

#[derive(Debug)]
pub enum PipelineError {
    Task(String),
    Dependency(String),
    Io(std::io::Error),
    File(FileError),
    Command(CommandError),
    Parse(String),
    Config(String),
    Peaks(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Task(msg) => write!(f, "Task error: {}", msg),
            PipelineError::Dependency(msg) => write!(f, "Dependency error: {}", msg),
            PipelineError::Io(err) => write!(f, "IO error: {}", err),
            PipelineError::File(err) => write!(f, "File error: {}", err),
            PipelineError::Command(err) => write!(f, "Command error: {}", err),
            PipelineError::Parse(msg) => write!(f, "Parse error: {}", msg),
            PipelineError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PipelineError::Peaks(msg) => write!(f, "Peak table error: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Io(err) => Some(err),
            PipelineError::File(err) => Some(err),
            PipelineError::Command(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err)
    }
}

impl From<FileError> for PipelineError {
    fn from(err: FileError) -> Self {
        PipelineError::File(err)
    }
}

impl From<CommandError> for PipelineError {
    fn from(err: CommandError) -> Self {
        PipelineError::Command(err)
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
