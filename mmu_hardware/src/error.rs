use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("motion controller communication timeout")]
    CommTimeout,
    #[error("motion stopped on request")]
    Stopped,
    #[error("unknown endstop '{0}'")]
    UnknownEndstop(String),
    #[error("actuator fault: {0}")]
    Actuator(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
