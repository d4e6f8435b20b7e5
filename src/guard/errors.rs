// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    error::Error,
    fmt, io,
    net::AddrParseError,
    num::ParseIntError,
    string::FromUtf8Error,
};

pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug)]
pub enum GuardError {
    Msg(String),
    Chained(String, Box<GuardError>),

    /// A CIDR block or address could not be parsed.
    InvalidRange {
        range: String,
        reason: String,
    },
    /// The cluster did not recognize a command; callers downgrade to a
    /// less capable command form when they see this.
    UnsupportedCommand {
        cmd: String,
        stderr: String,
    },
    CommandFailed {
        cmd: String,
        status: Option<i32>,
        stderr: String,
    },
    /// A cluster response could not be interpreted as a whole.
    ProtocolError(String),
    /// A single session descriptor could not be interpreted.
    MalformedDescriptor(String),
    UnsupportedKmsCapability {
        kms_id: String,
        capability: String,
    },
    UnsupportedOperation(String),
    LockUnavailable {
        resource: String,
        reason: String,
    },
    DeviceNotFound(String),
    /// Indicates a programming error in the caller, never a runtime
    /// condition of the cluster.
    InternalInvariantViolation(String),
    MissingBinaries {
        names: Vec<String>,
        locations: Vec<String>,
    },
    Cancelled,
    DeadlineExceeded,

    Io(io::Error),
    Serde(serde_json::error::Error),
    Regex(regex::Error),
    Decode(data_encoding::DecodeError),
    Join(tokio::task::JoinError),
    AddrParse(AddrParseError),
    ParseInt(ParseIntError),
    Utf8(FromUtf8Error),
}

impl GuardError {
    /// True if the error was caused by the caller's context ending rather
    /// than by the operation itself.
    pub fn is_context_error(&self) -> bool {
        match self {
            GuardError::Cancelled | GuardError::DeadlineExceeded => true,
            GuardError::Chained(_, err) => err.is_context_error(),
            _ => false,
        }
    }

    /// The innermost error of a chain.
    pub fn root_cause(&self) -> &GuardError {
        match self {
            GuardError::Chained(_, err) => err.root_cause(),
            err => err,
        }
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardError::Msg(s) => write!(f, "{s}"),
            GuardError::Chained(s, err) => write!(f, "{s}; caused by: {err}"),
            GuardError::InvalidRange { range, reason } => {
                write!(f, "Invalid address range \"{range}\": {reason}")
            }
            GuardError::UnsupportedCommand { cmd, stderr } => write!(
                f,
                "Command {cmd} is not supported by the cluster; stderr: {stderr:?}"
            ),
            GuardError::CommandFailed {
                cmd,
                status,
                stderr,
            } => match status {
                Some(code) => write!(
                    f,
                    "Command {cmd} failed with exit code {code}; stderr: {stderr:?}"
                ),
                None => write!(
                    f,
                    "Command {cmd} was terminated by a signal; stderr: {stderr:?}"
                ),
            },
            GuardError::ProtocolError(s) => write!(f, "Unexpected cluster response: {s}"),
            GuardError::MalformedDescriptor(s) => {
                write!(f, "Malformed session descriptor: {s}")
            }
            GuardError::UnsupportedKmsCapability { kms_id, capability } => write!(
                f,
                "KMS \"{kms_id}\" does not support the required capability: {capability}"
            ),
            GuardError::UnsupportedOperation(s) => write!(f, "Unsupported operation: {s}"),
            GuardError::LockUnavailable { resource, reason } => {
                write!(f, "Failed to acquire lock on {resource}: {reason}")
            }
            GuardError::DeviceNotFound(s) => write!(f, "Device not found: {s}"),
            GuardError::InternalInvariantViolation(s) => write!(f, "BUG: {s}"),
            GuardError::MissingBinaries { names, locations } => write!(
                f,
                "Executables {} could not be found in any of {}",
                names.join(", "),
                locations.join(", ")
            ),
            GuardError::Cancelled => write!(f, "Operation was cancelled"),
            GuardError::DeadlineExceeded => write!(f, "Operation deadline was exceeded"),
            GuardError::Io(err) => write!(f, "IO error: {err}"),
            GuardError::Serde(err) => write!(f, "Serde error: {err}"),
            GuardError::Regex(err) => write!(f, "Regex error: {err}"),
            GuardError::Decode(err) => write!(f, "Data encoding error: {err}"),
            GuardError::Join(err) => write!(f, "Thread joining error: {err}"),
            GuardError::AddrParse(err) => write!(f, "Address parse error: {err}"),
            GuardError::ParseInt(err) => write!(f, "Integer parse error: {err}"),
            GuardError::Utf8(err) => write!(f, "Utf8 error: {err}"),
        }
    }
}

impl Error for GuardError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GuardError::Chained(_, err) => Some(err.as_ref()),
            GuardError::Io(err) => Some(err),
            GuardError::Serde(err) => Some(err),
            GuardError::Regex(err) => Some(err),
            GuardError::Decode(err) => Some(err),
            GuardError::Join(err) => Some(err),
            GuardError::AddrParse(err) => Some(err),
            GuardError::ParseInt(err) => Some(err),
            GuardError::Utf8(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for GuardError {
    fn from(err: io::Error) -> GuardError {
        GuardError::Io(err)
    }
}

impl From<serde_json::error::Error> for GuardError {
    fn from(err: serde_json::error::Error) -> GuardError {
        GuardError::Serde(err)
    }
}

impl From<regex::Error> for GuardError {
    fn from(err: regex::Error) -> GuardError {
        GuardError::Regex(err)
    }
}

impl From<data_encoding::DecodeError> for GuardError {
    fn from(err: data_encoding::DecodeError) -> GuardError {
        GuardError::Decode(err)
    }
}

impl From<tokio::task::JoinError> for GuardError {
    fn from(err: tokio::task::JoinError) -> GuardError {
        GuardError::Join(err)
    }
}

impl From<AddrParseError> for GuardError {
    fn from(err: AddrParseError) -> GuardError {
        GuardError::AddrParse(err)
    }
}

impl From<ParseIntError> for GuardError {
    fn from(err: ParseIntError) -> GuardError {
        GuardError::ParseInt(err)
    }
}

impl From<FromUtf8Error> for GuardError {
    fn from(err: FromUtf8Error) -> GuardError {
        GuardError::Utf8(err)
    }
}
