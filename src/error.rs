// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for congestion control operations.

use strum_macros::EnumIter;

/// Errors reported by the configuration and observability surfaces.
///
/// The per-ack congestion control path never fails: malformed samples are
/// ignored rather than reported.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// There is no more work to do.
    #[default]
    Done,

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The configuration is invalid.
    InvalidConfig(String),

    /// I/O error.
    IoError(String),
}

impl Error {
    /// Return the error number using by a C caller.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Done => -100,
            Error::InvalidState(_) => -104,
            Error::InvalidConfig(_) => -106,
            Error::IoError(_) => -112,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(format!("{}", err))
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(format!("{}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn error_errno() {
        let mut errnos: Vec<i32> = Error::iter().map(|e| e.to_errno()).collect();
        errnos.dedup();
        assert_eq!(errnos.len(), 4);
        assert!(errnos.iter().all(|e| *e < 0));
    }

    #[test]
    fn error_from_io() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err = Error::from(err);
        assert_eq!(err, Error::IoError("pipe closed".into()));
        assert_eq!(format!("{}", err), "IoError(\"pipe closed\")");
    }
}
