// Copyright 2025 The Gargantua Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The error type shared by every Gargantua crate.
//!
//! Conditions are carried as gRPC-style [`Code`]s so they survive the trip
//! through the object store, the reconcilers and the RPC surface unchanged:
//! a `resourceVersion` conflict is `Aborted`, an informer cache that has not
//! synced is `Unavailable`, a document that does not decode is `DataLoss` and
//! an allocation that found no capacity is `ResourceExhausted`.

use core::fmt;
use std::string::ToString;

#[macro_export]
macro_rules! make_err {
    ($code:expr, $($arg:tt)+) => {{
        $crate::Error::new($code, format!("{}", format_args!($($arg)+)))
    }};
}

#[macro_export]
macro_rules! make_input_err {
    ($($arg:tt)+) => {{
        $crate::make_err!($crate::Code::InvalidArgument, $($arg)+)
    }};
}

/// Returns an `InvalidArgument` error from the enclosing function when
/// `$cond` holds.
#[macro_export]
macro_rules! error_if {
    ($cond:expr, $($arg:tt)+) => {{
        if $cond {
            Err($crate::make_input_err!($($arg)+))?;
        }
    }};
}

const MERGE_SEPARATOR: &str = "---";

#[derive(Debug, Eq, PartialEq, Clone)]
pub struct Error {
    pub code: Code,
    /// Innermost first; every `err_tip` pushes one more.
    pub messages: Vec<String>,
}

impl Error {
    #[must_use]
    pub fn new(code: Code, msg: String) -> Self {
        let messages = if msg.is_empty() { Vec::new() } else { vec![msg] };
        Self { code, messages }
    }

    #[inline]
    #[must_use]
    pub fn append<S: ToString>(mut self, msg: S) -> Self {
        self.messages.push(msg.to_string());
        self
    }

    /// Folds `other`'s messages into this error, keeping this error's code.
    #[must_use]
    pub fn merge<E: Into<Self>>(mut self, other: E) -> Self {
        let mut other: Self = other.into();
        self.messages.push(MERGE_SEPARATOR.to_string());
        self.messages.append(&mut other.messages);
        self
    }

    pub fn message_string(&self) -> String {
        self.messages.join(" : ")
    }

    /// Errors that are the caller's fault or that describe corrupt
    /// configuration will never succeed on a retry.
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self.code,
            Code::InvalidArgument
                | Code::DataLoss
                | Code::AlreadyExists
                | Code::ResourceExhausted
                | Code::PermissionDenied
                | Code::Unauthenticated
        )
    }
}

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = f.debug_struct("Error");
        builder.field("code", &self.code);
        if !self.messages.is_empty() {
            builder.field("messages", &self.messages);
        }
        builder.finish()
    }
}

impl serde::ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        make_input_err!("{msg}")
    }
}

impl serde::de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        make_input_err!("{msg}")
    }
}

/// `From` impls that only pick a code and keep the source's message.
macro_rules! coded_from {
    ($($source:ty => $code:ident),+ $(,)?) => {
        $(
            impl From<$source> for Error {
                fn from(err: $source) -> Self {
                    make_err!(Code::$code, "{err}")
                }
            }
        )+
    };
}

coded_from!(
    serde_json::Error => DataLoss,
    serde_json5::Error => DataLoss,
    chrono::ParseError => InvalidArgument,
    core::num::TryFromIntError => InvalidArgument,
    core::num::ParseIntError => InvalidArgument,
    tokio::task::JoinError => Internal,
    tokio::time::error::Elapsed => DeadlineExceeded,
);

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.kind().into(), err.to_string())
    }
}

impl From<Code> for Error {
    fn from(code: Code) -> Self {
        Self::new(code, String::new())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        make_err!(status.code().into(), "{}", status.message())
    }
}

impl From<Error> for tonic::Status {
    fn from(val: Error) -> Self {
        Self::new(val.code.into(), val.message_string())
    }
}

pub trait ResultExt<T> {
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce(&Error) -> (Code, S)) + Sized;

    /// Appends a message to the error, keeping its code.
    #[inline]
    fn err_tip<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce() -> S) + Sized,
    {
        self.err_tip_with_code(|e| (e.code, tip_fn()))
    }
}

fn tip<F, S>(mut error: Error, tip_fn: F) -> Error
where
    S: ToString,
    F: FnOnce(&Error) -> (Code, S),
{
    let (code, message) = tip_fn(&error);
    error.code = code;
    error.messages.push(message.to_string());
    error
}

impl<T, E: Into<Error>> ResultExt<T> for Result<T, E> {
    #[inline]
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.map_err(|e| tip(e.into(), tip_fn))
    }
}

/// A missing value is `Internal` unless the tip says otherwise.
impl<T> ResultExt<T> for Option<T> {
    #[inline]
    fn err_tip_with_code<F, S>(self, tip_fn: F) -> Result<T, Error>
    where
        Self: Sized,
        S: ToString,
        F: (FnOnce(&Error) -> (Code, S)) + Sized,
    {
        self.ok_or_else(|| tip(Code::Internal.into(), tip_fn))
    }
}

macro_rules! codes {
    ($($name:ident = $value:literal),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum Code {
            $($name = $value,)+
        }

        impl From<i32> for Code {
            fn from(code: i32) -> Self {
                match code {
                    $($value => Self::$name,)+
                    _ => Self::Unknown,
                }
            }
        }

        impl From<tonic::Code> for Code {
            fn from(code: tonic::Code) -> Self {
                match code {
                    $(tonic::Code::$name => Self::$name,)+
                }
            }
        }

        impl From<Code> for tonic::Code {
            fn from(code: Code) -> Self {
                match code {
                    $(Code::$name => Self::$name,)+
                }
            }
        }
    };
}

codes!(
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
);

impl From<std::io::ErrorKind> for Code {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::AlreadyExists => Self::AlreadyExists,
            ErrorKind::InvalidInput | ErrorKind::InvalidData => Self::InvalidArgument,
            ErrorKind::TimedOut => Self::DeadlineExceeded,
            ErrorKind::Interrupted => Self::Aborted,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::AddrInUse => Self::Unavailable,
            _ => Self::Internal,
        }
    }
}
