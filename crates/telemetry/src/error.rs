// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the telemetry crate.

/// Errors that can occur writing or reading profiles.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O error on a profile file.
    #[error("Profile I/O error for {path}: {details}")]
    Io {
        /// The path involved.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A profile record could not be parsed.
    #[error("Malformed profile record in {path}: {line}")]
    MalformedRecord {
        /// The file the record came from.
        path: String,
        /// The offending line.
        line: String,
    },

    /// The NTP server could not be reached or answered garbage.
    #[error("NTP query failed: {details}")]
    NtpUnreachable {
        /// A description of the error that occurred.
        details: String,
    },
}
