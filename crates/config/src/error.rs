// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the config crate.

/// Errors that can occur while loading or validating configuration.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error that occurred while reading a configuration file.
    #[error("File read error for {path}: {details}")]
    FileRead {
        /// The path that could not be read.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while writing a configuration file.
    #[error("File write error for {path}: {details}")]
    FileWrite {
        /// The path that could not be written.
        path: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// An error that occurred while deserializing a configuration file.
    #[error("JSON deserialization error: {details}")]
    Deserialization {
        /// A description of the error that occurred.
        details: String,
    },

    /// A required bridge entry is missing from the configuration.
    #[error("Required bridge `{name}` is missing from the configuration")]
    MissingBridge {
        /// The name of the missing bridge.
        name: String,
    },

    /// A bridge is referenced before its addresses are known.
    #[error("Bridge `{name}` has no resolved addresses yet")]
    MissingAddress {
        /// The name of the unresolved bridge.
        name: String,
    },

    /// The configuration is structurally invalid.
    #[error("Invalid configuration: {details}")]
    InvalidConfiguration {
        /// A description of the problem.
        details: String,
    },
}
