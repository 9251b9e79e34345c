// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Errors for the message fabric.
//!
//! Important note: It is important not to use `!Send` data types in errors (e.g. avoid using Rc) to
//! ensure these errors can be emitted in both `Send` and `!Send` contexts.

/// Errors that can occur operating bridges and their client endpoints.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A listener could not be bound.
    #[error("Failed to bind `{addr}`: {details}")]
    Bind {
        /// The address that could not be bound.
        addr: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// A client endpoint could not connect to a bridge.
    #[error("Failed to connect to `{addr}`: {details}")]
    Connect {
        /// The bridge address.
        addr: String,
        /// A description of the error that occurred.
        details: String,
    },

    /// An I/O error on an established connection.
    #[error("I/O error: {details}")]
    Io {
        /// A description of the error that occurred.
        details: String,
    },

    /// A frame exceeded the maximum frame size.
    #[error("Frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// The offending frame size.
        size: usize,
        /// The enforced limit.
        max: usize,
    },

    /// The peer closed the connection.
    #[error("The connection is closed")]
    Closed,

    /// The subscription handshake was malformed.
    #[error("Invalid subscription handshake: {details}")]
    Handshake {
        /// A description of the error that occurred.
        details: String,
    },

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {details}")]
    Serialization {
        /// A description of the error that occurred.
        details: String,
    },
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io {
            details: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization {
            details: e.to_string(),
        }
    }
}
