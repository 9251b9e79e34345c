// SPDX-License-Identifier: Apache-2.0

//! The staged unit pipeline.
//!
//! Each stage is a [`crate::component::Component`] with a specific
//! handler: pull work from the input queue, advance the unit through the
//! state machine, perform the local side effect, push to the next stage.

pub mod executing;
pub mod launching;
pub mod scheduler;
pub mod staging;
pub mod staging_input;
pub mod staging_output;
pub mod update_worker;

pub use executing::Executing;
pub use launching::Launching;
pub use scheduler::Scheduler;
pub use staging::{LocalStagingBackend, StagingBackend, StagingContext};
pub use staging_input::StagingInput;
pub use staging_output::{AgentStagingOutput, UmgrStagingOutput};
pub use update_worker::UpdateWorker;

/// Bytes of stdout/stderr retained on the unit document.
pub const STDIO_TAIL: usize = 8192;

/// Reads a bounded tail of a stdio file, never splitting a UTF-8 code
/// point. Non-UTF-8 content is replaced by a textual sentinel.
pub(crate) async fn read_tail(path: &std::path::Path, limit: usize) -> String {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return String::new();
    };
    let start = bytes.len().saturating_sub(limit);
    let mut tail = &bytes[start..];
    while !tail.is_empty() && (tail[0] & 0xC0) == 0x80 {
        tail = &tail[1..];
    }
    match std::str::from_utf8(tail) {
        Ok(text) => text.to_owned(),
        Err(_) => format!("[non-unicode data in {}]", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_is_bounded_and_utf8_safe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");

        tokio::fs::write(&path, "é".repeat(10)).await.unwrap();
        // an odd limit would split the two-byte code point
        let tail = read_tail(&path, 5).await;
        assert_eq!(tail, "éé");

        tokio::fs::write(&path, [0xFFu8, 0xFE, 0x00]).await.unwrap();
        let tail = read_tail(&path, 16).await;
        assert!(tail.starts_with("[non-unicode data in "));

        assert_eq!(read_tail(dir.path().join("absent").as_path(), 8).await, "");
    }
}
