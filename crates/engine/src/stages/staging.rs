// SPDX-License-Identifier: Apache-2.0

//! Staging directive execution.
//!
//! `LINK` is a symlink, `COPY` a file copy, `MOVE` a rename falling back
//! to copy + unlink across filesystems, and `TRANSFER` dispatches to the
//! configured [`StagingBackend`]. Sources and targets resolve against the
//! unit sandbox; the staging URL scheme resolves against the shared
//! staging area.

use crate::error::Error;
use async_trait::async_trait;
use pilotflow_state::{StagingAction, StagingDirective, StagingFlags};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

/// Where a directive's paths resolve.
#[derive(Debug, Clone, Copy)]
pub struct StagingContext<'a> {
    /// The unit's working directory.
    pub unit_sandbox: &'a Path,
    /// The shared staging area, when configured.
    pub staging_area: Option<&'a Path>,
    /// The URL scheme resolving against the staging area.
    pub scheme: &'a str,
}

/// The pluggable transfer capability behind `TRANSFER` directives.
///
/// The set of supported remote schemes is open; the runtime only provides
/// the local backend.
#[async_trait]
pub trait StagingBackend: Send + Sync {
    /// Moves data from `source` to `target` on behalf of the directive.
    async fn transfer(
        &self,
        source: &Path,
        target: &Path,
        directive: &StagingDirective,
    ) -> Result<(), Error>;
}

/// The local backend: `TRANSFER` degrades to a copy on the same host.
#[derive(Debug, Default)]
pub struct LocalStagingBackend;

#[async_trait]
impl StagingBackend for LocalStagingBackend {
    async fn transfer(
        &self,
        source: &Path,
        target: &Path,
        directive: &StagingDirective,
    ) -> Result<(), Error> {
        copy_entry(source, target, directive.flags.contains(StagingFlags::RECURSIVE)).await
    }
}

/// Resolves one directive path: the staging scheme maps into the staging
/// area, absolute paths stand as they are, everything else is relative to
/// the unit sandbox.
#[must_use]
pub fn resolve(ctx: &StagingContext<'_>, spec: &str) -> PathBuf {
    let scheme_prefix = format!("{}:", ctx.scheme);
    if let Some(rest) = spec.strip_prefix(&scheme_prefix) {
        let rest = rest.trim_start_matches('/');
        return match ctx.staging_area {
            Some(area) => area.join(rest),
            None => ctx.unit_sandbox.join(rest),
        };
    }
    let path = Path::new(spec);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        ctx.unit_sandbox.join(path)
    }
}

/// Executes one directive. Any failure fails the whole unit at the caller.
pub async fn apply(
    directive: &StagingDirective,
    ctx: &StagingContext<'_>,
    backend: &dyn StagingBackend,
) -> Result<(), Error> {
    let source = resolve(ctx, &directive.source);
    let target = resolve(ctx, &directive.target);

    if directive.flags.contains(StagingFlags::CREATE_PARENTS) {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    match directive.action {
        StagingAction::Link => tokio::fs::symlink(&source, &target).await?,
        StagingAction::Copy => {
            copy_entry(
                &source,
                &target,
                directive.flags.contains(StagingFlags::RECURSIVE),
            )
            .await?;
        }
        StagingAction::Move => {
            if tokio::fs::rename(&source, &target).await.is_err() {
                // rename does not cross filesystems
                copy_entry(
                    &source,
                    &target,
                    directive.flags.contains(StagingFlags::RECURSIVE),
                )
                .await?;
                remove_entry(&source).await?;
            }
        }
        StagingAction::Transfer => backend.transfer(&source, &target, directive).await?,
    }
    Ok(())
}

async fn copy_entry(source: &Path, target: &Path, recursive: bool) -> Result<(), Error> {
    let meta = tokio::fs::metadata(source).await?;
    if meta.is_dir() {
        if !recursive {
            return Err(Error::Io {
                details: format!(
                    "{} is a directory; pass the RECURSIVE flag to copy it",
                    source.display()
                ),
            });
        }
        copy_dir(source, target).await
    } else {
        let _ = tokio::fs::copy(source, target).await?;
        Ok(())
    }
}

fn copy_dir<'a>(
    source: &'a Path,
    target: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(target).await?;
        let mut entries = tokio::fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_target = target.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir(&entry.path(), &entry_target).await?;
            } else {
                let _ = tokio::fs::copy(entry.path(), &entry_target).await?;
            }
        }
        Ok(())
    })
}

async fn remove_entry(path: &Path) -> Result<(), Error> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pilotflow_state::StagingFlags;

    fn directive(action: StagingAction, source: &str, target: &str, flags: StagingFlags) -> StagingDirective {
        StagingDirective {
            action,
            source: source.to_owned(),
            target: target.to_owned(),
            flags,
        }
    }

    #[tokio::test]
    async fn copy_with_create_parents() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().join("sandbox");
        tokio::fs::create_dir_all(&sandbox).await.unwrap();
        tokio::fs::write(sandbox.join("input.dat"), b"payload")
            .await
            .unwrap();

        let ctx = StagingContext {
            unit_sandbox: &sandbox,
            staging_area: None,
            scheme: "staging",
        };
        let d = directive(
            StagingAction::Copy,
            "input.dat",
            "in/deep/input.dat",
            StagingFlags::CREATE_PARENTS,
        );
        apply(&d, &ctx, &LocalStagingBackend).await.unwrap();
        assert_eq!(
            tokio::fs::read(sandbox.join("in/deep/input.dat"))
                .await
                .unwrap(),
            b"payload"
        );
    }

    #[tokio::test]
    async fn missing_parents_fail_cleanly_without_the_flag() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().to_path_buf();
        tokio::fs::write(sandbox.join("input.dat"), b"x").await.unwrap();

        let ctx = StagingContext {
            unit_sandbox: &sandbox,
            staging_area: None,
            scheme: "staging",
        };
        let d = directive(
            StagingAction::Copy,
            "input.dat",
            "missing/dir/input.dat",
            StagingFlags::empty(),
        );
        assert!(apply(&d, &ctx, &LocalStagingBackend).await.is_err());
    }

    #[tokio::test]
    async fn link_points_at_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().to_path_buf();
        tokio::fs::write(sandbox.join("data"), b"d").await.unwrap();

        let ctx = StagingContext {
            unit_sandbox: &sandbox,
            staging_area: None,
            scheme: "staging",
        };
        let d = directive(StagingAction::Link, "data", "data.lnk", StagingFlags::empty());
        apply(&d, &ctx, &LocalStagingBackend).await.unwrap();
        let meta = tokio::fs::symlink_metadata(sandbox.join("data.lnk"))
            .await
            .unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[tokio::test]
    async fn move_removes_the_source() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = dir.path().to_path_buf();
        tokio::fs::write(sandbox.join("a"), b"m").await.unwrap();

        let ctx = StagingContext {
            unit_sandbox: &sandbox,
            staging_area: None,
            scheme: "staging",
        };
        let d = directive(StagingAction::Move, "a", "b", StagingFlags::empty());
        apply(&d, &ctx, &LocalStagingBackend).await.unwrap();
        assert!(!sandbox.join("a").exists());
        assert_eq!(tokio::fs::read(sandbox.join("b")).await.unwrap(), b"m");
    }

    #[tokio::test]
    async fn staging_scheme_resolves_against_the_area() {
        let dir = tempfile::tempdir().unwrap();
        let area = dir.path().join("area");
        let sandbox = dir.path().join("sandbox");
        tokio::fs::create_dir_all(&area).await.unwrap();
        tokio::fs::create_dir_all(&sandbox).await.unwrap();
        tokio::fs::write(area.join("shared.dat"), b"s").await.unwrap();

        let ctx = StagingContext {
            unit_sandbox: &sandbox,
            staging_area: Some(&area),
            scheme: "staging",
        };
        assert_eq!(resolve(&ctx, "staging:///shared.dat"), area.join("shared.dat"));
        assert_eq!(resolve(&ctx, "/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(resolve(&ctx, "rel.dat"), sandbox.join("rel.dat"));

        let d = directive(
            StagingAction::Copy,
            "staging:///shared.dat",
            "local.dat",
            StagingFlags::empty(),
        );
        apply(&d, &ctx, &LocalStagingBackend).await.unwrap();
        assert!(sandbox.join("local.dat").exists());
    }
}
