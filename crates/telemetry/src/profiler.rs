// SPDX-License-Identifier: Apache-2.0

//! The profile writer.

use crate::clock::ClockSync;
use crate::error::Error;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// A shared handle to a component's profile file.
pub type ProfileSink = Arc<Profiler>;

/// A persistent profile file handle.
///
/// Records are `time,name:tid,uid,state,event,msg` lines; the first data
/// record carries the clock-sync tuple. All writes go through one mutex;
/// contention is negligible at the record rates involved.
#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    name: String,
    handle: Option<Mutex<BufWriter<File>>>,
}

impl Profiler {
    /// Opens `<path>/<name>.prof` when [`crate::PROFILE_ENV`] is set and
    /// non-empty; otherwise returns a disabled no-op sink.
    pub fn from_env(name: &str, path: &Path) -> Result<Self, Error> {
        let enabled = std::env::var(crate::PROFILE_ENV)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if enabled {
            Self::create(name, path)
        } else {
            Ok(Self::disabled(name))
        }
    }

    /// Opens `<path>/<name>.prof` unconditionally and writes the header
    /// and the clock-sync record.
    pub fn create(name: &str, path: &Path) -> Result<Self, Error> {
        let io_err = |e: std::io::Error| Error::Io {
            path: path.display().to_string(),
            details: e.to_string(),
        };

        std::fs::create_dir_all(path).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.join(format!("{name}.prof")))
            .map_err(io_err)?;
        let mut writer = BufWriter::new(file);

        let sync = ClockSync::establish();
        writeln!(writer, "{}", crate::PROF_HEADER).map_err(io_err)?;
        writeln!(
            writer,
            "{:.4},{name}:,,,sync abs,{}",
            crate::timestamp(),
            sync.wire()
        )
        .map_err(io_err)?;

        Ok(Self {
            enabled: true,
            name: name.to_owned(),
            handle: Some(Mutex::new(writer)),
        })
    }

    /// A sink that swallows every record.
    #[must_use]
    pub fn disabled(name: &str) -> Self {
        Self {
            enabled: false,
            name: name.to_owned(),
            handle: None,
        }
    }

    /// `true` when records actually reach a file.
    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// The component name this profile belongs to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one record with the current timestamp.
    pub fn prof(&self, event: &str, uid: &str, state: &str, msg: &str) {
        self.prof_at(crate::timestamp(), event, uid, state, msg);
    }

    /// Writes one record with an explicit timestamp.
    pub fn prof_at(&self, timestamp: f64, event: &str, uid: &str, state: &str, msg: &str) {
        let Some(handle) = &self.handle else { return };
        let tid = std::thread::current()
            .name()
            .unwrap_or("-")
            .to_owned();
        let mut writer = handle.lock();
        if let Err(e) = writeln!(
            writer,
            "{timestamp:.4},{}:{tid},{uid},{state},{event},{msg}",
            self.name
        ) {
            tracing::warn!(error = %e, "profile record lost");
        }
    }

    /// Flushes buffered records to disk.
    pub fn flush(&self) {
        if let Some(handle) = &self.handle {
            self.prof("flush", "", "", "");
            let mut writer = handle.lock();
            if let Err(e) = writer.flush() {
                tracing::warn!(error = %e, "profile flush failed");
            }
        }
    }

    /// Writes the closing `QED` record and flushes.
    pub fn close(&self) {
        if self.enabled {
            self.prof("QED", "", "", "");
            if let Some(handle) = &self.handle {
                let mut writer = handle.lock();
                if let Err(e) = writer.flush() {
                    tracing::warn!(error = %e, "profile close failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_land_in_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let prof = Profiler::create("scheduler.0000", dir.path()).unwrap();
        prof.prof("advance", "unit.000000", "ALLOCATING", "");
        prof.close();

        let text = std::fs::read_to_string(dir.path().join("scheduler.0000.prof")).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), crate::PROF_HEADER);
        assert!(lines.next().unwrap().contains("sync abs"));
        let advance = lines.next().unwrap();
        assert!(advance.contains(",unit.000000,ALLOCATING,advance,"));
        assert!(text.trim_end().ends_with(",,,QED,"));
    }

    #[test]
    fn disabled_sink_writes_nothing() {
        let prof = Profiler::disabled("x");
        assert!(!prof.enabled());
        prof.prof("advance", "unit.1", "NEW", "");
        prof.flush();
        prof.close();
    }
}
