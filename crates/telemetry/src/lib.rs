// Copyright The PilotFlow Authors
// SPDX-License-Identifier: Apache-2.0

//! Profile telemetry.
//!
//! The [`profiler::Profiler`] is really just a persistent file handle with
//! a convenient way of writing timestamped event records; any profiling
//! intelligence is applied when reading and evaluating the created
//! profiles, see [`reader`].
//!
//! One `.prof` file per component lives under `profiles/<sid>/`. The first
//! data record of every profile carries the clock-sync tuple established in
//! [`clock`], which the reader uses to correct per-host time offsets.

pub mod clock;
pub mod error;
pub mod profiler;
pub mod reader;

pub use clock::{ClockSync, TsMode};
pub use profiler::{ProfileSink, Profiler};
pub use reader::{clean_profile, combine_profiles, read_profiles, ProfRecord};

/// Profiling is enabled when this variable is set and non-empty.
pub const PROFILE_ENV: &str = "RADICAL_PILOT_PROFILE";

/// NTP server queried to establish absolute time at startup.
pub const NTPHOST_ENV: &str = "RADICAL_PILOT_NTPHOST";

/// The header line of every profile file.
pub const PROF_HEADER: &str = "#time,name,uid,state,event,msg";

/// Seconds since the Unix epoch, as a float with microsecond resolution.
#[must_use]
pub fn timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
