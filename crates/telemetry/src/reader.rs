// SPDX-License-Identifier: Apache-2.0

//! Reading and evaluating profiles.
//!
//! Profiles are combined across components and hosts: each file's leading
//! `sync abs` record names the host and its clock offset, all timestamps
//! are corrected by the per-host offset and normalized to the earliest
//! sync point, and the cleaning pass collapses duplicate state records.

use crate::error::Error;
use std::collections::HashMap;
use std::path::Path;

/// One parsed profile record.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfRecord {
    /// Corrected timestamp, seconds.
    pub time: f64,
    /// Component name.
    pub name: String,
    /// Thread id within the component.
    pub tid: String,
    /// Entity uid, empty for session-level records.
    pub uid: String,
    /// State label for state transitions, empty otherwise.
    pub state: String,
    /// Event label, e.g. `advance`, `sync abs`, `QED`.
    pub event: String,
    /// Free-form message; the sync tuple on `sync abs` records.
    pub msg: String,
}

impl ProfRecord {
    fn parse(line: &str) -> Option<Self> {
        let mut fields = line.splitn(6, ',');
        let time = fields.next()?.parse::<f64>().ok()?;
        let name_tid = fields.next()?;
        let (name, tid) = name_tid.split_once(':').unwrap_or((name_tid, ""));
        Some(Self {
            time,
            name: name.to_owned(),
            tid: tid.to_owned(),
            uid: fields.next()?.to_owned(),
            state: fields.next()?.to_owned(),
            event: fields.next()?.to_owned(),
            msg: fields.next().unwrap_or("").to_owned(),
        })
    }
}

/// Reads the given profile files, keyed by path.
///
/// Header lines (starting with `#`) are skipped; malformed records are an
/// error, not silently dropped.
pub fn read_profiles<P: AsRef<Path>>(paths: &[P]) -> Result<HashMap<String, Vec<ProfRecord>>, Error> {
    let mut profiles = HashMap::new();
    for path in paths {
        let path = path.as_ref();
        let key = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Io {
            path: key.clone(),
            details: e.to_string(),
        })?;

        let mut records = Vec::new();
        for line in text.lines() {
            if line.starts_with('#') || line.is_empty() {
                continue;
            }
            let record = ProfRecord::parse(line).ok_or_else(|| Error::MalformedRecord {
                path: key.clone(),
                line: line.to_owned(),
            })?;
            records.push(record);
        }
        let _ = profiles.insert(key, records);
    }
    Ok(profiles)
}

/// Merges all profiles into one time-sorted record list.
///
/// Every profile must lead with a `sync abs` record carrying
/// `host:ip:t_sys:t_ntp:mode`. For hosts synced in `ntp` mode, all of that
/// host's timestamps are corrected by `t_sys - t_ntp`; `sys` mode hosts get
/// no correction. All timestamps are then normalized to the earliest sync
/// point. Unsynced profiles are skipped with a warning.
#[must_use]
pub fn combine_profiles(profiles: &HashMap<String, Vec<ProfRecord>>) -> Vec<ProfRecord> {
    let mut host_offset: HashMap<String, f64> = HashMap::new();
    let mut t_min: Option<f64> = None;

    for (pname, records) in profiles {
        let Some(sync) = records.first().filter(|r| r.event == "sync abs") else {
            tracing::warn!(profile = %pname, "unsynced profile skipped");
            continue;
        };
        t_min = Some(t_min.map_or(sync.time, |t| t.min(sync.time)));

        let parts: Vec<&str> = sync.msg.split(':').collect();
        if parts.len() != 5 {
            tracing::warn!(profile = %pname, "malformed sync record");
            continue;
        }
        let host_id = format!("{}:{}", parts[0], parts[1]);
        if parts[4] != "ntp" {
            continue;
        }
        let (Ok(t_sys), Ok(t_ntp)) = (parts[2].parse::<f64>(), parts[3].parse::<f64>()) else {
            continue;
        };
        let _ = host_offset.entry(host_id).or_insert(t_sys - t_ntp);
    }

    let t_min = t_min.unwrap_or(0.0);
    let mut combined = Vec::new();
    for records in profiles.values() {
        let Some(sync) = records.first().filter(|r| r.event == "sync abs") else {
            continue;
        };
        let host_id = {
            let mut parts = sync.msg.split(':');
            let host = parts.next().unwrap_or("");
            let ip = parts.next().unwrap_or("");
            format!("{host}:{ip}")
        };
        let offset = host_offset.get(&host_id).copied().unwrap_or(0.0);

        for record in records {
            let mut record = record.clone();
            record.time -= t_min + offset;
            combined.push(record);
        }
    }

    combined.sort_by(|a, b| a.time.total_cmp(&b.time));
    combined
}

/// Prepares a combined profile for analysis:
///
/// - uid-less records are assigned the session uid;
/// - duplicate recordings of the same state transition are dropped;
/// - a `CANCELED` state record is dropped once any other terminal state is
///   recorded for the same uid, regardless of arrival order.
#[must_use]
pub fn clean_profile(profile: &[ProfRecord], sid: &str) -> Vec<ProfRecord> {
    const FINALS: [&str; 3] = ["DONE", "FAILED", "CANCELED"];

    struct Entity {
        states: Vec<ProfRecord>,
        events: Vec<ProfRecord>,
    }

    let mut entities: HashMap<String, Entity> = HashMap::new();

    for record in profile {
        let mut record = record.clone();
        if record.uid.is_empty() || record.uid == "root" {
            record.uid = sid.to_owned();
        }
        let entity = entities
            .entry(record.uid.clone())
            .or_insert_with(|| Entity {
                states: Vec::new(),
                events: Vec::new(),
            });

        if record.event == "advance" && !record.state.is_empty() {
            let is_final = FINALS.contains(&record.state.as_str());
            if is_final && record.state != "CANCELED" {
                // any other terminal supersedes a recorded CANCELED
                entity.states.retain(|s| s.state != "CANCELED");
            }
            if record.state == "CANCELED"
                && entity
                    .states
                    .iter()
                    .any(|s| FINALS.contains(&s.state.as_str()))
            {
                continue;
            }
            if entity.states.iter().any(|s| s.state == record.state) {
                // duplicate recording of a state transition
                continue;
            }
            entity.states.push(record);
        } else {
            entity.events.push(record);
        }
    }

    let mut cleaned = Vec::new();
    for entity in entities.into_values() {
        cleaned.extend(entity.events);
        cleaned.extend(entity.states);
    }
    cleaned.sort_by(|a, b| a.time.total_cmp(&b.time));
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn advance(time: f64, uid: &str, state: &str) -> ProfRecord {
        ProfRecord {
            time,
            name: "c".to_owned(),
            tid: "main".to_owned(),
            uid: uid.to_owned(),
            state: state.to_owned(),
            event: "advance".to_owned(),
            msg: String::new(),
        }
    }

    #[test]
    fn parse_tolerates_commas_in_msg() {
        let record =
            ProfRecord::parse("12.5000,exec.0000:main,unit.1,EXECUTING,advance,a,b,c").unwrap();
        assert_eq!(record.msg, "a,b,c");
        assert_eq!(record.state, "EXECUTING");
    }

    #[test]
    fn duplicate_states_collapse() {
        let profile = vec![
            advance(1.0, "unit.1", "EXECUTING"),
            advance(2.0, "unit.1", "EXECUTING"),
        ];
        let cleaned = clean_profile(&profile, "session.0");
        assert_eq!(cleaned.len(), 1);
        assert!((cleaned[0].time - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn terminal_supersedes_canceled_in_both_orders() {
        let cleaned = clean_profile(
            &[advance(1.0, "unit.1", "CANCELED"), advance(2.0, "unit.1", "FAILED")],
            "s",
        );
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].state, "FAILED");

        let cleaned = clean_profile(
            &[advance(1.0, "unit.1", "FAILED"), advance(2.0, "unit.1", "CANCELED")],
            "s",
        );
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].state, "FAILED");
    }

    #[test]
    fn cleaning_is_idempotent() {
        let profile = vec![
            advance(1.0, "unit.1", "EXECUTING"),
            advance(1.5, "unit.1", "CANCELED"),
            advance(2.0, "unit.1", "DONE"),
            ProfRecord {
                time: 0.5,
                name: "c".to_owned(),
                tid: "main".to_owned(),
                uid: String::new(),
                state: String::new(),
                event: "launch".to_owned(),
                msg: String::new(),
            },
        ];
        let once = clean_profile(&profile, "session.0");
        let twice = clean_profile(&once, "session.0");
        assert_eq!(once, twice);
        assert!(once.iter().all(|r| r.state != "CANCELED"));
        assert!(once.iter().any(|r| r.uid == "session.0"));
    }

    #[test]
    fn combine_applies_ntp_offsets() {
        let sync = |time: f64, host: &str, t_sys: f64, t_ntp: f64, mode: &str| ProfRecord {
            time,
            name: "c".to_owned(),
            tid: String::new(),
            uid: String::new(),
            state: String::new(),
            event: "sync abs".to_owned(),
            msg: format!("{host}:10.0.0.1:{t_sys}:{t_ntp}:{mode}"),
        };

        let mut profiles = HashMap::new();
        let _ = profiles.insert(
            "a.prof".to_owned(),
            vec![sync(100.0, "a", 100.0, 90.0, "ntp"), advance(101.0, "u", "NEW")],
        );
        let _ = profiles.insert(
            "b.prof".to_owned(),
            vec![sync(90.0, "b", 90.0, 90.0, "sys"), advance(95.0, "v", "NEW")],
        );

        let combined = combine_profiles(&profiles);
        assert_eq!(combined.len(), 4);
        // t_min is 90; host `a` carries a +10 offset which is subtracted
        let a_advance = combined
            .iter()
            .find(|r| r.uid == "u")
            .map(|r| r.time)
            .unwrap();
        assert!((a_advance - 1.0).abs() < 1e-9);
        let b_advance = combined
            .iter()
            .find(|r| r.uid == "v")
            .map(|r| r.time)
            .unwrap();
        assert!((b_advance - 5.0).abs() < 1e-9);
    }

    #[test]
    fn read_and_combine_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let prof = crate::Profiler::create("comp.0000", dir.path()).unwrap();
        prof.prof("advance", "unit.000000", "NEW", "");
        prof.close();

        let path = dir.path().join("comp.0000.prof");
        let profiles = read_profiles(&[&path]).unwrap();
        let records = &profiles[&path.display().to_string()];
        assert_eq!(records[0].event, "sync abs");
        assert!(records.iter().any(|r| r.event == "QED"));

        let combined = combine_profiles(&profiles);
        let cleaned = clean_profile(&combined, "session.0");
        let recleaned = clean_profile(&cleaned, "session.0");
        assert_eq!(cleaned, recleaned);
    }
}
