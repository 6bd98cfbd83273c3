// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line tokenization and event classification.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

use super::flavor::suicide_flavor;
use super::{
    dedup_key, ConnectionAction, EventKind, NormalizedEvent, RawLine, SuicideCause, WorldEventKind,
};

/// Timestamp variants accepted from source files, tried in order.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y.%m.%d-%H.%M.%S",
    "%Y.%m.%d-%H.%M.%S:%3f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.3f",
];

/// Weapon/cause strings that mark a death as environmental rather than a
/// player kill, matched case-insensitively.
const ENVIRONMENTAL_CAUSES: &[&str] = &[
    "falling",
    "bleeding",
    "bleed_out",
    "starvation",
    "dehydration",
    "drowning",
    "radiation",
    "zone",
];

/// A line that should have produced an event but could not be parsed.
///
/// One malformed line never aborts a batch: the poller counts it and
/// continues with the next line.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("killfeed record has {found} fields, expected at least {expected}")]
    MissingFields { found: usize, expected: usize },
    #[error("unparsable timestamp {value:?}")]
    BadTimestamp { value: String },
    #[error("unrecognized line shape")]
    Unrecognized,
}

/// Compiled patterns for the server-log line shape.
#[derive(Debug)]
pub struct Normalizer {
    connection: Regex,
    mission: Regex,
    world_event: Regex,
    log_line: Regex,
}

impl Default for Normalizer {
    fn default() -> Self {
        Normalizer::new()
    }
}

impl Normalizer {
    /// Compiles the canonical line patterns.
    ///
    /// The patterns are fixed at build time, so compilation cannot fail at
    /// runtime; the `expect`s here only guard against a broken literal.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn new() -> Self {
        Normalizer {
            connection: Regex::new(
                r"^Log(?:Online|Net): Player (?P<name>.+?) \((?P<id>[A-Za-z0-9]+)\) (?P<action>connected|disconnected)$",
            )
            .expect("connection pattern is valid"),
            mission: Regex::new(
                r"^LogMission: Mission '(?P<name>[^']+)' switched to (?P<state>[A-Z]+)(?: \(difficulty: (?P<diff>\w+)\))?$",
            )
            .expect("mission pattern is valid"),
            world_event: Regex::new(
                r"^LogWorld: (?P<kind>AirDrop|HeliCrash|Trader|Convoy) event spawned at (?P<loc>.+)$",
            )
            .expect("world event pattern is valid"),
            log_line: Regex::new(r"^\[(?P<ts>[^\]]+)\] (?P<rest>.+)$")
                .expect("log line pattern is valid"),
        }
    }

    /// Normalizes one raw line.
    ///
    /// Returns `Ok(None)` for comments, blank lines, and log records the
    /// engine does not track; `Err` for lines that look like records but
    /// cannot be parsed.
    pub fn normalize(&self, line: &RawLine) -> Result<Option<NormalizedEvent>, ParseError> {
        let text = line.text.trim_end_matches('\r');
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with("//") {
            return Ok(None);
        }

        if let Some(caps) = self.log_line.captures(trimmed) {
            // Regex guarantees both groups are present on a match.
            #[allow(clippy::expect_used)]
            let ts = caps.name("ts").expect("ts group").as_str();
            #[allow(clippy::expect_used)]
            let rest = caps.name("rest").expect("rest group").as_str();
            return self.normalize_log_line(line, text, ts, rest);
        }

        if trimmed.contains(';') {
            return self.normalize_killfeed_record(line, text, trimmed);
        }

        Err(ParseError::Unrecognized)
    }

    fn normalize_killfeed_record(
        &self,
        line: &RawLine,
        raw: &str,
        trimmed: &str,
    ) -> Result<Option<NormalizedEvent>, ParseError> {
        let fields: Vec<&str> = trimmed.split(';').collect();
        // A trailing separator produces one empty extra field; tolerate it.
        if fields.len() < 7 {
            return Err(ParseError::MissingFields {
                found: fields.len(),
                expected: 7,
            });
        }

        let timestamp = parse_timestamp(fields[0])?;
        let killer_name = fields[1].trim();
        let killer_id = fields[2].trim();
        let victim_name = fields[3].trim();
        let victim_id = fields[4].trim();
        let weapon = fields[5].trim();
        let distance_m = parse_distance(fields[6]);

        let kind = if !killer_id.is_empty() && killer_id == victim_id {
            let cause = classify_suicide(weapon);
            EventKind::Suicide {
                player_id: victim_id.to_string(),
                player_name: victim_name.to_string(),
                cause,
                flavor: suicide_flavor(cause, raw).to_string(),
            }
        } else if killer_id.is_empty() || is_environmental(weapon) {
            EventKind::EnvironmentalDeath {
                victim_id: victim_id.to_string(),
                victim_name: victim_name.to_string(),
                cause: weapon.to_lowercase(),
            }
        } else {
            EventKind::Kill {
                killer_id: killer_id.to_string(),
                killer_name: killer_name.to_string(),
                victim_id: victim_id.to_string(),
                victim_name: victim_name.to_string(),
                weapon: weapon.to_string(),
                distance_m,
            }
        };

        Ok(Some(finish(line, raw, timestamp, kind)))
    }

    fn normalize_log_line(
        &self,
        line: &RawLine,
        raw: &str,
        ts: &str,
        rest: &str,
    ) -> Result<Option<NormalizedEvent>, ParseError> {
        if let Some(caps) = self.connection.captures(rest) {
            let timestamp = parse_timestamp(ts)?;
            let action = match &caps["action"] {
                "connected" => ConnectionAction::Join,
                _ => ConnectionAction::Leave,
            };
            let kind = EventKind::Connection {
                player_id: caps["id"].to_string(),
                player_name: caps["name"].to_string(),
                action,
            };
            return Ok(Some(finish(line, raw, timestamp, kind)));
        }

        if let Some(caps) = self.mission.captures(rest) {
            // Only activation is an event; WAITING/READY transitions are
            // noise the statistics system ignores.
            if &caps["state"] != "ACTIVE" {
                return Ok(None);
            }
            let timestamp = parse_timestamp(ts)?;
            let kind = EventKind::WorldEvent {
                event: WorldEventKind::Mission,
                name: Some(caps["name"].to_string()),
                difficulty: caps.name("diff").map(|m| m.as_str().to_string()),
                location: None,
            };
            return Ok(Some(finish(line, raw, timestamp, kind)));
        }

        if let Some(caps) = self.world_event.captures(rest) {
            let timestamp = parse_timestamp(ts)?;
            let event = match &caps["kind"] {
                "AirDrop" => WorldEventKind::Airdrop,
                "HeliCrash" => WorldEventKind::HeliCrash,
                "Trader" => WorldEventKind::Trader,
                _ => WorldEventKind::Convoy,
            };
            let kind = EventKind::WorldEvent {
                event,
                name: None,
                difficulty: None,
                location: Some(caps["loc"].trim().to_string()),
            };
            return Ok(Some(finish(line, raw, timestamp, kind)));
        }

        // A well-formed log line from a subsystem the engine does not
        // track: noise, not an error.
        Ok(None)
    }

}

fn finish(line: &RawLine, raw: &str, timestamp: DateTime<Utc>, kind: EventKind) -> NormalizedEvent {
    NormalizedEvent {
        source: line.source.clone(),
        line_no: line.line_no,
        timestamp,
        kind,
        dedup_key: dedup_key(&line.source, line.line_no, raw),
    }
}

/// Parses any accepted timestamp variant into UTC.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ParseError> {
    let value = value.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    Err(ParseError::BadTimestamp {
        value: value.to_string(),
    })
}

/// Distances arrive as integers, floats, or empty; coerce to whole meters.
fn parse_distance(value: &str) -> u32 {
    let value = value.trim();
    if value.is_empty() {
        return 0;
    }
    value
        .parse::<f64>()
        .map(|d| if d.is_finite() && d > 0.0 { d as u32 } else { 0 })
        .unwrap_or(0)
}

fn classify_suicide(weapon: &str) -> SuicideCause {
    let weapon = weapon.to_lowercase();
    if weapon.contains("relocation") || weapon.contains("menu") {
        SuicideCause::Menu
    } else if weapon.contains("fall") {
        SuicideCause::Fall
    } else if weapon.contains("vehicle") {
        SuicideCause::Vehicle
    } else {
        SuicideCause::Other
    }
}

fn is_environmental(weapon: &str) -> bool {
    let weapon = weapon.to_lowercase();
    ENVIRONMENTAL_CAUSES.iter().any(|cause| weapon == *cause)
}
