// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Flavor wording for self-inflicted deaths.
//!
//! The variant is selected by hashing the raw line, not by a free-running
//! RNG: re-parsing the same line after a crash-recovery re-read must yield
//! the identical event, or consumers would see two "different" records for
//! one death.

use super::{content_hash, SuicideCause};

const MENU_FLAVOR: &[&str] = &[
    "took the scenic route back to spawn",
    "relocated the hard way",
    "rage-quit their own body",
    "decided respawning beats walking",
];

const FALL_FLAVOR: &[&str] = &[
    "discovered gravity still works",
    "misjudged the drop",
    "forgot the parachute",
];

const VEHICLE_FLAVOR: &[&str] = &[
    "lost an argument with their own vehicle",
    "parked fatally",
    "should not be driving",
];

const OTHER_FLAVOR: &[&str] = &[
    "found a creative way out",
    "needed no help from anyone",
    "eliminated the competition: themselves",
];

/// Picks the flavor line for a self-inflicted death, deterministically
/// from the raw line content.
pub(super) fn suicide_flavor(cause: SuicideCause, line: &str) -> &'static str {
    let variants = match cause {
        SuicideCause::Menu => MENU_FLAVOR,
        SuicideCause::Fall => FALL_FLAVOR,
        SuicideCause::Vehicle => VEHICLE_FLAVOR,
        SuicideCause::Other => OTHER_FLAVOR,
    };
    let index = (content_hash(line) % variants.len() as u64) as usize;
    variants[index]
}
