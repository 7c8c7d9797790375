//! Rundown files played by `onaird play`.
//!
//! A rundown is the mappings plus a list of resolved timeline snapshots, each
//! with the time (ms from playback start) it takes effect:
//!
//! ```json
//! {
//!   "mappings": {"cam": {"device": "vision", "path": ["mixEffects", "0"]}},
//!   "updates": [
//!     {"time": 0, "layers": {"cam": {"objectId": "intro", "content": {"programInput": 1},
//!                                    "instance": {"start": 0, "end": null}}}}
//!   ]
//! }
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::primitives::{DeviceId, Timestamp};
use crate::resolver::{Mappings, ResolvedTimelineState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineUpdate {
    pub time: Timestamp,
    #[serde(rename = "layers")]
    pub timeline: ResolvedTimelineState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rundown {
    #[serde(default)]
    pub mappings: Mappings,
    #[serde(default)]
    pub updates: Vec<TimelineUpdate>,
}

impl Rundown {
    /// Parse and sort updates by time. Updates sharing a time keep file order.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let mut rundown: Rundown = serde_json::from_str(json)?;
        rundown.updates.sort_by_key(|u| u.time);
        Ok(rundown)
    }

    /// Devices named by any mapping.
    pub fn devices(&self) -> BTreeSet<DeviceId> {
        self.mappings.values().map(|m| m.device.clone()).collect()
    }

    /// Time of the last update.
    pub fn duration(&self) -> Timestamp {
        self.updates.last().map_or(Timestamp::ZERO, |u| u.time)
    }
}
