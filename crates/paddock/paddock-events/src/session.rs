use paddock_topics::Topic;
use serde::{Deserialize, Serialize};

/// Static track data, republished when the session changes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub name: String,
    pub length_m: f32,
    #[serde(default)]
    pub country: Option<String>,
}

impl Topic for TrackInfo {
    const NAME: &'static str = "track_info";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// "Practice", "Qualifying", "Race", ...
    pub session_type: String,
    pub time_remaining_s: f64,
    pub laps_remaining: Option<u32>,
}

impl Topic for SessionInfo {
    const NAME: &'static str = "session";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StandingsEntry {
    pub position: u16,
    pub driver: String,
    pub car_number: String,
    /// Seconds behind the leader; `None` for the leader or lapped cars.
    pub gap_s: Option<f64>,
    pub best_lap_s: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Standings {
    pub entries: Vec<StandingsEntry>,
}

impl Topic for Standings {
    const NAME: &'static str = "standings";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_distinct() {
        let names = [TrackInfo::NAME, SessionInfo::NAME, Standings::NAME];
        for (i, a) in names.iter().enumerate() {
            assert!(names[i + 1..].iter().all(|b| a != b));
        }
    }

    #[test]
    fn driver_names_survive_json() {
        let standings = Standings {
            entries: vec![StandingsEntry {
                position: 1,
                driver: "Kimi Räikkönen".into(),
                car_number: "7".into(),
                gap_s: None,
                best_lap_s: Some(104.2),
            }],
        };
        let raw = serde_json::to_string(&standings).unwrap();
        assert_eq!(serde_json::from_str::<Standings>(&raw).unwrap(), standings);
    }
}
