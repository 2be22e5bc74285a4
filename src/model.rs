//! Typed shapes of the API payloads the jobs consume.
//!
//! Only the fields a job relies on are named. Everything else the API sends is
//! kept in `rest` so it still lands in the warehouse as a column.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Fields = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    pub id: i64,
    /// Gameweek the fixture belongs to; unscheduled fixtures have none.
    pub event: Option<i64>,
    pub finished: bool,

    #[serde(flatten)]
    pub rest: Fields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bootstrap {
    pub elements: Vec<Player>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    pub id: i64,

    #[serde(flatten)]
    pub rest: Fields,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StandingsPage {
    pub standings: Standings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Standings {
    pub has_next: bool,
    pub results: Vec<Standing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Standing {
    pub entry: i64,

    #[serde(flatten)]
    pub rest: Fields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerPicks {
    pub active_chip: Option<String>,
    pub entry_history: EntryHistory,
    pub picks: Vec<Pick>,

    #[serde(flatten)]
    pub rest: Fields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHistory {
    pub event: i64,
    pub points_on_bench: i64,

    #[serde(flatten)]
    pub rest: Fields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pick {
    pub element: i64,
    pub position: i64,
    pub multiplier: i64,
    pub is_captain: bool,
    pub is_vice_captain: bool,

    #[serde(flatten)]
    pub rest: Fields,
}

/// A manager's picks tagged with the manager they were fetched for.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerTeam {
    pub manager_id: i64,

    #[serde(flatten)]
    pub picks: ManagerPicks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub entry: i64,
    pub event: i64,
    pub element_in: i64,
    pub element_out: i64,

    #[serde(flatten)]
    pub rest: Fields,
}

#[cfg(test)]
mod test {

    use super::*;
    use anyhow::Result;
    use serde_json::json;

    const EXAMPLE_PICKS: &str = r#"
    {
        "active_chip": null,
        "automatic_subs": [],
        "entry_history": {
            "event": 7,
            "points": 61,
            "points_on_bench": 4
        },
        "picks": [
            {
                "element": 308,
                "position": 1,
                "multiplier": 1,
                "is_captain": false,
                "is_vice_captain": false,
                "element_type": 1
            },
            {
                "element": 355,
                "position": 2,
                "multiplier": 2,
                "is_captain": true,
                "is_vice_captain": false,
                "element_type": 3
            }
        ]
    }
    "#;

    #[test]
    fn test_picks_keep_unnamed_fields() -> Result<()> {
        let picks: ManagerPicks = serde_json::from_str(EXAMPLE_PICKS)?;

        assert_eq!(7, picks.entry_history.event);
        assert_eq!(2, picks.picks.len());
        assert_eq!(Some(&json!(61)), picks.entry_history.rest.get("points"));
        assert_eq!(Some(&json!(3)), picks.picks[1].rest.get("element_type"));
        assert_eq!(Some(&json!([])), picks.rest.get("automatic_subs"));

        Ok(())
    }

    #[test]
    fn test_manager_team_serializes_flat() -> Result<()> {
        let picks: ManagerPicks = serde_json::from_str(EXAMPLE_PICKS)?;
        let team = serde_json::to_value(ManagerTeam {
            manager_id: 42,
            picks,
        })?;

        assert_eq!(json!(42), team["manager_id"]);
        assert_eq!(json!(7), team["entry_history"]["event"]);
        assert_eq!(json!(308), team["picks"][0]["element"]);

        Ok(())
    }

    #[test]
    fn test_fixture_requires_finished() {
        let missing = serde_json::from_value::<Fixture>(json!({"id": 1, "event": 3}));

        assert!(missing.is_err());
    }

    #[test]
    fn test_unscheduled_fixture() -> Result<()> {
        let fixture: Fixture =
            serde_json::from_value(json!({"id": 1, "event": null, "finished": false}))?;

        assert_eq!(None, fixture.event);

        Ok(())
    }
}
