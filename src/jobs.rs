use crate::api::{self, FplApi, HttpApi, RetryPolicy};
use crate::flatten::{self, Cell, Table};
use crate::model::{Fixture, ManagerTeam};
use crate::notify::{self, Notifier};
use crate::warehouse::Warehouse;
use crate::{Config, DB_URI_VAR, PipelineError};
use anyhow::{Result, anyhow};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::str::FromStr;

pub static FIXTURES_TABLE: &str = "webinar_fixtures";
pub static PLAYERS_TABLE: &str = "webinar_players";
pub static STANDINGS_TABLE: &str = "webinar_Standings";
pub static MANAGER_TEAM_TABLE: &str = "webinar_Managers_Team";
pub static MANAGER_TRANSFERS_TABLE: &str = "Webinar_Managers_Transfers";

const KEY_COLUMN: &str = "key";
const GAMEWEEK_COLUMN: &str = "gameweek";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Fixtures,
    Players,
    Standings,
    ManagerTeam,
    ManagerTransfers,
}

impl Job {
    pub const ALL: [Job; 5] = [
        Job::Fixtures,
        Job::Players,
        Job::Standings,
        Job::ManagerTeam,
        Job::ManagerTransfers,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::Fixtures => "fixtures",
            Job::Players => "players",
            Job::Standings => "standings",
            Job::ManagerTeam => "manager-team",
            Job::ManagerTransfers => "manager-transfers",
        }
    }

    /// Name used in operator notifications.
    fn pipeline(self) -> &'static str {
        match self {
            Job::Fixtures => "Fixture",
            Job::Players => "Players",
            Job::Standings => "Standings",
            Job::ManagerTeam => "Managers Team",
            Job::ManagerTransfers => "Managers Transfers",
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Job {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase().replace('_', "-");
        Job::ALL
            .into_iter()
            .find(|job| job.name() == s)
            .ok_or_else(|| anyhow!("Unknown job: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Loaded,
    LastGamePlayed(bool),
    Failed,
}

impl Outcome {
    pub fn to_json(self) -> Value {
        match self {
            Outcome::Loaded => json!(true),
            Outcome::LastGamePlayed(played) => json!({ "IsLastGamePlayed": played }),
            Outcome::Failed => json!(false),
        }
    }
}

fn to_records<T>(items: &[T]) -> Result<Vec<Value>>
where
    T: Serialize,
{
    Ok(items
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?)
}

/// Whether the last fixture of `week`, in API order, has finished.
pub fn last_game_played(fixtures: &[Fixture], week: i64) -> Result<bool> {
    fixtures
        .iter()
        .rev()
        .find(|fixture| fixture.event == Some(week))
        .map(|fixture| fixture.finished)
        .ok_or_else(|| {
            PipelineError::DataUnavailable(format!("no fixtures for gameweek {}", week)).into()
        })
}

pub struct Pipeline<'a, A, N> {
    pub api: &'a A,
    pub warehouse: &'a Warehouse,
    pub notifier: &'a N,
    pub picks_retry: RetryPolicy,
}

impl<A, N> Pipeline<'_, A, N>
where
    A: FplApi,
    N: Notifier,
{
    /// Runs `job`, reporting any failure to the operator instead of returning it.
    pub async fn run(&self, job: Job) -> Outcome {
        info!("Running {} job", job);
        let result = match job {
            Job::Fixtures => self.fixtures().await,
            Job::Players => self.players().await,
            Job::Standings => self.standings().await,
            Job::ManagerTeam => self.manager_team().await,
            Job::ManagerTransfers => self.manager_transfers().await,
        };

        match result {
            Ok(outcome) => {
                info!("Finished {} job: {:?}", job, outcome);
                outcome
            }
            Err(e) => report_failure(self.notifier, job, &e).await,
        }
    }

    /// The last week whose games are all played; the standings job has already moved the
    /// counter past it.
    async fn completed_week(&self) -> Result<i64> {
        let week = self.warehouse.gameweek().current().await? - 1;
        if week < 1 {
            let e = PipelineError::DataUnavailable("no completed gameweek".to_string());
            return Err(e.into());
        }
        Ok(week)
    }

    pub async fn fixtures(&self) -> Result<Outcome> {
        let fixtures = self.api.fixtures().await?;
        info!("Fetched {} fixtures", fixtures.len());

        let table = flatten::normalize(&to_records(&fixtures)?);
        self.warehouse.replace_all(FIXTURES_TABLE, &table).await?;

        Ok(Outcome::Loaded)
    }

    pub async fn players(&self) -> Result<Outcome> {
        let week = self.completed_week().await?;
        let bootstrap = self.api.bootstrap().await?;
        info!("Fetched {} players for gameweek {}", bootstrap.elements.len(), week);

        let table = flatten::normalize(&to_records(&bootstrap.elements)?)
            .with_constant(GAMEWEEK_COLUMN, Cell::Int(week));
        self.warehouse
            .upsert_by_key(PLAYERS_TABLE, GAMEWEEK_COLUMN, &table)
            .await?;

        Ok(Outcome::Loaded)
    }

    pub async fn standings(&self) -> Result<Outcome> {
        let gameweek = self.warehouse.gameweek();
        let week = gameweek.current().await?;

        let fixtures = self.api.fixtures().await?;
        if !last_game_played(&fixtures, week)? {
            info!("Last game of gameweek {} has not been played", week);
            return Ok(Outcome::LastGamePlayed(false));
        }

        let fpl = self.api;
        let standings = api::paginate(|page| fpl.standings_page(page)).await?;
        if standings.is_empty() {
            let e = PipelineError::DataUnavailable("league has no standings".to_string());
            return Err(e.into());
        }
        info!("Fetched {} standings for gameweek {}", standings.len(), week);

        let table = flatten::normalize(&to_records(&standings)?)
            .with_constant(GAMEWEEK_COLUMN, Cell::Int(week))
            .with_key(KEY_COLUMN, &["entry", GAMEWEEK_COLUMN])?;
        self.warehouse
            .upsert_by_key(STANDINGS_TABLE, KEY_COLUMN, &table)
            .await?;

        gameweek.advance().await?;

        Ok(Outcome::LastGamePlayed(true))
    }

    pub async fn manager_team(&self) -> Result<Outcome> {
        let week = self.completed_week().await?;
        let managers = self.warehouse.distinct_ids(STANDINGS_TABLE, "entry").await?;
        info!("Fetching gameweek {} picks for {} managers", week, managers.len());

        let fpl = self.api;
        let mut teams = Vec::with_capacity(managers.len());
        for manager_id in managers {
            match self
                .picks_retry
                .run(|| fpl.manager_picks(manager_id, week))
                .await
            {
                Ok(picks) => teams.push(ManagerTeam { manager_id, picks }),
                Err(e) => {
                    warn!("Giving up on manager {}: {}", manager_id, e);
                    self.notifier
                        .notify(
                            &notify::subject(Job::ManagerTeam.pipeline()),
                            &format!("Request failed for ID {} with error: {}", manager_id, e),
                        )
                        .await;
                }
            }
        }
        if teams.is_empty() {
            return Err(PipelineError::DataUnavailable(format!(
                "no manager picks for gameweek {}",
                week
            ))
            .into());
        }

        let table = flatten::normalize_nested(
            &to_records(&teams)?,
            "picks",
            &[
                &["active_chip"],
                &["entry_history", "event"],
                &["entry_history", "points_on_bench"],
                &["manager_id"],
            ],
        )
        .with_key(KEY_COLUMN, &["manager_id", "entry_history.event"])?;
        self.warehouse
            .upsert_by_key(MANAGER_TEAM_TABLE, KEY_COLUMN, &table)
            .await?;

        Ok(Outcome::Loaded)
    }

    pub async fn manager_transfers(&self) -> Result<Outcome> {
        let managers = self.warehouse.distinct_ids(STANDINGS_TABLE, "entry").await?;
        info!("Fetching transfers for {} managers", managers.len());

        let mut table = Table::default();
        for manager_id in managers {
            match self.api.transfers(manager_id).await {
                Ok(transfers) => table.append(flatten::normalize(&to_records(&transfers)?)),
                Err(e) => warn!("Skipping transfers for manager {}: {}", manager_id, e),
            }
        }
        if table.is_empty() {
            let e = PipelineError::DataUnavailable("no manager transfers".to_string());
            return Err(e.into());
        }

        self.warehouse
            .replace_all(MANAGER_TRANSFERS_TABLE, &table)
            .await?;

        Ok(Outcome::Loaded)
    }
}

async fn report_failure<N>(notifier: &N, job: Job, e: &anyhow::Error) -> Outcome
where
    N: Notifier,
{
    error!("{} job failed: {:#}", job, e);
    notifier
        .notify(
            &notify::subject(job.pipeline()),
            &format!("Error Message: {:#}", e),
        )
        .await;

    Outcome::Failed
}

/// Connects to the API and warehouse named by `config` and runs `job` against them.
pub async fn run<N>(job: Job, config: &Config, notifier: &N) -> Outcome
where
    N: Notifier,
{
    let Some(db_uri) = config.db_uri.as_deref() else {
        let e = anyhow::Error::new(PipelineError::ConfigMissing(DB_URI_VAR));
        return report_failure(notifier, job, &e).await;
    };

    let connected = async {
        let api = HttpApi::new(config.api_url.clone(), config.league_id)?;
        let warehouse = Warehouse::connect(db_uri).await?;
        warehouse.gameweek().ensure().await?;
        Ok::<_, anyhow::Error>((api, warehouse))
    };
    let (api, warehouse) = match connected.await {
        Ok(connected) => connected,
        Err(e) => return report_failure(notifier, job, &e).await,
    };

    let pipeline = Pipeline {
        api: &api,
        warehouse: &warehouse,
        notifier,
        picks_retry: RetryPolicy::manager_picks(),
    };
    pipeline.run(job).await
}

/// Like [`run`], but for settings that may have failed to load. A bad setting is reported to
/// the operator as the job's failure.
pub async fn run_loaded<N>(job: Job, config: Result<Config>, notifier: &N) -> Outcome
where
    N: Notifier,
{
    match config {
        Ok(config) => run(job, &config, notifier).await,
        Err(e) => report_failure(notifier, job, &e).await,
    }
}
