use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::resolve::{
    self, ResolvedPlayerValue, ResolvedTeamValue, ResolverConfig, ResolutionReport,
};
use crate::store;

/// Teams that only appear via a resolved player get this valuation.
pub const DEFAULT_TEAM_VALUE: i64 = 100;
/// Nominal roster size used to turn a team valuation into a per-player average.
pub const ASSUMED_ROSTER_SIZE: i64 = 10;
/// A season only anchors the appearance weighting when somebody played more
/// than this many matches in it.
pub const MIN_SAMPLE_APPEARANCES: i64 = 10;

#[derive(Debug, Default, PartialEq)]
pub struct ValueInputs {
    pub league_ids: BTreeSet<i64>,
    pub team_values: BTreeMap<i64, i64>,
    pub player_values: BTreeMap<i64, i64>,
}

#[derive(Debug, Default)]
pub struct PropagationSummary {
    pub baseline_assignments: usize,
    pub weighted_assignments: usize,
    pub override_assignments: usize,
    pub teams_skipped: Vec<i64>,
}

/// Flatten resolution output into the three propagation inputs. Map merges are
/// last-writer-wins on the natural id; a player's team that carries no team
/// valuation of its own gets the default.
pub fn collect_inputs(
    teams: &[ResolvedTeamValue],
    players: &[ResolvedPlayerValue],
) -> ValueInputs {
    let mut inputs = ValueInputs::default();
    for team in teams {
        inputs.league_ids.insert(team.league_id);
        inputs.team_values.insert(team.team_id, team.value);
    }
    for player in players {
        inputs
            .team_values
            .entry(player.team_id)
            .or_insert(DEFAULT_TEAM_VALUE);
    }
    for player in players {
        inputs.player_values.insert(player.player_id, player.value);
    }
    inputs
}

/// Three layered passes over player values; every write goes through
/// `MAX(value, candidate)` so a pass can only ever raise a value.
pub fn apply_values(conn: &mut Connection, inputs: &ValueInputs) -> Result<PropagationSummary> {
    let mut summary = PropagationSummary::default();
    let tx = conn.transaction().context("begin value transaction")?;

    // Pass 1: everyone on a roster in the league's most recent year starts at 1.
    for league_id in &inputs.league_ids {
        let years = store::league_militancy_years(&tx, *league_id)?;
        let Some(max_year) = years.first().copied() else {
            continue;
        };
        for team_id in store::teams_for_league_year(&tx, *league_id, max_year)? {
            for player_id in store::players_for_team_year(&tx, team_id, max_year)? {
                store::raise_player_value(&tx, player_id, 1.0)?;
                summary.baseline_assignments += 1;
            }
        }
    }

    // Pass 2: spread a team valuation across its roster, weighted by
    // appearances with diminishing returns. The log base is anchored so the
    // season's top appearance count maps to the per-player average.
    for (team_id, team_value) in &inputs.team_values {
        let player_average = team_value / ASSUMED_ROSTER_SIZE;
        if player_average < 1 {
            summary.teams_skipped.push(*team_id);
            continue;
        }

        let militancies = store::militancies_for_team(&tx, *team_id)?;
        let Some(sample) = pick_sample_year(&militancies) else {
            summary.teams_skipped.push(*team_id);
            continue;
        };

        let log_base = (sample.max_appearances as f64).powf(1.0 / player_average as f64);
        if log_base <= 1.0 {
            summary.teams_skipped.push(*team_id);
            continue;
        }
        for mi in militancies.iter().filter(|mi| mi.year == sample.year) {
            let candidate = appearance_weight(mi.appearances, log_base);
            store::raise_player_value(&tx, mi.player_id, candidate)?;
            summary.weighted_assignments += 1;
        }
    }

    // Pass 3: direct per-player valuations from the scrape.
    for (player_id, value) in &inputs.player_values {
        store::raise_player_value(&tx, *player_id, *value as f64)?;
        summary.override_assignments += 1;
    }

    tx.commit().context("commit value transaction")?;
    Ok(summary)
}

struct SampleYear {
    year: i32,
    max_appearances: i64,
}

/// Walk a team's militancy years from most recent backward until one has a
/// long-enough appearance sample; a team with no such year is skipped.
fn pick_sample_year(militancies: &[store::Militancy]) -> Option<SampleYear> {
    let mut years: Vec<i32> = militancies.iter().map(|mi| mi.year).collect();
    years.sort_unstable();
    years.dedup();
    for year in years.into_iter().rev() {
        let max_appearances = militancies
            .iter()
            .filter(|mi| mi.year == year)
            .map(|mi| mi.appearances)
            .max()
            .unwrap_or(0);
        if max_appearances > MIN_SAMPLE_APPEARANCES {
            return Some(SampleYear {
                year,
                max_appearances,
            });
        }
    }
    None
}

pub fn appearance_weight(appearances: i64, log_base: f64) -> f64 {
    ((appearances as f64) + 1.0).ln() / log_base.ln()
}

#[derive(Debug)]
pub struct MarketValuesSummary {
    pub resolution: ResolutionReport,
    pub propagation: PropagationSummary,
}

/// The market-values phase end to end: load the scrape dumps, resolve them to
/// canonical ids, derive the propagation inputs, and apply the three passes.
pub fn run_market_values(
    db_path: &Path,
    teams_path: &Path,
    players_path: &Path,
    cut_players: Option<usize>,
    dump_dir: &Path,
) -> Result<MarketValuesSummary> {
    let teams = resolve::load_scraped_teams(teams_path)?;
    let mut players = resolve::load_scraped_players(players_path)?;
    if let Some(cut) = cut_players {
        players.truncate(cut);
    }

    let cfg = ResolverConfig::from_env();
    let resolution = resolve::resolve_all(db_path, &cfg, teams, players, dump_dir)?;

    let inputs = collect_inputs(&resolution.teams, &resolution.players);
    let mut conn = store::open_db(db_path)?;
    let propagation = apply_values(&mut conn, &inputs)?;

    Ok(MarketValuesSummary {
        resolution,
        propagation,
    })
}
