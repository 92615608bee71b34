use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rayon::prelude::*;
use rusqlite::Connection;
use serde_json::Value;

use crate::api_client::ApiFootballClient;
use crate::dates::parse_feed_date;
use crate::pool::{env_parallelism, with_pool};
use crate::store::{self, Militancy};

const TRANSFERS_REQUEST_BUDGET: u32 = 500;

/// One entry from a team's transfer feed: the player moved from `out_team_id`
/// to `in_team_id` on `raw_date`. Dates arrive unparsed; the feed mixes formats.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub raw_date: String,
    pub out_team_id: Option<i64>,
    pub in_team_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerTransferHistory {
    pub player_id: i64,
    pub transfers: Vec<TransferEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    UnparseableDate(String),
    UnknownTeam,
    TeamWithoutLeague,
    UnknownPlayer,
    NoSeasonAnchor,
    MilitancyNotFound,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnparseableDate(raw) => write!(f, "unparseable date {raw:?}"),
            SkipReason::UnknownTeam => write!(f, "team not in store"),
            SkipReason::TeamWithoutLeague => write!(f, "team has no league affiliation"),
            SkipReason::UnknownPlayer => write!(f, "player not in store"),
            SkipReason::NoSeasonAnchor => write!(f, "no season anchors the transfer date"),
            SkipReason::MilitancyNotFound => write!(f, "no militancy brackets the transfer date"),
        }
    }
}

/// A skipped edit. Reconciliation never aborts a player over one bad event;
/// it records the skip and moves on.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileWarning {
    pub player_id: i64,
    pub team_id: Option<i64>,
    pub reason: SkipReason,
}

impl fmt::Display for ReconcileWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.team_id {
            Some(team_id) => write!(
                f,
                "player {} team {}: {}",
                self.player_id, team_id, self.reason
            ),
            None => write!(f, "player {}: {}", self.player_id, self.reason),
        }
    }
}

/// Two of one player's spells on different teams overlap in time. This is
/// unresolved concurrent-team data; it is reported, never merged away.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlapViolation {
    pub player_id: i64,
    pub team_a: i64,
    pub year_a: i32,
    pub team_b: i64,
    pub year_b: i32,
}

#[derive(Debug, Default)]
pub struct PlayerReconcileOutcome {
    pub militancies_created: usize,
    pub boundary_edits: usize,
    pub warnings: Vec<ReconcileWarning>,
    pub overlap_violations: Vec<OverlapViolation>,
}

#[derive(Debug, Default)]
pub struct FixTransfersSummary {
    pub teams_fetched: usize,
    pub players_processed: usize,
    pub militancies_created: usize,
    pub boundary_edits: usize,
    pub warnings: Vec<ReconcileWarning>,
    pub overlap_violations: Vec<OverlapViolation>,
    pub fetch_errors: Vec<String>,
}

enum CreateResult {
    Created(Militancy),
    Skip(SkipReason),
}

/// Derive militancy interval boundaries for one player from their transfer
/// events. Events are sorted by date defensively; both sides of one event are
/// resolved against the pre-edit interval set, while edits from earlier events
/// stay visible to later ones. Writes are the caller's transaction's problem.
pub fn reconcile_player(
    conn: &Connection,
    player_id: i64,
    transfers: &[TransferEvent],
) -> Result<PlayerReconcileOutcome> {
    let mut outcome = PlayerReconcileOutcome::default();

    let mut dated: Vec<(NaiveDate, &TransferEvent)> = Vec::with_capacity(transfers.len());
    for event in transfers {
        match parse_feed_date(&event.raw_date) {
            Some(date) => dated.push((date, event)),
            None => outcome.warnings.push(ReconcileWarning {
                player_id,
                team_id: None,
                reason: SkipReason::UnparseableDate(event.raw_date.clone()),
            }),
        }
    }
    dated.sort_by_key(|(date, _)| *date);

    let mut militancies = store::militancies_for_player(conn, player_id)?;
    let mut created: HashSet<usize> = HashSet::new();
    let mut edited: HashSet<usize> = HashSet::new();

    for (date, event) in dated {
        // (idx, true) closes the spell at `date`, (idx, false) opens it.
        let mut pending: Vec<(usize, bool)> = Vec::with_capacity(2);

        let sides = [(event.out_team_id, true), (event.in_team_id, false)];
        for (team_id, closing) in sides {
            let Some(team_id) = team_id else {
                continue;
            };

            if !militancies.iter().any(|mi| mi.team_id == team_id) {
                match create_militancy_if_possible(conn, player_id, team_id, date)? {
                    CreateResult::Created(mi) => {
                        created.insert(militancies.len());
                        militancies.push(mi);
                    }
                    CreateResult::Skip(reason) => {
                        outcome.warnings.push(ReconcileWarning {
                            player_id,
                            team_id: Some(team_id),
                            reason,
                        });
                        continue;
                    }
                }
            }

            let Some(idx) = militancies
                .iter()
                .position(|mi| mi.team_id == team_id && mi.brackets(date))
            else {
                outcome.warnings.push(ReconcileWarning {
                    player_id,
                    team_id: Some(team_id),
                    reason: SkipReason::MilitancyNotFound,
                });
                continue;
            };
            pending.push((idx, closing));
        }

        for (idx, closing) in pending {
            if closing {
                militancies[idx].end_date = Some(date);
            } else {
                militancies[idx].start_date = Some(date);
            }
            edited.insert(idx);
            outcome.boundary_edits += 1;
        }
    }

    for (idx, mi) in militancies.iter().enumerate() {
        if created.contains(&idx) {
            store::insert_militancy(conn, mi)?;
            outcome.militancies_created += 1;
        } else if edited.contains(&idx) {
            store::update_militancy_bounds(conn, mi)?;
        }
    }

    outcome.overlap_violations = find_overlap_violations(player_id, &militancies);
    Ok(outcome)
}

/// Seed a militancy for a team the player has no spell on yet, anchored to the
/// team's league season calendar. Prefers the season strictly containing the
/// transfer date (earliest start wins a tie); otherwise falls back to the most
/// recently concluded season before it. Returns a skip reason when no anchor
/// exists rather than inventing an interval.
fn create_militancy_if_possible(
    conn: &Connection,
    player_id: i64,
    team_id: i64,
    transfer_date: NaiveDate,
) -> Result<CreateResult> {
    if store::team(conn, team_id)?.is_none() {
        return Ok(CreateResult::Skip(SkipReason::UnknownTeam));
    }
    let league_ids = store::team_league_ids(conn, team_id)?;
    if league_ids.is_empty() {
        return Ok(CreateResult::Skip(SkipReason::TeamWithoutLeague));
    }
    if !store::player_exists(conn, player_id)? {
        return Ok(CreateResult::Skip(SkipReason::UnknownPlayer));
    }

    let seasons = store::seasons_for_leagues(conn, &league_ids)?;

    let season = seasons
        .iter()
        .filter(|s| s.start_date < transfer_date && transfer_date < s.end_date)
        .min_by_key(|s| s.start_date)
        .or_else(|| {
            seasons
                .iter()
                .filter(|s| s.end_date < transfer_date)
                .max_by_key(|s| s.end_date)
        });
    let Some(season) = season else {
        return Ok(CreateResult::Skip(SkipReason::NoSeasonAnchor));
    };

    Ok(CreateResult::Created(Militancy {
        player_id,
        team_id,
        year: season.year,
        start_date: Some(season.start_date),
        end_date: Some(season.end_date),
        appearances: 0,
    }))
}

/// Pairwise overlap scan across one player's spells on different teams.
/// Intervals are half-open `[start, end)`; spells missing a bound are ignored.
pub fn find_overlap_violations(player_id: i64, militancies: &[Militancy]) -> Vec<OverlapViolation> {
    let mut out = Vec::new();
    for (i, a) in militancies.iter().enumerate() {
        let (Some(a_start), Some(a_end)) = (a.start_date, a.end_date) else {
            continue;
        };
        for b in militancies.iter().skip(i + 1) {
            if a.team_id == b.team_id {
                continue;
            }
            let (Some(b_start), Some(b_end)) = (b.start_date, b.end_date) else {
                continue;
            };
            if a_start < b_end && b_start < a_end {
                out.push(OverlapViolation {
                    player_id,
                    team_a: a.team_id,
                    year_a: a.year,
                    team_b: b.team_id,
                    year_b: b.year,
                });
            }
        }
    }
    out
}

/// Parse one team's transfer-feed payload into per-player histories. Entries
/// without a player id or with an empty transfer list are dropped.
pub fn parse_transfers_response(entries: &[Value]) -> Vec<PlayerTransferHistory> {
    let mut out = Vec::new();
    for entry in entries {
        let Some(player_id) = entry
            .get("player")
            .and_then(|p| p.get("id"))
            .and_then(Value::as_i64)
        else {
            continue;
        };
        let Some(transfers) = entry.get("transfers").and_then(Value::as_array) else {
            continue;
        };
        let mut events = Vec::with_capacity(transfers.len());
        for transfer in transfers {
            let raw_date = transfer
                .get("date")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let teams = transfer.get("teams");
            let side = |key: &str| {
                teams
                    .and_then(|t| t.get(key))
                    .and_then(|team| team.get("id"))
                    .and_then(Value::as_i64)
            };
            events.push(TransferEvent {
                raw_date,
                out_team_id: side("out"),
                in_team_id: side("in"),
            });
        }
        if events.is_empty() {
            continue;
        }
        out.push(PlayerTransferHistory {
            player_id,
            transfers: events,
        });
    }
    out
}

/// Fold per-team feeds into one history per player. The same transfer shows up
/// in both clubs' feeds, so identical events are dropped on merge.
pub fn merge_histories(histories: Vec<PlayerTransferHistory>) -> Vec<PlayerTransferHistory> {
    let mut by_player: BTreeMap<i64, Vec<TransferEvent>> = BTreeMap::new();
    for history in histories {
        let events = by_player.entry(history.player_id).or_default();
        for event in history.transfers {
            if !events.contains(&event) {
                events.push(event);
            }
        }
    }
    by_player
        .into_iter()
        .map(|(player_id, transfers)| PlayerTransferHistory {
            player_id,
            transfers,
        })
        .collect()
}

/// Reconcile every player in `histories` inside one transaction. A storage
/// failure rolls the whole phase back; per-event data problems only warn.
pub fn reconcile_all(
    conn: &mut Connection,
    histories: &[PlayerTransferHistory],
) -> Result<FixTransfersSummary> {
    let mut summary = FixTransfersSummary::default();
    let tx = conn.transaction().context("begin reconcile transaction")?;
    for history in histories {
        let outcome = reconcile_player(&tx, history.player_id, &history.transfers)?;
        summary.players_processed += 1;
        summary.militancies_created += outcome.militancies_created;
        summary.boundary_edits += outcome.boundary_edits;
        summary.warnings.extend(outcome.warnings);
        summary.overlap_violations.extend(outcome.overlap_violations);
    }
    tx.commit().context("commit reconcile transaction")?;
    Ok(summary)
}

/// The fix-transfers phase: fetch every team's transfer feed over a worker
/// pool (each worker with its own budgeted API client), merge the feeds into
/// per-player histories, then reconcile them in one transaction.
pub fn run_fix_transfers(db_path: &Path) -> Result<FixTransfersSummary> {
    let team_ids = {
        let conn = store::open_db(db_path)?;
        store::team_ids(&conn)?
    };

    let parallelism = env_parallelism("APP_FETCH_PARALLELISM", 14);
    let results: Vec<(i64, Result<Vec<PlayerTransferHistory>>)> = with_pool(parallelism, || {
        team_ids
            .par_iter()
            .map(|team_id| {
                let histories =
                    ApiFootballClient::from_env(Some(TRANSFERS_REQUEST_BUDGET)).and_then(|client| {
                        let entries = client.get_team_transfers(*team_id)?.unwrap_or_default();
                        Ok(parse_transfers_response(&entries))
                    });
                (*team_id, histories)
            })
            .collect()
    });

    let mut histories = Vec::new();
    let mut fetch_errors = Vec::new();
    let mut teams_fetched = 0;
    for (team_id, result) in results {
        match result {
            Ok(batch) => {
                histories.extend(batch);
                teams_fetched += 1;
            }
            Err(err) => fetch_errors.push(format!("team {team_id} transfers: {err:#}")),
        }
    }
    let histories = merge_histories(histories);

    let mut conn = store::open_db(db_path)?;
    let mut summary = reconcile_all(&mut conn, &histories)?;
    summary.teams_fetched = teams_fetched;
    summary.fetch_errors = fetch_errors;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_transfer_feed_entries() {
        let entries = vec![json!({
            "player": {"id": 42},
            "transfers": [
                {"date": "2021-01-15", "teams": {"out": {"id": 1}, "in": {"id": 2}}},
                {"date": "150121", "teams": {"out": {"id": 2}, "in": null}}
            ]
        })];
        let histories = parse_transfers_response(&entries);
        assert_eq!(histories.len(), 1);
        assert_eq!(histories[0].player_id, 42);
        assert_eq!(histories[0].transfers.len(), 2);
        assert_eq!(histories[0].transfers[0].out_team_id, Some(1));
        assert_eq!(histories[0].transfers[0].in_team_id, Some(2));
        assert_eq!(histories[0].transfers[1].in_team_id, None);
    }

    #[test]
    fn drops_entries_without_player_or_transfers() {
        let entries = vec![
            json!({"player": {}, "transfers": [{"date": "2021-01-15"}]}),
            json!({"player": {"id": 7}, "transfers": []}),
        ];
        assert!(parse_transfers_response(&entries).is_empty());
    }

    #[test]
    fn merge_drops_duplicate_events_across_feeds() {
        let event = TransferEvent {
            raw_date: "2021-01-15".to_string(),
            out_team_id: Some(1),
            in_team_id: Some(2),
        };
        let merged = merge_histories(vec![
            PlayerTransferHistory {
                player_id: 5,
                transfers: vec![event.clone()],
            },
            PlayerTransferHistory {
                player_id: 5,
                transfers: vec![event.clone()],
            },
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].transfers, vec![event]);
    }
}
