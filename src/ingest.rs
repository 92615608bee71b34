use std::collections::{HashMap, HashSet};
use std::env;
use std::path::Path;

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::Connection;
use serde_json::Value;

use crate::api_client::ApiFootballClient;
use crate::dates::parse_feed_date;
use crate::pool::{env_parallelism, with_pool};
use crate::store::{self, League, Militancy, Player, Season, Team, TeamMilitancy};

const LEAGUES_REQUEST_BUDGET: u32 = 5;
const TEAM_LEAGUES_REQUEST_BUDGET: u32 = 1;

/// Season years the pipeline tracks. The feed reaches much further back, but
/// only these years get seasons, militancies and rosters.
pub fn configured_years() -> Vec<i32> {
    if let Ok(raw) = env::var("APP_SEASON_YEARS") {
        let years: Vec<i32> = raw
            .split([',', ';', ' '])
            .filter_map(|part| part.trim().parse::<i32>().ok())
            .collect();
        if !years.is_empty() {
            return years;
        }
    }
    (2016..=2023).collect()
}

/// Fold the usual Latin diacritics to plain ASCII so scraped and API
/// spellings of the same name compare equal downstream.
pub fn ascii_fold(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' | 'ā' => out.push('a'),
            'Á' | 'À' | 'Â' | 'Ä' | 'Ã' | 'Å' | 'Ā' => out.push('A'),
            'é' | 'è' | 'ê' | 'ë' | 'ē' | 'ė' => out.push('e'),
            'É' | 'È' | 'Ê' | 'Ë' | 'Ē' => out.push('E'),
            'í' | 'ì' | 'î' | 'ï' | 'ī' => out.push('i'),
            'Í' | 'Ì' | 'Î' | 'Ï' => out.push('I'),
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' | 'ø' | 'ō' => out.push('o'),
            'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' | 'Ø' => out.push('O'),
            'ú' | 'ù' | 'û' | 'ü' | 'ū' => out.push('u'),
            'Ú' | 'Ù' | 'Û' | 'Ü' => out.push('U'),
            'ç' | 'ć' | 'č' => out.push('c'),
            'Ç' | 'Ć' | 'Č' => out.push('C'),
            'ñ' | 'ń' => out.push('n'),
            'Ñ' => out.push('N'),
            'ß' => out.push_str("ss"),
            'š' | 'ş' | 'ś' => out.push('s'),
            'Š' | 'Ş' | 'Ś' => out.push('S'),
            'ž' | 'ź' | 'ż' => out.push('z'),
            'Ž' | 'Ź' | 'Ż' => out.push('Z'),
            'ł' => out.push('l'),
            'Ł' => out.push('L'),
            'đ' => out.push('d'),
            'Đ' => out.push('D'),
            'ý' | 'ÿ' => out.push('y'),
            'æ' => out.push_str("ae"),
            'Æ' => out.push_str("AE"),
            'œ' => out.push_str("oe"),
            _ => out.push(ch),
        }
    }
    out
}

#[derive(Debug, Default)]
pub struct CollectSummary {
    pub leagues_stored: usize,
    pub seasons_stored: usize,
    pub teams_stored: usize,
    pub players_stored: usize,
    pub militancies_stored: usize,
    pub team_militancies_stored: usize,
    pub fetch_errors: Vec<String>,
}

/// Parse the leagues payload into leagues with their season calendars. A
/// league with an unusable season row (missing year or dates) is dropped
/// whole; a half-known calendar would poison interval anchoring later.
pub fn parse_league_entries(entries: &[Value], years: &[i32]) -> Vec<(League, Vec<Season>)> {
    let mut out = Vec::new();
    for entry in entries {
        let Some(league_id) = entry
            .get("league")
            .and_then(|l| l.get("id"))
            .and_then(Value::as_i64)
        else {
            continue;
        };
        let name = entry
            .get("league")
            .and_then(|l| l.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let country_code = entry
            .get("country")
            .and_then(|c| c.get("code"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let mut seasons = Vec::new();
        let mut usable = true;
        for season in entry
            .get("seasons")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let Some(year) = season.get("year").and_then(Value::as_i64) else {
                usable = false;
                break;
            };
            let year = year as i32;
            if !years.contains(&year) {
                continue;
            }
            let start = season
                .get("start")
                .and_then(Value::as_str)
                .and_then(parse_feed_date);
            let end = season
                .get("end")
                .and_then(Value::as_str)
                .and_then(parse_feed_date);
            let (Some(start_date), Some(end_date)) = (start, end) else {
                usable = false;
                break;
            };
            seasons.push(Season {
                league_id,
                year,
                start_date,
                end_date,
            });
        }
        if !usable || seasons.is_empty() || seasons_overlap(&seasons) {
            continue;
        }

        out.push((
            League {
                id: league_id,
                display_name: ascii_fold(name),
                country_code,
            },
            seasons,
        ));
    }
    out
}

/// Season windows of one league must not overlap; a calendar that violates
/// that cannot anchor militancy intervals.
fn seasons_overlap(seasons: &[Season]) -> bool {
    for (i, a) in seasons.iter().enumerate() {
        for b in seasons.iter().skip(i + 1) {
            if a.start_date < b.end_date && b.start_date < a.end_date {
                return true;
            }
        }
    }
    false
}

/// One page-batch of a league-season players payload, flattened into store
/// rows. Militancies are seeded with the season's full window.
pub fn parse_players_batch(
    entries: &[Value],
    season: &Season,
) -> (Vec<Team>, Vec<Player>, Vec<Militancy>) {
    let mut teams = Vec::new();
    let mut players = Vec::new();
    let mut militancies = Vec::new();

    for entry in entries {
        let Some(player_id) = entry
            .get("player")
            .and_then(|p| p.get("id"))
            .and_then(Value::as_i64)
        else {
            continue;
        };
        let Some(stats) = entry
            .get("statistics")
            .and_then(Value::as_array)
            .filter(|s| !s.is_empty())
        else {
            continue;
        };

        let player_obj = entry.get("player");
        let name = player_obj
            .and_then(|p| p.get("firstname"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let surname = player_obj
            .and_then(|p| p.get("lastname"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let position = stats[0]
            .get("games")
            .and_then(|g| g.get("position"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        players.push(Player {
            id: player_id,
            name: ascii_fold(name),
            surname: ascii_fold(surname),
            position,
            value: 0.0,
        });

        for stat in stats {
            let Some(team_id) = stat
                .get("team")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_i64)
            else {
                continue;
            };
            let team_name = stat
                .get("team")
                .and_then(|t| t.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            teams.push(Team {
                id: team_id,
                name: ascii_fold(team_name),
            });

            let appearances = stat
                .get("games")
                .and_then(|g| g.get("appearences"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            militancies.push(Militancy {
                player_id,
                team_id,
                year: season.year,
                start_date: Some(season.start_date),
                end_date: Some(season.end_date),
                appearances,
            });
        }
    }

    let teams = merge_by_key(teams, |t| t.id);
    let militancies = merge_by_key(militancies, |mi| (mi.player_id, mi.team_id, mi.year));
    (teams, players, militancies)
}

/// Team league memberships from a team-leagues payload, filtered to real
/// league competitions, tracked years and known ids.
pub fn parse_team_militancies(
    team_id: i64,
    entries: &[Value],
    years: &[i32],
    known_leagues: &HashSet<i64>,
) -> Vec<TeamMilitancy> {
    let mut out = Vec::new();
    for entry in entries {
        let league = entry.get("league");
        if league.and_then(|l| l.get("type")).and_then(Value::as_str) != Some("League") {
            continue;
        }
        let Some(league_id) = league.and_then(|l| l.get("id")).and_then(Value::as_i64) else {
            continue;
        };
        if !known_leagues.contains(&league_id) {
            continue;
        }
        for season in entry
            .get("seasons")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
        {
            let Some(year) = season.get("year").and_then(Value::as_i64) else {
                continue;
            };
            let year = year as i32;
            if years.contains(&year) {
                out.push(TeamMilitancy {
                    team_id,
                    league_id,
                    year,
                });
            }
        }
    }
    merge_by_key(out, |tm| (tm.team_id, tm.league_id, tm.year))
}

/// Deduplicate on a natural key with an explicit last-writer-wins policy:
/// the final occurrence of a key replaces the earlier ones, in place.
pub fn merge_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: std::hash::Hash + Eq + Copy,
    F: Fn(&T) -> K,
{
    let mut index: HashMap<K, usize> = HashMap::new();
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        match index.get(&key(&item)) {
            Some(&at) => out[at] = item,
            None => {
                index.insert(key(&item), out.len());
                out.push(item);
            }
        }
    }
    out
}

/// The whole seed-ingestion phase: leagues and seasons, then per-(league,
/// season) rosters over a worker pool, then per-team league memberships.
/// Fetch workers own their own API client; all storage writes happen after
/// the pool joins.
pub fn run_collect(db_path: &Path) -> Result<CollectSummary> {
    let years = configured_years();
    let mut summary = CollectSummary::default();

    let leagues_client = ApiFootballClient::from_env(Some(LEAGUES_REQUEST_BUDGET))?;
    let league_entries = leagues_client.get_leagues()?;
    let parsed = parse_league_entries(&league_entries, &years);

    let mut conn = store::open_db(db_path)?;
    let tx = conn.transaction().context("begin league transaction")?;
    for (league, seasons) in &parsed {
        store::insert_league(&tx, league)?;
        summary.leagues_stored += 1;
        for season in seasons {
            store::insert_season(&tx, season)?;
            summary.seasons_stored += 1;
        }
    }
    tx.commit().context("commit league transaction")?;

    let jobs: Vec<Season> = parsed
        .iter()
        .flat_map(|(_, seasons)| seasons.iter().cloned())
        .collect();
    let parallelism = env_parallelism("APP_FETCH_PARALLELISM", 14);
    let results: Vec<Result<(Vec<Team>, Vec<Player>, Vec<Militancy>)>> =
        with_pool(parallelism, || {
            jobs.par_iter()
                .map(|season| {
                    let client = ApiFootballClient::from_env(None)?;
                    let entries = client.get_league_players(season.league_id, season.year)?;
                    Ok(parse_players_batch(&entries, season))
                })
                .collect()
        });

    let mut teams = Vec::new();
    let mut players = Vec::new();
    let mut militancies = Vec::new();
    for result in results {
        match result {
            Ok((batch_teams, batch_players, batch_militancies)) => {
                teams.extend(batch_teams);
                players.extend(batch_players);
                militancies.extend(batch_militancies);
            }
            Err(err) => summary.fetch_errors.push(format!("league players: {err:#}")),
        }
    }
    let teams = merge_by_key(teams, |t| t.id);
    let players = merge_by_key(players, |p| p.id);
    let militancies = merge_by_key(militancies, |mi| (mi.player_id, mi.team_id, mi.year));

    let tx = conn.transaction().context("begin roster transaction")?;
    for team in &teams {
        store::insert_team(&tx, team)?;
    }
    for player in &players {
        store::insert_player(&tx, player)?;
    }
    for mi in &militancies {
        store::insert_militancy(&tx, mi)?;
    }
    tx.commit().context("commit roster transaction")?;
    summary.teams_stored = teams.len();
    summary.players_stored = players.len();
    summary.militancies_stored = militancies.len();

    let team_militancy_errors = store_team_militancies(&mut conn, &years, &mut summary)?;
    summary.fetch_errors.extend(team_militancy_errors);

    Ok(summary)
}

fn store_team_militancies(
    conn: &mut Connection,
    years: &[i32],
    summary: &mut CollectSummary,
) -> Result<Vec<String>> {
    let team_ids = store::team_ids(conn)?;
    let known_leagues: HashSet<i64> = store::league_ids(conn)?.into_iter().collect();

    let parallelism = env_parallelism("APP_FETCH_PARALLELISM", 14);
    let results: Vec<Result<Vec<TeamMilitancy>>> = with_pool(parallelism, || {
        team_ids
            .par_iter()
            .map(|team_id| {
                let client = ApiFootballClient::from_env(Some(TEAM_LEAGUES_REQUEST_BUDGET))?;
                let entries = client.get_team_leagues(*team_id)?.unwrap_or_default();
                Ok(parse_team_militancies(
                    *team_id,
                    &entries,
                    years,
                    &known_leagues,
                ))
            })
            .collect()
    });

    let mut errors = Vec::new();
    let mut rows = Vec::new();
    for result in results {
        match result {
            Ok(batch) => rows.extend(batch),
            Err(err) => errors.push(format!("team leagues: {err:#}")),
        }
    }
    let rows = merge_by_key(rows, |tm| (tm.team_id, tm.league_id, tm.year));

    let tx = conn.transaction().context("begin team militancy transaction")?;
    for tm in &rows {
        store::insert_team_militancy(&tx, tm)?;
    }
    tx.commit().context("commit team militancy transaction")?;
    summary.team_militancies_stored = rows.len();
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ascii_fold_strips_diacritics() {
        assert_eq!(ascii_fold("Müller"), "Muller");
        assert_eq!(ascii_fold("São Paulo"), "Sao Paulo");
        assert_eq!(ascii_fold("Świderski"), "Swiderski");
        assert_eq!(ascii_fold("plain"), "plain");
    }

    #[test]
    fn merge_by_key_last_writer_wins() {
        let merged = merge_by_key(vec![(1, "a"), (2, "b"), (1, "c")], |item| item.0);
        assert_eq!(merged, vec![(1, "c"), (2, "b")]);
    }

    #[test]
    fn league_with_broken_season_is_dropped_whole() {
        let entries = vec![json!({
            "league": {"id": 1, "name": "Serie A", "type": "League"},
            "country": {"code": "IT"},
            "seasons": [
                {"year": 2020, "start": "2020-08-01", "end": "2021-05-31"},
                {"year": 2021, "start": null, "end": "2022-05-31"}
            ]
        })];
        assert!(parse_league_entries(&entries, &[2020, 2021]).is_empty());
    }

    #[test]
    fn league_with_overlapping_seasons_is_dropped() {
        let entries = vec![json!({
            "league": {"id": 1, "name": "Serie A", "type": "League"},
            "country": {"code": "IT"},
            "seasons": [
                {"year": 2020, "start": "2020-08-01", "end": "2021-07-31"},
                {"year": 2021, "start": "2021-07-01", "end": "2022-05-31"}
            ]
        })];
        assert!(parse_league_entries(&entries, &[2020, 2021]).is_empty());
    }

    #[test]
    fn league_seasons_filter_to_tracked_years() {
        let entries = vec![json!({
            "league": {"id": 1, "name": "Serie A", "type": "League"},
            "country": {"code": "IT"},
            "seasons": [
                {"year": 1999, "start": "1999-08-01", "end": "2000-05-31"},
                {"year": 2020, "start": "2020-08-01", "end": "2021-05-31"}
            ]
        })];
        let parsed = parse_league_entries(&entries, &[2020]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].1.len(), 1);
        assert_eq!(parsed[0].1[0].year, 2020);
    }

    #[test]
    fn players_batch_flattens_statistics() {
        let season = Season {
            league_id: 1,
            year: 2020,
            start_date: chrono::NaiveDate::from_ymd_opt(2020, 8, 1).unwrap(),
            end_date: chrono::NaiveDate::from_ymd_opt(2021, 5, 31).unwrap(),
        };
        let entries = vec![json!({
            "player": {"id": 10, "firstname": "Cristián", "lastname": "Gómez"},
            "statistics": [
                {"team": {"id": 3, "name": "Génova"}, "games": {"appearences": 12, "position": "Midfielder"}},
                {"team": {"id": 4, "name": "Other"}, "games": {"appearences": null}}
            ]
        })];
        let (teams, players, militancies) = parse_players_batch(&entries, &season);
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].name, "Genova");
        assert_eq!(players.len(), 1);
        assert_eq!(players[0].name, "Cristian");
        assert_eq!(players[0].position.as_deref(), Some("Midfielder"));
        assert_eq!(militancies.len(), 2);
        assert_eq!(militancies[0].appearances, 12);
        assert_eq!(militancies[1].appearances, 0);
        assert_eq!(militancies[0].start_date, Some(season.start_date));
    }
}
