use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::Lazy;
use rayon::prelude::*;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::pool::{env_parallelism, with_pool};
use crate::similarity::{SimilarityFn, partial_ratio};
use crate::store;

pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 70;
pub const DEFAULT_PLAYER_CANDIDATES: usize = 10;
pub const DEFAULT_SECONDARY_TEAM_CANDIDATES: usize = 5;

/// Source spellings that the similarity pass alone cannot bridge.
static LEAGUE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("Série A", "Serie A"),
        ("SÃ©rie A", "Serie A"),
        ("Liga Portugal", "Primeira Liga"),
        ("Premier Liga", "Premier League"),
    ])
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedTeamValue {
    pub team: String,
    pub league: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedPlayerValue {
    pub player: String,
    pub team: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTeamValue {
    pub team_id: i64,
    pub team_name: String,
    pub league_id: i64,
    pub league_name: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPlayerValue {
    pub player_id: i64,
    pub player_name: String,
    pub team_id: i64,
    pub team_name: String,
    pub value: i64,
}

#[derive(Clone, Copy)]
pub struct ResolverConfig {
    pub threshold: u32,
    pub player_candidates: usize,
    pub secondary_team_candidates: usize,
    pub similarity: SimilarityFn,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
            player_candidates: DEFAULT_PLAYER_CANDIDATES,
            secondary_team_candidates: DEFAULT_SECONDARY_TEAM_CANDIDATES,
            similarity: partial_ratio,
        }
    }
}

impl ResolverConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(threshold) = env::var("APP_SIMILARITY_THRESHOLD")
            .ok()
            .and_then(|val| val.parse::<u32>().ok())
        {
            cfg.threshold = threshold.clamp(1, 100);
        }
        if let Some(k) = env::var("APP_PLAYER_CANDIDATES")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
        {
            cfg.player_candidates = k.clamp(1, 100);
        }
        cfg
    }
}

#[derive(Debug, Default)]
pub struct ResolutionReport {
    pub teams: Vec<ResolvedTeamValue>,
    pub players: Vec<ResolvedPlayerValue>,
    pub teams_not_found: Vec<ScrapedTeamValue>,
    pub players_not_found: Vec<ScrapedPlayerValue>,
    pub errors: Vec<String>,
    pub dump_paths: Vec<PathBuf>,
}

/// Split concatenated camel-case scrape artifacts ("ParisSaint" -> "Paris
/// Saint") and turn hyphens into spaces.
pub fn fix_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 4);
    let mut prev_lower = false;
    for ch in raw.chars() {
        if ch == '-' {
            out.push(' ');
            prev_lower = false;
            continue;
        }
        if prev_lower && ch.is_uppercase() {
            out.push(' ');
        }
        prev_lower = ch.is_lowercase();
        out.push(ch);
    }
    out
}

pub fn fix_league_name(raw: &str) -> String {
    let fixed = fix_name(raw);
    match LEAGUE_ALIASES.get(fixed.as_str()) {
        Some(canonical) => (*canonical).to_string(),
        None => fixed,
    }
}

pub fn fix_team_name(raw: &str) -> String {
    fix_name(raw)
}

/// Map a scraped (team, league) pair onto a canonical team. Primary pass keys
/// on an exact team-name match and scores league names; the secondary pass
/// flips that around. Below-threshold candidates never resolve.
pub fn resolve_team(
    conn: &Connection,
    cfg: &ResolverConfig,
    scraped: &ScrapedTeamValue,
) -> Result<Option<ResolvedTeamValue>> {
    let team_name = fix_team_name(&scraped.team);
    let league_name = fix_league_name(&scraped.league);

    // (score, team_id, league_id, league display name)
    let mut candidates: Vec<(u32, i64, i64, String)> = Vec::new();
    for team in store::teams_by_name(conn, &team_name)? {
        for (league_id, display_name) in store::team_league_memberships(conn, team.id)? {
            let score = (cfg.similarity)(&display_name, &league_name);
            if score >= cfg.threshold {
                candidates.push((score, team.id, league_id, display_name));
            }
        }
    }
    if let Some((_, team_id, league_id, display_name)) = pick_team_candidate(candidates) {
        return Ok(Some(ResolvedTeamValue {
            team_id,
            team_name,
            league_id,
            league_name: display_name,
            value: scraped.value,
        }));
    }

    let mut candidates: Vec<(u32, i64, i64, String)> = Vec::new();
    for league in store::leagues_by_display_name(conn, &league_name)? {
        for (team_id, name) in store::league_team_entries(conn, league.id)? {
            let score = (cfg.similarity)(&name, &team_name);
            if score >= cfg.threshold {
                candidates.push((score, team_id, league.id, name));
            }
        }
    }
    if let Some((_, team_id, league_id, name)) = pick_team_candidate(candidates) {
        return Ok(Some(ResolvedTeamValue {
            team_id,
            team_name: name,
            league_id,
            league_name,
            value: scraped.value,
        }));
    }

    Ok(None)
}

fn pick_team_candidate(
    mut candidates: Vec<(u32, i64, i64, String)>,
) -> Option<(u32, i64, i64, String)> {
    // Highest score wins; ties break on the lowest ids for determinism.
    candidates.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    candidates.into_iter().next()
}

/// Map a scraped (player, team) pair onto a canonical player. The primary pass
/// ranks the roster by full-name similarity, expands the top K to their spells
/// and scores the spell's team name; the secondary pass starts from the most
/// similar teams instead.
pub fn resolve_player(
    conn: &Connection,
    cfg: &ResolverConfig,
    scraped: &ScrapedPlayerValue,
) -> Result<Option<ResolvedPlayerValue>> {
    let player_name = fix_name(&scraped.player);
    let team_name = fix_team_name(&scraped.team);

    let player_candidates = top_ranked(
        store::player_full_names(conn)?,
        &player_name,
        cfg.similarity,
        cfg.player_candidates,
    );
    // (score, appearances, player_id, team_id, team name)
    let mut scored: Vec<(u32, i64, i64, i64, String)> = Vec::new();
    for (player_id, _) in &player_candidates {
        for (team_id, name, appearances) in store::player_team_entries(conn, *player_id)? {
            let score = (cfg.similarity)(&name, &team_name);
            if score >= cfg.threshold {
                scored.push((score, appearances, *player_id, team_id, name));
            }
        }
    }
    if let Some((_, _, player_id, team_id, name)) = pick_player_candidate(scored) {
        return Ok(Some(ResolvedPlayerValue {
            player_id,
            player_name,
            team_id,
            team_name: name,
            value: scraped.value,
        }));
    }

    let team_candidates = top_ranked(
        store::team_names(conn)?,
        &team_name,
        cfg.similarity,
        cfg.secondary_team_candidates,
    );
    let mut scored: Vec<(u32, i64, i64, i64, String)> = Vec::new();
    for (team_id, _) in &team_candidates {
        for (player_id, full_name, appearances) in store::team_player_entries(conn, *team_id)? {
            let score = (cfg.similarity)(&full_name, &player_name);
            if score >= cfg.threshold {
                scored.push((score, appearances, player_id, *team_id, full_name));
            }
        }
    }
    if let Some((_, _, player_id, team_id, full_name)) = pick_player_candidate(scored) {
        return Ok(Some(ResolvedPlayerValue {
            player_id,
            player_name: full_name,
            team_id,
            team_name,
            value: scraped.value,
        }));
    }

    Ok(None)
}

fn top_ranked(
    entries: Vec<(i64, String)>,
    target: &str,
    similarity: SimilarityFn,
    limit: usize,
) -> Vec<(i64, String)> {
    let mut ranked: Vec<(u32, i64, String)> = entries
        .into_iter()
        .map(|(id, name)| (similarity(&name, target), id, name))
        .collect();
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(_, id, name)| (id, name))
        .collect()
}

fn pick_player_candidate(
    mut scored: Vec<(u32, i64, i64, i64, String)>,
) -> Option<(u32, i64, i64, i64, String)> {
    // Highest similarity, then most appearances, then lowest player id.
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    scored.into_iter().next()
}

/// Resolve a whole scrape batch. Inputs are deduplicated on the scraped
/// (name, context) pair, each worker opens its own store connection, and
/// everything that stays unresolved lands in a timestamped diagnostic dump
/// instead of failing the batch.
pub fn resolve_all(
    db_path: &Path,
    cfg: &ResolverConfig,
    teams: Vec<ScrapedTeamValue>,
    players: Vec<ScrapedPlayerValue>,
    dump_dir: &Path,
) -> Result<ResolutionReport> {
    let teams = dedup_by_key(teams, |t| (t.team.clone(), t.league.clone()));
    let players = dedup_by_key(players, |p| (p.player.clone(), p.team.clone()));

    let parallelism = env_parallelism("APP_RESOLVE_PARALLELISM", 12);
    let mut report = ResolutionReport::default();

    let team_results: Vec<(ScrapedTeamValue, Result<Option<ResolvedTeamValue>>)> =
        with_pool(parallelism, || {
            teams
                .into_par_iter()
                .map(|scraped| {
                    let resolved = store::open_db(db_path)
                        .and_then(|conn| resolve_team(&conn, cfg, &scraped));
                    (scraped, resolved)
                })
                .collect()
        });
    for (scraped, result) in team_results {
        match result {
            Ok(Some(resolved)) => report.teams.push(resolved),
            Ok(None) => report.teams_not_found.push(scraped),
            Err(err) => report.errors.push(format!(
                "team {} / {}: {err:#}",
                scraped.team, scraped.league
            )),
        }
    }

    let player_results: Vec<(ScrapedPlayerValue, Result<Option<ResolvedPlayerValue>>)> =
        with_pool(parallelism, || {
            players
                .into_par_iter()
                .map(|scraped| {
                    let resolved = store::open_db(db_path)
                        .and_then(|conn| resolve_player(&conn, cfg, &scraped));
                    (scraped, resolved)
                })
                .collect()
        });
    for (scraped, result) in player_results {
        match result {
            Ok(Some(resolved)) => report.players.push(resolved),
            Ok(None) => report.players_not_found.push(scraped),
            Err(err) => report.errors.push(format!(
                "player {} / {}: {err:#}",
                scraped.player, scraped.team
            )),
        }
    }

    report.dump_paths = dump_not_found(dump_dir, &report)?;
    Ok(report)
}

/// First occurrence wins; later scrape rows for the same (name, context) pair
/// are redundant lookups, not new data.
fn dedup_by_key<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if seen.insert(key(&item)) {
            out.push(item);
        }
    }
    out
}

fn dump_not_found(dump_dir: &Path, report: &ResolutionReport) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dump_dir)
        .with_context(|| format!("create dump dir {}", dump_dir.display()))?;
    let stamp = Utc::now().format("%m_%d_%Y__%H_%M_%S");

    let teams_path = dump_dir.join(format!("teams_not_found_{stamp}.json"));
    let json = serde_json::to_string_pretty(&report.teams_not_found)
        .context("serialize teams not found")?;
    fs::write(&teams_path, json)
        .with_context(|| format!("write {}", teams_path.display()))?;

    let players_path = dump_dir.join(format!("players_not_found_{stamp}.json"));
    let json = serde_json::to_string_pretty(&report.players_not_found)
        .context("serialize players not found")?;
    fs::write(&players_path, json)
        .with_context(|| format!("write {}", players_path.display()))?;

    Ok(vec![teams_path, players_path])
}

pub fn load_scraped_teams(path: &Path) -> Result<Vec<ScrapedTeamValue>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read scraped teams {}", path.display()))?;
    serde_json::from_str(&raw).context("parse scraped teams json")
}

pub fn load_scraped_players(path: &Path) -> Result<Vec<ScrapedPlayerValue>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read scraped players {}", path.display()))?;
    serde_json::from_str(&raw).context("parse scraped players json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fix_name_splits_camel_case_and_hyphens() {
        assert_eq!(fix_name("Paris Saint-GermainFC"), "Paris Saint Germain FC");
        assert_eq!(fix_name("Borussia M-Gladbach"), "Borussia M Gladbach");
        assert_eq!(fix_name("Arsenal"), "Arsenal");
    }

    #[test]
    fn league_aliases_apply_after_fix() {
        assert_eq!(fix_league_name("Premier Liga"), "Premier League");
        assert_eq!(fix_league_name("Liga Portugal"), "Primeira Liga");
        assert_eq!(fix_league_name("Serie A"), "Serie A");
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let teams = vec![
            ScrapedTeamValue {
                team: "A".into(),
                league: "L".into(),
                value: 1,
            },
            ScrapedTeamValue {
                team: "A".into(),
                league: "L".into(),
                value: 2,
            },
        ];
        let deduped = dedup_by_key(teams, |t| (t.team.clone(), t.league.clone()));
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].value, 1);
    }

    #[test]
    fn candidate_ties_break_deterministically() {
        let picked = pick_team_candidate(vec![
            (90, 5, 2, "X".into()),
            (90, 3, 9, "Y".into()),
            (80, 1, 1, "Z".into()),
        ]);
        assert_eq!(picked.map(|c| c.1), Some(3));

        let picked = pick_player_candidate(vec![
            (90, 10, 7, 1, "A".into()),
            (90, 30, 9, 1, "B".into()),
            (90, 30, 4, 1, "C".into()),
        ]);
        // Same score: most appearances, then lowest player id.
        assert_eq!(picked.map(|c| c.2), Some(4));
    }
}
