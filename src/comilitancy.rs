use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rayon::prelude::*;
use rusqlite::Connection;

use crate::pool::{env_parallelism, with_pool};
use crate::store;

pub const RELATIONSHIP_TYPE: &str = "PLAYED_WITH";
/// The downstream bulk importer chokes on oversized relationship files, so
/// edge CSVs are split into parts of this many rows.
pub const CSV_CHUNK_ROWS: usize = 100_000;

/// A directed "played together" edge: `start` played with `end` on `team_id`.
/// The same pair on two different teams yields two edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Edge {
    pub start: i64,
    pub end: i64,
    pub team_id: i64,
}

#[derive(Debug, Default)]
pub struct GraphData {
    /// (player_id, value) node rows.
    pub nodes: Vec<(i64, f64)>,
    pub edges: Vec<Edge>,
}

#[derive(Debug, Default)]
pub struct GraphExportSummary {
    pub players: usize,
    pub edges: usize,
    pub files: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Teammates of one player: for each of the player's spells, every other
/// player whose spell on the same team lies inside it. Containment, not
/// general overlap, so symmetric partial overlaps are not double-counted.
pub fn player_edges(conn: &Connection, player_id: i64) -> Result<Vec<Edge>> {
    let mut partners: BTreeSet<(i64, i64)> = BTreeSet::new();
    for mi in store::militancies_for_player(conn, player_id)? {
        let (Some(start), Some(end)) = (mi.start_date, mi.end_date) else {
            continue;
        };
        for other in store::contained_co_militants(conn, mi.team_id, start, end)? {
            if other != player_id {
                partners.insert((other, mi.team_id));
            }
        }
    }
    Ok(partners
        .into_iter()
        .map(|(end, team_id)| Edge {
            start: player_id,
            end,
            team_id,
        })
        .collect())
}

/// Build the whole co-militancy graph, fanned out per player. Militancy data
/// is read-only at this point, so workers just need their own connections; a
/// failed player is logged and skipped, not fatal.
pub fn build_graph(db_path: &Path) -> Result<(GraphData, Vec<String>)> {
    let player_ids = {
        let conn = store::open_db(db_path)?;
        store::player_ids(&conn)?
    };

    let parallelism = env_parallelism("APP_GRAPH_PARALLELISM", 14);
    let results: Vec<(i64, Result<Vec<Edge>>)> = with_pool(parallelism, || {
        player_ids
            .par_iter()
            .map(|player_id| {
                let edges = store::open_db(db_path)
                    .and_then(|conn| player_edges(&conn, *player_id));
                (*player_id, edges)
            })
            .collect()
    });

    let mut data = GraphData::default();
    let mut errors = Vec::new();
    for (player_id, result) in results {
        match result {
            Ok(edges) => data.edges.extend(edges),
            Err(err) => errors.push(format!("player {player_id}: {err:#}")),
        }
    }

    let conn = store::open_db(db_path)?;
    data.nodes = store::players_with_values(&conn)?;
    Ok((data, errors))
}

/// Write the bulk-import artifacts: a node list plus a relationship list
/// chunked into fixed-size parts. The output directory is rebuilt from
/// scratch on every run.
pub fn dump_csvs(out_dir: &Path, data: &GraphData) -> Result<Vec<PathBuf>> {
    if out_dir.exists() {
        fs::remove_dir_all(out_dir)
            .with_context(|| format!("clear csv dir {}", out_dir.display()))?;
    }
    fs::create_dir_all(out_dir)
        .with_context(|| format!("create csv dir {}", out_dir.display()))?;

    let mut files = Vec::new();

    let path = out_dir.join("players-header.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("create {}", path.display()))?;
    writer
        .write_record(["playerId:ID", ":LABEL", "value:float"])
        .context("write node header")?;
    writer.flush().context("flush node header")?;
    files.push(path);

    let path = out_dir.join("players.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("create {}", path.display()))?;
    for (player_id, value) in &data.nodes {
        writer
            .write_record([
                player_id.to_string(),
                "Player".to_string(),
                value.to_string(),
            ])
            .context("write node row")?;
    }
    writer.flush().context("flush node rows")?;
    files.push(path);

    let path = out_dir.join("played-with-header.csv");
    let mut writer = csv::Writer::from_path(&path)
        .with_context(|| format!("create {}", path.display()))?;
    writer
        .write_record([":START_ID", ":END_ID", ":TYPE", "team_id:int"])
        .context("write edge header")?;
    writer.flush().context("flush edge header")?;
    files.push(path);

    for (part, chunk) in data.edges.chunks(CSV_CHUNK_ROWS).enumerate() {
        let path = out_dir.join(format!("played-with-part{}.csv", part + 1));
        let mut writer = csv::Writer::from_path(&path)
            .with_context(|| format!("create {}", path.display()))?;
        for edge in chunk {
            writer
                .write_record([
                    edge.start.to_string(),
                    edge.end.to_string(),
                    RELATIONSHIP_TYPE.to_string(),
                    edge.team_id.to_string(),
                ])
                .context("write edge row")?;
        }
        writer.flush().context("flush edge rows")?;
        files.push(path);
    }

    Ok(files)
}

pub fn run_graph_export(db_path: &Path, out_dir: &Path) -> Result<GraphExportSummary> {
    let (data, errors) = build_graph(db_path)?;
    let files = dump_csvs(out_dir, &data)?;
    Ok(GraphExportSummary {
        players: data.nodes.len(),
        edges: data.edges.len(),
        files,
        errors,
    })
}
