use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params};

#[derive(Debug, Clone, PartialEq)]
pub struct League {
    pub id: i64,
    pub display_name: String,
    pub country_code: Option<String>,
}

/// A league's yearly competition window. `(league_id, year)` is the key; the
/// dense integer year is what the rest of the pipeline joins on, the dates are
/// only the window bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct Season {
    pub league_id: i64,
    pub year: i32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Team {
    pub id: i64,
    pub name: String,
}

/// A (league, year) a team competed in. Drives resolver disambiguation.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamMilitancy {
    pub team_id: i64,
    pub league_id: i64,
    pub year: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: i64,
    pub name: String,
    pub surname: String,
    pub position: Option<String>,
    pub value: f64,
}

/// A player's dated spell on a team. Bounds start as the season window and are
/// tightened in place by the reconciler; they stay NULL until resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Militancy {
    pub player_id: i64,
    pub team_id: i64,
    pub year: i32,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub appearances: i64,
}

impl Militancy {
    /// Strict bracketing test used by the reconciler: both bounds must be
    /// known and the date must fall strictly inside them.
    pub fn brackets(&self, date: NaiveDate) -> bool {
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => start < date && date < end,
            _ => false,
        }
    }
}

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let conn =
        Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
    // Parallel workers each open this file; wait out transient locks.
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set busy timeout")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().context("open in-memory sqlite db")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS league (
            id INTEGER PRIMARY KEY,
            display_name TEXT NOT NULL,
            country_code TEXT NULL
        );
        CREATE TABLE IF NOT EXISTS season (
            league_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            PRIMARY KEY (league_id, year)
        );
        CREATE TABLE IF NOT EXISTS team (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS team_militancy (
            team_id INTEGER NOT NULL,
            league_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            PRIMARY KEY (team_id, league_id, year)
        );
        CREATE TABLE IF NOT EXISTS player (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            surname TEXT NOT NULL,
            position TEXT NULL,
            value REAL NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS militancy (
            player_id INTEGER NOT NULL,
            team_id INTEGER NOT NULL,
            year INTEGER NOT NULL,
            start_date TEXT NULL,
            end_date TEXT NULL,
            appearances INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (player_id, team_id, year)
        );
        CREATE INDEX IF NOT EXISTS idx_militancy_team ON militancy(team_id);
        CREATE INDEX IF NOT EXISTS idx_team_militancy_league ON team_militancy(league_id);
        CREATE INDEX IF NOT EXISTS idx_team_name ON team(name);
        CREATE INDEX IF NOT EXISTS idx_league_display_name ON league(display_name);
        "#,
    )
    .context("create sqlite schema")?;
    Ok(())
}

// Inserts are idempotent across batch re-runs: an existing row wins and the
// conflicting insert is dropped, never overwritten.

pub fn insert_league(conn: &Connection, league: &League) -> Result<()> {
    conn.execute(
        "INSERT INTO league (id, display_name, country_code) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO NOTHING",
        params![league.id, league.display_name, league.country_code],
    )
    .context("insert league")?;
    Ok(())
}

pub fn insert_season(conn: &Connection, season: &Season) -> Result<()> {
    conn.execute(
        "INSERT INTO season (league_id, year, start_date, end_date) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(league_id, year) DO NOTHING",
        params![
            season.league_id,
            season.year,
            date_to_sql(season.start_date),
            date_to_sql(season.end_date)
        ],
    )
    .context("insert season")?;
    Ok(())
}

pub fn insert_team(conn: &Connection, team: &Team) -> Result<()> {
    conn.execute(
        "INSERT INTO team (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
        params![team.id, team.name],
    )
    .context("insert team")?;
    Ok(())
}

pub fn insert_team_militancy(conn: &Connection, tm: &TeamMilitancy) -> Result<()> {
    conn.execute(
        "INSERT INTO team_militancy (team_id, league_id, year) VALUES (?1, ?2, ?3)
         ON CONFLICT(team_id, league_id, year) DO NOTHING",
        params![tm.team_id, tm.league_id, tm.year],
    )
    .context("insert team militancy")?;
    Ok(())
}

pub fn insert_player(conn: &Connection, player: &Player) -> Result<()> {
    conn.execute(
        "INSERT INTO player (id, name, surname, position, value) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO NOTHING",
        params![
            player.id,
            player.name,
            player.surname,
            player.position,
            player.value
        ],
    )
    .context("insert player")?;
    Ok(())
}

pub fn insert_militancy(conn: &Connection, mi: &Militancy) -> Result<()> {
    conn.execute(
        "INSERT INTO militancy (player_id, team_id, year, start_date, end_date, appearances)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(player_id, team_id, year) DO NOTHING",
        params![
            mi.player_id,
            mi.team_id,
            mi.year,
            mi.start_date.map(date_to_sql),
            mi.end_date.map(date_to_sql),
            mi.appearances
        ],
    )
    .context("insert militancy")?;
    Ok(())
}

pub fn update_militancy_bounds(conn: &Connection, mi: &Militancy) -> Result<()> {
    conn.execute(
        "UPDATE militancy SET start_date = ?1, end_date = ?2
         WHERE player_id = ?3 AND team_id = ?4 AND year = ?5",
        params![
            mi.start_date.map(date_to_sql),
            mi.end_date.map(date_to_sql),
            mi.player_id,
            mi.team_id,
            mi.year
        ],
    )
    .context("update militancy bounds")?;
    Ok(())
}

/// Raise a player's value to `candidate` if it is higher; never lowers it.
pub fn raise_player_value(conn: &Connection, player_id: i64, candidate: f64) -> Result<()> {
    conn.execute(
        "UPDATE player SET value = MAX(value, ?1) WHERE id = ?2",
        params![candidate, player_id],
    )
    .context("raise player value")?;
    Ok(())
}

pub fn player_value(conn: &Connection, player_id: i64) -> Result<Option<f64>> {
    conn.query_row(
        "SELECT value FROM player WHERE id = ?1",
        params![player_id],
        |row| row.get::<_, f64>(0),
    )
    .optional()
    .context("query player value")
}

pub fn player_exists(conn: &Connection, player_id: i64) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM player WHERE id = ?1",
            params![player_id],
            |_| Ok(()),
        )
        .optional()
        .context("query player existence")?;
    Ok(found.is_some())
}

pub fn team(conn: &Connection, team_id: i64) -> Result<Option<Team>> {
    conn.query_row(
        "SELECT id, name FROM team WHERE id = ?1",
        params![team_id],
        |row| {
            Ok(Team {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        },
    )
    .optional()
    .context("query team")
}

pub fn league_ids(conn: &Connection) -> Result<Vec<i64>> {
    collect_ids(conn, "SELECT id FROM league ORDER BY id")
}

pub fn team_ids(conn: &Connection) -> Result<Vec<i64>> {
    collect_ids(conn, "SELECT id FROM team ORDER BY id")
}

pub fn player_ids(conn: &Connection) -> Result<Vec<i64>> {
    collect_ids(conn, "SELECT id FROM player ORDER BY id")
}

fn collect_ids(conn: &Connection, sql: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(sql).context("prepare id query")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .context("query ids")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode id row")?);
    }
    Ok(out)
}

/// Distinct leagues a team has competed in, per its team militancies.
pub fn team_league_ids(conn: &Connection, team_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT league_id FROM team_militancy WHERE team_id = ?1 ORDER BY league_id")
        .context("prepare team league query")?;
    let rows = stmt
        .query_map(params![team_id], |row| row.get::<_, i64>(0))
        .context("query team leagues")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode league id")?);
    }
    Ok(out)
}

pub fn seasons_for_leagues(conn: &Connection, league_ids: &[i64]) -> Result<Vec<Season>> {
    let mut out = Vec::new();
    let mut stmt = conn
        .prepare(
            "SELECT league_id, year, start_date, end_date FROM season
             WHERE league_id = ?1 ORDER BY year",
        )
        .context("prepare season query")?;
    for league_id in league_ids {
        let rows = stmt
            .query_map(params![league_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("query seasons")?;
        for row in rows {
            let (league_id, year, start, end) = row.context("decode season row")?;
            out.push(Season {
                league_id,
                year,
                start_date: date_from_sql(&start)?,
                end_date: date_from_sql(&end)?,
            });
        }
    }
    Ok(out)
}

pub fn militancies_for_player(conn: &Connection, player_id: i64) -> Result<Vec<Militancy>> {
    militancy_query(
        conn,
        "SELECT player_id, team_id, year, start_date, end_date, appearances
         FROM militancy WHERE player_id = ?1 ORDER BY team_id, year",
        player_id,
    )
}

pub fn militancies_for_team(conn: &Connection, team_id: i64) -> Result<Vec<Militancy>> {
    militancy_query(
        conn,
        "SELECT player_id, team_id, year, start_date, end_date, appearances
         FROM militancy WHERE team_id = ?1 ORDER BY player_id, year",
        team_id,
    )
}

fn militancy_query(conn: &Connection, sql: &str, key: i64) -> Result<Vec<Militancy>> {
    let mut stmt = conn.prepare(sql).context("prepare militancy query")?;
    let rows = stmt
        .query_map(params![key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i32>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .context("query militancies")?;
    let mut out = Vec::new();
    for row in rows {
        let (player_id, team_id, year, start, end, appearances) =
            row.context("decode militancy row")?;
        out.push(Militancy {
            player_id,
            team_id,
            year,
            start_date: opt_date_from_sql(start)?,
            end_date: opt_date_from_sql(end)?,
            appearances,
        });
    }
    Ok(out)
}

pub fn teams_by_name(conn: &Connection, name: &str) -> Result<Vec<Team>> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM team WHERE name = ?1 ORDER BY id")
        .context("prepare team-by-name query")?;
    let rows = stmt
        .query_map(params![name], |row| {
            Ok(Team {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })
        .context("query teams by name")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode team row")?);
    }
    Ok(out)
}

pub fn leagues_by_display_name(conn: &Connection, display_name: &str) -> Result<Vec<League>> {
    let mut stmt = conn
        .prepare("SELECT id, display_name, country_code FROM league WHERE display_name = ?1 ORDER BY id")
        .context("prepare league-by-name query")?;
    let rows = stmt
        .query_map(params![display_name], |row| {
            Ok(League {
                id: row.get(0)?,
                display_name: row.get(1)?,
                country_code: row.get(2)?,
            })
        })
        .context("query leagues by name")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode league row")?);
    }
    Ok(out)
}

/// Distinct (league_id, league display name) pairs a team has competed under.
pub fn team_league_memberships(conn: &Connection, team_id: i64) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT l.id, l.display_name
             FROM team_militancy tm JOIN league l ON l.id = tm.league_id
             WHERE tm.team_id = ?1 ORDER BY l.id",
        )
        .context("prepare membership query")?;
    let rows = stmt
        .query_map(params![team_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .context("query memberships")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode membership row")?);
    }
    Ok(out)
}

/// Distinct (team_id, team name) pairs that have competed in a league.
pub fn league_team_entries(conn: &Connection, league_id: i64) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT t.id, t.name
             FROM team_militancy tm JOIN team t ON t.id = tm.team_id
             WHERE tm.league_id = ?1 ORDER BY t.id",
        )
        .context("prepare league team query")?;
    let rows = stmt
        .query_map(params![league_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .context("query league teams")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode league team row")?);
    }
    Ok(out)
}

/// Every player id with the concatenated full name, for similarity ranking.
pub fn player_full_names(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn
        .prepare("SELECT id, name || ' ' || surname FROM player ORDER BY id")
        .context("prepare player names query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .context("query player names")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode player name row")?);
    }
    Ok(out)
}

pub fn team_names(conn: &Connection) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM team ORDER BY id")
        .context("prepare team names query")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .context("query team names")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode team name row")?);
    }
    Ok(out)
}

/// A player's spells expanded with the team's display name, for resolver scoring.
pub fn player_team_entries(conn: &Connection, player_id: i64) -> Result<Vec<(i64, String, i64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT m.team_id, t.name, m.appearances
             FROM militancy m JOIN team t ON t.id = m.team_id
             WHERE m.player_id = ?1 ORDER BY m.team_id, m.year",
        )
        .context("prepare player team entries query")?;
    let rows = stmt
        .query_map(params![player_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .context("query player team entries")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode player team entry")?);
    }
    Ok(out)
}

/// A team's spells expanded with the player's full name, for the resolver's
/// secondary player pass.
pub fn team_player_entries(conn: &Connection, team_id: i64) -> Result<Vec<(i64, String, i64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT m.player_id, p.name || ' ' || p.surname, m.appearances
             FROM militancy m JOIN player p ON p.id = m.player_id
             WHERE m.team_id = ?1 ORDER BY m.player_id, m.year",
        )
        .context("prepare team player entries query")?;
    let rows = stmt
        .query_map(params![team_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .context("query team player entries")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode team player entry")?);
    }
    Ok(out)
}

/// Years a league has team militancies for, descending.
pub fn league_militancy_years(conn: &Connection, league_id: i64) -> Result<Vec<i32>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT year FROM team_militancy WHERE league_id = ?1 ORDER BY year DESC",
        )
        .context("prepare league years query")?;
    let rows = stmt
        .query_map(params![league_id], |row| row.get::<_, i32>(0))
        .context("query league years")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode year row")?);
    }
    Ok(out)
}

pub fn teams_for_league_year(conn: &Connection, league_id: i64, year: i32) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT team_id FROM team_militancy WHERE league_id = ?1 AND year = ?2 ORDER BY team_id")
        .context("prepare league-year teams query")?;
    let rows = stmt
        .query_map(params![league_id, year], |row| row.get::<_, i64>(0))
        .context("query league-year teams")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode team id row")?);
    }
    Ok(out)
}

pub fn players_for_team_year(conn: &Connection, team_id: i64, year: i32) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare("SELECT player_id FROM militancy WHERE team_id = ?1 AND year = ?2 ORDER BY player_id")
        .context("prepare team-year players query")?;
    let rows = stmt
        .query_map(params![team_id, year], |row| row.get::<_, i64>(0))
        .context("query team-year players")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode player id row")?);
    }
    Ok(out)
}

/// Players whose spell on `team_id` lies inside `[start, end]` (containment,
/// not general overlap). NULL-bounded spells never match.
pub fn contained_co_militants(
    conn: &Connection,
    team_id: i64,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT player_id FROM militancy
             WHERE team_id = ?1 AND start_date >= ?2 AND end_date <= ?3
             ORDER BY player_id",
        )
        .context("prepare co-militant query")?;
    let rows = stmt
        .query_map(
            params![team_id, date_to_sql(start), date_to_sql(end)],
            |row| row.get::<_, i64>(0),
        )
        .context("query co-militants")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode co-militant row")?);
    }
    Ok(out)
}

pub fn players_with_values(conn: &Connection) -> Result<Vec<(i64, f64)>> {
    let mut stmt = conn
        .prepare("SELECT id, value FROM player ORDER BY id")
        .context("prepare player values query")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)))
        .context("query player values")?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("decode player value row")?);
    }
    Ok(out)
}

pub fn date_to_sql(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn date_from_sql(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid stored date {raw:?}"))
}

fn opt_date_from_sql(raw: Option<String>) -> Result<Option<NaiveDate>> {
    raw.as_deref().map(date_from_sql).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn inserts_are_idempotent() {
        let conn = open_in_memory().unwrap();
        let team = Team {
            id: 7,
            name: "Example FC".to_string(),
        };
        insert_team(&conn, &team).unwrap();
        insert_team(
            &conn,
            &Team {
                id: 7,
                name: "Renamed FC".to_string(),
            },
        )
        .unwrap();
        // First writer wins on primary-key conflicts.
        assert_eq!(super::team(&conn, 7).unwrap().unwrap().name, "Example FC");
    }

    #[test]
    fn raise_player_value_never_lowers() {
        let conn = open_in_memory().unwrap();
        insert_player(
            &conn,
            &Player {
                id: 1,
                name: "A".to_string(),
                surname: "B".to_string(),
                position: None,
                value: 0.0,
            },
        )
        .unwrap();
        raise_player_value(&conn, 1, 5.0).unwrap();
        raise_player_value(&conn, 1, 2.0).unwrap();
        assert_eq!(player_value(&conn, 1).unwrap(), Some(5.0));
    }

    #[test]
    fn militancy_bracketing_requires_both_bounds() {
        let mi = Militancy {
            player_id: 1,
            team_id: 1,
            year: 2020,
            start_date: Some(date(2020, 8, 1)),
            end_date: None,
            appearances: 0,
        };
        assert!(!mi.brackets(date(2020, 9, 1)));

        let mi = Militancy {
            end_date: Some(date(2021, 5, 31)),
            ..mi
        };
        assert!(mi.brackets(date(2020, 9, 1)));
        assert!(!mi.brackets(date(2020, 8, 1)));
        assert!(!mi.brackets(date(2021, 5, 31)));
    }

    #[test]
    fn militancy_roundtrips_through_sql() {
        let conn = open_in_memory().unwrap();
        let mi = Militancy {
            player_id: 9,
            team_id: 4,
            year: 2021,
            start_date: Some(date(2021, 8, 13)),
            end_date: None,
            appearances: 12,
        };
        insert_militancy(&conn, &mi).unwrap();
        let stored = militancies_for_player(&conn, 9).unwrap();
        assert_eq!(stored, vec![mi]);
    }
}
