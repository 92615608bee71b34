use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use rusqlite::Connection;

use squadnet::comilitancy::{CSV_CHUNK_ROWS, Edge, GraphData, dump_csvs, player_edges};
use squadnet::store::{self, Militancy, Player, Team};

static TEST_SEQ: AtomicUsize = AtomicUsize::new(0);

fn temp_dir(kind: &str) -> PathBuf {
    let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!(
        "squadnet_comilitancy_{}_{seq}_{kind}",
        std::process::id()
    ))
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn seed_militancy(
    conn: &Connection,
    player_id: i64,
    team_id: i64,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) {
    store::insert_player(
        conn,
        &Player {
            id: player_id,
            name: "P".to_string(),
            surname: player_id.to_string(),
            position: None,
            value: 0.0,
        },
    )
    .unwrap();
    store::insert_team(
        conn,
        &Team {
            id: team_id,
            name: format!("Team {team_id}"),
        },
    )
    .unwrap();
    store::insert_militancy(
        conn,
        &Militancy {
            player_id,
            team_id,
            year: 2020,
            start_date: start,
            end_date: end,
            appearances: 0,
        },
    )
    .unwrap();
}

#[test]
fn contained_spells_become_edges_partial_overlaps_do_not() {
    let conn = store::open_in_memory().unwrap();
    // Player 1 holds the whole season; player 2 sits inside it; player 3
    // partially overlaps past the season end.
    seed_militancy(&conn, 1, 100, Some(date(2020, 8, 1)), Some(date(2021, 5, 31)));
    seed_militancy(&conn, 2, 100, Some(date(2020, 9, 1)), Some(date(2021, 4, 30)));
    seed_militancy(&conn, 3, 100, Some(date(2021, 1, 1)), Some(date(2021, 8, 1)));

    let edges = player_edges(&conn, 1).unwrap();
    assert_eq!(
        edges,
        vec![
            Edge {
                start: 1,
                end: 2,
                team_id: 100
            },
        ]
    );

    // Containment is directional: player 2's smaller interval cannot contain
    // player 1's, so player 2 has no edges of their own.
    assert!(player_edges(&conn, 2).unwrap().is_empty());
}

#[test]
fn same_pair_on_two_teams_yields_two_edges() {
    let conn = store::open_in_memory().unwrap();
    seed_militancy(&conn, 1, 100, Some(date(2020, 8, 1)), Some(date(2021, 5, 31)));
    seed_militancy(&conn, 2, 100, Some(date(2020, 8, 1)), Some(date(2021, 5, 31)));
    // Second spell together on another team a year later.
    store::insert_team(
        &conn,
        &Team {
            id: 200,
            name: "Team 200".to_string(),
        },
    )
    .unwrap();
    for player_id in [1, 2] {
        store::insert_militancy(
            &conn,
            &Militancy {
                player_id,
                team_id: 200,
                year: 2021,
                start_date: Some(date(2021, 8, 1)),
                end_date: Some(date(2022, 5, 31)),
                appearances: 0,
            },
        )
        .unwrap();
    }

    let edges = player_edges(&conn, 1).unwrap();
    assert_eq!(
        edges,
        vec![
            Edge {
                start: 1,
                end: 2,
                team_id: 100
            },
            Edge {
                start: 1,
                end: 2,
                team_id: 200
            },
        ]
    );
}

#[test]
fn unbounded_spells_never_pair() {
    let conn = store::open_in_memory().unwrap();
    seed_militancy(&conn, 1, 100, Some(date(2020, 8, 1)), Some(date(2021, 5, 31)));
    seed_militancy(&conn, 2, 100, None, Some(date(2021, 4, 30)));
    seed_militancy(&conn, 3, 100, None, None);

    assert!(player_edges(&conn, 1).unwrap().is_empty());
    assert!(player_edges(&conn, 3).unwrap().is_empty());
}

#[test]
fn csv_dump_writes_headers_nodes_and_chunked_edges() {
    let out_dir = temp_dir("csv");
    let mut data = GraphData {
        nodes: vec![(1, 2.5), (2, 0.0)],
        edges: Vec::with_capacity(CSV_CHUNK_ROWS + 1),
    };
    for n in 0..(CSV_CHUNK_ROWS + 1) as i64 {
        data.edges.push(Edge {
            start: 1,
            end: n + 2,
            team_id: 100,
        });
    }

    let files = dump_csvs(&out_dir, &data).unwrap();
    let names: Vec<String> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec![
            "players-header.csv",
            "players.csv",
            "played-with-header.csv",
            "played-with-part1.csv",
            "played-with-part2.csv",
        ]
    );

    let header = fs::read_to_string(out_dir.join("players-header.csv")).unwrap();
    assert_eq!(header.trim(), "playerId:ID,:LABEL,value:float");
    let nodes = fs::read_to_string(out_dir.join("players.csv")).unwrap();
    assert_eq!(nodes.lines().count(), 2);
    assert!(nodes.lines().next().unwrap().starts_with("1,Player,2.5"));

    let header = fs::read_to_string(out_dir.join("played-with-header.csv")).unwrap();
    assert_eq!(header.trim(), ":START_ID,:END_ID,:TYPE,team_id:int");
    let part1 = fs::read_to_string(out_dir.join("played-with-part1.csv")).unwrap();
    assert_eq!(part1.lines().count(), CSV_CHUNK_ROWS);
    let part2 = fs::read_to_string(out_dir.join("played-with-part2.csv")).unwrap();
    assert_eq!(part2.lines().count(), 1);
    assert!(part2.trim().ends_with("PLAYED_WITH,100"));

    let _ = fs::remove_dir_all(&out_dir);
}
