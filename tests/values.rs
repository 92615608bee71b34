use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;

use squadnet::store::{self, League, Militancy, Player, Team, TeamMilitancy};
use squadnet::values::{ValueInputs, apply_values};

fn seed(conn: &Connection) {
    store::insert_league(
        conn,
        &League {
            id: 10,
            display_name: "Serie A".to_string(),
            country_code: None,
        },
    )
    .unwrap();
    for (team_id, year) in [(1, 2021), (2, 2021), (3, 2021)] {
        store::insert_team(
            conn,
            &Team {
                id: team_id,
                name: format!("Team {team_id}"),
            },
        )
        .unwrap();
        store::insert_team_militancy(
            conn,
            &TeamMilitancy {
                team_id,
                league_id: 10,
                year,
            },
        )
        .unwrap();
    }
    for player_id in 1..=6 {
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
    }

    // Team 1, 2021: a full sample season (top appearance count 30).
    for (player_id, appearances) in [(1, 30), (2, 25), (3, 0)] {
        store::insert_militancy(
            conn,
            &Militancy {
                player_id,
                team_id: 1,
                year: 2021,
                start_date: None,
                end_date: None,
                appearances,
            },
        )
        .unwrap();
    }
    // Team 2: the latest year is too thin, the year before qualifies.
    store::insert_militancy(
        conn,
        &Militancy {
            player_id: 4,
            team_id: 2,
            year: 2022,
            start_date: None,
            end_date: None,
            appearances: 5,
        },
    )
    .unwrap();
    store::insert_militancy(
        conn,
        &Militancy {
            player_id: 4,
            team_id: 2,
            year: 2021,
            start_date: None,
            end_date: None,
            appearances: 20,
        },
    )
    .unwrap();
    // Team 3 never has a long-enough sample.
    store::insert_militancy(
        conn,
        &Militancy {
            player_id: 5,
            team_id: 3,
            year: 2021,
            start_date: None,
            end_date: None,
            appearances: 8,
        },
    )
    .unwrap();
}

fn inputs() -> ValueInputs {
    ValueInputs {
        league_ids: BTreeSet::from([10]),
        team_values: BTreeMap::from([(1, 100), (2, 50), (3, 80)]),
        player_values: BTreeMap::from([(3, 2)]),
    }
}

fn value_of(conn: &Connection, player_id: i64) -> f64 {
    store::player_value(conn, player_id).unwrap().unwrap()
}

#[test]
fn log_weighting_anchors_on_the_sample_season() {
    let mut conn = store::open_in_memory().unwrap();
    seed(&conn);

    apply_values(&mut conn, &inputs()).unwrap();

    // team value 100 -> per-player average 10, base 30^(1/10).
    let log_base = 30f64.powf(1.0 / 10.0);
    let expected_p1 = 31f64.ln() / log_base.ln();
    let expected_p2 = 26f64.ln() / log_base.ln();
    assert!((value_of(&conn, 1) - expected_p1).abs() < 1e-9);
    assert!((value_of(&conn, 2) - expected_p2).abs() < 1e-9);
}

#[test]
fn baseline_then_override_layering() {
    let mut conn = store::open_in_memory().unwrap();
    seed(&conn);

    apply_values(&mut conn, &inputs()).unwrap();

    // Player 3 played 0 matches: log weight is 0, the roster baseline of 1
    // holds, then the direct override of 2 beats it.
    assert_eq!(value_of(&conn, 3), 2.0);
    // Player 6 is on no roster: untouched.
    assert_eq!(value_of(&conn, 6), 0.0);
}

#[test]
fn sample_year_walks_back_past_thin_seasons() {
    let mut conn = store::open_in_memory().unwrap();
    seed(&conn);

    let summary = apply_values(&mut conn, &inputs()).unwrap();

    // Team 2 anchors on 2021 (max 20 appearances), value 50 -> average 5.
    let log_base = 20f64.powf(1.0 / 5.0);
    let expected_p4 = 21f64.ln() / log_base.ln();
    assert!((value_of(&conn, 4) - expected_p4).abs() < 1e-9);

    // Team 3 never clears the appearance bar.
    assert_eq!(summary.teams_skipped, vec![3]);
    // Its player keeps the roster baseline.
    assert_eq!(value_of(&conn, 5), 1.0);
}

#[test]
fn propagation_never_lowers_a_value() {
    let mut conn = store::open_in_memory().unwrap();
    seed(&conn);
    store::raise_player_value(&conn, 1, 50.0).unwrap();

    apply_values(&mut conn, &inputs()).unwrap();
    assert_eq!(value_of(&conn, 1), 50.0);

    // A second pass is a no-op on already-propagated values.
    let before: Vec<(i64, f64)> = store::players_with_values(&conn).unwrap();
    apply_values(&mut conn, &inputs()).unwrap();
    let after: Vec<(i64, f64)> = store::players_with_values(&conn).unwrap();
    assert_eq!(before, after);
}
