use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, anyhow};

use squadnet::{comilitancy, ingest, reconcile, valuation_scrape, values};

const DEFAULT_DB_PATH: &str = "squadnet.sqlite";
const DEFAULT_CSV_DIR: &str = "csv_files";
const DEFAULT_DUMP_DIR: &str = ".not_found";
const DEFAULT_TEAM_PAGES: usize = 100;
const DEFAULT_PLAYER_PAGES: usize = 1000;
const MAX_PRINTED_WARNINGS: usize = 10;

fn main() -> ExitCode {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        print_usage();
        return Ok(());
    };
    let db_path = flag_value(&args, "--db")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

    match command.as_str() {
        "collect" => cmd_collect(&db_path),
        "scrape-values" => cmd_scrape_values(&args),
        "fix-transfers" => cmd_fix_transfers(&db_path),
        "market-values" => cmd_market_values(&db_path, &args),
        "graph" => cmd_graph(&db_path, &args),
        other => {
            print_usage();
            Err(anyhow!("unknown command {other:?}"))
        }
    }
}

fn cmd_collect(db_path: &PathBuf) -> Result<()> {
    let summary = ingest::run_collect(db_path)?;
    println!("Collect complete");
    println!("DB: {}", db_path.display());
    println!(
        "Leagues: {} (seasons {})",
        summary.leagues_stored, summary.seasons_stored
    );
    println!(
        "Teams: {} Players: {} Militancies: {}",
        summary.teams_stored, summary.players_stored, summary.militancies_stored
    );
    println!("Team militancies: {}", summary.team_militancies_stored);
    print_errors("fetch", &summary.fetch_errors);
    Ok(())
}

fn cmd_scrape_values(args: &[String]) -> Result<()> {
    let team_pages = flag_value(args, "--team-pages")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_TEAM_PAGES);
    let player_pages = flag_value(args, "--player-pages")
        .and_then(|raw| raw.parse::<usize>().ok())
        .unwrap_or(DEFAULT_PLAYER_PAGES);

    let teams = valuation_scrape::collect_team_values(team_pages)?;
    println!(
        "Teams: {} rows from {} pages ({} rows skipped) -> {}",
        teams.entries.len(),
        teams.pages_fetched,
        teams.rows_skipped,
        teams.dump_path.display()
    );
    if let Some(reason) = &teams.aborted {
        println!("  stopped early: {reason}");
    }

    let players = valuation_scrape::collect_player_values(player_pages)?;
    println!(
        "Players: {} rows from {} pages ({} rows skipped) -> {}",
        players.entries.len(),
        players.pages_fetched,
        players.rows_skipped,
        players.dump_path.display()
    );
    if let Some(reason) = &players.aborted {
        println!("  stopped early: {reason}");
    }
    Ok(())
}

fn cmd_fix_transfers(db_path: &PathBuf) -> Result<()> {
    let summary = reconcile::run_fix_transfers(db_path)?;
    println!("Transfer reconciliation complete");
    println!(
        "Teams fetched: {} Players processed: {}",
        summary.teams_fetched, summary.players_processed
    );
    println!(
        "Militancies created: {} Boundary edits: {}",
        summary.militancies_created, summary.boundary_edits
    );
    if !summary.overlap_violations.is_empty() {
        println!(
            "Overlap violations: {} (unresolved concurrent-team data)",
            summary.overlap_violations.len()
        );
        for violation in summary.overlap_violations.iter().take(MAX_PRINTED_WARNINGS) {
            println!(
                "   - player {} teams {}/{} years {}/{}",
                violation.player_id,
                violation.team_a,
                violation.team_b,
                violation.year_a,
                violation.year_b
            );
        }
    }
    if !summary.warnings.is_empty() {
        println!("Warnings: {}", summary.warnings.len());
        for warning in summary.warnings.iter().take(MAX_PRINTED_WARNINGS) {
            println!("   - {warning}");
        }
    }
    print_errors("fetch", &summary.fetch_errors);
    Ok(())
}

fn cmd_market_values(db_path: &PathBuf, args: &[String]) -> Result<()> {
    let teams_path = flag_value(args, "--teams")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("market-values needs --teams <scraped json>"))?;
    let players_path = flag_value(args, "--players")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("market-values needs --players <scraped json>"))?;
    let cut_players = flag_value(args, "--cut-players").and_then(|raw| raw.parse::<usize>().ok());
    let dump_dir = flag_value(args, "--dump-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DUMP_DIR));

    let summary =
        values::run_market_values(db_path, &teams_path, &players_path, cut_players, &dump_dir)?;
    println!("Market values complete");
    println!(
        "Resolved teams: {} ({} not found)",
        summary.resolution.teams.len(),
        summary.resolution.teams_not_found.len()
    );
    println!(
        "Resolved players: {} ({} not found)",
        summary.resolution.players.len(),
        summary.resolution.players_not_found.len()
    );
    for path in &summary.resolution.dump_paths {
        println!("Not-found dump: {}", path.display());
    }
    println!(
        "Assignments: baseline {} weighted {} overrides {}",
        summary.propagation.baseline_assignments,
        summary.propagation.weighted_assignments,
        summary.propagation.override_assignments
    );
    if !summary.propagation.teams_skipped.is_empty() {
        println!(
            "Teams without a long-enough season sample: {}",
            summary.propagation.teams_skipped.len()
        );
    }
    print_errors("resolution", &summary.resolution.errors);
    Ok(())
}

fn cmd_graph(db_path: &PathBuf, args: &[String]) -> Result<()> {
    let out_dir = flag_value(args, "--out")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CSV_DIR));

    let summary = comilitancy::run_graph_export(db_path, &out_dir)?;
    println!("Graph export complete");
    println!("Players: {} Edges: {}", summary.players, summary.edges);
    for file in &summary.files {
        println!("   - {}", file.display());
    }
    print_errors("graph", &summary.errors);
    Ok(())
}

fn print_errors(kind: &str, errors: &[String]) {
    if errors.is_empty() {
        return;
    }
    println!("{kind} errors: {}", errors.len());
    for err in errors.iter().take(MAX_PRINTED_WARNINGS) {
        println!("   - {err}");
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == flag
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn print_usage() {
    println!("squadnet <command> [--db <path>]");
    println!("  collect                             seed leagues, seasons, rosters");
    println!("  scrape-values [--team-pages N] [--player-pages N]");
    println!("  fix-transfers                       reconcile militancy timelines");
    println!("  market-values --teams <json> --players <json> [--cut-players N]");
    println!("  graph [--out <dir>]                 dump co-militancy csv artifacts");
}
