use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::USER_AGENT;
use serde::Serialize;

use crate::resolve::{ScrapedPlayerValue, ScrapedTeamValue};

const TEAMS_URL: &str =
    "https://www.transfermarkt.co.uk/spieler-statistik/wertvollstemannschaften/marktwertetop?ajax=yw1&page=";
const PLAYERS_URL: &str =
    "https://www.transfermarkt.co.uk/spieler-statistik/wertvollstespieler/marktwertetop?ajax=yw1&page=";
const BROWSER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/112.0.0.0 Safari/537.36";
const RESULTS_DIR: &str = ".valuation_results";
const MAX_RETRIES: u32 = 3;
const RETRY_SLEEP_SECS: u64 = 5;
const PAGE_DELAY_MS: u64 = 200;
const REQUEST_TIMEOUT_SECS: u64 = 15;

static CLIENT: OnceCell<Client> = OnceCell::new();

fn scrape_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build scrape client")
    })
}

#[derive(Debug)]
pub struct ScrapeOutcome<T> {
    pub entries: Vec<T>,
    pub pages_fetched: usize,
    pub rows_skipped: usize,
    pub dump_path: PathBuf,
    /// Set when the page loop stopped early; entries hold the partial result.
    pub aborted: Option<String>,
}

/// Scrape the most-valuable-teams listing up to `up_to_page`, dumping the
/// rows as timestamped JSON. Retries flaky pages a few times, then keeps the
/// partial result rather than failing the run.
pub fn collect_team_values(up_to_page: usize) -> Result<ScrapeOutcome<ScrapedTeamValue>> {
    collect_listing(TEAMS_URL, up_to_page, "teams", parse_team_rows)
}

pub fn collect_player_values(up_to_page: usize) -> Result<ScrapeOutcome<ScrapedPlayerValue>> {
    collect_listing(PLAYERS_URL, up_to_page, "players", parse_player_rows)
}

fn collect_listing<T: Serialize>(
    base_url: &str,
    up_to_page: usize,
    kind: &str,
    parse: fn(&str) -> (Vec<T>, usize),
) -> Result<ScrapeOutcome<T>> {
    let client = scrape_client()?;
    let mut entries = Vec::new();
    let mut rows_skipped = 0;
    let mut pages_fetched = 0;
    let mut aborted = None;

    'pages: for page in 1..=up_to_page.max(1) {
        let url = format!("{base_url}{page}");
        let mut retries = 0;
        let body = loop {
            let response = client
                .get(&url)
                .header(USER_AGENT, BROWSER_AGENT)
                .send()
                .with_context(|| format!("request page {page} failed"));
            match response {
                Ok(resp) if resp.status().is_success() => {
                    break resp.text().context("read page body")?;
                }
                Ok(resp) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        aborted = Some(format!("page {page}: http {} after {MAX_RETRIES} tries", resp.status()));
                        break 'pages;
                    }
                    std::thread::sleep(Duration::from_secs(RETRY_SLEEP_SECS));
                }
                Err(err) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        aborted = Some(format!("page {page}: {err:#}"));
                        break 'pages;
                    }
                    std::thread::sleep(Duration::from_secs(RETRY_SLEEP_SECS));
                }
            }
        };

        let (rows, skipped) = parse(&body);
        entries.extend(rows);
        rows_skipped += skipped;
        pages_fetched += 1;
        std::thread::sleep(Duration::from_millis(PAGE_DELAY_MS));
    }

    let dump_path = dump_entries(kind, &entries)?;
    Ok(ScrapeOutcome {
        entries,
        pages_fetched,
        rows_skipped,
        dump_path,
        aborted,
    })
}

fn dump_entries<T: Serialize>(kind: &str, entries: &[T]) -> Result<PathBuf> {
    let dir = Path::new(RESULTS_DIR);
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let stamp = Utc::now().format("%m_%d_%Y__%H_%M_%S");
    let path = dir.join(format!("{kind}_{stamp}.json"));
    let json = serde_json::to_string_pretty(entries).context("serialize scrape dump")?;
    fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Rows of the teams listing: the first two distinct anchor titles in a row
/// are the team and its league, the first money token is the valuation.
/// Returns the parsed rows plus how many rows were skipped as malformed.
pub fn parse_team_rows(html: &str) -> (Vec<ScrapedTeamValue>, usize) {
    let mut out = Vec::new();
    let mut skipped = 0;
    for row in listing_rows(html) {
        let titles = anchor_titles(row);
        let value = find_market_value(row);
        match (titles.first(), titles.get(1), value) {
            (Some(team), Some(league), Some(value)) => out.push(ScrapedTeamValue {
                team: team.clone(),
                league: league.clone(),
                value,
            }),
            _ => skipped += 1,
        }
    }
    (out, skipped)
}

/// Rows of the players listing: first distinct anchor title is the player,
/// second is their club.
pub fn parse_player_rows(html: &str) -> (Vec<ScrapedPlayerValue>, usize) {
    let mut out = Vec::new();
    let mut skipped = 0;
    for row in listing_rows(html) {
        let titles = anchor_titles(row);
        let value = find_market_value(row);
        match (titles.first(), titles.get(1), value) {
            (Some(player), Some(team), Some(value)) => out.push(ScrapedPlayerValue {
                player: player.clone(),
                team: team.clone(),
                value,
            }),
            _ => skipped += 1,
        }
    }
    (out, skipped)
}

/// Table rows of the `yw1` listing widget. Nested decoration rows fall out
/// naturally later because they carry no titles or money token.
fn listing_rows(html: &str) -> Vec<&str> {
    let Some(widget_at) = html.find("id=\"yw1\"") else {
        return Vec::new();
    };
    let widget = &html[widget_at..];
    let Some(body_at) = widget.find("<tbody>") else {
        return Vec::new();
    };
    let body = &widget[body_at..];
    let end = body.find("</tbody>").unwrap_or(body.len());
    let body = &body[..end];

    let mut rows = Vec::new();
    let mut rest = body;
    while let Some(at) = rest.find("<tr") {
        let row = &rest[at..];
        let row_end = row.find("</tr>").unwrap_or(row.len());
        rows.push(&row[..row_end]);
        rest = &row[row_end..];
    }
    rows
}

/// Distinct `title` attributes of `<a>` tags, in order of appearance. The
/// listing repeats a title for the logo link and the text link, hence distinct.
fn anchor_titles(row: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut rest = row;
    while let Some(at) = rest.find("<a ") {
        let tag = &rest[at..];
        let tag_end = tag.find('>').unwrap_or(tag.len());
        let attrs = &tag[..tag_end];
        if let Some(title_at) = attrs.find("title=\"") {
            let title = &attrs[title_at + 7..];
            if let Some(quote) = title.find('"') {
                let decoded = html_decode(&title[..quote]);
                if !decoded.is_empty() && !out.contains(&decoded) {
                    out.push(decoded);
                }
            }
        }
        rest = &tag[tag_end..];
    }
    out
}

/// First money token in the row, normalized to integer millions:
/// "€991.50m" -> 991, "€1.08bn" -> 1080. Anything else is unusable.
fn find_market_value(row: &str) -> Option<i64> {
    let euro_at = row.find('€')?;
    let after = &row['€'.len_utf8() + euro_at..];
    let digits_end = after
        .find(|ch: char| !ch.is_ascii_digit() && ch != '.')
        .unwrap_or(after.len());
    let amount = after[..digits_end].parse::<f64>().ok()?;
    let suffix = &after[digits_end..];
    if suffix.starts_with("bn") {
        Some((amount * 1000.0) as i64)
    } else if suffix.starts_with('m') {
        Some(amount as i64)
    } else {
        None
    }
}

fn html_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&#x2F;", "/")
}
