use std::cell::Cell;
use std::env;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const DEFAULT_API_HOST: &str = "api-football-v1.p.rapidapi.com";
const API_VERSION: &str = "v3";
const CACHE_DIR: &str = ".rapid_api_cache";
const REQUEST_TIMEOUT_SECS: u64 = 10;
const RATE_LIMIT_SLEEP_SECS: u64 = 15;
const LOW_REMAINING_THRESHOLD: u32 = 10;

static CLIENT: OnceCell<Client> = OnceCell::new();

fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")
    })
}

/// The upstream API budget is exhausted (either our own per-run block or the
/// provider's rate limit after a retry). Drivers downcast for this to tell a
/// hard stop from an ordinary fetch miss.
#[derive(Debug)]
pub struct ApiLimitReached(pub String);

impl fmt::Display for ApiLimitReached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api limit reached: {}", self.0)
    }
}

impl std::error::Error for ApiLimitReached {}

/// Blocking client for the paginated stats API. Successful JSON bodies are
/// cached on disk keyed by a digest of url+params, so re-runs replay from the
/// cache without spending quota.
pub struct ApiFootballClient {
    base_url: String,
    api_key: String,
    api_host: String,
    cache_dir: Option<PathBuf>,
    request_budget: Option<u32>,
    requests_used: Cell<u32>,
}

impl ApiFootballClient {
    /// Credentials from `RAPID_API_KEY`/`RAPID_API_HOST`. `request_budget`
    /// caps live requests for this client instance; cached replies are free.
    pub fn from_env(request_budget: Option<u32>) -> Result<Self> {
        let api_key = env::var("RAPID_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .context("RAPID_API_KEY is not set")?;
        let api_host = env::var("RAPID_API_HOST")
            .ok()
            .filter(|host| !host.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_HOST.to_string());

        let cache_dir = if env_bool("APP_API_CACHE", true) {
            let dir = PathBuf::from(CACHE_DIR);
            fs::create_dir_all(&dir)
                .with_context(|| format!("create cache dir {}", dir.display()))?;
            Some(dir)
        } else {
            None
        };

        Ok(Self {
            base_url: format!("https://{api_host}/{API_VERSION}"),
            api_key,
            api_host,
            cache_dir,
            request_budget,
            requests_used: Cell::new(0),
        })
    }

    /// One API call. `Ok(None)` means the endpoint answered but unusably
    /// (non-200 or an errors block); an exhausted budget or rate limit is an
    /// `ApiLimitReached` error.
    pub fn send_request(&self, partial_url: &str, params: &[(&str, String)]) -> Result<Option<Value>> {
        let url = format!("{}/{partial_url}", self.base_url);
        if let Some(cached) = self.read_cache(&url, params) {
            return Ok(Some(cached));
        }

        if let Some(budget) = self.request_budget {
            if self.requests_used.get() >= budget {
                return Err(anyhow!(ApiLimitReached(format!(
                    "request block exhausted ({budget} requests)"
                ))));
            }
        }
        self.requests_used.set(self.requests_used.get() + 1);

        let client = http_client()?;
        let mut retried = false;
        let response = loop {
            let response = client
                .get(&url)
                .query(params)
                .header("X-RapidAPI-Key", &self.api_key)
                .header("X-RapidAPI-Host", &self.api_host)
                .send()
                .with_context(|| format!("request {url} failed"))?;

            let remaining = response
                .headers()
                .get("x-ratelimit-requests-remaining")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(u32::MAX);
            if remaining < LOW_REMAINING_THRESHOLD || response.status().as_u16() == 429 {
                let msg = format!("status {}, {remaining} requests remaining", response.status());
                if retried {
                    return Err(anyhow!(ApiLimitReached(msg)));
                }
                eprintln!("[WARN] {msg}; backing off {RATE_LIMIT_SLEEP_SECS}s");
                retried = true;
                std::thread::sleep(Duration::from_secs(RATE_LIMIT_SLEEP_SECS));
                continue;
            }
            break response;
        };

        let status = response.status();
        let body = response.text().context("read response body")?;
        if !status.is_success() {
            eprintln!("[WARN] {url}: http {status}");
            return Ok(None);
        }
        let value: Value = serde_json::from_str(body.trim())
            .with_context(|| format!("invalid json from {url}"))?;
        if value
            .get("errors")
            .is_some_and(|errs| !errs.is_null() && errs.as_array().is_none_or(|a| !a.is_empty()))
        {
            eprintln!("[WARN] {url}: errors in response body");
            return Ok(None);
        }

        self.write_cache(&url, params, &value);
        Ok(Some(value))
    }

    /// The `response` array of a single request, or None on an unusable reply.
    pub fn get_clean_response(
        &self,
        partial_url: &str,
        params: &[(&str, String)],
    ) -> Result<Option<Vec<Value>>> {
        let Some(value) = self.send_request(partial_url, params)? else {
            return Ok(None);
        };
        Ok(Some(response_array(&value)))
    }

    /// Page loop over a paginated endpoint. A failed page ends the loop with
    /// whatever was gathered so far: a partial result beats no result.
    pub fn get_paginated_response(
        &self,
        partial_url: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<Value>> {
        let mut out = Vec::new();
        let mut page: u64 = 1;
        loop {
            let mut page_params: Vec<(&str, String)> = params.to_vec();
            page_params.push(("page", page.to_string()));
            let Some(value) = self.send_request(partial_url, &page_params)? else {
                eprintln!("[WARN] {partial_url}: returning partial pagination result ({} rows)", out.len());
                return Ok(out);
            };
            out.extend(response_array(&value));

            let paging = value.get("paging");
            let total = paging
                .and_then(|p| p.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let current = paging
                .and_then(|p| p.get("current"))
                .and_then(Value::as_u64)
                .unwrap_or(page);
            if current >= total {
                return Ok(out);
            }
            page = current + 1;
        }
    }

    pub fn get_leagues(&self) -> Result<Vec<Value>> {
        let entries = self.get_clean_response("leagues", &[])?.unwrap_or_default();
        Ok(entries
            .into_iter()
            .filter(|entry| {
                entry
                    .get("league")
                    .and_then(|l| l.get("type"))
                    .and_then(Value::as_str)
                    == Some("League")
            })
            .collect())
    }

    pub fn get_league_players(&self, league_id: i64, year: i32) -> Result<Vec<Value>> {
        self.get_paginated_response(
            "players",
            &[
                ("league", league_id.to_string()),
                ("season", year.to_string()),
            ],
        )
    }

    pub fn get_team_leagues(&self, team_id: i64) -> Result<Option<Vec<Value>>> {
        self.get_clean_response("leagues", &[("team", team_id.to_string())])
    }

    pub fn get_team_transfers(&self, team_id: i64) -> Result<Option<Vec<Value>>> {
        self.get_clean_response("transfers", &[("team", team_id.to_string())])
    }

    fn cache_path(&self, url: &str, params: &[(&str, String)]) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let mut sorted: Vec<&(&str, String)> = params.iter().collect();
        sorted.sort();
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        for (key, value) in sorted {
            hasher.update(b"_");
            hasher.update(key.as_bytes());
            hasher.update(b"_");
            hasher.update(value.as_bytes());
        }
        Some(dir.join(format!("{:x}", hasher.finalize())))
    }

    fn read_cache(&self, url: &str, params: &[(&str, String)]) -> Option<Value> {
        let path = self.cache_path(url, params)?;
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }

    fn write_cache(&self, url: &str, params: &[(&str, String)], value: &Value) {
        let Some(path) = self.cache_path(url, params) else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Ok(json) = serde_json::to_string(value) {
            let _ = fs::write(path, json);
        }
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| {
            let t = v.trim().to_ascii_lowercase();
            !(t.is_empty() || t == "0" || t == "false" || t == "off" || t == "no")
        })
        .unwrap_or(default)
}

fn response_array(value: &Value) -> Vec<Value> {
    value
        .get("response")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::response_array;
    use serde_json::json;

    #[test]
    fn response_array_handles_missing_field() {
        assert!(response_array(&json!({})).is_empty());
        assert_eq!(response_array(&json!({"response": [1, 2]})).len(), 2);
    }
}
