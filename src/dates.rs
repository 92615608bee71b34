use chrono::NaiveDate;

/// Parse a transfer-feed date. The feed mixes ISO dates (`2021-01-15`) with a
/// legacy six-digit `DDMMYY` form (`150121`); two-digit years are all post-2000.
pub fn parse_feed_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() == 6 && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        let day = trimmed[..2].parse::<u32>().ok()?;
        let month = trimmed[2..4].parse::<u32>().ok()?;
        let year = 2000 + trimmed[4..].parse::<i32>().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day);
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok()
}
