use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use chrono::NaiveDate;

use squadnet::reconcile::find_overlap_violations;
use squadnet::similarity::partial_ratio;
use squadnet::store::Militancy;
use squadnet::valuation_scrape::parse_team_rows;

fn bench_partial_ratio(c: &mut Criterion) {
    let pairs = [
        ("Premier League", "English Premier League"),
        ("Serie A", "Premier Liga"),
        ("Paris Saint Germain", "Paris Saint-Germain FC"),
        ("Borussia Monchengladbach", "Bayer Leverkusen"),
    ];
    c.bench_function("partial_ratio", |b| {
        b.iter(|| {
            let mut total = 0u32;
            for (a, bb) in &pairs {
                total += partial_ratio(black_box(a), black_box(bb));
            }
            black_box(total);
        })
    });
}

fn bench_overlap_scan(c: &mut Criterion) {
    let start = NaiveDate::from_ymd_opt(2015, 8, 1).unwrap();
    let militancies: Vec<Militancy> = (0..40)
        .map(|n| Militancy {
            player_id: 1,
            team_id: n % 7,
            year: 2015 + (n / 7) as i32,
            start_date: Some(start + chrono::Duration::days(n * 170)),
            end_date: Some(start + chrono::Duration::days(n * 170 + 300)),
            appearances: 10,
        })
        .collect();

    c.bench_function("overlap_scan", |b| {
        b.iter(|| {
            let violations = find_overlap_violations(1, black_box(&militancies));
            black_box(violations.len());
        })
    });
}

fn bench_team_listing_parse(c: &mut Criterion) {
    c.bench_function("team_listing_parse", |b| {
        b.iter(|| {
            let (rows, skipped) = parse_team_rows(black_box(TEAMS_HTML));
            black_box(rows.len() + skipped);
        })
    });
}

criterion_group!(
    perf,
    bench_partial_ratio,
    bench_overlap_scan,
    bench_team_listing_parse
);
criterion_main!(perf);

static TEAMS_HTML: &str = include_str!("../tests/fixtures/valuation_teams.html");
