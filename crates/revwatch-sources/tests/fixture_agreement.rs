use std::path::Path;

use chrono::NaiveDate;
use revwatch_core::{ReviewDate, ReviewKey};
use revwatch_sources::dates::DEFAULT_SOURCE_ZONE;
use revwatch_sources::feed::parse_feed_page;
use revwatch_sources::rendered::parse_rendered_reviews;

fn fixture(relative: &str) -> Vec<u8> {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures").join(relative);
    std::fs::read(&path).unwrap_or_else(|e| panic!("{}: {e}", path.display()))
}

#[test]
fn both_strategies_identify_the_same_reviews_identically() {
    // The rendered page was captured on the day Борис posted.
    let today = NaiveDate::from_ymd_opt(2024, 1, 12).unwrap();
    let feed = parse_feed_page(&fixture("feed/page1.json"), DEFAULT_SOURCE_ZONE).unwrap();
    let html = String::from_utf8(fixture("rendered/feedbacks.html")).unwrap();
    let rendered = parse_rendered_reviews(&html, today, 0).unwrap();

    let feed_keys: Vec<ReviewKey> = feed.reviews.iter().map(|r| r.identity_key()).collect();
    let shared = rendered
        .reviews
        .iter()
        .filter(|r| feed_keys.contains(&r.identity_key()))
        .count();

    assert_eq!(feed.reviews.len(), 2);
    assert_eq!(rendered.reviews.len(), 3);
    assert_eq!(shared, 2);
}

#[test]
fn late_evening_utc_review_gets_one_date_from_both_strategies() {
    // 22:30 UTC is already past midnight on the storefront's clock.
    let feed_body = r#"{"feedbacks": [{
        "createdDate": "2024-01-10T22:30:00Z",
        "productValuation": 5,
        "text": "Пришла ночью, всё целое",
        "wbUserDetails": {"name": "Глеб"}
    }]}"#;
    let html = r#"<html><body><ul>
        <li class="comments__item">
          <p class="feedback__header">Глеб</p>
          <span class="feedback__date">11 января 2024, 01:30</span>
          <span class="star"></span><span class="star"></span><span class="star"></span>
          <span class="star"></span><span class="star"></span>
          <p class="feedback__text">Пришла ночью, всё целое</p>
        </li>
    </ul></body></html>"#;
    let today = NaiveDate::from_ymd_opt(2024, 1, 11).unwrap();

    let feed = parse_feed_page(feed_body.as_bytes(), DEFAULT_SOURCE_ZONE).unwrap();
    let rendered = parse_rendered_reviews(html, today, 0).unwrap();

    assert_eq!(feed.reviews.len(), 1);
    assert_eq!(rendered.reviews.len(), 1);
    assert_eq!(feed.reviews[0].date, ReviewDate::Known(today));
    assert_eq!(feed.reviews[0].identity_key(), rendered.reviews[0].identity_key());
}
