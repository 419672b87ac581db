//! Normalization of upstream date text into calendar dates.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use revwatch_core::ReviewDate;
use tracing::warn;

/// Zone the storefront renders its date labels in.
pub const DEFAULT_SOURCE_ZONE: Tz = chrono_tz::Europe::Moscow;

/// Years searched backwards for a yearless date; covers the gap between leap years.
const YEARLESS_LOOKBACK: i32 = 8;

const TODAY_MARKERS: &[&str] = &["сегодня", "today"];
const YESTERDAY_MARKERS: &[&str] = &["вчера", "yesterday"];

const RU_MONTHS_GENITIVE: [&str; 12] = [
    "января", "февраля", "марта", "апреля", "мая", "июня",
    "июля", "августа", "сентября", "октября", "ноября", "декабря",
];

const RU_MONTHS_NOMINATIVE: [&str; 12] = [
    "январь", "февраль", "март", "апрель", "май", "июнь",
    "июль", "август", "сентябрь", "октябрь", "ноябрь", "декабрь",
];

const EN_MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june",
    "july", "august", "september", "october", "november", "december",
];

/// Current calendar date in `zone`.
pub fn today_in(zone: Tz) -> NaiveDate {
    Utc::now().with_timezone(&zone).date_naive()
}

fn month_number(token: &str) -> Option<u32> {
    let token = token.trim_end_matches('.');
    let position = RU_MONTHS_GENITIVE
        .iter()
        .position(|m| *m == token)
        .or_else(|| RU_MONTHS_NOMINATIVE.iter().position(|m| *m == token))
        .or_else(|| {
            if token.chars().count() < 3 {
                return None;
            }
            EN_MONTHS.iter().position(|m| m.starts_with(token))
        })?;
    u32::try_from(position + 1).ok()
}

/// Parses the date label of a rendered review.
///
/// Accepted shapes: `Сегодня, 14:05` / `Вчера, 09:12` (and English
/// equivalents), `12 марта 2024, 14:05`, `12 марта, 14:05` (the latest
/// year in which that day exists and is not in the future), `12.03.2024`.
///
/// `today` must be the current date in the storefront's zone.
pub fn parse_rendered_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }
    if TODAY_MARKERS.iter().any(|m| lower.starts_with(m)) {
        return Some(today);
    }
    if YESTERDAY_MARKERS.iter().any(|m| lower.starts_with(m)) {
        return today.pred_opt();
    }

    let date_part = lower.split(',').next().unwrap_or_default().trim();
    if let Ok(date) = NaiveDate::parse_from_str(date_part, "%d.%m.%Y") {
        return Some(date);
    }

    let tokens: Vec<&str> = date_part.split_whitespace().collect();
    let day: u32 = tokens.first()?.parse().ok()?;
    let month = month_number(tokens.get(1)?)?;
    match tokens.get(2).and_then(|t| t.parse::<i32>().ok()) {
        Some(year) => NaiveDate::from_ymd_opt(year, month, day),
        None => (0..=YEARLESS_LOOKBACK)
            .map(|back| today.year() - back)
            .find_map(|year| NaiveDate::from_ymd_opt(year, month, day).filter(|date| *date <= today)),
    }
}

/// Like [`parse_rendered_date`], but keeps unparseable text instead of failing.
pub fn normalize_rendered_date(text: &str, today: NaiveDate) -> ReviewDate {
    match parse_rendered_date(text, today) {
        Some(date) => ReviewDate::Known(date),
        None => {
            warn!(date_text = text, "unrecognized rendered review date; keeping raw text");
            ReviewDate::Unparsed(text.trim().to_string())
        }
    }
}

/// Parses the ISO-8601 creation timestamp of a feed entry into a calendar
/// date in `zone`. Timestamps without an offset are taken as local to `zone`.
pub fn normalize_feed_timestamp(text: &str, zone: Tz) -> ReviewDate {
    let trimmed = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
        return ReviewDate::Known(ts.with_timezone(&zone).date_naive());
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return ReviewDate::Known(ts.date());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return ReviewDate::Known(date);
    }
    warn!(date_text = trimmed, "unrecognized feed timestamp; keeping raw text");
    ReviewDate::Unparsed(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn relative_labels_resolve_against_today() {
        let today = day(2024, 3, 1);
        assert_eq!(parse_rendered_date("Сегодня, 14:05", today), Some(today));
        assert_eq!(parse_rendered_date("Вчера, 23:59", today), Some(day(2024, 2, 29)));
        assert_eq!(parse_rendered_date("yesterday, 10:00", today), Some(day(2024, 2, 29)));
    }

    #[test]
    fn absolute_labels_with_and_without_year() {
        let today = day(2024, 3, 1);
        assert_eq!(parse_rendered_date("12 января 2023, 14:05", today), Some(day(2023, 1, 12)));
        assert_eq!(parse_rendered_date("5 February 2022, 08:00", today), Some(day(2022, 2, 5)));
        assert_eq!(parse_rendered_date("27 февраля, 10:30", today), Some(day(2024, 2, 27)));
        // A yearless date after today belongs to last year.
        assert_eq!(parse_rendered_date("15 декабря, 10:30", today), Some(day(2023, 12, 15)));
        assert_eq!(parse_rendered_date("07.11.2021", today), Some(day(2021, 11, 7)));
    }

    #[test]
    fn yearless_leap_day_falls_back_to_the_last_leap_year() {
        let today = day(2025, 3, 1);
        assert_eq!(parse_rendered_date("29 февраля, 10:30", today), Some(day(2024, 2, 29)));
        assert_eq!(parse_rendered_date("28 февраля, 10:30", today), Some(day(2025, 2, 28)));
    }

    #[test]
    fn garbage_is_kept_as_text() {
        let today = day(2024, 3, 1);
        assert_eq!(parse_rendered_date("неделю назад", today), None);
        assert_eq!(parse_rendered_date("31 февраля 2024", today), None);
        assert_eq!(
            normalize_rendered_date(" неделю назад ", today),
            ReviewDate::Unparsed("неделю назад".into())
        );
    }

    #[test]
    fn feed_timestamps_accept_offsets_and_naive_forms() {
        let zone = DEFAULT_SOURCE_ZONE;
        assert_eq!(
            normalize_feed_timestamp("2024-01-10T20:15:00Z", zone),
            ReviewDate::Known(day(2024, 1, 10))
        );
        assert_eq!(
            normalize_feed_timestamp("2024-01-12T08:01:02.123", zone),
            ReviewDate::Known(day(2024, 1, 12))
        );
        assert_eq!(
            normalize_feed_timestamp("last tuesday", zone),
            ReviewDate::Unparsed("last tuesday".into())
        );
    }

    #[test]
    fn late_evening_utc_timestamps_land_on_the_storefront_day() {
        assert_eq!(
            normalize_feed_timestamp("2024-01-10T22:30:00Z", DEFAULT_SOURCE_ZONE),
            ReviewDate::Known(day(2024, 1, 11))
        );
        assert_eq!(
            normalize_feed_timestamp("2024-01-10T22:30:00Z", chrono_tz::UTC),
            ReviewDate::Known(day(2024, 1, 10))
        );
        assert_eq!(
            normalize_feed_timestamp("2024-01-11T01:30:00+03:00", DEFAULT_SOURCE_ZONE),
            ReviewDate::Known(day(2024, 1, 11))
        );
    }
}
