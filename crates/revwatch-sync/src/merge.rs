use std::cmp::Reverse;
use std::collections::HashSet;

use revwatch_core::{Review, ReviewKey};

/// Combines two review sets into one, newest first.
///
/// Reviews sharing an identity key collapse to the first copy seen, scanning
/// `primary` before `secondary`. The sort is stable, so same-day reviews keep
/// their relative input order. Reviews with unparsed dates sort last.
pub fn merge_reviews(primary: Vec<Review>, secondary: Vec<Review>) -> Vec<Review> {
    let mut seen: HashSet<ReviewKey> = HashSet::with_capacity(primary.len() + secondary.len());
    let mut merged: Vec<Review> = primary
        .into_iter()
        .chain(secondary)
        .filter(|review| seen.insert(review.identity_key()))
        .collect();
    merged.sort_by_key(|review| Reverse(review.date.clone()));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use revwatch_core::{ReviewDate, SourceTag};

    fn review(date: &str, rating: u8, author: &str, text: &str, source: SourceTag) -> Review {
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map(ReviewDate::Known)
            .unwrap_or_else(|_| ReviewDate::Unparsed(date.to_string()));
        Review {
            date,
            rating,
            text: text.into(),
            author_name: author.into(),
            color: None,
            size: None,
            source,
        }
    }

    fn keys(reviews: &[Review]) -> HashSet<ReviewKey> {
        reviews.iter().map(Review::identity_key).collect()
    }

    #[test]
    fn overlapping_sources_merge_newest_first() {
        let primary = vec![review("2024-01-10", 5, "A", "x", SourceTag::Primary)];
        let secondary = vec![
            review("2024-01-10", 5, "A", "x", SourceTag::Secondary),
            review("2024-01-12", 3, "B", "y", SourceTag::Secondary),
        ];

        let merged = merge_reviews(primary, secondary);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].date.known(), NaiveDate::from_ymd_opt(2024, 1, 12));
        assert_eq!(merged[1].date.known(), NaiveDate::from_ymd_opt(2024, 1, 10));
        // First-seen copy wins.
        assert_eq!(merged[1].source, SourceTag::Primary);
    }

    #[test]
    fn merging_a_set_with_itself_is_identity() {
        let set = vec![
            review("2024-01-12", 3, "B", "y", SourceTag::Primary),
            review("2024-01-10", 5, "A", "x", SourceTag::Primary),
            review("2024-01-10", 4, "C", "z", SourceTag::Primary),
        ];
        let merged = merge_reviews(set.clone(), set.clone());
        assert_eq!(merged, set);
    }

    #[test]
    fn content_does_not_depend_on_which_side_is_primary() {
        let left = vec![
            review("2024-01-10", 5, "A", "x", SourceTag::Primary),
            review("2024-01-11", 2, "D", "w", SourceTag::Primary),
        ];
        let right = vec![
            review("2024-01-12", 3, "B", "y", SourceTag::Secondary),
            review("2023-12-30", 1, "E", "v", SourceTag::Secondary),
        ];
        let forward = merge_reviews(left.clone(), right.clone());
        let backward = merge_reviews(right, left);
        assert_eq!(keys(&forward), keys(&backward));
        assert_eq!(forward.len(), 4);
    }

    #[test]
    fn unparsed_dates_trail_and_still_dedupe() {
        let merged = merge_reviews(
            vec![review("на прошлой неделе", 4, "V", "ok", SourceTag::Primary)],
            vec![
                review("2024-01-10", 5, "A", "x", SourceTag::Secondary),
                review("На прошлой  неделе", 4, "V", "ok", SourceTag::Secondary),
            ],
        );
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].author_name, "A");
        assert!(merged[1].date.known().is_none());
    }

    #[test]
    fn empty_inputs_merge_to_empty() {
        assert!(merge_reviews(Vec::new(), Vec::new()).is_empty());
    }
}
