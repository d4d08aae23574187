// Property-based tests for the pure building blocks: NLP scoring, streaks,
// signed export links and message templates.

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{Map, Value};
use uuid::Uuid;
use webqx_backend::export::{signed_download_url, verify_download};
use webqx_backend::models::render_template;
use webqx_backend::nlp_service::{current_streak, longest_streak, NlpService};

fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(offset)
}

proptest! {
    #[test]
    fn test_sentiment_stays_in_range(text in "[a-z ,.!]{0,200}") {
        let (score, _) = NlpService::new().sentiment(&text);
        prop_assert!((-1.0..=1.0).contains(&score));
    }

    #[test]
    fn test_urgency_stays_in_range(
        text in "[a-z ]{0,120}",
        mood in proptest::option::of(1i32..=5),
        pain in proptest::option::of(0i32..=10),
    ) {
        let analysis = NlpService::new().analyze(&text, mood, pain);
        prop_assert!((0.0..=1.0).contains(&analysis.urgency_score));
        prop_assert!(analysis.keywords.len() <= 10);
    }

    #[test]
    fn test_current_streak_never_exceeds_longest(
        offsets in proptest::collection::vec(0i64..60, 0..40),
        today_offset in 0i64..70,
    ) {
        let days: Vec<NaiveDate> = offsets.into_iter().map(day).collect();
        let today = day(today_offset);
        prop_assert!(current_streak(&days, today) <= longest_streak(&days));
        prop_assert!(longest_streak(&days) as usize <= days.len());
    }
}

proptest! {
    #[test]
    fn test_signed_link_verifies_until_expiry(ttl in 1i64..86_400, secret in "[A-Za-z0-9]{16,48}") {
        let export_id = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let (url, expires_at) = signed_download_url(&secret, export_id, ttl, now).unwrap();

        let query = url.split_once('?').unwrap().1;
        let mut expires = 0;
        let mut signature = "";
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", v)) => expires = v.parse().unwrap(),
                Some(("signature", v)) => signature = v,
                _ => {}
            }
        }

        prop_assert_eq!(expires, expires_at.timestamp());
        prop_assert!(verify_download(&secret, export_id, expires, signature, now));
        prop_assert!(!verify_download(&secret, Uuid::new_v4(), expires, signature, now));
        prop_assert!(!verify_download(&secret, export_id, expires, signature, expires_at + Duration::seconds(1)));
    }

    #[test]
    fn test_template_without_placeholders_is_unchanged(text in "[A-Za-z0-9 .,!?]{0,100}") {
        prop_assert_eq!(render_template(&text, &Map::new()).unwrap(), text);
    }

    #[test]
    fn test_template_substitutes_every_occurrence(name in "[a-z]{1,10}", value in "[A-Za-z ]{0,20}") {
        let mut vars = Map::new();
        vars.insert(name.clone(), Value::String(value.clone()));
        let template = format!("Hi {{{0}}}, bye {{{0}}}", name);
        prop_assert_eq!(render_template(&template, &vars).unwrap(), format!("Hi {0}, bye {0}", value));
    }
}
