// Calendar fetcher behaviour against a mock publishing service

use common::calendar::{CalendarFetcher, CalendarSource};
use common::config::SourceConfig;
use common::models::{Entity, EntityKind, FetchOutcome, NaturalKey};
use common::retry::FixedDelay;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CALENDAR: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:1@plan\r\nDTSTART:20241007T080000\r\nDTEND:20241007T093000\r\nSUMMARY:Analiza (W): dr Jan Kowalski\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
const EMPTY_CALENDAR: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nEND:VCALENDAR\r\n";
const HTML: &str = "<!DOCTYPE html><html><body>Brak planu</body></html>";

fn source_config(base_url: &str, entity_timeout_seconds: u64) -> SourceConfig {
    SourceConfig {
        base_url: base_url.to_string(),
        client_hint: "GG".to_string(),
        semester: Some(1),
        request_timeout_seconds: 5,
        entity_timeout_seconds,
        user_agent: "plan-sync-test".to_string(),
    }
}

fn fetcher(base_url: &str) -> CalendarFetcher {
    CalendarFetcher::new(
        &source_config(base_url, 30),
        Arc::new(FixedDelay::new(Duration::from_millis(5), 3)),
    )
    .unwrap()
}

fn group(key: &str) -> Entity {
    Entity::new(EntityKind::Group, NaturalKey::new(key).unwrap(), "21INF-SP")
}

#[tokio::test]
async fn fallback_skips_html_and_accepts_next_calendar() {
    let server = MockServer::start().await;

    // plain and authenticated request both answer with a page
    Mock::given(method("GET"))
        .and(path("/plan/a.ics"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HTML))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("ID", "27341"))
        .and(query_param("S", "1"))
        .and(header("User-Agent", "plan-sync-test"))
        .and(header("Referer", format!("{}/", server.uri()).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALENDAR))
        .expect(1)
        .mount(&server)
        .await;

    let mut entity = group("27341");
    entity.calendar_url = Some(format!("{}/plan/a.ics", server.uri()));

    let document = fetcher(&server.uri()).fetch(&entity).await;

    assert_eq!(document.outcome, FetchOutcome::Success);
    assert!(document.body.starts_with("BEGIN:VCALENDAR"));
    assert!(document.source_url.unwrap().contains("S=1"));
    assert_eq!(document.attempts, 3);
    server.verify().await;
}

#[tokio::test]
async fn not_found_advances_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALENDAR))
        .expect(1)
        .mount(&server)
        .await;

    let document = fetcher(&server.uri()).fetch(&group("27341")).await;

    assert_eq!(document.outcome, FetchOutcome::Success);
    assert_eq!(document.attempts, 2);
    server.verify().await;
}

#[tokio::test]
async fn server_errors_are_retried_on_the_same_candidate() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALENDAR))
        .expect(1)
        .mount(&server)
        .await;

    let document = fetcher(&server.uri()).fetch(&group("27341")).await;

    assert_eq!(document.outcome, FetchOutcome::Success);
    assert_eq!(document.attempts, 3);
    server.verify().await;
}

#[tokio::test]
async fn exhausted_retries_end_in_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "0"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param_is_missing("S"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HTML))
        .expect(2)
        .mount(&server)
        .await;

    let document = fetcher(&server.uri()).fetch(&group("27341")).await;

    assert_eq!(document.outcome, FetchOutcome::Error);
    assert!(document.body.is_empty());
    assert_eq!(document.attempts, 6);
    server.verify().await;
}

#[tokio::test]
async fn no_valid_candidate_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/nauczyciel_ics.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HTML))
        .expect(6)
        .mount(&server)
        .await;

    let entity = Entity::new(EntityKind::Instructor, NaturalKey::new("501").unwrap(), "dr X");
    let document = fetcher(&server.uri()).fetch(&entity).await;

    assert_eq!(document.outcome, FetchOutcome::NotFound);
    assert!(document.source_url.is_none());
    server.verify().await;
}

#[tokio::test]
async fn calendar_without_events_is_empty() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EMPTY_CALENDAR))
        .expect(1)
        .mount(&server)
        .await;

    let document = fetcher(&server.uri()).fetch(&group("27341")).await;
    assert_eq!(document.outcome, FetchOutcome::Empty);
}

#[tokio::test]
async fn page_instead_of_calendar_is_retried_with_authentication() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .and(query_param_is_missing("authenticate"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HTML))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .and(query_param("authenticate", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALENDAR))
        .expect(1)
        .mount(&server)
        .await;

    let document = fetcher(&server.uri()).fetch(&group("27341")).await;

    assert_eq!(document.outcome, FetchOutcome::Success);
    assert!(document.source_url.unwrap().ends_with("authenticate=true"));
    assert_eq!(document.attempts, 2);
    server.verify().await;
}

#[tokio::test]
async fn site_session_is_primed_once_and_its_cookie_sent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "PHPSESSID=plan42; Path=/")
                .set_body_string(HTML),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(header("cookie", "PHPSESSID=plan42"))
        .respond_with(ResponseTemplate::new(200).set_body_string(CALENDAR))
        .expect(2)
        .mount(&server)
        .await;

    let fetcher = fetcher(&server.uri());
    let first = fetcher.fetch(&group("27341")).await;
    let second = fetcher.fetch(&group("27342")).await;

    assert_eq!(first.outcome, FetchOutcome::Success);
    assert_eq!(second.outcome, FetchOutcome::Success);
    server.verify().await;
}

#[tokio::test]
async fn timeout_reports_attempts_already_made() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .and(query_param("S", "0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(CALENDAR)
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let fetcher = CalendarFetcher::new(
        &source_config(&server.uri(), 1),
        Arc::new(FixedDelay::new(Duration::from_millis(5), 3)),
    )
    .unwrap();
    let document = fetcher.fetch(&group("27341")).await;

    assert_eq!(document.outcome, FetchOutcome::Error);
    assert_eq!(document.attempts, 2);
}

#[tokio::test]
async fn slow_entity_is_abandoned_with_error() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/grupy_ics.php"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(CALENDAR)
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let fetcher = CalendarFetcher::new(
        &source_config(&server.uri(), 1),
        Arc::new(FixedDelay::new(Duration::from_millis(5), 3)),
    )
    .unwrap();
    let document = fetcher.fetch(&group("27341")).await;

    assert_eq!(document.outcome, FetchOutcome::Error);
    assert_eq!(document.attempts, 1);
}

#[test]
fn candidate_urls_are_unique_and_keyed() {
    let fetcher = fetcher("https://plan.example.edu");

    proptest!(|(key in "[0-9]{1,6}", explicit in proptest::option::of("[a-z]{1,8}\\.ics"))| {
        let mut entity = group(&key);
        entity.calendar_url = explicit.clone();

        let urls = fetcher.candidate_urls(&entity);
        let unique: HashSet<&String> = urls.iter().collect();

        prop_assert_eq!(unique.len(), urls.len());
        prop_assert_eq!(urls.len(), if explicit.is_some() { 4 } else { 3 });
        let id_param = format!("ID={}", key);
        prop_assert!(urls.iter().skip(urls.len() - 3).all(|u| u.contains(&id_param)));
    });
}
