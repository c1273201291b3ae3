use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use proxy_harness_lib::assertions::{
    contains, equals, header_contains, status_is, AssertionFailure, SoftAssertions,
};
use proxy_harness_lib::error::HarnessError;
use proxy_harness_lib::ProbeResponse;

fn response(status: u16, headers: &[(&'static str, &'static str)], body: &str) -> ProbeResponse {
    let mut map = HeaderMap::new();
    for &(name, value) in headers {
        map.append(name, HeaderValue::from_static(value));
    }
    ProbeResponse {
        status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        headers: map,
        body: Bytes::from(body.to_string()),
    }
}

#[test]
fn contains_reports_needle_and_body() {
    assert!(contains(b"Request served by web-1", "served by web-1").is_ok());

    let failure = contains(b"503 Service Temporarily Unavailable", "web-1").unwrap_err();
    assert_eq!(failure.check, "contains");
    assert_eq!(failure.expected, "body containing \"web-1\"");
    assert_eq!(failure.actual, "\"503 Service Temporarily Unavailable\"");
}

#[test]
fn equals_compares_exact_bytes() {
    assert!(equals(b"hello", b"hello").is_ok());
    let failure = equals(b"hello\n", b"hello").unwrap_err();
    assert_eq!(failure.to_string(), "equals failed: expected \"hello\", actual \"hello\\n\"");
}

#[test]
fn status_mismatch_names_both_codes_and_body() {
    let resp = response(503, &[], "no backend");
    assert!(status_is(&resp, 503).is_ok());

    let failure = status_is(&resp, 200).unwrap_err();
    assert_eq!(failure.expected, "200 OK");
    assert!(failure.actual.starts_with("503 Service Unavailable"), "{}", failure.actual);
    assert!(failure.actual.contains("\"no backend\""));
}

#[test]
fn header_checks_every_value() {
    let resp = response(
        401,
        &[("www-authenticate", "Bearer"), ("www-authenticate", "Basic realm=\"Restricted\"")],
        "",
    );
    assert!(header_contains(&resp, "WWW-Authenticate", "Basic realm").is_ok());

    let missing = header_contains(&resp, "location", "new.example.com").unwrap_err();
    assert_eq!(missing.actual, "no location header");

    let wrong = header_contains(&resp, "www-authenticate", "Digest").unwrap_err();
    assert!(wrong.actual.contains("Basic realm"), "{}", wrong.actual);
}

#[test]
fn soft_assertions_collect_every_failure() {
    let resp = response(200, &[], "Request served by web-2");
    let mut soft = SoftAssertions::new();

    assert!(soft.check(status_is(&resp, 200)));
    assert!(!soft.check(contains(&resp.body, "web-1")));
    assert!(!soft.check(
        header_contains(&resp, "location", "/").map_err(|f| f.with_context("GET a.example.com/"))
    ));
    assert_eq!(soft.failures().len(), 2);

    let report = soft.finish().unwrap_err();
    let text = report.to_string();
    assert!(text.starts_with("2 assertion(s) failed"), "{text}");
    assert!(text.contains("\n  - contains failed"), "{text}");
    assert!(text.contains("header_contains failed (GET a.example.com/)"), "{text}");

    let err: HarnessError = report.into();
    assert!(matches!(err, HarnessError::AssertionReport(_)));
}

#[test]
fn empty_soft_run_passes() {
    assert!(SoftAssertions::new().finish().is_ok());
}

#[test]
fn failure_converts_into_harness_error() {
    let err: HarnessError = AssertionFailure::new("custom", "a", "b").into();
    assert_eq!(err.to_string(), "custom failed: expected a, actual b");
}
