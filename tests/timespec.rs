// tests/timespec.rs

use std::time::{Duration, Instant, SystemTime};

use expctl::errors::ExpctlError;
use expctl::exec::{TimeSpec, format_timestamp, parse_duration};

#[test]
fn relative_literals_use_their_unit() {
    assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    assert_eq!(parse_duration("10ms").unwrap(), Duration::from_millis(10));
    assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
    assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
}

#[test]
fn malformed_literals_are_rejected() {
    for bad in ["", "5", "s", "1.s", "-1s", "1 s", "1d", "abc"] {
        match parse_duration(bad) {
            Err(ExpctlError::InvalidTimeSpec(text)) => assert_eq!(text, bad),
            other => panic!("{bad:?}: expected InvalidTimeSpec, got {other:?}"),
        }
    }
}

#[test]
fn empty_and_zero_mean_now() {
    assert_eq!("".parse::<TimeSpec>().unwrap(), TimeSpec::Now);
    assert_eq!("0s".parse::<TimeSpec>().unwrap(), TimeSpec::Now);
    assert_eq!(
        "1.5s".parse::<TimeSpec>().unwrap(),
        TimeSpec::After(Duration::from_millis(1500))
    );
}

#[test]
fn absolute_timestamp_resolves_to_wall_clock() {
    let target = SystemTime::now() + Duration::from_secs(30);
    let literal = format_timestamp(target);
    assert_eq!(literal.len(), 20);

    let spec: TimeSpec = literal.parse().unwrap();
    let TimeSpec::At(at) = spec else {
        panic!("expected an absolute time, got {spec:?}");
    };
    let skew = match at.duration_since(target) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    assert!(skew < Duration::from_millis(1), "skew {skew:?}");

    let now = Instant::now();
    let deadline = spec.deadline_from(now);
    assert!(deadline > now + Duration::from_secs(29));
    assert!(deadline <= now + Duration::from_secs(31));
}

#[test]
fn absolute_timestamp_in_the_past_is_due_immediately() {
    let spec: TimeSpec = "20000101000000000000".parse().unwrap();
    let now = Instant::now();
    assert_eq!(spec.deadline_from(now), now);
}

#[test]
fn invalid_calendar_dates_are_rejected() {
    assert!("20241341000000000000".parse::<TimeSpec>().is_err());
}

#[test]
fn remaining_is_measured_from_the_reference_point() {
    let spec = TimeSpec::After(Duration::from_secs(2));
    let since = Instant::now();
    let now = since + Duration::from_millis(500);
    assert_eq!(spec.remaining(since, now), Duration::from_millis(1500));
    assert_eq!(
        spec.remaining(since, since + Duration::from_secs(3)),
        Duration::ZERO
    );
}

#[test]
fn oversized_delays_saturate_instead_of_overflowing() {
    let spec: TimeSpec = "4000000000000000h".parse().unwrap();
    let now = Instant::now();

    let deadline = spec.deadline_from(now);
    assert!(deadline > now + Duration::from_secs(86_400 * 365));
    assert!(spec.remaining(now, now) > Duration::from_secs(86_400 * 365));
}
