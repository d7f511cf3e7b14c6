use earthdata_sync::domain::{BoundingBox, ConceptId, Timestamp};

#[test]
fn timestamp_round_trips_through_marker_text() {
    let ts: Timestamp = "2021-03-10T00:00:00Z".parse().unwrap();
    assert_eq!(ts.to_string(), "2021-03-10T00:00:00Z");
    let json = serde_json::to_string(&ts).unwrap();
    assert_eq!(json, "\"2021-03-10T00:00:00Z\"");
}

#[test]
fn lookback_from_midnight_lands_on_previous_day() {
    let now: Timestamp = "2021-03-11T00:00:00Z".parse().unwrap();
    assert_eq!(now.minus_minutes(60).to_string(), "2021-03-10T23:00:00Z");
}

#[test]
fn timestamps_order_chronologically() {
    let earlier: Timestamp = "2021-03-10T23:59:59Z".parse().unwrap();
    let later: Timestamp = "2021-03-11T00:00:00Z".parse().unwrap();
    assert!(earlier < later);
}

#[test]
fn bounding_box_display_matches_cmr_parameter() {
    let bbox: BoundingBox = " -10.5, -20 ,30,40 ".parse().unwrap();
    assert_eq!(bbox.to_string(), "-10.5,-20,30,40");
}

#[test]
fn concept_id_is_trimmed() {
    let id: ConceptId = " C1968979997-POCLOUD ".parse().unwrap();
    assert_eq!(id.as_str(), "C1968979997-POCLOUD");
    assert!("G1968979997-POCLOUD".parse::<ConceptId>().is_err());
}
