//! Catalog index: refresh, ranking, listing, staleness and availability.

mod common;

use common::*;
use opendata_client::{Availability, ClientError, Clock};
use opendata_client::types::CatalogTableRecord;
use opendata_core::{DatasetStatus, SearchField, SourceOrigin};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn catalog() -> Vec<CatalogTableRecord> {
    let mut partner = catalog_record("50012NED", "Zorggebruik; ziekenhuizen", "Bevolking in zorg");
    partner.catalog = Some("RIVM".to_string());
    let mut discontinued = catalog_record("37296ned", "Bevolking; vanaf 1899", "Historische reeks");
    discontinued.output_status = Some("Gediscontinueerd".to_string());
    vec![
        catalog_record("85313NED", "Bevolking; kerncijfers", "Kerncijfers over de bevolking"),
        catalog_record("83765NED", "Kerncijfers wijken en buurten", "Regionale kerncijfers"),
        partner,
        discontinued,
    ]
}

async fn refreshed() -> Harness {
    let h = harness(population_upstream(0).with_catalog(catalog())).await;
    assert_eq!(h.od.catalog().refresh().await.unwrap(), 4);
    h
}

#[tokio::test]
async fn test_refresh_persists_snapshot() {
    let h = refreshed().await;

    let info = h.od.catalog().snapshot_info().await.unwrap();
    assert_eq!(info.count, 4);
    assert_eq!(info.refreshed_at, Some(h.clock.now()));

    let partner = h.od.catalog().get("50012NED").await.unwrap();
    assert_eq!(partner.source, SourceOrigin::CbsPartner);
    let old = h.od.catalog().get("37296ned").await.unwrap();
    assert_eq!(old.status, DatasetStatus::Discontinued);
}

#[tokio::test]
async fn test_search_ranks_title_above_summary() {
    let h = refreshed().await;

    let hits = h
        .od
        .catalog()
        .search("BEVOLKING", SearchField::Both, 10)
        .await
        .unwrap();

    let ids: Vec<&str> = hits.iter().map(|d| d.identifier.as_str()).collect();
    // Title and summary, then title only, then summary only.
    assert_eq!(ids, vec!["85313NED", "37296ned", "50012NED"]);
}

#[tokio::test]
async fn test_search_is_repeatable_and_offline() {
    let h = refreshed().await;
    let requests = h.upstream.catalog_requests.load(Ordering::SeqCst);

    let first = h.od.catalog().search("kerncijfers", SearchField::Both, 10).await.unwrap();
    let second = h.od.catalog().search("kerncijfers", SearchField::Both, 10).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
    assert_eq!(h.upstream.catalog_requests.load(Ordering::SeqCst), requests);
}

#[tokio::test]
async fn test_search_field_restriction_and_limit() {
    let h = refreshed().await;

    let titles = h.od.catalog().search("bevolking", SearchField::Title, 10).await.unwrap();
    assert_eq!(titles.len(), 2);

    let summaries = h.od.catalog().search("bevolking", SearchField::Summary, 10).await.unwrap();
    let ids: Vec<&str> = summaries.iter().map(|d| d.identifier.as_str()).collect();
    assert_eq!(ids, vec!["50012NED", "85313NED"]);

    let limited = h.od.catalog().search("bevolking", SearchField::Both, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn test_blank_search_rejected() {
    let h = refreshed().await;

    let err = h.od.catalog().search("   ", SearchField::Both, 10).await.unwrap_err();

    assert!(matches!(err, ClientError::Validation(_)));
}

#[tokio::test]
async fn test_get_unknown_is_not_found() {
    let h = refreshed().await;

    let err = h.od.catalog().get("99999NED").await.unwrap_err();

    assert!(matches!(err, ClientError::NotFound(_)));
}

#[tokio::test]
async fn test_list_pages_in_identifier_order() {
    let h = refreshed().await;

    let page: Vec<String> = h
        .od
        .catalog()
        .list(1, 2)
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.identifier)
        .collect();

    assert_eq!(page, vec!["50012NED", "83765NED"]);
}

#[tokio::test]
async fn test_refresh_replaces_previous_snapshot() {
    let h = refreshed().await;
    h.upstream
        .replace_catalog(vec![catalog_record("84583NED", "Nieuw", "Nieuwe tabel")]);

    assert_eq!(h.od.catalog().refresh().await.unwrap(), 1);

    assert!(h.od.catalog().get("85313NED").await.is_err());
    assert!(h.od.catalog().get("84583NED").await.is_ok());
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_snapshot() {
    let h = refreshed().await;
    let mut broken = catalog_record("84583NED", "Nieuw", "Nieuwe tabel");
    broken.identifier = None;
    h.upstream.replace_catalog(vec![broken]);

    let err = h.od.catalog().refresh().await.unwrap_err();

    assert!(matches!(err, ClientError::Schema { .. }));
    assert_eq!(h.od.catalog().snapshot_info().await.unwrap().count, 4);
}

#[tokio::test]
async fn test_search_during_refresh_sees_whole_snapshot() {
    let h = refreshed().await;
    let mut next = catalog();
    next.push(catalog_record("84000NED", "Bevolking; extra", "Extra"));
    h.upstream.replace_catalog(next);

    let (refresh, hits) = tokio::join!(
        h.od.catalog().refresh(),
        h.od.catalog().search("bevolking", SearchField::Both, 10)
    );

    assert_eq!(refresh.unwrap(), 5);
    let n = hits.unwrap().len();
    assert!(n == 3 || n == 4, "mixed snapshot: {} hits", n);
}

#[tokio::test]
async fn test_staleness() {
    let h = harness(population_upstream(0).with_catalog(catalog())).await;
    assert!(h.od.catalog().is_stale().await.unwrap());

    h.od.catalog().refresh().await.unwrap();
    assert!(!h.od.catalog().is_stale().await.unwrap());

    h.clock.advance(Duration::from_secs(25 * 60 * 60));
    assert!(h.od.catalog().is_stale().await.unwrap());
}

#[tokio::test]
async fn test_availability() {
    let h = refreshed().await;

    assert_eq!(
        h.od.catalog().check_availability("85313NED").await.unwrap(),
        Availability::Indexed
    );
    // Not in the catalog, but the data service knows it.
    let upstream = population_upstream(0);
    let unindexed = harness(upstream).await;
    assert_eq!(
        unindexed.od.catalog().check_availability(POPULATION).await.unwrap(),
        Availability::Queryable
    );
    assert_eq!(
        h.od.catalog().check_availability("00000ABC").await.unwrap(),
        Availability::Unavailable
    );
}

#[tokio::test]
async fn test_download_only_dataset_found_on_portal() {
    let upstream = ScriptedUpstream::new().with_package(
        "groningen-parkeervakken",
        "Parkeervakken Groningen",
        &[
            ("vakken.csv", "CSV", "https://data.example.test/vakken.csv"),
            ("vakken.geojson", "GeoJSON", "https://data.example.test/vakken.geojson"),
        ],
    );
    let h = harness(upstream).await;

    assert_eq!(
        h.od
            .catalog()
            .check_availability("groningen-parkeervakken")
            .await
            .unwrap(),
        Availability::DownloadOnly
    );
    assert_eq!(Availability::DownloadOnly.to_string(), "download_only");
    assert_eq!(h.upstream.package_requests.load(Ordering::SeqCst), 1);

    // Queryable datasets never reach the portal.
    let h = harness(population_upstream(0)).await;
    assert_eq!(
        h.od.catalog().check_availability(POPULATION).await.unwrap(),
        Availability::Queryable
    );
    assert_eq!(h.upstream.package_requests.load(Ordering::SeqCst), 0);
}
