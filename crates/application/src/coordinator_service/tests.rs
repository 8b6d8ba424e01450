use std::sync::Arc;

use chrono::Utc;
use url::Url;

use tollgate_core::{AppError, RetryDirective};
use tollgate_domain::{EndpointCatalog, OperationSpecInput, ScopeKey};

use crate::admission_service::CoordinatorConfig;
use crate::coordination_ports::CoordinationStore;
use crate::test_support::{FakeCoordinationStore, FakeTransport, response};

use super::Coordinator;

fn parse(url: &str) -> Url {
    Url::parse(url).unwrap_or_else(|_| unreachable!())
}

fn coordinator(store: Arc<FakeCoordinationStore>) -> Coordinator {
    Coordinator::new(store, CoordinatorConfig::default())
}

fn catalog() -> EndpointCatalog {
    EndpointCatalog::from_inputs(
        "https://{server}.api.riotgames.com",
        vec![OperationSpecInput {
            name: "match_ids".to_owned(),
            path_template: "/lol/match/v5/matches/by-puuid/{puuid}/ids".to_owned(),
            allowed_statuses: Some(vec![200, 204]),
        }],
    )
    .unwrap_or_else(|_| unreachable!())
}

#[tokio::test]
async fn endpoints_are_created_once_per_route_target() {
    let coordinator = coordinator(Arc::new(FakeCoordinationStore::default()));

    let first = coordinator
        .resolve(&parse("https://euw1.api.riotgames.com/lol/match/v5/matches/EUW1_1"))
        .await
        .unwrap_or_else(|_| unreachable!());
    let second = coordinator
        .resolve(&parse("https://euw1.api.riotgames.com/lol/match/v5/matches/EUW1_2"))
        .await
        .unwrap_or_else(|_| unreachable!());
    let other_group = coordinator
        .resolve(&parse("https://euw1.api.riotgames.com/lol/league/v4/entries/by-summoner/x"))
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other_group));
    assert_eq!(first.target().group(), "/lol/match/v5/matches");
    assert_eq!(coordinator.endpoint_count().await, 2);
}

#[tokio::test]
async fn catalogued_operations_define_group_and_success_statuses() {
    let coordinator =
        coordinator(Arc::new(FakeCoordinationStore::default())).with_catalog(catalog());
    let url = coordinator
        .url_for("europe", "match_ids", &[("puuid", "abc")])
        .unwrap_or_else(|_| unreachable!());
    let transport = FakeTransport::returning(response(204, "", &[]));

    let endpoint = coordinator
        .resolve(&url)
        .await
        .unwrap_or_else(|_| unreachable!());
    let result = coordinator.request(&url, &transport).await;

    assert_eq!(endpoint.target().group(), "match_ids");
    assert!(result.is_ok());
}

#[tokio::test]
async fn url_building_requires_a_catalog() {
    let coordinator = coordinator(Arc::new(FakeCoordinationStore::default()));

    assert!(matches!(
        coordinator.url_for("europe", "match_ids", &[("puuid", "abc")]),
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn absolute_resume_time_gates_every_endpoint() {
    let coordinator = coordinator(Arc::new(FakeCoordinationStore::default()));
    let retry_at = Utc::now().timestamp() + 3_600;
    let body = format!("{{\"Retry-At\": {retry_at}}}");
    let throttling = FakeTransport::returning(response(430, body.as_str(), &[]));
    let healthy = FakeTransport::returning(response(200, "{}", &[]));

    let throttled = coordinator
        .request(
            &parse("https://euw1.api.riotgames.com/lol/match/v5/matches/EUW1_1"),
            &throttling,
        )
        .await;
    let gated = coordinator
        .request(
            &parse("https://euw1.api.riotgames.com/lol/league/v4/entries/by-summoner/x"),
            &healthy,
        )
        .await;

    assert!(matches!(
        throttled,
        Err(AppError::RemoteThrottled {
            retry: RetryDirective::At(_)
        })
    ));
    assert!(matches!(
        gated,
        Err(AppError::AdmissionBlocked { retry_after }) if retry_after.as_secs() > 3_000
    ));
    assert_eq!(healthy.calls(), 0);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_requests_to_realign() {
    let store = Arc::new(FakeCoordinationStore::default());
    let coordinator = Arc::new(coordinator(store.clone()));
    let transport = Arc::new(FakeTransport::gated(response(200, "{}", &[])));
    let url = parse("https://euw1.api.riotgames.com/lol/match/v5/matches/EUW1_1");

    let in_flight = {
        let coordinator = coordinator.clone();
        let transport = transport.clone();
        let url = url.clone();
        tokio::spawn(async move { coordinator.request(&url, transport.as_ref()).await })
    };
    while transport.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let shutdown = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.shutdown().await })
    };
    while !coordinator.context().is_shutting_down() {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        coordinator.request(&url, transport.as_ref()).await,
        Err(AppError::ShuttingDown)
    ));
    assert!(!shutdown.is_finished());

    transport.release();
    let completed = in_flight.await.unwrap_or_else(|_| unreachable!());
    assert!(completed.is_ok());
    assert!(shutdown.await.is_ok());

    let server = ScopeKey::server("ratelimiter", "euw1").unwrap_or_else(|_| unreachable!());
    assert_eq!(
        store.get_scope(&server).await.unwrap_or_default().as_deref(),
        Some("20:1,100:120")
    );
    assert_eq!(coordinator.context().in_flight(), 0);
}
