//! Engine query surface and student workflows

use netdrill_common::{
    CityStatus, LinkId, LinkMetrics, LinkStatus, MetricKind, RawSample, Role, Severity,
};
use netdrill_engine::config::{EngineConfig, SimulationConfig};
use netdrill_engine::engine::DifficultyLevel;
use netdrill_engine::hub::SessionData;
use netdrill_engine::{PushEvent, SimError, SimulationEngine};
use std::time::Duration;

fn engine() -> SimulationEngine {
    let config = EngineConfig {
        simulation: SimulationConfig {
            seed: Some(99),
            ..SimulationConfig::default()
        },
        ..EngineConfig::default()
    };
    SimulationEngine::new(config).unwrap()
}

fn reference_sample() -> RawSample {
    RawSample {
        latencies: Some(vec![80.0, 100.0, 120.0]),
        load: Some(85.0),
        sent: Some(1000.0),
        received: Some(950.0),
        processed: Some(950.0),
        bandwidth_usage: Some(50.0),
        ..RawSample::default()
    }
}

#[tokio::test]
async fn test_reference_sample_raises_single_load_warning() {
    let engine = engine();
    let submission = engine.submit_metrics("PAR", &reference_sample()).await.unwrap();

    let metrics = submission.processed.metrics;
    assert_eq!(metrics.average_latency, 100.0);
    assert!((metrics.packet_loss - 0.05).abs() < 1e-12);

    let anomalies = submission.processed.anomalies;
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].metric_type, MetricKind::Load);
    assert_eq!(anomalies[0].severity, Severity::Warning);
    assert_eq!(anomalies[0].threshold_crossed, 80.0);

    let view = engine.network_state().await;
    assert_eq!(view.alerts.len(), 1);
    assert_eq!(view.alerts[0].city_id, "PAR");
}

#[tokio::test]
async fn test_network_state_carries_last_ten_alerts() {
    let engine = engine();
    for _ in 0..15 {
        engine.submit_metrics("PAR", &reference_sample()).await.unwrap();
    }
    let view = engine.network_state().await;
    assert_eq!(view.alerts.len(), 10);

    let teacher = engine.teacher_metrics().await;
    assert_eq!(teacher.alerts.len(), 15);
    assert_eq!(view.alerts.last(), teacher.alerts.last());
}

#[tokio::test]
async fn test_teacher_metrics_aggregates() {
    let engine = engine();
    let (_, _student_rx) = engine
        .connect(
            Role::Student,
            SessionData {
                student_id: Some("alice".to_string()),
                city_id: None,
            },
        )
        .await
        .unwrap();
    engine.submit_metrics("PAR", &reference_sample()).await.unwrap();

    let snapshot = engine.store().snapshot().await;
    let expected_latency: f64 =
        snapshot.cities.iter().map(|c| c.metrics.latency).sum::<f64>() / snapshot.cities.len() as f64;

    let metrics = engine.teacher_metrics().await;
    assert_eq!(metrics.active_students, 1);
    assert_eq!(metrics.total_traffic, 50.0);
    assert!((metrics.average_latency - expected_latency).abs() < 1e-9);
    assert_eq!(metrics.active_connections, engine.topology().links().len());
    assert!(metrics.scenario.is_none());
}

#[tokio::test]
async fn test_student_init_assigns_in_topology_order_until_exhausted() {
    let engine = engine();
    let first = engine.init_student("s-0").await.unwrap();
    assert_eq!(first.city_id, "PAR");
    assert_eq!(first.neighbors, vec!["LON", "FRA", "NYC", "LOS"]);
    assert_eq!(engine.init_student("s-0").await.unwrap().city_id, "PAR");

    for i in 1..18 {
        engine.init_student(&format!("s-{i}")).await.unwrap();
    }
    assert!(matches!(
        engine.init_student("s-18").await,
        Err(SimError::NoCitiesAvailable)
    ));
}

#[tokio::test]
async fn test_student_session_gets_initial_frame_only() {
    let engine = engine();
    let (_, mut rx) = engine
        .connect(Role::Student, SessionData::default())
        .await
        .unwrap();

    assert!(matches!(rx.try_recv(), Ok(PushEvent::NetworkState(_))));
    assert!(rx.try_recv().is_err(), "teacher metrics go to teachers only");
}

#[tokio::test]
async fn test_neighbors_include_link_state() {
    let engine = engine();
    let neighbors = engine.neighbors("PAR").await.unwrap();
    let ids: Vec<&str> = neighbors.iter().map(|n| n.city_id.as_str()).collect();
    assert_eq!(ids, vec!["LON", "FRA", "NYC", "LOS"]);
    assert!(neighbors.iter().all(|n| n.link.status == LinkStatus::Active));

    assert!(engine.are_neighbors("NYC", "PAR"));
    assert!(!engine.are_neighbors("PAR", "AKL"));
    assert!(matches!(engine.neighbors("ZZZ").await, Err(SimError::CityNotFound(_))));
}

#[tokio::test]
async fn test_transmit_message_rules() {
    let engine = engine();
    let payload = serde_json::json!({ "body": "ping" });

    match engine.transmit_message("PAR", "SYD", &payload).await {
        Err(SimError::TargetNotNeighbor { city, target }) => {
            assert_eq!(city, "PAR");
            assert_eq!(target, "SYD");
        }
        other => panic!("expected TargetNotNeighbor, got {other:?}"),
    }

    // Lossless link always delivers
    let lossless = LinkMetrics {
        latency: 7.0,
        bandwidth: 10000.0,
        packet_loss: 0.0,
    };
    engine.update_link_metrics("PAR", "LON", lossless).await.unwrap();
    let receipt = engine.transmit_message("PAR", "LON", &payload).await.unwrap();
    assert!(receipt.delivered);
    assert_eq!(receipt.latency, 7.0);

    // Total loss never delivers
    engine
        .update_link_metrics("PAR", "LON", LinkMetrics { packet_loss: 1.0, ..lossless })
        .await
        .unwrap();
    let receipt = engine.transmit_message("PAR", "LON", &payload).await.unwrap();
    assert!(!receipt.delivered);
    assert_eq!(receipt.reason.as_deref(), Some("packet lost"));

    engine.store().set_city_status("LON", CityStatus::Offline).await.unwrap();
    let receipt = engine.transmit_message("PAR", "LON", &payload).await.unwrap();
    assert_eq!(receipt.reason.as_deref(), Some("city offline"));

    engine.store().set_city_status("LON", CityStatus::Online).await.unwrap();
    engine
        .store()
        .set_link_status(&LinkId::between("PAR", "LON"), LinkStatus::Down)
        .await
        .unwrap();
    let receipt = engine.transmit_message("PAR", "LON", &payload).await.unwrap();
    assert_eq!(receipt.reason.as_deref(), Some("link down"));
}

#[tokio::test]
async fn test_update_link_metrics_pushes_and_validates() {
    let engine = engine();
    let (_, mut rx) = engine
        .connect(Role::Teacher, SessionData::default())
        .await
        .unwrap();
    while rx.try_recv().is_ok() {}

    let metrics = LinkMetrics {
        latency: 42.0,
        bandwidth: 100.0,
        packet_loss: 0.2,
    };
    let link = engine.update_link_metrics("LON", "PAR", metrics).await.unwrap();
    assert_eq!(link.id, LinkId::between("PAR", "LON"));

    match rx.try_recv() {
        Ok(PushEvent::ConnectionMetrics(update)) => assert_eq!(update.metrics, metrics),
        other => panic!("expected connection:metrics, got {other:?}"),
    }

    assert!(matches!(
        engine.update_link_metrics("PAR", "SYD", metrics).await,
        Err(SimError::LinkNotFound(_))
    ));
    assert!(matches!(
        engine
            .update_link_metrics("PAR", "LON", LinkMetrics { latency: f64::NAN, ..metrics })
            .await,
        Err(SimError::InvalidMetrics(_))
    ));
}

#[tokio::test]
async fn test_history_and_network_report() {
    let engine = engine();
    engine.submit_metrics("PAR", &reference_sample()).await.unwrap();

    let history = engine.city_history("PAR", Duration::from_secs(900)).unwrap();
    assert_eq!(history.summary.samples, 1);
    assert_eq!(history.summary.max_load, 85.0);
    // city_metrics plus the load anomaly
    assert_eq!(history.points.len(), 2);

    let report = engine.network_report(Duration::from_secs(3600));
    assert_eq!(report.summary.active_nodes, 1);
    assert_eq!(report.recommendations.len(), 1);
    assert_eq!(report.recommendations[0].recommendation_type, "load_balancing");

    assert!(matches!(
        engine.city_history("ZZZ", Duration::from_secs(60)),
        Err(SimError::CityNotFound(_))
    ));
}

#[tokio::test]
async fn test_city_hints_follow_live_metrics() {
    let engine = engine();
    let calm = engine.city_hints("PAR").await.unwrap();
    assert_eq!(calm.difficulty, DifficultyLevel::Easy);
    assert!(calm.hints.is_empty());

    let overloaded = RawSample {
        latencies: Some(vec![180.0]),
        load: Some(95.0),
        ..reference_sample()
    };
    engine.submit_metrics("PAR", &overloaded).await.unwrap();
    let stressed = engine.city_hints("PAR").await.unwrap();
    assert_eq!(stressed.difficulty, DifficultyLevel::Hard);
    assert_eq!(stressed.factors, 2);
    assert_eq!(stressed.hints.len(), 2);
}

#[tokio::test]
async fn test_invalid_configuration_is_rejected() {
    let mut config = EngineConfig::default();
    config.alerts.capacity = 0;
    assert!(matches!(SimulationEngine::new(config), Err(SimError::Config(_))));
}
