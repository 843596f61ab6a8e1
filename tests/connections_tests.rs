//! Connections file → registry → compute.

use std::fs;
use std::path::{Path, PathBuf};

use metriq::prelude::*;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("metriq-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn write_events(dir: &Path) -> PathBuf {
    let path = dir.join("events.csv");
    fs::write(
        &path,
        "country,amount,clicks,impressions,event_date\n\
         US,10.5,1,10,2024-01-05\n\
         US,,2,20,2024-01-10\n\
         EU,4,3,0,2024-01-20\n",
    )
    .expect("write csv");
    path
}

#[tokio::test]
async fn memory_backend_from_yaml_with_env_substitution() {
    let dir = scratch_dir("env");
    write_events(&dir);
    let yaml = "memory:\n  tables:\n    events: ${DATA_DIR}/events.csv\n";
    let data_dir = dir.display().to_string();
    let cfg = ConnectionsConfig::from_yaml_str_with(yaml, "connections.yaml", |var| {
        (var == "DATA_DIR").then(|| data_dir.clone())
    })
    .unwrap();
    let registry = cfg.into_registry(&BuiltinFactory).unwrap();
    assert_eq!(registry.backends(), vec!["memory"]);

    let engine = MetricEngine::new(registry, EngineConfig::default());
    let request = ComputeRequest::new(vec![
        MetricSpec::new("revenue", "memory://local/events", AggregationKind::Sum, "amount"),
        MetricSpec::ratio("ctr", "memory://local/events", "clicks", "impressions"),
    ])
    .with_slices(vec![SliceSpec::new(
        "country",
        vec![
            SliceValue::new("US", "country = 'US'"),
            SliceValue::new("EU", "country = 'EU'"),
        ],
    )]);
    let out = engine.compute(&request).await.unwrap();
    let values: Vec<Option<f64>> = out.table.rows.iter().map(|r| r.metric_value).collect();
    // Empty CSV fields are NULL and skipped by SUM; EU has no impressions.
    assert_eq!(values, vec![Some(10.5), Some(4.0), Some(0.1), None]);

    engine.close().await.unwrap();
    fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn engine_builds_registry_from_config_path() {
    let dir = scratch_dir("path");
    let csv = write_events(&dir);
    let yaml_path = dir.join("connections.yaml");
    fs::write(
        &yaml_path,
        format!("memory:\n  tables:\n    events: {}\n", csv.display()),
    )
    .unwrap();

    let config = EngineConfig {
        connections_path: Some(yaml_path.display().to_string()),
        ..EngineConfig::default()
    };
    let engine = MetricEngine::from_config(config, &BuiltinFactory).unwrap();
    let plans = engine
        .plan(&ComputeRequest::new(vec![MetricSpec::new(
            "revenue",
            "memory://local/events",
            AggregationKind::Sum,
            "amount",
        )]))
        .await
        .unwrap();
    assert_eq!(plans.len(), 1);
    assert!(plans[0].is_ready());
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn unsupported_backends_in_config_are_rejected() {
    let cfg = ConnectionsConfig::from_yaml_str_with(
        "bigquery:\n  project_id: analytics-prod\n",
        "connections.yaml",
        |_| None,
    )
    .unwrap();
    let err = cfg.into_registry(&BuiltinFactory).unwrap_err();
    assert!(err.to_string().contains("bigquery"), "{err}");
}
