//! Tests for TaskInstanceRegistry.
#![cfg(feature = "sqlite")]

use provflow::schema::run_migrations;
use provflow::{ParamValue, Parameters, ProvenanceError, TaskInstanceId, TaskInstanceRegistry};
use sqlx::SqlitePool;

async fn setup_registry() -> TaskInstanceRegistry {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    TaskInstanceRegistry::new(pool)
}

fn sdss5() -> Parameters {
    Parameters::new().with("release", "sdss5").with("mjd", 59000)
}

#[tokio::test]
async fn test_key_order_does_not_change_identity() {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();
    let registry = TaskInstanceRegistry::new(pool.clone());

    let first = registry
        .get_or_create("ingest", "classify", Some("r1"), &sdss5())
        .await
        .unwrap();

    let reordered: Parameters = [
        ("mjd", ParamValue::from(59000)),
        ("release", ParamValue::from("sdss5")),
    ]
    .into_iter()
    .collect();
    let second = registry
        .get_or_create("ingest", "classify", Some("r1"), &reordered)
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.run_id.as_deref(), Some("r1"));

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM task_instance")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_subset_and_superset_do_not_match() {
    let registry = setup_registry().await;

    let full = registry
        .get_or_create("ingest", "classify", None, &sdss5())
        .await
        .unwrap();

    let subset = Parameters::new().with("release", "sdss5");
    assert!(registry
        .get("ingest", "classify", None, &subset)
        .await
        .unwrap()
        .is_none());

    // Make the extra pair exist so the lookup cannot short-circuit.
    let superset = sdss5().with("pipeline", "v2");
    registry
        .get_or_create("ingest", "other", None, &superset)
        .await
        .unwrap();
    assert!(registry
        .get("ingest", "classify", None, &superset)
        .await
        .unwrap()
        .is_none());

    let subset_instance = registry
        .get_or_create("ingest", "classify", None, &subset)
        .await
        .unwrap();
    assert_ne!(subset_instance.id, full.id);
}

#[tokio::test]
async fn test_empty_parameter_set_is_an_identity() {
    let registry = setup_registry().await;

    let bare = registry
        .get_or_create("ingest", "cleanup", None, &Parameters::new())
        .await
        .unwrap();
    let with_params = registry
        .get_or_create("ingest", "cleanup", None, &sdss5())
        .await
        .unwrap();
    assert_ne!(bare.id, with_params.id);

    let found = registry
        .get("ingest", "cleanup", None, &Parameters::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, bare.id);
}

#[tokio::test]
async fn test_run_id_scopes_identity() {
    let registry = setup_registry().await;

    let r1 = registry
        .get_or_create("ingest", "classify", Some("r1"), &sdss5())
        .await
        .unwrap();
    let r2 = registry
        .get_or_create("ingest", "classify", Some("r2"), &sdss5())
        .await
        .unwrap();
    assert_ne!(r1.id, r2.id);

    // Without a run id both runs match; that is ambiguity, not corruption.
    let err = registry
        .get("ingest", "classify", None, &sdss5())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvenanceError::AmbiguousRun(_)), "{err}");

    // A duplicate inside one run is still a fault when no run id is given.
    registry.create("ingest", "classify", Some("r1"), &sdss5()).await.unwrap();
    let err = registry
        .get("ingest", "classify", None, &sdss5())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvenanceError::DataIntegrityFault(_)), "{err}");
}

#[tokio::test]
async fn test_duplicate_identity_is_a_fault() {
    let registry = setup_registry().await;

    registry.create("ingest", "classify", Some("r1"), &sdss5()).await.unwrap();
    registry.create("ingest", "classify", Some("r1"), &sdss5()).await.unwrap();

    let err = registry
        .get_or_create("ingest", "classify", Some("r1"), &sdss5())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvenanceError::DataIntegrityFault(_)));
}

#[tokio::test]
async fn test_parameters_are_serialized() {
    let registry = setup_registry().await;

    let instance = registry
        .get_or_create("ingest", "classify", None, &sdss5().with("bands", vec!["g", "r"]))
        .await
        .unwrap();

    let params = registry.parameters(&instance).await.unwrap();
    assert_eq!(params.len(), 3);
    assert_eq!(params["release"], "sdss5");
    assert_eq!(params["mjd"], "59000");
    assert_eq!(params["bands"], r#"["g","r"]"#);
}

#[tokio::test]
async fn test_add_remove_and_update_parameters() {
    let registry = setup_registry().await;

    let instance = registry
        .get_or_create("ingest", "classify", None, &sdss5())
        .await
        .unwrap();

    // Re-adding an existing pair is a no-op.
    let existing = registry.add_parameter(&instance, "release", "sdss5").await.unwrap();
    assert_eq!(
        registry.parameter_store().lookup("release", &"sdss5".into()).await.unwrap(),
        Some(existing)
    );

    // Same name with another value conflicts.
    let err = registry
        .add_parameter(&instance, "release", "dr17")
        .await
        .unwrap_err();
    assert!(matches!(err, ProvenanceError::Integrity(_)));

    registry.add_parameter(&instance, "pipeline", "v2").await.unwrap();
    assert_eq!(registry.parameters(&instance).await.unwrap().len(), 3);

    assert!(registry.remove_parameter(&instance, "pipeline").await.unwrap());
    assert!(!registry.remove_parameter(&instance, "pipeline").await.unwrap());

    registry
        .update_parameters(&instance, &Parameters::new().with("release", "dr17"))
        .await
        .unwrap();
    let params = registry.parameters(&instance).await.unwrap();
    assert_eq!(params["release"], "dr17");
    assert_eq!(params["mjd"], "59000");

    let found = registry
        .get(
            "ingest",
            "classify",
            None,
            &Parameters::new().with("release", "dr17").with("mjd", 59000),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, instance.id);
    assert!(registry
        .get("ingest", "classify", None, &sdss5())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_missing_instance_is_not_found() {
    let registry = setup_registry().await;

    let err = registry
        .add_parameter(TaskInstanceId(999), "release", "sdss5")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProvenanceError::NotFound {
            entity: "task_instance",
            pk: 999
        }
    ));

    assert!(registry.fetch(TaskInstanceId(999)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_get_or_create_many_merges_shared() {
    let registry = setup_registry().await;

    let items = vec![
        Parameters::new().with("source", 1).with("release", "dr17"),
        Parameters::new().with("source", 2),
        Parameters::new().with("source", 1),
    ];
    let shared = Parameters::new().with("release", "sdss5");

    let ids = registry
        .get_or_create_many("ingest", "classify", None, items, &shared)
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);
    // Shared keys win, so the first and third items are the same identity.
    assert_eq!(ids[0], ids[2]);
    assert_ne!(ids[0], ids[1]);

    let params = registry.parameters(ids[0]).await.unwrap();
    assert_eq!(params["release"], "sdss5");

    let fetched = registry
        .fetch_many(&[ids[1], TaskInstanceId(12345), ids[0]])
        .await
        .unwrap();
    assert_eq!(
        fetched.iter().map(|i| i.id).collect::<Vec<_>>(),
        vec![ids[1], ids[0]]
    );
}

#[tokio::test]
async fn test_find_unlinked_and_relink() {
    let registry = setup_registry().await;

    let bare = registry
        .create("ingest", "classify", Some("r1"), &Parameters::new())
        .await
        .unwrap();
    registry
        .create("other", "classify", Some("r1"), &Parameters::new())
        .await
        .unwrap();
    registry
        .create("ingest", "classify", Some("r1"), &sdss5())
        .await
        .unwrap();

    let unlinked = registry.find_unlinked(Some("ingest")).await.unwrap();
    assert_eq!(unlinked.len(), 1);
    assert_eq!(unlinked[0].id, bare.id);
    assert_eq!(registry.find_unlinked(None).await.unwrap().len(), 2);

    let release = Parameters::new().with("release", "dr17");
    assert_eq!(registry.relink(&bare, &release).await.unwrap(), 1);
    assert_eq!(registry.relink(&bare, &release).await.unwrap(), 0);
    assert!(registry.find_unlinked(Some("ingest")).await.unwrap().is_empty());

    let found = registry
        .get("ingest", "classify", Some("r1"), &release)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, bare.id);
}

#[tokio::test]
async fn test_instance_serializes_for_handoff() {
    let registry = setup_registry().await;
    let instance = registry
        .get_or_create("ingest", "classify", Some("r1"), &sdss5())
        .await
        .unwrap();

    let json = serde_json::to_value(&instance).unwrap();
    assert_eq!(json["id"], instance.id.0);
    assert_eq!(json["run_id"], "r1");
    assert!(json["output_id"].is_null());
    assert!(json["created_at"].is_string());
}
