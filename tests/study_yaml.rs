//! Study documents: parsing, validation, expansion.

use cohort_core::config::RunConfig;
use cohort_core::id::WaveNumber;
use cohort_planner::{estimate_work, parse_yaml_study, plan_wave, validate_request, StudyError};

const PANEL: &str = r#"
config:
  model: mistral
  concurrency_limit: 4
  checkpoint_every: 5
  cache_uri: "file:///tmp/cohort-cache"
  store_codec: zstd
sampling:
  temperature: 0.2
  seed: 7
entities:
  - id: p-1
    attributes: { age: 29, region: north }
  - id: p-2
    attributes: { age: 61, region: south }
  - id: p-3
    attributes: { age: 44, region: east }
waves:
  - prompts:
      - { id: commute, text: "How do you get to work?" }
      - { id: cost, text: "What does it cost per month?" }
  - wave: 2
    require_full_success: false
    prompts:
      - { id: change, text: "Has anything changed since we last spoke?" }
"#;

#[test]
fn test_parse_panel_study() {
    let study = parse_yaml_study(PANEL).unwrap();
    assert_eq!(study.entities.len(), 3);
    assert_eq!(study.waves.len(), 2);
    assert_eq!(study.sampling.seed, Some(7));
    assert_eq!(study.config.cache_uri.as_deref(), Some("file:///tmp/cohort-cache"));

    let mut stores = cohort_core::config::StoreConfig {
        checkpoint_uri: Some("memory://".into()),
        ..Default::default()
    };
    study.config.apply_store(&mut stores);
    assert_eq!(stores.cache_uri.as_deref(), Some("file:///tmp/cohort-cache"));
    assert_eq!(stores.checkpoint_uri.as_deref(), Some("memory://"));
    assert_eq!(stores.codec.as_deref(), Some("zstd"));

    let mut cfg = RunConfig::default();
    study.config.apply_to(&mut cfg);
    let req = study.into_request(cfg);
    validate_request(&req).unwrap();
    assert_eq!(req.config.model, "mistral");
    assert_eq!(req.config.checkpoint_every, 5);

    let work = estimate_work(&req);
    assert_eq!(work.total_tasks, 9);
    assert_eq!(work.waves[0].rounds, 2);
}

#[test]
fn test_expansion_ids_are_stable_across_waves() {
    let study = parse_yaml_study(PANEL).unwrap();
    let req = study.into_request(RunConfig::default());

    let w1 = plan_wave(&req, WaveNumber::FIRST, |_| Vec::new()).unwrap();
    let ids: Vec<u64> = w1.iter().map(|t| t.task_id.get()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(w1[1].entity_id.as_str(), "p-1");
    assert_eq!(w1[1].prompt_id, "cost");

    let w2 = plan_wave(&req, WaveNumber::new(2), |_| Vec::new()).unwrap();
    let ids: Vec<u64> = w2.iter().map(|t| t.task_id.get()).collect();
    assert_eq!(ids, vec![6, 7, 8]);

    let again = plan_wave(&req, WaveNumber::FIRST, |_| Vec::new()).unwrap();
    assert_eq!(again, w1);
}

#[test]
fn test_single_prompt_list_becomes_one_wave() {
    let study = parse_yaml_study(
        r#"
entities:
  - id: solo
prompts:
  - { id: q, text: "Hello?" }
"#,
    )
    .unwrap();
    assert_eq!(study.waves.len(), 1);
    assert!(study.waves[0].require_full_success);
}

#[test]
fn test_rejects_malformed_documents() {
    let both = r#"
entities: [{ id: a }]
prompts: [{ id: q, text: "x" }]
waves: [{ prompts: [{ id: q, text: "x" }] }]
"#;
    assert!(matches!(parse_yaml_study(both), Err(StudyError::Invalid(_))));

    let misnumbered = r#"
entities: [{ id: a }]
waves:
  - wave: 2
    prompts: [{ id: q, text: "x" }]
"#;
    assert!(matches!(parse_yaml_study(misnumbered), Err(StudyError::Invalid(_))));

    let unknown_field = r#"
entities: [{ id: a }]
prompts: [{ id: q, text: "x" }]
retries: 3
"#;
    assert!(matches!(parse_yaml_study(unknown_field), Err(StudyError::Yaml(_))));
}

#[test]
fn test_validation_catches_duplicates() {
    let study = parse_yaml_study(
        r#"
entities:
  - id: a
  - id: a
prompts:
  - { id: q, text: "x" }
"#,
    )
    .unwrap();
    let req = study.into_request(RunConfig::default());
    assert!(validate_request(&req).is_err());

    let study = parse_yaml_study(
        r#"
entities: [{ id: a }]
prompts:
  - { id: q, text: "x" }
  - { id: q, text: "y" }
"#,
    )
    .unwrap();
    assert!(validate_request(&study.into_request(RunConfig::default())).is_err());
}
