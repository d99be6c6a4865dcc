use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use kira_netpharm::config::{
    CacheBackendKind, CacheSettings, Config, ConfigLoader, ENV_CACHE_BACKEND, ENV_CACHE_PATH,
    ENV_CACHE_URL,
};
use kira_netpharm::domain::{ExecutionMode, FailurePolicy, StepInput};
use kira_netpharm::error::KiraError;
use kira_netpharm::sources::SourceKind;

const FULL: &str = r#"{
    "schema_version": 1,
    "inputs": {"herbs": ["Gancao", "Huangqi"]},
    "defaults": {"mode": "merge", "ttl": 3600, "retries": 1},
    "cache": {"backend": "memory", "ttl": 60},
    "sources": [
        {"name": "tcmsp", "step": "components", "kind": "local", "path": "/data/tcmsp.tsv.gz", "min_score": 30},
        {"name": "chembl", "step": "targets", "kind": "http",
         "url": "https://chembl.example.org/api/targets", "entity_field": "gene"}
    ],
    "steps": [
        {"name": "components", "input": "input:herbs", "mode": "fallback", "ttl": 0},
        {"name": "targets", "strategies": ["chembl"], "on_fail": "soft", "timeout": 30,
         "case_sensitive": true, "options": {"organism": "human", "limit": 50}}
    ],
    "overrides": {"targets": {"limit": 10}}
}"#;

fn parse(json: &str) -> Config {
    serde_json::from_str(json).unwrap()
}

#[test]
fn parse_full_document() {
    let resolved = ConfigLoader::resolve_config(parse(FULL)).unwrap();

    assert_eq!(resolved.inputs["herbs"], vec!["Gancao", "Huangqi"]);
    assert_eq!(resolved.cache.backend, CacheBackendKind::Memory);
    assert_eq!(resolved.sources.len(), 2);
    assert_matches!(&resolved.sources[0].kind, SourceKind::Local(local) if local.min_score == Some(30.0));
    assert_matches!(&resolved.sources[1].kind, SourceKind::Http(http) if http.entity_field == "gene");

    let components = &resolved.steps[0];
    assert_eq!(components.mode, ExecutionMode::Fallback);
    assert_eq!(components.on_fail, FailurePolicy::Fatal);
    assert_eq!(components.ttl, Some(Duration::ZERO));
    assert_eq!(components.retries, 1);

    let targets = &resolved.steps[1];
    assert_eq!(targets.mode, ExecutionMode::Merge);
    assert_eq!(targets.on_fail, FailurePolicy::Soft);
    assert_eq!(targets.input, StepInput::Step("components".to_string()));
    assert_eq!(targets.ttl, Some(Duration::from_secs(3600)));
    assert_eq!(targets.timeout, Duration::from_secs(30));
    assert!(targets.case_sensitive);
    assert_eq!(targets.options["limit"], "50");

    let request = resolved.request();
    assert_eq!(request.steps, vec!["components", "targets"]);
    assert_eq!(request.options_for(targets)["limit"], "10");
    assert_eq!(request.options_for(targets)["organism"], "human");
}

#[test]
fn ttl_falls_back_to_cache_section_then_never() {
    let resolved = ConfigLoader::resolve_config(parse(
        r#"{"inputs": {"smiles": "CCO"}, "cache": {"ttl": 60}, "steps": ["targets"]}"#,
    ))
    .unwrap();
    assert_eq!(resolved.steps[0].ttl, Some(Duration::from_secs(60)));

    let resolved = ConfigLoader::resolve_config(parse(
        r#"{"inputs": {"smiles": "CCO"}, "steps": ["targets"]}"#,
    ))
    .unwrap();
    assert_eq!(resolved.steps[0].ttl, None);
    assert_eq!(resolved.steps[0].timeout, Duration::from_secs(120));
}

#[test]
fn invalid_documents_are_rejected() {
    assert_matches!(
        ConfigLoader::resolve_config(parse(
            r#"{"inputs": {"a": "x"}, "steps": ["targets", "targets"]}"#
        )),
        Err(KiraError::DuplicateStep(step)) if step == "targets"
    );
    assert_matches!(
        ConfigLoader::resolve_config(parse(
            r#"{"inputs": {"a": "x"}, "steps": ["../escape"]}"#
        )),
        Err(KiraError::InvalidName { .. })
    );
    assert_matches!(
        ConfigLoader::resolve_config(parse(
            r#"{"inputs": {"a": "x", "b": "y"}, "steps": ["targets"]}"#
        )),
        Err(KiraError::InvalidConfig(_))
    );
    assert_matches!(
        ConfigLoader::resolve_config(parse(
            r#"{"inputs": {"a": "x"}, "steps": ["targets"], "overrides": {"docking": {"k": "v"}}}"#
        )),
        Err(KiraError::UndefinedStep(step)) if step == "docking"
    );
    assert_matches!(
        ConfigLoader::resolve_config(parse(
            r#"{"inputs": {"a": "x"}, "cache": {"backend": "http"}, "steps": ["targets"]}"#
        )),
        Err(KiraError::InvalidConfig(_))
    );
    assert_matches!(
        ConfigLoader::resolve_config(parse(r#"{"schema_version": 2}"#)),
        Err(KiraError::InvalidConfig(_))
    );
    assert_matches!(
        ConfigLoader::resolve_config(parse(
            r#"{"inputs": {"a": "x"}, "steps": [{"name": "targets", "timeout": 0}]}"#
        )),
        Err(KiraError::InvalidConfig(_))
    );
}

#[test]
fn environment_overrides_cache_settings() {
    let env = BTreeMap::from([
        (ENV_CACHE_BACKEND, "http"),
        (ENV_CACHE_URL, "http://cache.internal:7000/kv"),
        (ENV_CACHE_PATH, ""),
    ]);
    let mut settings = CacheSettings::default();
    settings
        .apply_env(|key| env.get(key).map(|value| value.to_string()))
        .unwrap();
    assert_eq!(settings.backend, CacheBackendKind::Http);
    assert_eq!(settings.url.as_deref(), Some("http://cache.internal:7000/kv"));
    assert_eq!(settings.path, None);

    let mut settings = CacheSettings::default();
    assert_matches!(
        settings.apply_env(|key| (key == ENV_CACHE_BACKEND).then(|| "redis".to_string())),
        Err(KiraError::InvalidConfig(_))
    );
}

#[test]
fn resolve_reads_file_and_rebases_relative_paths() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("kira-np.json");
    fs::write(
        &path,
        r#"{
            "inputs": {"herbs": "Gancao"},
            "cache": {"backend": "file", "path": "cache"},
            "sources": [{"name": "tcmsp", "step": "components", "kind": "local", "path": "data/herbs.tsv"}],
            "steps": ["components"]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    let SourceKind::Local(local) = &resolved.sources[0].kind else {
        panic!("expected a local source");
    };
    assert!(local.path.starts_with(temp.path().to_str().unwrap()));
    assert!(local.path.ends_with("data/herbs.tsv"));
}

#[test]
fn resolve_reports_unreadable_and_unparsable_files() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(missing.to_str()),
        Err(KiraError::ConfigRead(_))
    );

    let broken = temp.path().join("broken.json");
    fs::write(&broken, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(broken.to_str()),
        Err(KiraError::ConfigParse(_))
    );
}
