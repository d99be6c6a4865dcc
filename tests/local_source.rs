use std::fs::{self, File};
use std::io::Write;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use flate2::Compression;
use flate2::write::GzEncoder;
use kira_netpharm::domain::Options;
use kira_netpharm::error::KiraError;
use kira_netpharm::sources::{LocalSourceConfig, LocalTableStrategy};
use kira_netpharm::strategy::{Strategy, StrategyFailure};

const INGREDIENTS: &str = "identifier\tentity\tscore\tmol_id\n\
    Gancao\tLiquiritin\t65.69\tMOL004903\n\
    Gancao\tGlycyrol\t90.78\tMOL002311\n\
    Gancao\tGlabridin\t12.0\tMOL003896\n\
    Huangqi\tFormononetin\t69.67\tMOL000392\n";

fn config(path: Utf8PathBuf, min_score: Option<f64>) -> LocalSourceConfig {
    LocalSourceConfig {
        path,
        min_score,
        case_sensitive: false,
    }
}

fn write_gz(dir: &tempfile::TempDir) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("tcmsp.tsv.gz")).unwrap();
    let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
    encoder.write_all(INGREDIENTS.as_bytes()).unwrap();
    encoder.finish().unwrap();
    path
}

#[test]
fn reads_gzip_table_with_attributes() {
    let temp = tempfile::tempdir().unwrap();
    let strategy = LocalTableStrategy::new("tcmsp", config(write_gz(&temp), None)).unwrap();

    let table = strategy.execute("gancao", &Options::new()).unwrap();
    assert_eq!(table.len(), 3);
    assert_eq!(table.rows()[1].entity, "Glycyrol");
    assert_eq!(
        table.rows()[1].attributes.get("mol_id").map(String::as_str),
        Some("MOL002311")
    );
    assert!(strategy.execute("Renshen", &Options::new()).unwrap().is_empty());
}

#[test]
fn min_score_from_config_or_options() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("tcmsp.tsv")).unwrap();
    fs::write(&path, INGREDIENTS).unwrap();
    let strategy = LocalTableStrategy::new("tcmsp", config(path, Some(30.0))).unwrap();

    assert_eq!(strategy.execute("Gancao", &Options::new()).unwrap().len(), 2);

    let mut options = Options::new();
    options.insert("min_score".to_string(), "70".to_string());
    let table = strategy.execute("Gancao", &options).unwrap();
    assert_eq!(table.entities(), vec!["Glycyrol"]);

    options.insert("min_score".to_string(), "high".to_string());
    let err = strategy.execute("Gancao", &options).unwrap_err();
    assert_eq!(err.strategy, "tcmsp");
    assert_matches!(err.cause, StrategyFailure::Malformed(_));
}

#[test]
fn missing_table_is_a_source_config_error() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("absent.tsv")).unwrap();
    assert_matches!(
        LocalTableStrategy::new("tcmsp", config(path, None)),
        Err(KiraError::SourceConfig { source_name, .. }) if source_name == "tcmsp"
    );
}

#[test]
fn table_removed_after_registration_is_an_io_failure() {
    let temp = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(temp.path().join("tcmsp.tsv")).unwrap();
    fs::write(&path, INGREDIENTS).unwrap();
    let strategy = LocalTableStrategy::new("tcmsp", config(path.clone(), None)).unwrap();
    fs::remove_file(&path).unwrap();

    let err = strategy.execute("Gancao", &Options::new()).unwrap_err();
    assert_matches!(err.cause, StrategyFailure::Io(_));
}
