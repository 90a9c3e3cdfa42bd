use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use perceval::load_config::{load_config, SourceSettings};

fn config_file(yaml: &str) -> NamedTempFile {
    let config_file = NamedTempFile::new().expect("temp file");
    write(config_file.path(), yaml).unwrap();
    config_file
}

#[test]
#[serial]
fn test_load_config_every_backend_type() {
    let config_file = config_file(
        r#"
cache_path: /tmp/perceval/cache
backends:
  - type: mbox
    uri: http://example.com/list
    dirpath: /var/mail/list
    no_archive: true
  - type: jira
    url: https://issues.example.com
    project: PERCEVAL
    user: alice
    from_date: "2016-01-01"
  - type: stackexchange
    site: stackoverflow
    tagged: rust
    tag: so-rust
    max_questions: 50
"#,
    );
    env::remove_var("PERCEVAL_JIRA_PASSWORD");
    env::remove_var("PERCEVAL_STACKEXCHANGE_TOKEN");

    let settings = load_config(config_file.path()).expect("Config should load");

    assert_eq!(settings.cache_path, Some(PathBuf::from("/tmp/perceval/cache")));
    assert_eq!(settings.archive_path, None);
    assert_eq!(settings.backends.len(), 3);

    let mbox = &settings.backends[0];
    assert_eq!(mbox.source.origin(), "http://example.com/list");
    assert!(mbox.no_archive);
    assert!(!mbox.no_cache);
    assert!(mbox.from_date.is_none());

    let jira = &settings.backends[1];
    match &jira.source {
        SourceSettings::Jira {
            project,
            user,
            password,
            verify,
            max_issues,
            ..
        } => {
            assert_eq!(project.as_deref(), Some("PERCEVAL"));
            assert_eq!(user.as_deref(), Some("alice"));
            assert!(password.is_none());
            assert!(*verify);
            assert_eq!(*max_issues, 100);
        }
        other => panic!("Unexpected source {other:?}"),
    }
    assert_eq!(jira.from_date.unwrap().timestamp(), 1451606400);

    let se = &settings.backends[2];
    assert_eq!(se.source.origin(), "stackoverflow");
    assert_eq!(se.tag.as_deref(), Some("so-rust"));
    assert!(matches!(
        se.source,
        SourceSettings::Stackexchange {
            max_questions: 50,
            ..
        }
    ));
}

#[test]
#[serial]
fn test_load_config_injects_secrets_from_env() {
    let config_file = config_file(
        r#"
backends:
  - type: jira
    url: https://issues.example.com
    user: alice
  - type: stackexchange
    site: stackoverflow
"#,
    );
    env::set_var("PERCEVAL_JIRA_PASSWORD", "s3cret");
    env::set_var("PERCEVAL_STACKEXCHANGE_TOKEN", "api-key");

    let settings = load_config(config_file.path()).expect("Config should load");

    env::remove_var("PERCEVAL_JIRA_PASSWORD");
    env::remove_var("PERCEVAL_STACKEXCHANGE_TOKEN");

    match &settings.backends[0].source {
        SourceSettings::Jira { password, .. } => assert_eq!(password.as_deref(), Some("s3cret")),
        other => panic!("Unexpected source {other:?}"),
    }
    match &settings.backends[1].source {
        SourceSettings::Stackexchange { token, .. } => {
            assert_eq!(token.as_deref(), Some("api-key"))
        }
        other => panic!("Unexpected source {other:?}"),
    }
}

#[test]
#[serial]
fn test_secrets_in_yaml_are_ignored() {
    let config_file = config_file(
        r#"
backends:
  - type: jira
    url: https://issues.example.com
    password: from-file
"#,
    );
    env::remove_var("PERCEVAL_JIRA_PASSWORD");

    let settings = load_config(config_file.path()).expect("Config should load");
    match &settings.backends[0].source {
        SourceSettings::Jira { password, .. } => assert!(password.is_none()),
        other => panic!("Unexpected source {other:?}"),
    }
}

#[test]
fn test_load_config_missing_file() {
    let err = load_config("definitely-missing.yaml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_load_config_unknown_backend_type() {
    let config_file = config_file("backends:\n  - type: gerrit\n    url: http://example.com\n");
    let err = load_config(config_file.path()).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config YAML"));
}

#[test]
fn test_load_config_invalid_from_date() {
    let config_file = config_file(
        "backends:\n  - type: mbox\n    uri: list\n    dirpath: /tmp\n    from_date: someday\n",
    );
    let err = load_config(config_file.path()).unwrap_err();
    assert!(err.to_string().contains("Invalid from_date for list"));
}
