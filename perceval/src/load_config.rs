/// `load_config` module: loads the YAML settings used by `perceval sync` and injects
/// secrets from the environment.
///
/// The YAML file never holds secrets. JIRA passwords come from `PERCEVAL_JIRA_PASSWORD`
/// and StackExchange API keys from `PERCEVAL_STACKEXCHANGE_TOKEN` (a `.env` file is
/// loaded by the binary before parsing).
///
/// # Schema
/// ```yaml
/// cache_path: /var/lib/perceval/cache      # optional
/// archive_path: /var/lib/perceval/archives # optional
/// backends:
///   - type: mbox
///     uri: http://example.com/mailing-list
///     dirpath: /var/mail/list
///   - type: jira
///     url: https://issues.example.com
///     project: PERCEVAL
///     user: alice
///     from_date: "2016-01-01"
///   - type: stackexchange
///     site: stackoverflow
///     tagged: rust
///     tag: so-rust
/// ```
///
/// # Errors
/// All errors use `anyhow::Error` with the offending path, and are surfaced at the CLI
/// boundary.
use anyhow::Result;
use chrono::{DateTime, Utc};
use perceval_core::backends::{jira, stackexchange, Jira, MBox, StackExchange};
use perceval_core::dates::str_to_datetime;
use perceval_core::Connector;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const JIRA_PASSWORD_ENV: &str = "PERCEVAL_JIRA_PASSWORD";
pub const STACKEXCHANGE_TOKEN_ENV: &str = "PERCEVAL_STACKEXCHANGE_TOKEN";

#[derive(Debug)]
pub struct Settings {
    pub cache_path: Option<PathBuf>,
    pub archive_path: Option<PathBuf>,
    pub backends: Vec<BackendEntry>,
}

/// One backend to run, with the options `sync` applies to it.
#[derive(Debug)]
pub struct BackendEntry {
    pub source: SourceSettings,
    pub tag: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub no_cache: bool,
    pub no_archive: bool,
}

/// Connector parameters, shared by the subcommands and the YAML settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceSettings {
    Mbox {
        uri: String,
        dirpath: PathBuf,
    },
    Jira {
        url: String,
        #[serde(default)]
        project: Option<String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(skip)]
        password: Option<String>,
        #[serde(default = "default_verify")]
        verify: bool,
        #[serde(default = "default_max_issues")]
        max_issues: u32,
    },
    Stackexchange {
        site: String,
        #[serde(default)]
        tagged: Option<String>,
        #[serde(skip)]
        token: Option<String>,
        #[serde(default = "default_max_questions")]
        max_questions: u32,
        #[serde(default)]
        api_url: Option<String>,
    },
}

fn default_verify() -> bool {
    true
}

fn default_max_issues() -> u32 {
    jira::MAX_ISSUES
}

fn default_max_questions() -> u32 {
    stackexchange::MAX_QUESTIONS
}

impl SourceSettings {
    /// The origin every record of this source carries.
    pub fn origin(&self) -> &str {
        match self {
            SourceSettings::Mbox { uri, .. } => uri.as_str(),
            SourceSettings::Jira { url, .. } => url.as_str(),
            SourceSettings::Stackexchange { site, .. } => site.as_str(),
        }
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        match self {
            SourceSettings::Mbox { dirpath, .. } => Box::new(MBox::new(dirpath)),
            SourceSettings::Jira {
                url,
                project,
                user,
                password,
                verify,
                max_issues,
            } => {
                let mut jira = Jira::new(url.as_str())
                    .with_project(project.clone())
                    .with_verify(*verify)
                    .with_max_issues(*max_issues);
                if let (Some(user), Some(password)) = (user, password) {
                    jira = jira.with_credentials(user.as_str(), password.as_str());
                }
                Box::new(jira)
            }
            SourceSettings::Stackexchange {
                site,
                tagged,
                token,
                max_questions,
                api_url,
            } => {
                let mut se = StackExchange::new(site.as_str())
                    .with_tagged(tagged.clone())
                    .with_token(token.clone())
                    .with_max_questions(*max_questions);
                if let Some(api_url) = api_url {
                    se = se.with_api_url(api_url.as_str());
                }
                Box::new(se)
            }
        }
    }

    /// Fill secret fields from the environment when they are not set yet.
    pub fn inject_secrets(&mut self) {
        match self {
            SourceSettings::Mbox { .. } => {}
            SourceSettings::Jira { password, .. } => {
                if password.is_none() {
                    *password = std::env::var(JIRA_PASSWORD_ENV).ok();
                }
            }
            SourceSettings::Stackexchange { token, .. } => {
                if token.is_none() {
                    *token = std::env::var(STACKEXCHANGE_TOKEN_ENV).ok();
                }
            }
        }
    }
}

/// Loads the YAML settings file (no secrets) and injects secrets from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    #[derive(Debug, Deserialize)]
    struct RawConfig {
        #[serde(default)]
        cache_path: Option<PathBuf>,
        #[serde(default)]
        archive_path: Option<PathBuf>,
        #[serde(default)]
        backends: Vec<RawEntry>,
    }

    #[derive(Debug, Deserialize)]
    struct RawEntry {
        #[serde(flatten)]
        source: SourceSettings,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        from_date: Option<String>,
        #[serde(default)]
        no_cache: bool,
        #[serde(default)]
        no_archive: bool,
    }

    let raw: RawConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    let mut backends = Vec::with_capacity(raw.backends.len());
    for entry in raw.backends {
        let mut source = entry.source;
        source.inject_secrets();

        let from_date = match entry.from_date.as_deref() {
            Some(value) => Some(str_to_datetime(value).map_err(|e| {
                error!(error = %e, origin = source.origin(), "Invalid from_date in config");
                anyhow::anyhow!("Invalid from_date for {}: {e}", source.origin())
            })?),
            None => None,
        };

        backends.push(BackendEntry {
            source,
            tag: entry.tag,
            from_date,
            no_cache: entry.no_cache,
            no_archive: entry.no_archive,
        });
    }

    info!(
        config_path = ?path_ref,
        backends = backends.len(),
        "Configuration loaded"
    );
    Ok(Settings {
        cache_path: raw.cache_path,
        archive_path: raw.archive_path,
        backends,
    })
}
