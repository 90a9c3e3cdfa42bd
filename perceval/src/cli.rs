///
/// This module implements the command line of perceval: argument parsing, cache and
/// archive handling around each fetch, and record output.
///
/// All fetching logic (connectors, cache, archives, enrichment) lives in the
/// [`perceval-core`] crate. This module only wires it to user-facing options.
///
/// ## Subcommands
/// - `mbox`, `jira`, `stackexchange`: fetch one source and print its records.
/// - `sync`: fetch every backend listed in a YAML settings file.
///
/// ## Cache and archive lifecycle
/// For connectors that support caching, a live fetch first backs up the cache
/// (or cleans it with `--clean-cache`), then records every raw page in it. If the
/// fetch fails, the cache is recovered from the backup. Every live fetch of such a
/// connector is also stored in a new archive unless `--no-archive` is given.
///
/// ## How To Use
/// - For command-line users: use the installed `perceval` binary with `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// [`perceval-core`]: ../../perceval-core/
use crate::load_config::{
    load_config, BackendEntry, SourceSettings, JIRA_PASSWORD_ENV, STACKEXCHANGE_TOKEN_ENV,
};
use crate::output::RecordWriter;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use perceval_core::backends::{jira, stackexchange};
use perceval_core::dates::{default_datetime, str_to_datetime};
use perceval_core::identity;
use perceval_core::{ArchiveManager, Backend, Cache, Fetch, FetchSummary};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const CACHE_DIGEST_LEN: usize = 12;

/// CLI for perceval: fetch data from software repositories as JSON records.
#[derive(Parser, Debug)]
#[clap(
    name = "perceval",
    version,
    about = "Fetch items from mailing lists, issue trackers and Q&A sites as JSON records"
)]
pub struct Cli {
    /// Log at debug level
    #[clap(short = 'g', long, global = true)]
    pub debug: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch messages stored in mbox files
    Mbox {
        /// URI of the mboxes, usually the URL of their mailing list
        uri: String,
        /// Path to the mbox directory (or to a single mbox file)
        dirpath: PathBuf,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Fetch issues from a JIRA server
    Jira {
        /// JIRA's URL
        url: String,
        /// Filter issues by project
        #[clap(long)]
        project: Option<String>,
        /// User for basic authentication
        #[clap(long)]
        backend_user: Option<String>,
        /// Password for basic authentication
        #[clap(long, env = JIRA_PASSWORD_ENV, hide_env_values = true)]
        backend_password: Option<String>,
        /// Value 'false' disables TLS certificate verification
        #[clap(long, default_value_t = true, action = ArgAction::Set)]
        verify: bool,
        /// Maximum number of issues requested in the same query
        #[clap(long, default_value_t = jira::MAX_ISSUES)]
        max_issues: u32,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Fetch questions from a StackExchange site
    Stackexchange {
        /// StackExchange site, e.g. stackoverflow
        #[clap(long)]
        site: String,
        /// Filter questions by tag
        #[clap(long)]
        tagged: Option<String>,
        /// StackExchange API key
        #[clap(long, env = STACKEXCHANGE_TOKEN_ENV, hide_env_values = true)]
        token: Option<String>,
        /// Maximum number of questions requested in the same query
        #[clap(long, default_value_t = stackexchange::MAX_QUESTIONS)]
        max_questions: u32,
        #[clap(flatten)]
        common: CommonArgs,
    },
    /// Fetch every backend listed in a YAML settings file
    Sync {
        /// Path to the YAML settings file
        #[clap(long)]
        config: PathBuf,
        /// File where records are written (stdout by default)
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

/// Options shared by every backend subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Tag the records generated during the fetch (defaults to the origin)
    #[clap(long)]
    pub tag: Option<String>,

    /// Fetch items updated since this date
    #[clap(long, value_parser = parse_date)]
    pub from_date: Option<DateTime<Utc>>,

    /// File where records are written (stdout by default)
    #[clap(short, long)]
    pub output: Option<PathBuf>,

    /// Directory holding the caches (defaults to ~/.perceval/cache)
    #[clap(long)]
    pub cache_path: Option<PathBuf>,

    /// Erase the cache before fetching
    #[clap(long)]
    pub clean_cache: bool,

    /// Replay the items stored in the cache
    #[clap(long, conflicts_with = "no_cache")]
    pub fetch_cache: bool,

    /// Do not use the cache
    #[clap(long)]
    pub no_cache: bool,

    /// Directory holding the archives (defaults to ~/.perceval/archives)
    #[clap(long)]
    pub archive_path: Option<PathBuf>,

    /// Do not store the fetched pages in an archive
    #[clap(long)]
    pub no_archive: bool,

    /// Replay the items stored in archives
    #[clap(long, conflicts_with_all = ["fetch_cache", "no_archive"])]
    pub fetch_archive: bool,

    /// Only replay archives created since this date
    #[clap(long, value_parser = parse_date, requires = "fetch_archive")]
    pub archived_since: Option<DateTime<Utc>>,
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    str_to_datetime(value).map_err(|e| e.to_string())
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Mbox {
            uri,
            dirpath,
            common,
        } => {
            let source = SourceSettings::Mbox { uri, dirpath };
            run_single(source, common).await
        }
        Commands::Jira {
            url,
            project,
            backend_user,
            backend_password,
            verify,
            max_issues,
            common,
        } => {
            let source = SourceSettings::Jira {
                url,
                project,
                user: backend_user,
                password: backend_password,
                verify,
                max_issues,
            };
            run_single(source, common).await
        }
        Commands::Stackexchange {
            site,
            tagged,
            token,
            max_questions,
            common,
        } => {
            let source = SourceSettings::Stackexchange {
                site,
                tagged,
                token,
                max_questions,
                api_url: None,
            };
            run_single(source, common).await
        }
        Commands::Sync { config, output } => run_sync(&config, output.as_deref()).await,
    }
}

async fn run_single(source: SourceSettings, common: CommonArgs) -> Result<()> {
    let mut writer = RecordWriter::open(common.output.as_deref())?;
    let result = fetch_source(&source, &common, &mut writer).await;
    writer.flush()?;

    let summary = result?;
    info!(
        origin = source.origin(),
        fetched = summary.fetched,
        ignored = summary.ignored,
        "Fetch completed"
    );
    Ok(())
}

async fn run_sync(config: &Path, output: Option<&Path>) -> Result<()> {
    let settings = load_config(config)?;
    let mut writer = RecordWriter::open(output)?;
    info!(command = "sync", backends = settings.backends.len(), "Starting sync");

    let mut failed = Vec::new();
    for BackendEntry {
        source,
        tag,
        from_date,
        no_cache,
        no_archive,
    } in settings.backends
    {
        let common = CommonArgs {
            tag,
            from_date,
            cache_path: settings.cache_path.clone(),
            archive_path: settings.archive_path.clone(),
            no_cache,
            no_archive,
            ..CommonArgs::default()
        };
        match fetch_source(&source, &common, &mut writer).await {
            Ok(summary) => {
                info!(command = "sync", origin = source.origin(), ?summary, "Backend synced");
            }
            Err(e) => {
                error!(command = "sync", origin = source.origin(), error = %e, "Backend failed");
                failed.push(source.origin().to_string());
            }
        }
    }
    writer.flush()?;

    if failed.is_empty() {
        info!(command = "sync", records = writer.written(), "Sync complete");
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "{} backend(s) failed: {}",
            failed.len(),
            failed.join(", ")
        ))
    }
}

/// Run one backend according to `common`, writing its records to `writer`.
pub async fn fetch_source(
    source: &SourceSettings,
    common: &CommonArgs,
    writer: &mut RecordWriter,
) -> Result<FetchSummary> {
    let origin = source.origin().to_string();
    let connector = source.connector();
    let caching = connector.has_caching();
    let mut backend = Backend::new(origin.clone(), connector)?.with_tag(common.tag.clone());

    if common.fetch_archive {
        return replay_archives(&mut backend, common, writer).await;
    }

    if caching && !common.no_cache {
        let cache_dir = cache_root(common)?.join(cache_dir_name(&origin)?);
        let mut cache = Cache::open(&cache_dir)
            .with_context(|| format!("Failed to open cache {}", cache_dir.display()))?;
        if !common.fetch_cache {
            if common.clean_cache {
                cache.clean()?;
            } else {
                cache.backup()?;
            }
        }
        backend = backend.with_cache(cache);
    }

    if common.fetch_cache {
        let fetch = backend.fetch_from_cache()?;
        return write_records(fetch, writer).await;
    }

    let archives = if caching && !common.no_archive {
        let manager = ArchiveManager::new(archive_root(common)?)?;
        backend.set_archive(Some(manager.create_archive()?));
        Some(manager)
    } else {
        None
    };

    let result = match backend.fetch(common.from_date) {
        Ok(fetch) => write_records(fetch, writer).await,
        Err(e) => Err(e.into()),
    };
    if result.is_err() {
        if let Some(cache) = backend.cache_mut() {
            warn!(origin = %origin, "Fetch failed; recovering cache from backup");
            if let Err(e) = cache.recover() {
                warn!(origin = %origin, error = %e, "Cache could not be recovered");
            }
        }
        // A partial archive would be replayed next to the complete ones.
        if let (Some(manager), Some(archive)) = (archives, backend.take_archive()) {
            warn!(origin = %origin, path = %archive.path().display(), "Fetch failed; deleting incomplete archive");
            if let Err(e) = manager.delete_archive(archive) {
                warn!(origin = %origin, error = %e, "Incomplete archive could not be deleted");
            }
        }
    }
    result
}

async fn replay_archives(
    backend: &mut Backend,
    common: &CommonArgs,
    writer: &mut RecordWriter,
) -> Result<FetchSummary> {
    let manager = ArchiveManager::new(archive_root(common)?)?;
    let since = common.archived_since.unwrap_or_else(default_datetime);
    let paths = manager.collect_archives(backend.origin(), backend.name(), since)?;
    info!(
        origin = backend.origin(),
        archives = paths.len(),
        "Fetching items from archives"
    );

    let mut total = FetchSummary::default();
    for path in paths {
        backend.set_archive(Some(manager.load_archive(&path)?));
        let summary = write_records(backend.fetch_from_archive()?, writer).await?;
        total.pages += summary.pages;
        total.skipped_pages += summary.skipped_pages;
        total.seen += summary.seen;
        total.fetched += summary.fetched;
        total.ignored += summary.ignored;
        total.filtered += summary.filtered;
    }
    Ok(total)
}

async fn write_records(mut fetch: Fetch<'_>, writer: &mut RecordWriter) -> Result<FetchSummary> {
    while let Some(record) = fetch.next_record().await? {
        writer.write(&record)?;
    }
    Ok(fetch.summary().clone())
}

fn cache_root(common: &CommonArgs) -> Result<PathBuf> {
    match &common.cache_path {
        Some(path) => Ok(path.clone()),
        None => default_root("cache"),
    }
}

fn archive_root(common: &CommonArgs) -> Result<PathBuf> {
    match &common.archive_path {
        Some(path) => Ok(path.clone()),
        None => default_root("archives"),
    }
}

fn default_root(name: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot locate the home directory; pass an explicit path")?;
    Ok(home.join(".perceval").join(name))
}

/// Directory name of the cache of `origin`: the origin with path-unsafe
/// characters flattened to `_`, plus a digest prefix of the exact origin.
pub fn cache_dir_name(origin: &str) -> Result<String> {
    let flat: String = origin
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let digest = identity::uuid(&[origin])?;
    Ok(format!("{flat}-{}", &digest[..CACHE_DIGEST_LEN]))
}
