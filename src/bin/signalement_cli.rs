use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::{error, info, warn};

use signalement_rs::models::{ReportDraft, ReportId, StatusFilter};
use signalement_rs::{
    AuthClient, AuthConfig, DatabaseConfig, FirestoreDbClient, ImgbbClient, LocalCache,
    ReportGateway, ReportSource, ReportStore, SeedSource, StorageConfig, SyncEngine,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, rename_all = "snake_case")]
struct Args {
    /// Command to execute: list_reports, list_companies, report_photos, create_report, watch, add_local, list_local, delete_local, push_local, login
    #[arg(short, long)]
    command: String,

    /// Use the built-in baseline instead of Firestore
    #[arg(long)]
    seed: bool,

    /// Status filter for list_reports: all, reported, in_progress, resolved (accents and case ignored)
    #[arg(long, default_value = "all")]
    status: String,

    /// Report ID (for report_photos and delete_local)
    #[arg(long, name = "report_id")]
    report_id: Option<String>,

    /// Report data as JSON (for create_report and add_local)
    #[arg(long, name = "report_json")]
    report_json: Option<String>,

    /// Email (for login)
    #[arg(long)]
    email: Option<String>,

    /// Password (for login)
    #[arg(long)]
    password: Option<String>,

    /// Local cache file (or set SIGNALEMENT_CACHE_PATH env var)
    #[arg(long, name = "cache_path")]
    cache_path: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, name = "log_level", default_value = "info")]
    log_level: String,
}

// example usage:
// ./target/release/signalement_cli --command list_reports --status "en cours"
// ./target/release/signalement_cli --seed --command add_local --report_json '{"description": "Nid de poule", "location": {"latitude": -18.91, "longitude": 47.52}}'
// ./target/release/signalement_cli --command create_report --report_json '{"description": "Route inondée", "status": "Reported", "photos": ["data:image/jpeg;base64,..."]}'
// ./target/release/signalement_cli --command report_photos --report_id 3kQ9cX2mB7
// ./target/release/signalement_cli --command push_local
// ./target/release/signalement_cli --command login --email rakoto@mail.mg --password secret

type RemoteGateway = ReportGateway<FirestoreDbClient, ImgbbClient>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(format!("signalement_rs={},signalement_cli={}", args.log_level, args.log_level))
        .init();

    let cache_path = args
        .cache_path
        .clone()
        .or_else(|| std::env::var("SIGNALEMENT_CACHE_PATH").ok())
        .unwrap_or_else(|| "signalement_cache.db".to_string());
    let cache = LocalCache::open(&cache_path)?;

    if args.seed {
        let store = ReportStore::with_cache(Arc::new(SeedSource::default()), cache);
        return match run_store_command(&store, &args).await? {
            true => Ok(()),
            false => Err(anyhow!("Command {} needs Firestore, drop --seed", args.command)),
        };
    }

    let db_config = DatabaseConfig::from_env()?;
    let db = FirestoreDbClient::new(db_config.clone())?;
    let storage_config = StorageConfig::from_env().unwrap_or_else(|e| {
        warn!("{}; photo uploads will fail", e);
        StorageConfig::new(String::new())
    });
    let images = ImgbbClient::new(storage_config)?;
    let gateway = Arc::new(ReportGateway::new(Arc::new(db.clone()), Arc::new(images)));
    let store = ReportStore::with_cache(gateway.clone(), cache);

    if run_store_command(&store, &args).await? {
        return Ok(());
    }

    match args.command.as_str() {
        "report_photos" => {
            let id = ReportId::parse(&required(&args.report_id, "report_id")?);
            let photos = gateway.fetch_report_photos(&id).await;
            println!("{}", serde_json::to_string_pretty(&photos)?);
        }
        "watch" => watch(store).await?,
        "login" => {
            let email = required(&args.email, "email")?;
            let password = required(&args.password, "password")?;
            let auth = AuthClient::new(AuthConfig::from_db_config(&db_config)?)?.with_db_client(db);
            login(&auth, &gateway, &email, &password).await?;
        }
        other => return Err(anyhow!("Unknown command: {}", other)),
    }
    Ok(())
}

fn required(value: &Option<String>, name: &str) -> Result<String> {
    value
        .clone()
        .ok_or_else(|| anyhow!("--{} is required for this command", name))
}

fn parse_draft(args: &Args) -> Result<ReportDraft> {
    let raw = required(&args.report_json, "report_json")?;
    Ok(serde_json::from_str(&raw)?)
}

/// Runs the commands any report source supports. Returns false when the
/// command is not one of them.
async fn run_store_command<S: ReportSource>(store: &ReportStore<S>, args: &Args) -> Result<bool> {
    match args.command.as_str() {
        "list_reports" => {
            let filter: StatusFilter = args.status.parse()?;
            store.reload().await;
            let reports = store.reports_filtered(filter);
            info!("{} report(s) match {}", reports.len(), args.status);
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        "list_companies" => {
            store.reload_companies().await;
            println!("{}", serde_json::to_string_pretty(&store.all_companies())?);
        }
        "create_report" => {
            let report = store.create(parse_draft(args)?).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "add_local" => {
            store.reload().await;
            let report = store.add_local(parse_draft(args)?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        "list_local" => {
            println!("{}", serde_json::to_string_pretty(&store.local_reports())?);
        }
        "delete_local" => {
            let id = ReportId::parse(&required(&args.report_id, "report_id")?);
            store.reload().await;
            store.delete_local(&id)?;
            info!("Deleted local report {}", id);
        }
        "push_local" => {
            let pushed = store.push_local_only().await?;
            info!("Pushed {} local report(s)", pushed);
        }
        _ => return Ok(false),
    }
    Ok(true)
}

async fn watch(store: ReportStore<RemoteGateway>) -> Result<()> {
    let mut revisions = store.subscribe();
    let engine = SyncEngine::new(store.clone());
    engine.start_all();
    info!("Watching reports and companies, press Ctrl+C to stop");

    loop {
        tokio::select! {
            changed = revisions.changed() => {
                if changed.is_err() {
                    break;
                }
                let reports = store.all_reports();
                println!(
                    "{} report(s), {} companies",
                    reports.len(),
                    store.all_companies().len()
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.stop_all();
    Ok(())
}

async fn login(auth: &AuthClient, gateway: &RemoteGateway, email: &str, password: &str) -> Result<()> {
    match auth.sign_in(email, password).await {
        Ok(user) => {
            gateway.reset_attempts(email).await;
            println!("Signed in as {} ({})", user.email, user.uid);
            Ok(())
        }
        Err(e) => {
            match gateway.increment_attempts(email).await {
                Ok(attempts) => warn!("Failed sign-in attempt #{} for {}", attempts, email),
                Err(count_err) => error!("Could not record failed attempt: {:#}", count_err),
            }
            Err(e.into())
        }
    }
}
