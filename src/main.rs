use std::path::Path;
use std::sync::Arc;

use invoice_workflow::config::{Config, ExtractorBackend};
use invoice_workflow::credentials::{CredentialCache, OAuthRefreshProvider};
use invoice_workflow::extraction::{Extractor, HeuristicExtractor, RemoteExtractor};
use invoice_workflow::governance::ReportWorkflow;
use invoice_workflow::intake::{IntakePipeline, SubmitOutcome, Upload};
use invoice_workflow::reconciler::ReviewReconciler;
use invoice_workflow::storage::FsStorage;
use invoice_workflow::store::Store;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn build_extractor(cfg: &Config, config_path: &Path) -> Result<Arc<dyn Extractor>, Box<dyn std::error::Error>> {
    match cfg.extractor.backend {
        ExtractorBackend::Heuristics => Ok(Arc::new(HeuristicExtractor)),
        ExtractorBackend::Remote => {
            let auth = cfg
                .auth
                .clone()
                .ok_or("remote extractor requires an [auth] section")?;
            let provider = OAuthRefreshProvider::new(auth, Some(config_path.to_path_buf()));
            let credentials = Arc::new(CredentialCache::new(Arc::new(provider)));
            Ok(Arc::new(RemoteExtractor::new(
                cfg.extractor.remote.clone(),
                credentials,
            )))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // init tracing
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = Config::path_from_env();
    let cfg = Config::load(&config_path)?;

    if let Some(parent) = Path::new(&cfg.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(Store::open(&cfg.db_path)?);
    let storage = Arc::new(FsStorage::new(&cfg.storage_dir)?);
    let extractor = build_extractor(&cfg, &config_path)?;

    let pipeline = IntakePipeline::new(
        Arc::clone(&store),
        storage,
        extractor,
        cfg.intake.clone(),
    );
    let rescued = pipeline.recover_stalled()?;
    if rescued > 0 {
        warn!(rescued, "Stalled extractions marked as timed out");
    }

    let reconciler = Arc::new(ReviewReconciler::new(
        Arc::new(pipeline.clone()),
        cfg.reconciler.clone(),
    ));
    let poller = reconciler.spawn();

    // arguments are PDFs to ingest, or folders laid out Year/City/Carrier/Month
    let mut tasks = Vec::new();
    for path in std::env::args().skip(1) {
        if Path::new(&path).is_dir() {
            match pipeline.import_folder(&path).await {
                Ok(outcomes) => {
                    info!(path = %path, files = outcomes.len(), "Folder imported");
                    for outcome in outcomes {
                        if let SubmitOutcome::Accepted { extraction, .. } = outcome {
                            tasks.push(extraction);
                        }
                    }
                }
                Err(e) => error!(path = %path, error = %e, "Folder import failed"),
            }
            continue;
        }

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(path = %path, error = %e, "Could not read upload");
                continue;
            }
        };
        let filename = Path::new(&path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone());

        match pipeline.submit(Upload::new(filename, bytes)).await {
            Ok(SubmitOutcome::Accepted { document, extraction }) => {
                info!(id = %document.id, path = %path, "Upload accepted");
                tasks.push(extraction);
            }
            Ok(SubmitOutcome::AlreadyImported { document, existing }) => {
                info!(id = %document.id, existing = %existing, path = %path, "Already imported");
            }
            Err(e) => error!(path = %path, error = %e, "Upload rejected"),
        }
    }

    for task in tasks {
        match task.wait().await {
            Ok(doc) => info!(
                id = %doc.id,
                status = %doc.status,
                confidence = doc.confidence_score,
                "Extraction finished"
            ),
            Err(e) => error!(error = %e, "Extraction task failed"),
        }
    }

    reconciler.poll().await;
    for item in reconciler.inbox() {
        info!(
            id = %item.document.id,
            file = %item.document.filename,
            status = item.document.status.badge().label,
            warnings = ?item.warnings,
            "INBOX"
        );
    }

    for (status, count) in pipeline.intake_summary()? {
        info!(status = %status, count, "Documents");
    }

    let workflow = ReportWorkflow::new(Arc::clone(&store), cfg.report_confidence.clone());
    let summary = workflow.summary()?;
    for total in &summary.by_status {
        info!(status = %total.status, count = total.count, total = %total.total_value, "Reports");
    }
    info!(overdue = summary.overdue, total = %summary.overdue_total, "Overdue reports");

    for month in workflow.timeline()? {
        info!(month = %month.month, totals = ?month.by_status, "Timeline");
    }
    for carrier in workflow.carrier_totals()? {
        info!(carrier = %carrier.name, count = carrier.count, total = %carrier.total_value, "Carrier");
    }
    let insights = workflow.insights(OffsetDateTime::now_utc().date())?;
    info!(
        current = %insights.current_month_total,
        last = %insights.last_month_total,
        variation = %insights.variation_percent,
        "This month"
    );
    for insight in &insights.insights {
        info!("{insight}");
    }

    poller.stop().await;
    Ok(())
}
