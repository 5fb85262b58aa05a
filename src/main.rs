use std::{collections::BTreeMap, process, sync::Arc};

use contextfit::{
    application::{
        cached_store::CachedTemplateStore,
        error::AppError,
        optimizer::{OptimizerOptions, TemplateOptimizer},
        repos::TemplateStore,
    },
    cache::EngineCaches,
    config::{self, Command, Settings},
    domain::{Fingerprints, text},
    fingerprint::FingerprintEngine,
    infra::{db, error::InfraError, telemetry},
};
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(error.exit_code());
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(std::io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        Command::Fingerprint(args) => run_fingerprint(&settings, &args.text).await,
        Command::Init => run_init(&settings).await,
        command => {
            let store = open_store(&settings).await?;
            let result = run_with_store(&settings, Arc::clone(&store), command).await;
            store.close().await;
            result
        }
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn TemplateStore>, AppError> {
    db::open_store(&settings.storage, &settings.matching.resolutions)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))
}

async fn run_with_store(
    settings: &Settings,
    store: Arc<dyn TemplateStore>,
    command: Command,
) -> Result<(), AppError> {
    let caches = Arc::new(EngineCaches::new(&settings.cache));
    let cached: Arc<dyn TemplateStore> =
        Arc::new(CachedTemplateStore::new(store, Arc::clone(&caches)));
    let optimizer = TemplateOptimizer::new(cached, caches, OptimizerOptions::from(settings));

    match command {
        Command::Match(args) => {
            let text = read_text(&args.text).await?;
            let found = optimizer.find_matching_template(&text).await?;
            print_json(&found)
        }
        Command::Learn(args) => {
            let text = read_text(&args.text).await?;
            let template_id = optimizer
                .learn_template(&text, args.working_window, args.batch_size)
                .await?
                .ok_or_else(|| AppError::validation("cannot learn an empty text"))?;
            print_json(&json!({ "template_id": template_id }))
        }
        Command::Reinforce(args) => {
            let updated = optimizer
                .reinforce(
                    args.template_id,
                    args.distance,
                    args.working_window,
                    args.batch_size,
                )
                .await?;
            print_json(&json!({ "template_id": args.template_id, "updated": updated }))
        }
        Command::Observe(args) => {
            let text = read_text(&args.text).await?;
            let outcome = optimizer
                .observe(
                    &text,
                    args.prompt_tokens,
                    args.completion_tokens,
                    args.batch_size,
                )
                .await?;
            print_json(&outcome)
        }
        Command::Maintain => {
            optimizer.store().maintain().await?;
            info!(backend = optimizer.store().backend(), "Maintenance complete");
            Ok(())
        }
        Command::Fingerprint(_) | Command::Init => Err(AppError::unexpected(
            "command does not use the template store",
        )),
    }
}

async fn run_fingerprint(settings: &Settings, raw: &str) -> Result<(), AppError> {
    let text = read_text(raw).await?;
    let caches = Arc::new(EngineCaches::new(&settings.cache));
    let engine = FingerprintEngine::new(settings.matching.fingerprint_options(), caches);

    let complexity = engine.analyzer().analyze(&text);
    let fingerprints: BTreeMap<String, String> = engine
        .compute_fingerprints(&text)
        .iter()
        .map(|(resolution, fingerprint)| {
            (resolution.to_string(), Fingerprints::encode_hex(fingerprint))
        })
        .collect();

    print_json(&json!({
        "complexity": complexity,
        "fingerprints": fingerprints,
    }))
}

async fn run_init(settings: &Settings) -> Result<(), AppError> {
    let store = open_store(settings).await?;
    info!(
        backend = store.backend(),
        resolutions = ?store.resolutions(),
        "Schema ready"
    );
    store.close().await;
    Ok(())
}

/// `-` reads standard input to the end.
async fn read_text(raw: &str) -> Result<String, AppError> {
    let text = if raw == "-" {
        let mut buffer = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buffer)
            .await
            .map_err(InfraError::from)?;
        buffer
    } else {
        raw.to_string()
    };

    if text::is_blank(&text) {
        return Err(AppError::validation("input text is empty"));
    }
    Ok(text)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
