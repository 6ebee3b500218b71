//! The `push` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    config::Config,
    ocr::{provider_for_name, run_ocr},
    paths::PathResolver,
    prelude::*,
    repository::HttpRepository,
    sync::{NeverCancelled, PushProtocol, Synchronizer},
};

/// Options for `push`.
#[derive(Debug, Args)]
pub struct PushOpts {
    /// The logical path to OCR and push.
    pub logical_path: String,

    /// OCR provider to use.
    #[clap(long, default_value = "tesseract")]
    pub provider: String,

    /// Push protocol to use.
    #[clap(long, value_enum, default_value_t = PushProtocol::FileFirst)]
    pub protocol: PushProtocol,

    /// Collection to file the object under.
    #[clap(long)]
    pub collection: Option<String>,
}

/// The `push` subcommand: OCR one document and push it, bypassing the
/// queue. Useful for smoke-testing a deployment.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_push(config: &Config, opts: &PushOpts) -> Result<()> {
    let resolver = PathResolver::from_config(config);
    let physical_path = resolver.resolve(&opts.logical_path);
    debug!(physical_path = %physical_path.display(), "resolved path");

    let provider = provider_for_name(&opts.provider, config);
    let ocr = run_ocr(provider.as_ref(), &physical_path)
        .await
        .with_context(|| format!("OCR failed for {:?}", opts.logical_path))?;

    let repository = Arc::new(HttpRepository::from_config(config)?);
    let report = Synchronizer::new(repository)
        .push(&ocr, opts.collection.as_deref(), opts.protocol, &NeverCancelled)
        .await
        .with_context(|| format!("push failed for {:?}", opts.logical_path))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
