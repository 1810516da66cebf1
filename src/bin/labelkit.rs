use std::{path::PathBuf, rc::Rc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use url::Url;

use labelkit::{
    BatchOptions, FieldMap, RecordOutcome, RenderOptions, Session, SessionConfig, SystemFetcher,
    TemplateDef, TemplateSet, Update,
};

#[derive(Parser, Debug)]
#[command(name = "labelkit", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a single label as a PNG.
    Render(RenderArgs),
    /// Generate one label per CSV record into an output directory.
    Batch(BatchArgs),
}

#[derive(Parser, Debug)]
struct RenderArgs {
    /// Template definition JSON (single object or array).
    #[arg(long)]
    template: PathBuf,

    /// Template id to use when the file holds several.
    #[arg(long = "template-id")]
    template_id: Option<String>,

    /// Field values as `region-id=value`; applied in order.
    #[arg(long = "set")]
    set: Vec<String>,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    /// Template definition JSON (single object or array).
    #[arg(long)]
    template: PathBuf,

    /// Template id to use when the file holds several.
    #[arg(long = "template-id")]
    template_id: Option<String>,

    /// CSV input; header row names the template regions.
    #[arg(long)]
    csv: PathBuf,

    /// Output directory for the generated PNGs.
    #[arg(long, default_value = "./output")]
    out: PathBuf,

    /// Extra column routes as `column=region-id`.
    #[arg(long = "map")]
    map: Vec<String>,

    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Parser, Debug)]
struct PipelineArgs {
    /// Base URL for relative image values and the QR-code service.
    #[arg(long = "base-url", default_value = "http://localhost:5000/")]
    base_url: String,

    /// Binary threshold cutoff (fraction of max luminance).
    #[arg(long, default_value_t = labelkit::raster::DEFAULT_THRESHOLD)]
    threshold: f32,

    /// Keep the grayscale surface instead of thresholding to two tones.
    #[arg(long)]
    no_threshold: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    match cli.cmd {
        Command::Render(args) => runtime.block_on(cmd_render(args)),
        Command::Batch(args) => runtime.block_on(cmd_batch(args)),
    }
}

fn read_template(path: &PathBuf, id: Option<&str>) -> anyhow::Result<TemplateDef> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read template '{}'", path.display()))?;
    let set = TemplateSet::from_json(&text)?;
    let def = match id {
        Some(id) => set
            .get(id)
            .with_context(|| format!("template id '{id}' not found in '{}'", path.display()))?,
        None => set.sole().with_context(|| {
            format!(
                "'{}' holds {} templates; pass --template-id",
                path.display(),
                set.len()
            )
        })?,
    };
    Ok(def.clone())
}

fn make_session(template: &TemplateDef, pipeline: &PipelineArgs) -> anyhow::Result<Session> {
    let base_url = Url::parse(&pipeline.base_url)
        .with_context(|| format!("parse base URL '{}'", pipeline.base_url))?;
    let render = RenderOptions {
        threshold: if pipeline.no_threshold {
            None
        } else {
            Some(pipeline.threshold)
        },
    };
    let session = Session::new(
        template,
        Rc::new(SystemFetcher::default()),
        SessionConfig { base_url, render },
    )?;
    Ok(session)
}

async fn cmd_render(args: RenderArgs) -> anyhow::Result<()> {
    let template = read_template(&args.template, args.template_id.as_deref())?;
    let session = make_session(&template, &args.pipeline)?;
    session.prime().await?;

    for spec in &args.set {
        let (id, value) = spec
            .split_once('=')
            .with_context(|| format!("--set '{spec}' is not region-id=value"))?;
        let seen = session.version();
        if session.update_field(id.trim(), value).await? == Update::Applied {
            session.ready_after(seen).await?;
        }
    }

    let artifact = session
        .artifact()
        .context("no artifact rendered (empty template?)")?;
    if let Some(parent) = args.out.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    std::fs::write(&args.out, &artifact.png)
        .with_context(|| format!("write png '{}'", args.out.display()))?;

    eprintln!("wrote {}", args.out.display());
    Ok(())
}

async fn cmd_batch(args: BatchArgs) -> anyhow::Result<()> {
    let template = read_template(&args.template, args.template_id.as_deref())?;
    let session = make_session(&template, &args.pipeline)?;
    session.prime().await?;

    let records = labelkit::read_records(&args.csv)?;
    if records.is_empty() {
        eprintln!("no records in {}", args.csv.display());
        return Ok(());
    }

    let map = FieldMap::from_specs(&session, &args.map)?;
    let report = labelkit::run_batch(
        &session,
        &records,
        &map,
        &BatchOptions {
            out_dir: args.out.clone(),
        },
    )
    .await?;

    for result in &report.results {
        match &result.outcome {
            RecordOutcome::Written { filename, bytes } => {
                eprintln!("  {:>4}  {} ({:.1} KB)", result.index + 1, filename, *bytes as f64 / 1024.0);
            }
            RecordOutcome::Failed { stage, error } => {
                eprintln!("  {:>4}  failed at {stage:?}: {error}", result.index + 1);
            }
        }
    }
    let s = report.summary;
    eprintln!(
        "done: {}/{} succeeded, {} failed, {:.1}s, output {}",
        s.succeeded,
        s.attempted,
        s.failed,
        s.elapsed.as_secs_f64(),
        args.out.display()
    );
    Ok(())
}
