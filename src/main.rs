use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use log::info;

use tandem::cache::{EnsureOptions, PageRenderCache, Viewport};
use tandem::cancel::CancellationToken;
use tandem::config;
use tandem::engine::{DocumentEngine, DocumentHandle, DocumentRef};
use tandem::typst_engine::TypstEngine;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("TANDEM_BUILD_GIT_HASH"),
    " ",
    env!("TANDEM_BUILD_PROFILE"),
    ")"
);

const RENDER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(
    name = "tandem",
    version = VERSION,
    about = "Two-window slide presenter powered by Typst"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output file path (enables logging in present mode)
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// Use only the fonts embedded in the binary
    #[arg(long, global = true)]
    embedded_fonts: bool,

    /// Do not prefetch the page after the current one
    #[arg(long, global = true)]
    no_prefetch: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Present a Typst deck in the terminal (controller + presenter view)
    Present {
        /// Typst deck, one slide per page
        deck: PathBuf,

        /// Sync channel name
        #[arg(long)]
        channel: Option<String>,
    },
    /// Render every slide of a Typst deck to PNG
    Render {
        /// Typst deck, one slide per page
        deck: PathBuf,

        /// Output PNG file; slides are written as <stem>-001.<ext>, ...
        #[arg(short, long, default_value = "slide.png")]
        output: PathBuf,

        /// Fit slides into this width in px
        #[arg(long)]
        width: Option<f64>,

        /// Fit slides into this height in px
        #[arg(long)]
        height: Option<f64>,

        /// Output resolution in PPI (used when no width/height is given)
        #[arg(long)]
        ppi: Option<f32>,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Some(log_path) = &cli.log {
        let file = match fs::File::create(log_path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Error: failed to open log file {}: {e}", log_path.display());
                std::process::exit(1);
            }
        };
        env_logger::Builder::from_default_env()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    } else if matches!(cli.command, Command::Render { .. }) {
        env_logger::init();
    }
    // present mode + no --log → logger not initialized (terminal is raw)

    // Load config file and merge CLI overrides
    let mut cfg = match config::load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };

    let (width, height, ppi) = match &cli.command {
        Command::Render {
            width, height, ppi, ..
        } => (*width, *height, *ppi),
        Command::Present { .. } => (None, None, None),
    };
    cfg.merge_cli(width, height, ppi, cli.no_prefetch);
    if let Command::Present {
        channel: Some(name),
        ..
    } = &cli.command
    {
        cfg.channel = Some(name.clone());
    }
    let config = cfg.resolve();

    let engine = Arc::new(TypstEngine::new(cli.embedded_fonts));

    let result = match cli.command {
        Command::Present { deck, .. } => tandem::present::run(&deck, config, engine),
        Command::Render { deck, output, .. } => {
            let fit = width.is_some() || height.is_some();
            cmd_render(&deck, &config, engine.as_ref(), &output, fit)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn cmd_render(
    deck: &Path,
    config: &config::Config,
    engine: &dyn DocumentEngine,
    output: &Path,
    fit: bool,
) -> Result<()> {
    let pipeline_start = Instant::now();

    let source = fs::read(deck).with_context(|| format!("failed to read {}", deck.display()))?;
    if source.iter().all(u8::is_ascii_whitespace) {
        bail!("input file is empty or contains only whitespace");
    }

    let document = engine.load(&source, &CancellationToken::new())?;
    let handle = DocumentHandle::new(1, DocumentRef::new(deck.display().to_string()), document);

    // Without an explicit size, the first slide at `ppi` sets the viewport.
    let viewport = if fit {
        config.viewport
    } else {
        let size = handle.document().page_size(1)?;
        let px_per_pt = f64::from(config.ppi) / 72.0;
        Viewport::new(size.width * px_per_pt, size.height * px_per_pt)
    };
    if viewport.is_empty() {
        bail!("viewport {}x{} is empty", viewport.width, viewport.height);
    }

    let pages = handle.page_count();
    let mut cache = PageRenderCache::new(handle, viewport, false)?;
    for page in 1..=pages {
        cache.ensure_page_image(page, EnsureOptions::PREFETCH);
    }
    if !cache.wait_idle(RENDER_TIMEOUT) {
        bail!("rendering did not finish within {}s", RENDER_TIMEOUT.as_secs());
    }

    let stem = output
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let ext = output
        .extension()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let parent = output.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).ok();

    let mut files = Vec::new();
    for page in 1..=pages {
        let Some(entry) = cache.entry(page) else {
            bail!("slide {page} failed to render");
        };
        let filename = format!("{stem}-{page:03}.{ext}");
        let path = parent.join(&filename);
        fs::write(&path, entry.image.png())
            .with_context(|| format!("failed to write {}", path.display()))?;
        files.push((filename, entry.image.width(), entry.image.height()));
    }

    info!(
        "cmd_render: {pages} slide(s) in {:.1}ms, stats {:?}",
        pipeline_start.elapsed().as_secs_f64() * 1000.0,
        cache.stats()
    );

    eprintln!("rendered {} -> {} slide(s):", deck.display(), files.len());
    for (filename, w, h) in &files {
        eprintln!("  {filename} ({w}x{h}px)");
    }

    Ok(())
}
