mod client;
mod config;
mod draw;
mod engine;
mod geometry;
mod intake;
mod logging;
mod model;
mod overlay;
mod present;
mod selection;
mod session;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use client::HttpDiagnoseClient;
use config::{ClientConfig, ConfigOverrides};
use draw::{compose, parse_color, ImageSurface};
use geometry::{map_annotation, LabelFont, Size};
use image::{DynamicImage, GenericImageView};
use model::{Annotation, ResultRecord};
use overlay::{OverlayRenderer, OverlayStyle, Viewport};
use present::{HistoryEntry, SessionSummary};
use serde_json::{json, Value};
use session::{spawn_session, SessionHandle, SessionSnapshot};
use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "xray-dash",
    version,
    about = "Dental X-ray diagnostic client: serial batch upload, result history and detection overlays"
)]
struct Cli {
    /// Debug-level logging (overridden by XRAY_LOG)
    #[arg(long, short, global = true, action = ArgAction::SetTrue)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Upload .dcm/.rvg files one at a time and render the returned findings
    Diagnose(DiagnoseArgs),
    /// Draw saved annotations over an image at a given display size
    Render(RenderArgs),
    /// Print display-space geometry for annotations without drawing
    Map(MapArgs),
}

#[derive(Args, Debug)]
struct DiagnoseArgs {
    /// Files to analyze; only .dcm and .rvg are accepted
    #[arg(required = true)]
    files: Vec<PathBuf>,
    /// Diagnose API base URL (default: $XRAY_API_BASE_URL or http://localhost:8000/api)
    #[arg(long)]
    api_url: Option<String>,
    /// Output directory for overlays, reports and session.json
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Per-request timeout in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// History number (as listed) to make active once the batch is done
    #[arg(long)]
    select: Option<usize>,
    /// Display surface width; height follows the image aspect unless given
    #[arg(long)]
    display_width: Option<u32>,
    /// Display surface height; width follows the image aspect unless given
    #[arg(long)]
    display_height: Option<u32>,
    /// Box and label color as #RRGGBB or #RRGGBBAA
    #[arg(long, default_value = "#FF0000")]
    box_color: String,
    /// Skip writing overlay PNGs
    #[arg(long, action = ArgAction::SetTrue)]
    no_overlays: bool,
    /// Print the session summary JSON to stdout; progress goes to stderr
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct RenderArgs {
    /// Image the annotations were produced for (PNG/JPEG/GIF)
    image: PathBuf,
    /// Annotations JSON file (or - for stdin): a list or a diagnose response
    #[arg(long)]
    annotations: String,
    /// Output PNG path
    #[arg(long)]
    out: PathBuf,
    /// Display surface width
    #[arg(long)]
    width: Option<u32>,
    /// Display surface height
    #[arg(long)]
    height: Option<u32>,
    /// Resize the display surface after load (repeatable, WxH); the last one is saved
    #[arg(long = "resize", value_parser = parse_size)]
    resizes: Vec<(u32, u32)>,
    /// Box and label color as #RRGGBB or #RRGGBBAA
    #[arg(long, default_value = "#FF0000")]
    box_color: String,
    /// Path to write geometry sidecar (default: <out>.json)
    #[arg(long)]
    meta_out: Option<PathBuf>,
    /// Disable geometry sidecar output
    #[arg(long, action = ArgAction::SetTrue)]
    no_meta: bool,
}

#[derive(Args, Debug)]
struct MapArgs {
    /// Annotations JSON file (or - for stdin)
    #[arg(long)]
    annotations: String,
    /// Natural image size, WxH
    #[arg(long, value_parser = parse_size)]
    natural: (u32, u32),
    /// Display surface size, WxH
    #[arg(long, value_parser = parse_size)]
    display: (u32, u32),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Diagnose(args) => command_diagnose(args),
        Commands::Render(args) => command_render(args),
        Commands::Map(args) => command_map(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "diagnose",
            "description": "Submit .dcm/.rvg files as one batch, processed strictly one at a time."
        }),
        json!({
            "name": "render",
            "description": "Render detection boxes and labels over an image at a display size."
        }),
        json!({
            "name": "map",
            "description": "Print natural-to-display geometry for annotations as JSON."
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn command_diagnose(args: DiagnoseArgs) -> Result<()> {
    let intake = intake::filter_files(args.files.clone());
    for rejected in &intake.rejected {
        warn!(file = %rejected.display(), "skipping unsupported file type");
    }
    if intake.nothing_accepted() {
        println!("{}", intake::NO_VALID_FILES);
        return Ok(());
    }
    let entries = intake::load_entries(&intake.accepted)?;

    let cfg = ClientConfig::resolve(ConfigOverrides {
        api_base: args.api_url.clone(),
        out_dir: args.out_dir.clone(),
        timeout_secs: args.timeout_secs,
    });
    let client = HttpDiagnoseClient::new(&cfg.api_base, cfg.timeout)
        .context("failed to build HTTP client")?;
    let endpoint = client.endpoint().to_string();
    info!(%endpoint, files = entries.len(), "starting batch");

    let style = overlay_style(&args.box_color)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let snapshot = runtime.block_on(async {
        let (handle, _task) = spawn_session(Arc::new(client));
        let snapshot = run_batch(&handle, entries, args.json).await?;
        match args.select {
            Some(number) => apply_selection(&handle, number).await,
            None => Ok(snapshot),
        }
    })?;

    let batch_dir = cfg
        .out_dir
        .join(format!("batch-{}", timestamp_compact()));
    let viewport = Viewport::new(Size::new(0.0, 0.0));
    let mut renderer = OverlayRenderer::new(ImageSurface::new(Size::new(0.0, 0.0)), style);
    let display = (args.display_width, args.display_height);
    let mut history: Vec<HistoryEntry> = Vec::with_capacity(snapshot.results.len());
    for (index, record) in snapshot.results.iter().enumerate() {
        let mut entry = HistoryEntry::from_record(index, record);
        let stem = slugify(&record.id);

        if let Some(report) = &record.report {
            let report_path = batch_dir.join(format!("{stem}.txt"));
            write_text_file(&report_path, report)?;
            entry.report_path = Some(abs_path(&report_path).display().to_string());
        }
        if !args.no_overlays {
            let image_path = batch_dir.join(format!("{stem}.png"));
            match write_record_overlay(&mut renderer, &viewport, record, &image_path, display) {
                Ok(true) => entry.image_path = Some(abs_path(&image_path).display().to_string()),
                Ok(false) => {}
                Err(err) => warn!(file = %record.file_name, "overlay not written: {err:#}"),
            }
        }
        history.push(entry);
    }
    renderer.teardown();
    debug!(
        subscribers = viewport.subscriber_count(),
        "overlay released"
    );

    let summary = SessionSummary {
        generated_at: timestamp_iso(),
        endpoint,
        counters: snapshot.counters,
        active_index: snapshot.active_index,
        last_error: snapshot.last_error.clone(),
        history,
    };
    let summary_path = batch_dir.join("session.json");
    write_json_pretty(&summary_path, &serde_json::to_value(&summary)?)?;

    if args.json {
        println!("{}", serde_json::to_string(&summary)?);
        return Ok(());
    }

    print_session(&snapshot, &summary);
    println!("Session: {}", abs_path(&summary_path).display());
    Ok(())
}

/// Submits the batch and echoes progress until every item has settled.
async fn run_batch(
    handle: &SessionHandle,
    entries: Vec<model::QueueEntry>,
    quiet_stdout: bool,
) -> Result<SessionSnapshot> {
    let emit = |line: &str| {
        if quiet_stdout {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    };

    let mut updates = handle.subscribe();
    let generation = handle.submit(entries).await?;
    let mut last_counters = None;

    loop {
        let snapshot = updates.borrow_and_update().clone();
        if snapshot.generation == generation {
            if last_counters != Some(snapshot.counters) {
                emit(&present::progress_line(&snapshot.counters));
                if let Some(name) = &snapshot.in_flight {
                    emit(&format!("Analyzing: {name}"));
                }
                last_counters = Some(snapshot.counters);
            }
            if snapshot.is_idle_for(generation) {
                break;
            }
        }
        updates
            .changed()
            .await
            .map_err(|_| anyhow!("session stopped before the batch finished"))?;
    }

    let snapshot = handle.wait_idle(generation).await?;
    if present::is_batch_done(&snapshot.counters) {
        emit(present::ALL_DONE);
    }
    Ok(snapshot)
}

async fn apply_selection(handle: &SessionHandle, number: usize) -> Result<SessionSnapshot> {
    let moved = match number.checked_sub(1) {
        Some(index) => handle.select(index).await?,
        None => false,
    };
    let snapshot = handle.snapshot();
    if !moved && snapshot.active_index.map(|i| i + 1) != Some(number) {
        warn!(
            number,
            available = snapshot.results.len(),
            "history entry does not exist; keeping current selection"
        );
    }
    Ok(snapshot)
}

fn print_session(snapshot: &SessionSnapshot, summary: &SessionSummary) {
    println!();
    println!("{}", present::history_header(&snapshot.counters));
    for line in present::history_lines(&snapshot.results, snapshot.active_index) {
        println!("{line}");
    }
    let failed = snapshot.results.iter().filter(|r| r.is_error()).count();
    if failed > 0 {
        println!("{failed} file(s) failed.");
    }

    if let Some(banner) = present::error_banner(snapshot) {
        println!();
        println!("{banner}");
    }

    println!();
    let active = snapshot.active().map(|r| r.as_ref());
    if let Some(record) = active {
        println!("Diagnostic Report ({})", record.file_name);
    }
    println!("{}", present::report_view(active));

    if let Some(path) = snapshot
        .active_index
        .and_then(|i| summary.history.get(i))
        .and_then(|entry| entry.image_path.as_deref())
    {
        println!();
        println!("Overlay: {path}");
    }
}

fn overlay_style(raw: &str) -> Result<OverlayStyle> {
    let color = parse_color(raw).ok_or_else(|| anyhow!("invalid color: {raw}"))?;
    Ok(OverlayStyle::with_color(color))
}

/// Shows the record on the shared renderer and saves the composite.
/// Returns `false` when the record carries no image.
fn write_record_overlay(
    renderer: &mut OverlayRenderer<ImageSurface>,
    viewport: &Viewport,
    record: &ResultRecord,
    out_path: &Path,
    display: (Option<u32>, Option<u32>),
) -> Result<bool> {
    let Some(bytes) = &record.image else {
        return Ok(false);
    };
    let decoded = image::load_from_memory(bytes).context("failed to decode result image")?;

    renderer.show(viewport, &record.id, record.annotations.clone());
    paint_loaded(renderer, viewport, &decoded, display.0, display.1);

    save_composite(&decoded, renderer, out_path)?;
    Ok(true)
}

/// Lays out the viewport for the decoded image, then fires the load
/// notification.
fn paint_loaded(
    renderer: &mut OverlayRenderer<ImageSurface>,
    viewport: &Viewport,
    decoded: &DynamicImage,
    width: Option<u32>,
    height: Option<u32>,
) {
    let (nw, nh) = decoded.dimensions();
    let natural = Size::from_pixels(nw, nh);
    viewport.resize(fit_display(natural, width, height));
    renderer.poll_resize();
    renderer.image_loaded(natural);
}

fn save_composite(
    decoded: &DynamicImage,
    renderer: &OverlayRenderer<ImageSurface>,
    out_path: &Path,
) -> Result<()> {
    let composed = compose(decoded, renderer.surface().image());
    ensure_parent_dir(out_path)?;
    DynamicImage::ImageRgba8(composed)
        .save(out_path)
        .with_context(|| format!("failed to save output image: {}", out_path.display()))?;
    Ok(())
}

/// Display size for an image: explicit dimensions win, a single dimension
/// keeps the natural aspect ratio, none means natural size.
fn fit_display(natural: Size, width: Option<u32>, height: Option<u32>) -> Size {
    match (width, height) {
        (Some(w), Some(h)) => Size::from_pixels(w, h),
        (Some(w), None) if natural.width > 0.0 => {
            let w = f64::from(w);
            Size::new(w, (natural.height * w / natural.width).round())
        }
        (None, Some(h)) if natural.height > 0.0 => {
            let h = f64::from(h);
            Size::new((natural.width * h / natural.height).round(), h)
        }
        _ => natural,
    }
}

fn command_render(args: RenderArgs) -> Result<()> {
    if !args.image.exists() {
        bail!("input not found: {}", args.image.display());
    }
    let annotations = Arc::new(load_annotations(&args.annotations)?);
    let style = overlay_style(&args.box_color)?;
    let decoded = image::open(&args.image)
        .with_context(|| format!("failed to open input image: {}", args.image.display()))?;

    let viewport = Viewport::new(Size::new(0.0, 0.0));
    let mut renderer = OverlayRenderer::new(ImageSurface::new(Size::new(0.0, 0.0)), style);
    let source_key = abs_path(&args.image).display().to_string();
    renderer.show(&viewport, &source_key, annotations.clone());
    paint_loaded(&mut renderer, &viewport, &decoded, args.width, args.height);

    for (w, h) in &args.resizes {
        viewport.resize(Size::from_pixels(*w, *h));
        renderer.poll_resize();
    }

    save_composite(&decoded, &renderer, &args.out)?;

    if !args.no_meta {
        let meta_path = args
            .meta_out
            .clone()
            .unwrap_or_else(|| default_sidecar_for(&args.out));
        let (nw, nh) = decoded.dimensions();
        let display = renderer.display_size();
        let payload = json!({
            "overlay_meta_version": 1,
            "input_path": source_key,
            "output_path": abs_path(&args.out).display().to_string(),
            "generated_at": timestamp_iso(),
            "natural": {"width": nw, "height": nh},
            "display": {"width": display.width, "height": display.height},
            "redraws": renderer.redraw_count(),
            "annotations": renderer.mapped(),
        });
        write_json_pretty(&meta_path, &payload)?;
    }

    println!("{}", abs_path(&args.out).display());
    Ok(())
}

fn command_map(args: MapArgs) -> Result<()> {
    let annotations = load_annotations(&args.annotations)?;
    let natural = Size::from_pixels(args.natural.0, args.natural.1);
    if natural.is_empty() {
        bail!("natural size must be non-zero");
    }
    let display = Size::from_pixels(args.display.0, args.display.1);
    let font = LabelFont::default();

    let mapped: Vec<Value> = annotations
        .iter()
        .enumerate()
        .filter_map(|(index, ann)| {
            map_annotation(ann, natural, display, &font).map(|m| {
                json!({
                    "index": index,
                    "box": m.box_rect,
                    "label": m.label_rect,
                    "text_origin": m.label_origin,
                    "text": m.label_text,
                    "flipped": m.flipped,
                })
            })
        })
        .collect();

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "natural": natural,
            "display": display,
            "annotations": mapped,
        }))?
    );
    Ok(())
}

/// Accepts a bare annotation list or a full diagnose response object.
fn load_annotations(path: &str) -> Result<Vec<Annotation>> {
    let raw = if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read annotations from stdin")?;
        buf
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read annotations file: {path}"))?
    };
    parse_annotations(&raw)
}

fn parse_annotations(raw: &str) -> Result<Vec<Annotation>> {
    let value: Value = serde_json::from_str(raw).context("invalid annotations JSON")?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut obj) => match obj.remove("annotations") {
            Some(list) => list,
            None => bail!("annotations must be a list or an object with 'annotations'"),
        },
        _ => bail!("annotations must be a list or an object with 'annotations'"),
    };
    serde_json::from_value(list).context("invalid annotation entry")
}

fn parse_size(raw: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = raw
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WxH, got '{raw}'"))?;
    let w = w.trim().parse::<u32>().map_err(|e| format!("bad width: {e}"))?;
    let h = h.trim().parse::<u32>().map_err(|e| format!("bad height: {e}"))?;
    Ok((w, h))
}

fn write_text_file(path: &Path, content: &str) -> Result<()> {
    ensure_parent_dir(path)?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).with_context(|| format!("failed to write JSON: {}", path.display()))?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn default_sidecar_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("output")
        .to_string();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    parent.join(format!("{stem}.json"))
}

fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || matches!(lower, '.' | '_' | '-') {
            out.push(lower);
        } else if lower.is_ascii_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "result".to_string()
    } else {
        out
    }
}

fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}
