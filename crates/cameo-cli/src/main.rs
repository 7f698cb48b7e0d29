use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cameo_avatar::DataUri;
use cameo_core::detector::quality::assess_capture;
use cameo_core::raster::{decode_image, encode_png};
use cameo_core::regions::find_enclosed_hole;
use cameo_core::{DetectorChain, ModelPaths, StageTimeouts, WorkingCopy};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "cameo", about = "Cameo kiosk compositing CLI")]
struct Cli {
    /// Base URL of a running cameod
    #[arg(long, default_value = "http://127.0.0.1:8787", global = true)]
    daemon: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detector chain on a photo (no daemon needed)
    Detect {
        photo: PathBuf,
        /// Directory with the ONNX models; silhouette only when omitted
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Suggest a face slot for a character template (no daemon needed)
    Slot { template: PathBuf },
    /// Start a session on the daemon and save the composite
    Compose {
        photo: PathBuf,
        #[arg(short, long)]
        character: Option<String>,
        #[arg(short, long, default_value = "composite.png")]
        out: PathBuf,
        /// Save the first preview instead of waiting for the refined result
        #[arg(long)]
        fast: bool,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Render the print layout for the current session's composite
    Print {
        #[arg(short, long, default_value = "print.png")]
        out: PathBuf,
    },
    /// Submit a face image for avatarization
    Avatarize {
        face: PathBuf,
        #[arg(long)]
        prompt: Option<String>,
        /// Where to save the avatar once completed
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Look up an avatarization task
    AvatarStatus { task_id: String },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let daemon = cli.daemon.trim_end_matches('/').to_string();
    let http = reqwest::Client::new();

    match cli.command {
        Commands::Detect { photo, model_dir } => detect(&photo, model_dir.as_deref()).await?,
        Commands::Slot { template } => slot(&template)?,
        Commands::Compose {
            photo,
            character,
            out,
            fast,
            timeout_secs,
        } => {
            let bytes = std::fs::read(&photo).with_context(|| format!("reading {}", photo.display()))?;
            let started: Value = http
                .post(format!("{daemon}/session"))
                .json(&json!({
                    "imageData": DataUri::encode(&mime_for(&photo), &bytes),
                    "characterId": character,
                }))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            println!("session {}", started["sessionId"].as_str().unwrap_or("?"));

            let deadline = Instant::now() + Duration::from_secs(timeout_secs);
            loop {
                let resp = http.get(format!("{daemon}/session/composite")).send().await?;
                let code = resp.status();
                let body: Value = resp.json().await?;
                if body["status"]["state"] == "degraded" {
                    bail!(
                        "refined composite unavailable: {}",
                        body["status"]["message"].as_str().unwrap_or("unknown error")
                    );
                }
                if let Some(url) = body["compositeDataUrl"].as_str() {
                    if code == reqwest::StatusCode::OK || fast {
                        save_data_url(url, &out)?;
                        println!(
                            "composite v{} ({}) saved to {}",
                            body["version"],
                            body["status"]["state"].as_str().unwrap_or("?"),
                            out.display()
                        );
                        break;
                    }
                }
                if Instant::now() >= deadline {
                    bail!("timed out waiting for the composite");
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
        Commands::Print { out } => {
            let resp = http.post(format!("{daemon}/session/print")).send().await?;
            if resp.status() == reqwest::StatusCode::CONFLICT {
                bail!("no composite to print; run `cameo compose` first");
            }
            let body: Value = resp.error_for_status()?.json().await?;
            if let Some(warning) = body["warning"].as_str() {
                eprintln!("warning: {warning}");
            }
            let url = body["printDataUrl"].as_str().context("daemon returned no print image")?;
            save_data_url(url, &out)?;
            println!("print saved to {}", out.display());
        }
        Commands::Avatarize { face, prompt, out } => {
            let bytes = std::fs::read(&face).with_context(|| format!("reading {}", face.display()))?;
            let filename = face.file_name().and_then(|n| n.to_str()).map(str::to_string);
            let resp = http
                .post(format!("{daemon}/avatarize"))
                .json(&json!({
                    "imageData": DataUri::encode(&mime_for(&face), &bytes),
                    "prompt": prompt,
                    "filename": filename,
                }))
                .send()
                .await?;
            report_task(resp.status(), resp.json().await?, out.as_deref())?;
        }
        Commands::AvatarStatus { task_id } => {
            let resp = http
                .get(format!("{daemon}/avatarize"))
                .query(&[("taskId", task_id.as_str())])
                .send()
                .await?;
            report_task(resp.status(), resp.json().await?, None)?;
        }
        Commands::Status => match http.get(format!("{daemon}/health")).send().await {
            Ok(resp) => {
                let body: Value = resp.json().await?;
                println!("cameod: {}", body["status"].as_str().unwrap_or("unknown"));
                println!("  characters: {}", body["characters"]);
                println!("  avatarize:  {}", if body["avatar"] == true { "enabled" } else { "disabled" });
            }
            Err(e) => println!("cameod: not reachable at {daemon} ({e})"),
        },
    }

    Ok(())
}

async fn detect(photo: &Path, model_dir: Option<&Path>) -> Result<()> {
    let bytes = std::fs::read(photo).with_context(|| format!("reading {}", photo.display()))?;
    let image = decode_image(&bytes)?;
    let models = model_dir.map(ModelPaths::in_dir).unwrap_or_default();
    let chain = DetectorChain::standard(&models, &StageTimeouts::default());
    let working = WorkingCopy::new(&image, cameo_core::raster::WORKING_MAX_DIM);

    let started = Instant::now();
    let region = chain.detect(&working).await;
    let verdict = assess_capture(region.as_ref(), image.width(), image.height());

    println!("stages:   {}", chain.stage_names().join(" -> "));
    println!("elapsed:  {} ms", started.elapsed().as_millis());
    match &region {
        Some(r) => println!(
            "face:     {:.0},{:.0} {:.0}x{:.0} via {} (confidence {:.2})",
            r.x,
            r.y,
            r.width,
            r.height,
            r.strategy.as_str(),
            r.confidence
        ),
        None => println!("face:     none (center-crop fallback would be used)"),
    }
    match verdict.message() {
        Some(msg) => println!("capture:  rejected, {msg}"),
        None => println!("capture:  accepted"),
    }
    Ok(())
}

fn slot(template: &Path) -> Result<()> {
    let bytes = std::fs::read(template).with_context(|| format!("reading {}", template.display()))?;
    let image = decode_image(&bytes)?;
    let (w, h) = image.dimensions();
    let Some(hole) = find_enclosed_hole(&image) else {
        bail!("{} has no enclosed transparent region", template.display());
    };
    let (cx, cy) = hole.center();
    let size = hole.width.max(hole.height);
    println!("# face opening at {:.0},{:.0} {:.0}x{:.0} in a {w}x{h} template", hole.x, hole.y, hole.width, hole.height);
    println!("[characters.slot]");
    println!("cx = {:.1}", cx / w as f32 * 100.0);
    println!("cy = {:.1}", cy / h as f32 * 100.0);
    println!("size = {:.1}", size / w as f32 * 100.0);
    Ok(())
}

fn report_task(status: reqwest::StatusCode, body: Value, out: Option<&Path>) -> Result<()> {
    let task = body["taskId"].as_str().unwrap_or("-");
    match body["status"].as_str() {
        Some("completed") => {
            let reused = if body["reused"] == true { " (reused)" } else { "" };
            println!("task {task}: completed{reused}");
            if let (Some(url), Some(out)) = (body["avatarDataUrl"].as_str(), out) {
                save_data_url(url, out)?;
                println!("avatar saved to {}", out.display());
            }
        }
        Some("pending") => println!("task {task}: pending; check again with `cameo avatar-status {task}`"),
        Some("failed") => bail!("task {task} failed: {}", body["error"].as_str().unwrap_or("unknown")),
        _ => bail!("avatarize error ({status}): {}", body["error"].as_str().unwrap_or("unknown")),
    }
    Ok(())
}

fn mime_for(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg".to_string(),
        Some("webp") => "image/webp".to_string(),
        _ => "image/png".to_string(),
    }
}

/// Decode a data URL and write it out as PNG.
fn save_data_url(url: &str, out: &Path) -> Result<()> {
    let uri = DataUri::parse(url).context("daemon returned an invalid data URL")?;
    let image = decode_image(&uri.bytes)?;
    std::fs::write(out, encode_png(&image)?).with_context(|| format!("writing {}", out.display()))?;
    Ok(())
}
