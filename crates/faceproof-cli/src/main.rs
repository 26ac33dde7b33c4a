use anyhow::{Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::ExitCode;

#[zbus::proxy(
    interface = "org.faceproof.Faceproof1",
    default_service = "org.faceproof.Faceproof1",
    default_path = "/org/faceproof/Faceproof1"
)]
trait Faceproof {
    fn compare_faces(&self, image1: &str, image2: &str, request_id: &str) -> zbus::Result<String>;

    fn check_liveness(
        &self,
        image: &str,
        lenient: bool,
        threshold: f64,
        request_id: &str,
    ) -> zbus::Result<String>;

    fn generate_challenge(&self, request_id: &str) -> zbus::Result<String>;

    fn verify_challenge(
        &self,
        challenge_id: &str,
        frames: Vec<String>,
        request_id: &str,
    ) -> zbus::Result<String>;

    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "faceproof", about = "Face comparison and liveness CLI")]
struct Cli {
    /// Connect to the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    /// Request ID to attach to the call
    #[arg(long, global = true, default_value = "")]
    request_id: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare the faces in two images (file paths, URLs or data URLs)
    Compare { image1: String, image2: String },
    /// Check whether an image shows a live face
    Liveness {
        image: String,
        /// Use the blur-tolerant threshold
        #[arg(long)]
        lenient: bool,
        /// Override the liveness threshold (0-1)
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Issue a head-turn challenge
    Challenge,
    /// Verify one frame per challenge direction, in order
    VerifyChallenge {
        challenge_id: String,
        /// Frames as file paths, URLs, data URLs or storage paths
        #[arg(required = true)]
        frames: Vec<String>,
    },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    let proxy = FaceproofProxy::new(&conn)
        .await
        .context("faceproofd is not reachable")?;

    let request_id = cli.request_id.as_str();
    let reply = match cli.command {
        Commands::Compare { image1, image2 } => {
            let image1 = image_arg(&image1)?;
            let image2 = image_arg(&image2)?;
            proxy.compare_faces(&image1, &image2, request_id).await?
        }
        Commands::Liveness {
            image,
            lenient,
            threshold,
        } => {
            let image = image_arg(&image)?;
            proxy
                .check_liveness(&image, lenient, threshold.unwrap_or(-1.0), request_id)
                .await?
        }
        Commands::Challenge => proxy.generate_challenge(request_id).await?,
        Commands::VerifyChallenge {
            challenge_id,
            frames,
        } => {
            let frames = frames
                .iter()
                .map(|f| image_arg(f))
                .collect::<Result<Vec<_>>>()?;
            proxy
                .verify_challenge(&challenge_id, frames, request_id)
                .await?
        }
        Commands::Status => {
            let status = proxy.status().await?;
            println!("{}", pretty(&status));
            return Ok(ExitCode::SUCCESS);
        }
    };

    println!("{}", pretty(&reply));
    Ok(if succeeded(&reply) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Local files become data URLs; anything else is passed through for the
/// daemon to interpret.
fn image_arg(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    if arg.starts_with("http://") || arg.starts_with("https://") || arg.starts_with("data:") || !path.is_file() {
        return Ok(arg.to_string());
    }
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    };
    Ok(format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

fn succeeded(json: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(json)
        .ok()
        .and_then(|v| v.get("success").and_then(|s| s.as_bool()))
        .unwrap_or(false)
}
