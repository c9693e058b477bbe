use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[zbus::proxy(
    interface = "org.remembr.Remembr1",
    default_service = "org.remembr.Remembr1",
    default_path = "/org/remembr/Remembr1"
)]
trait Remembr {
    fn add_visitor(
        &self,
        name: &str,
        relationship: &str,
        last_interaction: &str,
        notes: &str,
        kind: &str,
        photo_path: &str,
    ) -> zbus::Result<String>;
    fn remove_visitor(&self, id: &str) -> zbus::Result<bool>;
    fn list_visitors(&self, kind: &str) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "remembr", about = "ReMembr visitor recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a visitor from a reference photo
    Add {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Path to a photo showing the visitor's face
        #[arg(short, long)]
        photo: PathBuf,
        /// Relationship to the patient (e.g., "Daughter")
        #[arg(short, long, default_value = "")]
        relationship: String,
        /// When the patient last saw this person
        #[arg(long, default_value = "")]
        last_interaction: String,
        /// Free-form caregiver notes
        #[arg(long, default_value = "")]
        notes: String,
        /// Mark as restricted instead of trusted
        #[arg(long)]
        blocked: bool,
    },
    /// Remove a visitor
    Remove {
        /// Visitor ID to remove
        id: String,
    },
    /// List visitors
    List {
        /// Only show "trusted" or "blocked" visitors
        #[arg(short = 't', long = "type")]
        kind: Option<String>,
    },
    /// Show daemon and recognition loop status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// Device to test
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Save the captured frame as a JPEG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Test { device, output } => camera_test(&device, output.as_deref()),
        command => {
            let conn = zbus::Connection::session()
                .await
                .context("failed to connect to the session bus")?;
            let proxy = RemembrProxy::new(&conn)
                .await
                .context("remembrd is not reachable; is the daemon running?")?;
            run_daemon_command(&proxy, command).await
        }
    }
}

async fn run_daemon_command(proxy: &RemembrProxy<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Add {
            name,
            photo,
            relationship,
            last_interaction,
            notes,
            blocked,
        } => {
            let photo = std::fs::canonicalize(&photo)
                .with_context(|| format!("photo not found: {}", photo.display()))?;
            let kind = if blocked { "blocked" } else { "trusted" };
            println!("Validating photo for {name}...");
            let id = proxy
                .add_visitor(
                    &name,
                    &relationship,
                    &last_interaction,
                    &notes,
                    kind,
                    &photo.to_string_lossy(),
                )
                .await
                .map_err(describe)?;
            println!("Added {name} ({kind}) with ID {id}");
        }
        Commands::Remove { id } => {
            if proxy.remove_visitor(&id).await? {
                println!("Removed visitor {id}");
            } else {
                bail!("no visitor with ID {id}");
            }
        }
        Commands::List { kind } => {
            let json = proxy
                .list_visitors(kind.as_deref().unwrap_or(""))
                .await
                .map_err(describe)?;
            let visitors: Vec<serde_json::Value> = serde_json::from_str(&json)?;
            if visitors.is_empty() {
                println!("No visitors");
            }
            for v in &visitors {
                println!(
                    "{}  {:<8} {:<20} {}",
                    text(&v["id"]),
                    text(&v["type"]),
                    text(&v["name"]),
                    text(&v["relationship"]),
                );
            }
        }
        Commands::Status => {
            let json = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, output } => camera_test(&device, output.as_deref())?,
    }
    Ok(())
}

/// Surface the daemon's caregiver-facing message instead of the D-Bus error name.
fn describe(e: zbus::Error) -> anyhow::Error {
    match e {
        zbus::Error::MethodError(_, Some(msg), _) => anyhow::anyhow!(msg),
        other => other.into(),
    }
}

fn text(v: &serde_json::Value) -> &str {
    v.as_str().unwrap_or("")
}

fn camera_test(device: &str, output: Option<&std::path::Path>) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = remembr_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = remembr_hw::Camera::open(device)
        .with_context(|| format!("failed to open {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut stream = camera.stream().context("failed to start streaming")?;
    let frame = stream.latest().context("frame capture failed")?;
    println!(
        "Captured frame #{}: brightness {:.1}{}",
        frame.sequence,
        frame.avg_brightness(),
        if frame.is_dark() { " (too dark for recognition)" } else { "" }
    );

    if let Some(path) = output {
        let img = frame
            .to_image()
            .context("captured frame has inconsistent dimensions")?;
        img
            .to_rgb8()
            .save_with_format(path, image::ImageFormat::Jpeg)
            .with_context(|| format!("failed to save {}", path.display()))?;
        println!("Saved frame to {}", path.display());
    }

    Ok(())
}
