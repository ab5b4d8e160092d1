use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use examgate_core::RegistrationForm;
use examgate_hw::{Camera, CameraOpener, FrameSource, V4lOpener};
use std::path::PathBuf;
use std::time::Duration;

const ERROR_PREFIX: &str = "org.examgate.Registry1.";

#[zbus::proxy(
    interface = "org.examgate.Registry1",
    default_service = "org.examgate.Registry1",
    default_path = "/org/examgate/Registry1"
)]
trait Registry {
    fn start_enrollment(&self, live: bool) -> zbus::Result<String>;
    fn capture_sample(&self, session: &str) -> zbus::Result<u32>;
    fn add_image_sample(&self, session: &str, image: &[u8]) -> zbus::Result<u32>;
    fn finalize_enrollment(&self, session: &str, form: &str, reset: bool) -> zbus::Result<String>;
    fn cancel_enrollment(&self, session: &str) -> zbus::Result<()>;
    fn verify(&self, email: &str) -> zbus::Result<String>;
    fn verify_image(&self, email: &str, image: &[u8]) -> zbus::Result<String>;
    fn list_candidates(&self) -> zbus::Result<String>;
    fn search_candidates(&self, term: &str) -> zbus::Result<String>;
    fn get_candidate(
        &self,
        email: &str,
        admin_email: &str,
        admin_password: &str,
    ) -> zbus::Result<String>;
    fn remove_candidate(
        &self,
        email: &str,
        admin_email: &str,
        admin_password: &str,
    ) -> zbus::Result<()>;
    fn set_verified(
        &self,
        email: &str,
        verified: bool,
        admin_email: &str,
        admin_password: &str,
    ) -> zbus::Result<String>;
    fn register_user(&self, email: &str, password: &str) -> zbus::Result<()>;
    fn login(&self, email: &str, password: &str) -> zbus::Result<String>;
    fn sync_now(&self) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "examgate", about = "examgate candidate registration and verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a candidate with live camera samples or uploaded images
    Enroll {
        #[arg(long)]
        email: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        course: String,
        #[arg(long)]
        state: String,
        #[arg(long)]
        university: String,
        /// Exactly four of: Maths, Physics, Chemistry, Biology, Agric, GST
        #[arg(long, value_delimiter = ',', required = true)]
        subjects: Vec<String>,
        /// Live samples to capture (ignored with --image)
        #[arg(long, default_value_t = 3)]
        samples: u32,
        /// Enroll from still images instead of the camera
        #[arg(long)]
        image: Vec<PathBuf>,
        /// Display photo stored with the record
        #[arg(long)]
        profile_image: Option<PathBuf>,
        /// Replace stored face samples instead of adding to them
        #[arg(long)]
        reset: bool,
    },
    /// Verify a live face (or an image) against a registered candidate
    Verify {
        email: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Mark a candidate verified (administrator only)
    Approve {
        email: String,
        #[arg(long)]
        admin_email: String,
        #[arg(long)]
        admin_password: String,
        /// Clear the flag instead of setting it
        #[arg(long)]
        revoke: bool,
    },
    /// List registered candidates
    List,
    /// Show one full candidate record (administrator only)
    Show {
        email: String,
        #[arg(long)]
        admin_email: String,
        #[arg(long)]
        admin_password: String,
    },
    /// Search candidates by name or email
    Search { term: String },
    /// Remove a candidate (administrator only)
    Remove {
        email: String,
        #[arg(long)]
        admin_email: String,
        #[arg(long)]
        admin_password: String,
    },
    /// Push all candidates to the remote authority now
    Sync,
    /// Show daemon status
    Status,
    /// Create a user account
    Register { email: String, password: String },
    /// Check account credentials
    Login { email: String, password: String },
    /// List V4L2 capture devices
    Cameras,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        #[arg(long, default_value = "/dev/video0")]
        device: String,
        /// Write the captured frame here as PNG
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

/// Short D-Bus error name, e.g. `NoFaceDetected`.
fn error_name(err: &zbus::Error) -> Option<&str> {
    match err {
        zbus::Error::MethodError(name, _, _) => name.as_str().strip_prefix(ERROR_PREFIX),
        _ => None,
    }
}

fn describe(err: zbus::Error) -> anyhow::Error {
    match &err {
        zbus::Error::MethodError(name, Some(desc), _) => {
            let short = name.as_str().strip_prefix(ERROR_PREFIX).unwrap_or(name.as_str());
            anyhow::anyhow!("{short}: {desc}")
        }
        _ => anyhow::Error::new(err),
    }
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

async fn connect(session: bool) -> Result<RegistryProxy<'static>> {
    let conn = if session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    tracing::debug!(session, "connected to D-Bus");
    RegistryProxy::new(&conn)
        .await
        .context("examgated is not reachable")
}

/// Reject a form the daemon would refuse before any camera is opened.
/// Sample count is checked by the daemon once samples exist.
fn precheck(form: &RegistrationForm) -> Result<()> {
    form.clone()
        .validate(1)
        .map(|_| ())
        .context("registration form rejected")
}

async fn capture_live(proxy: &RegistryProxy<'_>, session: &str, wanted: u32) -> Result<()> {
    println!("Enrollment session {session}; look at the camera.");

    let mut captured = 0;
    let mut misses = 0;
    while captured < wanted {
        match proxy.capture_sample(session).await {
            Ok(n) => {
                captured = n;
                misses = 0;
                println!("  sample {captured}/{wanted}");
            }
            Err(e) if error_name(&e) == Some("NoFaceDetected") => {
                misses += 1;
                if misses >= 20 {
                    bail!("no face detected after {misses} attempts");
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => return Err(describe(e)),
        }
    }
    Ok(())
}

async fn add_images(proxy: &RegistryProxy<'_>, session: &str, images: &[PathBuf]) -> Result<()> {
    for path in images {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let n = proxy.add_image_sample(session, &bytes).await.map_err(describe)?;
        println!("  sample {n} from {}", path.display());
    }
    Ok(())
}

/// Collect samples and finalize inside `session`. Returns the summary JSON.
async fn run_enrollment(
    proxy: &RegistryProxy<'_>,
    session: &str,
    images: &[PathBuf],
    samples: u32,
    form: &RegistrationForm,
    reset: bool,
) -> Result<String> {
    if images.is_empty() {
        capture_live(proxy, session, samples.max(1)).await?;
    } else {
        add_images(proxy, session, images).await?;
    }
    proxy
        .finalize_enrollment(session, &serde_json::to_string(form)?, reset)
        .await
        .map_err(describe)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll {
            email,
            name,
            course,
            state,
            university,
            subjects,
            samples,
            image,
            profile_image,
            reset,
        } => {
            let profile_image = profile_image
                .map(|p| std::fs::read(&p).with_context(|| format!("failed to read {}", p.display())))
                .transpose()?;
            let form = RegistrationForm {
                name,
                course,
                state,
                university,
                email,
                subjects,
                profile_image,
            };
            precheck(&form)?;

            let proxy = connect(cli.session).await?;
            let session = proxy
                .start_enrollment(image.is_empty())
                .await
                .map_err(describe)?;

            match run_enrollment(&proxy, &session, &image, samples, &form, reset).await {
                Ok(summary) => println!("{}", pretty(&summary)),
                Err(e) => {
                    if let Err(cancel) = proxy.cancel_enrollment(&session).await {
                        tracing::warn!(error = %cancel, "failed to cancel enrollment");
                    }
                    return Err(e);
                }
            }
        }
        Commands::Verify { email, image } => {
            let proxy = connect(cli.session).await?;
            let outcome = match image {
                Some(path) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("failed to read {}", path.display()))?;
                    proxy.verify_image(&email, &bytes).await
                }
                None => proxy.verify(&email).await,
            };
            match outcome {
                Ok(json) => {
                    let v: serde_json::Value = serde_json::from_str(&json)?;
                    let verdict = if v["isMatch"].as_bool() == Some(true) {
                        "MATCH"
                    } else {
                        "NO MATCH"
                    };
                    println!("{verdict} (distance {})", v["distance"]);
                }
                Err(e) if error_name(&e) == Some("NoFaceDetected") => {
                    println!("No face detected; please recapture.");
                    std::process::exit(2);
                }
                Err(e) => return Err(describe(e)),
            }
        }
        Commands::Approve {
            email,
            admin_email,
            admin_password,
            revoke,
        } => {
            let proxy = connect(cli.session).await?;
            let summary = proxy
                .set_verified(&email, !revoke, &admin_email, &admin_password)
                .await
                .map_err(describe)?;
            println!("{}", pretty(&summary));
        }
        Commands::List => {
            let proxy = connect(cli.session).await?;
            let json = proxy.list_candidates().await.map_err(describe)?;
            print_summaries(&json)?;
        }
        Commands::Show {
            email,
            admin_email,
            admin_password,
        } => {
            let proxy = connect(cli.session).await?;
            let record = proxy
                .get_candidate(&email, &admin_email, &admin_password)
                .await
                .map_err(describe)?;
            println!("{}", pretty(&record));
        }
        Commands::Search { term } => {
            let proxy = connect(cli.session).await?;
            let json = proxy.search_candidates(&term).await.map_err(describe)?;
            print_summaries(&json)?;
        }
        Commands::Remove {
            email,
            admin_email,
            admin_password,
        } => {
            let proxy = connect(cli.session).await?;
            proxy
                .remove_candidate(&email, &admin_email, &admin_password)
                .await
                .map_err(describe)?;
            println!("Removed {email}");
        }
        Commands::Sync => {
            let proxy = connect(cli.session).await?;
            println!("{}", pretty(&proxy.sync_now().await.map_err(describe)?));
        }
        Commands::Status => {
            let proxy = connect(cli.session).await?;
            println!("{}", pretty(&proxy.status().await.map_err(describe)?));
        }
        Commands::Register { email, password } => {
            let proxy = connect(cli.session).await?;
            proxy.register_user(&email, &password).await.map_err(describe)?;
            println!("Registered {email}");
        }
        Commands::Login { email, password } => {
            let proxy = connect(cli.session).await?;
            let role = proxy.login(&email, &password).await.map_err(describe)?;
            println!("Signed in as {email} ({role})");
        }
        Commands::Cameras => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({})", d.path, d.name, d.driver);
            }
        }
        Commands::Test { device, output } => {
            println!("Running camera diagnostics on {device}...");
            let opener = V4lOpener {
                device_path: device,
                width: 640,
                height: 480,
                warmup_frames: 4,
            };
            let mut camera = opener.open()?;
            let frame = camera.next_frame()?;
            println!(
                "Captured {}x{} frame #{} (avg brightness {:.1})",
                frame.width,
                frame.height,
                frame.sequence,
                frame.avg_brightness()
            );
            if let Some(path) = output {
                std::fs::write(&path, frame.encode_png()?)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("Saved {}", path.display());
            }
        }
    }

    Ok(())
}

fn print_summaries(json: &str) -> Result<()> {
    let rows: Vec<serde_json::Value> = serde_json::from_str(json)?;
    if rows.is_empty() {
        println!("No candidates");
        return Ok(());
    }
    for row in rows {
        let verified = if row["verified"].as_bool() == Some(true) { "verified" } else { "pending" };
        println!(
            "{}  {}  {}  samples={}  {}",
            row["examNumber"].as_str().unwrap_or("-"),
            row["email"].as_str().unwrap_or("-"),
            row["name"].as_str().unwrap_or("-"),
            row["samples"],
            verified
        );
    }
    Ok(())
}
