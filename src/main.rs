use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};

use voice_recall::blob::FsBlobStore;
use voice_recall::coordinator::ArchiveLock;
use voice_recall::db::MetadataStore;
use voice_recall::recall::{parse_shorthand, TimeWindow};
use voice_recall::transport::{self, TransportEvent, WireError};
use voice_recall::writer::now_ms;
use voice_recall::{CaptureConfig, RecallIndex, SessionCoordinator};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportFormat {
    /// Chained Ogg/Opus, concatenated committed segments
    Ogg,
    /// Decoded 16-bit PCM with silence between segments
    Wav,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrivacyAction {
    Allow,
    Deny,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Capture multi-participant voice sessions and recall them later")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture a session, reading framed transport events from stdin
    Capture {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Channel to record
        #[arg(long)]
        channel: u64,
    },
    /// List recorded sessions
    Sessions {
        /// Only sessions started within this window, e.g. "30s", "2h", "1w"
        #[arg(long)]
        since: Option<String>,

        /// Archive directory
        #[arg(long, default_value = "archive")]
        archive: PathBuf,
    },
    /// Resolve a session into its segment timeline (JSON)
    Resolve {
        session_id: String,

        /// Restrict to these participants
        #[arg(long)]
        participant: Vec<u64>,

        /// Window start, session-relative milliseconds
        #[arg(long)]
        from_ms: Option<i64>,

        /// Window end, session-relative milliseconds
        #[arg(long)]
        to_ms: Option<i64>,

        #[arg(long, default_value = "archive")]
        archive: PathBuf,
    },
    /// Export one participant's audio from a finalized session
    Export {
        session_id: String,

        #[arg(long)]
        participant: u64,

        #[arg(long, value_enum, default_value = "ogg")]
        format: ExportFormat,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "archive")]
        archive: PathBuf,
    },
    /// Allow or deny recording for a participant or channel
    Privacy {
        #[arg(value_enum)]
        action: PrivacyAction,

        #[arg(long)]
        participant: Option<u64>,

        #[arg(long)]
        channel: Option<u64>,

        #[arg(long, default_value = "archive")]
        archive: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Capture { config, channel } => capture(config, channel),
        Command::Sessions { since, archive } => sessions(since, archive),
        Command::Resolve {
            session_id,
            participant,
            from_ms,
            to_ms,
            archive,
        } => resolve(session_id, participant, from_ms, to_ms, archive),
        Command::Export {
            session_id,
            participant,
            format,
            output,
            archive,
        } => export(session_id, participant, format, output, archive),
        Command::Privacy {
            action,
            participant,
            channel,
            archive,
        } => privacy(action, participant, channel, archive),
    }
}

fn open_store(archive: &PathBuf) -> Result<Arc<MetadataStore>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(archive)?;
    Ok(Arc::new(MetadataStore::open(&archive.join("capture.db"))?))
}

fn capture(config_path: Option<PathBuf>, channel: u64) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => CaptureConfig::load(&path)?,
        None => CaptureConfig::default(),
    };
    config.validate()?;

    let _lock = ArchiveLock::acquire(&config.archive_dir)?;
    let db = open_store(&config.archive_dir)?;
    let blob = Arc::new(FsBlobStore::new(&config.archive_dir.join("segments"))?);
    let coordinator = SessionCoordinator::new(db, blob, config);

    let started = coordinator.start(channel)?;
    println!("session {}", started.session_id);

    let mut stdin = std::io::stdin().lock();
    loop {
        match transport::read_event(&mut stdin) {
            Ok(Some(event)) => {
                let disconnect = matches!(event, TransportEvent::Disconnected);
                if started.events.send(event).is_err() {
                    warn!("session ended on its own, stopping input");
                    break;
                }
                if disconnect {
                    break;
                }
            }
            Ok(None) => {
                info!("transport input finished");
                break;
            }
            Err(WireError::Io(e)) => return Err(e.into()),
            Err(e) => {
                // A framing error means we can no longer trust stream
                // alignment; end the session rather than resync.
                error!("transport framing error: {}", e);
                let _ = started.events.send(TransportEvent::Disconnected);
                break;
            }
        }
    }

    let status = coordinator.stop(&started.session_id)?;
    println!("session {} {}", started.session_id, status);
    Ok(())
}

fn sessions(since: Option<String>, archive: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_store(&archive)?;
    let index = RecallIndex::new(db);

    let window_ms = match since {
        Some(shorthand) => parse_shorthand(&shorthand)?,
        None => i64::MAX / 2,
    };
    for session in index.sessions_since(now_ms(), window_ms)? {
        let ended = session
            .ended_at_ms
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\tchannel {}\t{}\t{} .. {}",
            session.id, session.channel_id, session.status, session.started_at_ms, ended
        );
    }
    Ok(())
}

fn resolve(
    session_id: String,
    participants: Vec<u64>,
    from_ms: Option<i64>,
    to_ms: Option<i64>,
    archive: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_store(&archive)?;
    let index = RecallIndex::new(db);

    let filter = if participants.is_empty() {
        None
    } else {
        Some(participants.as_slice())
    };
    let window = match (from_ms, to_ms) {
        (None, None) => None,
        (from, to) => Some(TimeWindow {
            start_ms: from.unwrap_or(0),
            end_ms: to.unwrap_or(i64::MAX),
        }),
    };

    let timeline = index.resolve(&session_id, filter, window)?;
    println!("{}", serde_json::to_string_pretty(&timeline)?);
    Ok(())
}

fn export(
    session_id: String,
    participant: u64,
    format: ExportFormat,
    output: PathBuf,
    archive: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_store(&archive)?;
    let blob = FsBlobStore::new(&archive.join("segments"))?;
    let index = RecallIndex::new(db);

    match format {
        ExportFormat::Ogg => {
            let mut file = File::create(&output)?;
            let bytes = index.export_ogg(&blob, &session_id, participant, &mut file)?;
            println!("wrote {} bytes to {}", bytes, output.display());
        }
        ExportFormat::Wav => {
            let sample_rate = CaptureConfig::default().sample_rate;
            let file = File::create(&output)?;
            let samples = index.export_wav(&blob, &session_id, participant, sample_rate, file)?;
            println!("wrote {} samples to {}", samples, output.display());
        }
    }
    Ok(())
}

fn privacy(
    action: PrivacyAction,
    participant: Option<u64>,
    channel: Option<u64>,
    archive: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    if participant.is_none() && channel.is_none() {
        return Err("specify --participant and/or --channel".into());
    }
    let db = open_store(&archive)?;
    let allow = matches!(action, PrivacyAction::Allow);

    if let Some(id) = participant {
        db.set_participant_can_record(id, allow)?;
        println!("participant {}: recording {}", id, if allow { "allowed" } else { "denied" });
    }
    if let Some(id) = channel {
        db.set_channel_can_record(id, allow)?;
        println!("channel {}: recording {}", id, if allow { "allowed" } else { "denied" });
    }
    Ok(())
}
