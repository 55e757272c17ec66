//! Session coordinator: owns the session table and lifecycle state machine.
//!
//! All mutation of a session's state is serialized through its channel's
//! map entry; only one transition is ever in flight per session.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fs2::FileExt;
use log::info;
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::CaptureConfig;
use crate::db::{MetadataStore, SessionStatus};
use crate::demux::{self, SessionContext, Shutdown};
use crate::encode::{opus_encoder_factory, EncoderFactory};
use crate::error::{CaptureError, Result};
use crate::transport::{ChannelId, TransportEvent};
use crate::writer::now_ms;

/// Capacity of the transport -> demultiplexer channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A successfully started session. The transport adapter feeds audio and
/// membership events through `events`.
pub struct StartedSession {
    pub session_id: String,
    pub events: Sender<TransportEvent>,
}

struct SessionEntry {
    session_id: String,
    events_tx: Sender<TransportEvent>,
    control_tx: Sender<Shutdown>,
    live_tracks: Arc<AtomicUsize>,
    demux: Mutex<Option<thread::JoinHandle<()>>>,
}

pub struct SessionCoordinator {
    db: Arc<MetadataStore>,
    blob: Arc<dyn BlobStore>,
    config: CaptureConfig,
    encoder_factory: EncoderFactory,
    sessions: DashMap<ChannelId, SessionEntry>,
    /// session id -> owning channel, for stop()/status() lookups.
    index: DashMap<String, ChannelId>,
}

impl SessionCoordinator {
    pub fn new(db: Arc<MetadataStore>, blob: Arc<dyn BlobStore>, config: CaptureConfig) -> Self {
        let encoder_factory = opus_encoder_factory(&config);
        Self::with_encoder_factory(db, blob, config, encoder_factory)
    }

    /// Inject a custom encoder factory (tests use this to simulate a
    /// failing encoding process).
    pub fn with_encoder_factory(
        db: Arc<MetadataStore>,
        blob: Arc<dyn BlobStore>,
        config: CaptureConfig,
        encoder_factory: EncoderFactory,
    ) -> Self {
        Self {
            db,
            blob,
            config,
            encoder_factory,
            sessions: DashMap::new(),
            index: DashMap::new(),
        }
    }

    /// Begin capturing in a channel. Rejects if a session is already
    /// active or finalizing there, or if the channel has opted out.
    pub fn start(&self, channel_id: ChannelId) -> Result<StartedSession> {
        if !self.db.channel_can_record(channel_id)? {
            return Err(CaptureError::RecordingForbidden(format!(
                "channel {} has recording disabled",
                channel_id
            )));
        }

        // The map entry lock is what makes concurrent starts race-free:
        // exactly one caller wins the vacancy.
        match self.sessions.entry(channel_id) {
            Entry::Occupied(mut occupied) => {
                let live = self
                    .db
                    .session_status(&occupied.get().session_id)?
                    .map(|s| !s.is_terminal())
                    .unwrap_or(false);
                if live {
                    return Err(CaptureError::ConcurrencyConflict(format!(
                        "channel {} already has session '{}'",
                        channel_id,
                        occupied.get().session_id
                    )));
                }
                // Stale entry from a session that ended on its own (e.g.
                // transport loss). Replace it.
                let started = self.open_session(channel_id)?;
                let old = occupied.insert(started.1);
                self.index.remove(&old.session_id);
                if let Some(join) = old.demux.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = join.join();
                }
                Ok(started.0)
            }
            Entry::Vacant(vacant) => {
                // The database may hold a live session this coordinator
                // never opened (another process, or a crash mid-capture).
                if let Some(existing) = self.db.live_session_for_channel(channel_id)? {
                    return Err(CaptureError::ConcurrencyConflict(format!(
                        "channel {} already has session '{}' on record",
                        channel_id, existing
                    )));
                }
                let started = self.open_session(channel_id)?;
                vacant.insert(started.1);
                Ok(started.0)
            }
        }
    }

    fn open_session(&self, channel_id: ChannelId) -> Result<(StartedSession, SessionEntry)> {
        let session_id = Uuid::new_v4().to_string();
        self.db
            .insert_session(&session_id, channel_id, now_ms())?;
        self.index.insert(session_id.clone(), channel_id);

        let (events_tx, events_rx) = bounded::<TransportEvent>(EVENT_CHANNEL_CAPACITY);
        let (control_tx, control_rx) = bounded::<Shutdown>(1);
        let live_tracks = Arc::new(AtomicUsize::new(0));

        let ctx = Arc::new(SessionContext {
            session_id: session_id.clone(),
            channel_id,
            db: Arc::clone(&self.db),
            blob: Arc::clone(&self.blob),
            config: self.config.clone(),
            encoder_factory: Arc::clone(&self.encoder_factory),
            live_tracks: Arc::clone(&live_tracks),
            anomalies: Arc::new(AtomicU64::new(0)),
        });

        let join = thread::Builder::new()
            .name(format!("demux-{}", channel_id))
            .spawn(move || demux::run(ctx, events_rx, control_rx))
            .map_err(|e| CaptureError::StorageFailure(format!("spawn failed: {}", e)))?;

        info!("started session {} in channel {}", session_id, channel_id);

        let entry = SessionEntry {
            session_id: session_id.clone(),
            events_tx: events_tx.clone(),
            control_tx,
            live_tracks,
            demux: Mutex::new(Some(join)),
        };
        Ok((
            StartedSession {
                session_id,
                events: events_tx,
            },
            entry,
        ))
    }

    /// Stop a session. Idempotent: stopping a session that is already
    /// finalizing or terminal returns its current status.
    pub fn stop(&self, session_id: &str) -> Result<SessionStatus> {
        let channel_id = self.index.get(session_id).map(|r| *r.value());

        if let Some(channel_id) = channel_id {
            let join = match self.sessions.get(&channel_id) {
                Some(entry) if entry.session_id == session_id => {
                    let _ = entry.control_tx.send(Shutdown::Graceful);
                    entry
                        .demux
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .take()
                }
                _ => None,
            };
            if let Some(join) = join {
                // The demultiplexer's finalize sequence is itself bounded
                // by the stop timeout.
                let _ = join.join();
            }
            self.sessions
                .remove_if(&channel_id, |_, entry| entry.session_id == session_id);
            self.index.remove(session_id);
        }

        match self.db.session_status(session_id)? {
            Some(status) => Ok(status),
            None => Err(CaptureError::ConcurrencyConflict(format!(
                "unknown session '{}'",
                session_id
            ))),
        }
    }

    /// Current state and open track count.
    pub fn status(&self, session_id: &str) -> Result<(SessionStatus, usize)> {
        let status = self
            .db
            .session_status(session_id)?
            .ok_or_else(|| {
                CaptureError::ConcurrencyConflict(format!("unknown session '{}'", session_id))
            })?;

        let live = self
            .index
            .get(session_id)
            .map(|r| *r.value())
            .and_then(|channel_id| {
                self.sessions.get(&channel_id).and_then(|entry| {
                    if entry.session_id == session_id {
                        Some(entry.live_tracks.load(Ordering::SeqCst))
                    } else {
                        None
                    }
                })
            })
            .unwrap_or(0);

        Ok((status, live))
    }

    /// The transport event sender for a running session, if any.
    pub fn events_sender(&self, session_id: &str) -> Option<Sender<TransportEvent>> {
        let channel_id = self.index.get(session_id).map(|r| *r.value())?;
        self.sessions.get(&channel_id).and_then(|entry| {
            if entry.session_id == session_id {
                Some(entry.events_tx.clone())
            } else {
                None
            }
        })
    }
}

/// Exclusive lock on an archive directory so two capture processes never
/// share one metadata database.
pub struct ArchiveLock {
    _file: File,
}

impl ArchiveLock {
    pub fn acquire(archive_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(archive_dir)?;
        let lock_path = archive_dir.join(".capture.lock");
        let file = File::create(&lock_path)?;
        file.try_lock_exclusive().map_err(|_| {
            CaptureError::ConcurrencyConflict(format!(
                "another capture process holds '{}'",
                lock_path.display()
            ))
        })?;
        Ok(Self { _file: file })
    }
}
