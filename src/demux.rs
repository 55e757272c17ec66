//! Stream demultiplexer and per-session supervision loop.
//!
//! One thread per session: routes inbound packets to per-track writers,
//! creating track + writer on first sight of a new participant, and runs
//! the finalize sequence when the session ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, TrySendError};
use log::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::buffer::RawFrame;
use crate::config::CaptureConfig;
use crate::db::{LeaveReason, MetadataStore, SessionStatus};
use crate::encode::EncoderFactory;
use crate::transport::{AudioPacket, ChannelId, ParticipantId, TransportEvent};
use crate::writer::{now_ms, spawn_writer, TrackHandle, WriterContext, WriterMsg};

/// How a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Operator stop; wait for flushes within the stop timeout.
    Graceful,
    /// The voice transport dropped; best-effort flush, session fails.
    TransportLost,
}

/// Everything one session's demultiplexer needs.
pub struct SessionContext {
    pub session_id: String,
    pub channel_id: ChannelId,
    pub db: Arc<MetadataStore>,
    pub blob: Arc<dyn BlobStore>,
    pub config: CaptureConfig,
    pub encoder_factory: EncoderFactory,
    /// Open track count, readable by the coordinator for status().
    pub live_tracks: Arc<AtomicUsize>,
    /// Misrouted/undeliverable packet count.
    pub anomalies: Arc<AtomicU64>,
}

pub fn run(
    ctx: Arc<SessionContext>,
    events: Receiver<TransportEvent>,
    control: Receiver<Shutdown>,
) {
    let writer_ctx = Arc::new(WriterContext {
        session_id: ctx.session_id.clone(),
        channel_id: ctx.channel_id,
        db: Arc::clone(&ctx.db),
        blob: Arc::clone(&ctx.blob),
        config: ctx.config.clone(),
    });

    let (done_tx, done_rx) = unbounded();
    let mut tracks: HashMap<ParticipantId, TrackHandle> = HashMap::new();
    let mut privacy_cache: HashMap<ParticipantId, bool> = HashMap::new();

    let shutdown = loop {
        select! {
            recv(control) -> msg => {
                break msg.unwrap_or(Shutdown::Graceful);
            }
            recv(events) -> msg => match msg {
                Ok(TransportEvent::Packet(packet)) => {
                    handle_packet(
                        &ctx,
                        &writer_ctx,
                        &done_tx,
                        &mut tracks,
                        &mut privacy_cache,
                        packet,
                    );
                }
                Ok(TransportEvent::Join(participant)) => {
                    // Tracks are created lazily on first audio, not on join.
                    debug!("session {}: participant {} joined", ctx.session_id, participant);
                }
                Ok(TransportEvent::Leave(participant)) => {
                    if let Some(handle) = tracks.remove(&participant) {
                        info!(
                            "session {}: participant {} left, closing track {}",
                            ctx.session_id, participant, handle.track_id
                        );
                        let _ = handle.sender.send(WriterMsg::Close(LeaveReason::Natural));
                        ctx.live_tracks.fetch_sub(1, Ordering::SeqCst);
                        // The writer finishes its final flush on its own
                        // time and reports through the done channel.
                    }
                }
                Ok(TransportEvent::Disconnected) => {
                    warn!("session {}: transport connection lost", ctx.session_id);
                    break Shutdown::TransportLost;
                }
                Err(_) => {
                    // Transport sender dropped without an explicit stop.
                    break Shutdown::Graceful;
                }
            }
        }
    };

    finalize(&ctx, tracks, done_rx, shutdown);
}

fn handle_packet(
    ctx: &Arc<SessionContext>,
    writer_ctx: &Arc<WriterContext>,
    done_tx: &crossbeam_channel::Sender<crate::writer::TrackDone>,
    tracks: &mut HashMap<ParticipantId, TrackHandle>,
    privacy_cache: &mut HashMap<ParticipantId, bool>,
    packet: AudioPacket,
) {
    let participant = packet.participant;

    if !tracks.contains_key(&participant) {
        let can_record = match privacy_cache.get(&participant) {
            Some(flag) => *flag,
            None => match ctx.db.participant_can_record(participant) {
                Ok(flag) => {
                    privacy_cache.insert(participant, flag);
                    if !flag {
                        info!(
                            "session {}: participant {} has opted out, discarding audio",
                            ctx.session_id, participant
                        );
                    }
                    flag
                }
                Err(e) => {
                    ctx.anomalies.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "session {}: privacy lookup for {} failed ({}), dropping packet",
                        ctx.session_id, participant, e
                    );
                    return;
                }
            },
        };
        if !can_record {
            return;
        }

        let track_id = match ctx.db.insert_track(&ctx.session_id, participant, now_ms()) {
            Ok(id) => id,
            Err(e) => {
                ctx.anomalies.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "session {}: could not open track for {}: {}",
                    ctx.session_id, participant, e
                );
                return;
            }
        };

        let encoder = (ctx.encoder_factory)();
        let handle = spawn_writer(
            Arc::clone(writer_ctx),
            track_id,
            participant,
            encoder,
            done_tx.clone(),
        );
        info!(
            "session {}: opened track {} for participant {}",
            ctx.session_id, track_id, participant
        );
        tracks.insert(participant, handle);
        ctx.live_tracks.fetch_add(1, Ordering::SeqCst);
    }

    let Some(handle) = tracks.get(&participant) else {
        return;
    };
    let frame = RawFrame {
        sequence: packet.sequence,
        timestamp_ms: packet.timestamp_ms,
        pcm: packet.pcm,
    };
    match handle.sender.try_send(WriterMsg::Frame(frame)) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            // Never stall the live path on a slow encoder; the loss is
            // annotated on the next segment.
            handle.overflow.fetch_add(1, Ordering::Relaxed);
        }
        Err(TrySendError::Disconnected(_)) => {
            ctx.anomalies.fetch_add(1, Ordering::Relaxed);
            error!(
                "session {}: writer for participant {} is gone",
                ctx.session_id, participant
            );
            if tracks.remove(&participant).is_some() {
                ctx.live_tracks.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

fn finalize(
    ctx: &Arc<SessionContext>,
    tracks: HashMap<ParticipantId, TrackHandle>,
    done_rx: Receiver<crate::writer::TrackDone>,
    shutdown: Shutdown,
) {
    if let Err(e) = ctx
        .db
        .update_session_status(&ctx.session_id, SessionStatus::Finalizing)
    {
        error!(
            "session {}: could not mark finalizing: {}",
            ctx.session_id, e
        );
    }

    // Ask every open track for its final flush.
    let mut pending: HashMap<i64, TrackHandle> = HashMap::new();
    for (_, handle) in tracks {
        let _ = handle.sender.send(WriterMsg::Close(LeaveReason::Disconnected));
        pending.insert(handle.track_id, handle);
    }
    let mut waiting: HashSet<i64> = pending.keys().copied().collect();

    let deadline = Instant::now() + std::time::Duration::from_millis(ctx.config.stop_timeout_ms);
    let mut failed_tracks = 0u64;

    while !waiting.is_empty() {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(timeout) {
            Ok(done) => {
                // Acks from tracks that left earlier also land here; only
                // the ones we are finalizing count against the deadline.
                if waiting.remove(&done.track_id) {
                    if let Some(handle) = pending.remove(&done.track_id) {
                        let _ = handle.join.join();
                    }
                    if done.committed_segments == 0 && done.failed_segments > 0 {
                        failed_tracks += 1;
                    }
                    debug!(
                        "session {}: track {} flushed ({} committed, {} failed)",
                        ctx.session_id,
                        done.track_id,
                        done.committed_segments,
                        done.failed_segments
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Force-close laggards instead of blocking shutdown indefinitely.
    for track_id in &waiting {
        warn!(
            "session {}: track {} missed the stop timeout, force-closing",
            ctx.session_id, track_id
        );
        if let Err(e) = ctx.db.close_track(*track_id, now_ms(), LeaveReason::TimedOut) {
            error!("session {}: force-close failed: {}", ctx.session_id, e);
        }
        failed_tracks += 1;
    }
    ctx.live_tracks.store(0, Ordering::SeqCst);

    let committed = ctx
        .db
        .committed_segment_count(&ctx.session_id)
        .unwrap_or(0);
    // Per-track failures stay isolated; the session only fails outright
    // when the transport died or nothing at all was committed.
    let status = match shutdown {
        Shutdown::TransportLost => SessionStatus::Failed,
        Shutdown::Graceful => {
            if failed_tracks > 0 && committed == 0 {
                SessionStatus::Failed
            } else {
                SessionStatus::Closed
            }
        }
    };

    if let Err(e) = ctx.db.finalize_session(&ctx.session_id, status, now_ms()) {
        error!(
            "session {}: failed to commit terminal status: {}",
            ctx.session_id, e
        );
    }
    info!(
        "session {}: finalized as {} ({} committed segments, {} anomalies)",
        ctx.session_id,
        status,
        committed,
        ctx.anomalies.load(Ordering::Relaxed)
    );
}
