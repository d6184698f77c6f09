//! Session lifecycle integration tests
//!
//! Drive whole sessions through the orchestrator over loopback doubles:
//! offer, tracks, teardown by each trigger, and what reaches storage and
//! the metadata table.

mod harness;

use std::sync::Arc;
use std::time::Duration;

use capture_core::media::{ContainerFormat, MediaKind, RtpTee};
use capture_core::metadata::SessionStatus;
use capture_core::session::ArtifactKeys;
use capture_core::testing::rtp_packets;
use capture_core::transport::{Transport, TransportState};
use capture_core::OfferRequest;
use harness::{wait_until, Harness};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_recorder_started(h: &Harness, session_id: &str) {
    let registry = Arc::clone(h.orchestrator.registry());
    let started = wait_until(WAIT, || {
        let registry = Arc::clone(&registry);
        let session_id = session_id.to_string();
        async move {
            match registry.get(&session_id).await {
                Some(entry) => entry.state.recorder_started(),
                None => false,
            }
        }
    })
    .await;
    assert!(started, "recorder for {} never started", session_id);
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_explicit_close_uploads_both_artifacts() {
    let h = Harness::new();
    let conn = h.offer("full").await;
    assert!(conn.emit_track(MediaKind::Audio, rtp_packets(20, 1)));
    assert!(conn.emit_track(MediaKind::Video, rtp_packets(30, 3)));
    wait_recorder_started(&h, "full").await;

    let outcome = h.orchestrator.close_session("full").await;
    assert!(outcome.had_state);
    assert_eq!(outcome.keys.video_key.as_deref(), Some("sessions/full/recording.mp4"));
    assert_eq!(outcome.keys.audio_key.as_deref(), Some("sessions/full/audio.wav"));

    assert_eq!(h.store.put_count(), 2);
    assert_eq!(h.transcoder.calls(), 2);
    assert_eq!(conn.transport.close_count(), 1);
    assert_eq!(h.orchestrator.active_sessions().await, 0);
    assert_eq!(h.tmp_entries(), 0, "temporary directory left behind");

    let row = h.metadata.row("full").expect("metadata row");
    assert_eq!(row.record.unwrap().status, SessionStatus::InProgress);
    let completion = row.completion.expect("completion written");
    assert_eq!(completion.status, SessionStatus::Completed);
    assert_eq!(completion.storage_recording_key, outcome.keys.video_key);
    assert_eq!(completion.storage_audio_key, outcome.keys.audio_key);

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.sessions_started, 1);
    assert_eq!(metrics.sessions_finalized, 1);
    assert_eq!(metrics.active_sessions, 0);
}

#[tokio::test]
async fn test_debug_reports_live_file_then_uploads() {
    let h = Harness::new();
    let conn = h.offer("dbg").await;
    conn.emit_track(MediaKind::Video, rtp_packets(9, 3));
    wait_recorder_started(&h, "dbg").await;

    let live = h.orchestrator.debug_session("dbg").await;
    assert!(live.active);
    assert_eq!(live.transport_id.as_deref(), Some(conn.transport.id()));
    assert!(live.tmp_exists);
    assert!(live.tmp_path.unwrap().ends_with("dbg.mkv"));
    assert!(live.objects.is_empty());
    assert_eq!(live.bucket, "recordings");

    h.orchestrator.close_session("dbg").await;

    let done = h.orchestrator.debug_session("dbg").await;
    assert!(!done.active);
    assert!(!done.tmp_exists);
    let names: Vec<_> = done.objects.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["audio.wav", "recording.mp4"]);
}

// ============================================================================
// Teardown triggers
// ============================================================================

#[tokio::test]
async fn test_empty_session_finalizes_to_no_keys() {
    let h = Harness::new();
    let conn = h.offer("empty").await;

    let outcome = h.orchestrator.close_session("empty").await;
    assert!(outcome.had_state);
    assert_eq!(outcome.keys, ArtifactKeys::default());
    assert_eq!(h.store.put_count(), 0);
    assert_eq!(h.transcoder.calls(), 0);
    assert_eq!(conn.transport.close_count(), 1);
    assert_eq!(h.tmp_entries(), 0);

    let completion = h.metadata.row("empty").unwrap().completion.unwrap();
    assert!(completion.storage_recording_key.is_none());
    assert!(completion.storage_audio_key.is_none());
}

#[tokio::test]
async fn test_transport_failure_finalizes_and_deregisters() {
    let h = Harness::new();
    let conn = h.offer("drop").await;
    conn.emit_track(MediaKind::Video, rtp_packets(30, 3));
    wait_recorder_started(&h, "drop").await;

    conn.emit_state(TransportState::Connected);
    conn.emit_state(TransportState::Failed);

    let metadata = h.metadata.clone();
    assert!(
        wait_until(WAIT, || {
            let metadata = metadata.clone();
            async move { metadata.completions().contains(&"drop".to_string()) }
        })
        .await,
        "transport failure never finalized the session"
    );

    assert_eq!(h.orchestrator.active_sessions().await, 0);
    assert_eq!(conn.transport.close_count(), 1);
    assert!(h.store.get("sessions/drop/recording.mp4").is_some());
    assert_eq!(h.tmp_entries(), 0);

    // A later explicit close finds nothing and still completes the row
    let outcome = h.orchestrator.close_session("drop").await;
    assert!(!outcome.had_state);
    assert_eq!(h.orchestrator.metrics().sessions_finalized, 1);
    assert_eq!(h.store.put_count(), 2);
}

#[tokio::test]
async fn test_non_terminal_states_keep_session_alive() {
    let h = Harness::new();
    let conn = h.offer("flaky").await;

    conn.emit_state(TransportState::Connecting);
    conn.emit_state(TransportState::Connected);
    conn.emit_state(TransportState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.orchestrator.active_sessions().await, 1);
    assert_eq!(conn.transport.close_count(), 0);
    h.orchestrator.close_session("flaky").await;
}

#[tokio::test]
async fn test_upload_failure_in_transport_teardown_is_swallowed() {
    let h = Harness::new();
    h.store.fail_puts_ending_with("audio.wav");
    let conn = h.offer("partial").await;
    conn.emit_track(MediaKind::Audio, rtp_packets(10, 1));
    wait_recorder_started(&h, "partial").await;

    conn.emit_state(TransportState::Closed);

    let metadata = h.metadata.clone();
    assert!(
        wait_until(WAIT, || {
            let metadata = metadata.clone();
            async move { !metadata.completions().is_empty() }
        })
        .await
    );

    let completion = h.metadata.row("partial").unwrap().completion.unwrap();
    assert_eq!(
        completion.storage_recording_key.as_deref(),
        Some("sessions/partial/recording.mp4")
    );
    assert!(completion.storage_audio_key.is_none());

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.finalize_errors_swallowed, 1);
    assert_eq!(metrics.uploads_failed, 1);
    assert_eq!(h.tmp_entries(), 0);
}

#[tokio::test]
async fn test_concurrent_closes_upload_once() {
    let h = Harness::new();
    let conn = h.offer("twice").await;
    conn.emit_track(MediaKind::Video, rtp_packets(30, 3));
    wait_recorder_started(&h, "twice").await;

    let (a, b) = tokio::join!(
        h.orchestrator.close_session("twice"),
        h.orchestrator.close_session("twice"),
    );

    assert!(a.had_state || b.had_state);
    for outcome in [&a, &b] {
        if outcome.had_state {
            assert_eq!(
                outcome.keys.video_key.as_deref(),
                Some("sessions/twice/recording.mp4")
            );
        }
    }
    assert_eq!(h.store.put_count(), 2);
    assert_eq!(h.orchestrator.metrics().sessions_finalized, 1);
}

#[tokio::test]
async fn test_close_unknown_session_is_not_an_error() {
    let h = Harness::new();

    let outcome = h.orchestrator.close_session("ghost").await;
    assert!(!outcome.had_state);
    assert_eq!(outcome.keys, ArtifactKeys::default());
    assert_eq!(h.metadata.completions(), vec!["ghost".to_string()]);

    let debug = h.orchestrator.debug_session("ghost").await;
    assert!(!debug.active);
    assert!(debug.transport_id.is_none());
    assert!(debug.objects.is_empty());
}

#[tokio::test]
async fn test_shutdown_closes_every_session() {
    let h = Harness::new();
    let a = h.offer("a").await;
    let b = h.offer("b").await;
    a.emit_track(MediaKind::Video, rtp_packets(6, 3));
    wait_recorder_started(&h, "a").await;

    h.orchestrator.shutdown_all().await;

    assert_eq!(h.orchestrator.active_sessions().await, 0);
    assert_eq!(a.transport.close_count(), 1);
    assert_eq!(b.transport.close_count(), 1);
    let mut completed = h.metadata.completions();
    completed.sort();
    assert_eq!(completed, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(h.orchestrator.metrics().sessions_finalized, 2);
}

// ============================================================================
// Duplicate offers
// ============================================================================

#[tokio::test]
async fn test_repeated_offer_replaces_live_session() {
    let h = Harness::new();
    let old = h.offer("dup").await;
    old.emit_track(MediaKind::Video, rtp_packets(30, 3));
    wait_recorder_started(&h, "dup").await;

    let new = h.offer("dup").await;

    // The old session was finalized exactly once before the new one landed
    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.zombie_replacements, 1);
    assert_eq!(metrics.sessions_finalized, 1);
    assert_eq!(metrics.active_sessions, 1);
    assert_eq!(old.transport.close_count(), 1);
    assert_eq!(new.transport.close_count(), 0);
    assert_eq!(h.store.put_count(), 2);

    let registry = h.orchestrator.registry();
    assert_eq!(registry.len().await, 1);
    let entry = registry.get("dup").await.unwrap();
    assert_eq!(entry.transport_id(), new.transport.id());
    assert!(registry.transport(old.transport.id()).await.is_none());

    // The replacement owns the row again; nothing completed it yet
    assert!(h.metadata.completions().is_empty());
    let row = h.metadata.row("dup").unwrap();
    assert!(row.completion.is_none());

    // Late events from the old transport do not touch the new session
    old.emit_state(TransportState::Failed);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(registry.len().await, 1);

    let outcome = h.orchestrator.close_session("dup").await;
    assert!(outcome.had_state);
    assert_eq!(outcome.keys, ArtifactKeys::default());
    assert_eq!(h.orchestrator.metrics().sessions_finalized, 2);
}

// ============================================================================
// Recorder fallback
// ============================================================================

#[tokio::test]
async fn test_fallback_format_records_and_uploads_original() {
    let h = Harness::with_formats(
        ContainerFormat::Matroska,
        ContainerFormat::Webm,
        vec![ContainerFormat::Matroska],
    );
    h.transcoder.fail_video();
    let conn = h.offer("fb").await;
    conn.emit_track(MediaKind::Video, rtp_packets(30, 3));
    wait_recorder_started(&h, "fb").await;

    let entry = h.orchestrator.registry().get("fb").await.unwrap();
    assert_eq!(entry.state.container_format(), ContainerFormat::Webm);
    assert!(entry.state.recording_path().ends_with("fb.webm"));
    assert_eq!(
        *h.writers.log.starts.lock(),
        vec![ContainerFormat::Matroska, ContainerFormat::Webm]
    );

    let outcome = h.orchestrator.close_session("fb").await;
    assert_eq!(outcome.keys.video_key.as_deref(), Some("sessions/fb/recording.webm"));
    assert_eq!(
        h.store.content_type("sessions/fb/recording.webm").as_deref(),
        Some("video/webm")
    );

    let metrics = h.orchestrator.metrics();
    assert_eq!(metrics.recorder_fallbacks, 1);
    assert_eq!(metrics.transcode_failures, 1);
}

#[tokio::test]
async fn test_recorder_failure_degrades_to_no_recording() {
    let h = Harness::with_formats(
        ContainerFormat::Matroska,
        ContainerFormat::Webm,
        vec![ContainerFormat::Matroska, ContainerFormat::Webm],
    );
    let conn = h.offer("norec").await;
    conn.emit_track(MediaKind::Video, rtp_packets(30, 3));

    let log = h.writers.log.clone();
    assert!(wait_until(WAIT, || {
        let log = log.clone();
        async move { log.starts.lock().len() == 2 }
    })
    .await);

    // The session stays up without a recording
    assert_eq!(h.orchestrator.active_sessions().await, 1);

    let outcome = h.orchestrator.close_session("norec").await;
    assert!(outcome.had_state);
    assert_eq!(outcome.keys, ArtifactKeys::default());
    assert_eq!(h.store.put_count(), 0);
    assert_eq!(h.orchestrator.metrics().recorder_start_failures, 2);
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test]
async fn test_malformed_offer_creates_nothing() {
    let h = Harness::new();

    let err = h
        .orchestrator
        .accept_offer(OfferRequest::new("not a session description"))
        .await
        .unwrap_err();
    assert!(err.is_negotiation_error());
    assert!(h.transports.connections().is_empty());
    assert_eq!(h.orchestrator.active_sessions().await, 0);
}

#[tokio::test]
async fn test_rejected_negotiation_leaves_no_state() {
    let h = Harness::new();
    h.transports.reject_offers();

    let err = h
        .orchestrator
        .accept_offer(OfferRequest::new(harness::OFFER).with_session_id("rej"))
        .await
        .unwrap_err();
    assert!(err.is_negotiation_error());
    assert_eq!(h.orchestrator.active_sessions().await, 0);
    assert_eq!(h.tmp_entries(), 0);
    assert!(h.metadata.row("rej").is_none());
}

#[tokio::test]
async fn test_generated_session_id() {
    let h = Harness::new();

    let answer = h
        .orchestrator
        .accept_offer(OfferRequest::new(harness::OFFER))
        .await
        .unwrap();
    assert_eq!(answer.session_id.len(), 36);
    assert!(h.orchestrator.registry().get(&answer.session_id).await.is_some());

    let row = h.metadata.row(&answer.session_id).unwrap();
    assert_eq!(row.record.unwrap().status, SessionStatus::InProgress);
    h.orchestrator.close_session(&answer.session_id).await;
}

// ============================================================================
// Fan-out
// ============================================================================

#[tokio::test]
async fn test_stalled_consumer_does_not_hold_back_the_other() {
    let tee = RtpTee::new();
    let mut fast = tee.subscribe();
    let _stalled = tee.subscribe();

    for packet in rtp_packets(100, 1) {
        tee.publish(packet);
    }
    tee.close();

    let mut seen = Vec::new();
    while let Some(packet) = fast.recv().await {
        seen.push(packet.header.sequence_number);
    }
    assert_eq!(seen, (0..100).collect::<Vec<u16>>());
}
