// Integration test: full call lifecycles between two controllers.
// Covers connect, hang-up, decline, no-answer, mute and the release of every
// capture device on each exit path.

mod common;

use callcore::{CallStatus, CallType};
use common::{Rig, eventually, wait_state};
use p2p_calls::calls::CallState;
use p2p_calls::types::events::NoticeKind;
use std::time::Duration;

#[tokio::test]
async fn test_video_call_connects_and_hangs_up() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;
    let bob = &rig.bob.controller;

    let record = alice.start_call(&rig.bob.id, true).await.unwrap();
    assert_eq!(record.call_type, CallType::Video);
    assert_eq!(alice.state(), CallState::Ringing);
    assert!(alice.is_video_enabled());

    bob.answer_call(&record).await.unwrap();
    wait_state(alice, CallState::Connected).await;
    wait_state(bob, CallState::Connected).await;

    let accepted = rig.store.records().await.remove(0);
    assert_eq!(accepted.status, CallStatus::Accepted);
    assert!(accepted.started_at.is_some());

    // Each side sees the other's audio and video.
    eventually("remote tracks on both sides", || {
        alice.remote_stream().is_some_and(|s| s.tracks().len() == 2)
            && bob.remote_stream().is_some_and(|s| s.tracks().len() == 2)
    })
    .await;
    assert_eq!(rig.alice.devices.live_tracks(), 2);
    assert_eq!(rig.bob.devices.live_tracks(), 2);

    alice.end_call().await;
    assert_eq!(alice.state(), CallState::Idle);
    assert!(alice.current_call().is_none());
    assert!(alice.local_stream().is_none());
    assert!(alice.remote_stream().is_none());
    wait_state(bob, CallState::Idle).await;

    let ended = rig.store.records().await.remove(0);
    assert_eq!(ended.status, CallStatus::Ended);
    assert!(ended.ended_at.is_some());
    assert_eq!(
        rig.store.status_writes(&record.id),
        vec![CallStatus::Ringing, CallStatus::Accepted, CallStatus::Ended]
    );

    assert_eq!(rig.alice.devices.live_tracks(), 0);
    assert_eq!(rig.bob.devices.live_tracks(), 0);
    eventually("all endpoints closed", || rig.network.open_endpoints() == 0).await;
}

/// Muting locally is visible on the other side's received audio track.
#[tokio::test]
async fn test_mute_is_reflected_on_remote_track() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;
    let bob = &rig.bob.controller;

    let record = alice.start_call(&rig.bob.id, false).await.unwrap();
    bob.answer_call(&record).await.unwrap();
    wait_state(bob, CallState::Connected).await;
    eventually("bob receives audio", || bob.remote_stream().is_some()).await;

    let remote_audio = bob.remote_stream().unwrap().audio_tracks();
    assert_eq!(remote_audio.len(), 1);
    assert!(remote_audio[0].is_enabled());

    assert!(alice.toggle_mute());
    assert!(alice.is_muted());
    assert!(!remote_audio[0].is_enabled());

    assert!(!alice.toggle_mute());
    assert!(remote_audio[0].is_enabled());
    alice.end_call().await;
}

#[tokio::test(start_paused = true)]
async fn test_call_duration_counts_connected_seconds() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;

    let record = alice.start_call(&rig.bob.id, false).await.unwrap();
    rig.bob.controller.answer_call(&record).await.unwrap();
    wait_state(alice, CallState::Connected).await;
    assert_eq!(alice.call_duration(), 0);

    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert_eq!(alice.call_duration(), 3);

    alice.end_call().await;
    assert_eq!(alice.call_duration(), 0);
}

/// Declining never touches the receiver's capture devices.
#[tokio::test]
async fn test_decline_ends_caller_session() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;
    let mut notices = alice.events().notice.subscribe();

    let record = alice.start_call(&rig.bob.id, false).await.unwrap();
    let declined = rig.bob.controller.decline_call(&record.id).await.unwrap();
    assert_eq!(declined.status, CallStatus::Declined);
    assert!(declined.ended_at.is_some());

    wait_state(alice, CallState::Idle).await;
    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.kind, NoticeKind::Declined);
    assert_eq!(notice.title, "Call declined");

    assert_eq!(rig.bob.devices.requests(), 0);
    assert_eq!(rig.bob.controller.state(), CallState::Idle);
    assert_eq!(rig.alice.devices.live_tracks(), 0);
    assert_eq!(
        rig.store.status_writes(&record.id),
        vec![CallStatus::Ringing, CallStatus::Declined]
    );
}

#[tokio::test]
async fn test_decline_rejects_non_ringing_and_foreign_calls() {
    let rig = Rig::new().await;
    let record = rig
        .alice
        .controller
        .start_call(&rig.bob.id, false)
        .await
        .unwrap();

    // Only the receiver may decline.
    assert!(rig.alice.controller.decline_call(&record.id).await.is_err());

    rig.alice.controller.end_call().await;
    assert!(rig.bob.controller.decline_call(&record.id).await.is_err());
    assert_eq!(
        rig.store.status_writes(&record.id),
        vec![CallStatus::Ringing, CallStatus::Ended]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_is_marked_missed() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;
    let mut notices = alice.events().notice.subscribe();

    let record = alice.start_call(&rig.bob.id, false).await.unwrap();
    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(alice.state(), CallState::Ringing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(alice.state(), CallState::Idle);

    let missed = rig.store.records().await.remove(0);
    assert_eq!(missed.id, record.id);
    assert_eq!(missed.status, CallStatus::Missed);
    assert!(missed.ended_at.is_some());

    let notice = notices.recv().await.unwrap();
    assert_eq!(notice.kind, NoticeKind::NoAnswer);
    assert_eq!(notice.title, "No answer");
    assert_eq!(rig.alice.devices.live_tracks(), 0);
    assert_eq!(rig.hub.subscriber_count(&record.id), 0);
}

/// A ring timer of an earlier call never ends a later one.
#[tokio::test(start_paused = true)]
async fn test_stale_ring_timer_does_not_end_next_call() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;

    let first = alice.start_call(&rig.bob.id, false).await.unwrap();
    alice.end_call().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    let second = alice.start_call(&rig.bob.id, false).await.unwrap();
    // Past the first call's deadline, before the second's.
    tokio::time::sleep(Duration::from_secs(27)).await;
    assert_eq!(alice.state(), CallState::Ringing);
    assert_eq!(alice.current_call().unwrap().id, second.id);
    assert_eq!(
        rig.store.status_writes(&first.id),
        vec![CallStatus::Ringing, CallStatus::Ended]
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(alice.state(), CallState::Idle);
    assert_eq!(
        rig.store.status_writes(&second.id),
        vec![CallStatus::Ringing, CallStatus::Missed]
    );
}

/// Connecting before the ring deadline disarms the no-answer timer.
#[tokio::test(start_paused = true)]
async fn test_ring_timer_does_not_downgrade_connected_call() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;

    let record = alice.start_call(&rig.bob.id, false).await.unwrap();
    rig.bob.controller.answer_call(&record).await.unwrap();
    wait_state(alice, CallState::Connected).await;

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(alice.state(), CallState::Connected);
    assert_eq!(rig.bob.controller.state(), CallState::Connected);
    assert_eq!(
        rig.store.status_writes(&record.id),
        vec![CallStatus::Ringing, CallStatus::Accepted]
    );
    alice.end_call().await;
}

/// Hanging up while the permission prompt is open leaves nothing behind.
#[tokio::test(start_paused = true)]
async fn test_hangup_during_permission_prompt() {
    let rig = Rig::new().await;
    let alice = rig.alice.controller.clone();
    rig.alice.devices.set_prompt_delay(Duration::from_secs(5));

    let bob_id = rig.bob.id.clone();
    let caller = alice.clone();
    let attempt = tokio::spawn(async move { caller.start_call(&bob_id, true).await });
    wait_state(&alice, CallState::Calling).await;

    alice.end_call().await;
    assert_eq!(alice.state(), CallState::Idle);

    let result = attempt.await.unwrap();
    assert!(result.is_err());
    assert!(rig.store.records().await.is_empty());
    assert_eq!(rig.alice.devices.requests(), 1);
    assert_eq!(rig.alice.devices.live_tracks(), 0);
    assert_eq!(alice.state(), CallState::Idle);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;

    alice.cleanup().await;
    assert_eq!(alice.state(), CallState::Idle);

    let record = alice.start_call(&rig.bob.id, true).await.unwrap();
    rig.bob.controller.answer_call(&record).await.unwrap();
    wait_state(alice, CallState::Connected).await;

    alice.cleanup().await;
    alice.cleanup().await;
    assert_eq!(alice.state(), CallState::Idle);
    assert!(alice.current_call().is_none());
    assert!(!alice.is_muted());
    assert_eq!(rig.alice.devices.live_tracks(), 0);

    // The record itself is left alone; bob ends the call when the link goes.
    wait_state(&rig.bob.controller, CallState::Idle).await;
    eventually("alice unsubscribed", || {
        rig.hub.subscriber_count(&record.id) == 0
    })
    .await;
    eventually("all endpoints closed", || rig.network.open_endpoints() == 0).await;

    // A fresh call works after cleanup.
    let next = alice.start_call(&rig.bob.id, false).await.unwrap();
    assert_ne!(next.id, record.id);
    assert_eq!(alice.state(), CallState::Ringing);
    alice.end_call().await;
}

/// Both parties hanging up at once still writes a single terminal status.
#[tokio::test]
async fn test_simultaneous_hangup_writes_terminal_once() {
    let rig = Rig::new().await;
    let alice = &rig.alice.controller;
    let bob = &rig.bob.controller;

    let record = alice.start_call(&rig.bob.id, false).await.unwrap();
    bob.answer_call(&record).await.unwrap();
    wait_state(alice, CallState::Connected).await;
    wait_state(bob, CallState::Connected).await;

    futures_util::future::join(alice.end_call(), bob.end_call()).await;
    wait_state(alice, CallState::Idle).await;
    wait_state(bob, CallState::Idle).await;

    let writes = rig.store.status_writes(&record.id);
    assert_eq!(writes.iter().filter(|s| s.is_terminal()).count(), 1);
    assert_eq!(writes.last(), Some(&CallStatus::Ended));
}

#[tokio::test]
async fn test_end_call_when_idle_is_noop() {
    let rig = Rig::new().await;
    rig.alice.controller.end_call().await;
    assert_eq!(rig.alice.controller.state(), CallState::Idle);
    assert!(rig.store.records().await.is_empty());
}
