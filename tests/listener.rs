mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{credentials, options, IdleMode, MockConnector, MockTransport, Recorder, StaticLookup};
use mailwatch::config::RuntimeOptions;
use mailwatch::imap::IdleEvent;
use mailwatch::provider::{self, ListenStrategy, ProviderProfile, GENERIC};
use mailwatch::session::Session;
use tokio::time::sleep;

fn session(
    connector: &Arc<MockConnector>,
    recorder: &Arc<Recorder>,
    options: RuntimeOptions,
    profile: ProviderProfile,
) -> Session {
    Session::builder("acct", credentials("user@example.com"), options, recorder.clone())
        .connector(connector.clone())
        .lookup(Arc::new(StaticLookup::new(Vec::new())))
        .profile(profile)
        .build()
}

fn idle_only() -> ProviderProfile {
    let mut p = GENERIC.clone();
    p.features.strategy = ListenStrategy::IdleOnly;
    p
}

fn idle_with_fallback() -> ProviderProfile {
    let mut p = GENERIC.clone();
    p.features.strategy = ListenStrategy::IdleWithFallback;
    p.features.fallback_grace = Duration::from_secs(60);
    p
}

fn netease() -> ProviderProfile {
    provider::profile_by_name("netease").unwrap().clone()
}

#[tokio::test(start_paused = true)]
async fn oversized_mail_is_skipped_without_downloading() {
    let connector = Arc::new(MockConnector::with_setup(|_| MockTransport::with_messages(1)));
    let recorder = Arc::new(Recorder::default());
    let opts = RuntimeOptions {
        max_message_bytes: 100,
        ..options()
    };
    let s = session(&connector, &recorder, opts, netease());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(600)).await;

    let transport = connector.transport(0);
    assert!(transport.count("search") > 2);
    assert_eq!(transport.count("fetch_size"), 1);
    assert_eq!(transport.count("fetch"), 0);
    assert!(recorder.delivered_uids().is_empty());
    assert!(!transport.seen.lock().unwrap().contains(&1));
    assert!(s.listener_snapshot().skipped.contains(&1));

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn undeliverable_mail_is_fetched_once_per_connection() {
    let connector = Arc::new(MockConnector::with_setup(|_| {
        let t = MockTransport::default();
        t.add_raw(1, "Subject: no sender\r\n\r\nbody\r\n");
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let s = session(&connector, &recorder, options(), netease());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(600)).await;

    let transport = connector.transport(0);
    assert!(transport.count("search") > 2);
    assert_eq!(transport.count("fetch"), 1);
    assert!(recorder.delivered_uids().is_empty());

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn new_uid_validity_forgets_delivered_uids() {
    let connector = Arc::new(MockConnector::with_setup(|index| {
        let t = MockTransport::default();
        if index == 0 {
            t.add_message(1, "old");
            t.noop_fails.store(true, Ordering::SeqCst);
        } else {
            *t.uid_validity.lock().unwrap() = Some(2);
            t.add_message(1, "new");
        }
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let opts = RuntimeOptions {
        health_check: true,
        health_check_interval: Duration::from_secs(10),
        ..options()
    };
    let s = session(&connector, &recorder, opts, idle_only());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(40)).await;

    assert_eq!(connector.attempts(), 2);
    assert_eq!(recorder.delivered_subjects(), vec!["old", "new"]);
    assert!(connector.transport(1).seen.lock().unwrap().contains(&1));
    assert_eq!(s.listener_snapshot().uid_validity, Some(2));

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn same_uid_validity_keeps_delivered_uids_across_reconnects() {
    let connector = Arc::new(MockConnector::with_setup(|index| {
        let t = MockTransport::default();
        t.add_message(1, "only once");
        if index == 0 {
            t.noop_fails.store(true, Ordering::SeqCst);
        }
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let opts = RuntimeOptions {
        health_check: true,
        health_check_interval: Duration::from_secs(10),
        ..options()
    };
    let s = session(&connector, &recorder, opts, idle_only());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(40)).await;

    assert_eq!(connector.attempts(), 2);
    assert_eq!(recorder.delivered_uids(), vec![1]);
    assert_eq!(connector.transport(1).count("fetch"), 0);

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn fetch_in_flight_at_disconnect_is_abandoned() {
    let connector = Arc::new(MockConnector::with_setup(|_| {
        let t = MockTransport::with_messages(1);
        t.slow_always.lock().unwrap().insert(1, Duration::from_secs(10));
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let s = session(&connector, &recorder, options(), idle_only());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    s.disconnect().await;
    sleep(Duration::from_secs(30)).await;

    let calls = connector.transport(0).calls();
    assert_eq!(calls.last().map(String::as_str), Some("logout"));
    assert!(!calls.iter().any(|c| c == "mark_seen"));
    assert!(recorder.delivered_uids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scan_requests_during_a_scan_are_coalesced() {
    let connector = Arc::new(MockConnector::with_setup(|_| {
        let t = MockTransport::with_messages(1);
        t.slow_always.lock().unwrap().insert(1, Duration::from_secs(10));
        *t.idle_mode.lock().unwrap() =
            IdleMode::Script(vec![IdleEvent::Exists(2), IdleEvent::Exists(3)].into());
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let s = session(&connector, &recorder, options(), idle_only());

    s.connect().await.unwrap();
    sleep(Duration::from_millis(500)).await;
    let transport = connector.transport(0);
    transport.add_message(2, "second");
    transport.add_message(3, "third");
    sleep(Duration::from_secs(30)).await;

    assert_eq!(recorder.delivered_uids(), vec![1, 2, 3]);
    // The initial scan plus a single follow-up for both notifications.
    assert_eq!(transport.count("search"), 2);
    let listener = s.listener_snapshot();
    assert_eq!(listener.scans_coalesced, 1);
    assert_eq!(listener.push_notifications, 2);

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn failing_idle_falls_back_to_polling_after_grace() {
    let connector = Arc::new(MockConnector::with_setup(|_| {
        let t = MockTransport::default();
        *t.idle_mode.lock().unwrap() = IdleMode::Fail;
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let s = session(&connector, &recorder, options(), idle_with_fallback());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(30)).await;
    assert!(!s.listener_snapshot().poll_active);

    sleep(Duration::from_secs(200)).await;

    let listener = s.listener_snapshot();
    assert!(listener.poll_active);
    assert!(listener.push_failures >= 3);
    assert!(connector.transport(0).count("noop") >= 1);
    assert_eq!(connector.attempts(), 1);

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn healthy_idle_needs_no_fallback_polling() {
    let connector = Arc::new(MockConnector::new());
    let recorder = Arc::new(Recorder::default());
    let s = session(&connector, &recorder, options(), idle_with_fallback());

    s.connect().await.unwrap();
    sleep(Duration::from_secs(600)).await;

    let listener = s.listener_snapshot();
    assert!(listener.push_active);
    assert!(!listener.poll_active);
    assert_eq!(connector.transport(0).count("noop"), 0);

    s.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn recovered_idle_does_not_trigger_fallback() {
    let connector = Arc::new(MockConnector::with_setup(|_| {
        let t = MockTransport::default();
        t.idle_failures.store(3, Ordering::SeqCst);
        t
    }));
    let recorder = Arc::new(Recorder::default());
    let mut profile = idle_with_fallback();
    profile.features.max_idle = Duration::from_secs(5);
    let s = session(&connector, &recorder, options(), profile);

    s.connect().await.unwrap();
    // Failures at 0s, 2s and 6s; IDLE works again from 14s.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(s.listener_snapshot().push_failures, 0);

    sleep(Duration::from_secs(200)).await;

    let listener = s.listener_snapshot();
    assert!(listener.push_active);
    assert!(!listener.poll_active);
    assert_eq!(connector.transport(0).count("noop"), 0);

    s.disconnect().await;
}
