//! Integration tests for the exchange and its telephone units.
//!
//! Each unit writes to one end of an in-memory duplex pipe; the test reads
//! the other end as the client would, so every notification is checked
//! exactly as it would appear on the wire.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use pbx_core::{Extension, TuState};
use pbx_protocol::Notification;
use pbxd::registry::{Pbx, RegistryError};
use pbxd::unit::{Unit, UnitError};
use tokio::io::{duplex, AsyncBufReadExt, BufReader, DuplexStream, Lines};
use tokio::time::timeout;

// ============================================================================
// Test Helpers
// ============================================================================

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side of a unit's connection.
struct Phone {
    unit: Arc<Unit>,
    rx: Lines<BufReader<DuplexStream>>,
}

impl Phone {
    fn new() -> Self {
        let (server, client) = duplex(4096);
        Self {
            unit: Unit::new(server),
            rx: BufReader::new(client).lines(),
        }
    }

    /// Creates a phone and registers it at `ext`, consuming `ON_HOOK <ext>`.
    async fn registered(pbx: &Pbx, ext: u32) -> Self {
        let mut phone = Self::new();
        pbx.register(&phone.unit, Extension::new(ext)).await.unwrap();
        assert_eq!(phone.next().await, format!("ON_HOOK {ext}"));
        phone
    }

    async fn next(&mut self) -> String {
        timeout(READ_TIMEOUT, self.rx.next_line())
            .await
            .expect("notification within timeout")
            .expect("read")
            .expect("line")
    }

    async fn next_notification(&mut self) -> Notification {
        Notification::parse(&self.next().await).expect("well-formed notification")
    }
}

/// Checks that two units point at each other.
async fn assert_paired(a: &Arc<Unit>, b: &Arc<Unit>) {
    let a_peer = a.peer().await.expect("a has a peer");
    let b_peer = b.peer().await.expect("b has a peer");
    assert!(Arc::ptr_eq(&a_peer, b));
    assert!(Arc::ptr_eq(&b_peer, a));
}

/// Sets up A(100) connected to B(200), draining all notifications.
async fn connected_pair(pbx: &Pbx) -> (Phone, Phone) {
    let mut a = Phone::registered(pbx, 100).await;
    let mut b = Phone::registered(pbx, 200).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    b.next().await;
    a.next().await;
    b.unit.pickup().await.unwrap();
    a.next().await;
    b.next().await;

    (a, b)
}

// ============================================================================
// Call Scenarios
// ============================================================================

#[tokio::test]
async fn test_register_notifies_on_hook() {
    let pbx = Pbx::new(1024);
    let mut phone = Phone::new();

    pbx.register(&phone.unit, Extension::new(100)).await.unwrap();

    assert_eq!(phone.next().await, "ON_HOOK 100");
    assert_eq!(phone.unit.extension(), Some(Extension::new(100)));
    assert_eq!(pbx.active_count().await, 1);
    assert!(Arc::ptr_eq(
        &pbx.lookup(Extension::new(100)).await.unwrap(),
        &phone.unit
    ));
}

#[tokio::test]
async fn test_call_setup() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    a.unit.pickup().await.unwrap();
    assert_eq!(a.next().await, "DIAL_TONE");

    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    assert_eq!(b.next().await, "RINGING");
    assert_eq!(a.next().await, "RING_BACK");

    assert_eq!(a.unit.state().await, TuState::RingBack);
    assert_eq!(b.unit.state().await, TuState::Ringing);
    assert_paired(&a.unit, &b.unit).await;
}

#[tokio::test]
async fn test_answer_connects_both_sides() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    b.next().await;
    a.next().await;

    b.unit.pickup().await.unwrap();
    assert_eq!(a.next().await, "CONNECTED 200");
    assert_eq!(b.next().await, "CONNECTED 100");
    assert_paired(&a.unit, &b.unit).await;
}

#[tokio::test]
async fn test_chat_reaches_peer() {
    let pbx = Pbx::new(1024);
    let (mut a, mut b) = connected_pair(&pbx).await;

    a.unit.chat("hello there").await.unwrap();

    assert_eq!(
        b.next_notification().await,
        Notification::Chat("hello there".to_string())
    );
    assert_eq!(a.next().await, "CONNECTED 200");
    assert_eq!(a.unit.state().await, TuState::Connected);
    assert_eq!(b.unit.state().await, TuState::Connected);
}

#[tokio::test]
async fn test_hangup_from_connected() {
    let pbx = Pbx::new(1024);
    let (mut a, mut b) = connected_pair(&pbx).await;

    a.unit.hangup().await.unwrap();

    assert_eq!(b.next().await, "DIAL_TONE");
    assert_eq!(a.next().await, "ON_HOOK 100");
    assert!(a.unit.peer().await.is_none());
    assert!(b.unit.peer().await.is_none());
}

#[tokio::test]
async fn test_dial_unregistered_extension() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(555)).await.unwrap();

    assert_eq!(a.next().await, "ERROR");
    assert_eq!(a.unit.state().await, TuState::Error);
}

#[tokio::test]
async fn test_dial_out_of_range_extension() {
    let pbx = Pbx::new(16);
    let mut a = Phone::registered(&pbx, 1).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(4_000_000)).await.unwrap();

    assert_eq!(a.next().await, "ERROR");
}

#[tokio::test]
async fn test_dial_busy_callee() {
    let pbx = Pbx::new(1024);
    let (_a, _b) = connected_pair(&pbx).await;
    let mut c = Phone::registered(&pbx, 300).await;

    c.unit.pickup().await.unwrap();
    c.next().await;
    pbx.dial(&c.unit, Extension::new(200)).await.unwrap();

    assert_eq!(c.next().await, "BUSY_SIGNAL");
    assert!(c.unit.peer().await.is_none());
}

#[tokio::test]
async fn test_dial_off_hook_callee_is_busy() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    b.unit.pickup().await.unwrap();
    b.next().await;
    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();

    assert_eq!(a.next().await, "BUSY_SIGNAL");
    assert_eq!(b.unit.state().await, TuState::DialTone);
}

#[tokio::test]
async fn test_hangup_from_busy_signal() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    b.unit.pickup().await.unwrap();
    b.next().await;
    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    assert_eq!(a.next().await, "BUSY_SIGNAL");

    a.unit.hangup().await.unwrap();

    assert_eq!(a.next().await, "ON_HOOK 100");
    assert_eq!(a.unit.state().await, TuState::OnHook);
    assert_eq!(b.unit.state().await, TuState::DialTone);
}

#[tokio::test]
async fn test_pickup_while_connected_is_noop() {
    let pbx = Pbx::new(1024);
    let (mut a, b) = connected_pair(&pbx).await;

    a.unit.pickup().await.unwrap();

    assert_eq!(a.next().await, "CONNECTED 200");
    assert_eq!(a.unit.state().await, TuState::Connected);
    assert_eq!(b.unit.state().await, TuState::Connected);
    assert_paired(&a.unit, &b.unit).await;
}

#[tokio::test]
async fn test_pickup_while_ringing_back_is_noop() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    b.next().await;
    a.next().await;

    a.unit.pickup().await.unwrap();

    assert_eq!(a.next().await, "RING_BACK");
    assert_eq!(a.unit.state().await, TuState::RingBack);
    assert_eq!(b.unit.state().await, TuState::Ringing);
    assert_paired(&a.unit, &b.unit).await;
}

#[tokio::test]
async fn test_caller_abandons_ringing_call() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    b.next().await;
    a.next().await;

    a.unit.hangup().await.unwrap();
    assert_eq!(b.next().await, "ON_HOOK 200");
    assert_eq!(a.next().await, "ON_HOOK 100");
}

#[tokio::test]
async fn test_callee_rejects_ringing_call() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let mut b = Phone::registered(&pbx, 200).await;

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    b.next().await;
    a.next().await;

    b.unit.hangup().await.unwrap();
    assert_eq!(a.next().await, "DIAL_TONE");
    assert_eq!(b.next().await, "ON_HOOK 200");
}

#[tokio::test]
async fn test_chat_when_not_connected_is_rejected() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;

    a.unit.pickup().await.unwrap();
    a.next().await;

    let err = a.unit.chat("anyone?").await.unwrap_err();
    assert!(matches!(
        err,
        UnitError::NotConnected {
            state: TuState::DialTone
        }
    ));
    assert_eq!(a.next().await, "DIAL_TONE");
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_rejects_taken_extension() {
    let pbx = Pbx::new(1024);
    let _a = Phone::registered(&pbx, 100).await;
    let b = Phone::new();

    let err = pbx.register(&b.unit, Extension::new(100)).await.unwrap_err();

    assert!(matches!(err, RegistryError::ExtensionInUse(ext) if ext == Extension::new(100)));
    assert_eq!(b.unit.extension(), None);
    assert_eq!(pbx.active_count().await, 1);
    assert_eq!(Arc::strong_count(&b.unit), 1);
}

#[tokio::test]
async fn test_register_twice_is_rejected() {
    let pbx = Pbx::new(1024);
    let a = Phone::registered(&pbx, 100).await;

    let err = pbx.register(&a.unit, Extension::new(101)).await.unwrap_err();

    assert!(matches!(err, RegistryError::AlreadyRegistered(ext) if ext == Extension::new(100)));
    assert!(pbx.lookup(Extension::new(101)).await.is_none());
}

#[tokio::test]
async fn test_register_with_closed_connection_stays_registered() {
    let pbx = Pbx::new(1024);
    let (server, client) = duplex(64);
    drop(client);
    let unit = Unit::new(server);

    let err = pbx.register(&unit, Extension::new(7)).await.unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(pbx.active_count().await, 1);
    pbx.unregister(&unit).await.ok();
    assert_eq!(pbx.active_count().await, 0);
}

// ============================================================================
// Unregistration and Reference Release
// ============================================================================

#[tokio::test]
async fn test_unregister_releases_references() {
    let pbx = Pbx::new(1024);
    let a = Phone::registered(&pbx, 100).await;
    assert_eq!(Arc::strong_count(&a.unit), 2);

    pbx.unregister(&a.unit).await.unwrap();

    assert_eq!(Arc::strong_count(&a.unit), 1);
    assert!(pbx.lookup(Extension::new(100)).await.is_none());
    assert_eq!(pbx.active_count().await, 0);
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let pbx = Pbx::new(1024);
    let a = Phone::registered(&pbx, 100).await;

    pbx.unregister(&a.unit).await.unwrap();
    pbx.unregister(&a.unit).await.unwrap();

    assert_eq!(pbx.active_count().await, 0);
}

#[tokio::test]
async fn test_unregister_hangs_up_connected_peer() {
    let pbx = Pbx::new(1024);
    let (mut a, mut b) = connected_pair(&pbx).await;
    assert_eq!(Arc::strong_count(&a.unit), 3);
    assert_eq!(Arc::strong_count(&b.unit), 3);

    pbx.unregister(&b.unit).await.unwrap();

    assert_eq!(a.next().await, "DIAL_TONE");
    assert_eq!(b.next().await, "ON_HOOK 200");
    assert!(a.unit.peer().await.is_none());
    // Test + registry for A; test only for B.
    assert_eq!(Arc::strong_count(&a.unit), 2);
    assert_eq!(Arc::strong_count(&b.unit), 1);
}

#[tokio::test]
async fn test_unregistered_unit_cannot_be_called() {
    let pbx = Pbx::new(1024);
    let mut a = Phone::registered(&pbx, 100).await;
    let b = Phone::registered(&pbx, 200).await;

    pbx.unregister(&b.unit).await.unwrap();

    a.unit.pickup().await.unwrap();
    a.next().await;
    pbx.dial(&a.unit, Extension::new(200)).await.unwrap();
    assert_eq!(a.next().await, "ERROR");
}

#[tokio::test]
async fn test_extension_reusable_after_unregister() {
    let pbx = Pbx::new(1024);
    let a = Phone::registered(&pbx, 100).await;
    pbx.unregister(&a.unit).await.unwrap();

    let b = Phone::registered(&pbx, 100).await;
    assert!(Arc::ptr_eq(
        &pbx.lookup(Extension::new(100)).await.unwrap(),
        &b.unit
    ));

    // The stale unit no longer owns the slot.
    pbx.unregister(&a.unit).await.unwrap();
    assert_eq!(pbx.active_count().await, 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mutual_dial_does_not_deadlock() {
    for round in 0..50 {
        let pbx = Arc::new(Pbx::new(1024));
        let mut a = Phone::registered(&pbx, 100).await;
        let mut b = Phone::registered(&pbx, 200).await;
        a.unit.pickup().await.unwrap();
        a.next().await;
        b.unit.pickup().await.unwrap();
        b.next().await;

        let (pbx_a, unit_a) = (Arc::clone(&pbx), Arc::clone(&a.unit));
        let (pbx_b, unit_b) = (Arc::clone(&pbx), Arc::clone(&b.unit));
        let dial_a = tokio::spawn(async move { pbx_a.dial(&unit_a, Extension::new(200)).await });
        let dial_b = tokio::spawn(async move { pbx_b.dial(&unit_b, Extension::new(100)).await });

        timeout(Duration::from_secs(5), async {
            dial_a.await.unwrap().unwrap();
            dial_b.await.unwrap().unwrap();
        })
        .await
        .unwrap_or_else(|_| panic!("dials deadlocked in round {round}"));

        // Both handsets are off the hook, so each finds the other busy.
        assert_eq!(a.unit.state().await, TuState::BusySignal);
        assert_eq!(b.unit.state().await, TuState::BusySignal);
        assert!(a.unit.peer().await.is_none());
        assert!(b.unit.peer().await.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_callers_race_for_one_callee() {
    for round in 0..50 {
        let pbx = Arc::new(Pbx::new(1024));
        let mut a = Phone::registered(&pbx, 100).await;
        let b = Phone::registered(&pbx, 200).await;
        let mut c = Phone::registered(&pbx, 300).await;
        a.unit.pickup().await.unwrap();
        a.next().await;
        c.unit.pickup().await.unwrap();
        c.next().await;

        let (pbx_a, unit_a) = (Arc::clone(&pbx), Arc::clone(&a.unit));
        let (pbx_c, unit_c) = (Arc::clone(&pbx), Arc::clone(&c.unit));
        let dial_a = tokio::spawn(async move { pbx_a.dial(&unit_a, Extension::new(200)).await });
        let dial_c = tokio::spawn(async move { pbx_c.dial(&unit_c, Extension::new(200)).await });

        timeout(Duration::from_secs(5), async {
            dial_a.await.unwrap().unwrap();
            dial_c.await.unwrap().unwrap();
        })
        .await
        .unwrap_or_else(|_| panic!("dials deadlocked in round {round}"));

        assert_eq!(b.unit.state().await, TuState::Ringing);
        let winner = b.unit.peer().await.expect("callee is paired");
        let (won, lost) = if Arc::ptr_eq(&winner, &a.unit) {
            (&a.unit, &c.unit)
        } else {
            (&c.unit, &a.unit)
        };
        assert_eq!(won.state().await, TuState::RingBack);
        assert_paired(won, &b.unit).await;
        assert_eq!(lost.state().await, TuState::BusySignal);
        assert!(lost.peer().await.is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_greeting_precedes_incoming_call() {
    for round in 0..200 {
        let pbx = Arc::new(Pbx::new(16));
        let mut caller = Phone::registered(&pbx, 1).await;
        caller.unit.pickup().await.unwrap();
        caller.next().await;

        let (pbx_d, unit) = (Arc::clone(&pbx), Arc::clone(&caller.unit));
        let dialer = tokio::spawn(async move {
            while pbx_d.lookup(Extension::new(7)).await.is_none() {
                tokio::task::yield_now().await;
            }
            pbx_d.dial(&unit, Extension::new(7)).await
        });

        let mut callee = Phone::new();
        pbx.register(&callee.unit, Extension::new(7)).await.unwrap();
        timeout(Duration::from_secs(5), dialer)
            .await
            .unwrap_or_else(|_| panic!("dialer stuck in round {round}"))
            .unwrap()
            .unwrap();

        assert_eq!(callee.next().await, "ON_HOOK 7", "round {round}");
        assert_eq!(callee.next().await, "RINGING", "round {round}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_hangups_do_not_deadlock() {
    let pbx = Pbx::new(1024);
    let (a, b) = connected_pair(&pbx).await;

    let (unit_a, unit_b) = (Arc::clone(&a.unit), Arc::clone(&b.unit));
    let hang_a = tokio::spawn(async move { unit_a.hangup().await });
    let hang_b = tokio::spawn(async move { unit_b.hangup().await });

    timeout(Duration::from_secs(5), async {
        hang_a.await.unwrap().unwrap();
        hang_b.await.unwrap().unwrap();
    })
    .await
    .expect("hangups deadlocked");

    // The first hangup leaves the other side in DIAL_TONE; the second
    // puts it back on the hook.
    assert!(a.unit.peer().await.is_none());
    assert!(b.unit.peer().await.is_none());
    assert_eq!(a.unit.state().await, TuState::OnHook);
    assert_eq!(b.unit.state().await, TuState::OnHook);
}

// ============================================================================
// Shutdown
// ============================================================================

/// Emulates a session: waits to be disconnected, then unregisters.
fn spawn_session(pbx: &Arc<Pbx>, unit: &Arc<Unit>) -> tokio::task::JoinHandle<()> {
    let (pbx, unit) = (Arc::clone(pbx), Arc::clone(unit));
    tokio::spawn(async move {
        unit.disconnected().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        pbx.unregister(&unit).await.ok();
    })
}

#[tokio::test]
async fn test_shutdown_waits_for_sessions() {
    let pbx = Arc::new(Pbx::new(1024));
    let mut phones = Vec::new();
    let mut sessions = Vec::new();
    for ext in [100, 200, 300] {
        let phone = Phone::registered(&pbx, ext).await;
        sessions.push(spawn_session(&pbx, &phone.unit));
        phones.push(phone);
    }

    timeout(Duration::from_secs(5), pbx.shutdown())
        .await
        .expect("shutdown finished");
    assert_eq!(pbx.active_count().await, 0);

    for session in sessions {
        session.await.unwrap();
    }
    for phone in &phones {
        assert!(phone.unit.is_disconnected());
        assert_eq!(Arc::strong_count(&phone.unit), 1);
    }
}

#[tokio::test]
async fn test_shutdown_with_no_sessions_returns() {
    let pbx = Pbx::new(8);
    timeout(Duration::from_secs(1), pbx.shutdown())
        .await
        .expect("shutdown finished");
    assert!(pbx.is_closing().await);
}

#[tokio::test]
async fn test_shutdown_tears_down_calls() {
    let pbx = Arc::new(Pbx::new(1024));
    let (a, b) = connected_pair(&pbx).await;
    let sessions = [spawn_session(&pbx, &a.unit), spawn_session(&pbx, &b.unit)];

    timeout(Duration::from_secs(5), pbx.shutdown())
        .await
        .expect("shutdown finished");

    for session in sessions {
        session.await.unwrap();
    }
    assert!(a.unit.peer().await.is_none());
    assert!(b.unit.peer().await.is_none());
    assert_eq!(Arc::strong_count(&a.unit), 1);
    assert_eq!(Arc::strong_count(&b.unit), 1);
}
