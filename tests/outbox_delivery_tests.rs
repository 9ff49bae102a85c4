//! Outbox delivery, retry exhaustion and DSN reconciliation

mod common;

use common::{fast_settings, identity, open_coordinator, ScriptedTransport};
use stationmail::email::{
    AccountChange, ComposeRequest, ConnectionStatus, CoordinatorSettings, DsnEvent, DsnOutcome,
    EmailCoordinator, NotificationAction, NotificationEvent, OfflineTransport, StationAccount,
    ThreadStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

fn request(subject: &str) -> ComposeRequest {
    ComposeRequest {
        station: "p2p.example".to_string(),
        to: vec!["X2EFGH".to_string()],
        subject: subject.to_string(),
        content: "payload".to_string(),
        ..ComposeRequest::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<NotificationEvent>) -> Vec<NotificationAction> {
    let mut actions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        actions.push(event.action);
    }
    actions
}

async fn wait_for(
    rx: &mut broadcast::Receiver<NotificationEvent>,
    action: NotificationAction,
) -> NotificationEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.action == action {
                return event;
            }
        }
    })
    .await
    .expect("notification did not arrive")
}

#[tokio::test]
async fn test_unreachable_station_keeps_thread_pending() {
    let dir = TempDir::new().unwrap();
    let coordinator = open_coordinator(fast_settings(dir.path(), 4), Arc::new(OfflineTransport)).await;
    let mut notifications = coordinator.subscribe_notifications();

    let receipt = coordinator.send(&identity(), request("Offline")).await.unwrap();
    assert!(!receipt.queued);

    coordinator.process_outbox().await;
    coordinator.process_outbox().await;

    let outbox = coordinator.get_outbox().await;
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].id(), receipt.thread.id());
    assert_eq!(outbox[0].messages(), receipt.thread.messages());

    let actions = drain(&mut notifications);
    assert_eq!(actions, vec![NotificationAction::Delayed; 3]);
}

#[tokio::test]
async fn test_failed_after_retries_exhausted() {
    let dir = TempDir::new().unwrap();
    let coordinator = open_coordinator(fast_settings(dir.path(), 3), Arc::new(OfflineTransport)).await;
    let mut notifications = coordinator.subscribe_notifications();

    let receipt = coordinator.send(&identity(), request("Doomed")).await.unwrap();
    coordinator.process_outbox().await;
    assert!(!drain(&mut notifications).contains(&NotificationAction::Failed));

    let report = coordinator.process_outbox().await;
    assert_eq!(report.failed, 1);
    assert_eq!(drain(&mut notifications), vec![NotificationAction::Failed]);
    assert!(coordinator.get_outbox().await.is_empty());
    assert_eq!(
        coordinator.get_thread(receipt.thread.id()).await.unwrap().status(),
        ThreadStatus::Failed
    );

    // Retry puts it back with a fresh budget
    let requeued = assert_ok!(coordinator.mark_as_pending(receipt.thread.id()).await);
    assert_eq!(requeued.delivery.failed_passes, 0);
    assert_eq!(coordinator.get_outbox().await.len(), 1);
}

#[tokio::test]
async fn test_accepted_send_waits_for_dsn() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(true);
    let coordinator = open_coordinator(fast_settings(dir.path(), 3), transport.clone()).await;
    let mut notifications = coordinator.subscribe_notifications();

    let receipt = coordinator.send(&identity(), request("Accepted")).await.unwrap();
    assert!(receipt.queued);
    assert_eq!(receipt.thread.status(), ThreadStatus::Pending);
    assert_eq!(drain(&mut notifications), vec![NotificationAction::Sending]);

    // Accepted is not delivered; later passes leave it alone
    coordinator.process_outbox().await;
    assert_eq!(transport.attempt_count(), 1);
    assert_eq!(coordinator.get_outbox().await.len(), 1);

    let status = coordinator
        .apply_dsn(DsnEvent::new(receipt.thread.id().clone(), DsnOutcome::Delivered, 1))
        .await
        .unwrap();
    assert_eq!(status, Some(ThreadStatus::Sent));
    assert_eq!(coordinator.get_sent().await.len(), 1);
    assert_eq!(drain(&mut notifications), vec![NotificationAction::Delivered]);
}

#[tokio::test]
async fn test_stale_failure_does_not_override_sent() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(true);
    let mut settings = fast_settings(dir.path(), 3);
    settings.outbox.dsn_timeout = Duration::ZERO;
    let coordinator = open_coordinator(settings, transport.clone()).await;

    let receipt = coordinator.send(&identity(), request("Twice")).await.unwrap();
    let id = receipt.thread.id().clone();
    coordinator.process_outbox().await;
    assert_eq!(
        transport.attempts.lock().unwrap().iter().map(|(_, seq)| *seq).collect::<Vec<_>>(),
        vec![1, 2]
    );

    coordinator
        .apply_dsn(DsnEvent::new(id.clone(), DsnOutcome::Delivered, 2))
        .await
        .unwrap();
    let stale = DsnEvent::new(
        id.clone(),
        DsnOutcome::Failed {
            reason: "timeout".to_string(),
        },
        1,
    );
    assert_eq!(coordinator.apply_dsn(stale).await.unwrap(), None);

    assert_eq!(coordinator.get_thread(&id).await.unwrap().status(), ThreadStatus::Sent);
}

#[tokio::test]
async fn test_stale_copy_cannot_rewind_attempts() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(true);
    let mut settings = fast_settings(dir.path(), 3);
    settings.outbox.dsn_timeout = Duration::ZERO;
    let coordinator = open_coordinator(settings, transport.clone()).await;

    let receipt = coordinator.send(&identity(), request("Rewind")).await.unwrap();
    let stale = receipt.thread.clone();
    assert_eq!(stale.delivery.attempt_seq, 1);
    coordinator.process_outbox().await;

    let mut edited = stale;
    edited.labels.insert("urgent".to_string());
    let saved = coordinator.save_thread(edited).await.unwrap();
    assert_eq!(saved.delivery.attempt_seq, 2);
    assert!(saved.labels.contains("urgent"));

    coordinator.process_outbox().await;
    assert_eq!(
        transport.attempts.lock().unwrap().iter().map(|(_, seq)| *seq).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn test_dsn_stream_is_applied_by_worker() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(true);
    let coordinator = Arc::new(open_coordinator(fast_settings(dir.path(), 3), transport.clone()).await);
    let mut notifications = coordinator.subscribe_notifications();
    let workers = coordinator.spawn_workers();
    assert_eq!(workers.len(), 2);

    let receipt = coordinator.send(&identity(), request("Streamed")).await.unwrap();
    let id = receipt.thread.id().clone();

    transport.report(DsnEvent::new(id.clone(), DsnOutcome::PendingApproval, 1));
    transport.report(DsnEvent::new(
        id.clone(),
        DsnOutcome::Failed {
            reason: "recipient unknown".to_string(),
        },
        1,
    ));

    wait_for(&mut notifications, NotificationAction::PendingApproval).await;
    let failed = wait_for(&mut notifications, NotificationAction::Failed).await;
    assert_eq!(failed.thread_id, id);
    assert!(failed.message.contains("recipient unknown"));
    assert_eq!(coordinator.get_thread(&id).await.unwrap().status(), ThreadStatus::Failed);

    for worker in workers {
        worker.abort();
    }
}

#[tokio::test]
async fn test_reconnect_triggers_outbox_pass() {
    let dir = TempDir::new().unwrap();
    let transport = ScriptedTransport::new(false);
    // Real backoff: a scheduled pass would wait
    let coordinator = open_coordinator(CoordinatorSettings::new(dir.path()), transport.clone()).await;
    let mut notifications = coordinator.subscribe_notifications();

    let account = StationAccount {
        station: "p2p.example".to_string(),
        callsign: "X1ABCD".to_string(),
        status: ConnectionStatus::Disconnected,
    };
    coordinator.register_account(account.clone()).await;
    coordinator.send(&identity(), request("Later")).await.unwrap();
    assert_eq!(coordinator.process_outbox().await.skipped, 1);

    transport.accept.store(true, std::sync::atomic::Ordering::SeqCst);
    let change = coordinator
        .register_account(StationAccount {
            status: ConnectionStatus::Connected,
            ..account
        })
        .await;
    assert_eq!(change, AccountChange::Reconnected);

    wait_for(&mut notifications, NotificationAction::Sending).await;
    assert_eq!(transport.attempt_count(), 2);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let id = {
        let coordinator = open_coordinator(fast_settings(dir.path(), 5), Arc::new(OfflineTransport)).await;
        let receipt = coordinator.send(&identity(), request("Durable")).await.unwrap();
        receipt.thread.id().clone()
    };

    let transport = ScriptedTransport::new(true);
    let coordinator: EmailCoordinator = open_coordinator(fast_settings(dir.path(), 5), transport.clone()).await;
    let thread = coordinator.get_thread(&id).await.unwrap();
    assert_eq!(thread.status(), ThreadStatus::Pending);
    assert_eq!(thread.delivery.failed_passes, 1);

    assert_eq!(coordinator.process_outbox().await.accepted, 1);
    assert_eq!(transport.attempts.lock().unwrap()[0].1, 2);
}
