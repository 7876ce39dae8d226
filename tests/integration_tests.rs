//! End-to-end drop scenarios across orchestrator, receiver and transports.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cloakdrop_cloak::Secret;
use cloakdrop_core::{
    DropError, DropEventKind, DropOrchestrator, DropReceiver, EventBus, Route, TransferPolicy,
    direct,
};
use cloakdrop_integration_tests::fixtures::{
    CountingStore, DropFixture, FailingStore, collect_events, wait_for_status,
};
use cloakdrop_rendezvous::{
    DropStatus, MemoryStore, NewDropRequest, RemoteStore, RendezvousServer, RendezvousStore,
    SenderAddress,
};
use cloakdrop_swarm::SwarmTransportManager;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_direct_drop_with_simulated_receiver() {
    let fixture = DropFixture::new();
    let file = fixture.payload("dataset.bin", 10 * 1024 * 1024);
    let mut events = fixture.sender_events.subscribe();
    let orchestrator = fixture.orchestrator();

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "dataset.bin")
        .await
        .unwrap();
    let id = handle.id().clone();
    let doc = fixture.store.get(&id).await.unwrap().unwrap();
    assert_eq!(fixture.sender_artifacts().len(), 1);

    // receiver side by hand: accept, pull with the token, confirm
    fixture
        .store
        .update_status(&id, DropStatus::Accepted)
        .await
        .unwrap();
    let secret = Secret::new(doc.secret).unwrap();
    let addr = format!("127.0.0.1:{}", doc.sender_address.port).parse().unwrap();
    let dest = fixture.path().join("pulled.log");
    let pulled = direct::pull(
        addr,
        Some(&secret),
        &dest,
        doc.cloaked_file_size,
        Duration::from_secs(5),
        |_| {},
    )
    .await
    .unwrap();
    assert_eq!(pulled, doc.cloaked_file_size);
    tokio::time::sleep(Duration::from_millis(200)).await;
    fixture
        .store
        .update_status(&id, DropStatus::Complete)
        .await
        .unwrap();

    assert_eq!(handle.wait().await, Ok(()));
    let events = collect_events(&mut events, Duration::from_millis(100)).await;

    let progress: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == DropEventKind::Progress)
        .map(|e| e.progress)
        .collect();
    assert!(!progress.is_empty());
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|&p| p <= doc.cloaked_file_size));
    assert_eq!(events.last().map(|e| e.kind), Some(DropEventKind::Complete));
    assert!(!events.iter().any(|e| e.kind == DropEventKind::Error));

    assert!(fixture.sender_artifacts().is_empty());
    assert!(fixture.store.get(&id).await.unwrap().is_none());
    assert_eq!(orchestrator.active_drops(), 0);
}

#[tokio::test]
async fn test_direct_drop_through_receiver() {
    let fixture = DropFixture::new();
    let file = fixture.payload("report.pdf", 300_000);
    let orchestrator = fixture.orchestrator();
    let receiver = fixture.receiver("bob");
    let mut inbox = receiver.inbox().await.unwrap();

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "report.pdf")
        .await
        .unwrap();
    let request = tokio::time::timeout(WAIT, inbox.next()).await.unwrap().unwrap();
    assert_eq!(&request.id, handle.id());
    assert_eq!(receiver.route_for(&request), Route::Direct);

    let restored = receiver.accept(&request, &fixture.downloads()).await.unwrap();
    assert_eq!(restored.file_name().unwrap(), "report.pdf");
    assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&file).unwrap());

    assert_eq!(handle.wait().await, Ok(()));
    assert!(fixture.store.is_empty());
    assert!(fixture.sender_artifacts().is_empty());
}

#[tokio::test]
async fn test_decline_ends_without_error_event() {
    let fixture = DropFixture::new();
    let file = fixture.payload("notes.txt", 4096);
    let mut events = fixture.sender_events.subscribe();
    let orchestrator = fixture.orchestrator();
    let receiver = fixture.receiver("bob");

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "notes.txt")
        .await
        .unwrap();
    let request = fixture.store.get(handle.id()).await.unwrap().unwrap();
    receiver.decline(&request).await.unwrap();

    assert_eq!(handle.wait().await, Err(DropError::PeerDeclined));
    let events = collect_events(&mut events, Duration::from_millis(100)).await;
    assert!(events.iter().any(|e| e.kind == DropEventKind::Declined));
    assert!(!events.iter().any(|e| e.kind == DropEventKind::Error));
    assert!(!events.iter().any(|e| e.kind == DropEventKind::Progress));
    assert!(events.iter().all(|e| e.bytes_transferred == 0));
    assert!(fixture.store.is_empty());
    assert!(fixture.sender_artifacts().is_empty());
}

#[tokio::test]
async fn test_receiver_abort_mid_stream_fails_drop() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let fixture = DropFixture::new();
    let file = fixture.payload("video.mp4", 32 * 1024 * 1024);
    let store = Arc::new(CountingStore::new());
    let bus = EventBus::default();
    let mut events = bus.subscribe();
    let orchestrator = DropOrchestrator::new(fixture.sender_config(), store.clone(), bus);

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "video.mp4")
        .await
        .unwrap();
    let id = handle.id().clone();
    let doc = store.inner.get(&id).await.unwrap().unwrap();
    store.inner.update_status(&id, DropStatus::Accepted).await.unwrap();

    let transferring = tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.major == "Transferring" => break,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("sender events closed: {e}"),
            }
        }
    })
    .await;
    assert!(transferring.is_ok());

    let secret = Secret::new(doc.secret).unwrap();
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", doc.sender_address.port))
        .await
        .unwrap();
    stream.write_all(&secret.to_digits()).await.unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let mut read = 0;
    while read < 256 * 1024 {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0);
        read += n;
    }
    let (saw_error, result) = tokio::join!(
        wait_for_status(&store.inner, &id, DropStatus::Error, WAIT),
        async move {
            // closing with unread data resets the connection
            drop(stream);
            tokio::time::timeout(WAIT, handle.wait()).await
        }
    );
    assert!(saw_error);
    assert!(matches!(result, Ok(Err(DropError::TransportError(_)))));
    let events = collect_events(&mut events, Duration::from_millis(100)).await;
    assert!(events.iter().any(|e| e.kind == DropEventKind::Error));
    assert!(!events.iter().any(|e| e.kind == DropEventKind::Complete));

    assert_eq!(store.status_writes(), 1);
    assert_eq!(store.deletes(), 1);
    assert!(store.inner.is_empty());
    assert!(fixture.sender_artifacts().is_empty());
    assert_eq!(orchestrator.active_drops(), 0);
}

#[tokio::test]
async fn test_bind_failure_publishes_nothing() {
    let fixture = DropFixture::new();
    let file = fixture.payload("photo.jpg", 2048);
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

    let mut config = fixture.sender_config();
    config.direct.bind_addr = taken.local_addr().unwrap();
    let orchestrator = fixture.orchestrator_with(config);
    let mut events = fixture.sender_events.subscribe();

    let result = orchestrator
        .initiate_send(&file, "bob", "alice", "photo.jpg")
        .await;
    assert!(matches!(result, Err(DropError::TransportStartFailure(_))));
    assert!(fixture.store.is_empty());
    assert!(fixture.sender_artifacts().is_empty());
    assert_eq!(orchestrator.active_drops(), 0);

    let events = collect_events(&mut events, Duration::from_millis(50)).await;
    let error = events.iter().find(|e| e.kind == DropEventKind::Error).unwrap();
    assert!(error.drop_request_id.is_none());
}

#[tokio::test]
async fn test_store_create_failure_rolls_back() {
    let fixture = DropFixture::new();
    let file = fixture.payload("photo.jpg", 2048);
    let store = Arc::new(FailingStore::failing_create());
    let orchestrator =
        DropOrchestrator::new(fixture.sender_config(), store.clone(), EventBus::default());

    let result = orchestrator
        .initiate_send(&file, "bob", "alice", "photo.jpg")
        .await;
    assert!(matches!(result, Err(DropError::RendezvousFailure(_))));
    assert!(fixture.sender_artifacts().is_empty());
    assert!(store.inner.is_empty());
    assert_eq!(orchestrator.active_drops(), 0);
}

#[tokio::test]
async fn test_store_subscribe_failure_deletes_document() {
    let fixture = DropFixture::new();
    let file = fixture.payload("photo.jpg", 2048);
    let store = Arc::new(FailingStore::failing_subscribe());
    let orchestrator =
        DropOrchestrator::new(fixture.sender_config(), store.clone(), EventBus::default());

    let result = orchestrator
        .initiate_send(&file, "bob", "alice", "photo.jpg")
        .await;
    assert!(matches!(result, Err(DropError::RendezvousFailure(_))));
    assert!(store.inner.is_empty());
    assert!(fixture.sender_artifacts().is_empty());
}

#[tokio::test]
async fn test_duplicate_terminal_writes_tear_down_once() {
    let fixture = DropFixture::new();
    let file = fixture.payload("a.bin", 1000);
    let store = Arc::new(CountingStore::new());
    let orchestrator =
        DropOrchestrator::new(fixture.sender_config(), store.clone(), EventBus::default());

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "a.bin")
        .await
        .unwrap();
    let id = handle.id().clone();
    store.inner.update_status(&id, DropStatus::Accepted).await.unwrap();
    store.inner.update_status(&id, DropStatus::Complete).await.unwrap();
    // later writes race the sender's delete
    let _ = store.inner.update_status(&id, DropStatus::Complete).await;
    let _ = store.inner.update_status(&id, DropStatus::Declined).await;

    assert_eq!(handle.wait().await, Ok(()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.creates(), 1);
    assert_eq!(store.deletes(), 1);
    assert_eq!(store.status_writes(), 0);
    assert!(store.inner.is_empty());
}

#[tokio::test]
async fn test_cancel_with_idle_client_is_bounded() {
    let fixture = DropFixture::new();
    let file = fixture.payload("a.bin", 1000);
    let orchestrator = fixture.orchestrator();

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "a.bin")
        .await
        .unwrap();
    let port = orchestrator.session(handle.id()).unwrap().direct_port;

    // connects but never sends a token
    let _idle = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    assert!(handle.cancel());
    assert_eq!(handle.wait().await, Err(DropError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(fixture.store.is_empty());
    assert!(fixture.sender_artifacts().is_empty());
}

#[tokio::test]
async fn test_shutdown_cancels_every_drop() {
    let fixture = DropFixture::new();
    let orchestrator = fixture.orchestrator();
    let first = orchestrator
        .initiate_send(&fixture.payload("a.bin", 500), "bob", "alice", "a.bin")
        .await
        .unwrap();
    let second = orchestrator
        .initiate_send(&fixture.payload("b.bin", 700), "carol", "alice", "b.bin")
        .await
        .unwrap();
    assert_eq!(orchestrator.active_drops(), 2);

    assert_eq!(orchestrator.shutdown(), 2);
    assert_eq!(first.wait().await, Err(DropError::Cancelled));
    assert_eq!(second.wait().await, Err(DropError::Cancelled));
    assert_eq!(orchestrator.active_drops(), 0);
    assert!(fixture.store.is_empty());
}

#[tokio::test]
async fn test_swarm_drop_end_to_end() {
    let fixture = DropFixture::new();
    let file = fixture.payload("video.mp4", 400_000);

    let mut sender_config = fixture.sender_config();
    sender_config.policy = TransferPolicy::Swarm;
    let mut receiver_config = fixture.receiver_config();
    receiver_config.policy = TransferPolicy::Swarm;

    let seeder = Arc::new(
        SwarmTransportManager::start(
            sender_config.swarm.session_config(),
            sender_config.swarm.manager_config(),
        )
        .await
        .unwrap(),
    );
    let leecher = Arc::new(
        SwarmTransportManager::start(
            receiver_config.swarm.session_config(),
            receiver_config.swarm.manager_config(),
        )
        .await
        .unwrap(),
    );

    let orchestrator = fixture
        .orchestrator_with(sender_config)
        .with_swarm(seeder.clone());
    let receiver = fixture
        .receiver_with(receiver_config, "bob")
        .with_swarm(leecher.clone());

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "video.mp4")
        .await
        .unwrap();
    let request = fixture.store.get(handle.id()).await.unwrap().unwrap();
    assert!(request.swarm_link.is_some());
    assert_eq!(seeder.info_hash_for(handle.id()), orchestrator.session(handle.id()).unwrap().info_hash);
    assert_eq!(receiver.route_for(&request), Route::Swarm);

    let restored = tokio::time::timeout(WAIT, receiver.accept(&request, &fixture.downloads()))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&file).unwrap());

    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(seeder.active_drops(), 0);
    assert_eq!(leecher.active_drops(), 0);
    assert!(fixture.sender_artifacts().is_empty());

    seeder.stop_session().await;
    leecher.stop_session().await;
}

#[tokio::test]
async fn test_drop_over_rendezvous_server() {
    let fixture = DropFixture::new();
    let file = fixture.payload("slides.key", 120_000);
    let server = RendezvousServer::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
        .spawn()
        .unwrap();

    let sender_store = Arc::new(RemoteStore::connect(server.local_addr()).await.unwrap());
    let receiver_store = Arc::new(RemoteStore::connect(server.local_addr()).await.unwrap());

    // unspecified bind: the server fills in the sender's IP
    let mut sender_config = fixture.sender_config();
    sender_config.direct.bind_addr = ([0, 0, 0, 0], 0).into();
    let orchestrator = DropOrchestrator::new(sender_config, sender_store, EventBus::default());
    let receiver = DropReceiver::new(
        fixture.receiver_config(),
        receiver_store,
        EventBus::default(),
        "bob",
    );
    let mut inbox = receiver.inbox().await.unwrap();

    let handle = orchestrator
        .initiate_send(&file, "bob", "alice", "slides.key")
        .await
        .unwrap();
    let request = tokio::time::timeout(WAIT, inbox.next()).await.unwrap().unwrap();
    assert_eq!(request.sender_address.host.as_deref(), Some("127.0.0.1"));

    let restored = receiver.accept(&request, &fixture.downloads()).await.unwrap();
    assert_eq!(std::fs::read(&restored).unwrap(), std::fs::read(&file).unwrap());
    assert_eq!(handle.wait().await, Ok(()));
    assert!(server.store().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn test_receiver_sees_sender_vanish() {
    let fixture = DropFixture::new();
    let store = fixture.store.clone();

    // a sender that accepts the connection and never streams
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stall = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let request = store
        .create(NewDropRequest {
            sender_id: "alice".into(),
            sender_username: "alice".into(),
            receiver_username: "bob".into(),
            original_filename: "a.bin".into(),
            cloaked_filename: "syncd-1-ab.log".into(),
            cloaked_file_size: 5000,
            secret: 111_111,
            sender_address: SenderAddress {
                host: Some("127.0.0.1".into()),
                port,
            },
            swarm_link: None,
        })
        .await
        .unwrap();

    let receiver = fixture.receiver("bob");
    let vanish = {
        let store: Arc<MemoryStore> = store.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            assert!(wait_for_status(store.as_ref(), &id, DropStatus::Accepted, WAIT).await);
            store.delete(&id).await.unwrap();
        })
    };

    let result = tokio::time::timeout(WAIT, receiver.accept(&request, &fixture.downloads()))
        .await
        .unwrap();
    assert_eq!(result, Err(DropError::RendezvousVanished));
    vanish.await.unwrap();
    assert!(store.is_empty());
    assert!(!fixture.downloads().join("a.bin").exists());
    stall.abort();
}
