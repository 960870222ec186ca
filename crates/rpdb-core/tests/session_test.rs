//! End-to-end session scenarios over real loopback sockets.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rpdb_core::config::DebugConfig;
use rpdb_core::{
    BasicEngine, Console, ConsoleHandle, DebugError, DebugSessionController, Frame,
    ControllerState, PortClaimRegistry, SessionBroker, SessionOutcome, Terminal,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn memory_registry() -> (Arc<PortClaimRegistry>, DuplexStream) {
    let (remote, local) = duplex(8192);
    let (reader, writer) = tokio::io::split(local);
    (Arc::new(PortClaimRegistry::new(ConsoleHandle::new(Console::new(reader, writer)))), remote)
}

fn controller(config: DebugConfig, registry: Arc<PortClaimRegistry>) -> Arc<DebugSessionController> {
    Arc::new(DebugSessionController::with_registry(
        config,
        registry,
        Arc::new(BasicEngine::factory()),
    ))
}

async fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
}

async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..250 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {port}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_set_trace_yields_one_recurrence() {
    let (registry, _stdio) = memory_registry();
    let port = free_port().await;
    let controller =
        controller(DebugConfig::default().with_endpoint("127.0.0.1", port), Arc::clone(&registry));

    let spawn_trace = |label: &'static str| {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.set_trace(Frame::here(label)).await })
    };
    let mut first = spawn_trace("first");
    let mut second = spawn_trace("second");

    // The loser returns right away; the winner waits for an operator.
    let (recurrent, winner) = tokio::select! {
        outcome = &mut first => (outcome.unwrap(), second),
        outcome = &mut second => (outcome.unwrap(), first),
    };
    assert!(matches!(recurrent, SessionOutcome::Recurrent));
    assert!(registry.is_claimed_by(port, controller.owner()).await);
    // The winner is still waiting for its operator.
    assert_eq!(controller.state(), ControllerState::Acquiring);

    let mut operator = connect_with_retry(port).await;
    operator.write_all(b"c\n").await.unwrap();
    assert!(matches!(winner.await.unwrap(), SessionOutcome::Detached(Terminal::Resume)));
    assert!(!registry.is_claimed(port).await);
    assert_eq!(controller.state(), ControllerState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_stdin_read_does_not_stall_sessions() {
    let (registry, mut stdio) = memory_registry();
    let port = free_port().await;
    let controller =
        controller(DebugConfig::default().with_endpoint("127.0.0.1", port), Arc::clone(&registry));

    // Program code blocked reading its standard input.
    let reader = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.stdio().read_line().await })
    };

    let session = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.set_trace(Frame::here("blocked reader")).await })
    };
    let mut operator = connect_with_retry(port).await;

    let mut attached = false;
    for _ in 0..100 {
        if controller.state() == ControllerState::Attached {
            attached = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(attached, "session never attached");
    let claimed = timeout(Duration::from_secs(2), registry.is_claimed(port))
        .await
        .expect("registry stayed locked");
    assert!(claimed);

    // One line for the program, one for the debugger, in whichever order they ask.
    operator.write_all(b"c\nc\n").await.unwrap();
    let outcome = timeout(Duration::from_secs(5), session).await.unwrap().unwrap();
    assert!(matches!(outcome, SessionOutcome::Detached(Terminal::Resume)));
    assert!(!registry.is_claimed(port).await);

    stdio.write_all(b"local\n").await.unwrap();
    let line = timeout(Duration::from_secs(5), reader).await.unwrap().unwrap().unwrap();
    assert!(matches!(line.as_deref(), Some("c\n" | "local\n")), "unexpected line {line:?}");
}

#[tokio::test]
async fn test_foreign_port_retried_then_abandoned() {
    let (registry, _stdio) = memory_registry();
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let config = DebugConfig {
        retry_timeout_secs: 2,
        retry_interval_secs: 1,
        ..DebugConfig::default().with_endpoint("127.0.0.1", port)
    };
    let controller = controller(config, Arc::clone(&registry));

    let started = Instant::now();
    let outcome = controller.start("127.0.0.1", port).await;
    let elapsed = started.elapsed();

    assert!(matches!(outcome, SessionOutcome::Unavailable(DebugError::AddressInUse { .. })));
    assert!(!outcome.attached());
    assert!(elapsed >= Duration::from_secs(1), "gave up without retrying: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10));
    assert!(!registry.is_claimed(port).await);
}

#[tokio::test]
async fn test_operator_bytes_reach_engine_and_stdio_is_restored() {
    let (registry, mut stdio) = memory_registry();
    let port = free_port().await;
    let controller =
        controller(DebugConfig::default().with_endpoint("127.0.0.1", port), Arc::clone(&registry));

    let session = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.start("127.0.0.1", port).await })
    };

    let operator = connect_with_retry(port).await;
    let (operator_read, mut operator_write) = operator.into_split();
    let mut transcript = BufReader::new(operator_read).lines();

    // Anything written to the process console while attached goes to the operator.
    operator_write.write_all(b"where\n").await.unwrap();
    loop {
        let line = transcript.next_line().await.unwrap().unwrap();
        if line.contains("in start") {
            break;
        }
    }
    registry.stdio().write_str("program output\n").await.unwrap();
    loop {
        let line = transcript.next_line().await.unwrap().unwrap();
        if line.contains("program output") {
            break;
        }
    }

    operator_write.write_all(b"quit\n").await.unwrap();
    assert!(matches!(session.await.unwrap(), SessionOutcome::Detached(Terminal::Abort)));

    registry.stdio().write_str("after\n").await.unwrap();
    let mut buf = [0u8; 6];
    stdio.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after\n");
}

#[tokio::test]
async fn test_controller_is_reusable_after_close() {
    let (registry, _stdio) = memory_registry();
    let port = free_port().await;
    let controller =
        controller(DebugConfig::default().with_endpoint("127.0.0.1", port), Arc::clone(&registry));

    for round in 0..2 {
        let session = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.set_trace(Frame::here(format!("round {round}"))).await })
        };
        let mut operator = connect_with_retry(port).await;
        operator.write_all(b"cont\n").await.unwrap();
        assert!(matches!(session.await.unwrap(), SessionOutcome::Detached(Terminal::Resume)));
    }
}

#[tokio::test]
async fn test_active_workers_share_a_broker() {
    let (registry, _stdio) = memory_registry();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let broker = SessionBroker::from_listener(listener);
    let address = broker.local_addr().unwrap();

    let (mut console_in, broker_in) = duplex(4096);
    let (broker_out, console_out) = duplex(16384);
    let shutdown = CancellationToken::new();
    let broker_task =
        tokio::spawn(broker.run(BufReader::new(broker_in), broker_out, shutdown.clone()));
    let mut console = BufReader::new(console_out).lines();

    let config = DebugConfig::default().with_endpoint("127.0.0.1", address.port());
    let mut workers = Vec::new();
    for (worker, label) in ["A", "B"].into_iter().enumerate() {
        let controller = controller(config.clone(), Arc::clone(&registry));
        workers.push(tokio::spawn(async move {
            controller.set_trace_active(Frame::here(format!("worker {worker}"))).await
        }));
        let needle = format!("(Session {label}:");
        loop {
            let line = timeout(Duration::from_secs(5), console.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if line.contains(&needle) {
                break;
            }
        }
    }

    // Resume A, switch to B and resume it too.
    console_in.write_all(b"c\n").await.unwrap();
    assert!(matches!(workers.remove(0).await.unwrap(), SessionOutcome::Detached(Terminal::Resume)));
    console_in.write_all(b"/switch\nc\n").await.unwrap();
    assert!(matches!(workers.remove(0).await.unwrap(), SessionOutcome::Detached(Terminal::Resume)));

    shutdown.cancel();
    broker_task.await.unwrap().unwrap();
}
