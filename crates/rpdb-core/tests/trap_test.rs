//! SIGTRAP entry. Kept in its own test binary since the handler is process-wide.
#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use rpdb_core::config::DebugConfig;
use rpdb_core::{
    BasicEngine, Console, ConsoleHandle, ControllerState, DebugSessionController,
    PortClaimRegistry,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::time::{sleep, timeout};

async fn connect_with_retry(port: u16) -> TcpStream {
    for _ in 0..250 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
            return stream;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {port}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sigtrap_opens_session() {
    let (_stdio, local) = duplex(4096);
    let (reader, writer) = tokio::io::split(local);
    let registry = Arc::new(PortClaimRegistry::new(ConsoleHandle::new(Console::new(reader, writer))));
    let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
    let controller = Arc::new(DebugSessionController::with_registry(
        DebugConfig::default().with_endpoint("127.0.0.1", port),
        Arc::clone(&registry),
        Arc::new(BasicEngine::factory()),
    ));

    let handler = Arc::clone(&controller).handle_trap().unwrap();
    let status = Command::new("kill")
        .args(["-s", "TRAP", &std::process::id().to_string()])
        .status()
        .await
        .unwrap();
    assert!(status.success());

    let mut operator = connect_with_retry(port).await;
    operator.write_all(b"c\n").await.unwrap();
    let mut transcript = String::new();
    timeout(Duration::from_secs(5), operator.read_to_string(&mut transcript))
        .await
        .unwrap()
        .unwrap();
    assert!(transcript.contains("in SIGTRAP"), "transcript: {transcript}");

    let mut closed = false;
    for _ in 0..100 {
        if controller.state() == ControllerState::Closed && !registry.is_claimed(port).await {
            closed = true;
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(closed, "session was not torn down");
    handler.abort();
}
