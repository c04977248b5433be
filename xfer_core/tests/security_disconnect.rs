use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use xfer_core::transfer::framing::{Command, TransferHeader, encode_command, encode_header};
use xfer_core::{Server, ServerConfig, ServerEvent};

async fn start_server(
    config: ServerConfig,
) -> (std::net::SocketAddr, mpsc::Receiver<ServerEvent>) {
    let (event_tx, event_rx) = mpsc::channel(100);
    let server = Server::bind(config).await.unwrap().with_events(event_tx);
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, event_rx)
}

async fn next_disconnect(events: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut seen = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            let done = matches!(event, ServerEvent::ClientDisconnected { .. });
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    assert!(result.is_ok(), "Test timed out, events so far: {:?}", seen);
    seen
}

#[tokio::test]
async fn test_disconnect_mid_upload_is_not_success() {
    let storage = tempfile::tempdir().unwrap();
    let (addr, mut events) = start_server(ServerConfig {
        port: 0,
        storage_dir: storage.path().to_path_buf(),
        ..Default::default()
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&encode_command(Command::Upload))
        .await
        .unwrap();
    stream
        .write_all(&encode_header(&TransferHeader::new("cut.bin", 10_000)).unwrap())
        .await
        .unwrap();
    stream.write_all(&[0xAB; 100]).await.unwrap();
    drop(stream);

    let seen = next_disconnect(&mut events).await;

    let failed = seen.iter().find_map(|e| match e {
        ServerEvent::UploadFailed { file_name, error, .. } => Some((file_name, error)),
        _ => None,
    });
    let (file_name, error) = failed.expect("upload should be reported as failed");
    assert_eq!(file_name, "cut.bin");
    assert!(error.contains("connection closed"), "{}", error);

    assert!(
        !seen
            .iter()
            .any(|e| matches!(e, ServerEvent::UploadCompleted { .. }))
    );
    // Neither the target nor a staging file is left behind
    assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_oversized_filename_prefix_rejected() {
    let storage = tempfile::tempdir().unwrap();
    let (addr, mut events) = start_server(ServerConfig {
        port: 0,
        storage_dir: storage.path().to_path_buf(),
        ..Default::default()
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&encode_command(Command::Download))
        .await
        .unwrap();
    // Declares a 64MB filename; the server must not wait for it
    stream
        .write_all(&(64u32 * 1024 * 1024).to_be_bytes())
        .await
        .unwrap();

    let seen = next_disconnect(&mut events).await;
    match seen.last() {
        Some(ServerEvent::ClientDisconnected { reason, .. }) => {
            assert!(reason.contains("too large"), "{}", reason);
        }
        other => panic!("unexpected last event: {:?}", other),
    }

    // Server closed its side
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server did not close the connection")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_idle_client_is_dropped() {
    let storage = tempfile::tempdir().unwrap();
    let (addr, mut events) = start_server(ServerConfig {
        port: 0,
        storage_dir: storage.path().to_path_buf(),
        idle_timeout_secs: Some(1),
        ..Default::default()
    })
    .await;

    let _stream = TcpStream::connect(addr).await.unwrap();

    let seen = next_disconnect(&mut events).await;
    match seen.last() {
        Some(ServerEvent::ClientDisconnected { reason, .. }) => {
            assert!(reason.contains("timed out"), "{}", reason);
        }
        other => panic!("unexpected last event: {:?}", other),
    }
}

#[tokio::test]
async fn test_stalled_upload_times_out() {
    let storage = tempfile::tempdir().unwrap();
    let (addr, mut events) = start_server(ServerConfig {
        port: 0,
        storage_dir: storage.path().to_path_buf(),
        io_timeout_secs: Some(1),
        ..Default::default()
    })
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(&encode_command(Command::Upload))
        .await
        .unwrap();
    stream
        .write_all(&encode_header(&TransferHeader::new("slow.bin", 50)).unwrap())
        .await
        .unwrap();
    stream.write_all(&[1u8; 10]).await.unwrap();

    let seen = next_disconnect(&mut events).await;
    assert!(seen.iter().any(|e| matches!(
        e,
        ServerEvent::UploadFailed { error, .. } if error.contains("timed out")
    )));
    assert_eq!(std::fs::read_dir(storage.path()).unwrap().count(), 0);
}
