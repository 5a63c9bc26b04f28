//! The shipped worker subprocess: frames on stdout, logs on stderr.

use std::time::Duration;

use lyrebird::protocol::{decode, Decoded, Message, Status, MAX_MESSAGE_LEN};
use lyrebird::scheduler::{LaunchedWorker, ProcessLauncher, WorkerLauncher};
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncWriteExt, BufReader};

async fn next_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Decoded {
    tokio::time::timeout(Duration::from_secs(20), decode(reader, MAX_MESSAGE_LEN))
        .await
        .expect("timed out")
}

async fn next_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Message {
    match next_frame(reader).await {
        Decoded::Message(message) => message,
        other => panic!("expected a message, got {:?}", other),
    }
}

#[tokio::test]
async fn worker_subcommand_speaks_frames_on_stdout() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("in.out");
    let missing = dir.path().join("missing.txt");
    std::fs::write(&input, "txdgaclx?xkbq\n").unwrap();

    // Debug logging makes any log line that leaks onto stdout break framing.
    let launcher = ProcessLauncher::new(
        env!("CARGO_BIN_EXE_lyrebird"),
        ["--log-level", "debug", "worker"],
    );
    let LaunchedWorker {
        identity,
        mut writer,
        reader,
        process,
    } = launcher.launch(0).unwrap();
    let mut reader = BufReader::new(reader);

    assert_eq!(next_message(&mut reader).await.status(), Status::Ready);

    let records = format!(
        "{} {}\n{} {}\n",
        missing.display(),
        dir.path().join("missing.out").display(),
        input.display(),
        output.display()
    );
    writer.write_all(records.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();

    let failed = next_message(&mut reader).await;
    assert_eq!(failed.status(), Status::Error);
    assert!(failed.payload().contains("missing.txt"));

    let done = next_message(&mut reader).await;
    assert_eq!(done.status(), Status::Success);
    assert_eq!(
        done.payload(),
        format!("{} in process {}", input.display(), identity)
    );
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "hello world!\n");

    drop(writer);
    assert!(matches!(next_frame(&mut reader).await, Decoded::Closed));
    assert!(process.wait().await.is_success());
}
