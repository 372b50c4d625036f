//! End-to-end protocol scenarios against an in-process server.
//!
//! A raw protocol client drives real TCP connections into `serve`, with a
//! stub shell script standing in for the compiler so the suite runs on any
//! machine.

use homcc_common::Compression;
use homcc_common::hashing::digest_bytes;
use homcc_common::protocol::{
    ArgumentRequest, CompilationResult, FileTransfer, Message, read_message, write_message,
};
use homccd::cache::Cache;
use homccd::server::{self, Daemon};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

// =========================================================================
// Harness
// =========================================================================

struct TestServer {
    addr: SocketAddr,
    daemon: Arc<Daemon>,
    dir: tempfile::TempDir,
}

impl TestServer {
    async fn start(limit: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path().join("cache"), 64 * 1024 * 1024).unwrap();
        let daemon = Daemon::new(cache, limit, dir.path().join("scratch"));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server::serve(listener, Arc::clone(&daemon)));

        Self { addr, daemon, dir }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    fn scratch_is_clean(&self) -> bool {
        match std::fs::read_dir(self.dir.path().join("scratch")) {
            Ok(entries) => entries.count() == 0,
            Err(_) => true, // never created
        }
    }

    async fn wait_for_clean_scratch(&self) {
        for _ in 0..100 {
            if self.scratch_is_clean() && self.daemon.active_jobs() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scratch dir was not cleaned up");
    }
}

/// A fake project: one source, one header, and a stub compiler that writes
/// `OBJ` to its `-o` target.
struct Project {
    dir: tempfile::TempDir,
    compiler: PathBuf,
    dependencies: BTreeMap<String, String>,
}

impl Project {
    fn new() -> Self {
        Self::with_compiler(
            "#!/bin/sh\n\
             out=\"\"; prev=\"\"\n\
             for a in \"$@\"; do if [ \"$prev\" = -o ]; then out=\"$a\"; fi; prev=\"$a\"; done\n\
             [ -n \"$out\" ] || { echo 'missing -o' >&2; exit 9; }\n\
             printf OBJ > \"$out\"\n",
        )
    }

    fn with_compiler(script: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("main.c");
        let header = dir.path().join("util.h");
        std::fs::write(&source, b"#include \"util.h\"\nint main(){return util();}\n").unwrap();
        std::fs::write(&header, b"int util(void);\n").unwrap();

        let compiler = dir.path().join("fakecc");
        std::fs::write(&compiler, script).unwrap();
        let mut perms = std::fs::metadata(&compiler).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&compiler, perms).unwrap();

        let mut dependencies = BTreeMap::new();
        for file in [&source, &header] {
            dependencies.insert(
                file.to_string_lossy().into_owned(),
                digest_bytes(&std::fs::read(file).unwrap()),
            );
        }

        Self {
            dir,
            compiler,
            dependencies,
        }
    }

    fn request(&self) -> ArgumentRequest {
        ArgumentRequest {
            args: vec![
                self.compiler.to_string_lossy().into_owned(),
                "-c".to_string(),
                "main.c".to_string(),
                "-o".to_string(),
                "main.o".to_string(),
            ],
            cwd: self.dir.path().to_string_lossy().into_owned(),
            target_profile: None,
            docker_container: None,
            dependency_hashes: self.dependencies.clone(),
        }
    }

    fn content_of(&self, client_path: &str) -> Vec<u8> {
        std::fs::read(Path::new(client_path)).unwrap()
    }
}

async fn send(stream: &mut TcpStream, message: Message, compression: Compression) {
    write_message(stream, &message, compression).await.unwrap();
}

async fn recv(stream: &mut TcpStream) -> Message {
    let (message, _) = tokio::time::timeout(Duration::from_secs(10), read_message(stream))
        .await
        .expect("server reply timed out")
        .unwrap();
    message
}

/// Drive a full session; returns the result and how many FileTransfer
/// messages went over the wire.
async fn run_session(
    stream: &mut TcpStream,
    project: &Project,
    compression: Compression,
) -> (CompilationResult, usize) {
    send(stream, Message::ArgumentRequest(project.request()), compression).await;

    let mut transfers = 0;
    let result = match recv(stream).await {
        Message::CompilationResult(result) => result,
        Message::DependencyRequest(request) => {
            let by_digest: BTreeMap<String, String> = project
                .dependencies
                .iter()
                .map(|(path, digest)| (digest.clone(), path.clone()))
                .collect();
            for digest in &request.needed {
                let path = by_digest[digest].clone();
                send(
                    stream,
                    Message::FileTransfer(FileTransfer {
                        path: path.clone(),
                        digest: digest.clone(),
                        content: project.content_of(&path),
                    }),
                    compression,
                )
                .await;
                transfers += 1;
            }
            send(stream, Message::FilesSent, compression).await;
            match recv(stream).await {
                Message::CompilationResult(result) => result,
                other => panic!("expected CompilationResult, got {}", other.kind()),
            }
        }
        other => panic!("expected DependencyRequest or CompilationResult, got {}", other.kind()),
    };
    (result, transfers)
}

// =========================================================================
// Scenarios
// =========================================================================

#[tokio::test]
async fn cold_cache_transfers_exactly_the_missing_files() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut stream = server.connect().await;
    send(&mut stream, Message::ArgumentRequest(project.request()), Compression::None).await;

    let Message::DependencyRequest(request) = recv(&mut stream).await else {
        panic!("expected DependencyRequest on a cold cache");
    };
    let mut expected: Vec<String> = project.dependencies.values().cloned().collect();
    expected.sort();
    let mut needed = request.needed.clone();
    needed.sort();
    assert_eq!(needed, expected, "server must request the whole gap");

    drop(stream);
    let mut stream = server.connect().await;
    let (result, transfers) = run_session(&mut stream, &project, Compression::None).await;
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(transfers, 2);
    assert_eq!(result.object_files.len(), 1);
    assert_eq!(result.object_files[0].path, "main.o");
    assert_eq!(result.object_files[0].content, b"OBJ");

    server.wait_for_clean_scratch().await;
}

#[tokio::test]
async fn warm_cache_skips_the_transfer_phase_entirely() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    // Pre-seed the cache the way a previous build would have.
    for (path, digest) in &project.dependencies {
        server
            .daemon
            .cache
            .insert(digest, &project.content_of(path))
            .unwrap();
    }

    let mut stream = server.connect().await;
    let (result, transfers) = run_session(&mut stream, &project, Compression::None).await;
    assert_eq!(result.exit_code, 0);
    assert_eq!(transfers, 0, "warm cache must not trigger uploads");
}

#[tokio::test]
async fn repeat_build_is_idempotent_on_the_wire() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut first = server.connect().await;
    let (result, transfers) = run_session(&mut first, &project, Compression::None).await;
    assert_eq!(result.exit_code, 0);
    assert_eq!(transfers, 2);
    drop(first);

    let mut second = server.connect().await;
    let (result, transfers) = run_session(&mut second, &project, Compression::None).await;
    assert_eq!(result.exit_code, 0);
    assert_eq!(transfers, 0, "second identical build must upload nothing");
}

#[tokio::test]
async fn compressed_sessions_round_trip() {
    for compression in [Compression::Lzo, Compression::Lzma] {
        let server = TestServer::start(4).await;
        let project = Project::new();
        let mut stream = server.connect().await;
        let (result, _) = run_session(&mut stream, &project, compression).await;
        assert_eq!(result.exit_code, 0, "{compression}: {}", result.stderr);
        assert_eq!(result.object_files[0].content, b"OBJ");
    }
}

#[tokio::test]
async fn compile_error_reports_stderr_and_cleans_up() {
    let server = TestServer::start(4).await;
    let project = Project::with_compiler(
        "#!/bin/sh\necho 'main.c:2:1: error: expected ;' >&2\nexit 1\n",
    );

    let mut stream = server.connect().await;
    let (result, _) = run_session(&mut stream, &project, Compression::None).await;
    assert_ne!(result.exit_code, 0);
    assert!(result.stderr.contains("error"));
    assert!(result.object_files.is_empty());

    server.wait_for_clean_scratch().await;
}

#[tokio::test]
async fn saturated_server_refuses_with_a_framed_message() {
    let server = TestServer::start(1).await;

    // First connection occupies the only slot; it never sends anything, so
    // the server task sits in the initial read.
    let _held = server.connect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.daemon.active_jobs(), 1);

    let mut second = server.connect().await;
    match recv(&mut second).await {
        Message::ConnectionRefused(refused) => {
            assert!(refused.reason.contains("limit 1"), "{}", refused.reason);
        }
        other => panic!("expected ConnectionRefused, got {}", other.kind()),
    }
}

#[tokio::test]
async fn tampered_transfer_closes_the_connection_and_leaves_cache_unchanged() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut stream = server.connect().await;
    send(&mut stream, Message::ArgumentRequest(project.request()), Compression::None).await;

    let Message::DependencyRequest(request) = recv(&mut stream).await else {
        panic!("expected DependencyRequest");
    };
    let declared = request.needed[0].clone();
    send(
        &mut stream,
        Message::FileTransfer(FileTransfer {
            path: "/poisoned".to_string(),
            digest: declared.clone(),
            content: b"not the declared content".to_vec(),
        }),
        Compression::None,
    )
    .await;

    // No result, just a close.
    let err = tokio::time::timeout(Duration::from_secs(10), read_message(&mut stream))
        .await
        .expect("server should have closed the connection")
        .unwrap_err();
    assert!(matches!(
        err,
        homcc_common::error::ProtocolError::PeerClosed
    ));

    assert!(!server.daemon.cache.contains(&declared));
    assert!(server.daemon.cache.is_empty());
    server.wait_for_clean_scratch().await;
}

#[tokio::test]
async fn linking_invocation_fails_cleanly() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut request = project.request();
    request.args = vec![
        project.compiler.to_string_lossy().into_owned(),
        "main.c".to_string(),
        "-o".to_string(),
        "main".to_string(),
    ];

    let mut stream = server.connect().await;
    send(&mut stream, Message::ArgumentRequest(request), Compression::None).await;
    match recv(&mut stream).await {
        Message::CompilationResult(result) => {
            assert_ne!(result.exit_code, 0);
            assert!(result.stderr.contains("unsupported"), "{}", result.stderr);
        }
        other => panic!("expected CompilationResult, got {}", other.kind()),
    }
}

#[tokio::test]
async fn missing_compiler_fails_cleanly() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut request = project.request();
    request.args[0] = "/nonexistent/homcc-test-cc".to_string();

    let mut stream = server.connect().await;
    send(&mut stream, Message::ArgumentRequest(request), Compression::None).await;
    match recv(&mut stream).await {
        Message::CompilationResult(result) => {
            assert_ne!(result.exit_code, 0);
            assert!(result.stderr.contains("not available"), "{}", result.stderr);
        }
        other => panic!("expected CompilationResult, got {}", other.kind()),
    }
}

#[tokio::test]
async fn unknown_profile_fails_cleanly() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut request = project.request();
    request.target_profile = Some("homcc-test-no-such-profile".to_string());

    let mut stream = server.connect().await;
    send(&mut stream, Message::ArgumentRequest(request), Compression::None).await;
    match recv(&mut stream).await {
        Message::CompilationResult(result) => {
            assert_ne!(result.exit_code, 0);
            assert!(result.stderr.contains("homccd:"), "{}", result.stderr);
        }
        other => panic!("expected CompilationResult, got {}", other.kind()),
    }
}

#[tokio::test]
async fn client_disconnect_mid_negotiation_tears_the_job_down() {
    let server = TestServer::start(4).await;
    let project = Project::new();

    let mut stream = server.connect().await;
    send(&mut stream, Message::ArgumentRequest(project.request()), Compression::None).await;
    let Message::DependencyRequest(_) = recv(&mut stream).await else {
        panic!("expected DependencyRequest");
    };
    drop(stream); // vanish mid-session

    server.wait_for_clean_scratch().await;
    assert_eq!(server.daemon.active_jobs(), 0);
}
