//! VM backend against fake supervisor and virtiofsd scripts
//!
//! The scripts only create the sockets the adapter waits for and then idle,
//! so the whole create → exec → destroy path runs without KVM. They still
//! need a real tmux server, hence `#[ignore]`:
//!
//! ```text
//! cargo test --test vm_integration -- --ignored
//! ```

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use agentvisor::adapter::{agent_key, HandleState, IsolationAdapter};
use agentvisor::vm::handle::VmPaths;
use agentvisor::vm::{ResourceAllocator, VmAdapter};
use agentvisor::Settings;

const FAKE_SUPERVISOR: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  case "$1" in
    --api-socket) api="${2#path=}"; shift 2 ;;
    *) shift ;;
  esac
done
touch "$api"
while :; do sleep 1; done
"#;

const FAKE_VIRTIOFSD: &str = r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --socket-path=*) touch "${arg#--socket-path=}" ;;
  esac
done
while :; do sleep 1; done
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    root: PathBuf,
    settings: Settings,
    definition: PathBuf,
    workspace: PathBuf,
}

fn script(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let bin = root.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    script(&bin.join("fake-supervisor"), FAKE_SUPERVISOR);
    script(&bin.join("fake-virtiofsd"), FAKE_VIRTIOFSD);

    std::fs::write(root.join("vmlinux"), "").unwrap();
    std::fs::write(root.join("rootfs.ext4"), "").unwrap();
    let definition = root.join("dev.json");
    std::fs::write(
        &definition,
        r#"{"kernelPath": "vmlinux", "rootfsPath": "rootfs.ext4", "allowedDomains": ["example.com"]}"#,
    )
    .unwrap();

    let workspace = root.join("workspace");
    std::fs::create_dir_all(&workspace).unwrap();
    std::fs::create_dir_all(root.join("sys")).unwrap();

    let settings = Settings {
        state_dir: root.join("state"),
        runtime_dir: root.join("run"),
        credentials_dir: Some(root.join("creds")),
        supervisor_binary: bin.join("fake-supervisor"),
        virtiofsd_binary: bin.join("fake-virtiofsd"),
        sysfs_net_dir: root.join("sys"),
        ..Settings::default()
    };

    Fixture {
        _dir: dir,
        root,
        settings,
        definition,
        workspace,
    }
}

fn adapter(fx: &Fixture) -> VmAdapter {
    let allocator =
        ResourceAllocator::new(fx.settings.sysfs_net_dir.clone(), fx.settings.tap_prefix.clone())
            .shared();
    VmAdapter::new(fx.settings.clone(), allocator)
}

/// Live processes whose command line mentions both needles, ignoring a
/// tmux server that inherited its first client's arguments
fn processes_matching(program: &Path, runtime_dir: &Path) -> usize {
    let program = program.to_string_lossy().into_owned();
    let runtime = runtime_dir.to_string_lossy().into_owned();
    std::fs::read_dir("/proc")
        .unwrap()
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().parse::<u32>().is_ok())
        .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
        .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " "))
        .filter(|cmdline| !cmdline.starts_with("tmux"))
        .filter(|cmdline| cmdline.contains(&program) && cmdline.contains(&runtime))
        .count()
}

/// Answer one hybrid-vsock control exchange the way the supervisor and
/// guest agent would together
async fn serve_fake_guest(listener: UnixListener, reply: &'static str) -> String {
    let (stream, _) = listener.accept().await.unwrap();
    let mut stream = BufReader::new(stream);
    let mut connect = String::new();
    stream.read_line(&mut connect).await.unwrap();
    assert_eq!(connect, "CONNECT 5000\n");
    stream.write_all(b"OK 1073741824\n").await.unwrap();

    let mut request = String::new();
    stream.read_line(&mut request).await.unwrap();
    stream.write_all(reply.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    request
}

#[tokio::test]
#[ignore]
async fn test_create_exec_destroy() {
    let fx = fixture();
    let vm = adapter(&fx);
    let paths = VmPaths::new(fx.settings.runtime_dir.join(agent_key("agent-1")));

    let created = vm
        .create(Some(&fx.definition), &fx.workspace, "agent-1", Some("feature x"))
        .await
        .unwrap();
    assert_eq!(created.proxy_port, Some(3128));
    assert!(paths.record_file().exists());
    assert!(paths.vsock_listener(3128).exists());
    assert!(fx.root.join("creds").is_dir());
    assert_eq!(processes_matching(&fx.settings.supervisor_binary, &paths.runtime_dir), 1);
    assert_eq!(processes_matching(&fx.settings.virtiofsd_binary, &paths.runtime_dir), 2);

    let listener = UnixListener::bind(paths.vsock_socket()).unwrap();
    let guest = tokio::spawn(serve_fake_guest(listener, "{\"output\":\"hello\\n\"}"));
    let out = vm.exec(&created.handle, "echo hello").await.unwrap();
    assert_eq!(out, "hello\n");
    let request = guest.await.unwrap();
    assert!(request.contains("\"type\":\"exec\""));
    assert!(request.contains("\"command\":\"echo hello\""));

    let shell = vm
        .shell_attach_command(&created.handle, &fx.workspace)
        .await
        .unwrap()
        .unwrap();
    let session = format!("agentvisor-{}", agent_key("agent-1"));
    assert_eq!(shell.args, vec!["attach-session", "-t", session.as_str()]);

    vm.destroy(&created.handle).await;
    assert!(!paths.runtime_dir.exists());
    assert_eq!(processes_matching(&fx.settings.supervisor_binary, &paths.runtime_dir), 0);
    assert_eq!(processes_matching(&fx.settings.virtiofsd_binary, &paths.runtime_dir), 0);
}

#[tokio::test]
#[ignore]
async fn test_recreate_after_crash_leaves_one_supervisor() {
    let fx = fixture();
    let paths = VmPaths::new(fx.settings.runtime_dir.join(agent_key("agent-crash")));

    // First orchestrator process boots a VM and disappears without teardown
    {
        let crashed = adapter(&fx);
        crashed
            .create(Some(&fx.definition), &fx.workspace, "agent-crash", None)
            .await
            .unwrap();
    }
    assert_eq!(processes_matching(&fx.settings.supervisor_binary, &paths.runtime_dir), 1);

    let vm = adapter(&fx);
    let created = vm
        .create(Some(&fx.definition), &fx.workspace, "agent-crash", None)
        .await
        .unwrap();
    assert_eq!(processes_matching(&fx.settings.supervisor_binary, &paths.runtime_dir), 1);
    assert_eq!(processes_matching(&fx.settings.virtiofsd_binary, &paths.runtime_dir), 2);

    vm.destroy(&created.handle).await;
    assert_eq!(processes_matching(&fx.settings.supervisor_binary, &paths.runtime_dir), 0);
}

#[tokio::test]
#[ignore]
async fn test_restart_readopts_running_vm() {
    let fx = fixture();
    let paths = VmPaths::new(fx.settings.runtime_dir.join(agent_key("agent-2")));

    let handle = {
        let first = adapter(&fx);
        first
            .create(Some(&fx.definition), &fx.workspace, "agent-2", None)
            .await
            .unwrap()
            .handle
    };

    let vm = adapter(&fx);
    let state = vm.probe(&handle, "agent-2", &fx.workspace).await;
    assert_eq!(state, HandleState::Running);
    assert!(paths.vsock_listener(3128).exists());

    vm.destroy(&handle).await;
    assert!(!paths.runtime_dir.exists());
    assert_eq!(processes_matching(&fx.settings.supervisor_binary, &paths.runtime_dir), 0);
}
