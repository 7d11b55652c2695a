//! Guest control agent - runs inside the VM
//!
//! Two jobs:
//! - accept control connections on vsock port 5000, one JSON request line per
//!   connection, and answer with `{"output":...}` or `{"error":...}`
//! - forward TCP 127.0.0.1:3128 to host CID 2 port 3128, where the host-side
//!   egress proxy listens, so `HTTP(S)_PROXY` works inside the guest
//!
//! Uses raw libc vsock calls for musl compatibility (tokio_vsock causes GPF in musl).

use std::collections::BTreeMap;
use std::os::unix::io::FromRawFd;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

use agentvisor::vm::control::{ControlEnvelope, ControlRequest, ControlResponse, PROTOCOL_VERSION};

const AF_VSOCK: libc::c_int = 40;
const SOCK_STREAM: libc::c_int = 1;
const VMADDR_CID_ANY: u32 = u32::MAX; // -1U, bind to any CID
const VMADDR_CID_HOST: u32 = 2;

const DEFAULT_CONTROL_PORT: u32 = 5000;
const DEFAULT_PROXY_PORT: u32 = 3128;

/// Kept below the host's 60s read inactivity bound so the host sees a reply
const COMMAND_TIMEOUT: Duration = Duration::from_secs(55);

#[repr(C)]
struct SockaddrVm {
    svm_family: u16,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

impl SockaddrVm {
    fn new(cid: u32, port: u32) -> Self {
        Self {
            svm_family: AF_VSOCK as u16,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: cid,
            svm_flags: 0,
            svm_zero: [0; 3],
        }
    }
}

fn vsock_socket() -> std::io::Result<libc::c_int> {
    let fd = unsafe { libc::socket(AF_VSOCK, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn close_with(fd: libc::c_int) -> std::io::Error {
    let err = std::io::Error::last_os_error();
    unsafe { libc::close(fd) };
    err
}

fn set_nonblocking(fd: libc::c_int) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(close_with(fd));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(close_with(fd));
    }
    Ok(())
}

/// Listening vsock socket wrapped as a UnixListener (both are SOCK_STREAM)
fn create_vsock_listener(port: u32) -> std::io::Result<std::os::unix::net::UnixListener> {
    let fd = vsock_socket()?;
    let addr = SockaddrVm::new(VMADDR_CID_ANY, port);

    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(close_with(fd));
    }
    if unsafe { libc::listen(fd, 128) } < 0 {
        return Err(close_with(fd));
    }
    set_nonblocking(fd)?;

    Ok(unsafe { std::os::unix::net::UnixListener::from_raw_fd(fd) })
}

/// Blocking connect to the host, then hand the fd to tokio
fn connect_vsock_host(port: u32) -> std::io::Result<std::os::unix::net::UnixStream> {
    let fd = vsock_socket()?;
    let addr = SockaddrVm::new(VMADDR_CID_HOST, port);

    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const SockaddrVm as *const libc::sockaddr,
            std::mem::size_of::<SockaddrVm>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(close_with(fd));
    }
    set_nonblocking(fd)?;

    Ok(unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) })
}

async fn run_command(command: &str, env: &BTreeMap<String, String>, proxy_port: u32) -> ControlResponse {
    let proxy = format!("http://127.0.0.1:{}", proxy_port);
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .env("HTTP_PROXY", &proxy)
        .env("HTTPS_PROXY", &proxy)
        .env("http_proxy", &proxy)
        .env("https_proxy", &proxy)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = std::time::Instant::now();
    match timeout(COMMAND_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => {
            println!(
                "[GUEST] Exec complete: exit_code={}, duration={:.2}ms",
                output.status.code().unwrap_or(-1),
                start.elapsed().as_secs_f64() * 1000.0
            );
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            ControlResponse::Output { output: text }
        }
        Ok(Err(e)) => ControlResponse::Error {
            error: format!("failed to start command: {}", e),
        },
        Err(_) => ControlResponse::Error {
            error: format!("command timed out after {:?}", COMMAND_TIMEOUT),
        },
    }
}

async fn handle_control(stream: UnixStream, proxy_port: u32) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();
    stream.read_line(&mut line).await?;

    let response = match serde_json::from_str::<ControlEnvelope>(line.trim()) {
        Ok(envelope) if envelope.v > PROTOCOL_VERSION => ControlResponse::Error {
            error: format!("unsupported protocol version {}", envelope.v),
        },
        Ok(ControlEnvelope {
            request: ControlRequest::Exec { command, env },
            ..
        }) => {
            println!("[GUEST] Exec request: command_len={}", command.len());
            run_command(&command, &env, proxy_port).await
        }
        Err(e) => ControlResponse::Error {
            error: format!("malformed request: {}", e),
        },
    };

    let body = serde_json::to_vec(&response)?;
    stream.write_all(&body).await?;
    stream.shutdown().await
}

async fn serve_control(port: u32, proxy_port: u32) -> std::io::Result<()> {
    let listener = tokio::net::UnixListener::from_std(create_vsock_listener(port)?)?;
    println!("[GUEST] Control agent listening on vsock port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(async move {
                    if let Err(e) = handle_control(stream, proxy_port).await {
                        eprintln!("[GUEST] Control connection error: {}", e);
                    }
                });
            }
            Err(e) => eprintln!("[GUEST] Accept error: {}", e),
        }
    }
}

async fn forward_to_host(mut client: TcpStream, port: u32) -> std::io::Result<()> {
    let upstream = tokio::task::spawn_blocking(move || connect_vsock_host(port)).await??;
    let mut upstream = UnixStream::from_std(upstream)?;
    tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    Ok(())
}

async fn serve_proxy_forwarder(port: u32) -> std::io::Result<()> {
    let listener = TcpListener::bind(("127.0.0.1", port as u16)).await?;
    println!("[GUEST] Egress forwarder 127.0.0.1:{} -> host vsock {}", port, port);

    loop {
        match listener.accept().await {
            Ok((client, _)) => {
                tokio::spawn(async move {
                    if let Err(e) = forward_to_host(client, port).await {
                        eprintln!("[GUEST] Forward error: {}", e);
                    }
                });
            }
            Err(e) => eprintln!("[GUEST] Forwarder accept error: {}", e),
        }
    }
}

fn port_arg(index: usize, default: u32) -> Result<u32, Box<dyn std::error::Error>> {
    match std::env::args().nth(index) {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let control_port = port_arg(1, DEFAULT_CONTROL_PORT)?;
    let proxy_port = port_arg(2, DEFAULT_PROXY_PORT)?;

    tokio::select! {
        res = serve_control(control_port, proxy_port) => res?,
        res = serve_proxy_forwarder(proxy_port) => res?,
    }
    Ok(())
}
