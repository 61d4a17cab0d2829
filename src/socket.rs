use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::command::{parse_word, Command};

pub struct SocketServer {
    listener: UnixListener,
    path: PathBuf,
}

pub fn socket_path() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    PathBuf::from(format!("/run/user/{}/voxstage.sock", uid))
}

impl SocketServer {
    pub async fn bind() -> Result<Self> {
        Self::bind_at(socket_path())
    }

    pub fn bind_at(path: PathBuf) -> Result<Self> {
        // Remove stale socket file
        if path.exists() {
            std::fs::remove_file(&path).ok();
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind Unix socket at {:?}", path))?;

        info!("Socket server listening at {:?}", path);
        Ok(Self { listener, path })
    }

    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

/// Reads one command line from a control connection. Bad commands are
/// answered with an error line before the error is returned.
pub async fn read_command(stream: &mut UnixStream) -> Result<Command> {
    let line = read_line(stream).await?;

    match parse_word(&line) {
        Ok(cmd) => {
            debug!("Received socket command: {:?}", cmd);
            Ok(cmd)
        }
        Err(e) => {
            warn!("Rejected socket command {:?}: {}", line.trim(), e);
            let _ = stream.write_all(format!("error: {}\n", e).as_bytes()).await;
            Err(e)
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        std::fs::remove_file(&self.path).ok();
    }
}

/// Maximum allowed command line length (prevents unbounded memory allocation).
const MAX_LINE_LENGTH: usize = 1024;

async fn read_line(stream: &UnixStream) -> Result<String> {
    let mut buf = Vec::with_capacity(128);
    loop {
        stream.readable().await?;
        let mut tmp = [0u8; 128];
        match stream.try_read(&mut tmp) {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if buf.len() > MAX_LINE_LENGTH {
                    return Err(anyhow::anyhow!(
                        "Command too long ({} bytes, max {})",
                        buf.len(),
                        MAX_LINE_LENGTH
                    ));
                }
                if buf.contains(&b'\n') {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(String::from_utf8_lossy(&buf).to_string())
}

/// Sends one command word to a running session and returns its reply.
pub async fn send_command(cmd: &str) -> Result<String> {
    send_command_to(&socket_path(), cmd).await
}

pub async fn send_command_to(path: &std::path::Path, cmd: &str) -> Result<String> {
    let mut stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("Failed to connect to session socket at {:?}", path))?;

    stream.write_all(format!("{}\n", cmd).as_bytes()).await?;
    stream.flush().await?;

    let response = read_line(&stream).await?;
    Ok(response.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_socket_server_bind_and_accept() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sock_path = temp_dir.path().join("test.sock");
        let server = SocketServer::bind_at(sock_path.clone()).unwrap();

        let client_path = sock_path.clone();
        let client = tokio::spawn(async move {
            let mut stream = UnixStream::connect(&client_path).await.unwrap();
            stream.write_all(b"replay 2\n").await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = server.accept().await.unwrap();
        assert_eq!(read_command(&mut stream).await.unwrap(), Command::Replay(2));

        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_server_unknown_command() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sock_path = temp_dir.path().join("test.sock");
        let server = SocketServer::bind_at(sock_path.clone()).unwrap();

        let client_path = sock_path.clone();
        let client =
            tokio::spawn(async move { send_command_to(&client_path, "invalid-cmd").await });

        let mut stream = server.accept().await.unwrap();
        assert!(read_command(&mut stream).await.is_err());

        let reply = client.await.unwrap().unwrap();
        assert!(reply.starts_with("error:"));
    }

    #[tokio::test]
    async fn test_send_command_reads_reply() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sock_path = temp_dir.path().join("test.sock");
        let server = SocketServer::bind_at(sock_path.clone()).unwrap();

        let client_path = sock_path.clone();
        let client = tokio::spawn(async move { send_command_to(&client_path, "status").await });

        let mut stream = server.accept().await.unwrap();
        assert_eq!(read_command(&mut stream).await.unwrap(), Command::Status);
        stream.write_all(b"ok: idle\n").await.unwrap();

        assert_eq!(client.await.unwrap().unwrap(), "ok: idle");
    }

    #[test]
    fn test_drop_removes_socket_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sock_path = temp_dir.path().join("test.sock");
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let server = SocketServer::bind_at(sock_path.clone()).unwrap();
            assert!(sock_path.exists());
            drop(server);
        });
        assert!(!sock_path.exists());
    }
}
