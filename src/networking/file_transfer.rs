use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

use super::connector::{connect_with_timeout, DEFAULT_ACK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT};
use super::protocol::{read_message, write_message, Message, ACCEPTED, REJECTED};
use super::status::StatusNotifier;
use crate::error::{PeerError, Result};

// Constants for file transfer
pub const DEFAULT_CHUNK_SIZE: usize = 4096;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 5 * 1024 * 1024 * 1024; // 5 GiB
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const REPLY_BUFFER_SIZE: usize = 1024;
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Status of a file transfer, reported via progress callback
#[derive(Debug, Clone)]
pub enum TransferStatus {
    /// Request sent or received
    Started {
        transfer_id: String,
        direction: TransferDirection,
        file_name: String,
        file_size: u64,
    },
    /// Transfer in progress
    Progress {
        transfer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        percent_complete: f32,
    },
    /// Transfer completed successfully
    Completed {
        transfer_id: String,
        bytes_transferred: u64,
        elapsed_seconds: f32,
        throughput_mbps: f32,
    },
    /// Receiver declined the request
    Rejected {
        transfer_id: String,
        file_name: String,
    },
    /// Transfer failed
    Failed {
        transfer_id: String,
        error: String,
    },
}

/// Direction of file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Sending a file
    Send,
    /// Receiving a file
    Receive,
}

/// Type of progress callback for file transfers
pub type ProgressCallback = Arc<dyn Fn(TransferStatus) + Send + Sync>;

/// Configuration for file transfers
#[derive(Clone)]
pub struct FileTransferConfig {
    /// Bytes per read/write of file data
    pub chunk_size: usize,
    /// Sender-side connect timeout
    pub connect_timeout: Duration,
    /// How long to wait for the request or its `accepted`/`rejected` reply
    pub response_timeout: Duration,
    /// Longest pause tolerated between two chunks
    pub idle_timeout: Duration,
    /// Requests above this size are rejected
    pub max_file_size: u64,
    /// Optional progress callback
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for FileTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            response_timeout: DEFAULT_ACK_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            progress_callback: None,
        }
    }
}

/// Lifecycle of a single transfer.
///
/// `Requested -> Accepted -> Transferring -> Completed`, `Requested -> Rejected`,
/// or any non-terminal state `-> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Accepted,
    Transferring,
    Completed,
    Rejected,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    pub fn can_advance_to(self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Requested, Accepted) | (Requested, Rejected) => true,
            (Accepted, Transferring) | (Transferring, Completed) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// The `file_transfer` request sent ahead of the payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub file_name: String,
    /// Advisory only; end-of-stream decides where the file ends
    pub file_size: u64,
}

impl TransferRequest {
    pub fn to_message(&self) -> Message {
        Message::FileTransfer {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
        }
    }

    pub fn from_message(message: Message) -> Result<Self> {
        match message {
            Message::FileTransfer { file_name, file_size } => Ok(Self { file_name, file_size }),
            other => Err(PeerError::ProtocolViolation(format!(
                "expected file_transfer, got {}",
                other.type_name()
            ))),
        }
    }

    /// Reason to refuse the request, if any
    pub fn rejection_reason(&self, max_file_size: u64) -> Option<String> {
        if !is_plain_file_name(&self.file_name) {
            return Some(format!("unsafe file name {:?}", self.file_name));
        }
        if self.file_size > max_file_size {
            return Some(format!(
                "{} bytes exceeds the {} byte limit",
                self.file_size, max_file_size
            ));
        }
        None
    }
}

fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

/// One transfer's bookkeeping, returned to callers on success
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
    pub direction: TransferDirection,
    pub request: TransferRequest,
    /// Source file when sending, destination file when receiving
    pub local_path: PathBuf,
    pub bytes_transferred: u64,
    state: TransferState,
}

impl Transfer {
    fn new(direction: TransferDirection, request: TransferRequest, local_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            request,
            local_path,
            bytes_transferred: 0,
            state: TransferState::Requested,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn advance(&mut self, next: TransferState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(PeerError::ProtocolViolation(format!(
                "invalid transfer transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!("Transfer {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Sends and receives single files over dedicated connections.
#[derive(Clone)]
pub struct FileTransferEngine {
    config: FileTransferConfig,
    notifier: StatusNotifier,
}

impl FileTransferEngine {
    pub fn new(config: FileTransferConfig, notifier: StatusNotifier) -> Self {
        Self { config, notifier }
    }

    pub fn config(&self) -> &FileTransferConfig {
        &self.config
    }

    fn report(&self, status: TransferStatus) {
        if let Some(callback) = &self.config.progress_callback {
            callback(status);
        }
    }

    fn report_progress(&self, transfer: &Transfer) {
        let total = transfer.request.file_size;
        let percent = if total == 0 {
            100.0
        } else {
            ((transfer.bytes_transferred as f64 / total as f64) * 100.0).min(100.0) as f32
        };
        self.report(TransferStatus::Progress {
            transfer_id: transfer.id.clone(),
            bytes_transferred: transfer.bytes_transferred,
            total_bytes: total,
            percent_complete: percent,
        });
    }

    fn report_completed(&self, transfer: &Transfer, started: Instant) {
        let elapsed_secs = started.elapsed().as_secs_f32();
        let throughput = if elapsed_secs > 0.0 {
            (transfer.bytes_transferred as f32 / elapsed_secs) / (1024.0 * 1024.0)
        } else {
            0.0
        };
        self.report(TransferStatus::Completed {
            transfer_id: transfer.id.clone(),
            bytes_transferred: transfer.bytes_transferred,
            elapsed_seconds: elapsed_secs,
            throughput_mbps: throughput,
        });
        debug!(
            "Transfer {} finished: {} bytes in {:.2}s ({:.2} MB/s)",
            transfer.id, transfer.bytes_transferred, elapsed_secs, throughput
        );
    }

    /// Mark a failed transfer and hand the error back
    fn fail(&self, transfer: &mut Transfer, err: PeerError) -> PeerError {
        if !transfer.state.is_terminal() {
            transfer.state = TransferState::Failed;
            self.report(TransferStatus::Failed {
                transfer_id: transfer.id.clone(),
                error: err.to_string(),
            });
        }
        err
    }

    /// Send `file_path` to `peer_ip:peer_port` over a new connection.
    ///
    /// Bytes flow only after the receiver answers `accepted`. Bytes already
    /// sent when an error hits are not retracted.
    pub async fn send<P: AsRef<Path>>(&self, file_path: P, peer_ip: IpAddr, peer_port: u16) -> Result<Transfer> {
        let path = file_path.as_ref();
        let metadata = fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(PeerError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let file_name = path
            .file_name()
            .ok_or_else(|| {
                PeerError::Io(io::Error::new(io::ErrorKind::InvalidInput, "invalid file path"))
            })?
            .to_string_lossy()
            .to_string();

        let request = TransferRequest {
            file_name,
            file_size: metadata.len(),
        };
        let mut transfer = Transfer::new(TransferDirection::Send, request, path.to_path_buf());
        let addr = SocketAddr::new(peer_ip, peer_port);

        match self.run_send(&mut transfer, addr).await {
            Ok(()) => {
                self.notifier.info(format!(
                    "File sent: {} to {} ({} bytes)",
                    transfer.request.file_name, peer_ip, transfer.bytes_transferred
                ));
                Ok(transfer)
            }
            Err(e) => Err(self.fail(&mut transfer, e)),
        }
    }

    async fn run_send(&self, transfer: &mut Transfer, addr: SocketAddr) -> Result<()> {
        let mut file = File::open(&transfer.local_path).await?;
        let mut stream = connect_with_timeout(addr, self.config.connect_timeout).await?;

        write_message(&mut stream, &transfer.request.to_message()).await?;
        self.report(TransferStatus::Started {
            transfer_id: transfer.id.clone(),
            direction: TransferDirection::Send,
            file_name: transfer.request.file_name.clone(),
            file_size: transfer.request.file_size,
        });

        let reply = read_reply(&mut stream, self.config.response_timeout).await?;
        if reply == ACCEPTED {
            transfer.advance(TransferState::Accepted)?;
        } else if reply == REJECTED {
            transfer.advance(TransferState::Rejected)?;
            self.report(TransferStatus::Rejected {
                transfer_id: transfer.id.clone(),
                file_name: transfer.request.file_name.clone(),
            });
            return Err(PeerError::Rejected {
                file_name: transfer.request.file_name.clone(),
            });
        } else {
            return Err(PeerError::ProtocolViolation(format!(
                "unexpected transfer reply {:?}",
                String::from_utf8_lossy(&reply)
            )));
        }

        transfer.advance(TransferState::Transferring)?;
        let started = Instant::now();
        if let Err(e) = self.stream_file(&mut file, &mut stream, transfer).await {
            abort_connection(stream);
            return Err(e);
        }
        stream.shutdown().await?;

        transfer.advance(TransferState::Completed)?;
        self.report_completed(transfer, started);
        Ok(())
    }

    async fn stream_file(&self, file: &mut File, stream: &mut TcpStream, transfer: &mut Transfer) -> Result<()> {
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                return Ok(());
            }
            timeout(self.config.idle_timeout, stream.write_all(&buffer[..n]))
                .await
                .map_err(|_| PeerError::timeout("sending file data", self.config.idle_timeout))??;
            transfer.bytes_transferred += n as u64;
            self.report_progress(transfer);
        }
    }

    /// Read a transfer request from `stream` and receive the file into `destination`.
    pub async fn receive<S>(&self, stream: &mut S, destination: &Path) -> Result<Transfer>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let message = read_message(stream, self.config.response_timeout).await?;
        let request = TransferRequest::from_message(message)?;
        self.receive_request(stream, request, destination).await
    }

    /// Answer an already-read request and, if accepted, read until end-of-stream.
    ///
    /// A rejected request is not an error: the returned transfer is in
    /// `Rejected`. Existing files are never overwritten; a taken name gets a
    /// ` (n)` suffix. On failure only the file this transfer created is removed.
    pub async fn receive_request<S>(
        &self,
        stream: &mut S,
        request: TransferRequest,
        destination: &Path,
    ) -> Result<Transfer>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut transfer = Transfer::new(TransferDirection::Receive, request, destination.to_path_buf());
        info!(
            "Incoming file: {} ({} bytes)",
            transfer.request.file_name, transfer.request.file_size
        );
        self.report(TransferStatus::Started {
            transfer_id: transfer.id.clone(),
            direction: TransferDirection::Receive,
            file_name: transfer.request.file_name.clone(),
            file_size: transfer.request.file_size,
        });

        if let Some(reason) = transfer.request.rejection_reason(self.config.max_file_size) {
            stream.write_all(REJECTED).await?;
            stream.flush().await?;
            transfer.advance(TransferState::Rejected)?;
            self.report(TransferStatus::Rejected {
                transfer_id: transfer.id.clone(),
                file_name: transfer.request.file_name.clone(),
            });
            self.notifier.warning(format!(
                "Rejected file {:?}: {}",
                transfer.request.file_name, reason
            ));
            return Ok(transfer);
        }

        match self.run_receive(stream, &mut transfer, destination).await {
            Ok(()) => Ok(transfer),
            Err(e) => {
                // local_path only moves off the directory once the file exists
                if transfer.local_path != destination {
                    if let Err(remove_err) = fs::remove_file(&transfer.local_path).await {
                        warn!(
                            "Failed to remove partial file {}: {}",
                            transfer.local_path.display(),
                            remove_err
                        );
                    }
                }
                Err(self.fail(&mut transfer, e))
            }
        }
    }

    async fn run_receive<S>(&self, stream: &mut S, transfer: &mut Transfer, destination: &Path) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let created = async {
            fs::create_dir_all(destination).await?;
            create_unique(destination, &transfer.request.file_name).await
        }
        .await;
        let (mut file, file_path) = match created {
            Ok(created) => created,
            Err(e) => {
                // Best effort: tell the sender not to stream
                let _ = stream.write_all(REJECTED).await;
                return Err(e.into());
            }
        };
        transfer.local_path = file_path;

        stream.write_all(ACCEPTED).await?;
        stream.flush().await?;
        transfer.advance(TransferState::Accepted)?;
        transfer.advance(TransferState::Transferring)?;

        let started = Instant::now();
        let mut buffer = vec![0u8; self.config.chunk_size.max(1)];
        loop {
            let n = timeout(self.config.idle_timeout, stream.read(&mut buffer))
                .await
                .map_err(|_| PeerError::timeout("receiving file data", self.config.idle_timeout))??;
            if n == 0 {
                break;
            }
            if transfer.bytes_transferred + n as u64 > self.config.max_file_size {
                return Err(PeerError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{} kept sending past the {} byte limit",
                        transfer.request.file_name, self.config.max_file_size
                    ),
                )));
            }
            file.write_all(&buffer[..n]).await?;
            transfer.bytes_transferred += n as u64;
            self.report_progress(transfer);
        }
        file.flush().await?;

        let declared = transfer.request.file_size;
        let received = transfer.bytes_transferred;
        if received == 0 && declared > 0 {
            return Err(PeerError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed before any of {} declared bytes arrived", declared),
            )));
        }
        if received != declared {
            self.notifier.warning(format!(
                "Size mismatch for {}: declared {} bytes, received {}",
                transfer.request.file_name, declared, received
            ));
        }

        transfer.advance(TransferState::Completed)?;
        self.report_completed(transfer, started);
        let saved_as = transfer
            .local_path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| transfer.request.file_name.clone());
        self.notifier.info(format!("File received: {} ({} bytes)", saved_as, received));
        Ok(())
    }
}

/// Create `name` in `dir`, or `stem (n).ext` when that name is taken
async fn create_unique(dir: &Path, name: &str) -> io::Result<(File, PathBuf)> {
    let original = Path::new(name);
    let stem = original
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    let extension = original.extension().map(|e| e.to_string_lossy().to_string());

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = match (attempt, &extension) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (n, None) => format!("{} ({})", stem, n),
        };
        let path = dir.join(candidate);
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => {
                if attempt > 0 {
                    info!("{} exists, saving as {}", name, path.display());
                }
                return Ok((file, path));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {} in {}", name, dir.display()),
    ))
}

/// Close with a reset instead of a FIN so the peer cannot mistake it for end-of-file
fn abort_connection(stream: TcpStream) {
    #[allow(deprecated)]
    let linger = stream.set_linger(Some(Duration::ZERO));
    if let Err(e) = linger {
        debug!("Failed to set linger before abort: {}", e);
    }
    drop(stream);
}

async fn read_reply<R: AsyncRead + Unpin>(stream: &mut R, wait: Duration) -> Result<Vec<u8>> {
    let mut buf = [0u8; REPLY_BUFFER_SIZE];
    let n = timeout(wait, stream.read(&mut buf))
        .await
        .map_err(|_| PeerError::timeout("waiting for transfer reply", wait))??;
    if n == 0 {
        return Err(PeerError::ProtocolViolation(
            "connection closed before the transfer reply".to_string(),
        ));
    }
    Ok(buf[..n].to_vec())
}
