//! GDB remote serial protocol client
//!
//! Implements just the [`DebugSession`] surface on top of a byte stream
//! connected to a gdbstub (QEMU, gdbserver, ...). Packets are framed as
//! `$payload#checksum` and acknowledged with `+`.

use crate::session::{DebugSession, ResumeAction, SessionError, StopReply, WatchpointKind};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Largest memory block moved by a single `m`/`M` packet
const MAX_MEMORY_CHUNK: usize = 0x400;

/// Times a packet is retransmitted after a negative acknowledgement
const MAX_RETRANSMITS: usize = 3;

const DETACH_TIMEOUT: Duration = Duration::from_secs(1);

/// Out-of-band interrupt request (Ctrl-C)
const INTERRUPT: u8 = 0x03;

/// Debug session speaking the GDB remote serial protocol
pub struct RspSession<T> {
    stream: BufReader<T>,
    /// Set while a resume has no stop reply yet
    running: bool,
}

impl RspSession<TcpStream> {
    /// Connect to a gdbstub listening on `host:port`
    pub async fn connect(host: &str, port: u16) -> Result<Self, SessionError> {
        tracing::debug!("Connecting to remote target {}:{}", host, port);
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RspSession<T> {
    /// Wrap a stream already connected to a gdbstub
    pub fn new(stream: T) -> Self {
        Self {
            stream: BufReader::new(stream),
            running: false,
        }
    }

    async fn send_packet(&mut self, payload: &str) -> Result<(), SessionError> {
        let frame = format!("${}#{:02x}", payload, checksum(payload.as_bytes()));
        tracing::trace!("-> {}", frame);

        for _ in 0..=MAX_RETRANSMITS {
            self.stream.write_all(frame.as_bytes()).await?;
            self.stream.flush().await?;
            match self.read_byte().await? {
                b'+' => return Ok(()),
                b'-' => tracing::debug!("Remote rejected packet, retransmitting"),
                other => {
                    return Err(SessionError::Protocol(format!(
                        "Expected acknowledgement, got {:?}",
                        other as char
                    )))
                }
            }
        }
        Err(SessionError::Protocol(format!(
            "Packet rejected {} times",
            MAX_RETRANSMITS + 1
        )))
    }

    async fn read_packet(&mut self) -> Result<Vec<u8>, SessionError> {
        loop {
            // Skip stray acknowledgements and noise up to the packet start
            while self.read_byte().await? != b'$' {}

            let mut body = Vec::new();
            loop {
                match self.read_byte().await? {
                    b'#' => break,
                    byte => body.push(byte),
                }
            }
            let mut sum = [0u8; 2];
            self.stream.read_exact(&mut sum).await?;

            let expected = std::str::from_utf8(&sum)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok());
            if expected != Some(checksum(&body)) {
                tracing::debug!("Checksum mismatch on incoming packet, requesting retransmit");
                self.stream.write_all(b"-").await?;
                self.stream.flush().await?;
                continue;
            }

            self.stream.write_all(b"+").await?;
            self.stream.flush().await?;
            let payload = expand_run_length(&body)?;
            tracing::trace!("<- {}", String::from_utf8_lossy(&payload));
            return Ok(payload);
        }
    }

    async fn read_byte(&mut self) -> Result<u8, SessionError> {
        match self.stream.read_u8().await {
            Ok(byte) => Ok(byte),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SessionError::Closed),
            Err(e) => Err(e.into()),
        }
    }

    async fn transact(&mut self, payload: &str) -> Result<Vec<u8>, SessionError> {
        self.send_packet(payload).await?;
        self.read_packet().await
    }

    /// Read packets until a stop reply arrives, skipping console output
    async fn read_stop_reply(&mut self) -> Result<StopReply, SessionError> {
        loop {
            let reply = self.read_packet().await?;
            if reply.first() == Some(&b'O') && reply != b"OK" {
                if let Ok(text) = hex::decode(&reply[1..]) {
                    tracing::debug!("Target output: {}", String::from_utf8_lossy(&text).trim_end());
                }
                continue;
            }
            return parse_stop_reply(&reply);
        }
    }

    async fn read_chunk(&mut self, address: u64, out: &mut [u8]) -> Result<(), SessionError> {
        let reply = self
            .transact(&format!("m{:x},{:x}", address, out.len()))
            .await?;
        check_error(&reply)?;
        if reply.len() != out.len() * 2 {
            return Err(SessionError::Protocol(format!(
                "Short memory read at {:#x}: {} of {} bytes",
                address,
                reply.len() / 2,
                out.len()
            )));
        }
        hex::decode_to_slice(&reply, out)
            .map_err(|e| SessionError::Protocol(format!("Bad memory contents: {}", e)))
    }

    async fn write_chunk(&mut self, address: u64, data: &[u8]) -> Result<(), SessionError> {
        let reply = self
            .transact(&format!("M{:x},{:x}:{}", address, data.len(), hex::encode(data)))
            .await?;
        expect_ok(&reply)
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let features = self
            .transact("qSupported:multiprocess-;swbreak+;hwbreak+;vContSupported+")
            .await?;
        tracing::debug!("Remote features: {}", String::from_utf8_lossy(&features));

        let vcont = self.transact("vCont?").await?;
        let actions: Vec<&[u8]> = vcont.split(|&b| b == b';').skip(1).collect();
        let supported = |action: &[u8]| actions.iter().any(|a| *a == action);
        if !vcont.starts_with(b"vCont") || !supported(b"s") || !supported(b"c") {
            return Err(SessionError::Unsupported("vCont step/continue".to_string()));
        }

        self.send_packet("?").await?;
        let stop = self.read_stop_reply().await?;
        tracing::debug!("Initial stop: {:?}", stop);
        Ok(())
    }

    async fn set_watchpoint(&mut self, z: u8, address: u64, length: u32) -> Result<(), SessionError> {
        let reply = self
            .transact(&format!("Z{},{:x},{:x}", z, address, length))
            .await?;
        if reply.is_empty() {
            return Err(SessionError::Unsupported(format!("watchpoint type Z{}", z)));
        }
        expect_ok(&reply)
    }

    async fn write_blocks(&mut self, address: u64, data: &[u8]) -> Result<(), SessionError> {
        for (i, chunk) in data.chunks(MAX_MEMORY_CHUNK).enumerate() {
            let offset = (i * MAX_MEMORY_CHUNK) as u64;
            self.write_chunk(address + offset, chunk).await?;
        }
        Ok(())
    }

    async fn read_blocks(&mut self, address: u64, out: &mut [u8]) -> Result<(), SessionError> {
        for (i, chunk) in out.chunks_mut(MAX_MEMORY_CHUNK).enumerate() {
            let offset = (i * MAX_MEMORY_CHUNK) as u64;
            self.read_chunk(address + offset, chunk).await?;
        }
        Ok(())
    }

    async fn vcont(&mut self, command: &str) -> Result<StopReply, SessionError> {
        self.running = true;
        self.send_packet(command).await?;
        let stop = self.read_stop_reply().await?;
        self.running = false;
        Ok(stop)
    }

    /// Stop a target left running by an abandoned resume
    async fn interrupt(&mut self) -> Result<StopReply, SessionError> {
        self.stream.write_all(&[INTERRUPT]).await?;
        self.stream.flush().await?;
        let stop = self.read_stop_reply().await?;
        self.running = false;
        Ok(stop)
    }
}

/// Run `fut` unless `cancel` fires first
async fn cancellable<R>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<R, SessionError>>,
) -> Result<R, SessionError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::Cancelled),
        result = fut => result,
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DebugSession for RspSession<T> {
    async fn init(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        cancellable(cancel, self.handshake()).await
    }

    async fn insert_watchpoint(
        &mut self,
        kind: WatchpointKind,
        address: u64,
        length: u32,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        let z = match kind {
            WatchpointKind::Write => 2,
            WatchpointKind::Read => 3,
            WatchpointKind::Access => 4,
        };
        cancellable(cancel, self.set_watchpoint(z, address, length)).await
    }

    async fn write_memory(
        &mut self,
        address: u64,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        cancellable(cancel, self.write_blocks(address, data)).await
    }

    async fn read_memory(
        &mut self,
        address: u64,
        out: &mut [u8],
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        cancellable(cancel, self.read_blocks(address, out)).await
    }

    async fn resume(
        &mut self,
        actions: &[ResumeAction],
        cancel: &CancellationToken,
    ) -> Result<StopReply, SessionError> {
        if actions.is_empty() {
            return Err(SessionError::Protocol("Empty resume action list".to_string()));
        }
        let mut command = String::from("vCont");
        for action in actions {
            command.push_str(match action {
                ResumeAction::Step => ";s",
                ResumeAction::Continue => ";c",
            });
        }
        cancellable(cancel, self.vcont(&command)).await
    }

    async fn dispose(&mut self, _cancel: &CancellationToken) {
        // An all-stop stub ignores packets while the target runs
        if self.running {
            tracing::debug!("Interrupting running target");
            match tokio::time::timeout(DETACH_TIMEOUT, self.interrupt()).await {
                Ok(Ok(stop)) => tracing::debug!("Target stopped: {:?}", stop),
                Ok(Err(e)) => tracing::debug!("Interrupt failed: {}", e),
                Err(_) => tracing::debug!("Interrupt timed out"),
            }
        }

        tracing::debug!("Detaching from remote target");
        match tokio::time::timeout(DETACH_TIMEOUT, self.transact("D")).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::debug!("Detach failed: {}", e),
            Err(_) => tracing::debug!("Detach timed out"),
        }
        if let Err(e) = self.stream.get_mut().shutdown().await {
            tracing::debug!("Closing connection failed: {}", e);
        }
    }
}

/// Modulo-256 sum of the packet payload
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Undo run-length encoding (`x*n` repeats `x` `n - 29` more times)
fn expand_run_length(body: &[u8]) -> Result<Vec<u8>, SessionError> {
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(byte) = iter.next() {
        if byte != b'*' {
            out.push(byte);
            continue;
        }
        let count = iter
            .next()
            .and_then(|c| c.checked_sub(29))
            .ok_or_else(|| SessionError::Protocol("Bad run-length encoding".to_string()))?;
        let last = *out
            .last()
            .ok_or_else(|| SessionError::Protocol("Run-length without a preceding byte".to_string()))?;
        out.extend(std::iter::repeat(last).take(count as usize));
    }
    Ok(out)
}

fn parse_hex_u8(bytes: &[u8]) -> Result<u8, SessionError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
        .ok_or_else(|| SessionError::Protocol(format!("Bad hex byte {:?}", String::from_utf8_lossy(bytes))))
}

fn parse_hex_u64(bytes: &[u8]) -> Result<u64, SessionError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| u64::from_str_radix(s, 16).ok())
        .ok_or_else(|| SessionError::Protocol(format!("Bad hex value {:?}", String::from_utf8_lossy(bytes))))
}

fn check_error(reply: &[u8]) -> Result<(), SessionError> {
    if reply.len() == 3 && reply[0] == b'E' {
        return Err(SessionError::ErrorReply(parse_hex_u8(&reply[1..])?));
    }
    Ok(())
}

fn expect_ok(reply: &[u8]) -> Result<(), SessionError> {
    check_error(reply)?;
    if reply == b"OK" {
        Ok(())
    } else {
        Err(SessionError::Protocol(format!(
            "Expected OK, got {:?}",
            String::from_utf8_lossy(reply)
        )))
    }
}

/// Decode a stop reply packet
pub fn parse_stop_reply(reply: &[u8]) -> Result<StopReply, SessionError> {
    let malformed = || SessionError::Protocol(format!("Bad stop reply {:?}", String::from_utf8_lossy(reply)));
    if reply.len() < 3 {
        return Err(malformed());
    }
    let code = parse_hex_u8(&reply[1..3])?;

    match reply[0] {
        b'T' => {
            let mut watchpoints = Vec::new();
            for pair in reply[3..].split(|&b| b == b';').filter(|p| !p.is_empty()) {
                let mut parts = pair.splitn(2, |&b| b == b':');
                let key = parts.next().unwrap_or_default();
                let value = parts.next().ok_or_else(malformed)?;
                if matches!(key, b"watch" | b"rwatch" | b"awatch") {
                    watchpoints.push(parse_hex_u64(value)?);
                }
            }
            Ok(StopReply::Signal {
                signal: code,
                watchpoints,
            })
        }
        b'S' => Ok(StopReply::Signal {
            signal: code,
            watchpoints: Vec::new(),
        }),
        b'W' => Ok(StopReply::Exited { status: code }),
        b'X' => Ok(StopReply::Terminated { signal: code }),
        b'E' => Err(SessionError::ErrorReply(code)),
        _ => Err(malformed()),
    }
}
