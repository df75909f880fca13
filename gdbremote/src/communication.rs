/// Communication layer for the remote serial protocol
///
/// This module owns the byte stream shared by both session roles: framing
/// outbound packets, the ack/nack/retry exchange, and splitting the inbound
/// stream into packets, acks and interrupt bytes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::codec::{self, ACK, INTERRUPT, NACK};
use crate::{Result, RspError};

const READ_CHUNK: usize = 4096;

/// One unit read from the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A validated, run-length-decoded packet body
    Packet(Vec<u8>),
    /// A lone `0x03` byte outside any frame
    Interrupt,
    Ack,
    Nack,
}

/// Framed transport over any async byte stream
pub struct Connection<S> {
    reader: ReadHalf<S>,
    writer: Arc<Mutex<WriteHalf<S>>>,
    buffer: Vec<u8>,
    /// Items read while waiting for an ack, delivered before new wire data
    backlog: VecDeque<Incoming>,
    /// A decoded frame whose ack may not have gone out yet
    staged: Option<Vec<u8>>,
    no_ack: bool,
    max_retries: usize,
    ack_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, max_retries: usize, ack_timeout: Duration) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer: Arc::new(Mutex::new(writer)),
            buffer: Vec::new(),
            backlog: VecDeque::new(),
            staged: None,
            no_ack: false,
            max_retries: max_retries.max(1),
            ack_timeout,
        }
    }

    /// Stop sending and expecting `+`/`-` for the rest of the session
    pub fn set_no_ack(&mut self, no_ack: bool) {
        log::debug!("No-ack mode {}", if no_ack { "enabled" } else { "disabled" });
        self.no_ack = no_ack;
    }

    pub fn no_ack(&self) -> bool {
        self.no_ack
    }

    /// A handle that can write the interrupt byte while this connection is
    /// borrowed elsewhere
    pub fn interrupt_handle(&self) -> InterruptHandle<S> {
        InterruptHandle {
            writer: self.writer.clone(),
        }
    }

    pub async fn send_interrupt(&self) -> Result<()> {
        self.interrupt_handle().send().await
    }

    /// Frame `body` as given and send it.
    ///
    /// In ack mode the frame is retransmitted on `-` or silence, up to the
    /// retry bound; after that the packet is assumed lost and the call
    /// returns normally.
    pub async fn send_packet(&mut self, body: &[u8]) -> Result<()> {
        let frame = codec::build_packet(body);
        log::trace!("SEND: {}", String::from_utf8_lossy(&frame));

        if self.no_ack {
            return self.write_raw(&frame).await;
        }

        for attempt in 1..=self.max_retries {
            self.write_raw(&frame).await?;
            if self.wait_for_ack().await? {
                return Ok(());
            }
            log::warn!(
                "Packet not acknowledged (attempt {}/{}), retransmitting",
                attempt,
                self.max_retries
            );
        }

        log::warn!(
            "No acknowledgement after {} attempts, continuing: {}",
            self.max_retries,
            String::from_utf8_lossy(body)
        );
        Ok(())
    }

    /// Write an already-encoded byte sequence with no framing
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// `true` on `+`, `false` on `-` or timeout
    async fn wait_for_ack(&mut self) -> Result<bool> {
        let deadline = Instant::now() + self.ack_timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.read_wire()).await {
                Err(_) => return Ok(false),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(Incoming::Ack)) => return Ok(true),
                Ok(Ok(Incoming::Nack)) => return Ok(false),
                Ok(Ok(other)) => self.backlog.push_back(other),
            }
        }
    }

    /// Next packet, interrupt, or stray ack from the peer.
    ///
    /// Cancel safe: a frame read before cancellation is delivered by the
    /// next call.
    pub async fn next_incoming(&mut self) -> Result<Incoming> {
        if let Some(item) = self.backlog.pop_front() {
            return Ok(item);
        }
        self.read_wire().await
    }

    /// Wait for the next packet, skipping acks and interrupt bytes
    pub async fn recv_packet(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.next_incoming().await? {
                Incoming::Packet(body) => return Ok(body),
                other => log::debug!("Ignoring {:?} while waiting for a packet", other),
            }
        }
    }

    async fn read_wire(&mut self) -> Result<Incoming> {
        loop {
            if self.staged.is_some() {
                if !self.no_ack {
                    self.write_raw(&[ACK]).await?;
                }
                if let Some(body) = self.staged.take() {
                    return Ok(Incoming::Packet(body));
                }
            }

            if let Some(item) = self.take_buffered().await? {
                return Ok(item);
            }
            if self.staged.is_some() {
                continue;
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(RspError::Disconnected);
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Pull one complete item out of the receive buffer, if there is one
    async fn take_buffered(&mut self) -> Result<Option<Incoming>> {
        loop {
            let Some(&first) = self.buffer.first() else {
                return Ok(None);
            };

            match first {
                ACK => {
                    self.buffer.remove(0);
                    return Ok(Some(Incoming::Ack));
                }
                NACK => {
                    self.buffer.remove(0);
                    return Ok(Some(Incoming::Nack));
                }
                INTERRUPT => {
                    self.buffer.remove(0);
                    log::debug!("RECV: interrupt");
                    return Ok(Some(Incoming::Interrupt));
                }
                b'$' => {}
                other => {
                    log::debug!("Dropping stray byte {:#04x}", other);
                    self.buffer.remove(0);
                    continue;
                }
            }

            let Some(end) = self.buffer.iter().position(|&b| b == b'#') else {
                return Ok(None);
            };
            if self.buffer.len() < end + 3 {
                return Ok(None);
            }

            let frame: Vec<u8> = self.buffer.drain(..end + 3).collect();
            log::trace!("RECV: {}", String::from_utf8_lossy(&frame));

            let decoded = codec::parse_packet(&frame).and_then(codec::length_decode);
            match decoded {
                Ok(body) => {
                    self.staged = Some(body);
                    return Ok(None);
                }
                Err(e) => {
                    log::warn!("Rejecting frame: {}", e);
                    if !self.no_ack {
                        self.write_raw(&[NACK]).await?;
                    }
                }
            }
        }
    }
}

/// Writes the raw interrupt byte from outside the session that owns the
/// connection
pub struct InterruptHandle<S> {
    writer: Arc<Mutex<WriteHalf<S>>>,
}

impl<S> Clone for InterruptHandle<S> {
    fn clone(&self) -> Self {
        Self {
            writer: self.writer.clone(),
        }
    }
}

impl<S> InterruptHandle<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub async fn send(&self) -> Result<()> {
        log::debug!("SEND: interrupt");
        let mut writer = self.writer.lock().await;
        writer.write_all(&[INTERRUPT]).await?;
        writer.flush().await?;
        Ok(())
    }
}
