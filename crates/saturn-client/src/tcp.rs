//! TCP channel.
//!
//! Each connection runs two tasks:
//! - a writer draining an unbounded queue, reporting each flush to its
//!   listener and sending a heartbeat after a period of write-idleness
//! - a reader feeding a [`FrameDecoder`] and routing responses into the
//!   [`FutureRegistry`]
//!
//! A protocol or I/O error closes only this channel. Requests still in
//! flight on it are left to the timeout scanner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use saturn_common::protocol::encode_heartbeat;
use saturn_common::{Address, FrameDecoder, Message, Result, SaturnError};

use crate::channel::{next_channel_id, wait_closed, Channel, ChannelFactory, WriteListener};
use crate::config::RuntimeConfig;
use crate::future::FutureRegistry;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Socket options for [`TcpChannel`].
#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_body_size: u32,
}

impl From<&RuntimeConfig> for TcpOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            max_body_size: config.max_body_size,
        }
    }
}

struct Outbound {
    message: Message,
    listener: WriteListener,
}

struct Shared {
    id: u64,
    address: Address,
    active: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn shutdown(&self, reason: &str) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(address = %self.address, channel_id = self.id, reason, "channel closed");
        }
        self.closed.send_replace(true);
    }
}

pub struct TcpChannel {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl TcpChannel {
    /// Connect to `address` and start the reader and writer tasks.
    pub async fn connect(
        address: &Address,
        futures: Arc<FutureRegistry>,
        options: &TcpOptions,
    ) -> Result<Arc<Self>> {
        let target = address.to_string();
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(&target))
            .await
            .map_err(|_| SaturnError::ConnectFailed(format!("connect to {} timed out", target)))?
            .map_err(|e| SaturnError::ConnectFailed(format!("connect to {}: {}", target, e)))?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id: next_channel_id(),
            address: address.clone(),
            active: AtomicBool::new(true),
            closed,
        });
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            shared.clone(),
            write_half,
            receiver,
            options.heartbeat_interval,
        ));
        tokio::spawn(read_loop(
            shared.clone(),
            read_half,
            futures,
            options.max_body_size,
        ));

        debug!(address = %address, channel_id = shared.id, "channel connected");
        Ok(Arc::new(Self { shared, sender }))
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn remote_address(&self) -> &Address {
        &self.shared.address
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn write(&self, message: Message, listener: WriteListener) {
        if !self.is_active() {
            listener(Err(SaturnError::ChannelClosed(self.shared.address.to_string())));
            return;
        }
        if let Err(mpsc::error::SendError(outbound)) = self.sender.send(Outbound { message, listener }) {
            (outbound.listener)(Err(SaturnError::ChannelClosed(
                self.shared.address.to_string(),
            )));
        }
    }

    fn close(&self) {
        self.shared.shutdown("closed locally");
    }

    async fn closed(&self) {
        wait_closed(&mut self.shared.closed.subscribe()).await;
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.shared.shutdown("dropped");
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut write_half: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Outbound>,
    heartbeat_interval: Duration,
) {
    let mut closed = shared.closed.subscribe();
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        tokio::select! {
            outbound = receiver.recv() => {
                let Some(Outbound { message, listener }) = outbound else { break };
                buf.clear();
                message.encode_into(&mut buf);
                match write_half.write_all(&buf).await {
                    Ok(()) => listener(Ok(())),
                    Err(e) => {
                        warn!(address = %shared.address, error = %e, "write failed");
                        listener(Err(e.into()));
                        shared.shutdown("write failed");
                        break;
                    }
                }
            }
            _ = tokio::time::sleep(heartbeat_interval) => {
                if let Err(e) = write_half.write_all(&encode_heartbeat()).await {
                    warn!(address = %shared.address, error = %e, "heartbeat failed");
                    shared.shutdown("heartbeat failed");
                    break;
                }
            }
            _ = wait_closed(&mut closed) => break,
        }
    }

    receiver.close();
    while let Ok(Outbound { listener, .. }) = receiver.try_recv() {
        listener(Err(SaturnError::ChannelClosed(shared.address.to_string())));
    }
    let _ = write_half.shutdown().await;
}

async fn read_loop(
    shared: Arc<Shared>,
    mut read_half: OwnedReadHalf,
    futures: Arc<FutureRegistry>,
    max_body_size: u32,
) {
    let mut closed = shared.closed.subscribe();
    let mut decoder = FrameDecoder::with_max_body(max_body_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    shared.shutdown("closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(address = %shared.address, error = %e, "read failed");
                    shared.shutdown("read failed");
                    break;
                }
            },
            _ = wait_closed(&mut closed) => break,
        };

        let messages = match decoder.push(&buf[..n]) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(address = %shared.address, error = %e, "protocol error");
                shared.shutdown("protocol error");
                break;
            }
        };

        for message in messages {
            match message {
                Message::Response(response) => {
                    futures.received(shared.id, response);
                }
                Message::Ack(invoke_id) => {
                    debug!(address = %shared.address, invoke_id, "ack received");
                }
                Message::Request(request) => {
                    warn!(
                        address = %shared.address,
                        invoke_id = request.invoke_id,
                        "unexpected request frame from provider"
                    );
                }
            }
        }
    }
}

/// Opens [`TcpChannel`]s wired to one runtime's future registry.
pub struct TcpChannelFactory {
    futures: Arc<FutureRegistry>,
    options: TcpOptions,
}

impl TcpChannelFactory {
    pub fn new(futures: Arc<FutureRegistry>, options: TcpOptions) -> Self {
        Self { futures, options }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn connect(&self, address: &Address) -> Result<Arc<dyn Channel>> {
        let channel = TcpChannel::connect(address, self.futures.clone(), &self.options).await?;
        Ok(channel as Arc<dyn Channel>)
    }
}
