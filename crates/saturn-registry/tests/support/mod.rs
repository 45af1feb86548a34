// Shared helpers for saturn-registry integration tests.
//
// `EchoProvider` answers every JSON call on loopback TCP with its first
// argument and counts the requests it served.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use saturn_common::{
    Address, FrameDecoder, JsonSerializer, Message, RegisterMeta, ResponseFrame, ResultWrapper,
    Serializer, ServiceMeta, Status,
};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

pub struct EchoProvider {
    address: Address,
    requests: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl EchoProvider {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = Address::from(listener.local_addr().unwrap());
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();
        let task = tokio::spawn(async move {
            let mut connections = JoinSet::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                connections.spawn(serve_connection(stream, counter.clone()));
            }
        });
        Self {
            address,
            requests,
            task,
        }
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    pub fn register_meta(&self, service: &ServiceMeta) -> RegisterMeta {
        RegisterMeta::new(self.address(), service.clone())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for EchoProvider {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, requests: Arc<AtomicUsize>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let Ok(messages) = decoder.push(&buf[..n]) else { return };

        for message in messages {
            let Message::Request(request) = message else { continue };
            requests.fetch_add(1, Ordering::SeqCst);

            let call = JsonSerializer.decode_call(&request.body).unwrap();
            let value = call.args.first().cloned().unwrap_or(Value::Null);
            let body = JsonSerializer.encode_result(&ResultWrapper::ok(value)).unwrap();
            let response = Message::Response(ResponseFrame::new(
                request.invoke_id,
                JsonSerializer::CODE,
                Status::Ok,
                body,
            ));
            if stream.write_all(&response.encode()).await.is_err() {
                return;
            }
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll until `check` holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
