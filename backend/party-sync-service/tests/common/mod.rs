#![allow(dead_code)]

use actix_middleware::TraceIdMiddleware;
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use async_trait::async_trait;
use party_sync_service::config::Config;
use party_sync_service::hub::{ClientSocket, CloseFrame, PartyHub, SocketError};
use party_sync_service::routes;
use party_sync_service::state::AppState;
use redis_utils::{BackboneConnector, MemoryBackbone};
use serde_json::Value;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(2);

/// What the hub wrote to a fake socket
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Ping,
    Close(CloseFrame),
}

/// Hub side of an in-memory socket
pub struct FakeSocket {
    inbound: UnboundedReceiver<Result<String, SocketError>>,
    outbound: UnboundedSender<Outbound>,
}

#[async_trait(?Send)]
impl ClientSocket for FakeSocket {
    async fn recv(&mut self) -> Option<Result<String, SocketError>> {
        self.inbound.recv().await
    }

    async fn send(&mut self, frame: String) -> Result<(), SocketError> {
        self.outbound
            .send(Outbound::Text(frame))
            .map_err(|_| SocketError::Closed)
    }

    async fn ping(&mut self) -> Result<(), SocketError> {
        self.outbound
            .send(Outbound::Ping)
            .map_err(|_| SocketError::Closed)
    }

    async fn close(&mut self, frame: CloseFrame) {
        let _ = self.outbound.send(Outbound::Close(frame));
    }
}

/// Test side of an in-memory socket
pub struct FakeClient {
    tx: Option<UnboundedSender<Result<String, SocketError>>>,
    rx: UnboundedReceiver<Outbound>,
}

impl FakeClient {
    pub fn send_text(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            tx.send(Ok(text.into())).unwrap();
        }
    }

    pub fn send_binary(&self) {
        if let Some(tx) = &self.tx {
            tx.send(Err(SocketError::UnsupportedFrame("binary"))).unwrap();
        }
    }

    /// Transport failure surfaced by the socket
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.tx {
            tx.send(Err(SocketError::Protocol(reason.to_string()))).unwrap();
        }
    }

    /// Peer closes its side
    pub fn hang_up(&mut self) {
        self.tx.take();
    }

    /// Next text frame as JSON, skipping pings
    pub async fn next_json(&mut self) -> Value {
        loop {
            let frame = timeout(WAIT, self.rx.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket dropped by hub");
            match frame {
                Outbound::Text(text) => return serde_json::from_str(&text).unwrap(),
                Outbound::Ping => continue,
                Outbound::Close(frame) => panic!("unexpected close: {frame:?}"),
            }
        }
    }

    pub async fn expect_close(&mut self) -> CloseFrame {
        loop {
            let frame = timeout(WAIT, self.rx.recv())
                .await
                .expect("timed out waiting for close")
                .expect("socket dropped without a close frame");
            if let Outbound::Close(frame) = frame {
                return frame;
            }
        }
    }

    /// Nothing queued right now
    pub fn is_idle(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(Outbound::Ping) => continue,
                Ok(_) => return false,
                Err(_) => return true,
            }
        }
    }
}

pub fn fake_socket() -> (FakeSocket, FakeClient) {
    let (in_tx, in_rx) = unbounded_channel();
    let (out_tx, out_rx) = unbounded_channel();
    (
        FakeSocket {
            inbound: in_rx,
            outbound: out_tx,
        },
        FakeClient {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}

pub fn memory_connector(bus: &MemoryBackbone) -> Arc<BackboneConnector> {
    Arc::new(BackboneConnector::with_backbone(Arc::new(bus.clone())))
}

pub fn test_config() -> Config {
    Config {
        redis_url: "memory://".to_string(),
        backbone_poll_timeout_ms: 50,
        backbone_idle_sleep_ms: 1,
        ..Config::default()
    }
}

/// App state over a private in-memory backbone
pub fn test_state(config: Config) -> AppState {
    let hub = Arc::new(PartyHub::new(
        config.hub_config(),
        memory_connector(&MemoryBackbone::new()),
    ));
    AppState::new(hub, Arc::new(config))
}

/// App state whose backbone is resolved from `config.redis_url`
pub async fn connected_state(config: Config) -> AppState {
    let connector = Arc::new(BackboneConnector::new(config.redis_url.clone()));
    let hub = Arc::new(PartyHub::new(config.hub_config(), connector));
    hub.start().await;
    AppState::new(hub, Arc::new(config))
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    handle: ServerHandle,
}

impl TestServer {
    pub async fn start(state: AppState) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let app_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .wrap(TraceIdMiddleware)
                .app_data(web::Data::new(app_state.clone()))
                .configure(|cfg| routes::configure(cfg, None))
        })
        .workers(1)
        .shutdown_timeout(1)
        .listen(listener)
        .unwrap()
        .run();

        let handle = server.handle();
        actix_rt::spawn(server);

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Open sockets would hold a graceful stop for the whole shutdown timeout
    pub async fn stop(self) {
        self.handle.stop(false).await;
        self.state.hub.shutdown().await;
    }
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within {WAIT:?}");
}
