use crate::error::AppError;
use crate::hub::{ChannelId, ClientSocket, CloseFrame, Scope, SocketError};
use crate::metrics;
use crate::state::AppState;
use actix_web::http::header::AUTHORIZATION;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_ws::{CloseCode, CloseReason, Message, MessageStream, Session};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// actix-ws session plus its inbound stream
pub struct ActixSocket {
    session: Session,
    stream: MessageStream,
}

impl ActixSocket {
    pub fn new(session: Session, stream: MessageStream) -> Self {
        Self { session, stream }
    }
}

#[async_trait(?Send)]
impl ClientSocket for ActixSocket {
    async fn recv(&mut self) -> Option<Result<String, SocketError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(SocketError::Protocol(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(text.to_string())),
                Message::Ping(bytes) => {
                    if self.session.pong(&bytes).await.is_err() {
                        return None;
                    }
                }
                Message::Pong(_) | Message::Nop => {}
                Message::Close(reason) => {
                    debug!(?reason, "client closed websocket");
                    return None;
                }
                Message::Binary(_) => return Some(Err(SocketError::UnsupportedFrame("binary"))),
                Message::Continuation(_) => {
                    return Some(Err(SocketError::UnsupportedFrame("continuation")))
                }
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), SocketError> {
        self.session.text(frame).await.map_err(|_| SocketError::Closed)
    }

    async fn ping(&mut self) -> Result<(), SocketError> {
        self.session.ping(b"").await.map_err(|_| SocketError::Closed)
    }

    async fn close(&mut self, frame: CloseFrame) {
        let reason = CloseReason {
            code: CloseCode::from(frame.code),
            description: (!frame.reason.is_empty()).then_some(frame.reason),
        };
        // close consumes the session; the clone shares the same sink
        let _ = self.session.clone().close(Some(reason)).await;
    }
}

/// `GET /ws/{scope}/{entity_id}`
pub async fn channel_ws(
    req: HttpRequest,
    body: web::Payload,
    path: web::Path<(String, String)>,
    query: web::Query<WsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let (scope, entity_id) = path.into_inner();
    let scope: Scope = scope.parse().map_err(AppError::from)?;
    let channel = ChannelId::new(scope, entity_id).map_err(AppError::from)?;
    upgrade(req, body, channel, query.into_inner(), state).await
}

/// `GET /ws/campaign/{campaign_id}`, the run channel of a campaign
pub async fn campaign_ws(
    req: HttpRequest,
    body: web::Payload,
    path: web::Path<String>,
    query: web::Query<WsQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    let channel = ChannelId::run(path.into_inner()).map_err(AppError::from)?;
    upgrade(req, body, channel, query.into_inner(), state).await
}

async fn upgrade(
    req: HttpRequest,
    body: web::Payload,
    channel: ChannelId,
    query: WsQuery,
    state: web::Data<AppState>,
) -> Result<HttpResponse, Error> {
    if !authorized(&req, &query, state.config.ws_api_key()) {
        metrics::REJECTED_CONNECTIONS_TOTAL
            .with_label_values(&[metrics::REASON_UNAUTHORIZED])
            .inc();
        warn!(channel = %channel, "unauthorized websocket connection");

        // accept, then close with a policy violation so browsers see the reason
        let (response, session, stream) = actix_ws::handle(&req, body)?;
        let mut socket = ActixSocket::new(session, stream);
        actix_rt::spawn(async move {
            socket.close(CloseFrame::unauthorized()).await;
        });
        return Ok(response);
    }

    let admission = state.hub.admit(&channel).await.map_err(AppError::from)?;

    let (response, session, stream) = match actix_ws::handle(&req, body) {
        Ok(parts) => parts,
        Err(e) => {
            state.hub.release(admission).await;
            return Err(e);
        }
    };

    let hub = state.hub.clone();
    actix_rt::spawn(async move {
        hub.serve(admission, ActixSocket::new(session, stream)).await;
    });

    Ok(response)
}

fn presented_token<'a>(req: &'a HttpRequest, query: &'a WsQuery) -> Option<&'a str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .or(query.token.as_deref())
}

fn authorized(req: &HttpRequest, query: &WsQuery, expected: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(key) => presented_token(req, query) == Some(key),
    }
}
