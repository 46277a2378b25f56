use crate::middleware::guards::User;
use crate::services::{MessagingCore, Subscription};
use crate::state::AppState;
use crate::websocket::message_types::{WsInboundEvent, WsOutboundEvent};
use crate::websocket::SubscriptionToken;
use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub conversation_id: Uuid,
}

// Event produced outside the actor, e.g. by a spawned ack
#[derive(ActixMessage)]
#[rtype(result = "()")]
struct Outbound(WsOutboundEvent);

// WebSocket Actor
struct WsSession {
    core: MessagingCore,
    user_id: Uuid,
    conversation_id: Uuid,
    token: SubscriptionToken,
    hb: Instant,
    /// Set when the client closed the socket itself
    clean_close: bool,
    backlog: Option<WsOutboundEvent>,
    pending: Option<UnboundedReceiverStream<WsOutboundEvent>>,
}

impl WsSession {
    fn new(core: MessagingCore, user_id: Uuid, subscription: Subscription) -> Self {
        let backlog = WsOutboundEvent::Backlog {
            conversation_id: subscription.conversation_id,
            latest_seq: subscription.latest_seq,
            last_read_seq: subscription.last_read_seq,
            notifications: subscription.backlog,
        };
        Self {
            core,
            user_id,
            conversation_id: subscription.conversation_id,
            token: subscription.token,
            hb: Instant::now(),
            clean_close: false,
            backlog: Some(backlog),
            pending: Some(UnboundedReceiverStream::new(subscription.receiver)),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(
                    user_id = %act.user_id,
                    conversation_id = %act.conversation_id,
                    "WebSocket heartbeat failed, disconnecting"
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Refresh the connection and its subscription; stops the session when
    /// the registry already dropped it.
    fn touch(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.hb = Instant::now();
        if !self.core.heartbeat(self.token) {
            tracing::info!(token = %self.token, "subscription expired, closing socket");
            ctx.stop();
        }
    }

    fn send_event(&self, event: &WsOutboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(event) {
            Ok(text) => ctx.text(text),
            Err(e) => tracing::error!(error = %e, "failed to serialize outbound event"),
        }
    }

    fn handle_inbound(&mut self, evt: WsInboundEvent, ctx: &mut ws::WebsocketContext<Self>) {
        let core = self.core.clone();
        let user_id = self.user_id;
        let conversation_id = self.conversation_id;
        let addr = ctx.address();

        match evt {
            WsInboundEvent::Heartbeat => {}
            WsInboundEvent::Ack { message_ids } => {
                actix::spawn(async move {
                    if let Err(e) = core
                        .ack_delivered(user_id, conversation_id, &message_ids)
                        .await
                    {
                        tracing::error!(error = %e, %user_id, "failed to record delivery ack");
                        addr.do_send(Outbound(error_event(&e)));
                    }
                });
            }
            WsInboundEvent::AckRead { up_to_seq } => {
                actix::spawn(async move {
                    if let Err(e) = core.ack_read(user_id, conversation_id, up_to_seq).await {
                        tracing::error!(error = %e, %user_id, "failed to record read ack");
                        addr.do_send(Outbound(error_event(&e)));
                    }
                });
            }
        }
    }
}

fn error_event(err: &crate::error::AppError) -> WsOutboundEvent {
    let (_, body) = crate::middleware::error_handling::map_error(err);
    WsOutboundEvent::Error {
        code: body.code,
        message: body.message,
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            token = %self.token,
            "WebSocket session started"
        );

        self.hb(ctx);

        if let Some(backlog) = self.backlog.take() {
            self.send_event(&backlog, ctx);
        }
        if let Some(pending) = self.pending.take() {
            ctx.add_stream(pending);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if !self.clean_close {
            // Transient drop: the subscription lives until its TTL runs out or
            // the user subscribes again.
            tracing::info!(
                user_id = %self.user_id,
                conversation_id = %self.conversation_id,
                "WebSocket session lost, subscription left to expire"
            );
            return;
        }

        tracing::info!(
            user_id = %self.user_id,
            conversation_id = %self.conversation_id,
            "WebSocket session closed"
        );
        let core = self.core.clone();
        let token = self.token;
        actix::spawn(async move {
            if let Err(e) = core.unsubscribe(token).await {
                tracing::error!(error = %e, %token, "failed to unsubscribe closed session");
            }
        });
    }
}

impl Handler<Outbound> for WsSession {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.send_event(&msg.0, ctx);
    }
}

// Pushes from the subscription registry
impl StreamHandler<WsOutboundEvent> for WsSession {
    fn handle(&mut self, event: WsOutboundEvent, ctx: &mut Self::Context) {
        self.send_event(&event, ctx);
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        tracing::info!(token = %self.token, "subscription ended by registry");
        ctx.stop();
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.touch(ctx);
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.touch(ctx);
            }
            Ok(ws::Message::Text(text)) => {
                self.touch(ctx);
                match serde_json::from_str::<WsInboundEvent>(&text) {
                    Ok(evt) => self.handle_inbound(evt, ctx),
                    Err(e) => {
                        tracing::warn!("Failed to parse WS message: {:?}", e);
                        self.send_event(
                            &WsOutboundEvent::Error {
                                code: error_types::error_codes::INVALID_REQUEST.to_string(),
                                message: format!("unrecognized event: {e}"),
                            },
                            ctx,
                        );
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!("Binary WebSocket messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!("WebSocket close message received: {:?}", reason);
                self.clean_close = true;
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// GET /ws?conversation_id=
/// Subscribe to live delivery for one conversation
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    user: User,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let subscription = state.core.subscribe(user.id, query.conversation_id).await?;
    let token = subscription.token;
    let session = WsSession::new(state.core.clone(), user.id, subscription);

    match ws::start(session, &req, stream) {
        Ok(resp) => Ok(resp),
        Err(e) => {
            // Handshake failed: nothing was pushed yet worth keeping.
            if let Err(err) = state.core.unsubscribe(token).await {
                tracing::error!(error = %err, %token, "failed to drop subscription after handshake error");
            }
            Err(e)
        }
    }
}
