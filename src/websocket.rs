/// WebSocket transport for the sync hub
///
/// Each WebSocket connection is one `SessionSocket` actor attached to the
/// shared `SyncHub`. Text frames are decoded as `SyncMessage`s and routed by
/// the hub; messages the hub relays to this connection arrive as `Outbound`
/// actor messages and are written back as text frames.
use actix::prelude::*;
use actix_web::web;
use actix_web_actors::ws;
use std::time::{Duration, Instant};

use crate::hub::{ConnectionId, PeerSink, SyncHub};
use crate::messages::SyncMessage;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Message relayed by the hub to this connection
#[derive(Message)]
#[rtype(result = "()")]
pub struct Outbound(pub SyncMessage);

impl PeerSink for Addr<SessionSocket> {
    fn deliver(&self, message: &SyncMessage) -> bool {
        if !self.connected() {
            return false;
        }
        self.do_send(Outbound(message.clone()));
        true
    }
}

/// WebSocket connection actor
pub struct SessionSocket {
    hb: Instant,
    hub: web::Data<SyncHub>,
    connection_id: Option<ConnectionId>,
}

impl SessionSocket {
    pub fn new(hub: web::Data<SyncHub>) -> Self {
        Self {
            hb: Instant::now(),
            hub,
            connection_id: None,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                log::warn!(
                    "WebSocket connection {:?} heartbeat failed, disconnecting",
                    act.connection_id
                );
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn send_message(&self, message: &SyncMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match message.to_json() {
            Ok(text) => ctx.text(text),
            Err(e) => log::error!("Dropping outbound {}: {}", message.kind(), e),
        }
    }
}

impl Actor for SessionSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
        self.connection_id = Some(self.hub.attach(ctx.address()));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(connection_id) = self.connection_id.take() {
            self.hub.detach(connection_id);
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => match SyncMessage::from_json(&text) {
                Ok(message) => {
                    if let Some(connection_id) = self.connection_id {
                        self.hub.route(connection_id, message);
                    }
                }
                Err(e) => {
                    let reply = SyncMessage::Error {
                        message: format!("Invalid message format: {}", e),
                    };
                    self.send_message(&reply, ctx);
                }
            },
            Ok(ws::Message::Binary(_)) => {
                log::debug!("Unexpected binary message");
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}

impl Handler<Outbound> for SessionSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.send_message(&msg.0, ctx);
    }
}
