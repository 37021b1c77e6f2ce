//! In-process Bayeux server for integration tests.
//!
//! `FakeServer` implements `Transport`, so connectors and listeners talk to it
//! directly. Published events are retained with increasing replay ids and
//! replayed to subscribers according to the cursor in their subscribe request.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};

use eventlink::{Advice, AuthError, Credential, LoginClient, Message, MetaChannel, Reconnect, Transport, TransportError};

/// How long a connect request is held open when nothing is pending.
const POLL_HOLD: Duration = Duration::from_millis(25);

#[derive(Default)]
struct ServerState {
    handshakes: usize,
    client_id: Option<String>,
    subscriptions: HashMap<String, i64>,
    retained: Vec<(String, i64, Value)>,
    next_replay_id: i64,
    requests: Vec<Message>,
    fail_connect: bool,
    advise_handshake: bool,
    handshake_delay: Option<Duration>,
    subscribe_delay: Option<Duration>,
    rejected_channels: HashSet<String>,
}

pub struct FakeServer {
    state: Mutex<ServerState>,
    pending_tx: Sender<Message>,
    pending_rx: Receiver<Message>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        let (pending_tx, pending_rx) = unbounded();
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
            pending_tx,
            pending_rx,
        })
    }

    /// Retain an event on `channel` and push it to a current subscriber.
    /// Returns the assigned replay id.
    pub fn publish(&self, channel: &str, sobject: Value) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_replay_id += 1;
        let replay_id = state.next_replay_id;
        state.retained.push((channel.to_string(), replay_id, sobject.clone()));
        if state.subscriptions.contains_key(channel) {
            let _ = self.pending_tx.send(data_message(channel, replay_id, &sobject));
        }
        replay_id
    }

    /// Fail every following connect with a transport error.
    pub fn set_fail_connect(&self, fail: bool) {
        self.state.lock().unwrap().fail_connect = fail;
    }

    /// Answer the next connect with `reconnect: handshake` advice.
    pub fn advise_handshake(&self) {
        self.state.lock().unwrap().advise_handshake = true;
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        self.state.lock().unwrap().handshake_delay = Some(delay);
    }

    /// Hold every following subscribe reply for `delay`.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.state.lock().unwrap().subscribe_delay = Some(delay);
    }

    pub fn reject_channel(&self, channel: &str) {
        self.state.lock().unwrap().rejected_channels.insert(channel.to_string());
    }

    pub fn handshakes(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.state.lock().unwrap().subscriptions.contains_key(channel)
    }

    /// Every request received on `meta`, in arrival order.
    pub fn requests_on(&self, meta: MetaChannel) -> Vec<Message> {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|m| m.meta_channel() == Some(meta))
            .cloned()
            .collect()
    }

    /// Cursors sent in subscribe requests for `channel`, in arrival order.
    pub fn subscribe_cursors(&self, channel: &str) -> Vec<i64> {
        self.requests_on(MetaChannel::Subscribe)
            .iter()
            .filter_map(|m| m.replay_cursor(channel))
            .collect()
    }

    fn handle(&self, request: &Message, replies: &mut Vec<Message>) -> Result<(), TransportError> {
        let meta = request.meta_channel();
        let mut reply = Message {
            id: request.id.clone(),
            channel: request.channel.clone(),
            successful: Some(true),
            ..Message::default()
        };

        match meta {
            Some(MetaChannel::Handshake) => {
                let delay = {
                    let mut state = self.state.lock().unwrap();
                    state.handshakes += 1;
                    let client_id = format!("client-{}", state.handshakes);
                    state.client_id = Some(client_id.clone());
                    state.subscriptions.clear();
                    reply.client_id = Some(client_id);
                    state.handshake_delay
                };
                self.pending_rx.try_iter().for_each(drop);
                if let Some(delay) = delay {
                    thread::sleep(delay);
                }
            }
            Some(MetaChannel::Subscribe) => {
                let delay = self.state.lock().unwrap().subscribe_delay;
                if let Some(delay) = delay {
                    thread::sleep(delay);
                }
                let mut state = self.state.lock().unwrap();
                reply.subscription = request.subscription.clone();
                for channel in request.subscriptions() {
                    if state.rejected_channels.contains(channel) {
                        reply.successful = Some(false);
                        reply.error = Some(format!("403::Forbidden {channel}"));
                        continue;
                    }
                    let cursor = request.replay_cursor(channel).unwrap_or(-1);
                    state.subscriptions.insert(channel.to_string(), cursor);
                    for (retained_channel, replay_id, sobject) in &state.retained {
                        let replayed = match cursor {
                            -2 => true,
                            -1 => false,
                            after => *replay_id > after,
                        };
                        if replayed && retained_channel == channel {
                            let _ = self.pending_tx.send(data_message(channel, *replay_id, sobject));
                        }
                    }
                }
            }
            Some(MetaChannel::Unsubscribe) => {
                let mut state = self.state.lock().unwrap();
                reply.subscription = request.subscription.clone();
                for channel in request.subscriptions() {
                    state.subscriptions.remove(channel);
                }
            }
            Some(MetaChannel::Disconnect) => {
                let mut state = self.state.lock().unwrap();
                state.client_id = None;
                state.subscriptions.clear();
            }
            Some(MetaChannel::Connect) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if state.fail_connect {
                        return Err(TransportError::ConnectionFailed {
                            message: "connection reset by peer".to_string(),
                        });
                    }
                    if state.advise_handshake {
                        state.advise_handshake = false;
                        state.client_id = None;
                        reply.successful = Some(false);
                        reply.error = Some("403::Unknown client".to_string());
                        reply.advice = Some(Advice {
                            reconnect: Some(Reconnect::Handshake),
                            ..Advice::default()
                        });
                        replies.push(reply);
                        return Ok(());
                    }
                }

                if let Ok(first) = self.pending_rx.recv_timeout(POLL_HOLD) {
                    let subscribed: HashSet<String> =
                        self.state.lock().unwrap().subscriptions.keys().cloned().collect();
                    for message in std::iter::once(first).chain(self.pending_rx.try_iter()) {
                        if subscribed.contains(&message.channel) {
                            replies.push(message);
                        }
                    }
                }
                reply.advice = Some(Advice {
                    reconnect: Some(Reconnect::Retry),
                    interval: Some(0),
                    timeout: Some(POLL_HOLD.as_millis() as u64),
                });
            }
            None => {
                reply.successful = Some(false);
                reply.error = Some(format!("400::Unexpected channel {}", request.channel));
            }
        }

        replies.push(reply);
        Ok(())
    }
}

impl Transport for FakeServer {
    fn exchange(&self, _credential: &Credential, messages: &[Message]) -> Result<Vec<Message>, TransportError> {
        self.state.lock().unwrap().requests.extend(messages.iter().cloned());
        let mut replies = Vec::new();
        for request in messages {
            self.handle(request, &mut replies)?;
        }
        Ok(replies)
    }
}

fn data_message(channel: &str, replay_id: i64, sobject: &Value) -> Message {
    Message {
        channel: channel.to_string(),
        data: Some(json!({
            "event": {"replayId": replay_id, "type": "updated"},
            "sobject": sobject,
        })),
        ..Message::default()
    }
}

/// Login that accepts password "secret".
pub fn login() -> Arc<dyn LoginClient> {
    Arc::new(|user: &str, password: &str| {
        if password == "secret" {
            Ok(Credential::new("00Dxx!token", "https://example.my.salesforce.com"))
        } else {
            Err(AuthError::Rejected {
                message: format!("INVALID_LOGIN: Invalid username, password, security token; or user locked out ({user})"),
            })
        }
    })
}

pub fn credential() -> Credential {
    Credential::new("00Dxx!token", "https://example.my.salesforce.com")
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
