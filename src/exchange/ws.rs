//! The exchange's WebSocket status stream.
//!
//! One connection multiplexes the status updates of every tracked swap;
//! messages are routed by id further up in the nursery. The reader thread
//! owns the socket; subscriptions are handed to it over a channel and
//! acknowledged by the server with a `subscribe` event. Lost connections are
//! retried every 15 seconds until `stop`.

use std::{
    collections::HashSet,
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use tungstenite::{stream::MaybeTlsStream, Message, WebSocket};

use super::types::{StatusUpdate, WsRequest, WsResponse};
use super::ExchangeError;
use crate::utill::{
    self, HEART_BEAT_INTERVAL, RECONNECT_INTERVAL, SUBSCRIBE_ACK_TIMEOUT,
};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Read timeout on the socket; doubles as the shutdown poll interval.
const READ_TICK: Duration = Duration::from_secs(1);

/// Handle to the status stream reader thread.
pub struct StatusStream {
    shutdown: Arc<AtomicBool>,
    subscribed: Arc<Mutex<HashSet<String>>>,
    cmd_tx: mpsc::Sender<Vec<String>>,
    ack_rx: Mutex<mpsc::Receiver<()>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StatusStream {
    /// Spawn the reader thread. Updates are pushed into `updates`; the
    /// receiver side belongs to the nursery's router.
    pub fn start(api_url: &str, updates: mpsc::Sender<StatusUpdate>) -> Arc<Self> {
        let ws_url = ws_url_from_api(api_url);
        let shutdown = Arc::new(AtomicBool::new(false));
        let subscribed: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<Vec<String>>();
        let (ack_tx, ack_rx) = mpsc::channel::<()>();

        let thread_shutdown = shutdown.clone();
        let thread_subscribed = subscribed.clone();
        let handle = thread::Builder::new()
            .name("exchange status stream".to_string())
            .spawn(move || {
                run_stream(
                    &ws_url,
                    updates,
                    cmd_rx,
                    ack_tx,
                    thread_subscribed,
                    thread_shutdown,
                );
            })
            .expect("failed to spawn status stream thread");

        Arc::new(StatusStream {
            shutdown,
            subscribed,
            cmd_tx,
            ack_rx: Mutex::new(ack_rx),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Subscribe to the update channels of the given swap ids and wait for
    /// the server's acknowledgment.
    pub fn subscribe(&self, ids: &[String]) -> Result<(), ExchangeError> {
        if ids.is_empty() {
            return Ok(());
        }
        {
            let mut subscribed = self.subscribed.lock().expect("subscription set poisoned");
            subscribed.extend(ids.iter().cloned());
        }

        let ack_rx = self.ack_rx.lock().expect("ack receiver poisoned");
        // Drop acknowledgments from earlier resubscriptions.
        while ack_rx.try_recv().is_ok() {}

        self.cmd_tx
            .send(ids.to_vec())
            .map_err(|_| ExchangeError::SubscribeTimeout)?;

        ack_rx
            .recv_timeout(SUBSCRIBE_ACK_TIMEOUT)
            .map_err(|_| ExchangeError::SubscribeTimeout)
    }

    /// Stop resubscribing to a finished swap.
    pub fn forget(&self, id: &str) {
        let mut subscribed = self.subscribed.lock().expect("subscription set poisoned");
        subscribed.remove(id);
    }

    /// Shut the stream down and join the reader thread.
    pub fn stop(&self) {
        self.shutdown.store(true, Relaxed);
        if let Some(handle) = self.handle.lock().expect("handle poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn ws_url_from_api(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/v2/ws")
}

fn run_stream(
    ws_url: &str,
    updates: mpsc::Sender<StatusUpdate>,
    cmd_rx: mpsc::Receiver<Vec<String>>,
    ack_tx: mpsc::Sender<()>,
    subscribed: Arc<Mutex<HashSet<String>>>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Relaxed) {
        match tungstenite::connect(ws_url) {
            Ok((mut socket, _)) => {
                log::info!("connected to exchange status stream at {}", ws_url);
                if let Err(e) =
                    utill::set_websocket_read_timeout(socket.get_ref(), READ_TICK)
                {
                    log::warn!("could not set read timeout on status stream: {}", e);
                }

                let resubscribe: Vec<String> = {
                    let subscribed = subscribed.lock().expect("subscription set poisoned");
                    subscribed.iter().cloned().collect()
                };
                if !resubscribe.is_empty() {
                    if let Err(e) = send_subscribe(&mut socket, &resubscribe) {
                        log::error!("resubscription failed: {}", e);
                        sleep_with_shutdown(&shutdown, RECONNECT_INTERVAL);
                        continue;
                    }
                }

                read_until_disconnect(&mut socket, &updates, &cmd_rx, &ack_tx, &shutdown);
                if shutdown.load(Relaxed) {
                    let _ = socket.close(None);
                    return;
                }
            }
            Err(e) => {
                log::error!("could not connect to exchange status stream: {}", e);
            }
        }

        log::warn!(
            "lost connection to exchange status stream, reconnecting in {:?}",
            RECONNECT_INTERVAL
        );
        sleep_with_shutdown(&shutdown, RECONNECT_INTERVAL);
    }
}

fn read_until_disconnect(
    socket: &mut Socket,
    updates: &mpsc::Sender<StatusUpdate>,
    cmd_rx: &mpsc::Receiver<Vec<String>>,
    ack_tx: &mpsc::Sender<()>,
    shutdown: &Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Relaxed) {
            return;
        }

        while let Ok(ids) = cmd_rx.try_recv() {
            if let Err(e) = send_subscribe(socket, &ids) {
                log::error!("subscription request failed: {}", e);
                return;
            }
        }

        match socket.read() {
            Ok(Message::Ping(payload)) => {
                if socket.write(Message::Pong(payload)).is_ok() {
                    socket.flush().ok();
                }
            }
            Ok(Message::Text(text)) => {
                handle_message(&text, updates, ack_tx);
            }
            Ok(Message::Close(_)) => {
                log::info!("exchange closed the status stream");
                return;
            }
            Ok(_) => {}
            Err(e) if utill::is_websocket_timeout(&e) => {}
            Err(e) => {
                log::error!("could not receive status stream message: {}", e);
                return;
            }
        }
    }
}

fn handle_message(
    text: &str,
    updates: &mpsc::Sender<StatusUpdate>,
    ack_tx: &mpsc::Sender<()>,
) {
    let response: WsResponse = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            log::error!("could not parse status stream message: {}", e);
            return;
        }
    };

    if let Some(error) = response.error {
        log::error!("exchange status stream error: {}", error);
        return;
    }

    match response.event.as_str() {
        "update" => match response.channel.as_deref() {
            Some("swap.update") => {
                let Some(args) = response.args else {
                    return;
                };
                let parsed: Vec<StatusUpdate> = match serde_json::from_value(args) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log::error!("invalid status update payload: {}", e);
                        return;
                    }
                };
                for update in parsed {
                    if updates.send(update).is_err() {
                        // Router went away; nothing left to do here.
                        return;
                    }
                }
            }
            other => {
                log::warn!("unknown update channel: {:?}", other);
            }
        },
        "subscribe" => {
            ack_tx.send(()).ok();
        }
        "pong" => {}
        other => {
            log::warn!("unknown status stream event: {}", other);
        }
    }
}

fn send_subscribe(socket: &mut Socket, ids: &[String]) -> Result<(), tungstenite::Error> {
    let request = WsRequest {
        op: "subscribe",
        channel: "swap.update",
        args: ids,
    };
    let json = serde_json::to_string(&request).expect("subscribe request serializes");
    socket.write(Message::Text(json))?;
    socket.flush()
}

fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, total: Duration) {
    let mut remaining = total;
    while !shutdown.load(Relaxed) && !remaining.is_zero() {
        let step = remaining.min(HEART_BEAT_INTERVAL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}
