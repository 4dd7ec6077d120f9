//! The swap lifecycle engine.
//!
//! The nursery owns every pending swap: it consumes the exchange status
//! stream and per-currency block streams, drives claims and refunds through
//! the transaction builder, persists each transition, and fans updates out
//! to subscribers. Submarine handlers live in [`submarine`], reverse handlers
//! in [`reverse`].

mod reverse;
mod submarine;

pub(crate) use submarine::{parse_btc_address, parse_lbtc_address};

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc, Arc, Condvar, Mutex, RwLock, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use crate::chain::{BlockEpoch, ChainBackend, Network};
use crate::database::Database;
use crate::error::Error;
use crate::exchange::types::StatusUpdate;
use crate::exchange::ws::StatusStream;
use crate::exchange::{ExchangeClient, ExchangeError};
use crate::lightning::LightningNode;
use crate::swap::{Currency, ReverseSwap, Status, Swap, SwapState, SwapUpdate};
use crate::utill::{BROADCAST_BACKOFF, HEART_BEAT_INTERVAL, RECONNECT_INTERVAL};
use crate::wallet::WalletRegistry;

/// Per-subscriber buffer size; the oldest updates are dropped on overflow.
const SUBSCRIBER_QUEUE_CAP: usize = 64;

/// Routing fee ceiling for reverse swap payments, in parts per million of
/// the invoice amount.
const ROUTING_FEE_LIMIT_PPM: u64 = 5_000;

/// Which flavor a tracked swap is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapKind {
    Submarine,
    Reverse,
}

/// Tracking state of one active swap.
#[derive(Clone)]
struct ActiveSwap {
    kind: SwapKind,
    /// Serializes block-triggered refunds against status-triggered claims.
    lock: Arc<Mutex<()>>,
}

struct SubscriberInner {
    queue: VecDeque<SwapUpdate>,
    closed: bool,
}

struct SubscriberQueue {
    inner: Mutex<SubscriberInner>,
    cond: Condvar,
}

impl SubscriberQueue {
    fn new() -> Arc<Self> {
        Arc::new(SubscriberQueue {
            inner: Mutex::new(SubscriberInner {
                queue: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        })
    }

    fn push(&self, update: SwapUpdate) {
        let mut inner = self.inner.lock().expect("subscriber queue poisoned");
        if inner.closed {
            return;
        }
        if inner.queue.len() >= SUBSCRIBER_QUEUE_CAP {
            inner.queue.pop_front();
            log::warn!("subscriber queue full, dropping oldest swap update");
        }
        inner.queue.push_back(update);
        self.cond.notify_all();
    }

    fn close(&self) {
        let mut inner = self.inner.lock().expect("subscriber queue poisoned");
        inner.closed = true;
        self.cond.notify_all();
    }
}

struct Subscriber {
    /// Swap id filter; `None` receives everything.
    id: Option<String>,
    queue: Arc<SubscriberQueue>,
}

/// A lazy stream of swap updates.
///
/// The stream closes when [`SwapUpdateStream::stop`] is called, the tracked
/// swap reaches a terminal state (scoped streams only), or the nursery shuts
/// down. Dropping the stream deregisters it.
pub struct SwapUpdateStream {
    slot: usize,
    nursery: Weak<Nursery>,
    queue: Arc<SubscriberQueue>,
}

impl SwapUpdateStream {
    /// Block until the next update. Returns `None` once the stream closed
    /// and the buffer drained.
    pub fn recv(&self) -> Option<SwapUpdate> {
        let mut inner = self.queue.inner.lock().expect("subscriber queue poisoned");
        loop {
            if let Some(update) = inner.queue.pop_front() {
                return Some(update);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .queue
                .cond
                .wait(inner)
                .expect("subscriber queue poisoned");
        }
    }

    /// Like [`SwapUpdateStream::recv`] with a timeout; `Ok(None)` means the
    /// stream closed, `Err(())` means the timeout elapsed.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<SwapUpdate>, ()> {
        let mut inner = self.queue.inner.lock().expect("subscriber queue poisoned");
        loop {
            if let Some(update) = inner.queue.pop_front() {
                return Ok(Some(update));
            }
            if inner.closed {
                return Ok(None);
            }
            let (guard, result) = self
                .queue
                .cond
                .wait_timeout(inner, timeout)
                .expect("subscriber queue poisoned");
            inner = guard;
            if result.timed_out() && inner.queue.is_empty() && !inner.closed {
                return Err(());
            }
        }
    }

    /// Close the stream and deregister it.
    pub fn stop(&self) {
        self.queue.close();
        if let Some(nursery) = self.nursery.upgrade() {
            nursery.deregister_subscriber(self.slot);
        }
    }
}

impl Drop for SwapUpdateStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Joins every thread the nursery spawned.
struct ThreadPool {
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    fn new() -> Self {
        ThreadPool {
            threads: Mutex::new(Vec::new()),
        }
    }

    fn add_thread(&self, handle: JoinHandle<()>) {
        self.threads
            .lock()
            .expect("thread pool poisoned")
            .push(handle);
    }

    fn join_all_threads(&self) {
        let mut threads = self.threads.lock().expect("thread pool poisoned");
        log::info!("joining {} nursery threads", threads.len());
        while let Some(handle) = threads.pop() {
            let name = handle
                .thread()
                .name()
                .unwrap_or("unnamed")
                .to_string();
            match handle.join() {
                Ok(()) => log::debug!("thread {} joined", name),
                Err(e) => log::error!("error joining thread {}: {:?}", name, e),
            }
        }
    }
}

/// The lifecycle engine.
pub struct Nursery {
    pub(crate) network: Network,
    pub(crate) exchange: Arc<ExchangeClient>,
    pub(crate) lightning: Arc<dyn LightningNode>,
    pub(crate) wallets: Arc<WalletRegistry>,
    pub(crate) database: Arc<Database>,
    backends: HashMap<Currency, Arc<dyn ChainBackend>>,
    status_stream: Arc<StatusStream>,
    active: RwLock<HashMap<String, ActiveSwap>>,
    subscribers: Mutex<Vec<Option<Subscriber>>>,
    free_slots: Mutex<Vec<usize>>,
    shutdown: Arc<AtomicBool>,
    threads: ThreadPool,
}

impl Nursery {
    /// Bring the engine up: recover pending swaps from the database,
    /// reconcile their status over HTTP, open the status stream, start the
    /// block listeners. Returns once recovery is complete.
    pub fn start(
        network: Network,
        exchange: Arc<ExchangeClient>,
        lightning: Arc<dyn LightningNode>,
        wallets: Arc<WalletRegistry>,
        backends: HashMap<Currency, Arc<dyn ChainBackend>>,
        database: Arc<Database>,
    ) -> Result<Arc<Self>, Error> {
        let (status_tx, status_rx) = mpsc::channel::<StatusUpdate>();
        let status_stream = StatusStream::start(exchange.api_url(), status_tx);

        let nursery = Arc::new(Nursery {
            network,
            exchange,
            lightning,
            wallets,
            database,
            backends,
            status_stream,
            active: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            free_slots: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: ThreadPool::new(),
        });

        nursery.recover_swaps()?;
        nursery.spawn_status_router(status_rx);
        nursery.spawn_block_listeners();

        Ok(nursery)
    }

    /// Load all pending swaps, re-register them and catch up on status
    /// changes that happened while the daemon was down.
    fn recover_swaps(self: &Arc<Self>) -> Result<(), Error> {
        let swaps = self.database.query_pending_swaps()?;
        let reverse_swaps = self.database.query_pending_reverse_swaps()?;
        log::info!(
            "recovering {} submarine and {} reverse swaps",
            swaps.len(),
            reverse_swaps.len()
        );

        let mut ids = Vec::new();
        for swap in &swaps {
            self.track(&swap.id, SwapKind::Submarine);
            ids.push(swap.id.clone());
        }
        for swap in &reverse_swaps {
            self.track(&swap.id, SwapKind::Reverse);
            ids.push(swap.id.clone());
        }

        for swap in &swaps {
            self.reconcile(&swap.id, &swap.status);
        }
        for swap in &reverse_swaps {
            self.reconcile(&swap.id, &swap.status);
            if !swap.external_pay && swap.routing_fee_msat.is_none() {
                self.spawn_payment(swap.clone());
            }
        }

        if let Err(e) = self.status_stream.subscribe(&ids) {
            log::warn!("initial status subscription incomplete: {}", e);
        }
        Ok(())
    }

    /// Fetch a swap's current status over HTTP and process it if it moved
    /// while we were not listening.
    fn reconcile(self: &Arc<Self>, id: &str, stored: &Status) {
        match self.exchange.swap_status(id) {
            Ok(response) => {
                if Status::parse(&response.status) != *stored {
                    log::info!("swap {} status changed to {} while offline", id, response.status);
                    self.route_status(StatusUpdate {
                        id: id.to_string(),
                        status: response.status,
                        transaction: response.transaction,
                        failure_reason: response.failure_reason,
                        zero_conf_rejected: response.zero_conf_rejected,
                    });
                } else {
                    log::debug!("swap {} status did not change", id);
                }
            }
            Err(e) => log::warn!("could not reconcile swap {}: {}", id, e),
        }
    }

    /// Begin tracking a newly created submarine swap. The caller persisted
    /// it already.
    pub fn register_swap(self: &Arc<Self>, swap: &Swap) -> Result<(), Error> {
        log::info!("listening to events of swap {}", swap.id);
        self.track(&swap.id, SwapKind::Submarine);
        if let Err(e) = self.status_stream.subscribe(&[swap.id.clone()]) {
            if !matches!(e, ExchangeError::SubscribeTimeout) {
                return Err(e.into());
            }
            log::warn!("subscription for swap {} pending reconnect", swap.id);
        }
        self.publish_swap(swap.clone());
        Ok(())
    }

    /// Begin tracking a newly created reverse swap and, unless the invoice
    /// is paid externally, start paying it.
    pub fn register_reverse_swap(self: &Arc<Self>, swap: &ReverseSwap) -> Result<(), Error> {
        log::info!("listening to events of reverse swap {}", swap.id);
        self.track(&swap.id, SwapKind::Reverse);
        if let Err(e) = self.status_stream.subscribe(&[swap.id.clone()]) {
            if !matches!(e, ExchangeError::SubscribeTimeout) {
                return Err(e.into());
            }
            log::warn!("subscription for reverse swap {} pending reconnect", swap.id);
        }
        if !swap.external_pay {
            self.pay_reverse_swap(swap)?;
        }
        self.publish_reverse(swap.clone());
        Ok(())
    }

    /// Pay a reverse swap's invoice on a dedicated thread, scoped to the
    /// swap's channel hints. The routing fee is recorded on completion.
    pub fn pay_reverse_swap(self: &Arc<Self>, swap: &ReverseSwap) -> Result<(), Error> {
        if swap.external_pay {
            return Err(Error::FailedPrecondition(
                "reverse swap is marked for external payment".to_string(),
            ));
        }
        self.spawn_payment(swap.clone());
        Ok(())
    }

    fn spawn_payment(self: &Arc<Self>, swap: ReverseSwap) {
        let nursery = self.clone();
        let handle = thread::Builder::new()
            .name(format!("payment {}", swap.id))
            .spawn(move || {
                let amount = crate::lightning::invoice::amount_sat(&swap.invoice)
                    .ok()
                    .flatten()
                    .unwrap_or(swap.onchain_amount);
                let fee_limit = (amount * ROUTING_FEE_LIMIT_PPM / 1_000_000).max(10);

                log::info!("paying invoice of reverse swap {}", swap.id);
                match nursery
                    .lightning
                    .pay_invoice(&swap.invoice, fee_limit, &swap.chan_ids)
                {
                    Ok(result) => {
                        log::info!(
                            "invoice of reverse swap {} paid, routing fee {} msat",
                            swap.id,
                            result.routing_fee_msat
                        );
                        if let Err(e) = nursery
                            .database
                            .set_reverse_swap_routing_fee(&swap.id, result.routing_fee_msat)
                        {
                            log::error!(
                                "could not persist routing fee of {}: {}",
                                swap.id,
                                e
                            );
                        }
                        nursery.publish_reverse_by_id(&swap.id);
                    }
                    Err(e) => {
                        log::error!("payment of reverse swap {} failed: {}", swap.id, e);
                        nursery.fail_reverse_swap(&swap.id, &format!("payment failed: {e}"));
                    }
                }
            })
            .expect("failed to spawn payment thread");
        self.threads.add_thread(handle);
    }

    /// Force the refund path for the given submarine swaps. With `manual`
    /// set, the timeout gate is bypassed (the transaction still carries its
    /// CLTV and will only confirm once the timeout height is reached).
    pub fn refund_swaps(self: &Arc<Self>, ids: &[String], manual: bool) -> Result<(), Error> {
        let mut failures = Vec::new();
        for id in ids {
            let swap = self
                .database
                .query_swap(id)?
                .ok_or_else(|| Error::NotFound(id.clone()))?;
            let height = self
                .backend(swap.chain_currency())?
                .block_height()
                .unwrap_or(0);
            let lock = self.lock_for(id);
            let _guard = lock.lock().expect("swap lock poisoned");
            if let Err(e) = self.try_refund(&swap, height, manual) {
                log::error!("manual refund of swap {} failed: {}", id, e);
                failures.push(format!("{id}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::FailedPrecondition(failures.join("; ")))
        }
    }

    /// Stream of updates for one swap; closes on its terminal state.
    pub fn swap_updates(self: &Arc<Self>, id: &str) -> SwapUpdateStream {
        self.add_subscriber(Some(id.to_string()))
    }

    /// Stream of updates for every swap.
    pub fn global_swap_updates(self: &Arc<Self>) -> SwapUpdateStream {
        self.add_subscriber(None)
    }

    /// Quiesce: stop all streams and listeners, close all subscribers, join
    /// all threads.
    pub fn stop(&self) {
        log::info!("stopping nursery");
        self.shutdown.store(true, Relaxed);
        self.status_stream.stop();
        self.threads.join_all_threads();

        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        for subscriber in subscribers.iter_mut() {
            if let Some(subscriber) = subscriber.take() {
                subscriber.queue.close();
            }
        }
    }

    // ---- internals shared with the handler modules ----

    pub(crate) fn backend(&self, currency: Currency) -> Result<&Arc<dyn ChainBackend>, Error> {
        self.backends
            .get(&currency)
            .ok_or_else(|| Error::FailedPrecondition(format!("no chain backend for {currency}")))
    }

    /// Raw transaction lookup, preferring the exchange and falling back to
    /// the chain backend.
    pub(crate) fn fetch_transaction_hex(
        &self,
        currency: Currency,
        txid: &str,
    ) -> Result<String, Error> {
        match self.exchange.get_transaction(currency, txid) {
            Ok(hex) => Ok(hex),
            Err(e) => {
                log::debug!(
                    "could not fetch {} from exchange ({}), trying chain backend",
                    txid,
                    e
                );
                Ok(self.backend(currency)?.transaction_hex(txid)?)
            }
        }
    }

    /// Broadcast with the standard backoff, preferring the exchange. An
    /// explicit rejection by the exchange maps to
    /// [`Error::BroadcastRejected`]; everything else is transient.
    pub(crate) fn broadcast_with_retry(
        &self,
        currency: Currency,
        hex: &str,
    ) -> Result<String, Error> {
        let mut rejected: Option<String> = None;
        let mut last_error = String::new();

        for (attempt, delay) in std::iter::once(&Duration::ZERO)
            .chain(BROADCAST_BACKOFF.iter())
            .enumerate()
        {
            if !delay.is_zero() {
                sleep_with_shutdown(&self.shutdown, *delay);
            }
            if self.shutdown.load(Relaxed) {
                break;
            }

            match self.exchange.broadcast_transaction(currency, hex) {
                Ok(txid) => return Ok(txid),
                Err(ExchangeError::Api { status, message }) if (400..500).contains(&status) => {
                    log::warn!("exchange rejected broadcast: {}", message);
                    rejected = Some(message);
                }
                Err(e) => {
                    log::warn!("broadcast attempt {} via exchange failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }

            match self
                .backend(currency)
                .and_then(|backend| backend.broadcast_transaction(hex).map_err(Error::from))
            {
                Ok(txid) => return Ok(txid),
                Err(e) => {
                    log::warn!(
                        "broadcast attempt {} via chain backend failed: {}",
                        attempt,
                        e
                    );
                    last_error = e.to_string();
                }
            }
        }

        match rejected {
            Some(message) => Err(Error::BroadcastRejected(message)),
            None => Err(Error::TransientNetwork(format!(
                "broadcast failed after retries: {last_error}"
            ))),
        }
    }

    pub(crate) fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let active = self.active.read().expect("registry poisoned");
        if let Some(swap) = active.get(id) {
            return swap.lock.clone();
        }
        drop(active);
        // Unknown to the registry (e.g. manual refund after restart); track
        // it on the fly.
        let mut active = self.active.write().expect("registry poisoned");
        active
            .entry(id.to_string())
            .or_insert_with(|| ActiveSwap {
                kind: SwapKind::Submarine,
                lock: Arc::new(Mutex::new(())),
            })
            .lock
            .clone()
    }

    fn track(&self, id: &str, kind: SwapKind) {
        let mut active = self.active.write().expect("registry poisoned");
        active.insert(
            id.to_string(),
            ActiveSwap {
                kind,
                lock: Arc::new(Mutex::new(())),
            },
        );
    }

    /// Stop tracking a swap that reached a terminal state.
    pub(crate) fn untrack(&self, id: &str) {
        let mut active = self.active.write().expect("registry poisoned");
        active.remove(id);
        drop(active);
        self.status_stream.forget(id);
        self.close_scoped_subscribers(id);
    }

    fn spawn_status_router(self: &Arc<Self>, status_rx: mpsc::Receiver<StatusUpdate>) {
        let nursery = self.clone();
        let handle = thread::Builder::new()
            .name("status router".to_string())
            .spawn(move || {
                while !nursery.shutdown.load(Relaxed) {
                    match status_rx.recv_timeout(HEART_BEAT_INTERVAL) {
                        Ok(update) => nursery.route_status(update),
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn status router thread");
        self.threads.add_thread(handle);
    }

    fn route_status(self: &Arc<Self>, update: StatusUpdate) {
        let entry = {
            let active = self.active.read().expect("registry poisoned");
            active.get(&update.id).cloned()
        };
        let Some(entry) = entry else {
            log::debug!("status update for untracked swap {}", update.id);
            return;
        };

        log::info!("swap {} status update: {}", update.id, update.status);
        let _guard = entry.lock.lock().expect("swap lock poisoned");
        match entry.kind {
            SwapKind::Submarine => self.handle_swap_status(&update),
            SwapKind::Reverse => self.handle_reverse_status(&update),
        }
    }

    fn spawn_block_listeners(self: &Arc<Self>) {
        let (epoch_tx, epoch_rx) = mpsc::channel::<BlockEpoch>();

        for (currency, backend) in &self.backends {
            let currency = *currency;
            let backend = backend.clone();
            let epoch_tx = epoch_tx.clone();
            let shutdown = self.shutdown.clone();
            let handle = thread::Builder::new()
                .name(format!("block listener {currency}"))
                .spawn(move || {
                    while !shutdown.load(Relaxed) {
                        match backend.register_block_listener(epoch_tx.clone(), shutdown.clone())
                        {
                            Ok(()) => {
                                // Listener observed the stop flag.
                                return;
                            }
                            Err(e) => {
                                log::error!("block stream for {} failed: {}", currency, e);
                            }
                        }
                        sleep_with_shutdown(&shutdown, RECONNECT_INTERVAL);
                    }
                })
                .expect("failed to spawn block listener thread");
            self.threads.add_thread(handle);
        }

        let nursery = self.clone();
        let handle = thread::Builder::new()
            .name("block consumer".to_string())
            .spawn(move || {
                while !nursery.shutdown.load(Relaxed) {
                    match epoch_rx.recv_timeout(HEART_BEAT_INTERVAL) {
                        Ok(epoch) => nursery.handle_block(epoch),
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn block consumer thread");
        self.threads.add_thread(handle);
    }

    /// A new block on one of the chains: run due refunds and re-try stuck
    /// claims.
    fn handle_block(self: &Arc<Self>, epoch: BlockEpoch) {
        log::debug!("new {} block at height {}", epoch.currency, epoch.height);

        match self.database.query_refundable_swaps(epoch.height) {
            Ok(swaps) => {
                let due: Vec<_> = swaps
                    .into_iter()
                    .filter(|swap| swap.chain_currency() == epoch.currency)
                    .collect();
                if !due.is_empty() {
                    log::info!(
                        "found {} swaps to refund at height {}",
                        due.len(),
                        epoch.height
                    );
                }
                for swap in due {
                    let lock = self.lock_for(&swap.id);
                    let _guard = lock.lock().expect("swap lock poisoned");
                    if let Err(e) = self.try_refund(&swap, epoch.height, false) {
                        log::error!(
                            "refund of swap {} failed, retrying next block: {}",
                            swap.id,
                            e
                        );
                    }
                }
            }
            Err(e) => log::error!("could not query refundable swaps: {}", e),
        }

        self.retry_pending_claims(epoch.currency);
    }

    /// Re-drive reverse swaps that still owe a claim broadcast or, for
    /// already settled invoices, the claim-then-settle completion.
    fn retry_pending_claims(self: &Arc<Self>, currency: Currency) {
        let pending = match self.database.query_pending_reverse_swaps() {
            Ok(pending) => pending,
            Err(e) => {
                log::error!("could not query pending reverse swaps: {}", e);
                return;
            }
        };
        for swap in pending {
            if swap.chain_currency() != currency {
                continue;
            }
            let settle_due = matches!(swap.status, Status::InvoiceSettled);
            let claim_due = swap.claim_transaction_id.is_none()
                && (matches!(swap.status, Status::TransactionConfirmed)
                    || (swap.accept_zero_conf
                        && matches!(swap.status, Status::TransactionMempool)));
            if !settle_due && !claim_due {
                continue;
            }
            let lock = self.lock_for(&swap.id);
            let _guard = lock.lock().expect("swap lock poisoned");
            let result = if settle_due {
                self.settle_reverse_swap(&swap)
            } else {
                self.try_claim(&swap, None)
            };
            match result {
                Ok(()) if settle_due => self.publish_reverse_by_id(&swap.id),
                Ok(()) => {}
                Err(e) => {
                    log::error!(
                        "retrying reverse swap {} failed, next block re-evaluates: {}",
                        swap.id,
                        e
                    );
                }
            }
        }
    }

    // ---- subscriber fan-out ----

    fn add_subscriber(self: &Arc<Self>, id: Option<String>) -> SwapUpdateStream {
        let queue = SubscriberQueue::new();
        let subscriber = Subscriber {
            id,
            queue: queue.clone(),
        };

        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        let slot = match self.free_slots.lock().expect("free slots poisoned").pop() {
            Some(slot) => {
                subscribers[slot] = Some(subscriber);
                slot
            }
            None => {
                subscribers.push(Some(subscriber));
                subscribers.len() - 1
            }
        };

        SwapUpdateStream {
            slot,
            nursery: Arc::downgrade(self),
            queue,
        }
    }

    fn deregister_subscriber(&self, slot: usize) {
        let mut subscribers = self.subscribers.lock().expect("subscribers poisoned");
        if let Some(entry) = subscribers.get_mut(slot) {
            if entry.take().is_some() {
                self.free_slots
                    .lock()
                    .expect("free slots poisoned")
                    .push(slot);
            }
        }
    }

    fn close_scoped_subscribers(&self, id: &str) {
        let subscribers = self.subscribers.lock().expect("subscribers poisoned");
        for subscriber in subscribers.iter().flatten() {
            if subscriber.id.as_deref() == Some(id) {
                subscriber.queue.close();
            }
        }
    }

    /// Publish an update to every matching subscriber. Updates are published
    /// only after the corresponding database write.
    fn publish(&self, update: SwapUpdate) {
        let subscribers = self.subscribers.lock().expect("subscribers poisoned");
        for subscriber in subscribers.iter().flatten() {
            let matches = match &subscriber.id {
                Some(id) => id == update.id(),
                None => true,
            };
            if matches {
                subscriber.queue.push(update.clone());
            }
        }
    }

    pub(crate) fn publish_swap(&self, swap: Swap) {
        let terminal = swap.state.is_terminal();
        let id = swap.id.clone();
        self.publish(SwapUpdate::from_swap(swap));
        if terminal {
            self.untrack(&id);
        }
    }

    pub(crate) fn publish_reverse(&self, swap: ReverseSwap) {
        let terminal = swap.state.is_terminal();
        let id = swap.id.clone();
        self.publish(SwapUpdate::from_reverse(swap));
        if terminal {
            self.untrack(&id);
        }
    }

    pub(crate) fn publish_swap_by_id(&self, id: &str) {
        match self.database.query_swap(id) {
            Ok(Some(swap)) => self.publish_swap(swap),
            Ok(None) => log::warn!("cannot publish unknown swap {}", id),
            Err(e) => log::error!("cannot publish swap {}: {}", id, e),
        }
    }

    pub(crate) fn publish_reverse_by_id(&self, id: &str) {
        match self.database.query_reverse_swap(id) {
            Ok(Some(swap)) => self.publish_reverse(swap),
            Ok(None) => log::warn!("cannot publish unknown reverse swap {}", id),
            Err(e) => log::error!("cannot publish reverse swap {}: {}", id, e),
        }
    }

    /// Mark a reverse swap failed unless it already reached a terminal
    /// state.
    pub(crate) fn fail_reverse_swap(&self, id: &str, reason: &str) {
        match self.database.query_reverse_swap(id) {
            Ok(Some(swap)) if !swap.state.is_terminal() => {
                if let Err(e) =
                    self.database
                        .set_reverse_swap_state(id, SwapState::Error, Some(reason))
                {
                    log::error!("could not mark reverse swap {} failed: {}", id, e);
                    return;
                }
                self.publish_reverse_by_id(id);
            }
            Ok(_) => {}
            Err(e) => log::error!("could not load reverse swap {}: {}", id, e),
        }
    }
}

pub(crate) fn sleep_with_shutdown(shutdown: &Arc<AtomicBool>, total: Duration) {
    let mut remaining = total;
    while !shutdown.load(Relaxed) && !remaining.is_zero() {
        let step = remaining.min(HEART_BEAT_INTERVAL);
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_queue_drops_oldest_on_overflow() {
        let queue = SubscriberQueue::new();
        for i in 0..(SUBSCRIBER_QUEUE_CAP + 3) {
            let mut swap = crate::database::tests_support::minimal_swap(&format!("s{i}"));
            swap.expected_amount = i as u64;
            queue.push(SwapUpdate::from_swap(swap));
        }
        let inner = queue.inner.lock().unwrap();
        assert_eq!(inner.queue.len(), SUBSCRIBER_QUEUE_CAP);
        // The oldest three were dropped, the newest survives.
        assert_eq!(
            inner.queue.back().unwrap().swap.as_ref().unwrap().expected_amount,
            (SUBSCRIBER_QUEUE_CAP + 2) as u64
        );
        assert_eq!(
            inner.queue.front().unwrap().swap.as_ref().unwrap().expected_amount,
            3
        );
    }

    #[test]
    fn test_subscriber_queue_close_wakes_receiver() {
        let queue = SubscriberQueue::new();
        queue.push(SwapUpdate::from_swap(
            crate::database::tests_support::minimal_swap("s1"),
        ));
        queue.close();
        let inner = queue.inner.lock().unwrap();
        assert!(inner.closed);
        assert_eq!(inner.queue.len(), 1);
    }
}
