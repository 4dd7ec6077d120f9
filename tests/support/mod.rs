//! Shared test doubles: an HTTP mock of the exchange API, scriptable chain
//! backends, and stub Lightning/wallet implementations.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        mpsc, Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

use lnswap::chain::{BlockEpoch, ChainBackend, ChainError};
use lnswap::lightning::{
    ChannelInfo, CreatedInvoice, InvoiceState, LightningError, LightningNode, NodeInfo,
    PaymentResult,
};
use lnswap::swap::tree::{SwapTree, TreeKind};
use lnswap::swap::{Currency, Pair, ReverseSwap, Status, Swap, SwapState};
use lnswap::utill;
use lnswap::wallet::{OnchainWallet, WalletError};

pub type Handler = Arc<dyn Fn(&str) -> (u16, String) + Send + Sync>;

/// Minimal HTTP server standing in for the exchange REST API.
pub struct MockApi {
    url: String,
    routes: Arc<Mutex<HashMap<(String, String), Handler>>>,
    pub requests: Arc<Mutex<Vec<(String, String, String)>>>,
    shutdown: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MockApi {
    pub fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock api");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let port = listener.local_addr().expect("local addr").port();

        let routes: Arc<Mutex<HashMap<(String, String), Handler>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_routes = routes.clone();
        let thread_requests = requests.clone();
        let thread_shutdown = shutdown.clone();
        let handle = thread::spawn(move || {
            while !thread_shutdown.load(Relaxed) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        handle_connection(stream, &thread_routes, &thread_requests);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(20));
                    }
                    Err(_) => break,
                }
            }
        });

        Arc::new(MockApi {
            url: format!("http://127.0.0.1:{port}"),
            routes,
            requests,
            shutdown,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn route(
        &self,
        method: &str,
        path: &str,
        handler: impl Fn(&str) -> (u16, String) + Send + Sync + 'static,
    ) {
        self.routes.lock().unwrap().insert(
            (method.to_string(), path.to_string()),
            Arc::new(handler),
        );
    }

    pub fn route_json(&self, method: &str, path: &str, body: &str) {
        let body = body.to_string();
        self.route(method, path, move |_| (200, body.clone()));
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.shutdown.store(true, Relaxed);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    mut stream: TcpStream,
    routes: &Arc<Mutex<HashMap<(String, String), Handler>>>,
    requests: &Arc<Mutex<Vec<(String, String, String)>>>,
) {
    stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .ok();

    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if let Some(pos) = find_header_end(&buffer) {
                    break pos;
                }
                if buffer.len() > 64 * 1024 {
                    return;
                }
            }
            Err(_) => return,
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = headers.lines();
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts
        .next()
        .unwrap_or_default()
        .split('?')
        .next()
        .unwrap_or_default()
        .to_string();

    let content_length = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .next()
        .unwrap_or(0);

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => body.extend_from_slice(&chunk[..n]),
            Err(_) => break,
        }
    }
    let body = String::from_utf8_lossy(&body).to_string();

    requests
        .lock()
        .unwrap()
        .push((method.clone(), path.clone(), body.clone()));

    let handler = routes.lock().unwrap().get(&(method, path)).cloned();
    let (code, response_body) = match handler {
        Some(handler) => handler(&body),
        None => (404, r#"{"error":"not found"}"#.to_string()),
    };

    let reason = if code == 200 { "OK" } else { "Error" };
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    stream.write_all(response.as_bytes()).ok();
    stream.flush().ok();
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Chain backend with scriptable blocks and canned transactions.
pub struct MockChainBackend {
    currency: Currency,
    pub fee_rate: f64,
    pub transactions: Mutex<HashMap<String, String>>,
    pub broadcasts: Mutex<Vec<String>>,
    heights: Mutex<mpsc::Receiver<u32>>,
    tip: Mutex<u32>,
}

impl MockChainBackend {
    pub fn new(currency: Currency, fee_rate: f64) -> (Arc<Self>, mpsc::Sender<u32>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(MockChainBackend {
                currency,
                fee_rate,
                transactions: Mutex::new(HashMap::new()),
                broadcasts: Mutex::new(Vec::new()),
                heights: Mutex::new(rx),
                tip: Mutex::new(0),
            }),
            tx,
        )
    }

    pub fn add_transaction(&self, txid: &str, hex: &str) {
        self.transactions
            .lock()
            .unwrap()
            .insert(txid.to_string(), hex.to_string());
    }
}

impl ChainBackend for MockChainBackend {
    fn estimate_fee(&self) -> Result<f64, ChainError> {
        Ok(self.fee_rate)
    }

    fn block_height(&self) -> Result<u32, ChainError> {
        Ok(*self.tip.lock().unwrap())
    }

    fn transaction_hex(&self, txid: &str) -> Result<String, ChainError> {
        self.transactions
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| ChainError::MissingData(format!("no transaction {txid}")))
    }

    fn broadcast_transaction(&self, hex: &str) -> Result<String, ChainError> {
        self.broadcasts.lock().unwrap().push(hex.to_string());
        Ok(txid_of(hex))
    }

    fn register_block_listener(
        &self,
        epochs: mpsc::Sender<BlockEpoch>,
        stop: Arc<AtomicBool>,
    ) -> Result<(), ChainError> {
        let heights = self.heights.lock().unwrap();
        loop {
            if stop.load(Relaxed) {
                return Ok(());
            }
            match heights.recv_timeout(Duration::from_millis(50)) {
                Ok(height) => {
                    *self.tip.lock().unwrap() = height;
                    epochs
                        .send(BlockEpoch {
                            currency: self.currency,
                            height,
                        })
                        .ok();
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }
}

/// Txid of a raw bitcoin transaction, or a placeholder for anything else.
pub fn txid_of(hex: &str) -> String {
    utill::from_hex(hex)
        .ok()
        .and_then(|bytes| {
            bitcoin::consensus::encode::deserialize::<bitcoin::Transaction>(&bytes).ok()
        })
        .map(|tx| tx.compute_txid().to_string())
        .unwrap_or_else(|| "00".repeat(32))
}

/// Stub Lightning node.
pub struct MockLightning {
    pub channels: Mutex<Vec<ChannelInfo>>,
    pub invoice_states: Mutex<HashMap<[u8; 32], InvoiceState>>,
    pub paid_invoices: Mutex<Vec<String>>,
    node_secret: SecretKey,
}

impl MockLightning {
    pub fn new() -> Arc<Self> {
        Arc::new(MockLightning {
            channels: Mutex::new(Vec::new()),
            invoice_states: Mutex::new(HashMap::new()),
            paid_invoices: Mutex::new(Vec::new()),
            node_secret: SecretKey::from_slice(&[0x5a; 32]).unwrap(),
        })
    }

    pub fn set_invoice_state(&self, payment_hash: [u8; 32], state: InvoiceState) {
        self.invoice_states
            .lock()
            .unwrap()
            .insert(payment_hash, state);
    }

    pub fn add_channel(&self, id: u64, capacity_sat: u64, local_sat: u64) {
        self.channels.lock().unwrap().push(ChannelInfo {
            id,
            peer_pubkey: "02deadbeef".to_string(),
            capacity_sat,
            local_sat,
            remote_sat: capacity_sat.saturating_sub(local_sat),
        });
    }
}

/// Build a signed regtest invoice over `amount_sat` committing to
/// `preimage_hash`.
pub fn build_invoice(node_secret: &SecretKey, preimage_hash: [u8; 32], amount_sat: u64) -> String {
    use lightning_invoice::{Currency as LnCurrency, InvoiceBuilder, PaymentSecret};

    let secp = Secp256k1::new();
    let now = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap();
    InvoiceBuilder::new(LnCurrency::Regtest)
        .description("mock swap".to_string())
        .payment_hash(sha256::Hash::from_byte_array(preimage_hash))
        .payment_secret(PaymentSecret([21u8; 32]))
        .amount_milli_satoshis(amount_sat * 1_000)
        .duration_since_epoch(now)
        .min_final_cltv_expiry_delta(80)
        .build_signed(|msg| secp.sign_ecdsa_recoverable(msg, node_secret))
        .unwrap()
        .to_string()
}

impl LightningNode for MockLightning {
    fn get_info(&self) -> Result<NodeInfo, LightningError> {
        Ok(NodeInfo {
            pubkey: "02abc".to_string(),
            alias: "mock".to_string(),
            block_height: 0,
        })
    }

    fn create_invoice(
        &self,
        amount_sat: u64,
        _memo: &str,
        _expiry_secs: u64,
    ) -> Result<CreatedInvoice, LightningError> {
        let preimage = [0x42u8; 32];
        let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
        self.set_invoice_state(payment_hash, InvoiceState::Open);
        Ok(CreatedInvoice {
            bolt11: build_invoice(&self.node_secret, payment_hash, amount_sat),
            payment_hash,
        })
    }

    fn pay_invoice(
        &self,
        invoice: &str,
        _fee_limit_sat: u64,
        _chan_ids: &[u64],
    ) -> Result<PaymentResult, LightningError> {
        self.paid_invoices.lock().unwrap().push(invoice.to_string());
        Ok(PaymentResult {
            preimage: [0u8; 32],
            routing_fee_msat: 1_234,
        })
    }

    fn lookup_invoice(&self, payment_hash: &[u8; 32]) -> Result<InvoiceState, LightningError> {
        self.invoice_states
            .lock()
            .unwrap()
            .get(payment_hash)
            .copied()
            .ok_or(LightningError::NotFound)
    }

    fn new_address(&self) -> Result<String, LightningError> {
        Ok(p2wpkh_address(0x77).to_string())
    }

    fn list_channels(&self) -> Result<Vec<ChannelInfo>, LightningError> {
        Ok(self.channels.lock().unwrap().clone())
    }
}

/// Stub wallet handing out a fixed P2WPKH address.
pub struct MockWallet {
    pub name: String,
    pub currency: Currency,
    pub sends: Mutex<Vec<(String, u64)>>,
}

impl MockWallet {
    pub fn new(name: &str, currency: Currency) -> Arc<Self> {
        Arc::new(MockWallet {
            name: name.to_string(),
            currency,
            sends: Mutex::new(Vec::new()),
        })
    }
}

impl OnchainWallet for MockWallet {
    fn name(&self) -> &str {
        &self.name
    }
    fn currency(&self) -> Currency {
        self.currency
    }
    fn is_readonly(&self) -> bool {
        false
    }
    fn new_address(&self) -> Result<String, WalletError> {
        Ok(p2wpkh_address(0x88).to_string())
    }
    fn balance_sat(&self) -> Result<u64, WalletError> {
        Ok(100_000_000)
    }
    fn send_to_address(
        &self,
        address: &str,
        amount_sat: u64,
        _fee_rate: f64,
    ) -> Result<String, WalletError> {
        self.sends
            .lock()
            .unwrap()
            .push((address.to_string(), amount_sat));
        Ok("11".repeat(32))
    }
}

/// Deterministic keypair from a filler byte.
pub fn keypair(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
    (secret, PublicKey::from_secret_key(&secp, &secret))
}

/// A regtest P2WPKH address derived from a filler byte.
pub fn p2wpkh_address(byte: u8) -> bitcoin::Address {
    let (_, pubkey) = keypair(byte);
    bitcoin::Address::p2wpkh(
        &bitcoin::CompressedPublicKey(pubkey),
        bitcoin::Network::Regtest,
    )
}

/// A lockup transaction paying `value` sat into the tree's regtest address.
pub fn lockup_transaction(tree: &SwapTree, value: u64) -> (bitcoin::Transaction, String) {
    let address = tree.btc_address(bitcoin::Network::Regtest).unwrap();
    let tx = bitcoin::Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: bitcoin::absolute::LockTime::ZERO,
        input: vec![],
        output: vec![bitcoin::TxOut {
            script_pubkey: address.script_pubkey(),
            value: bitcoin::Amount::from_sat(value),
        }],
    };
    let hex = bitcoin::consensus::encode::serialize_hex(&tx);
    (tx, hex)
}

/// A pending BTC submarine swap whose lockup is already on chain.
pub fn submarine_fixture(
    id: &str,
    timeout_block_height: u32,
    expected_amount: u64,
) -> (Swap, bitcoin::Transaction, String) {
    let (our_secret, our_pubkey) = keypair(0x31);
    let (_, exchange_pubkey) = keypair(0x32);
    let preimage = [0x41u8; 32];
    let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();

    let tree = SwapTree::new(
        TreeKind::Submarine,
        &preimage_hash,
        exchange_pubkey,
        our_pubkey,
        timeout_block_height,
    );
    let address = tree.btc_address(bitcoin::Network::Regtest).unwrap();
    let (lockup_tx, lockup_hex) = lockup_transaction(&tree, expected_amount + 200);

    let swap = Swap {
        id: id.to_string(),
        pair: Pair {
            from: Currency::Btc,
            to: Currency::Btc,
        },
        state: SwapState::Pending,
        error: None,
        status: Status::SwapCreated,
        private_key: our_secret,
        preimage: None,
        preimage_hash,
        invoice: None,
        address: address.to_string(),
        expected_amount,
        timeout_block_height,
        blinding_key: None,
        lockup_transaction_id: Some(lockup_tx.compute_txid().to_string()),
        refund_transaction_id: None,
        refund_address: None,
        is_auto: false,
        service_fee_percent: 0.1,
        service_fee: None,
        onchain_fee: Some(200),
        wallet: None,
        tree,
        created_at: chrono::Utc::now(),
    };
    (swap, lockup_tx, lockup_hex)
}

/// A pending BTC reverse swap whose lockup transaction exists.
pub fn reverse_fixture(
    id: &str,
    timeout_block_height: u32,
    onchain_amount: u64,
    accept_zero_conf: bool,
) -> (ReverseSwap, bitcoin::Transaction, String) {
    let (our_secret, our_pubkey) = keypair(0x33);
    let (_, exchange_pubkey) = keypair(0x34);
    let preimage = [0x43u8; 32];
    let preimage_hash = sha256::Hash::hash(&preimage).to_byte_array();

    let tree = SwapTree::new(
        TreeKind::Reverse,
        &preimage_hash,
        our_pubkey,
        exchange_pubkey,
        timeout_block_height,
    );
    let lockup_address = tree.btc_address(bitcoin::Network::Regtest).unwrap();
    let (lockup_tx, lockup_hex) = lockup_transaction(&tree, onchain_amount);

    let (node_secret, _) = keypair(0x5a);
    let swap = ReverseSwap {
        id: id.to_string(),
        pair: Pair {
            from: Currency::Btc,
            to: Currency::Btc,
        },
        state: SwapState::Pending,
        error: None,
        status: Status::SwapCreated,
        private_key: our_secret,
        preimage,
        preimage_hash,
        invoice: build_invoice(&node_secret, preimage_hash, onchain_amount + 500),
        lockup_address: lockup_address.to_string(),
        onchain_amount,
        timeout_block_height,
        accept_zero_conf,
        claim_address: p2wpkh_address(0x35).to_string(),
        claim_transaction_id: None,
        routing_fee_msat: None,
        external_pay: true,
        chan_ids: vec![],
        blinding_key: None,
        is_auto: false,
        service_fee_percent: 0.25,
        service_fee: None,
        onchain_fee: None,
        tree,
        created_at: chrono::Utc::now(),
    };
    (swap, lockup_tx, lockup_hex)
}

/// Poll until `predicate` returns `Some`, or panic after `timeout`.
pub fn wait_for<T>(timeout: Duration, mut predicate: impl FnMut() -> Option<T>) -> T {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Some(value) = predicate() {
            return value;
        }
        if std::time::Instant::now() > deadline {
            panic!("condition not met within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}
