//! Various utility and helper functions used across the crate.

use std::{
    collections::HashMap,
    fs,
    io::{self, BufRead},
    net::TcpStream,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use bitcoin::hex::{DisplayHex, FromHex};
use serde::de::DeserializeOwned;
use tungstenite::stream::MaybeTlsStream;

/// Interval at which long-running loops wake up to check their shutdown flag.
pub const HEART_BEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Interval between reconnection attempts for the exchange status stream
/// and the block streams.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

/// How long to wait for the exchange to acknowledge a subscription.
pub const SUBSCRIBE_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for HTTP calls, in seconds.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// Backoff schedule for transaction broadcast retries.
pub const BROADCAST_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(4),
    Duration::from_secs(16),
];

/// Returns the daemon data directory, `~/.lnswap` by default.
///
/// The directory is not created here; callers create what they need.
pub fn get_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".lnswap")
}

/// Encode bytes as lowercase hex.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.to_lower_hex_string()
}

/// Decode a hex string into bytes.
pub fn from_hex(hex: &str) -> Result<Vec<u8>, bitcoin::hex::HexToBytesError> {
    Vec::<u8>::from_hex(hex)
}

/// Parse a simple `key = value` TOML file into a flat string map.
///
/// Section headers and comments are skipped; values keep everything after the
/// first `=` with surrounding whitespace and quotes stripped. This is enough
/// for the flat config files this crate writes itself.
pub fn parse_toml(path: &Path) -> io::Result<HashMap<String, String>> {
    let file = fs::File::open(path)?;
    let reader = io::BufReader::new(file);

    let mut map = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            map.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(map)
}

/// Parse an optional config value, falling back to a default on absence or
/// parse failure.
pub fn parse_field<T: FromStr>(value: Option<&String>, default: T) -> T {
    value
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Deserialize a CBOR buffer, tolerating trailing bytes after the value.
pub fn deserialize_from_cbor<T: DeserializeOwned>(bytes: Vec<u8>) -> Result<T, serde_cbor::Error> {
    let mut deserializer = serde_cbor::Deserializer::from_slice(&bytes);
    T::deserialize(&mut deserializer)
}

/// Set a read timeout on the TCP stream underneath a websocket, so blocking
/// readers can periodically observe their shutdown flag.
pub fn set_websocket_read_timeout(
    stream: &MaybeTlsStream<TcpStream>,
    timeout: Duration,
) -> io::Result<()> {
    match stream {
        MaybeTlsStream::Plain(tcp) => tcp.set_read_timeout(Some(timeout)),
        MaybeTlsStream::NativeTls(tls) => tls.get_ref().set_read_timeout(Some(timeout)),
        _ => Ok(()),
    }
}

/// Whether a websocket read error is a read-timeout tick rather than a real
/// connection failure.
pub fn is_websocket_timeout(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Io(io_err) => matches!(
            io_err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_toml_flat_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "# comment\n[section]\nenabled = true\nbudget = 100000\nwallet = \"main\"\n"
        )
        .unwrap();

        let map = parse_toml(&path).unwrap();
        assert_eq!(map.get("enabled"), Some(&"true".to_string()));
        assert_eq!(map.get("budget"), Some(&"100000".to_string()));
        assert_eq!(map.get("wallet"), Some(&"main".to_string()));
        assert!(!map.contains_key("section"));
    }

    #[test]
    fn test_parse_field_fallbacks() {
        assert_eq!(parse_field::<u64>(Some(&"42".to_string()), 7), 42);
        assert_eq!(parse_field::<u64>(Some(&"nope".to_string()), 7), 7);
        assert_eq!(parse_field::<u64>(None, 7), 7);
    }

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0xde, 0xad, 0xbe, 0xef];
        assert_eq!(to_hex(&bytes), "deadbeef");
        assert_eq!(from_hex("deadbeef").unwrap(), bytes);
    }
}
