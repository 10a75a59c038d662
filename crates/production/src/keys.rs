//! Validator key file handling.

use filament_types::{CryptoError, KeyPair};
use std::io;
use std::path::Path;

/// File holding the hex-encoded secp256k1 private key.
pub const KEY_FILE: &str = "priv_key";

/// Load the validator key from `<datadir>/priv_key`.
pub fn load_key(datadir: &Path) -> io::Result<KeyPair> {
    let raw = std::fs::read_to_string(datadir.join(KEY_FILE))?;
    KeyPair::from_hex(&raw).map_err(|e: CryptoError| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Write the validator key to `<datadir>/priv_key` (hex, trailing
/// newline). Refuses to overwrite an existing key.
pub fn save_key(datadir: &Path, key: &KeyPair) -> io::Result<()> {
    let path = datadir.join(KEY_FILE);
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "priv_key already exists",
        ));
    }
    std::fs::write(path, format!("{}\n", key.to_hex()))
}
