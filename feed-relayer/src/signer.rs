use std::path::Path;

use hex::FromHex;
use snafu::ResultExt;
use subxt_signer::sr25519::Keypair;

use crate::error::*;
use crate::model::Identity;

/// load a hex encoded sr25519 secret from a file
pub async fn load_substrate_key(file_path: &Path) -> Result<Keypair> {
    let hex_string = tokio::fs::read_to_string(file_path)
        .await
        .context(KeyFileReadSnafu { path: file_path })?;

    let hex_string = hex_string.trim();
    let key_bytes =
        Vec::from_hex(hex_string.strip_prefix("0x").unwrap_or(hex_string)).context(KeyParseSnafu)?;

    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKeyLength {
            length: key_bytes.len(),
        })?;

    Keypair::from_secret_key(key_bytes).map_err(|_| Error::KeypairCreation)
}

/// load the identity whose secret is stored in `file_path`
pub async fn load_identity(file_path: &Path) -> Result<Identity> {
    Ok(Identity::new(load_substrate_key(file_path).await?))
}
