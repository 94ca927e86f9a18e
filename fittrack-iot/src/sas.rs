use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::{SystemTime, SystemTimeError, UNIX_EPOCH};
use thiserror::Error;
use url::form_urlencoded::byte_serialize;

#[derive(Debug, Error)]
pub enum SasError {
    #[error("Device key is not valid base64: {0}")]
    InvalidKey(#[from] base64::DecodeError),
    #[error("Invalid token expiry time: {0}")]
    InvalidExpiry(#[from] SystemTimeError),
}

/// Percent-encode the given string for use in a query string or MQTT topic.
pub fn url_encode(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

/// Generate a shared access signature token granting access to the given resource until the given
/// expiry time, signed with the base64-encoded symmetric key.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &str,
    expiry: SystemTime,
) -> Result<String, SasError> {
    let key = STANDARD.decode(key)?;
    let expiry = expiry.duration_since(UNIX_EPOCH)?.as_secs();
    let resource = url_encode(resource_uri);
    let signature = hmac_sha256::HMAC::mac(format!("{}\n{}", resource, expiry), &key);
    Ok(format!(
        "SharedAccessSignature sr={}&sig={}&se={}",
        resource,
        url_encode(&STANDARD.encode(signature)),
        expiry
    ))
}
