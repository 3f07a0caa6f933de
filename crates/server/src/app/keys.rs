use super::{ApiError, SottoApp};
use crate::util::{decode_base64, decode_opaque, encode_base64};
use chrono::{Duration, Utc};
use pingora::protocols::http::ServerSession;
use serde::Deserialize;
use serde_json::json;
use sotto_crypto::{decrypt_envelope, verify_signed_prekey};
use sotto_storage::StorageError;
use tracing::{debug, warn};
use uuid::Uuid;

const SIGNED_PREKEY_TTL_DAYS: i64 = 30;
const SIGNED_PREKEY_KEY_ID: &str = "signed-prekey-v1";

#[derive(Deserialize)]
struct PreKeyBundleUpload {
    identity_pub: String,
    signing_pub: String,
    signed_prekey: String,
    signed_prekey_signature: String,
    #[serde(default)]
    one_time_prekeys: Vec<String>,
    device_label: String,
    device_pubkey: String,
}

#[derive(Deserialize)]
struct EncryptedBundleUpload {
    encrypted_bundle: String,
}

impl SottoApp {
    pub(super) async fn handle_prekeys_upload(
        &self,
        session: &mut ServerSession,
    ) -> Result<(), ApiError> {
        let user_id = self.authenticate(session)?;
        let body = Self::read_body(session).await?;
        let body = self.unwrap_encrypted_bundle(body)?;
        let payload: PreKeyBundleUpload = serde_json::from_slice(&body)
            .map_err(|_| ApiError::BadRequest("invalid request".to_string()))?;

        let identity_pub = decode_opaque(&payload.identity_pub, 32)
            .map_err(|_| ApiError::BadRequest("invalid identity_pub".to_string()))?;
        let device_pub = decode_opaque(&payload.device_pubkey, 32)
            .map_err(|_| ApiError::BadRequest("invalid device_pubkey".to_string()))?;
        let signing_pub = decode_base64(&payload.signing_pub)
            .map_err(|_| ApiError::BadRequest("invalid signing_pub".to_string()))?;
        let signed_prekey = decode_base64(&payload.signed_prekey)
            .map_err(|_| ApiError::BadRequest("invalid signed_prekey".to_string()))?;
        let signature = decode_base64(&payload.signed_prekey_signature)
            .map_err(|_| ApiError::BadRequest("invalid signed_prekey_signature".to_string()))?;

        // Wrong lengths and bad signatures collapse into one rejection so
        // the response never narrows down which check failed.
        if !verify_signed_prekey(&signing_pub, &signed_prekey, &signature) {
            return Err(ApiError::BadRequest(
                "signature verification failed".to_string(),
            ));
        }

        match self.state.storage.bind_identity_key(user_id, &identity_pub).await {
            Ok(()) => {}
            Err(StorageError::Conflict) => {
                return Err(ApiError::Conflict(
                    "identity key already bound".to_string(),
                ));
            }
            Err(StorageError::Missing) => return Err(ApiError::NotFound),
            Err(err) => {
                warn!("identity bind failed: {}", err);
                return Err(ApiError::Internal);
            }
        }

        let expires_at = Utc::now() + Duration::days(SIGNED_PREKEY_TTL_DAYS);
        self.state
            .storage
            .insert_signed_prekey(
                user_id,
                SIGNED_PREKEY_KEY_ID,
                &signed_prekey,
                &signature,
                expires_at,
            )
            .await
            .map_err(|err| {
                warn!("signed prekey insert failed: {}", err);
                ApiError::Internal
            })?;

        // Each one-time pre-key is best effort: undecodable or
        // wrong-length elements are skipped, the rest are kept.
        let mut one_time_keys = Vec::with_capacity(payload.one_time_prekeys.len());
        for encoded in &payload.one_time_prekeys {
            match decode_opaque(encoded, 32) {
                Ok(key) => one_time_keys.push(key),
                Err(_) => debug!(user = %user_id, "undecodable one-time prekey skipped"),
            }
        }
        self.state
            .storage
            .insert_one_time_prekeys(user_id, &one_time_keys)
            .await
            .map_err(|err| {
                warn!("one-time prekey insert failed: {}", err);
                ApiError::Internal
            })?;

        self.state
            .storage
            .create_device(user_id, &payload.device_label, &device_pub)
            .await
            .map_err(|err| {
                warn!("device create failed: {}", err);
                ApiError::Internal
            })?;

        self.respond_json(session, 200, json!({"status": "ok"}))
            .await
            .map_err(|_| ApiError::Internal)
    }

    pub(super) async fn handle_bundle_get(
        &self,
        session: &mut ServerSession,
        target: &str,
    ) -> Result<(), ApiError> {
        self.authenticate(session)?;
        let target_user_id = target
            .trim_end_matches('/')
            .parse::<Uuid>()
            .map_err(|_| ApiError::BadRequest("invalid user_id".to_string()))?;

        let user = match self.state.storage.load_user(target_user_id).await {
            Ok(user) => user,
            Err(StorageError::Missing) => return Err(ApiError::NotFound),
            Err(err) => {
                warn!("user load failed: {}", err);
                return Err(ApiError::Internal);
            }
        };
        let prekey = match self.state.storage.latest_signed_prekey(target_user_id).await {
            Ok(prekey) => prekey,
            Err(StorageError::Missing) => return Err(ApiError::NotFound),
            Err(err) => {
                warn!("signed prekey load failed: {}", err);
                return Err(ApiError::Internal);
            }
        };

        // Fetching a bundle burns one one-time pre-key; depletion is not
        // an error, the field is simply absent.
        let one_time_prekey = match self.state.storage.consume_one_time_prekey(target_user_id).await
        {
            Ok(record) => Some(record.public_key),
            Err(StorageError::Missing) => None,
            Err(err) => {
                warn!("one-time prekey consume failed: {}", err);
                return Err(ApiError::Internal);
            }
        };

        let devices = self
            .state
            .storage
            .list_devices(target_user_id)
            .await
            .map_err(|err| {
                warn!("device list failed: {}", err);
                ApiError::Internal
            })?;
        let devices_payload = devices
            .iter()
            .map(|device| {
                json!({
                    "device_label": device.device_label,
                    "device_pubkey": encode_base64(&device.device_public_key),
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "user_id": user.id.to_string(),
            "identity_pub": encode_base64(&user.identity_public_key),
            "signed_prekey": encode_base64(&prekey.public_key),
            "signed_prekey_signature": encode_base64(&prekey.signature),
            "devices": devices_payload,
        });
        if let Some(one_time) = one_time_prekey
            && let Some(obj) = body.as_object_mut()
        {
            obj.insert("one_time_prekey".to_string(), json!(encode_base64(&one_time)));
        }

        self.respond_json(session, 200, body)
            .await
            .map_err(|_| ApiError::Internal)
    }

    /// Unwraps the legacy encrypted upload path. Without a configured
    /// server key, or when the body is not an encrypted wrapper, the body
    /// passes through untouched.
    fn unwrap_encrypted_bundle(&self, body: Vec<u8>) -> Result<Vec<u8>, ApiError> {
        let Some(key) = self.state.server_rsa.as_ref() else {
            return Ok(body);
        };
        let Ok(wrapper) = serde_json::from_slice::<EncryptedBundleUpload>(&body) else {
            return Ok(body);
        };
        let ciphertext = decode_base64(&wrapper.encrypted_bundle)
            .map_err(|_| ApiError::BadRequest("invalid encrypted_bundle".to_string()))?;
        decrypt_envelope(key, &ciphertext)
            .map_err(|_| ApiError::BadRequest("invalid encrypted_bundle".to_string()))
    }
}
