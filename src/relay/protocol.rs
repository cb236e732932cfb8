//! Gatekeeper relay protocol.
//!
//! Two clouds that cannot reach each other meet on a shared broker:
//!
//! 1. The initiator publishes an advertisement on the shared topic carrying a
//!    session id signed by itself and sealed for the responder, then waits
//!    for an `ack` on `RESP-<responder>-<session>`.
//! 2. The responder, listening on the topic, opens `REQ-<responder>-<session>`
//!    and answers the advertisement with the `ack`.
//! 3. The initiator publishes its request on the request queue and waits for
//!    the response on the response queue.
//!
//! Every wait is bounded by the client timeout. A timeout is reported as
//! `Ok(None)`, never as an error. Every frame after the advertisement is a
//! sealed envelope whose session id is checked against the one negotiated,
//! so frames replayed from other sessions are rejected.

use crate::relay::config::RelayClientConfig;
use crate::relay::crypto::{parse_public_key, public_key_fingerprint, DecodedMessage, MessageCryptographer, RelayKeyPair};
use crate::relay::error::{RelayError, RelayResult, RemoteErrorKind};
use crate::relay::message::{
    request_queue_name, response_queue_name, AdvertisementRecord, ErrorWrapper, MessageType,
    RequestPayload, ResponsePayload, GENERAL_ADVERTISEMENT_TOPIC,
};
use crate::relay::transport::{MessageConsumer, MessageProducer, RelaySession};
use k256::PublicKey;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const SECURITY_TARGET: &str = "gatekeeper_relay::security";

/// Capability returned by a successful advertisement handshake.
///
/// Owns the response consumer; pass it to
/// [`GatekeeperRelayClient::send_request_and_wait`].
pub struct GeneralAdvertisementResult {
    answer_receiver: MessageConsumer,
    peer_cn: String,
    peer_public_key: PublicKey,
    session_id: String,
}

impl GeneralAdvertisementResult {
    pub fn peer_cn(&self) -> &str {
        &self.peer_cn
    }

    pub fn peer_public_key(&self) -> &PublicKey {
        &self.peer_public_key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Debug for GeneralAdvertisementResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneralAdvertisementResult")
            .field("peer_cn", &self.peer_cn)
            .field("peer_public_key", &public_key_fingerprint(&self.peer_public_key))
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// A request received by the responder, answerable exactly once.
pub struct GatekeeperRelayRequest {
    answer_sender: MessageProducer,
    peer_cn: String,
    peer_public_key: PublicKey,
    session_id: String,
    payload: RequestPayload,
}

impl GatekeeperRelayRequest {
    pub fn peer_cn(&self) -> &str {
        &self.peer_cn
    }

    pub fn peer_public_key(&self) -> &PublicKey {
        &self.peer_public_key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn payload(&self) -> &RequestPayload {
        &self.payload
    }
}

impl fmt::Debug for GatekeeperRelayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatekeeperRelayRequest")
            .field("peer_cn", &self.peer_cn)
            .field("session_id", &self.session_id)
            .field("message_type", &self.message_type())
            .finish_non_exhaustive()
    }
}

/// A response received by the initiator.
#[derive(Debug, Clone, PartialEq)]
pub struct GatekeeperRelayResponse {
    session_id: String,
    payload: ResponsePayload,
}

impl GatekeeperRelayResponse {
    pub fn new(session_id: impl Into<String>, payload: ResponsePayload) -> RelayResult<Self> {
        let session_id = session_id.into();
        if session_id.is_empty() {
            return Err(RelayError::Validation("response session id is empty".to_string()));
        }
        Ok(Self { session_id, payload })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    pub fn payload(&self) -> &ResponsePayload {
        &self.payload
    }

    pub fn into_payload(self) -> ResponsePayload {
        self.payload
    }
}

/// Subscription to the shared advertisement topic.
pub struct AdvertisementListener {
    consumer: MessageConsumer,
}

impl AdvertisementListener {
    pub fn close(&mut self) {
        self.consumer.close();
    }
}

/// One cloud's endpoint of the gatekeeper relay protocol.
pub struct GatekeeperRelayClient {
    common_name: String,
    cryptographer: MessageCryptographer,
    timeout: Duration,
}

impl GatekeeperRelayClient {
    pub fn new(common_name: impl Into<String>, keys: Arc<RelayKeyPair>, timeout: Duration) -> RelayResult<Self> {
        let common_name = common_name.into();
        if common_name.trim().is_empty() {
            return Err(RelayError::Validation("common name is empty".to_string()));
        }
        if timeout.is_zero() {
            return Err(RelayError::Validation("timeout must be positive".to_string()));
        }

        Ok(Self {
            common_name,
            cryptographer: MessageCryptographer::new(keys),
            timeout,
        })
    }

    /// Build a client from a validated configuration, loading its key from disk
    pub fn from_config(config: &RelayClientConfig) -> RelayResult<Self> {
        config.validate()?;
        let keys = RelayKeyPair::load(&config.key_path)?;
        Self::new(config.common_name.clone(), Arc::new(keys), config.timeout())
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cryptographer(&self) -> &MessageCryptographer {
        &self.cryptographer
    }

    // Initiator side

    /// Announce a new session to `peer_cn` and wait for its ack.
    pub async fn advertise_and_wait(
        &self,
        session: &RelaySession,
        peer_cn: &str,
        peer_public_key: &PublicKey,
    ) -> RelayResult<Option<GeneralAdvertisementResult>> {
        if peer_cn.trim().is_empty() {
            return Err(RelayError::Validation("peer common name is empty".to_string()));
        }

        let session_id = Uuid::new_v4().simple().to_string();
        let sealed_id = self.cryptographer.encode_session_id(&session_id, peer_public_key)?;

        // Listen before announcing so the ack cannot be missed
        let mut answer_receiver = session
            .create_queue_consumer(&response_queue_name(peer_cn, &session_id))
            .await?;

        let record = AdvertisementRecord {
            sender_cn: self.common_name.clone(),
            sender_public_key: self.cryptographer.key_pair().public_key_base64()?,
            recipient_cn: peer_cn.to_string(),
            session_id: sealed_id,
        };
        let mut announcer = session.create_topic_producer(GENERAL_ADVERTISEMENT_TOPIC)?;
        announcer.send(record.to_json()?)?;
        announcer.close();

        tracing::debug!("Advertised session {} to {} on {}", session_id, peer_cn, session.endpoint());

        let Some(token) = answer_receiver.receive(self.timeout).await? else {
            tracing::info!("No ack from {} within {:?}", peer_cn, self.timeout);
            answer_receiver.close();
            return Ok(None);
        };

        let ack = self.decode(&token, peer_public_key)?;
        self.expect_frame(&ack, MessageType::Ack, &session_id, peer_cn)?;

        Ok(Some(GeneralAdvertisementResult {
            answer_receiver,
            peer_cn: peer_cn.to_string(),
            peer_public_key: peer_public_key.clone(),
            session_id,
        }))
    }

    /// Send a request within an acknowledged session and wait for the response.
    ///
    /// The response consumer and the request producer are closed on every exit.
    pub async fn send_request_and_wait(
        &self,
        session: &RelaySession,
        mut advertisement: GeneralAdvertisementResult,
        payload: RequestPayload,
    ) -> RelayResult<Option<GatekeeperRelayResponse>> {
        let message_type = payload.message_type();
        let session_id = advertisement.session_id.clone();
        let peer_cn = advertisement.peer_cn.clone();

        let mut sender = session.create_queue_producer(&request_queue_name(&peer_cn, &session_id))?;
        let token = self.cryptographer.encode_message(
            message_type.as_str(),
            &session_id,
            &payload.to_json(),
            &advertisement.peer_public_key,
        )?;
        sender.send(token)?;
        sender.close();

        tracing::debug!("Sent {} request in session {}", message_type, session_id);

        let Some(token) = advertisement.answer_receiver.receive(self.timeout).await? else {
            tracing::info!("No {} response from {} within {:?}", message_type, peer_cn, self.timeout);
            advertisement.answer_receiver.close();
            return Ok(None);
        };
        advertisement.answer_receiver.close();

        let decoded = self.decode(&token, &advertisement.peer_public_key)?;
        self.expect_frame(&decoded, message_type, &session_id, &peer_cn)?;

        if let Some(wrapper) = ErrorWrapper::detect(&decoded.payload)? {
            tracing::info!(
                "{} reported {} error for {}: {}",
                peer_cn,
                wrapper.exception_type,
                message_type,
                wrapper.error_message
            );
            return Err(wrapper.into_error());
        }

        let payload = ResponsePayload::from_json(message_type, &decoded.payload)?;
        GatekeeperRelayResponse::new(session_id, payload).map(Some)
    }

    // Responder side

    /// Subscribe to the shared advertisement topic. Do this once per session.
    pub async fn subscribe_advertisement_topic(&self, session: &RelaySession) -> RelayResult<AdvertisementListener> {
        let consumer = session.create_topic_consumer(GENERAL_ADVERTISEMENT_TOPIC).await?;
        tracing::info!("{} listening for advertisements on {}", self.common_name, session.endpoint());
        Ok(AdvertisementListener { consumer })
    }

    /// Wait for an advertisement addressed to this cloud, ack it and wait for
    /// the request that follows.
    ///
    /// Returns `Ok(None)` on timeout and for advertisements addressed to
    /// another cloud.
    pub async fn await_request(
        &self,
        session: &RelaySession,
        listener: &mut AdvertisementListener,
    ) -> RelayResult<Option<GatekeeperRelayRequest>> {
        let Some(text) = listener.consumer.receive(self.timeout).await? else {
            return Ok(None);
        };

        let record = AdvertisementRecord::from_json(&text)?;
        if record.recipient_cn != self.common_name {
            tracing::trace!("Ignoring advertisement for {}", record.recipient_cn);
            return Ok(None);
        }

        let peer_cn = record.sender_cn;
        let peer_public_key = parse_public_key(&record.sender_public_key)
            .map_err(|e| RelayError::Validation(format!("advertisement from {peer_cn}: {e}")))?;
        let session_id = self
            .cryptographer
            .decode_session_id(&record.session_id, &peer_public_key)
            .map_err(|e| self.security_event(e))?;

        let mut request_receiver = session
            .create_queue_consumer(&request_queue_name(&self.common_name, &session_id))
            .await?;
        let mut answer_sender =
            session.create_queue_producer(&response_queue_name(&self.common_name, &session_id))?;

        let ack = self.cryptographer.encode_message(
            MessageType::Ack.as_str(),
            &session_id,
            &Value::Null,
            &peer_public_key,
        )?;
        answer_sender.send(ack)?;

        tracing::debug!("Acknowledged session {} from {}", session_id, peer_cn);

        let Some(token) = request_receiver.receive(self.timeout).await? else {
            tracing::info!("No request from {} within {:?}", peer_cn, self.timeout);
            request_receiver.close();
            answer_sender.close();
            return Ok(None);
        };
        request_receiver.close();

        let decoded = self.decode(&token, &peer_public_key)?;
        let message_type = match decoded.message_type.parse::<MessageType>() {
            Ok(kind) if kind.is_request() => kind,
            _ => {
                return Err(self.security_event(RelayError::Authentication(format!(
                    "unsupported request type {:?} from {}",
                    decoded.message_type, peer_cn
                ))));
            }
        };
        self.expect_frame(&decoded, message_type, &session_id, &peer_cn)?;

        let payload = RequestPayload::from_json(message_type, &decoded.payload)?;

        Ok(Some(GatekeeperRelayRequest {
            answer_sender,
            peer_cn,
            peer_public_key,
            session_id,
            payload,
        }))
    }

    /// Answer a request. The response must be of the request's type.
    pub fn respond(&self, request: GatekeeperRelayRequest, payload: ResponsePayload) -> RelayResult<()> {
        if payload.message_type() != request.message_type() {
            return Err(RelayError::Validation(format!(
                "{} response cannot answer a {} request",
                payload.message_type(),
                request.message_type()
            )));
        }
        let body = payload.to_json()?;
        self.send_answer(request, &body)
    }

    /// Answer a request with an error the initiator will raise as [`RelayError::Remote`].
    pub fn respond_with_error(
        &self,
        request: GatekeeperRelayRequest,
        kind: RemoteErrorKind,
        code: u16,
        message: impl Into<String>,
    ) -> RelayResult<()> {
        let wrapper = ErrorWrapper::new(kind, code, message, self.common_name.clone());
        self.send_answer(request, &wrapper)
    }

    fn send_answer<T: serde::Serialize + ?Sized>(
        &self,
        mut request: GatekeeperRelayRequest,
        body: &T,
    ) -> RelayResult<()> {
        let message_type = request.message_type();
        let token = self.cryptographer.encode_message(
            message_type.as_str(),
            &request.session_id,
            body,
            &request.peer_public_key,
        )?;

        let sent = request.answer_sender.send(token);
        request.answer_sender.close();
        sent?;

        tracing::debug!("Answered {} request in session {}", message_type, request.session_id);
        Ok(())
    }

    fn decode(&self, token: &str, sender: &PublicKey) -> RelayResult<DecodedMessage> {
        self.cryptographer
            .decode_message(token, sender)
            .map_err(|e| self.security_event(e))
    }

    /// Check the type and session of a decoded frame
    fn expect_frame(
        &self,
        decoded: &DecodedMessage,
        expected: MessageType,
        session_id: &str,
        peer_cn: &str,
    ) -> RelayResult<()> {
        if decoded.message_type != expected.as_str() || decoded.session_id != session_id {
            return Err(self.security_event(RelayError::Authentication(format!(
                "unauthorized message on queue: expected {expected} for session {session_id} from {peer_cn}, got {} for session {}",
                decoded.message_type, decoded.session_id
            ))));
        }
        Ok(())
    }

    fn security_event(&self, error: RelayError) -> RelayError {
        if error.is_security_event() {
            tracing::warn!(target: SECURITY_TARGET, cloud = %self.common_name, "{}", error);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_validation() {
        let keys = Arc::new(RelayKeyPair::generate());
        assert!(GatekeeperRelayClient::new("", keys.clone(), Duration::from_secs(1)).is_err());
        assert!(GatekeeperRelayClient::new("cloud-a", keys.clone(), Duration::ZERO).is_err());

        let client = GatekeeperRelayClient::new("cloud-a", keys, Duration::from_secs(1)).unwrap();
        assert_eq!(client.common_name(), "cloud-a");
    }

    #[test]
    fn test_response_requires_session_id() {
        let payload = ResponsePayload::QosRelayTest(serde_json::json!({}));
        assert!(GatekeeperRelayResponse::new("", payload.clone()).is_err());

        let response = GatekeeperRelayResponse::new("s1", payload).unwrap();
        assert_eq!(response.message_type(), MessageType::QosRelayTest);
    }

    #[test]
    fn test_expect_frame_rejects_foreign_session() {
        let keys = Arc::new(RelayKeyPair::generate());
        let client = GatekeeperRelayClient::new("cloud-a", keys, Duration::from_secs(1)).unwrap();
        let decoded = DecodedMessage {
            message_type: "gsd_poll".to_string(),
            session_id: "s1".to_string(),
            payload: "{}".to_string(),
        };

        assert!(client.expect_frame(&decoded, MessageType::GsdPoll, "s1", "cloud-b").is_ok());

        let err = client
            .expect_frame(&decoded, MessageType::GsdPoll, "s2", "cloud-b")
            .unwrap_err();
        assert!(err.is_security_event());

        let err = client
            .expect_frame(&decoded, MessageType::Ack, "s1", "cloud-b")
            .unwrap_err();
        assert!(matches!(err, RelayError::Authentication(_)));
    }
}
