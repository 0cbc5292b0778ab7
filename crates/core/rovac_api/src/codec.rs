use crate::errors::RovacError;

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// The request this frame responds to, when it is a response at all.
    /// Unsolicited device messages carry no request id.
    pub request_id: Option<u32>,

    /// The decrypted application payload
    pub body: Vec<u8>,
}

/// The payload codec collaborator.
///
/// The vendor's binary command encoding (framing, encryption, sequence
/// numbers) lives outside this core: the device connection only moves opaque
/// payloads and needs the codec to stamp outbound requests with an id and to
/// recover the id from inbound frames for response correlation.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode(&self, request_id: u32, body: &[u8]) -> Vec<u8>;

    fn decode(&self, raw: &[u8]) -> Result<DecodedFrame, RovacError>;
}
