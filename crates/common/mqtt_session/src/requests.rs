use crate::errors::MqttSessionError;
use crate::messages::Payload;
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

pub(crate) type ResponseSender = oneshot::Sender<Result<Payload, MqttSessionError>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Payload, MqttSessionError>>;

/// The table of outbound requests awaiting a correlated response.
///
/// An entry exists only between send and response, timeout or cancellation.
/// Request ids must be unique among outstanding requests; a duplicate insert
/// is rejected rather than silently replacing the previous waiter.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    pending: Mutex<HashMap<u32, ResponseSender>>,
}

impl RequestRegistry {
    pub fn insert(&self, request_id: u32) -> Result<ResponseReceiver, MqttSessionError> {
        let mut pending = self.pending.lock().unwrap();
        if pending.contains_key(&request_id) {
            return Err(MqttSessionError::DuplicateRequestId { request_id });
        }

        let (sender, receiver) = oneshot::channel();
        let _ = pending.insert(request_id, sender);
        Ok(receiver)
    }

    /// Resolve the request waiting on `request_id` with a response payload.
    ///
    /// Returns false when no caller is waiting anymore, as after a timeout.
    pub fn complete(&self, request_id: u32, response: Payload) -> bool {
        match self.pending.lock().unwrap().remove(&request_id) {
            Some(sender) => sender.send(Ok(response)).is_ok(),
            None => {
                debug!("Dropping response for unknown or expired request {request_id}");
                false
            }
        }
    }

    /// Drop the entry for `request_id`, so that a later response, possibly for
    /// a coincidentally-reused id, cannot resolve a dead caller.
    pub fn remove(&self, request_id: u32) {
        let _ = self.pending.lock().unwrap().remove(&request_id);
    }

    /// Fail every outstanding request at once.
    pub fn fail_all(&self, error: impl Fn() -> MqttSessionError) {
        let pending: Vec<ResponseSender> = {
            let mut table = self.pending.lock().unwrap();
            table.drain().map(|(_, sender)| sender).collect()
        };
        for sender in pending {
            let _ = sender.send(Err(error()));
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
