//! HTTP client for the TLC model-checker oracle.
//!
//! TLC is treated as an opaque state oracle: the client posts an event
//! trace to `/execute` and gets back one `(state representation, state key)`
//! pair per reached model state. Keys are opaque strings compared by
//! byte-equality.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::event::{Event, EventTrace};

/// Default request timeout; on expiry the trace counts as zero new states.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from one `/execute` round trip.
#[derive(Error, Debug)]
pub enum TlcError {
    #[error("transport error: {0}")]
    Transport(Box<ureq::Error>),

    #[error("malformed response body: {0}")]
    Body(#[from] std::io::Error),

    #[error("mismatched response: {states} states vs {keys} keys")]
    Mismatch { states: usize, keys: usize },
}

/// One model state as reported by TLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlcState {
    /// Opaque printable representation.
    pub repr: String,
    /// Opaque hash key; equality is byte-equality.
    pub key: String,
}

#[derive(Deserialize)]
struct TlcResponse {
    #[serde(rename = "States")]
    states: Vec<String>,
    #[serde(rename = "Keys")]
    keys: Vec<String>,
}

/// Client for one TLC server endpoint.
pub struct TlcClient {
    agent: ureq::Agent,
    url: String,
}

impl TlcClient {
    /// `addr` is `host:port`; the client posts to `http://{addr}/execute`.
    pub fn new(addr: &str) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Self {
            agent,
            url: format!("http://{addr}/execute"),
        }
    }

    /// Submit `events` (a `Reset` sentinel is appended) and return the
    /// sequence of states TLC walked through.
    pub fn send_trace(&self, events: &EventTrace) -> Result<Vec<TlcState>, TlcError> {
        let mut payload = events.clone();
        payload.push(Event::Reset);

        let response = self
            .agent
            .post(&self.url)
            .send_json(&payload)
            .map_err(|e| TlcError::Transport(Box::new(e)))?;
        let body: TlcResponse = response.into_json()?;

        if body.states.len() != body.keys.len() {
            return Err(TlcError::Mismatch {
                states: body.states.len(),
                keys: body.keys.len(),
            });
        }
        Ok(body
            .states
            .into_iter()
            .zip(body.keys)
            .map(|(repr, key)| TlcState { repr, key })
            .collect())
    }
}
