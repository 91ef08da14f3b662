//! Stratum v1 wire messages, server side.
//!
//! Inbound lines are decoded by a strict decoder into the closed
//! [`Request`] enum; a request whose params don't have the expected shape
//! is an error, never a partially filled request. Outbound messages are
//! rendered straight to JSON lines.

use std::str::FromStr;

use serde::Deserialize;
use serde_json::{Value, json};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;

use crate::types::Difficulty;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr)]
pub enum Method {
    #[strum(serialize = "mining.subscribe")]
    Subscribe,
    #[strum(serialize = "mining.authorize")]
    Authorize,
    #[strum(serialize = "mining.submit")]
    Submit,
    #[strum(serialize = "mining.get_transactions")]
    GetTransactions,
    #[strum(serialize = "mining.set_difficulty")]
    SetDifficulty,
    #[strum(serialize = "mining.notify")]
    Notify,
}

/// Parameters of `mining.submit`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// A decoded client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Subscribe {
        id: Value,
    },
    Authorize {
        id: Value,
        worker: String,
        password: String,
    },
    Submit {
        id: Value,
        params: SubmitParams,
    },
    GetTransactions {
        id: Value,
    },
    /// Anything else; logged and otherwise ignored.
    Unknown {
        id: Value,
        method: String,
    },
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("invalid JSON-RPC message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid params for {method}")]
    Params { id: Value, method: Method },
}

#[derive(Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

impl Request {
    /// Decode one line of input.
    pub fn decode(line: &str) -> Result<Self, MessageError> {
        let raw: RawRequest = serde_json::from_str(line)?;
        let id = raw.id;

        let Ok(method) = Method::from_str(&raw.method) else {
            return Ok(Request::Unknown {
                id,
                method: raw.method,
            });
        };

        let invalid = |id: Value| MessageError::Params { id, method };

        match method {
            // Params (user agent, session id) are optional and unused
            Method::Subscribe => Ok(Request::Subscribe { id }),

            Method::Authorize => {
                let Some(params) = raw.params.as_array() else {
                    return Err(invalid(id));
                };
                let worker = match params.first() {
                    Some(Value::String(w)) => w.clone(),
                    _ => return Err(invalid(id)),
                };
                let password = match params.get(1) {
                    Some(Value::String(p)) => p.clone(),
                    None | Some(Value::Null) => String::new(),
                    Some(_) => return Err(invalid(id)),
                };
                Ok(Request::Authorize {
                    id,
                    worker,
                    password,
                })
            }

            Method::Submit => {
                let fields: Result<(String, String, String, String, String), _> =
                    serde_json::from_value(raw.params);
                match fields {
                    Ok((worker, job_id, extranonce2, ntime, nonce)) => Ok(Request::Submit {
                        id,
                        params: SubmitParams {
                            worker,
                            job_id,
                            extranonce2,
                            ntime,
                            nonce,
                        },
                    }),
                    Err(_) => Err(invalid(id)),
                }
            }

            Method::GetTransactions => Ok(Request::GetTransactions { id }),

            // Server-to-client notifications have no meaning as requests
            Method::SetDifficulty | Method::Notify => Ok(Request::Unknown {
                id,
                method: raw.method,
            }),
        }
    }
}

/// `{"id": .., "result": .., "error": ..}`
pub fn response(id: &Value, result: Value, error: Value) -> String {
    json!({ "id": id, "result": result, "error": error }).to_string()
}

/// `{"id": null, "method": .., "params": ..}`
pub fn notification(method: Method, params: Value) -> String {
    let method: &'static str = method.into();
    json!({ "id": null, "method": method, "params": params }).to_string()
}

pub fn subscribe_result(subscription_id: &str, extranonce1: &str, extranonce2_size: usize) -> Value {
    json!([
        [
            [Method::SetDifficulty.to_string(), subscription_id],
            [Method::Notify.to_string(), subscription_id],
        ],
        extranonce1,
        extranonce2_size,
    ])
}

pub fn set_difficulty(difficulty: Difficulty) -> String {
    notification(Method::SetDifficulty, json!([difficulty]))
}

/// Reply to `mining.get_transactions`, which this pool doesn't serve.
pub fn get_transactions_reply() -> String {
    json!({ "id": null, "result": [], "error": true }).to_string()
}
