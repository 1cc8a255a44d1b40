use serde_json::{json, Value};

use crate::{Error, Filter, Note, Result};

/// Messages sent by clients, received by relays
#[derive(Debug)]
pub enum ClientMessage<'a> {
    Req {
        sub_id: &'a str,
        filters: &'a [Filter],
    },
    Close {
        sub_id: &'a str,
    },
}

impl<'a> ClientMessage<'a> {
    pub fn req(sub_id: &'a str, filters: &'a [Filter]) -> Self {
        ClientMessage::Req { sub_id, filters }
    }

    pub fn close(sub_id: &'a str) -> Self {
        ClientMessage::Close { sub_id }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(match self {
            Self::Req { sub_id, filters } => {
                if filters.is_empty() {
                    format!("[\"REQ\",{},{{}}]", json!(sub_id))
                } else {
                    let filters_json_str: Result<Vec<String>> =
                        filters.iter().map(Filter::json).collect();
                    format!(
                        "[\"REQ\",{},{}]",
                        json!(sub_id),
                        filters_json_str?.join(",")
                    )
                }
            }
            Self::Close { sub_id } => json!(["CLOSE", sub_id]).to_string(),
        })
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct CommandResult {
    pub event_id: String,
    pub status: bool,
    pub message: String,
}

/// Messages sent by relays, received by clients
#[derive(Debug, PartialEq, Eq)]
pub enum RelayMessage {
    OK(CommandResult),
    Eose(String),
    Event(String, Note),
    Notice(String),
    Closed(String, String),
}

fn str_at(arr: &[Value], i: usize) -> Result<&str> {
    arr.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::DecodeFailed(format!("expected string at position {i}")))
}

impl RelayMessage {
    pub fn from_json(msg: &str) -> Result<RelayMessage> {
        if msg.is_empty() {
            return Err(Error::Empty);
        }

        let value: Value = serde_json::from_str(msg)?;
        let Value::Array(arr) = value else {
            return Err(Error::DecodeFailed("relay message is not an array".into()));
        };

        match str_at(&arr, 0)? {
            // ["EVENT", <subscription id>, <event JSON>]
            "EVENT" => {
                let sub_id = str_at(&arr, 1)?.to_owned();
                let Some(ev) = arr.get(2) else {
                    return Err(Error::DecodeFailed("EVENT without event".into()));
                };
                let note: Note = serde_json::from_value(ev.clone())?;
                Ok(RelayMessage::Event(sub_id, note))
            }

            // ["EOSE", <subscription_id>]
            "EOSE" => Ok(RelayMessage::Eose(str_at(&arr, 1)?.to_owned())),

            // ["NOTICE", <message>]
            "NOTICE" => Ok(RelayMessage::Notice(str_at(&arr, 1)?.to_owned())),

            // ["CLOSED", <subscription_id>, <message>]
            "CLOSED" => Ok(RelayMessage::Closed(
                str_at(&arr, 1)?.to_owned(),
                str_at(&arr, 2).unwrap_or_default().to_owned(),
            )),

            // ["OK", <event_id>, <true|false>, <message>]
            "OK" => {
                let status = arr.get(2).and_then(Value::as_bool).ok_or_else(|| {
                    Error::DecodeFailed("OK without a boolean status".into())
                })?;
                Ok(RelayMessage::OK(CommandResult {
                    event_id: str_at(&arr, 1)?.to_owned(),
                    status,
                    message: str_at(&arr, 3).unwrap_or_default().to_owned(),
                }))
            }

            other => Err(Error::DecodeFailed(format!("unknown relay message '{other}'"))),
        }
    }
}
