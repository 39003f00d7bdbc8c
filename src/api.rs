//! Wire types for the control socket: one JSON request per line, one JSON
//! response per line.

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    Create { name: String },
    Destroy { name: String },
    List,
    Start { name: String },
    Stop { name: String },
    Pause { name: String },
    Resume { name: String },
    Kill { name: String, signal: String },
    GetProperty { name: String, property: String },
    SetProperty { name: String, property: String, value: String },
    GetData { name: String, key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub name: String,
    pub state: String,
    pub pid: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Ok,
    Value(String),
    List(Vec<ContainerSummary>),
    Error { code: u32, kind: String, message: String },
}

impl Response {
    pub fn from_error(error: &Error) -> Response {
        Response::Error {
            code: error.kind() as u32,
            kind: error.kind().as_str().to_owned(),
            message: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_request_round_trip() {
        let req = Request::SetProperty {
            name: "box".into(),
            property: "command".into(),
            value: "/bin/true".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        match back {
            Request::SetProperty { name, property, value } => {
                assert_eq!(name, "box");
                assert_eq!(property, "command");
                assert_eq!(value, "/bin/true");
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_error_response_carries_kind_code() {
        let err = Error::new(ErrorKind::Busy, "container a already exists");
        match Response::from_error(&err) {
            Response::Error { code, kind, message } => {
                assert_eq!(code, ErrorKind::Busy as u32);
                assert_eq!(kind, "Busy");
                assert!(message.contains("already exists"));
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
