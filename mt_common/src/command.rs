//! Remote commands and host responses.
//!
//! A `Command` is deposited into a session mailbox by the remote side and drained by the
//! host with a type poll followed by indexed parameter fetches. Parameters are opaque to
//! the bridge and carried as JSON values. A `Response` is what the host posts back once
//! it has executed the command.
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command type reported when a mailbox is empty. Never a valid command type.
pub const NO_COMMAND: i32 = 0;

/// Command payload issued by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Host-defined command code. `NO_COMMAND` is reserved.
    pub command_type: i32,
    /// Ordered, opaque parameters.
    pub parameters: Vec<Value>,
}

impl Command {
    /// Creates a new command.
    pub fn new(command_type: i32, parameters: Vec<Value>) -> Self {
        Command {
            command_type,
            parameters,
        }
    }

    /// Returns `true` if the command can be placed in a mailbox.
    pub fn is_valid(&self) -> bool {
        self.command_type != NO_COMMAND
    }

    /// Parameter at `index`, or `None` when the index is negative or out of range.
    pub fn parameter(&self, index: i32) -> Option<&Value> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.parameters.get(i))
    }
}

/// Result of a command, produced once by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Opaque result value.
    pub payload: Value,
}

impl Response {
    /// Wraps any JSON-convertible value into a response.
    pub fn new(payload: impl Into<Value>) -> Self {
        Response {
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parameter_lookup_respects_bounds() {
        let cmd = Command::new(5, vec![json!(10), json!(20)]);
        assert_eq!(cmd.parameter(0), Some(&json!(10)));
        assert_eq!(cmd.parameter(1), Some(&json!(20)));
        assert_eq!(cmd.parameter(2), None);
        assert_eq!(cmd.parameter(-1), None);
    }

    #[test]
    fn zero_type_is_not_a_command() {
        assert!(!Command::new(NO_COMMAND, Vec::new()).is_valid());
        assert!(Command::new(1, Vec::new()).is_valid());
    }

    #[test]
    fn response_accepts_plain_values() {
        assert_eq!(Response::new("ok").payload, json!("ok"));
        assert_eq!(Response::new(42).payload, json!(42));
    }
}
