//! Command codes understood by the simulated instances.
use mt_common::BridgeError;

/// Commands a remote client may send to a simulated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Respond with the instance's current quote.
    GetQuote = 1,
    /// Respond with the command's parameters as an array.
    Echo = 2,
    /// Set the feed spread to parameter 0 and respond `true`.
    SetSpread = 3,
}

impl HostCommand {
    /// Every known command, in code order.
    pub const ALL: [HostCommand; 3] = [
        HostCommand::GetQuote,
        HostCommand::Echo,
        HostCommand::SetSpread,
    ];

    /// Wire code of the command.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for HostCommand {
    type Error = BridgeError;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        HostCommand::ALL
            .into_iter()
            .find(|cmd| cmd.code() == code)
            .ok_or_else(|| BridgeError::InvalidCommand(format!("unknown command code {}", code)))
    }
}
