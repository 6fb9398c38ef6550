//! Modem subsystem (spec.md section 4.4-4.6): UART framing, the command
//! table, the power rail FSM, and the batched session manager that glues
//! them together.

pub mod commands;
pub mod framer;
pub mod power;
pub mod session;

pub use commands::{MessageStatus, MessageStatusElement, ModemCommand, ModemNetworkState, ModemStatus};
pub use power::{ModemPower, ModemRails, PowerState};
pub use session::{ModemSession, ModemUart};
