//! OTA message processor (spec.md section 4.10): opcode table, request/
//! response shapes, and the phase0/phase1 retrieval state machine.

pub mod dispatcher;
pub mod opcodes;

pub use dispatcher::{FirmwareUpgradeHandoff, OtaDispatcher};
pub use opcodes::{GmtCandidate, GpsInterface, MemoryReader, OtaOpcode, OtaRequest, WaterAlgoParams};
