//! Guacamole wire protocol pieces used by the RAWeb tunnel.
//!
//! Pure library: framing, `.rdp` descriptor parsing, negotiated session
//! values and the descriptor → guacd `connect` parameter mapping.

pub mod descriptor;
pub mod error;
pub mod instruction;
pub mod params;
pub mod session;

pub use descriptor::{ConnectionDescriptor, TargetAddress};
pub use error::{CodecError, DescriptorError, MappingError};
pub use instruction::{Instruction, InstructionReader, complete_len, decode, encode};
pub use params::{ArgsAdvert, MappingContext, SUPPORTED_VERSION, validate_descriptor};
pub use session::{Credentials, DisplayInfo, NegotiatedSession};
