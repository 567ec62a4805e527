//! Pure synchronous framing for dnet sessions.
//!
//! Nothing here owns a socket, a thread or a runtime. Codecs read from any
//! `std::io::Read`, keep partial frames between calls, and encode into
//! `bytes::Bytes`.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  dnet-core                   │
//! │                              │
//! │  codec     ← contract       │
//! │  frame     ← [len][body]    │
//! │  message   ← [len][id][body]│
//! │  rpc       ← seq/flag/name  │
//! │  registry  ← name/id → type │
//! │  error     ← CoreError      │
//! └──────────────────────────────┘
//! ```

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;
pub mod rpc;

pub use codec::{Codec, ReadBuffer};
pub use error::{CoreError, CoreResult};
pub use frame::LengthCodec;
pub use message::MessageCodec;
pub use registry::{Message, Registry, Unmarshal};
pub use rpc::{Request, Response, RpcCodec, RpcMessage};
