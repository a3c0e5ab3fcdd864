//! VLESS wire format.
//!
//! Only the client side of the TCP command is implemented: building the
//! request header that prefixes the first upstream message, and stripping
//! the response header from the first downstream bytes.

pub mod address;
pub mod header;

pub use address::{decode_address, encode_address, AddressKind, Destination};
pub use header::{build_request_header, Identifier, RequestHeader, ResponseStripper};
