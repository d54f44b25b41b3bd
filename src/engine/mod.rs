// FC8 CORE — ENGINE MODULE
// Everything the overlay IS: the protocol and the infrastructure under it.
// Engine defines the wire. Network moves the frames. Crypto protects them.

pub mod protocol;
pub mod runtime;
