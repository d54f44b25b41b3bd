// FC8 CORE — CRYPTOGRAPHY MODULE
// AES-256-GCM framing over the shared frame buffer (aead.rs), plus the two
// session layers built on it: peer-to-peer (auth.rs) and end-to-end content
// (content.rs). Both derive their keys from x25519 static-static agreement.

pub mod aead;
pub mod auth;
pub mod content;
