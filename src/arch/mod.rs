//! Architecture access layer.
//!
//! The kernel core never touches control registers, the interrupt flag, port
//! I/O or raw memory directly; everything goes through the callback set in
//! [`machine`].

pub mod machine;
