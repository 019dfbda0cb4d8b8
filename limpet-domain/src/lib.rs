//! Core traits, types, and errors for the limpet proxy.
//!
//! This crate defines the vocabulary of the system. All other crates depend
//! on `limpet-domain` and speak its types. No implementations live here.
//!
//! # Structure
//!
//! - [`error`]  — [`LimpetError`] and [`Result<T>`] alias
//! - [`stream`] — [`ByteStream`], [`BackendDialer`] traits

mod error;
mod stream;

// --- error
pub use error::{LimpetError, Result};

// --- stream
pub use stream::{
    // ---
    BackendDialer,
    BackendDialerPtr,
    ByteStream,
    ByteStreamPtr,
};
