//! OS integration: a raw packet socket link for Linux hosts.

#[cfg(target_os = "linux")]
mod raw_socket;

#[cfg(target_os = "linux")]
pub use raw_socket::RawSocketLink;
