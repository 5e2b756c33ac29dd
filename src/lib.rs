//! Peer-to-peer session establishment on top of a lobby-style peer directory, and a multi-channel
//!  message transport on top of the resulting sessions.
//!
//! Applications create a [session::Session] for the local peer, create or join a directory group,
//!  and tick the session on a fixed cadence (see [session::driver::run_session]). The group's
//!  owner becomes the host, all other members negotiate a connection to it.

pub mod error;
pub mod session;
pub mod substrate;
pub mod transport;
pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
