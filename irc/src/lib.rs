pub use tokio_util::codec::BytesCodec;

pub use self::codec::Codec;
pub use self::connection::{Connection, Listener};

pub mod codec;
pub mod connection;
mod invalid_cert_verifier;
pub use proto;
pub use tokio_rustls::rustls;
