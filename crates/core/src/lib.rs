pub mod quit;
pub mod resolver;
pub mod transport;

pub use quit::{quit_channel, QuitSignal, QuitTrigger};
pub use resolver::Resolver;

// Re-export transport types
pub use transport::{
    Connection, ProxyStream, SshTransport, SshTransportFactory, Transport, TransportFactory,
};
