pub mod config;
pub mod proxy;

pub use config::{Cli, Command, ListenUri, ProxyConfig, SniArgs};
pub use proxy::{
    ClientHello, ConnectionHandler, DialError, Dialer, DialerConfig, Listener, ListenerConfig,
    ListenerStats, ProxyError, RecordHeader, SniError, UpstreamProxy, UpstreamTarget,
};
