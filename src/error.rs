use thiserror::Error;

/// Errors surfaced by connection setup and the packet data path.
#[derive(Debug, Error)]
pub enum Error {
    /// Address parsing or DNS resolution failure.
    #[error("failed to resolve address: {0}")]
    Resolve(String),

    /// No capture interface carries the required IP address.
    #[error("no capture interface matches the requested address")]
    NoInterface,

    /// The underlying capture device could not be opened.
    #[error("failed to open capture handle on {device}: {reason}")]
    CaptureOpen { device: String, reason: String },

    /// BPF filter compilation or installation failed.
    #[error("failed to install filter {filter:?}: {source}")]
    Filter {
        filter: String,
        #[source]
        source: pcap::Error,
    },

    /// Kernel socket dial failed.
    #[error("failed to dial shadow connection: {0}")]
    Dial(#[source] std::io::Error),

    /// Kernel listener setup failed.
    #[error("failed to bind shadow listener: {0}")]
    Listen(#[source] std::io::Error),

    /// Raw frame transmission failed. Per-call: the flow stays valid and a
    /// retry may succeed.
    #[error("failed to inject frame: {0}")]
    Inject(String),

    /// The connection has been closed; also the terminal result of
    /// `read_from` after `close`.
    #[error("connection closed")]
    Closed,

    /// Deadline operations are not supported on packet connections.
    #[error("operation not implemented")]
    NotImplemented,
}

/// Type alias for Result with the crate error type.
pub type Result<T> = std::result::Result<T, Error>;
