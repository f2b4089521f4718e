use thiserror::Error;

use tokio_tungstenite::tungstenite;

/// All errors surfaced by the client.
///
/// None of these abort the connection driver by themselves; validation
/// failures are reported on the exception stream and transport failures feed
/// the reconnect loop.
#[derive(Debug, Error)]
pub enum OrtcError {
    /// Connect issued while a connection is already established
    #[error("Already Connected")]
    AlreadyConnected,

    /// The operation requires a live connection
    #[error("{0}")]
    NotConnected(String),

    /// A required input was empty
    #[error("{0} is null or empty")]
    EmptyField(&'static str),

    /// An input failed the identifier character set
    #[error("{0} has invalid characters")]
    InvalidCharacters(&'static str),

    /// An input exceeded a size bound
    #[error("{0} size exceeds the limit of {1} characters")]
    MaxLength(&'static str, usize),

    /// The permission cache has no grant for the channel
    #[error("{0}")]
    DoesNotHavePermission(String),

    /// Subscribe issued while already subscribing or subscribed
    #[error("{0}")]
    AlreadySubscribed(String),

    /// Unsubscribe issued for a channel that is not subscribed
    #[error("Not subscribed to channel {0}")]
    NotSubscribed(String),

    /// An inbound frame failed every parser
    #[error("{0}")]
    InvalidMessage(String),

    /// The service reported an error for one of our operations
    #[error("{0}")]
    Server(String),

    /// The save-authentication call was rejected
    #[error("{0}")]
    AuthenticationNotAuthorized(String),

    /// The balancer response did not carry a service URL
    #[error("Server returned invalid server")]
    InvalidBalancerResponse,

    /// Thrown if there's an error over the WS connection
    #[error(transparent)]
    Websocket(#[from] tungstenite::Error),

    /// Thrown if an out-of-band HTTP request failed
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Thrown if a URL could not be parsed
    #[error(transparent)]
    Url(#[from] url::ParseError),
}
