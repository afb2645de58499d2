//! The error type shared by the connection manager and the publisher, together with the
//! default classification of errors into transient and permanent failures.
use std::time::Duration;

/// Everything that can go wrong when publishing to a RabbitMq broker.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A connection definition is missing a required field, or its TLS material is invalid.
    ///
    /// Raised when the connection is created. It is never retried.
    #[error("Connection `{connection}` is misconfigured: {reason}")]
    Configuration { connection: String, reason: String },
    /// The payload could not be encoded as JSON.
    #[error("Payload serialization failed")]
    Serialization(#[source] serde_json::Error),
    /// The underlying AMQP client reported a failure.
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Broker(#[from] lapin::Error),
    /// The broker did not complete the connection handshake in time.
    #[error("Timed out after {0:?} while trying to connect to RabbitMq")]
    ConnectionTimeout(Duration),
    /// The broker did not confirm the published messages in time, negatively acknowledged
    /// them or returned them as unroutable.
    #[error("Publisher confirm timeout or nack")]
    Confirmation,
    /// Any other failure, usually raised by caller-provided code.
    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

/// A retry decider: given the error raised by an attempt, should the attempt be retried?
pub type Decider = std::sync::Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// The default classifier.
///
/// Transport and protocol failures reported by the AMQP client, connection timeouts and
/// missing publisher confirmations are transient. Everything else (configuration,
/// serialization and application errors) is permanent.
pub fn is_transient(error: &Error) -> bool {
    match error {
        Error::Broker(e) => is_transient_lapin_error(e),
        Error::ConnectionTimeout(_) | Error::Confirmation => true,
        Error::Configuration { .. } | Error::Serialization(_) | Error::Application(_) => false,
    }
}

fn is_transient_lapin_error(error: &lapin::Error) -> bool {
    use lapin::Error as E;

    match error {
        E::IOError(_)
        | E::ProtocolError(_)
        | E::InvalidChannelState(_)
        | E::InvalidConnectionState(_)
        | E::InvalidChannel(_)
        | E::ChannelsLimitReached
        | E::MissingHeartbeatError => true,
        // Parsing and serialisation failures mean the frames themselves are broken.
        _ => false,
    }
}
