use crate::amqp::configuration::{ConnectionSettings, TlsSettings};
use crate::amqp::transport::{BrokerConnection, Connector};
use crate::Error;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone, Default)]
/// Opens `lapin` connections from named connection definitions.
///
/// Connections are encrypted when the definition carries a `tls` section.
pub struct ConnectionFactory {
    /// Replaces the TLS connector derived from the settings, for every connection.
    tls_connector: Option<NativeTlsConnector>,
}

struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `connector` for every TLS connection instead of building one from the settings.
    #[must_use]
    pub fn with_tls_connector(mut self, connector: NativeTlsConnector) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    fn tls(&self, name: &str, uri: &AMQPUri, settings: &TlsSettings) -> Result<Tls, Error> {
        let domain_name = settings
            .domain
            .clone()
            .unwrap_or_else(|| uri.authority.host.clone());
        let connector = match &self.tls_connector {
            Some(connector) => connector.clone(),
            None => {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = settings
                    .ca_certificate_chain()
                    .map_err(|e| misconfigured(name, format!("{e:#}")))?
                {
                    connector_builder.add_root_certificate(certificate);
                }
                connector_builder.build().map_err(|e| misconfigured(name, e))?
            }
        };
        Ok(Tls {
            connector,
            domain_name,
        })
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(uri, properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        uri: AMQPUri,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            uri,
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

fn misconfigured(name: &str, reason: impl std::fmt::Display) -> Error {
    Error::Configuration {
        connection: name.to_owned(),
        reason: reason.to_string(),
    }
}

#[async_trait::async_trait]
impl Connector for ConnectionFactory {
    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if the settings carry a `tls` section.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self, settings))]
    async fn connect(
        &self,
        name: &str,
        settings: &ConnectionSettings,
    ) -> Result<Arc<dyn BrokerConnection>, Error> {
        let uri = settings.amqp_uri(name)?;
        let tls = settings
            .options
            .tls
            .as_ref()
            .map(|tls_settings| self.tls(name, &uri, tls_settings))
            .transpose()?;
        let connection_timeout = settings.options.connection_timeout();
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());

        let connection = timeout(connection_timeout, async {
            match tls {
                None => self.connect_without_tls(uri, properties).await,
                Some(tls) => self.connect_with_tls(uri, properties, Arc::new(tls)).await,
            }
        })
        .await
        .map_err(|_| Error::ConnectionTimeout(connection_timeout))??;

        // Register a callback to log connection errors.
        let connection_name = name.to_owned();
        connection.on_error(move |e| {
            warn!(connection = %connection_name, "RabbitMQ broken connection: {:?}", e);
        });
        Ok(Arc::new(connection))
    }
}
