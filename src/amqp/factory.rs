use super::session::AmqpConnection;
use crate::amqp::configuration::RabbitMqSettings;
use crate::broker::{Broker, BrokerError, Connection};
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// `ConnectionFactory` is the production [`Broker`]: hand it over to
/// [`ConnectionPool::builder`](crate::pool::ConnectionPool::builder).
pub struct ConnectionFactory {
    /// The primary broker first, then the failover ones.
    uris: Vec<AMQPUri>,
    /// The timeout observed when trying to connect to each broker.
    connection_timeout: std::time::Duration,
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    /// `None` means "the host being connected to".
    domain_name: Option<String>,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMQ.")?;
                Ok(Tls {
                    domain_name: tls_settings.domain.clone(),
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            uris: settings.amqp_uris(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS Connector, along with the expected domain name for the certificate.
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: Option<String>,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Connect to the first reachable broker: the primary one, then each failover host in
    /// order.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let mut last_error = anyhow::anyhow!("No RabbitMq broker address was configured");
        for uri in &self.uris {
            match self.connect_to(uri).await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!(
                        host = %uri.authority.host,
                        error = ?e,
                        "Failed to connect to RabbitMq, trying the next broker"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_to(&self, uri: &AMQPUri) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => lapin::Connection::connect_uri(uri.clone(), properties).await,
                Some(tls) => connect_with_tls(uri.clone(), properties, Arc::clone(tls)).await,
            }
        })
        .await
        .with_context(|| format!("Timed out connecting to {}", uri.authority.host))??;
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }
}

/// Establish a new TLS connection to a RabbitMq broker.
async fn connect_with_tls(
    uri: AMQPUri,
    properties: ConnectionProperties,
    tls: Arc<Tls>,
) -> Result<lapin::Connection, lapin::Error> {
    let domain_name = tls
        .domain_name
        .clone()
        .unwrap_or_else(|| uri.authority.host.clone());
    lapin::Connection::connector(
        uri,
        Box::new(move |uri| {
            // Plain TCP first, then the TLS handshake against the expected domain.
            let mut amqp_uri = uri.clone();
            amqp_uri.scheme = AMQPScheme::AMQP;
            amqp_uri
                .connect()
                .and_then(|tcp| tcp.into_native_tls(&tls.connector, &domain_name))
        }),
        properties,
    )
    .await
}

#[async_trait::async_trait]
impl Broker for ConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let connection = self.new_connection().await.map_err(BrokerError::Connect)?;
        Ok(Arc::new(AmqpConnection::new(connection)))
    }
}
