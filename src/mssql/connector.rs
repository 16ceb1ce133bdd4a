use async_trait::async_trait;
use tiberius::{AuthMethod, Client, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::TokioAsyncWriteCompatExt;
use tracing::{debug, info};

use crate::config::{ClientOptions, ConnectionIdentity};
use crate::driver::{AbortHandle, Connector, DriverConnection};
use crate::error::SqlConduitError;

use super::connection::{MssqlConnection, TdsClient};

/// Opens SQL Server sessions over TCP with `tiberius`.
#[derive(Debug, Clone)]
pub struct MssqlConnector {
    trust_cert: bool,
}

impl Default for MssqlConnector {
    fn default() -> Self {
        Self { trust_cert: true }
    }
}

impl MssqlConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the server certificate without validation (the default, as for local development).
    #[must_use]
    pub fn trust_server_certificate(mut self, trust: bool) -> Self {
        self.trust_cert = trust;
        self
    }

    fn endpoint(&self, options: &ClientOptions) -> Endpoint {
        let mut config = Config::new();
        config.host(&options.server);
        config.port(options.port_or_default());
        config.database(&options.database);
        config.authentication(AuthMethod::sql_server(&options.user, &options.password));
        if let Some(instance) = &options.instance_name {
            config.instance_name(instance);
        }
        if let Some(app) = &options.application_name {
            config.application_name(app);
        }
        if self.trust_cert {
            config.trust_cert();
        }
        Endpoint {
            config,
            named: options.instance_name.is_some(),
        }
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    async fn connect(
        &self,
        identity: &ConnectionIdentity,
        options: &ClientOptions,
    ) -> Result<Box<dyn DriverConnection>, SqlConduitError> {
        let endpoint = self.endpoint(options);
        let mut client = endpoint.open().await?;

        let row = client
            .simple_query("SELECT @@SPID, @@LANGUAGE")
            .await?
            .into_row()
            .await?
            .ok_or_else(|| SqlConduitError::ConnectionError("session probe returned no row".into()))?;
        let spid: i16 = row.try_get(0)?.ok_or_else(|| {
            SqlConduitError::ConnectionError("server did not report a session id".into())
        })?;
        let language = row
            .try_get::<&str, _>(1)?
            .unwrap_or("us_english")
            .to_string();

        debug!(%identity, spid, %language, "SQL Server session established");
        Ok(Box::new(MssqlConnection::new(client, endpoint, spid, language)))
    }
}

/// Everything needed to open another session with the same credentials.
#[derive(Clone)]
pub(crate) struct Endpoint {
    config: Config,
    named: bool,
}

impl Endpoint {
    pub(crate) async fn open(&self) -> Result<TdsClient, SqlConduitError> {
        let tcp = if self.named {
            TcpStream::connect_named(&self.config).await?
        } else {
            TcpStream::connect(self.config.get_addr())
                .await
                .map_err(|e| SqlConduitError::ConnectionError(format!("TCP connection error: {e}")))?
        };
        tcp.set_nodelay(true)
            .map_err(|e| SqlConduitError::ConnectionError(format!("TCP setup error: {e}")))?;
        Ok(Client::connect(self.config.clone(), tcp.compat_write()).await?)
    }
}

/// Stops a running batch by killing its session from a side connection. Requires the login to
/// hold `ALTER ANY CONNECTION`; the killed session is discarded when it is validated.
pub(crate) struct MssqlAbort {
    pub(crate) endpoint: Endpoint,
    pub(crate) spid: i16,
}

#[async_trait]
impl AbortHandle for MssqlAbort {
    async fn abort(&self) -> Result<(), SqlConduitError> {
        let mut side = self.endpoint.open().await?;
        side.simple_query(format!("KILL {}", self.spid))
            .await?
            .into_results()
            .await?;
        info!(spid = self.spid, "killed SQL Server session");
        side.close().await?;
        Ok(())
    }
}
