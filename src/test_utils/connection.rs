use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::mpsc;

use crate::config::{ClientOptions, ConnectionIdentity};
use crate::driver::{AbortHandle, Command, Connector, DriverConnection, WireEvent};
use crate::error::SqlConduitError;
use crate::types::IsolationLevel;

use super::server::{ScriptedServer, ServerInner};

/// [`Connector`] opening sessions on a [`ScriptedServer`].
pub struct ScriptedConnector {
    server: ScriptedServer,
}

impl ScriptedConnector {
    #[must_use]
    pub fn new(server: ScriptedServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _identity: &ConnectionIdentity,
        _options: &ClientOptions,
    ) -> Result<Box<dyn DriverConnection>, SqlConduitError> {
        let server = Arc::clone(self.server.inner());
        let session = server.open_session()?;
        Ok(Box::new(ScriptedConnection { server, session }))
    }
}

pub struct ScriptedConnection {
    server: Arc<ServerInner>,
    session: u64,
}

impl ScriptedConnection {
    #[must_use]
    pub fn session(&self) -> u64 {
        self.session
    }
}

enum Feed {
    NotStarted(Arc<ServerInner>, u64, Command),
    Running(mpsc::UnboundedReceiver<Result<WireEvent, SqlConduitError>>),
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    fn execute<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> BoxStream<'a, Result<WireEvent, SqlConduitError>> {
        let feed = Feed::NotStarted(Arc::clone(&self.server), self.session, command.clone());
        stream::unfold(feed, |feed| async move {
            let mut rx = match feed {
                Feed::NotStarted(server, session, command) => server.start_batch(session, &command),
                Feed::Running(rx) => rx,
            };
            let event = rx.recv().await?;
            Some((event, Feed::Running(rx)))
        })
        .boxed()
    }

    fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        Arc::new(ScriptedAbort {
            server: Arc::clone(&self.server),
            session: self.session,
        })
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), SqlConduitError> {
        self.server.with_session(self.session, |s| {
            s.isolation = isolation;
            s.trancount += 1;
            Ok(())
        })
    }

    async fn commit(&mut self) -> Result<(), SqlConduitError> {
        self.server.with_session(self.session, |s| {
            if s.trancount == 0 {
                return Err(SqlConduitError::CommandError {
                    number: Some(3902),
                    message: "The COMMIT TRANSACTION request has no corresponding BEGIN TRANSACTION."
                        .into(),
                });
            }
            s.trancount -= 1;
            Ok(())
        })
    }

    async fn rollback(&mut self) -> Result<(), SqlConduitError> {
        self.server.with_session(self.session, |s| {
            if s.trancount == 0 {
                return Err(SqlConduitError::CommandError {
                    number: Some(3903),
                    message:
                        "The ROLLBACK TRANSACTION request has no corresponding BEGIN TRANSACTION."
                            .into(),
                });
            }
            s.trancount = 0;
            Ok(())
        })
    }

    async fn set_language(&mut self, language: &str) -> Result<(), SqlConduitError> {
        self.server.with_session(self.session, |s| {
            s.language = language.to_string();
            Ok(())
        })
    }

    async fn reset(&mut self) -> Result<(), SqlConduitError> {
        self.server.reset_session(self.session)
    }

    async fn ping(&mut self) -> Result<(), SqlConduitError> {
        self.server.with_session(self.session, |_| Ok(()))
    }

    async fn close(&mut self) -> Result<(), SqlConduitError> {
        self.server.close_session(self.session);
        Ok(())
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.server.close_session(self.session);
    }
}

struct ScriptedAbort {
    server: Arc<ServerInner>,
    session: u64,
}

#[async_trait]
impl AbortHandle for ScriptedAbort {
    async fn abort(&self) -> Result<(), SqlConduitError> {
        self.server.abort(self.session);
        Ok(())
    }
}
