use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tiberius::{Client, Query, QueryItem, QueryStream};
use tokio::net::TcpStream;
use tokio_util::compat::Compat;
use tracing::debug;

use crate::driver::{AbortHandle, Command, DriverConnection, WireEvent};
use crate::error::SqlConduitError;
use crate::types::{IsolationLevel, RowValues};

use super::batch::{self, Batch, OUTPUT_MARKER, ROWCOUNT_MARKER};
use super::connector::{Endpoint, MssqlAbort};
use super::values;

pub(crate) type TdsClient = Client<Compat<TcpStream>>;

/// One SQL Server session.
pub struct MssqlConnection {
    client: TdsClient,
    endpoint: Endpoint,
    spid: i16,
    login_language: String,
}

impl MssqlConnection {
    pub(crate) fn new(
        client: TdsClient,
        endpoint: Endpoint,
        spid: i16,
        login_language: String,
    ) -> Self {
        Self {
            client,
            endpoint,
            spid,
            login_language,
        }
    }

    /// Server-side session id (`@@SPID`).
    #[must_use]
    pub fn spid(&self) -> i16 {
        self.spid
    }

    async fn run(&mut self, sql: &str) -> Result<(), SqlConduitError> {
        // Unread tokens of an abandoned response are flushed by tiberius before the next request.
        self.client.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

fn quote_literal(text: &str) -> String {
    format!("N'{}'", text.replace('\'', "''"))
}

enum Feed<'a> {
    Submit {
        client: &'a mut TdsClient,
        batch: Batch,
    },
    Reading {
        items: QueryStream<'a>,
        reader: Reader,
    },
}

#[async_trait]
impl DriverConnection for MssqlConnection {
    fn execute<'a>(
        &'a mut self,
        command: &'a Command,
    ) -> BoxStream<'a, Result<WireEvent, SqlConduitError>> {
        let batch = match batch::render(command) {
            Ok(batch) => batch,
            Err(err) => return stream::once(async move { Err(err) }).boxed(),
        };
        let feed = Feed::Submit {
            client: &mut self.client,
            batch,
        };
        stream::unfold(Some(feed), |feed| async move {
            let mut feed = feed?;
            loop {
                match feed {
                    Feed::Submit { client, batch } => {
                        let mut query = Query::new(batch.sql);
                        for arg in batch.args {
                            query.bind(arg);
                        }
                        match query.query(client).await {
                            Ok(items) => {
                                feed = Feed::Reading {
                                    items,
                                    reader: Reader::default(),
                                };
                            }
                            Err(err) => return Some((Err(err.into()), None)),
                        }
                    }
                    Feed::Reading {
                        mut items,
                        mut reader,
                    } => {
                        if let Some(event) = reader.queue.pop_front() {
                            return Some((event, Some(Feed::Reading { items, reader })));
                        }
                        if reader.ended {
                            return None;
                        }
                        match items.next().await {
                            Some(Ok(item)) => reader.accept(item),
                            Some(Err(err)) => reader.fail(err.into()),
                            None => reader.finish(),
                        }
                        feed = Feed::Reading { items, reader };
                    }
                }
            }
        })
        .boxed()
    }

    fn abort_handle(&self) -> Arc<dyn AbortHandle> {
        Arc::new(MssqlAbort {
            endpoint: self.endpoint.clone(),
            spid: self.spid,
        })
    }

    async fn begin(&mut self, isolation: IsolationLevel) -> Result<(), SqlConduitError> {
        let sql = format!(
            "SET TRANSACTION ISOLATION LEVEL {}; BEGIN TRANSACTION;",
            isolation.as_sql()
        );
        self.run(&sql).await
    }

    async fn commit(&mut self) -> Result<(), SqlConduitError> {
        self.run("COMMIT TRANSACTION;").await
    }

    async fn rollback(&mut self) -> Result<(), SqlConduitError> {
        self.run("ROLLBACK TRANSACTION;").await
    }

    async fn set_language(&mut self, language: &str) -> Result<(), SqlConduitError> {
        self.run(&format!("SET LANGUAGE {};", quote_literal(language)))
            .await
    }

    async fn reset(&mut self) -> Result<(), SqlConduitError> {
        let sql = format!(
            "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION; \
             SET TRANSACTION ISOLATION LEVEL READ COMMITTED; \
             SET LANGUAGE {};",
            quote_literal(&self.login_language)
        );
        self.run(&sql).await
    }

    async fn ping(&mut self) -> Result<(), SqlConduitError> {
        self.run("SELECT 1;").await
    }

    async fn close(&mut self) -> Result<(), SqlConduitError> {
        // The socket is shut when the client is dropped.
        debug!(spid = self.spid, "closing SQL Server session");
        Ok(())
    }
}

#[derive(Default)]
enum Current {
    #[default]
    Idle,
    Rows(u64),
    RowCount,
    Outputs(Vec<String>),
}

/// Turns `tiberius` query items into wire events, hiding the marker results.
#[derive(Default)]
struct Reader {
    queue: VecDeque<Result<WireEvent, SqlConduitError>>,
    current: Current,
    total_rows: u64,
    rowcount: Option<u64>,
    ended: bool,
}

impl Reader {
    fn accept(&mut self, item: QueryItem) {
        match item {
            QueryItem::Metadata(meta) => {
                self.close_result();
                let columns = meta.columns();
                self.current = match columns.first().map(tiberius::Column::name) {
                    Some(ROWCOUNT_MARKER) => Current::RowCount,
                    Some(OUTPUT_MARKER) => Current::Outputs(
                        columns[1..].iter().map(|c| c.name().to_string()).collect(),
                    ),
                    _ => {
                        let headers = columns.iter().map(values::header).collect();
                        self.queue.push_back(Ok(WireEvent::Header(headers)));
                        Current::Rows(0)
                    }
                };
            }
            QueryItem::Row(row) => {
                let decoded: Result<Vec<RowValues>, _> =
                    row.into_iter().map(values::row_value).collect();
                let values = match decoded {
                    Ok(values) => values,
                    Err(err) => return self.fail(err),
                };
                match &mut self.current {
                    Current::Rows(count) => {
                        *count += 1;
                        self.queue.push_back(Ok(WireEvent::Row(values)));
                    }
                    Current::RowCount => {
                        if let Some(RowValues::Int(n)) = values.first() {
                            self.rowcount = u64::try_from(*n).ok();
                        }
                    }
                    Current::Outputs(names) => {
                        let outputs = names
                            .drain(..)
                            .zip(values.into_iter().skip(1))
                            .collect();
                        self.queue.push_back(Ok(WireEvent::Output(outputs)));
                    }
                    Current::Idle => {}
                }
            }
        }
    }

    fn close_result(&mut self) {
        if let Current::Rows(count) = std::mem::take(&mut self.current) {
            self.total_rows += count;
            self.queue.push_back(Ok(WireEvent::ResultEnd {
                rows_affected: Some(count),
            }));
        }
    }

    fn finish(&mut self) {
        self.close_result();
        self.queue.push_back(Ok(WireEvent::Done {
            rows_affected: self.rowcount.unwrap_or(self.total_rows),
        }));
        self.ended = true;
    }

    fn fail(&mut self, err: SqlConduitError) {
        self.queue.push_back(Err(err));
        self.ended = true;
    }
}
