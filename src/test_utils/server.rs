use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ClientOptions;
use crate::driver::{Command, Connector, Param, WireEvent};
use crate::error::SqlConduitError;
use crate::pool::PoolRegistry;
use crate::results::ColumnHeader;
use crate::types::{IsolationLevel, RowValues, SqlType};

use super::connection::ScriptedConnector;

/// Login default language of every scripted session.
pub const DEFAULT_LANGUAGE: &str = "us_english";

/// Built-in batch answering with the session's transaction count, isolation level and language.
pub const SESSION_PROBE: &str = "SELECT @@TRANCOUNT, @@ISOLATION, @@LANGUAGE";

/// One step of a scripted batch, run by the server at its own pace.
#[derive(Debug, Clone)]
pub enum Step {
    /// Marks the start of a statement; its start time is recorded under the label.
    Statement(String),
    /// A complete result: header, rows (with an optional pause before each), end.
    Result {
        columns: Vec<ColumnHeader>,
        rows: Vec<Vec<RowValues>>,
        row_delay: Duration,
    },
    /// A statement without a result set.
    RowsAffected(u64),
    /// Informational message flushed to the client.
    Progress(String),
    Sleep(Duration),
    Output(Vec<(String, RowValues)>),
    /// One result with a column per input parameter, holding the values as the server stored
    /// them.
    EchoParams,
    /// The session state, as answered by [`SESSION_PROBE`].
    SessionState,
    Fail { number: i32, message: String },
}

impl Step {
    #[must_use]
    pub fn result(columns: &[(&str, SqlType)], rows: Vec<Vec<RowValues>>) -> Self {
        Step::Result {
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnHeader::new(*name, ty.clone()))
                .collect(),
            rows,
            row_delay: Duration::ZERO,
        }
    }

    /// Single `INT` column named `name` holding `values`.
    #[must_use]
    pub fn numbers(name: &str, values: impl IntoIterator<Item = i64>) -> Self {
        Step::result(
            &[(name, SqlType::Int)],
            values.into_iter().map(|v| vec![RowValues::Int(v)]).collect(),
        )
    }

    /// Pause before each row of a [`Step::Result`].
    #[must_use]
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        if let Step::Result { row_delay, .. } = &mut self {
            *row_delay = delay;
        }
        self
    }

    #[must_use]
    pub fn fail(number: i32, message: impl Into<String>) -> Self {
        Step::Fail {
            number,
            message: message.into(),
        }
    }
}

/// What the server knows about one executed batch.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    pub key: String,
    pub session: u64,
    pub started: Instant,
    pub finished: Option<Instant>,
    pub aborted: bool,
}

impl BatchRecord {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.finished.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: u64,
    pub trancount: u32,
    pub isolation: IsolationLevel,
    pub language: String,
    /// Cleared when an abort killed the session.
    pub alive: bool,
    pub closed: bool,
}

struct SessionSlot {
    state: SessionSnapshot,
    current: Option<CancellationToken>,
}

#[derive(Default)]
pub(super) struct ServerInner {
    scripts: Mutex<HashMap<String, Vec<Step>>>,
    sessions: Mutex<HashMap<u64, SessionSlot>>,
    batches: Mutex<Vec<BatchRecord>>,
    statements: Mutex<Vec<(String, Instant)>>,
    next_session: AtomicU64,
    connects: AtomicUsize,
    aborts: AtomicUsize,
    resets: AtomicUsize,
    refuse_connections: AtomicBool,
    abort_kills_session: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("scripted server lock poisoned")
}

/// Normalized lookup key for a command.
#[must_use]
pub fn script_key(command: &Command) -> String {
    match command {
        Command::Text { sql, .. } => sql
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
        Command::Procedure { name, .. } => format!("exec {}", name.to_lowercase()),
    }
}

/// In-process stand-in for a database server, driven by scripts.
///
/// Each batch runs on its own task and keeps running when the client stops reading, exactly like
/// a real server; only an abort through the connection's [`AbortHandle`](crate::driver::AbortHandle)
/// stops it early.
#[derive(Clone, Default)]
pub struct ScriptedServer {
    inner: Arc<ServerInner>,
}

impl ScriptedServer {
    #[must_use]
    pub fn new() -> Self {
        let server = Self::default();
        server.script(SESSION_PROBE, vec![Step::SessionState]);
        server
    }

    /// Register the steps run for a text batch (matched ignoring case and whitespace).
    pub fn script(&self, sql: &str, steps: Vec<Step>) {
        let key = script_key(&Command::text(sql));
        lock(&self.inner.scripts).insert(key, steps);
    }

    /// Register the steps run for a stored procedure call.
    pub fn procedure(&self, name: &str, steps: Vec<Step>) {
        let key = script_key(&Command::procedure(name));
        lock(&self.inner.scripts).insert(key, steps);
    }

    #[must_use]
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(ScriptedConnector::new(self.clone()))
    }

    #[must_use]
    pub fn registry(&self) -> Arc<PoolRegistry> {
        Arc::new(PoolRegistry::new(self.connector()))
    }

    /// Options pointing at this server with short timeouts.
    #[must_use]
    pub fn options() -> ClientOptions {
        ClientOptions {
            server: "scripted".into(),
            database: "conduit_test".into(),
            user: "tester".into(),
            password: "secret".into(),
            max_pool_size: 4,
            connect_timeout: Duration::from_secs(2),
            command_timeout: Some(Duration::from_secs(10)),
            ..ClientOptions::default()
        }
    }

    /// Every batch run for `sql`, oldest first.
    #[must_use]
    pub fn batches(&self, sql: &str) -> Vec<BatchRecord> {
        let key = script_key(&Command::text(sql));
        self.batches_by_key(&key)
    }

    #[must_use]
    pub fn procedure_batches(&self, name: &str) -> Vec<BatchRecord> {
        self.batches_by_key(&script_key(&Command::procedure(name)))
    }

    fn batches_by_key(&self, key: &str) -> Vec<BatchRecord> {
        lock(&self.inner.batches)
            .iter()
            .filter(|b| b.key == key)
            .cloned()
            .collect()
    }

    /// Whether any batch for `sql` is still executing.
    #[must_use]
    pub fn is_running(&self, sql: &str) -> bool {
        self.batches(sql).iter().any(BatchRecord::is_running)
    }

    #[must_use]
    pub fn running_batches(&self) -> usize {
        lock(&self.inner.batches)
            .iter()
            .filter(|b| b.is_running())
            .count()
    }

    /// Poll until no batch for `sql` is running; `false` if `within` elapsed first.
    pub async fn wait_until_stopped(&self, sql: &str, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.is_running(sql) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// When the statement labelled `label` last started.
    #[must_use]
    pub fn statement_started(&self, label: &str) -> Option<Instant> {
        lock(&self.inner.statements)
            .iter()
            .rev()
            .find(|(l, _)| l == label)
            .map(|(_, at)| *at)
    }

    #[must_use]
    pub fn aborts(&self) -> usize {
        self.inner.aborts.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn resets(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = lock(&self.inner.sessions)
            .values()
            .map(|slot| slot.state.clone())
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make an abort kill the whole session, as `KILL <spid>` does.
    pub fn abort_kills_session(&self, kills: bool) {
        self.inner.abort_kills_session.store(kills, Ordering::SeqCst);
    }

    pub(super) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }
}

impl ServerInner {
    pub(super) fn open_session(&self) -> Result<u64, SqlConduitError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(SqlConduitError::ConnectionError(
                "scripted server refused the connection".into(),
            ));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.sessions).insert(
            id,
            SessionSlot {
                state: SessionSnapshot {
                    id,
                    trancount: 0,
                    isolation: IsolationLevel::default(),
                    language: DEFAULT_LANGUAGE.into(),
                    alive: true,
                    closed: false,
                },
                current: None,
            },
        );
        Ok(id)
    }

    /// Run `f` against a live session.
    pub(super) fn with_session<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut SessionSnapshot) -> Result<R, SqlConduitError>,
    ) -> Result<R, SqlConduitError> {
        let mut sessions = lock(&self.sessions);
        match sessions.get_mut(&id) {
            Some(slot) if slot.state.alive && !slot.state.closed => f(&mut slot.state),
            _ => Err(SqlConduitError::ConnectionError(format!(
                "session {id} is no longer connected"
            ))),
        }
    }

    pub(super) fn reset_session(&self, id: u64) -> Result<(), SqlConduitError> {
        self.with_session(id, |s| {
            s.trancount = 0;
            s.isolation = IsolationLevel::default();
            s.language = DEFAULT_LANGUAGE.into();
            Ok(())
        })?;
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub(super) fn close_session(&self, id: u64) {
        if let Some(slot) = lock(&self.sessions).get_mut(&id) {
            slot.state.closed = true;
        }
    }

    pub(super) fn abort(&self, id: u64) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        let kills = self.abort_kills_session.load(Ordering::SeqCst);
        if let Some(slot) = lock(&self.sessions).get_mut(&id) {
            if let Some(token) = slot.current.take() {
                token.cancel();
            }
            if kills {
                slot.state.alive = false;
            }
        }
    }

    /// Start running `command` for session `id`; events arrive on the returned channel as the
    /// server produces them, regardless of how fast they are read.
    pub(super) fn start_batch(
        self: &Arc<Self>,
        id: u64,
        command: &Command,
    ) -> mpsc::UnboundedReceiver<Result<WireEvent, SqlConduitError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = script_key(command);
        let token = CancellationToken::new();
        let alive = self.with_session(id, |_| Ok(())).is_ok();
        if !alive {
            let _ = tx.send(Err(SqlConduitError::ConnectionError(format!(
                "session {id} is no longer connected"
            ))));
            return rx;
        }
        if let Some(slot) = lock(&self.sessions).get_mut(&id) {
            slot.current = Some(token.clone());
        }
        let steps = lock(&self.scripts).get(&key).cloned();
        let batch = {
            let mut batches = lock(&self.batches);
            batches.push(BatchRecord {
                key: key.clone(),
                session: id,
                started: Instant::now(),
                finished: None,
                aborted: false,
            });
            batches.len() - 1
        };
        let server = Arc::clone(self);
        let params = command.params().to_vec();
        tokio::spawn(async move {
            let aborted = match steps {
                Some(steps) => server.run(id, steps, &params, &tx, &token).await,
                None => {
                    let _ = tx.send(Err(SqlConduitError::CommandError {
                        number: Some(2812),
                        message: format!("Could not find a script for '{key}'."),
                    }));
                    false
                }
            };
            let mut batches = lock(&server.batches);
            if let Some(record) = batches.get_mut(batch) {
                record.finished = Some(Instant::now());
                record.aborted = aborted;
            }
        });
        rx
    }

    /// Returns `true` when the batch was aborted.
    async fn run(
        &self,
        id: u64,
        steps: Vec<Step>,
        params: &[Param],
        tx: &mpsc::UnboundedSender<Result<WireEvent, SqlConduitError>>,
        token: &CancellationToken,
    ) -> bool {
        // Sends are allowed to fail: a server keeps going when the client stops listening.
        let emit = |event: WireEvent| {
            let _ = tx.send(Ok(event));
        };
        let mut total = 0_u64;
        for step in steps {
            if token.is_cancelled() {
                return true;
            }
            match step {
                Step::Statement(label) => {
                    lock(&self.statements).push((label, Instant::now()));
                }
                Step::Result {
                    columns,
                    rows,
                    row_delay,
                } => {
                    emit(WireEvent::Header(columns));
                    let count = rows.len() as u64;
                    for row in rows {
                        if !row_delay.is_zero() && pause(row_delay, token).await {
                            return true;
                        }
                        emit(WireEvent::Row(row));
                    }
                    total += count;
                    emit(WireEvent::ResultEnd {
                        rows_affected: Some(count),
                    });
                }
                Step::RowsAffected(n) => {
                    total += n;
                    emit(WireEvent::ResultEnd {
                        rows_affected: Some(n),
                    });
                }
                Step::Progress(message) => emit(WireEvent::Progress(message)),
                Step::Sleep(duration) => {
                    if pause(duration, token).await {
                        return true;
                    }
                }
                Step::Output(values) => emit(WireEvent::Output(values)),
                Step::EchoParams => {
                    let language = self
                        .with_session(id, |s| Ok(s.language.clone()))
                        .unwrap_or_else(|_| DEFAULT_LANGUAGE.into());
                    let (columns, values) = echo(params, &language);
                    emit(WireEvent::Header(columns));
                    emit(WireEvent::Row(values));
                    emit(WireEvent::ResultEnd {
                        rows_affected: Some(1),
                    });
                }
                Step::SessionState => {
                    let Ok(state) = self.with_session(id, |s| Ok(s.clone())) else {
                        return true;
                    };
                    emit(WireEvent::Header(vec![
                        ColumnHeader::new("trancount", SqlType::Int),
                        ColumnHeader::new("isolation", SqlType::Text),
                        ColumnHeader::new("language", SqlType::Text),
                    ]));
                    emit(WireEvent::Row(vec![
                        RowValues::Int(i64::from(state.trancount)),
                        RowValues::Text(state.isolation.as_sql().into()),
                        RowValues::Text(state.language),
                    ]));
                    emit(WireEvent::ResultEnd {
                        rows_affected: Some(1),
                    });
                }
                Step::Fail { number, message } => {
                    let _ = tx.send(Err(SqlConduitError::CommandError {
                        number: Some(number),
                        message,
                    }));
                    return false;
                }
            }
        }
        emit(WireEvent::Done {
            rows_affected: total,
        });
        if let Some(slot) = lock(&self.sessions).get_mut(&id) {
            slot.current = None;
        }
        false
    }
}

/// Sleep for `duration`; `true` if the batch was aborted meanwhile.
async fn pause(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => false,
        () = token.cancelled() => true,
    }
}

/// Store parameters the way a server would. Typed values are kept as they are; text sent for a
/// date/time column is interpreted with the session language's date order, which is what makes
/// string-formatted dates unsafe.
fn echo(params: &[Param], language: &str) -> (Vec<ColumnHeader>, Vec<RowValues>) {
    let mut columns = Vec::with_capacity(params.len());
    let mut values = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let name = param
            .bare_name()
            .map_or_else(|| format!("p{}", i + 1), str::to_string);
        columns.push(ColumnHeader::new(name, param.sql_type.clone()));
        let stored = match (&param.value, &param.sql_type) {
            (RowValues::Text(text), SqlType::Date | SqlType::Timestamp) => {
                localized_date(text, language).map_or(RowValues::Null, RowValues::Timestamp)
            }
            (value, _) => value.clone(),
        };
        values.push(stored);
    }
    (columns, values)
}

fn localized_date(text: &str, language: &str) -> Option<chrono::NaiveDateTime> {
    let date_part = text.split_whitespace().next()?;
    let format = if language.eq_ignore_ascii_case(DEFAULT_LANGUAGE) {
        "%m/%d/%Y"
    } else {
        "%d/%m/%Y"
    };
    chrono::NaiveDate::parse_from_str(date_part, format)
        .ok()?
        .and_hms_opt(0, 0, 0)
}
