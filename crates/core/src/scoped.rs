//! Synchronous scoped resources.
//!
//! A scoped resource is acquired, handed to a block of work, and released
//! exactly once whatever the block does. Transactional resources commit when
//! the block succeeds and roll back when it fails (or unwinds) before they
//! are closed.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while acquiring, using, or releasing a scoped resource.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("invalid open mode: {0:?}")]
    InvalidMode(String),
    #[error("resource already closed")]
    Closed,
}

/// A handle that must be released once its scope ends.
pub trait Resource {
    type Error: fmt::Display;

    /// Releases the handle. Calling it again after a successful close is a no-op.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// A resource whose work is finalized by commit or discarded by rollback.
pub trait Transactional: Resource {
    fn commit(&mut self) -> Result<(), Self::Error>;
    fn rollback(&mut self) -> Result<(), Self::Error>;
}

/// Owns the resource for the duration of the block and runs `on_unwind` if
/// the block panics before the scope is disarmed.
struct Scope<R, F>
where
    F: FnMut(&mut R),
{
    resource: R,
    armed: bool,
    on_unwind: F,
}

impl<R, F> Scope<R, F>
where
    F: FnMut(&mut R),
{
    fn new(resource: R, on_unwind: F) -> Self {
        Self {
            resource,
            armed: true,
            on_unwind,
        }
    }
}

impl<R, F> Drop for Scope<R, F>
where
    F: FnMut(&mut R),
{
    fn drop(&mut self) {
        if self.armed {
            (self.on_unwind)(&mut self.resource);
        }
    }
}

/// Acquires a resource, runs `block` with it, and closes it on every exit path.
///
/// If the block fails, its error is returned unchanged; a close failure on
/// that path is only logged. If acquisition fails, nothing is closed.
///
/// # Examples
///
/// ```
/// use wrapkit_core::scoped::{with_resource, OpenMode, ResourceError, ScopedFile};
/// use std::io::Write;
///
/// let path = std::env::temp_dir().join(format!("wrapkit-doc-{}.txt", std::process::id()));
/// let written: Result<usize, ResourceError> = with_resource(
///     || ScopedFile::open(&path, OpenMode::Write),
///     |file| Ok(file.write(b"hello")?),
/// );
/// assert_eq!(written.unwrap(), 5);
/// # std::fs::remove_file(&path).unwrap();
/// ```
pub fn with_resource<R, T, E, A, F>(acquire: A, block: F) -> Result<T, E>
where
    R: Resource,
    E: From<R::Error>,
    A: FnOnce() -> Result<R, R::Error>,
    F: FnOnce(&mut R) -> Result<T, E>,
{
    let resource = acquire()?;
    let mut scope = Scope::new(resource, |resource: &mut R| {
        if let Err(err) = resource.close() {
            tracing::warn!(error = %err, "close failed while unwinding scoped block");
        }
    });

    let outcome = block(&mut scope.resource);
    scope.armed = false;

    let closed = scope.resource.close();
    match outcome {
        Ok(value) => {
            closed?;
            Ok(value)
        }
        Err(err) => {
            if let Err(close_err) = closed {
                tracing::warn!(error = %close_err, "close failed after scoped block error");
            }
            Err(err)
        }
    }
}

/// Acquires a transactional resource and runs `block` inside its transaction.
///
/// On success the resource is committed then closed. On failure it is rolled
/// back then closed and the block's own error is returned. A failed commit is
/// rolled back, the resource closed, and the commit error surfaced.
pub fn with_transaction<R, T, E, A, F>(acquire: A, block: F) -> Result<T, E>
where
    R: Transactional,
    E: From<R::Error>,
    A: FnOnce() -> Result<R, R::Error>,
    F: FnOnce(&mut R) -> Result<T, E>,
{
    let resource = acquire()?;
    let mut scope = Scope::new(resource, |resource: &mut R| {
        tracing::warn!("scoped block panicked; rolling back");
        discard(resource);
    });

    let outcome = block(&mut scope.resource);
    scope.armed = false;

    let resource = &mut scope.resource;
    match outcome {
        Ok(value) => match resource.commit() {
            Ok(()) => {
                resource.close()?;
                Ok(value)
            }
            Err(commit_err) => {
                tracing::warn!(error = %commit_err, "commit failed; rolling back");
                discard(resource);
                Err(commit_err.into())
            }
        },
        Err(err) => {
            tracing::warn!("scoped block failed; rolling back");
            discard(resource);
            Err(err)
        }
    }
}

fn discard<R: Transactional>(resource: &mut R) {
    if let Err(err) = resource.rollback() {
        tracing::warn!(error = %err, "rollback failed");
    }
    if let Err(err) = resource.close() {
        tracing::warn!(error = %err, "close failed after rollback");
    }
}

/// How a [`ScopedFile`] is opened, parsed from the familiar mode strings.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpenMode {
    /// `r`
    Read,
    /// `w`: create or truncate.
    Write,
    /// `a`: create, writes go to the end.
    Append,
    /// `r+`
    ReadWrite,
    /// `w+`
    WriteRead,
    /// `a+`
    AppendRead,
}

impl OpenMode {
    fn options(self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        match self {
            OpenMode::Read => opts.read(true),
            OpenMode::Write => opts.write(true).create(true).truncate(true),
            OpenMode::Append => opts.append(true).create(true),
            OpenMode::ReadWrite => opts.read(true).write(true),
            OpenMode::WriteRead => opts.read(true).write(true).create(true).truncate(true),
            OpenMode::AppendRead => opts.read(true).append(true).create(true),
        };
        opts
    }

    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

impl FromStr for OpenMode {
    type Err = ResourceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().trim_end_matches('b') {
            "r" => Ok(OpenMode::Read),
            "w" => Ok(OpenMode::Write),
            "a" => Ok(OpenMode::Append),
            "r+" => Ok(OpenMode::ReadWrite),
            "w+" => Ok(OpenMode::WriteRead),
            "a+" => Ok(OpenMode::AppendRead),
            _ => Err(ResourceError::InvalidMode(raw.to_string())),
        }
    }
}

/// A plain file handle with no transactional semantics.
#[derive(Debug)]
pub struct ScopedFile {
    path: PathBuf,
    mode: OpenMode,
    file: Option<File>,
}

impl ScopedFile {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, ResourceError> {
        let path = path.as_ref().to_path_buf();
        let file = mode.options().open(&path)?;
        tracing::debug!(path = %path.display(), ?mode, "file opened");
        Ok(Self {
            path,
            mode,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn handle(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("file is closed"))
    }
}

impl Read for ScopedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.handle()?.read(buf)
    }
}

impl Write for ScopedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.handle()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.handle()?.flush()
    }
}

impl Resource for ScopedFile {
    type Error = ResourceError;

    fn close(&mut self) -> Result<(), ResourceError> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            tracing::debug!(path = %self.path.display(), "file closed");
        }
        Ok(())
    }
}

/// Opens `path` with a mode string (`"r"`, `"w"`, `"a"`, `"r+"`, ...), runs
/// `block`, and closes the file on every exit path.
pub fn with_file<T, E, F>(path: impl AsRef<Path>, mode: &str, block: F) -> Result<T, E>
where
    E: From<ResourceError>,
    F: FnOnce(&mut ScopedFile) -> Result<T, E>,
{
    let mode: OpenMode = mode.parse()?;
    with_resource(|| ScopedFile::open(path, mode), block)
}

/// SQLite connection that holds an open transaction until commit or rollback.
#[cfg(feature = "sqlite")]
#[derive(Debug)]
pub struct SqliteConnection {
    path: PathBuf,
    conn: Option<rusqlite::Connection>,
    in_transaction: bool,
}

#[cfg(feature = "sqlite")]
impl SqliteConnection {
    /// Opens the database at `path` and begins a transaction.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ResourceError> {
        let path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&path)?;
        conn.execute_batch("BEGIN")?;
        tracing::debug!(path = %path.display(), "database opened");
        Ok(Self {
            path,
            conn: Some(conn),
            in_transaction: true,
        })
    }

    pub fn connection(&self) -> Result<&rusqlite::Connection, ResourceError> {
        self.conn.as_ref().ok_or(ResourceError::Closed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

#[cfg(feature = "sqlite")]
impl Resource for SqliteConnection {
    type Error = ResourceError;

    fn close(&mut self) -> Result<(), ResourceError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, err)| err)?;
            tracing::debug!(path = %self.path.display(), "database closed");
        }
        Ok(())
    }
}

#[cfg(feature = "sqlite")]
impl Transactional for SqliteConnection {
    fn commit(&mut self) -> Result<(), ResourceError> {
        self.connection()?.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), ResourceError> {
        if self.in_transaction {
            self.connection()?.execute_batch("ROLLBACK")?;
            self.in_transaction = false;
        }
        Ok(())
    }
}

/// Runs `block` inside a transaction on the SQLite database at `path`.
///
/// # Examples
///
/// ```
/// use wrapkit_core::scoped::{with_database, ResourceError};
///
/// let path = std::env::temp_dir().join(format!("wrapkit-doc-{}.db", std::process::id()));
/// let inserted: Result<usize, ResourceError> = with_database(&path, |conn| {
///     conn.execute("CREATE TABLE IF NOT EXISTS t (v INTEGER)", [])?;
///     Ok(conn.execute("INSERT INTO t (v) VALUES (1)", [])?)
/// });
/// assert_eq!(inserted.unwrap(), 1);
/// # std::fs::remove_file(&path).unwrap();
/// ```
#[cfg(feature = "sqlite")]
pub fn with_database<T, E, F>(path: impl AsRef<Path>, block: F) -> Result<T, E>
where
    E: From<ResourceError>,
    F: FnOnce(&rusqlite::Connection) -> Result<T, E>,
{
    with_transaction(
        || SqliteConnection::open(path),
        |db| {
            let conn = db.connection()?;
            block(conn)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Block(&'static str),
        Resource(String),
    }

    impl From<String> for TestError {
        fn from(err: String) -> Self {
            TestError::Resource(err)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<&'static str>>>,
        fail_commit: bool,
        closed: bool,
    }

    impl Resource for Recorder {
        type Error = String;

        fn close(&mut self) -> Result<(), String> {
            if !self.closed {
                self.closed = true;
                self.events.borrow_mut().push("close");
            }
            Ok(())
        }
    }

    impl Transactional for Recorder {
        fn commit(&mut self) -> Result<(), String> {
            self.events.borrow_mut().push("commit");
            if self.fail_commit {
                return Err("commit refused".to_string());
            }
            Ok(())
        }

        fn rollback(&mut self) -> Result<(), String> {
            self.events.borrow_mut().push("rollback");
            Ok(())
        }
    }

    fn recorder(events: &Rc<RefCell<Vec<&'static str>>>) -> Recorder {
        Recorder {
            events: Rc::clone(events),
            ..Recorder::default()
        }
    }

    fn temp_path(ext: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "wrapkit-scoped-{}-{nanos}.{ext}",
            std::process::id()
        ))
    }

    #[test]
    fn transaction_commits_before_close_on_success() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let out: Result<u32, TestError> =
            with_transaction(|| Ok(recorder(&events)), |_| Ok(42));
        assert_eq!(out, Ok(42));
        assert_eq!(*events.borrow(), vec!["commit", "close"]);
    }

    #[test]
    fn transaction_rolls_back_and_reraises_block_error() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let out: Result<u32, TestError> = with_transaction(
            || Ok(recorder(&events)),
            |_| Err(TestError::Block("insert failed")),
        );
        assert_eq!(out, Err(TestError::Block("insert failed")));
        assert_eq!(*events.borrow(), vec!["rollback", "close"]);
    }

    #[test]
    fn failed_commit_rolls_back_and_surfaces() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let out: Result<u32, TestError> = with_transaction(
            || {
                Ok(Recorder {
                    fail_commit: true,
                    ..recorder(&events)
                })
            },
            |_| Ok(1),
        );
        assert_eq!(out, Err(TestError::Resource("commit refused".to_string())));
        assert_eq!(*events.borrow(), vec!["commit", "rollback", "close"]);
    }

    #[test]
    fn acquisition_failure_skips_release() {
        let mut ran = false;
        let out: Result<(), TestError> = with_transaction(
            || Err::<Recorder, _>("no such database".to_string()),
            |_| {
                ran = true;
                Ok(())
            },
        );
        assert_eq!(out, Err(TestError::Resource("no such database".to_string())));
        assert!(!ran);
    }

    #[test]
    fn panicking_block_still_rolls_back_and_closes() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), TestError> =
                with_transaction(|| Ok(recorder(&events)), |_| panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(*events.borrow(), vec!["rollback", "close"]);
    }

    #[test]
    fn plain_resource_closes_once_on_either_path() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let ok: Result<(), TestError> = with_resource(|| Ok(recorder(&events)), |_| Ok(()));
        assert!(ok.is_ok());
        let err: Result<(), TestError> = with_resource(
            || Ok(recorder(&events)),
            |r| {
                r.close()?;
                Err(TestError::Block("read failed"))
            },
        );
        assert_eq!(err, Err(TestError::Block("read failed")));
        assert_eq!(*events.borrow(), vec!["close", "close"]);
    }

    #[test]
    fn open_mode_parses_mode_strings() {
        assert_eq!("r".parse::<OpenMode>().expect("r"), OpenMode::Read);
        assert_eq!("wb".parse::<OpenMode>().expect("wb"), OpenMode::Write);
        assert_eq!("a+".parse::<OpenMode>().expect("a+"), OpenMode::AppendRead);
        assert!(matches!(
            "x".parse::<OpenMode>(),
            Err(ResourceError::InvalidMode(m)) if m == "x"
        ));
    }

    #[test]
    fn scoped_file_close_is_idempotent() {
        let path = temp_path("txt");
        let mut file = ScopedFile::open(&path, OpenMode::Write).expect("open");
        file.write_all(b"data").expect("write");
        file.close().expect("first close");
        assert!(file.is_closed());
        file.close().expect("second close is a no-op");
        assert!(file.write(b"more").is_err());
        fs_cleanup(&path);
    }

    #[test]
    fn with_file_writes_then_reads_back() {
        let path = temp_path("txt");
        with_file::<_, ResourceError, _>(&path, "w", |file| {
            file.write_all(b"hello scoped file")?;
            Ok(())
        })
        .expect("write scope");

        let text = with_file::<_, ResourceError, _>(&path, "r", |file| {
            let mut text = String::new();
            file.read_to_string(&mut text)?;
            Ok(text)
        })
        .expect("read scope");
        assert_eq!(text, "hello scoped file");
        fs_cleanup(&path);
    }

    #[test]
    fn with_file_propagates_block_error() {
        let path = temp_path("txt");
        let out = with_file::<(), ResourceError, _>(&path, "a", |file| {
            file.write_all(b"partial")?;
            Err::<(), _>(ResourceError::Closed)
        });
        assert!(matches!(out, Err(ResourceError::Closed)));
        let content = std::fs::read_to_string(&path).expect("file flushed on close");
        assert_eq!(content, "partial");
        fs_cleanup(&path);
    }

    #[test]
    fn with_file_rejects_bad_mode_without_running_block() {
        let mut ran = false;
        let out = with_file::<(), ResourceError, _>(temp_path("txt"), "rw", |_| {
            ran = true;
            Ok(())
        });
        assert!(matches!(out, Err(ResourceError::InvalidMode(_))));
        assert!(!ran);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn database_commits_on_success_and_rolls_back_on_error() {
        let path = temp_path("db");
        with_database::<_, ResourceError, _>(&path, |conn| {
            conn.execute("CREATE TABLE notes (body TEXT NOT NULL)", [])?;
            conn.execute("INSERT INTO notes (body) VALUES ('kept')", [])?;
            Ok(())
        })
        .expect("first scope commits");

        let failed = with_database::<(), ResourceError, _>(&path, |conn| {
            conn.execute("INSERT INTO notes (body) VALUES ('discarded')", [])?;
            Err::<(), _>(ResourceError::InvalidMode("forced".to_string()))
        });
        assert!(matches!(failed, Err(ResourceError::InvalidMode(_))));

        let bodies = with_database::<_, ResourceError, _>(&path, |conn| {
            let mut stmt = conn.prepare("SELECT body FROM notes")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .expect("read scope");
        assert_eq!(bodies, vec!["kept".to_string()]);
        fs_cleanup(&path);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_connection_reports_closed() {
        let path = temp_path("db");
        let mut db = SqliteConnection::open(&path).expect("open");
        assert!(!db.is_closed());
        db.commit().expect("commit");
        db.close().expect("close");
        assert!(db.is_closed());
        assert!(matches!(db.connection(), Err(ResourceError::Closed)));
        db.close().expect("second close is a no-op");
        fs_cleanup(&path);
    }

    fn fs_cleanup(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}
