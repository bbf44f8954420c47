//! Identity collector: users, groups, sudoers and digests of the account
//! databases.

pub mod db;
mod diff;
mod model;
mod parser;
mod source;

pub use diff::make_diff;
pub use model::{Group, IdentitySnapshot, Sudoer, User};
pub use parser::{
    GroupEntry, PasswdEntry, SudoersGrants, parse_group, parse_group_line, parse_passwd,
    parse_sudoer_line, parse_sudoers, parse_user_line,
};
pub use source::{EtcSource, IdentitySource, ScriptSource};

use std::any::Any;
use std::sync::Arc;
use std::thread;

use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::codec::{CodecError, Reader};
use crate::collector::{CollectError, Collector, CollectorKind, CollectorState};

pub struct IdentityCollector {
    source: Arc<dyn IdentitySource>,
    state: CollectorState,
    snapshot: IdentitySnapshot,
    result: Vec<u8>,
    errors: Vec<CollectError>,
}

impl IdentityCollector {
    /// Collector over the host's `/etc` account databases.
    pub fn new() -> Self {
        Self::with_source(Arc::new(EtcSource::new()))
    }

    pub fn with_source(source: Arc<dyn IdentitySource>) -> Self {
        Self {
            source,
            state: CollectorState::Idle,
            snapshot: IdentitySnapshot::default(),
            result: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Finished collector holding an already gathered snapshot.
    pub fn from_snapshot(snapshot: IdentitySnapshot) -> Result<Self, CodecError> {
        let mut collector = Self::new();
        snapshot.encode(&mut collector.result)?;
        collector.snapshot = snapshot;
        collector.state = CollectorState::Finished;
        Ok(collector)
    }

    pub fn snapshot(&self) -> &IdentitySnapshot {
        &self.snapshot
    }
}

impl Default for IdentityCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Unwraps one worker outcome; failures leave the category empty.
fn settle<T: Default>(
    category: &str,
    outcome: thread::Result<Result<T, CollectError>>,
    errors: &mut Vec<CollectError>,
) -> T {
    match outcome {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => {
            warn!(category, error = %e, "identity worker failed");
            errors.push(e);
            T::default()
        }
        Err(_) => {
            error!(category, "identity worker panicked");
            errors.push(CollectError::WorkerPanicked(category.to_string()));
            T::default()
        }
    }
}

impl Collector for IdentityCollector {
    fn kind(&self) -> CollectorKind {
        CollectorKind::Users
    }

    fn state(&self) -> CollectorState {
        self.state
    }

    /// Gathers each category on its own worker thread and joins them all.
    fn run(&mut self) {
        self.state = CollectorState::Running;
        let source: &dyn IdentitySource = self.source.as_ref();

        let (users, groups, sudoers, passwd_digest, group_digest) = thread::scope(|scope| {
            let users = scope.spawn(|| source.users());
            let groups = scope.spawn(|| source.groups());
            let sudoers = scope.spawn(|| source.sudoers());
            let passwd_digest = scope.spawn(|| source.passwd_digest());
            let group_digest = scope.spawn(|| source.group_digest());
            (
                users.join(),
                groups.join(),
                sudoers.join(),
                passwd_digest.join(),
                group_digest.join(),
            )
        });

        let mut errors = Vec::new();
        let snapshot = IdentitySnapshot {
            users: settle("users", users, &mut errors),
            groups: settle("groups", groups, &mut errors),
            sudoers: settle("sudoers", sudoers, &mut errors),
            passwd_digest: settle("passwd digest", passwd_digest, &mut errors),
            group_digest: settle("group digest", group_digest, &mut errors),
        };

        self.result.clear();
        if let Err(e) = snapshot.encode(&mut self.result) {
            error!(error = %e, "cannot encode identity result");
            self.result.clear();
            errors.push(e.into());
        }

        info!(
            users = snapshot.users.len(),
            groups = snapshot.groups.len(),
            sudoers = snapshot.sudoers.len(),
            errors = errors.len(),
            "identity collection finished"
        );
        self.snapshot = snapshot;
        self.errors = errors;
        self.state = CollectorState::Finished;
    }

    fn result(&self) -> &[u8] {
        &self.result
    }

    fn errors(&self) -> &[CollectError] {
        &self.errors
    }

    fn import_bin(&mut self, payload: &[u8]) -> Result<(), CodecError> {
        let mut reader = Reader::new(payload);
        let snapshot = IdentitySnapshot::decode(&mut reader)?;
        if !reader.is_empty() {
            return Err(CodecError::Invalid(format!(
                "{} trailing bytes after identity payload",
                reader.remaining().len()
            )));
        }
        self.snapshot = snapshot;
        self.result = payload.to_vec();
        self.state = CollectorState::Finished;
        Ok(())
    }

    fn export_db(&self, conn: &Connection, run_id: &str) -> rusqlite::Result<()> {
        db::export_snapshot(conn, run_id, &self.snapshot)
    }

    fn import_db(&mut self, conn: &Connection, run_id: &str) -> rusqlite::Result<()> {
        let snapshot = db::import_snapshot(conn, run_id)?;
        let mut result = Vec::new();
        snapshot
            .encode(&mut result)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.snapshot = snapshot;
        self.result = result;
        self.state = CollectorState::Finished;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
