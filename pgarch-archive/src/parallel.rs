//! Parallel dump and restore.
//!
//! A leader hands single TOC entries to a fixed pool of worker threads.
//! Every worker owns a clone of the archive handle with its own driver
//! state and its own database session, and talks to the leader over a
//! socket pair. Messages are NUL terminated text:
//!
//! ```text
//! leader -> worker:  DUMP <id>
//!                    RESTORE <id>
//! worker -> leader:  OK DUMP <id> <status>
//!                    OK RESTORE <id> <status> <errors>
//!                    ERROR <text>
//! ```
//!
//! A worker runs one job at a time. Closing the leader side of the
//! socket tells the worker to exit.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{bail, format_err, Error};
use crossbeam_channel::Sender;
use nix::poll::{poll, PollFd, PollFlags};

use pgarch_api_types::{DumpId, ObjectClass, RestoreOptions, Section};
use pgarch_tools::exit::{CleanupGuard, ExitContext};
use pgarch_tools::str::fmt_qualified;

use crate::archive::{write_data_chunk, ArchiveCore, ArchiveHandle};
use crate::connection::{lock_relation_nowait, CancelToken, Connection, Connector};
use crate::error::ArchiveError;
use crate::restore::{begin_restore, end_restore, restore_toc_entry, toc_entry_required};
use crate::toc::{FormatExtra, TocEntry};

/// Wait time of one round in the leader's multiplexed wait, in ms.
const POLL_TIMEOUT: libc::c_int = 100;

/// Worker slot states, as seen by the leader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Working,
    /// A reply was received but not reaped yet.
    Finished,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobKind {
    Dump,
    Restore,
}

impl JobKind {
    fn command(self) -> &'static str {
        match self {
            JobKind::Dump => "DUMP",
            JobKind::Restore => "RESTORE",
        }
    }
}

/// Outcome of one job.
#[derive(Clone, Debug, PartialEq, Eq)]
struct JobResult {
    kind: JobKind,
    id: DumpId,
    /// Zero on success.
    status: i32,
    /// Errors ignored while restoring the entry.
    errors: usize,
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            JobKind::Dump => write!(f, "OK DUMP {} {}", self.id, self.status),
            JobKind::Restore => {
                write!(f, "OK RESTORE {} {} {}", self.id, self.status, self.errors)
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Message {
    Command(JobKind, DumpId),
    Done(JobResult),
    Error(String),
}

fn invalid_message(text: &str) -> Error {
    ArchiveError::WorkerProtocol(format!("invalid message received from worker: \"{}\"", text)).into()
}

fn parse_job_kind(word: Option<&str>) -> Option<JobKind> {
    match word {
        Some("DUMP") => Some(JobKind::Dump),
        Some("RESTORE") => Some(JobKind::Restore),
        _ => None,
    }
}

fn parse_message(text: &str) -> Result<Message, Error> {
    if let Some(msg) = text.strip_prefix("ERROR ") {
        return Ok(Message::Error(msg.to_string()));
    }

    let mut words = text.split_ascii_whitespace();
    let first = words.next();

    if first == Some("OK") {
        let kind = parse_job_kind(words.next()).ok_or_else(|| invalid_message(text))?;
        let mut number = || -> Result<i64, Error> {
            words
                .next()
                .and_then(|word| word.parse().ok())
                .ok_or_else(|| invalid_message(text))
        };
        let id = number()? as DumpId;
        let status = number()? as i32;
        let errors = match kind {
            JobKind::Dump => 0,
            JobKind::Restore => number()? as usize,
        };
        return Ok(Message::Done(JobResult {
            kind,
            id,
            status,
            errors,
        }));
    }

    let kind = parse_job_kind(first).ok_or_else(|| invalid_message(text))?;
    let id = words
        .next()
        .and_then(|word| word.parse::<DumpId>().ok())
        .ok_or_else(|| invalid_message(text))?;
    if words.next().is_some() {
        return Err(invalid_message(text));
    }
    Ok(Message::Command(kind, id))
}

/// Collects bytes until a message terminator shows up.
#[derive(Default)]
struct MessageBuffer {
    data: Vec<u8>,
}

impl MessageBuffer {
    /// Remove and return the first complete message.
    fn take_message(&mut self) -> Option<String> {
        let end = self.data.iter().position(|b| *b == 0)?;
        let raw: Vec<u8> = self.data.drain(..=end).collect();
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    /// One read from `reader`. Returns the number of bytes added, 0 on EOF.
    fn fill<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(count) => {
                    self.data.extend_from_slice(&buf[..count]);
                    return Ok(count);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Block until a complete message or EOF.
    fn read_message<R: Read>(&mut self, reader: &mut R) -> io::Result<Option<String>> {
        loop {
            if let Some(msg) = self.take_message() {
                return Ok(Some(msg));
            }
            if self.fill(reader)? == 0 {
                return Ok(None);
            }
        }
    }
}

fn send_message<W: Write>(writer: &mut W, text: &str) -> io::Result<()> {
    let mut data: Vec<u8> = text.bytes().map(|b| if b == 0 { b' ' } else { b }).collect();
    data.push(0);
    writer.write_all(&data)?;
    writer.flush()
}

type StartupReport = (usize, Result<Option<Arc<dyn CancelToken>>, String>);

fn worker_session(handle: &mut ArchiveHandle) -> Result<&mut (dyn Connection + 'static), Error> {
    match handle.core.connection.as_deref_mut() {
        Some(conn) => Ok(conn),
        None => bail!("worker has no database connection"),
    }
}

/// Relation a job on `te` locks in the worker session.
fn job_relation(te: &TocEntry) -> Option<String> {
    match te.class {
        ObjectClass::TableData => Some(fmt_qualified(&te.namespace, &te.tag)),
        _ => None,
    }
}

fn run_dump_job(handle: &mut ArchiveHandle, id: DumpId) -> Result<JobResult, Error> {
    // workers without a session only copy data the leader already holds
    let relation = match handle.core.connection {
        Some(_) => job_relation(handle.core.entry(id)?),
        None => None,
    };

    if let Some(relation) = &relation {
        let conn = worker_session(handle)?;
        conn.execute("BEGIN")?;
        if let Err(err) = lock_relation_nowait(conn, relation, id) {
            let _ = conn.execute("ROLLBACK");
            return Err(err);
        }
    }

    let status = match write_data_chunk(&mut handle.core, &mut *handle.driver, id) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("dumping data of entry {} failed: {}", id, err);
            1
        }
    };

    if relation.is_some() {
        worker_session(handle)?
            .execute("COMMIT")
            .map_err(|err| format_err!("could not commit dump of entry {}: {}", id, err))?;
    }

    Ok(JobResult {
        kind: JobKind::Dump,
        id,
        status,
        errors: 0,
    })
}

fn run_restore_job(handle: &mut ArchiveHandle, id: DumpId) -> Result<JobResult, Error> {
    let relation = job_relation(handle.core.entry(id)?);

    // the lock only lives for this job
    if let Some(relation) = &relation {
        let conn = worker_session(handle)?;
        conn.execute("BEGIN")?;
        if let Err(err) = lock_relation_nowait(conn, relation, id) {
            let _ = conn.execute("ROLLBACK");
            return Err(err);
        }
    }

    let errors = match restore_toc_entry(&mut handle.core, &mut *handle.driver, id) {
        Ok(errors) => errors,
        Err(err) => {
            if relation.is_some() {
                let _ = worker_session(handle)?.execute("ROLLBACK");
            }
            return Err(err);
        }
    };

    if relation.is_some() {
        worker_session(handle)?
            .execute("COMMIT")
            .map_err(|err| format_err!("could not commit restore of entry {}: {}", id, err))?;
    }

    Ok(JobResult {
        kind: JobKind::Restore,
        id,
        status: if errors > 0 { 1 } else { 0 },
        errors,
    })
}

fn worker_loop(handle: &mut ArchiveHandle, stream: &mut UnixStream) {
    let mut buffer = MessageBuffer::default();

    loop {
        let text = match buffer.read_message(stream) {
            Ok(Some(text)) => text,
            Ok(None) => break,
            Err(err) => {
                log::debug!("worker lost connection to leader: {}", err);
                break;
            }
        };

        if handle.core.exit.is_aborting() {
            break;
        }

        let result = match parse_message(&text) {
            Ok(Message::Command(JobKind::Dump, id)) => run_dump_job(handle, id),
            Ok(Message::Command(JobKind::Restore, id)) => run_restore_job(handle, id),
            Ok(_) => Err(ArchiveError::WorkerProtocol(format!(
                "unrecognized command received from leader: \"{}\"",
                text
            ))
            .into()),
            Err(err) => Err(err),
        };

        match result {
            Ok(result) => {
                if send_message(stream, &result.to_string()).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = send_message(stream, &format!("ERROR {}", err));
                break;
            }
        }
    }
}

fn worker_main(
    index: usize,
    mut handle: ArchiveHandle,
    connector: Option<Arc<dyn Connector>>,
    kind: JobKind,
    mut stream: UnixStream,
    startup: Sender<StartupReport>,
) {
    let report = match connector {
        Some(connector) => match connector.connect() {
            Ok(conn) => {
                let token = conn.cancel_token();
                handle.set_connection(conn);
                Ok(token)
            }
            Err(err) => Err(err.to_string()),
        },
        None if kind == JobKind::Restore => Err("no database connector available".to_string()),
        None => Ok(None),
    };

    let failed = report.is_err();
    if startup.send((index, report)).is_err() || failed {
        return;
    }
    drop(startup);

    worker_loop(&mut handle, &mut stream);

    drop(handle.take_connection());
    let _ = stream.shutdown(Shutdown::Both);
}

struct WorkerSlot {
    status: WorkerStatus,
    stream: UnixStream,
    buffer: MessageBuffer,
    job: Option<DumpId>,
    result: Option<JobResult>,
    thread: Option<JoinHandle<()>>,
}

/// Leader side of the worker pool.
pub(crate) struct ParallelState {
    kind: JobKind,
    slots: Vec<WorkerSlot>,
    exit: ExitContext,
    cancel_tokens: Vec<Arc<dyn CancelToken>>,
    _cleanup: Option<CleanupGuard>,
}

impl ParallelState {
    /// Start `workers` threads, each with a clone of `handle`.
    fn start(handle: &ArchiveHandle, kind: JobKind, workers: usize) -> Result<Self, Error> {
        let (report_tx, report_rx) = crossbeam_channel::bounded::<StartupReport>(workers);

        let mut state = ParallelState {
            kind,
            slots: Vec::with_capacity(workers),
            exit: handle.core.exit.clone(),
            cancel_tokens: Vec::new(),
            _cleanup: None,
        };

        for i in 0..workers {
            let (leader, worker) = UnixStream::pair()
                .map_err(|err| format_err!("could not create communication channels: {}", err))?;
            let worker_handle = handle.clone_for_worker()?;
            let connector = handle.core.connector.clone();
            let report = report_tx.clone();

            let thread = std::thread::Builder::new()
                .name(format!("pgarch worker ({})", i))
                .spawn(move || worker_main(i, worker_handle, connector, kind, worker, report))
                .map_err(|err| format_err!("could not create worker thread: {}", err))?;

            state.slots.push(WorkerSlot {
                status: WorkerStatus::Idle,
                stream: leader,
                buffer: MessageBuffer::default(),
                job: None,
                result: None,
                thread: Some(thread),
            });
        }
        drop(report_tx);

        for _ in 0..workers {
            match report_rx.recv() {
                Ok((_, Ok(token))) => state.cancel_tokens.extend(token),
                Ok((i, Err(msg))) => {
                    state.slots[i].status = WorkerStatus::Terminated;
                    bail!("could not start worker {}: {}", i, msg);
                }
                Err(_) => return Err(ArchiveError::WorkerDied.into()),
            }
        }

        let streams: Vec<UnixStream> = state
            .slots
            .iter()
            .filter_map(|slot| slot.stream.try_clone().ok())
            .collect();
        let tokens = state.cancel_tokens.clone();
        state._cleanup = Some(state.exit.on_exit_nicely("parallel workers", move || {
            shutdown_workers(&streams, &tokens)
        }));

        log::debug!("started {} parallel workers", workers);
        Ok(state)
    }

    fn count(&self, status: WorkerStatus) -> usize {
        self.slots.iter().filter(|slot| slot.status == status).count()
    }

    fn idle_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.status == WorkerStatus::Idle)
    }

    fn dispatch(&mut self, slot: usize, id: DumpId) -> Result<(), Error> {
        let command = format!("{} {}", self.kind.command(), id);
        let worker = &mut self.slots[slot];
        if send_message(&mut worker.stream, &command).is_err() {
            worker.status = WorkerStatus::Terminated;
            return Err(ArchiveError::WorkerDied.into());
        }
        worker.status = WorkerStatus::Working;
        worker.job = Some(id);
        Ok(())
    }

    /// Read whatever `slot` sent. True if a job finished.
    fn read_from_worker(&mut self, slot: usize) -> Result<bool, Error> {
        let kind = self.kind;
        let worker = &mut self.slots[slot];

        let count = match worker.buffer.fill(&mut worker.stream) {
            Ok(count) => count,
            Err(err) => {
                log::debug!("could not read from worker {}: {}", slot, err);
                0
            }
        };
        if count == 0 {
            worker.status = WorkerStatus::Terminated;
            return Err(ArchiveError::WorkerDied.into());
        }

        let text = match worker.buffer.take_message() {
            Some(text) => text,
            None => return Ok(false),
        };

        match parse_message(&text)? {
            Message::Done(result) if result.kind == kind && worker.job == Some(result.id) => {
                worker.result = Some(result);
                worker.status = WorkerStatus::Finished;
                Ok(true)
            }
            Message::Error(msg) => {
                worker.status = WorkerStatus::Terminated;
                bail!("{}", msg);
            }
            _ => Err(invalid_message(&text)),
        }
    }

    /// Collect replies from busy workers. With `wait`, block until at
    /// least one job finished.
    fn listen_to_workers(&mut self, wait: bool) -> Result<bool, Error> {
        loop {
            if self.exit.is_aborting() {
                self.abort();
                bail!("terminated by user");
            }

            let working: Vec<usize> = (0..self.slots.len())
                .filter(|i| self.slots[*i].status == WorkerStatus::Working)
                .collect();
            if working.is_empty() {
                return Ok(false);
            }

            let mut fds: Vec<PollFd> = working
                .iter()
                .map(|i| PollFd::new(self.slots[*i].stream.as_raw_fd(), PollFlags::POLLIN))
                .collect();

            match poll(&mut fds, if wait { POLL_TIMEOUT } else { 0 }) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => bail!("poll() failed: {}", err),
            }

            let ready: Vec<usize> = working
                .iter()
                .zip(fds.iter())
                .filter(|(_, fd)| fd.revents().map(|ev| !ev.is_empty()).unwrap_or(false))
                .map(|(i, _)| *i)
                .collect();

            let mut finished = false;
            for slot in ready {
                finished |= self.read_from_worker(slot)?;
            }

            if finished || !wait {
                return Ok(finished);
            }
        }
    }

    /// Take the result of one finished worker and mark it idle.
    fn reap_worker_status(&mut self) -> Option<JobResult> {
        let worker = self
            .slots
            .iter_mut()
            .find(|slot| slot.status == WorkerStatus::Finished)?;
        worker.status = WorkerStatus::Idle;
        worker.job = None;
        worker.result.take()
    }

    /// Wait until a worker is idle, passing every finished job to
    /// `on_done`.
    fn ensure_idle_worker<F>(&mut self, mut on_done: F) -> Result<usize, Error>
    where
        F: FnMut(JobResult) -> Result<(), Error>,
    {
        loop {
            while let Some(result) = self.reap_worker_status() {
                on_done(result)?;
            }
            if let Some(slot) = self.idle_slot() {
                return Ok(slot);
            }
            if self.count(WorkerStatus::Working) == 0 {
                return Err(ArchiveError::WorkerDied.into());
            }
            self.listen_to_workers(true)?;
        }
    }

    /// Wait for all running jobs.
    fn ensure_workers_finished<F>(&mut self, mut on_done: F) -> Result<(), Error>
    where
        F: FnMut(JobResult) -> Result<(), Error>,
    {
        loop {
            while let Some(result) = self.reap_worker_status() {
                on_done(result)?;
            }
            if self.count(WorkerStatus::Working) == 0 {
                return Ok(());
            }
            self.listen_to_workers(true)?;
        }
    }

    /// Cancel running statements and disconnect every worker.
    fn abort(&mut self) {
        let streams: Vec<&UnixStream> = self.slots.iter().map(|slot| &slot.stream).collect();
        for token in &self.cancel_tokens {
            if let Err(err) = token.cancel() {
                log::debug!("could not cancel worker statement: {}", err);
            }
        }
        for stream in streams {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn join_threads(&mut self) -> Vec<String> {
        let mut msg_list = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            let _ = slot.stream.shutdown(Shutdown::Both);
            if let Some(thread) = slot.thread.take() {
                if let Err(panic) = thread.join() {
                    match panic.downcast::<&str>() {
                        Ok(panic_msg) => {
                            msg_list.push(format!("worker ({}) panicked: {}", i, panic_msg))
                        }
                        Err(_) => msg_list.push(format!("worker ({}) panicked", i)),
                    }
                }
            }
            slot.status = WorkerStatus::Terminated;
        }
        msg_list
    }

    /// Let all workers exit and wait for them.
    fn finish(mut self) -> Result<(), Error> {
        let msg_list = self.join_threads();
        if msg_list.is_empty() {
            return Ok(());
        }
        Err(format_err!("{}", msg_list.join("\n")))
    }
}

impl Drop for ParallelState {
    fn drop(&mut self) {
        if self.count(WorkerStatus::Working) > 0 {
            self.abort();
        }
        self.join_threads();
    }
}

fn shutdown_workers(streams: &[UnixStream], tokens: &[Arc<dyn CancelToken>]) {
    for token in tokens {
        let _ = token.cancel();
    }
    for stream in streams {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn record_dump_result(core: &mut ArchiveCore, result: JobResult, failed: &mut usize) -> Result<(), Error> {
    if result.status == 0 {
        return Ok(());
    }
    *failed += 1;

    // the worker left the entry without data, mirror that in our TOC
    let te = core.entry_mut(result.id)?;
    te.dumper = None;
    te.had_dumper = false;
    if let FormatExtra::File { .. } = te.extra {
        te.extra = FormatExtra::File { filename: None };
    }
    Ok(())
}

/// Run the data dumpers of all entries through the worker pool.
pub(crate) fn dump_parallel(handle: &mut ArchiveHandle) -> Result<(), Error> {
    let mut jobs: Vec<(u64, DumpId)> = handle
        .core
        .toc
        .iter()
        .filter(|te| te.dumper.is_some())
        .map(|te| (te.data_length, te.dump_id))
        .collect();
    // biggest first, TOC order otherwise
    jobs.sort_by_key(|(length, _)| std::cmp::Reverse(*length));

    let workers = handle.core.jobs.min(jobs.len()).max(1);
    let mut pool = ParallelState::start(handle, JobKind::Dump, workers)?;
    let mut failed = 0;

    for (_, id) in jobs {
        let slot =
            pool.ensure_idle_worker(|result| record_dump_result(&mut handle.core, result, &mut failed))?;
        log::debug!("launching dump of entry {}", id);
        pool.dispatch(slot, id)?;
    }

    pool.ensure_workers_finished(|result| record_dump_result(&mut handle.core, result, &mut failed))?;
    pool.finish()?;

    if failed > 0 {
        bail!("{} data dumpers failed", failed);
    }
    Ok(())
}

/// Ready list of a parallel restore.
struct RestoreScheduler {
    /// Entries not yet started, biggest first.
    pending: Vec<DumpId>,
    /// Entries not yet completed.
    outstanding: HashSet<DumpId>,
    running: HashMap<DumpId, Vec<DumpId>>,
    deps: HashMap<DumpId, Vec<DumpId>>,
    lock_deps: HashMap<DumpId, Vec<DumpId>>,
    wanted: HashSet<DumpId>,
    order: Vec<DumpId>,
}

/// Tables an entry locks exclusively while it is restored.
fn locking_dependencies(core: &ArchiveCore, te: &TocEntry) -> Vec<DumpId> {
    let locks_table = matches!(
        te.class,
        ObjectClass::TableData
            | ObjectClass::Index
            | ObjectClass::Constraint
            | ObjectClass::CheckConstraint
            | ObjectClass::FkConstraint
            | ObjectClass::Rule
            | ObjectClass::Trigger
            | ObjectClass::Policy
    );
    if !locks_table {
        return Vec::new();
    }
    te.deps
        .iter()
        .copied()
        .filter(|dep| {
            core.toc
                .get(*dep)
                .map(|dep| matches!(dep.class, ObjectClass::Table | ObjectClass::TableData))
                .unwrap_or(false)
        })
        .collect()
}

impl RestoreScheduler {
    fn new(core: &ArchiveCore, ids: &[DumpId], ropts: &RestoreOptions) -> Result<Self, Error> {
        let members: HashSet<DumpId> = ids.iter().copied().collect();
        let mut deps = HashMap::new();
        let mut lock_deps = HashMap::new();
        let mut wanted = HashSet::new();
        let mut sizes = Vec::new();

        for id in ids {
            let te = core.entry(*id)?;
            // anything outside of this set is already done or unknown
            let entry_deps: Vec<DumpId> =
                te.deps.iter().copied().filter(|dep| members.contains(dep)).collect();
            deps.insert(*id, entry_deps);
            lock_deps.insert(*id, locking_dependencies(core, te));
            if !toc_entry_required(te, ropts).is_empty() {
                wanted.insert(*id);
            }
            sizes.push((te.data_length, *id));
        }

        sizes.sort_by_key(|(length, _)| std::cmp::Reverse(*length));

        Ok(Self {
            pending: sizes.into_iter().map(|(_, id)| id).collect(),
            outstanding: members,
            running: HashMap::new(),
            deps,
            lock_deps,
            wanted,
            order: ids.to_vec(),
        })
    }

    fn is_ready(&self, id: DumpId) -> bool {
        self.deps
            .get(&id)
            .map(|deps| deps.iter().all(|dep| !self.outstanding.contains(dep)))
            .unwrap_or(true)
    }

    fn has_lock_conflicts(&self, id: DumpId) -> bool {
        let locks = match self.lock_deps.get(&id) {
            Some(locks) if !locks.is_empty() => locks,
            _ => return false,
        };
        self.running
            .values()
            .any(|running| running.iter().any(|lock| locks.contains(lock)))
    }

    /// Complete entries which need no work once their dependencies are
    /// done. Returns their ids.
    fn skip_unwanted(&mut self) -> Vec<DumpId> {
        let mut skipped = Vec::new();
        loop {
            let next = self
                .pending
                .iter()
                .position(|id| !self.wanted.contains(id) && self.is_ready(*id));
            match next {
                Some(pos) => {
                    let id = self.pending.remove(pos);
                    self.outstanding.remove(&id);
                    skipped.push(id);
                }
                None => return skipped,
            }
        }
    }

    /// Pick the biggest entry which may run now.
    fn next_job(&mut self) -> Option<DumpId> {
        let pos = self.pending.iter().position(|id| {
            self.wanted.contains(id) && self.is_ready(*id) && !self.has_lock_conflicts(*id)
        })?;
        let id = self.pending.remove(pos);
        let locks = self.lock_deps.get(&id).cloned().unwrap_or_default();
        self.running.insert(id, locks);
        Some(id)
    }

    fn complete(&mut self, id: DumpId) {
        self.running.remove(&id);
        self.outstanding.remove(&id);
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    /// Entries never started, in TOC order.
    fn remaining(&self) -> Vec<DumpId> {
        let pending: HashSet<DumpId> = self.pending.iter().copied().collect();
        self.order
            .iter()
            .copied()
            .filter(|id| pending.contains(id))
            .collect()
    }
}

fn finish_restore_job(
    core: &mut ArchiveCore,
    scheduler: &mut RestoreScheduler,
    result: JobResult,
) -> Result<(), Error> {
    log::debug!("finished item {}", result.id);
    scheduler.complete(result.id);
    core.n_errors += result.errors;
    core.entry_mut(result.id)?.printed = true;
    Ok(())
}

fn restore_main_loop(
    handle: &mut ArchiveHandle,
    pool: &mut ParallelState,
    scheduler: &mut RestoreScheduler,
) -> Result<(), Error> {
    loop {
        if handle.core.exit.is_aborting() {
            pool.abort();
            bail!("terminated by user");
        }

        while let Some(result) = pool.reap_worker_status() {
            finish_restore_job(&mut handle.core, scheduler, result)?;
        }
        for id in scheduler.skip_unwanted() {
            log::trace!("skipping item {}", id);
        }

        if scheduler.is_done() {
            return Ok(());
        }

        if let Some(slot) = pool.idle_slot() {
            if let Some(id) = scheduler.next_job() {
                log::debug!("launching item {} {}", id, handle.core.entry(id)?.describe());
                pool.dispatch(slot, id)?;
                continue;
            }
        }

        if scheduler.running.is_empty() {
            // nothing runs and nothing is ready
            return Ok(());
        }

        pool.listen_to_workers(true)?;
    }
}

/// Restore into the connected database using a pool of workers.
///
/// Everything before the first data entry is restored by the leader,
/// since later entries depend on it.
pub(crate) fn restore_parallel(handle: &mut ArchiveHandle, ropts: &RestoreOptions) -> Result<(), Error> {
    if handle.core.connector.is_none() {
        bail!("parallel restore needs a connector for the worker sessions");
    }

    handle.driver.prep_parallel_restore(&mut handle.core)?;
    let state = begin_restore(&mut handle.core, ropts)?;

    let ids = handle.core.toc.ids();
    let first_parallel = ids
        .iter()
        .position(|id| {
            handle
                .core
                .toc
                .get(*id)
                .map(|te| matches!(te.section, Section::Data | Section::PostData))
                .unwrap_or(false)
        })
        .unwrap_or(ids.len());

    for id in &ids[..first_parallel] {
        if handle.core.exit.is_aborting() {
            bail!("terminated by user");
        }
        restore_toc_entry(&mut handle.core, &mut *handle.driver, *id)?;
    }

    let ropts = handle.core.ropts.clone();
    let mut scheduler = RestoreScheduler::new(&handle.core, &ids[first_parallel..], &ropts)?;

    log::debug!("entering main parallel loop");
    let workers = handle.core.jobs;
    let mut pool = ParallelState::start(handle, JobKind::Restore, workers)?;
    restore_main_loop(handle, &mut pool, &mut scheduler)?;
    pool.finish()?;
    log::debug!("finished main parallel loop");

    let remaining = scheduler.remaining();
    if !remaining.is_empty() {
        log::warn!(
            "could not restore {} items in parallel, restoring them serially",
            remaining.len()
        );
    }
    for id in remaining {
        restore_toc_entry(&mut handle.core, &mut *handle.driver, id)?;
    }

    end_restore(&mut handle.core, state)
}

#[cfg(test)]
mod test {
    use super::*;

    use pgarch_api_types::ArchiveFormat;

    use crate::toc::ArchiveEntryOpts;

    #[test]
    fn message_parsing() -> Result<(), Error> {
        assert_eq!(parse_message("DUMP 17")?, Message::Command(JobKind::Dump, 17));
        assert_eq!(parse_message("RESTORE 3")?, Message::Command(JobKind::Restore, 3));

        let result = JobResult {
            kind: JobKind::Restore,
            id: 9,
            status: 1,
            errors: 2,
        };
        assert_eq!(result.to_string(), "OK RESTORE 9 1 2");
        assert_eq!(parse_message(&result.to_string())?, Message::Done(result));
        assert_eq!(
            parse_message("OK DUMP 4 0")?,
            Message::Done(JobResult {
                kind: JobKind::Dump,
                id: 4,
                status: 0,
                errors: 0
            })
        );
        assert_eq!(
            parse_message("ERROR could not obtain lock")?,
            Message::Error("could not obtain lock".to_string())
        );

        for bad in ["", "OK", "OK COPY 1 0", "DUMP x", "DUMP 1 2", "HELLO 1"] {
            let err = parse_message(bad).unwrap_err();
            assert!(err.to_string().contains("invalid message received from worker"));
        }
        Ok(())
    }

    #[test]
    fn message_framing() -> Result<(), Error> {
        let mut wire = Vec::new();
        send_message(&mut wire, "DUMP 1")?;
        send_message(&mut wire, "ERROR a\0b")?;
        assert_eq!(wire, b"DUMP 1\0ERROR a b\0".to_vec());

        let mut buffer = MessageBuffer::default();
        let mut reader = &wire[..];
        assert_eq!(buffer.read_message(&mut reader)?, Some("DUMP 1".to_string()));
        assert_eq!(buffer.read_message(&mut reader)?, Some("ERROR a b".to_string()));
        assert_eq!(buffer.read_message(&mut reader)?, None);

        // split across reads
        let mut buffer = MessageBuffer::default();
        buffer.data.extend_from_slice(b"OK DU");
        assert_eq!(buffer.take_message(), None);
        buffer.data.extend_from_slice(b"MP 2 0\0RES");
        assert_eq!(buffer.take_message(), Some("OK DUMP 2 0".to_string()));
        assert_eq!(buffer.data, b"RES".to_vec());
        Ok(())
    }

    fn scheduler_core() -> Result<ArchiveCore, Error> {
        let exit = ExitContext::new("pgarch-test");
        let header = crate::header::ArchiveHeader::new(ArchiveFormat::Null, Default::default());
        let mut core = ArchiveCore::new(crate::archive::ArchiveMode::Read, header, exit);

        let entries = vec![
            ArchiveEntryOpts::new(ObjectClass::Table, "a").defn("CREATE TABLE a ();\n").into_entry(1),
            ArchiveEntryOpts::new(ObjectClass::Table, "b").defn("CREATE TABLE b ();\n").into_entry(2),
            ArchiveEntryOpts::new(ObjectClass::TableData, "a")
                .copy_stmt("COPY a FROM stdin;\n")
                .deps(&[1])
                .into_entry(3),
            ArchiveEntryOpts::new(ObjectClass::TableData, "b")
                .copy_stmt("COPY b FROM stdin;\n")
                .deps(&[2])
                .into_entry(4),
            ArchiveEntryOpts::new(ObjectClass::PostDataBoundary, "POST-DATA BOUNDARY")
                .deps(&[3, 4])
                .into_entry(5),
            ArchiveEntryOpts::new(ObjectClass::Index, "a_idx")
                .defn("CREATE INDEX a_idx ON a (x);\n")
                .deps(&[1, 5])
                .into_entry(6),
            ArchiveEntryOpts::new(ObjectClass::Constraint, "a_pkey")
                .defn("ALTER TABLE a ADD PRIMARY KEY (x);\n")
                .deps(&[1, 5])
                .into_entry(7),
        ];
        for mut te in entries {
            te.had_dumper = te.class == ObjectClass::TableData;
            core.toc.push(te)?;
        }
        core.entry_mut(4)?.data_length = 100;
        core.entry_mut(3)?.data_length = 10;
        Ok(core)
    }

    #[test]
    fn scheduler_order_and_lock_conflicts() -> Result<(), Error> {
        let core = scheduler_core()?;
        let ropts = RestoreOptions::default();
        let mut scheduler = RestoreScheduler::new(&core, &[3, 4, 5, 6, 7], &ropts)?;

        assert!(scheduler.skip_unwanted().is_empty());
        // biggest first
        assert_eq!(scheduler.next_job(), Some(4));
        assert_eq!(scheduler.next_job(), Some(3));
        // post-data waits for the boundary
        assert_eq!(scheduler.next_job(), None);

        scheduler.complete(4);
        assert!(scheduler.skip_unwanted().is_empty());
        scheduler.complete(3);
        assert_eq!(scheduler.skip_unwanted(), vec![5]);

        // index and primary key both lock table a
        assert_eq!(scheduler.next_job(), Some(6));
        assert_eq!(scheduler.next_job(), None);
        scheduler.complete(6);
        assert_eq!(scheduler.next_job(), Some(7));
        scheduler.complete(7);

        assert!(scheduler.is_done());
        assert!(scheduler.remaining().is_empty());
        Ok(())
    }
}
