//! Failover Listener
//!
//! Owns the master and replica handles of one logical connection and runs
//! elections when one of them breaks. Normal dispatch holds the state lock
//! shared; every election and role probe holds it exclusively, so a handle
//! is never replaced while a command is in flight on it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::timeout;

use super::blacklist::{Blacklist, BlacklistEntry};
use super::filter::SearchFilter;
use super::search::{search, Outcome, SearchContext};
use crate::config::FailoverConfig;
use crate::error::{Error, Result};
use crate::host::{HostAddress, Topology};
use crate::protocol::{Command, Connector, Handle, QueryResult, SharedHandle};
use crate::topology::{Role, RoleClassifier};

/// A handle bound to the host it was opened on
#[derive(Debug)]
struct Slot {
    host: HostAddress,
    handle: SharedHandle,
}

impl Slot {
    async fn close(self) {
        self.handle.lock().await.close().await;
    }
}

/// Mutable orchestration state, guarded by the listener lock
#[derive(Debug)]
pub struct ListenerState {
    master: Option<Slot>,
    secondary: Option<Slot>,
    /// Slot used for dispatch
    current: Option<Role>,
    pub(crate) master_host_fail: bool,
    pub(crate) secondary_host_fail: bool,
    pub(crate) explicitly_closed: bool,
    /// Read-only mode requested by the application
    read_only: bool,
    has_replicas: bool,
    last_master_failure: Option<Instant>,
    catalog: Option<String>,
}

impl ListenerState {
    /// Fresh state with every wanted role marked down
    pub fn new(has_replicas: bool) -> Self {
        Self {
            master: None,
            secondary: None,
            current: None,
            master_host_fail: true,
            secondary_host_fail: has_replicas,
            explicitly_closed: false,
            read_only: false,
            has_replicas,
            last_master_failure: None,
            catalog: None,
        }
    }

    pub fn master_host(&self) -> Option<&HostAddress> {
        self.master.as_ref().map(|s| &s.host)
    }

    pub fn secondary_host(&self) -> Option<&HostAddress> {
        self.secondary.as_ref().map(|s| &s.host)
    }

    pub fn current_role(&self) -> Option<Role> {
        self.current
    }

    /// Handle commands are dispatched to
    pub fn current_handle(&self) -> Option<SharedHandle> {
        let slot = match self.current? {
            Role::Master => self.master.as_ref(),
            Role::Replica => self.secondary.as_ref(),
        };
        slot.map(|s| s.handle.clone())
    }

    fn current_host(&self) -> Option<&HostAddress> {
        match self.current? {
            Role::Master => self.master_host(),
            Role::Replica => self.secondary_host(),
        }
    }

    fn master_available(&self) -> bool {
        !self.master_host_fail && self.master.is_some()
    }

    fn secondary_available(&self) -> bool {
        !self.secondary_host_fail && self.secondary.is_some()
    }

    /// Running on a replica because the master is gone, not by request
    fn is_replica_fallback(&self) -> bool {
        self.current == Some(Role::Replica) && !self.read_only && self.master_host_fail
    }

    /// Hosts bound to live handles, skipped by elections
    pub(crate) fn live_hosts(&self) -> Vec<HostAddress> {
        let mut hosts = Vec::with_capacity(2);
        if let Some(slot) = self.master.as_ref().filter(|_| !self.master_host_fail) {
            hosts.push(slot.host.clone());
        }
        if let Some(slot) = self.secondary.as_ref().filter(|_| !self.secondary_host_fail) {
            hosts.push(slot.host.clone());
        }
        hosts
    }

    fn role_of(&self, handle: &SharedHandle) -> Option<Role> {
        if self.master.as_ref().is_some_and(|s| Arc::ptr_eq(&s.handle, handle)) {
            Some(Role::Master)
        } else if self.secondary.as_ref().is_some_and(|s| Arc::ptr_eq(&s.handle, handle)) {
            Some(Role::Replica)
        } else {
            None
        }
    }

    /// Bind a newly classified master, closing the one it supersedes
    pub(crate) async fn found_active_master(&mut self, mut handle: Handle) {
        if self.explicitly_closed {
            handle.close().await;
            return;
        }
        self.sync_catalog(&mut handle).await;
        if let Some(old) = self.master.take() {
            old.close().await;
        }

        let host = handle.host().clone();
        tracing::info!("Connected to master {}", host);
        self.master = Some(Slot {
            host,
            handle: handle.into_shared(),
        });
        self.master_host_fail = false;
        self.last_master_failure = None;
        if !(self.read_only && self.secondary_available()) {
            self.current = Some(Role::Master);
        }
    }

    /// Bind a newly classified replica, closing the one it supersedes
    pub(crate) async fn found_active_secondary(&mut self, mut handle: Handle) {
        if self.explicitly_closed {
            handle.close().await;
            return;
        }
        self.sync_catalog(&mut handle).await;
        if let Some(old) = self.secondary.take() {
            old.close().await;
        }

        let host = handle.host().clone();
        tracing::info!("Connected to replica {}", host);
        self.secondary = Some(Slot {
            host,
            handle: handle.into_shared(),
        });
        self.secondary_host_fail = false;
        if self.read_only || self.master_host_fail {
            self.current = Some(Role::Replica);
        }
    }

    async fn sync_catalog(&self, handle: &mut Handle) {
        if let Some(db) = &self.catalog {
            if let Err(e) = handle.connection_mut().set_catalog(db).await {
                tracing::warn!("Could not select database {} on {}: {}", db, handle.host(), e);
            }
        }
    }

    /// Re-probe the live replica between passes: a cluster may have
    /// promoted it while the master was unreachable
    pub(crate) async fn check_if_type_changed(
        &mut self,
        ctx: &SearchContext,
        filter: &mut SearchFilter,
    ) {
        if !self.master_host_fail || !self.secondary_available() {
            return;
        }
        let promoted = match &self.secondary {
            Some(slot) => {
                let mut handle = slot.handle.lock().await;
                let probe = ctx.classifier.classify(handle.connection_mut());
                let role = timeout(ctx.connect_timeout, probe).await;
                match role {
                    Ok(Ok(Role::Master)) => {
                        handle.set_role(Role::Master);
                        true
                    }
                    Ok(Ok(Role::Replica)) => false,
                    Ok(Err(e)) => {
                        tracing::debug!("Role re-check on {} failed: {}", slot.host, e);
                        false
                    }
                    Err(_) => {
                        tracing::debug!(
                            "Role re-check on {} timed out after {:?}",
                            slot.host,
                            ctx.connect_timeout
                        );
                        false
                    }
                }
            }
            None => false,
        };
        if !promoted {
            return;
        }

        if let Some(slot) = self.secondary.take() {
            tracing::info!("Replica {} has been promoted to master", slot.host);
            if let Some(old) = self.master.replace(slot) {
                old.close().await;
            }
            self.master_host_fail = false;
            self.secondary_host_fail = self.has_replicas;
            self.last_master_failure = None;
            if self.current == Some(Role::Replica) {
                self.current = None;
            }
            self.ensure_current();
            filter.search_for_master = false;
        }
    }

    /// Drop a broken master, returning its host
    async fn drop_master(&mut self) -> Option<HostAddress> {
        self.master_host_fail = true;
        self.last_master_failure = Some(Instant::now());
        if self.current == Some(Role::Master) {
            self.current = None;
        }
        let slot = self.master.take()?;
        let host = slot.host.clone();
        slot.close().await;
        Some(host)
    }

    /// Drop a broken replica, returning its host
    async fn drop_secondary(&mut self) -> Option<HostAddress> {
        self.secondary_host_fail = true;
        if self.current == Some(Role::Replica) {
            self.current = None;
        }
        let slot = self.secondary.take()?;
        let host = slot.host.clone();
        slot.close().await;
        Some(host)
    }

    async fn close_all(&mut self) {
        self.current = None;
        let slots = self.master.take().into_iter().chain(self.secondary.take());
        futures::future::join_all(slots.map(Slot::close)).await;
        self.master_host_fail = true;
        self.secondary_host_fail = self.has_replicas;
    }

    /// Point dispatch at a live handle if it lost its target
    fn ensure_current(&mut self) {
        if self.current_handle().is_some() {
            return;
        }
        self.current = if self.read_only && self.secondary_available() {
            Some(Role::Replica)
        } else if self.master_available() {
            Some(Role::Master)
        } else if self.secondary_available() {
            Some(Role::Replica)
        } else {
            None
        };
    }
}

/// What the caller must do after a failover-eligible error
#[derive(Debug)]
pub struct HandleErrorResult {
    /// Surface the original error, wrapped
    pub must_throw_error: bool,
    /// A usable connection exists again
    pub is_reconnected: bool,
    /// Result of the relaunched command
    pub result: Option<QueryResult>,
    /// Why recovery fell short
    pub cause: Option<Error>,
}

impl HandleErrorResult {
    fn relaunched(result: QueryResult) -> Self {
        Self {
            must_throw_error: false,
            is_reconnected: true,
            result: Some(result),
            cause: None,
        }
    }

    fn throw(is_reconnected: bool, cause: Option<Error>) -> Self {
        Self {
            must_throw_error: true,
            is_reconnected,
            result: None,
            cause,
        }
    }
}

enum Recovery {
    Reconnected,
    /// Master exhausted, running on a replica
    FellBack(Error),
    Exhausted(Error),
}

/// Serializable view of a listener
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub topology: Topology,
    pub current: Option<Role>,
    pub master: Option<String>,
    pub secondary: Option<String>,
    pub master_host_fail: bool,
    pub secondary_host_fail: bool,
    pub read_only: bool,
    pub explicitly_closed: bool,
    pub failovers: u64,
    pub blacklist: Vec<BlacklistEntry>,
}

/// Failover coordinator for one logical connection
pub struct Listener {
    config: Arc<FailoverConfig>,
    hosts: Vec<HostAddress>,
    ctx: SearchContext,
    state: RwLock<ListenerState>,
    /// Reads served on a replica fallback since the last master retry
    queries_on_fallback: AtomicU64,
    failovers: AtomicU64,
}

impl Listener {
    pub fn new(
        config: Arc<FailoverConfig>,
        hosts: Vec<HostAddress>,
        connector: Arc<dyn Connector>,
        classifier: Arc<dyn RoleClassifier>,
        blacklist: Arc<Blacklist>,
    ) -> Self {
        let ctx = SearchContext {
            connector,
            classifier,
            blacklist,
            retries_all_down: config.failover.retries_all_down,
            connect_timeout: config.connect_timeout(),
            blacklist_timeout: config.blacklist_timeout(),
        };
        let state = ListenerState::new(config.topology.has_replicas());
        Self {
            config,
            hosts,
            ctx,
            state: RwLock::new(state),
            queries_on_fallback: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    pub async fn read_state(&self) -> RwLockReadGuard<'_, ListenerState> {
        self.state.read().await
    }

    pub async fn write_state(&self) -> RwLockWriteGuard<'_, ListenerState> {
        self.state.write().await
    }

    /// Failovers run so far
    pub fn failover_count(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    /// First election of a new connection.
    ///
    /// Succeeds once a master is bound. A missing replica is tolerated and
    /// picked up by later elections.
    pub async fn initialize_connection(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.connect_all(&mut state).await?;
        tracing::info!(
            "Connection established ({}): master={}, replica={}",
            self.config.topology,
            state.master_host().map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
            state.secondary_host().map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
        );
        Ok(())
    }

    async fn connect_all(&self, state: &mut ListenerState) -> Result<()> {
        if state.has_replicas {
            let mut filter = SearchFilter::both().with_unique_loop();
            self.run_search(state, &mut filter).await;
        }
        if state.master_host_fail {
            let mut filter = SearchFilter::master_only();
            if let Outcome::Exhausted(e) = self.run_search(state, &mut filter).await {
                return Err(e);
            }
        }
        Ok(())
    }

    async fn run_search(&self, state: &mut ListenerState, filter: &mut SearchFilter) -> Outcome {
        let outcome = search(&self.ctx, state, &self.hosts, filter).await;
        state.ensure_current();
        outcome
    }

    /// Checks run before every data command
    pub async fn pre_execute(&self, command: &Command) -> Result<()> {
        let (no_handle, fallback, retry_due, current) = {
            let state = self.state.read().await;
            if state.explicitly_closed {
                return Err(Error::ConnectionClosed);
            }
            let fallback = state.is_replica_fallback();
            let retry_due = fallback && !command.is_write() && self.master_retry_due(&state);
            (
                state.current_handle().is_none(),
                fallback,
                retry_due,
                state.current_host().map(|h| h.to_string()),
            )
        };

        if no_handle {
            if !self.config.failover.auto_reconnect {
                return Err(Error::ConnectionClosed);
            }
            tracing::info!("No live connection, reconnecting before {}", command.name());
            return self.reconnect().await;
        }

        if !fallback {
            return Ok(());
        }

        if command.is_write() {
            if self.config.failover.fail_on_read_only {
                return Err(Error::ReadOnlyFallback(current.unwrap_or_default()));
            }
            return self.retry_master().await;
        }

        if retry_due {
            if let Err(e) = self.retry_master().await {
                tracing::debug!("Master still unavailable: {}", e);
            }
        }
        Ok(())
    }

    /// Grace period for re-probing a failed master
    fn master_retry_due(&self, state: &ListenerState) -> bool {
        let queries = self.queries_on_fallback.fetch_add(1, Ordering::Relaxed) + 1;
        let elapsed = state
            .last_master_failure
            .map(|at| at.elapsed() >= self.config.retry_master_after())
            .unwrap_or(true);
        elapsed || queries >= self.config.failover.queries_before_retry_master
    }

    /// One pass looking for the master while running on a replica fallback
    async fn retry_master(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.master_host_fail {
            return Ok(());
        }
        self.queries_on_fallback.store(0, Ordering::Relaxed);

        let mut filter = SearchFilter::master_only().with_unique_loop();
        match self.run_search(&mut state, &mut filter).await {
            Outcome::Found => Ok(()),
            Outcome::Exhausted(e) => {
                state.last_master_failure = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// Dispatch a command to the current handle under the shared lock.
    ///
    /// The outer error means nothing could be dispatched; the inner result
    /// is the command's own.
    pub async fn dispatch(&self, command: &Command) -> Result<(SharedHandle, Result<QueryResult>)> {
        let state = self.state.read().await;
        let handle = state.current_handle().ok_or(Error::ConnectionClosed)?;
        let mut guard = handle.lock().await;
        Self::check_writable(&state, &guard, std::slice::from_ref(command))?;
        let result = guard.run(command).await;
        drop(guard);
        Ok((handle, result))
    }

    /// Writes only go to a handle pinned as master, unless the application
    /// asked for read-only routing
    fn check_writable(state: &ListenerState, handle: &Handle, commands: &[Command]) -> Result<()> {
        if state.read_only || handle.must_be_master() {
            return Ok(());
        }
        match commands.iter().find(|c| c.is_write()) {
            Some(command) => {
                tracing::debug!(
                    "Refusing {} on {} handle {}",
                    command.name(),
                    handle.role(),
                    handle.host()
                );
                Err(Error::ReadOnlyFallback(handle.host().to_string()))
            }
            None => Ok(()),
        }
    }

    /// Dispatch several commands back to back on one handle, holding the
    /// shared lock for the whole batch
    pub async fn dispatch_batch(
        &self,
        commands: &[Command],
    ) -> Result<(SharedHandle, Result<Vec<QueryResult>>)> {
        let state = self.state.read().await;
        let handle = state.current_handle().ok_or(Error::ConnectionClosed)?;
        let mut guard = handle.lock().await;
        Self::check_writable(&state, &guard, commands)?;
        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            match guard.run(command).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    drop(guard);
                    return Ok((handle, Err(e)));
                }
            }
        }
        drop(guard);
        Ok((handle, Ok(results)))
    }

    /// Recover from a connection-class error raised by `failed`.
    ///
    /// `command` is relaunched on the new connection when it is safe to
    /// send twice; `None` is never relaunched.
    pub async fn handle_failover(
        &self,
        failed: &SharedHandle,
        command: Option<&Command>,
    ) -> HandleErrorResult {
        let in_transaction = failed.lock().await.in_transaction();

        let recovery = {
            let mut state = self.state.write().await;
            if state.explicitly_closed {
                return HandleErrorResult::throw(false, Some(Error::ConnectionClosed));
            }
            match state.role_of(failed) {
                Some(Role::Master) => self.primary_fail(&mut state, in_transaction).await,
                Some(Role::Replica) => self.secondary_fail(&mut state).await,
                None if state.current_handle().is_some() => {
                    tracing::debug!("Connection already recovered by a concurrent failover");
                    Recovery::Reconnected
                }
                None => self.primary_fail(&mut state, in_transaction).await,
            }
        };

        match recovery {
            Recovery::Reconnected => self.relaunch(command, in_transaction, None).await,
            Recovery::FellBack(e) => self.relaunch(command, in_transaction, Some(e)).await,
            Recovery::Exhausted(e) => HandleErrorResult::throw(false, Some(e)),
        }
    }

    async fn relaunch(
        &self,
        command: Option<&Command>,
        in_transaction: bool,
        cause: Option<Error>,
    ) -> HandleErrorResult {
        let command = match command {
            Some(command) if command.is_relaunchable() && !in_transaction => command,
            // on a replica fallback only a relaunchable read counts as reconnected
            _ => return HandleErrorResult::throw(cause.is_none(), cause),
        };

        tracing::debug!("Relaunching {} after failover", command.name());
        match self.dispatch(command).await {
            Ok((_, Ok(result))) => HandleErrorResult::relaunched(result),
            Ok((_, Err(e))) | Err(e) => HandleErrorResult::throw(true, Some(e)),
        }
    }

    async fn primary_fail(&self, state: &mut ListenerState, in_transaction: bool) -> Recovery {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        if let Some(host) = state.drop_master().await {
            tracing::warn!("Master {} failed, searching for a new master", host);
            self.ctx.blacklist.record(&host, Instant::now()).await;
        }

        let mut filter = SearchFilter::master_only();
        state
            .check_if_type_changed(&self.ctx, &mut filter)
            .await;
        if !filter.search_for_master {
            return Recovery::Reconnected;
        }

        match self.run_search(state, &mut filter).await {
            Outcome::Found => Recovery::Reconnected,
            Outcome::Exhausted(e) => {
                if !in_transaction && !state.explicitly_closed && state.secondary_available() {
                    state.current = Some(Role::Replica);
                    tracing::warn!(
                        "No master available, continuing read-only on {}",
                        state.secondary_host().map(|h| h.to_string()).unwrap_or_default()
                    );
                    Recovery::FellBack(e)
                } else {
                    Recovery::Exhausted(e)
                }
            }
        }
    }

    async fn secondary_fail(&self, state: &mut ListenerState) -> Recovery {
        self.failovers.fetch_add(1, Ordering::Relaxed);
        if let Some(host) = state.drop_secondary().await {
            tracing::warn!("Replica {} failed, searching for a new replica", host);
            self.ctx.blacklist.record(&host, Instant::now()).await;
        }

        if state.master_available() {
            let mut filter = SearchFilter::replica_only().with_unique_loop();
            if let Outcome::Exhausted(e) = self.run_search(state, &mut filter).await {
                tracing::info!("No replica available ({}), reads go to the master", e);
                state.current = Some(Role::Master);
            }
            return Recovery::Reconnected;
        }

        let mut filter = SearchFilter::both().accept_only_replica();
        match self.run_search(state, &mut filter).await {
            Outcome::Found => Recovery::Reconnected,
            Outcome::Exhausted(_) if state.current_handle().is_some() => Recovery::Reconnected,
            Outcome::Exhausted(e) => Recovery::Exhausted(e),
        }
    }

    /// Move between the master and a replica on an application request
    pub async fn switch_read_only_connection(&self, read_only: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if state.explicitly_closed {
            return Err(Error::ConnectionClosed);
        }

        let needs_switch = if read_only {
            state.current == Some(Role::Master) && state.has_replicas
        } else {
            state.current == Some(Role::Replica)
        };
        if needs_switch {
            if let Some(handle) = state.current_handle() {
                if handle.lock().await.in_transaction() {
                    return Err(Error::TransactionInProgress);
                }
            }
        }

        state.read_only = read_only;
        if read_only {
            if state.secondary_available() {
                state.current = Some(Role::Replica);
            } else if state.has_replicas {
                let mut filter = SearchFilter::replica_only().with_unique_loop();
                if let Outcome::Exhausted(e) = self.run_search(&mut state, &mut filter).await {
                    tracing::debug!("No replica for read-only mode, staying on master: {}", e);
                }
            }
        } else if state.master_available() {
            state.current = Some(Role::Master);
        } else {
            let mut filter = SearchFilter::master_only();
            if let Outcome::Exhausted(e) = self.run_search(&mut state, &mut filter).await {
                return Err(e);
            }
        }
        Ok(())
    }

    /// Drop every handle and run a fresh election
    pub async fn reconnect(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.explicitly_closed {
            return Err(Error::ConnectionClosed);
        }
        state.close_all().await;
        self.queries_on_fallback.store(0, Ordering::Relaxed);
        self.connect_all(&mut state).await
    }

    /// Remember the selected database so new handles follow it
    pub async fn remember_catalog(&self, database: &str) {
        self.state.write().await.catalog = Some(database.to_string());
    }

    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if state.explicitly_closed {
            return;
        }
        state.explicitly_closed = true;
        state.close_all().await;
        tracing::debug!("Failover connection closed");
    }

    pub async fn is_closed(&self) -> bool {
        let state = self.state.read().await;
        state.explicitly_closed || state.current_handle().is_none()
    }

    pub async fn is_explicitly_closed(&self) -> bool {
        self.state.read().await.explicitly_closed
    }

    pub async fn is_read_only(&self) -> bool {
        self.state.read().await.read_only
    }

    pub async fn status(&self) -> ListenerStatus {
        let blacklist = self.ctx.blacklist.snapshot().await;
        let state = self.state.read().await;
        ListenerStatus {
            topology: self.config.topology,
            current: state.current,
            master: state.master_host().map(|h| h.to_string()),
            secondary: state.secondary_host().map(|h| h.to_string()),
            master_host_fail: state.master_host_fail,
            secondary_host_fail: state.secondary_host_fail,
            read_only: state.read_only,
            explicitly_closed: state.explicitly_closed,
            failovers: self.failover_count(),
            blacklist,
        }
    }
}
